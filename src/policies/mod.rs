//! Load balancing policies for the dispatcher
//!
//! A policy picks one endpoint of a model's endpoint group. It runs while the
//! group's membership read lock is held, so it sees a consistent set of
//! endpoints, their in-flight counts and the hash ring.

use std::collections::HashMap;
use std::fmt::Debug;

use crate::core::endpoint_group::Endpoint;
use crate::types::DispatchError;

mod consistent_hash;
mod factory;
mod least_load;
mod prefix_hash;
mod routing_key;

pub use consistent_hash::{hash_key, load_ok, HashRing, DEFAULT_REPLICATION};
pub use factory::PolicyFactory;
pub use least_load::LeastLoadPolicy;
pub use prefix_hash::PrefixHashPolicy;
pub use routing_key::RoutingKeyPolicy;

/// Per-request inputs a policy may route on
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingHints<'a> {
    pub adapter: &'a str,
    pub prefix: &'a str,
    pub routing_key: &'a str,
}

/// Snapshot of an endpoint group handed to a policy
#[derive(Debug, Clone, Copy)]
pub struct EndpointView<'a> {
    pub endpoints: &'a HashMap<String, Endpoint>,
    pub ring: &'a HashRing,
    pub total_in_flight: i64,
}

/// Core trait for load balancing policies
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    /// Select an endpoint name from the view.
    ///
    /// `Ok(None)` means nothing can serve the request with the current
    /// membership and the caller should wait for the next change. An error
    /// means the request can never be routed by this policy.
    fn select_endpoint(
        &self,
        view: &EndpointView<'_>,
        hints: &RoutingHints<'_>,
    ) -> Result<Option<String>, DispatchError>;

    /// Get policy name for metrics and debugging
    fn name(&self) -> &'static str;

    /// Get as Any for downcasting
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Key used on the hash ring: adapter followed by the request's routing text.
pub(crate) fn chwbl_key(adapter: &str, suffix: &str) -> String {
    let mut key = String::with_capacity(adapter.len() + suffix.len());
    key.push_str(adapter);
    key.push_str(suffix);
    key
}

/// Convert a mean load percentage (125) into a multiplier (1.25).
pub(crate) fn load_factor(mean_load_percentage: u32) -> f64 {
    f64::from(mean_load_percentage) / 100.0
}
