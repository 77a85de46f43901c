//! Prefix-hash load balancing policy
//!
//! Requests sharing the leading characters of their prompt land on the same
//! endpoint while it stays under the load bound, which keeps the engine's
//! prefix cache warm.

use super::{chwbl_key, load_factor, EndpointView, LoadBalancingPolicy, RoutingHints};
use crate::types::DispatchError;

#[derive(Debug)]
pub struct PrefixHashPolicy {
    load_factor: f64,
}

impl PrefixHashPolicy {
    pub fn new(mean_load_percentage: u32) -> Self {
        Self {
            load_factor: load_factor(mean_load_percentage),
        }
    }

    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }
}

impl LoadBalancingPolicy for PrefixHashPolicy {
    fn select_endpoint(
        &self,
        view: &EndpointView<'_>,
        hints: &RoutingHints<'_>,
    ) -> Result<Option<String>, DispatchError> {
        let key = chwbl_key(hints.adapter, hints.prefix);
        Ok(view
            .ring
            .lookup(
                &key,
                hints.adapter,
                self.load_factor,
                view.endpoints,
                view.total_in_flight,
            )
            .map(str::to_string))
    }

    fn name(&self) -> &'static str {
        "prefix_hash"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
