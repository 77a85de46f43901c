//! Routing-key load balancing policy
//!
//! CHWBL keyed on the caller supplied `Routing-Key` header. Requests without a
//! key either fall back to least-load or fail immediately; they never wait for
//! a membership change because no change can make them routable.

use super::{
    chwbl_key, load_factor, EndpointView, LeastLoadPolicy, LoadBalancingPolicy, RoutingHints,
};
use crate::types::DispatchError;

#[derive(Debug)]
pub struct RoutingKeyPolicy {
    load_factor: f64,
    fallback_to_least_load: bool,
}

impl RoutingKeyPolicy {
    pub fn new(mean_load_percentage: u32, fallback_to_least_load: bool) -> Self {
        Self {
            load_factor: load_factor(mean_load_percentage),
            fallback_to_least_load,
        }
    }
}

impl LoadBalancingPolicy for RoutingKeyPolicy {
    fn select_endpoint(
        &self,
        view: &EndpointView<'_>,
        hints: &RoutingHints<'_>,
    ) -> Result<Option<String>, DispatchError> {
        if hints.routing_key.is_empty() {
            if self.fallback_to_least_load {
                return Ok(LeastLoadPolicy::select(view, hints.adapter));
            }
            return Err(DispatchError::NoEndpoint(
                "request has no routing key and least-load fallback is disabled".to_string(),
            ));
        }

        let key = chwbl_key(hints.adapter, hints.routing_key);
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
        "routing_key"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
