//! Least-load load balancing policy

use super::{EndpointView, LoadBalancingPolicy, RoutingHints};
use crate::types::DispatchError;

/// Picks the endpoint serving the adapter with the fewest in-flight requests.
/// Ties are broken arbitrarily.
#[derive(Debug, Default)]
pub struct LeastLoadPolicy;

impl LeastLoadPolicy {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn select(view: &EndpointView<'_>, adapter: &str) -> Option<String> {
        view.endpoints
            .iter()
            .filter(|(_, ep)| ep.serves(adapter))
            .min_by_key(|(_, ep)| ep.in_flight())
            .map(|(name, _)| name.clone())
    }
}

impl LoadBalancingPolicy for LeastLoadPolicy {
    fn select_endpoint(
        &self,
        view: &EndpointView<'_>,
        hints: &RoutingHints<'_>,
    ) -> Result<Option<String>, DispatchError> {
        Ok(Self::select(view, hints.adapter))
    }

    fn name(&self) -> &'static str {
        "least_load"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
