//! Factory for creating load balancing policies

use std::sync::Arc;

use super::{LeastLoadPolicy, LoadBalancingPolicy, PrefixHashPolicy, RoutingKeyPolicy};
use crate::core::model::LoadBalancing;

/// Factory for creating policy instances
pub struct PolicyFactory;

impl PolicyFactory {
    /// Create a policy from a model's load balancing settings
    pub fn create_from_config(config: &LoadBalancing) -> Arc<dyn LoadBalancingPolicy> {
        match config {
            LoadBalancing::LeastLoad => Arc::new(LeastLoadPolicy::new()),
            LoadBalancing::PrefixHash {
                mean_load_percentage,
                ..
            } => Arc::new(PrefixHashPolicy::new(*mean_load_percentage)),
            LoadBalancing::RoutingKey {
                mean_load_percentage,
                fallback_to_least_load,
                ..
            } => Arc::new(RoutingKeyPolicy::new(
                *mean_load_percentage,
                *fallback_to_least_load,
            )),
        }
    }
}
