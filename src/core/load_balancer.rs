use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::endpoint_group::{EndpointGroup, EndpointSpec, InFlightGuard};
use crate::policies::DEFAULT_REPLICATION;
use crate::protocols::request::Request;
use crate::types::DispatchError;

/// One [`EndpointGroup`] per model, created on first use.
#[derive(Debug)]
pub struct LoadBalancer {
    groups: DashMap<String, Arc<EndpointGroup>>,
    default_replication: u32,
    await_endpoint_timeout: Option<Duration>,
}

impl LoadBalancer {
    pub fn new(default_replication: u32, await_endpoint_timeout: Option<Duration>) -> Self {
        Self {
            groups: DashMap::new(),
            default_replication,
            await_endpoint_timeout,
        }
    }

    pub fn group(&self, model: &str) -> Arc<EndpointGroup> {
        if let Some(group) = self.groups.get(model) {
            return group.clone();
        }
        self.groups
            .entry(model.to_string())
            .or_insert_with(|| {
                debug!("Creating endpoint group for model {}", model);
                Arc::new(EndpointGroup::new(model, self.default_replication))
            })
            .clone()
    }

    /// Wait for an endpoint of `request.model`. Bounded by the configured
    /// await timeout, if any.
    pub async fn await_best_address(
        &self,
        cancel: &CancellationToken,
        request: &Request,
    ) -> Result<(String, InFlightGuard), DispatchError> {
        let group = self.group(&request.model);
        match self.await_endpoint_timeout {
            Some(limit) => tokio::time::timeout(limit, group.get_best_address(cancel, request, false))
                .await
                .map_err(|_| DispatchError::Timeout)?,
            None => group.get_best_address(cancel, request, false).await,
        }
    }

    pub fn get_all_addresses(&self, model: &str) -> Vec<String> {
        self.groups
            .get(model)
            .map(|g| g.get_all_addresses())
            .unwrap_or_default()
    }

    pub fn reconcile(&self, model: &str, observed: HashMap<String, EndpointSpec>) {
        self.group(model).reconcile(observed);
    }

    pub fn model_in_flight(&self, model: &str) -> i64 {
        self.groups
            .get(model)
            .map(|g| g.total_in_flight())
            .unwrap_or(0)
    }

    /// Models that currently have a group, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        models.sort();
        models
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICATION, None)
    }
}
