//! Per-model set of live endpoints.
//!
//! Membership and the hash ring sit behind one `RwLock`. Selection holds the
//! read lock for the policy call and the in-flight increment, so a selected
//! endpoint cannot be removed in between. Requests that find nothing to route
//! to subscribe to the current broadcast token while still holding the read
//! lock, then wait; `reconcile` swaps in a fresh token and cancels the old one,
//! waking every waiter exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::DispatcherMetrics;
use crate::policies::{EndpointView, HashRing, PolicyFactory, DEFAULT_REPLICATION};
use crate::protocols::request::Request;
use crate::types::DispatchError;

/// Desired state of one endpoint as observed by the reconciler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSpec {
    pub address: String,
    pub adapters: HashSet<String>,
}

impl EndpointSpec {
    pub fn new<I, S>(address: impl Into<String>, adapters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            address: address.into(),
            adapters: adapters.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug)]
pub struct Endpoint {
    pub address: String,
    pub adapters: HashSet<String>,
    in_flight: Arc<AtomicI64>,
}

impl Endpoint {
    pub fn new(address: String, adapters: HashSet<String>) -> Self {
        Self {
            address,
            adapters,
            in_flight: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// An empty adapter matches every endpoint.
    pub fn serves(&self, adapter: &str) -> bool {
        adapter.is_empty() || self.adapters.contains(adapter)
    }

    #[cfg(test)]
    pub(crate) fn add_in_flight(&self, n: i64) {
        self.in_flight.fetch_add(n, Ordering::SeqCst);
    }
}

/// Releases one in-flight slot on drop or on [`InFlightGuard::release`],
/// whichever comes first.
///
/// The guard owns the endpoint's counter, so release stays correct after the
/// endpoint has been removed from its group.
#[derive(Debug)]
pub struct InFlightGuard {
    model: Arc<str>,
    address: String,
    endpoint: Arc<AtomicI64>,
    total: Arc<AtomicI64>,
    released: bool,
}

impl InFlightGuard {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.endpoint.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_sub(1, Ordering::SeqCst);
        DispatcherMetrics::decrement_endpoint_group_in_flight(&self.model);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[derive(Debug)]
struct GroupState {
    endpoints: HashMap<String, Endpoint>,
    ring: HashRing,
}

#[derive(Debug)]
pub struct EndpointGroup {
    model: Arc<str>,
    state: RwLock<GroupState>,
    total_in_flight: Arc<AtomicI64>,
    broadcast: Mutex<CancellationToken>,
}

impl EndpointGroup {
    pub fn new(model: &str, replication: u32) -> Self {
        Self {
            model: Arc::from(model),
            state: RwLock::new(GroupState {
                endpoints: HashMap::new(),
                ring: HashRing::new(replication),
            }),
            total_in_flight: Arc::new(AtomicI64::new(0)),
            broadcast: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Select an endpoint for `request` and take an in-flight slot on it.
    ///
    /// Waits for a membership change when the group is empty, when the policy
    /// finds no suitable endpoint, or when `await_change` is set. Returns
    /// [`DispatchError::Cancelled`] without touching any counter if `cancel`
    /// fires first.
    pub async fn get_best_address(
        &self,
        cancel: &CancellationToken,
        request: &Request,
        mut await_change: bool,
    ) -> Result<(String, InFlightGuard), DispatchError> {
        let policy = PolicyFactory::create_from_config(&request.load_balancing);
        let hints = request.routing_hints();
        if let Some(replication) = request.load_balancing.replication() {
            self.ensure_replication(replication);
        }

        loop {
            let changed = {
                let state = self.state.read();
                if !await_change && !state.endpoints.is_empty() {
                    let view = EndpointView {
                        endpoints: &state.endpoints,
                        ring: &state.ring,
                        total_in_flight: self.total_in_flight.load(Ordering::SeqCst),
                    };
                    let selected = policy.select_endpoint(&view, &hints)?;
                    if let Some(endpoint) = selected.and_then(|name| state.endpoints.get(&name))
                    {
                        return Ok((endpoint.address.clone(), self.acquire(endpoint)));
                    }
                    debug!(
                        request_id = %request.id,
                        model = %self.model,
                        adapter = %request.adapter,
                        policy = policy.name(),
                        "No endpoint selected, waiting for membership change"
                    );
                }
                // Subscribe before the read lock is released so a concurrent
                // reconcile cannot slip in unnoticed.
                self.broadcast.lock().clone()
            };

            tokio::select! {
                _ = changed.cancelled() => await_change = false,
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            }
        }
    }

    fn acquire(&self, endpoint: &Endpoint) -> InFlightGuard {
        endpoint.in_flight.fetch_add(1, Ordering::SeqCst);
        self.total_in_flight.fetch_add(1, Ordering::SeqCst);
        DispatcherMetrics::increment_endpoint_group_in_flight(&self.model);
        InFlightGuard {
            model: self.model.clone(),
            address: endpoint.address.clone(),
            endpoint: endpoint.in_flight.clone(),
            total: self.total_in_flight.clone(),
            released: false,
        }
    }

    fn ensure_replication(&self, replication: u32) {
        if self.state.read().ring.replication() == replication.max(1) {
            return;
        }
        let mut state = self.state.write();
        let GroupState { endpoints, ring } = &mut *state;
        if ring.replication() != replication.max(1) {
            info!(
                "Model {} hash ring replication changed {} -> {}",
                self.model,
                ring.replication(),
                replication
            );
            ring.rebuild(replication, endpoints.keys());
        }
    }

    /// Snapshot of all endpoint addresses, sorted.
    pub fn get_all_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .state
            .read()
            .endpoints
            .values()
            .map(|e| e.address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Replace membership with `observed` (endpoint name -> spec).
    ///
    /// New endpoints start at zero in-flight. Removed endpoints leave the ring
    /// but their outstanding requests keep counting until released. Endpoints
    /// present on both sides keep their counters and get the new adapter set.
    pub fn reconcile(&self, observed: HashMap<String, EndpointSpec>) {
        let notify = !observed.is_empty();
        {
            let mut state = self.state.write();
            let GroupState { endpoints, ring } = &mut *state;

            let removed: Vec<String> = endpoints
                .keys()
                .filter(|name| !observed.contains_key(*name))
                .cloned()
                .collect();
            for name in removed {
                ring.remove(&name);
                if let Some(endpoint) = endpoints.remove(&name) {
                    info!(
                        "Model {} removed endpoint {} ({}) with {} in flight",
                        self.model,
                        name,
                        endpoint.address,
                        endpoint.in_flight()
                    );
                }
            }

            for (name, spec) in observed {
                match endpoints.get_mut(&name) {
                    Some(endpoint) => {
                        endpoint.address = spec.address;
                        endpoint.adapters = spec.adapters;
                    }
                    None => {
                        info!(
                            "Model {} added endpoint {} ({})",
                            self.model, name, spec.address
                        );
                        ring.add(&name);
                        endpoints.insert(name, Endpoint::new(spec.address, spec.adapters));
                    }
                }
            }
        }

        if notify {
            let previous = std::mem::replace(&mut *self.broadcast.lock(), CancellationToken::new());
            previous.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().endpoints.is_empty()
    }

    pub fn total_in_flight(&self) -> i64 {
        self.total_in_flight.load(Ordering::SeqCst)
    }

    /// Sum of per-endpoint counters of the current members.
    pub fn member_in_flight(&self) -> i64 {
        self.state
            .read()
            .endpoints
            .values()
            .map(Endpoint::in_flight)
            .sum()
    }

    pub fn endpoint_in_flight(&self, name: &str) -> Option<i64> {
        self.state.read().endpoints.get(name).map(Endpoint::in_flight)
    }

    pub fn ring_hashes(&self) -> Vec<u64> {
        self.state.read().ring.hashes()
    }
}

impl Default for EndpointGroup {
    fn default() -> Self {
        Self::new("", DEFAULT_REPLICATION)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::model::LoadBalancing;

    fn observed(entries: &[(&str, &str)]) -> HashMap<String, EndpointSpec> {
        entries
            .iter()
            .map(|(name, addr)| (name.to_string(), EndpointSpec::new(*addr, Vec::<String>::new())))
            .collect()
    }

    #[tokio::test]
    async fn test_guard_releases_both_counters_once() {
        let group = EndpointGroup::new("m", 8);
        group.reconcile(observed(&[("p1", "10.0.0.1:8000")]));
        let request = Request::new("m", LoadBalancing::LeastLoad);
        let cancel = CancellationToken::new();

        let (addr, guard) = group.get_best_address(&cancel, &request, false).await.unwrap();
        assert_eq!(addr, "10.0.0.1:8000");
        assert_eq!(guard.address(), "10.0.0.1:8000");
        assert_eq!(group.total_in_flight(), 1);
        assert_eq!(group.endpoint_in_flight("p1"), Some(1));

        guard.release();
        assert_eq!(group.total_in_flight(), 0);
        assert_eq!(group.endpoint_in_flight("p1"), Some(0));
    }

    #[tokio::test]
    async fn test_removed_endpoint_still_releases() {
        let group = EndpointGroup::new("m", 8);
        group.reconcile(observed(&[("p1", "10.0.0.1:8000")]));
        let request = Request::new("m", LoadBalancing::LeastLoad);
        let cancel = CancellationToken::new();

        let (_, guard) = group.get_best_address(&cancel, &request, false).await.unwrap();
        group.reconcile(HashMap::new());
        assert!(group.is_empty());
        assert_eq!(group.total_in_flight(), 1);

        drop(guard);
        assert_eq!(group.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let group = EndpointGroup::new("m", 8);
        let request = Request::new("m", LoadBalancing::LeastLoad);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = group
            .get_best_address(&cancel, &request, false)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Cancelled);
        assert_eq!(group.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_adapter_refresh_keeps_counters() {
        let group = EndpointGroup::new("m", 8);
        group.reconcile(observed(&[("p1", "10.0.0.1:8000")]));
        let cancel = CancellationToken::new();
        let (_, guard) = group
            .get_best_address(&cancel, &Request::new("m", LoadBalancing::LeastLoad), false)
            .await
            .unwrap();

        let mut with_adapter = HashMap::new();
        with_adapter.insert(
            "p1".to_string(),
            EndpointSpec::new("10.0.0.1:8000", ["lora"]),
        );
        group.reconcile(with_adapter);
        assert_eq!(group.endpoint_in_flight("p1"), Some(1));

        let request = Request::new("m", LoadBalancing::LeastLoad).with_adapter("lora");
        let (addr, second) = group.get_best_address(&cancel, &request, false).await.unwrap();
        assert_eq!(addr, "10.0.0.1:8000");
        assert_eq!(group.total_in_flight(), 2);
        drop(second);
        drop(guard);
        assert_eq!(group.total_in_flight(), 0);
    }

    fn exported_in_flight(rendered: &str, model: &str) -> f64 {
        let series = format!("endpoint_group_in_flight{{model=\"{model}\"}}");
        rendered
            .lines()
            .find(|line| line.starts_with(&series))
            .and_then(|line| line.split_whitespace().last())
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| panic!("{series} missing from:\n{rendered}"))
    }

    #[test]
    fn test_in_flight_gauge_follows_interleaved_acquire_and_release() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let group = EndpointGroup::new("gauge-model", 8);
            group.reconcile(observed(&[("p1", "10.0.0.1:8000"), ("p2", "10.0.0.2:8000")]));
            let state = group.state.read();

            let first = group.acquire(&state.endpoints["p1"]);
            let second = group.acquire(&state.endpoints["p2"]);
            let third = group.acquire(&state.endpoints["p1"]);
            drop(second);
            assert_eq!(exported_in_flight(&handle.render(), "gauge-model"), 2.0);

            drop(first);
            let fourth = group.acquire(&state.endpoints["p2"]);
            drop(third);
            assert_eq!(exported_in_flight(&handle.render(), "gauge-model"), 1.0);

            fourth.release();
            assert_eq!(exported_in_flight(&handle.render(), "gauge-model"), 0.0);
            assert_eq!(group.total_in_flight(), 0);
        });
    }

    #[tokio::test]
    async fn test_ring_follows_replication_of_request() {
        let group = EndpointGroup::new("m", 8);
        group.reconcile(observed(&[("p1", "a:1"), ("p2", "b:1")]));
        assert_eq!(group.ring_hashes().len(), 16);

        let request = Request::new(
            "m",
            LoadBalancing::PrefixHash {
                mean_load_percentage: 125,
                replication: 32,
                prefix_char_length: 10,
            },
        );
        let cancel = CancellationToken::new();
        let (_, guard) = group.get_best_address(&cancel, &request, false).await.unwrap();
        drop(guard);
        assert_eq!(group.ring_hashes().len(), 64);
    }
}
