//! Pod reconciler: keeps every model's endpoint group in sync with the ready
//! worker pods that carry the model label.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client as KubeClient, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModelServersConfig;
use crate::core::{EndpointSpec, LoadBalancer};

pub const MODEL_LABEL: &str = "model";
pub const ADAPTER_LABEL_PREFIX: &str = "adapter.kubeai.org/";
pub const POD_IP_ANNOTATION: &str = "model-pod-ip";
pub const POD_PORT_ANNOTATION: &str = "model-pod-port";

/// Ready condition true and not being deleted.
pub fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn pod_address(pod: &Pod, allow_address_override: bool) -> Option<String> {
    let annotations = pod.annotations();
    let ip = allow_address_override
        .then(|| annotations.get(POD_IP_ANNOTATION).cloned())
        .flatten()
        .filter(|ip| !ip.is_empty())
        .or_else(|| pod.status.as_ref().and_then(|s| s.pod_ip.clone()))
        .filter(|ip| !ip.is_empty())?;

    let port = annotations
        .get(POD_PORT_ANNOTATION)
        .filter(|p| !p.is_empty())
        .cloned()
        .or_else(|| {
            pod.spec
                .as_ref()?
                .containers
                .iter()
                .flat_map(|c| c.ports.iter().flatten())
                .map(|p| p.container_port.to_string())
                .next()
        })?;

    Some(format!("{ip}:{port}"))
}

fn pod_adapters(pod: &Pod) -> HashSet<String> {
    pod.labels()
        .keys()
        .filter_map(|k| k.strip_prefix(ADAPTER_LABEL_PREFIX))
        .map(str::to_string)
        .collect()
}

/// Desired endpoints per model, keyed by `namespace/pod name`.
pub fn observed_endpoints<'a>(
    pods: impl IntoIterator<Item = &'a Pod>,
    allow_address_override: bool,
) -> HashMap<String, HashMap<String, EndpointSpec>> {
    let mut models: HashMap<String, HashMap<String, EndpointSpec>> = HashMap::new();
    for pod in pods {
        let Some(model) = pod.labels().get(MODEL_LABEL).cloned() else {
            continue;
        };
        let endpoints = models.entry(model).or_default();
        if !is_pod_ready(pod) {
            continue;
        }
        let Some(address) = pod_address(pod, allow_address_override) else {
            warn!("Ready pod {} has no usable address, skipping", pod.name_any());
            continue;
        };
        let name = format!(
            "{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        );
        endpoints.insert(
            name,
            EndpointSpec {
                address,
                adapters: pod_adapters(pod),
            },
        );
    }
    models
}

/// Push `observed` into the load balancer. Models seen before but absent now
/// are reconciled with an empty set.
fn apply(
    load_balancer: &LoadBalancer,
    observed: HashMap<String, HashMap<String, EndpointSpec>>,
    known: &mut HashSet<String>,
) {
    let current: HashSet<String> = observed.keys().cloned().collect();
    for gone in known.difference(&current) {
        info!("Model {} has no pods left", gone);
        load_balancer.reconcile(gone, HashMap::new());
    }
    for (model, endpoints) in observed {
        debug!("Model {} has {} ready endpoints", model, endpoints.len());
        load_balancer.reconcile(&model, endpoints);
    }
    *known = current;
}

/// Feed pod watch events into the load balancer until the stream ends or
/// `cancel` fires.
///
/// `events` must already pass through the reflector writing `reader`. The
/// desired state is read back from the store after every `Apply` and `Delete`
/// and once a re-list completes at `InitDone`, when the store swaps in the
/// fresh list. `InitApply` only buffers and is skipped.
pub async fn reconcile_pod_events<S, E>(
    events: S,
    reader: Store<Pod>,
    load_balancer: &LoadBalancer,
    allow_address_override: bool,
    cancel: &CancellationToken,
) where
    S: Stream<Item = Result<watcher::Event<Pod>, E>>,
    E: std::fmt::Display,
{
    futures::pin_mut!(events);
    let mut known = HashSet::new();
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = cancel.cancelled() => break,
        };
        match event {
            Some(Ok(watcher::Event::Apply(pod) | watcher::Event::Delete(pod))) => {
                debug!("Pod {} changed", pod.name_any());
            }
            Some(Ok(watcher::Event::InitDone)) => {
                info!("Pod list synced");
            }
            Some(Ok(watcher::Event::Init | watcher::Event::InitApply(_))) => continue,
            Some(Err(e)) => {
                warn!("Pod watch error: {}", e);
                continue;
            }
            None => {
                warn!("Pod watch stream ended");
                break;
            }
        }

        let state = reader.state();
        let observed = observed_endpoints(state.iter().map(|p| p.as_ref()), allow_address_override);
        apply(load_balancer, observed, &mut known);
    }
}

/// Watch model pods in `config.namespace` until `cancel` fires.
pub fn start_pod_reconciler(
    client: KubeClient,
    config: ModelServersConfig,
    load_balancer: Arc<LoadBalancer>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pods: Api<Pod> = Api::namespaced(client, &config.namespace);
        let (reader, writer) = reflector::store();
        let watch_config = watcher::Config::default().labels(MODEL_LABEL);

        info!(
            "Watching pods with label {:?} in namespace {}",
            MODEL_LABEL, config.namespace
        );

        let events = reflector(writer, watcher(pods, watch_config)).default_backoff();
        reconcile_pod_events(
            events,
            reader,
            &load_balancer,
            config.allow_address_override,
            &cancel,
        )
        .await;
        info!("Pod reconciler stopped");
    })
}
