use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub host: String,
    pub port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 29000,
        }
    }
}

/// Source of an inference request, used as a metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum RequestType {
    #[strum(serialize = "http")]
    Http,
    #[strum(serialize = "message")]
    Message,
}

pub fn init_metrics() {
    describe_gauge!(
        "inference_requests_active",
        "Number of inference requests currently being handled"
    );
    describe_gauge!(
        "endpoint_group_in_flight",
        "In-flight requests per model endpoint group, the autoscaling signal"
    );
    describe_counter!(
        "dispatcher_requests_total",
        "Inference requests by model, type and final status code"
    );
    describe_counter!(
        "dispatcher_retries_total",
        "Upstream attempts retried because of a retriable status or transport error"
    );
    describe_histogram!(
        "dispatcher_request_duration_seconds",
        "End to end request duration including endpoint wait"
    );
    describe_counter!(
        "hash_lookup_initial",
        "Hash ring lookups by the first endpoint reached"
    );
    describe_counter!(
        "hash_lookup_final",
        "Hash ring lookups by the endpoint finally chosen"
    );
    describe_counter!(
        "hash_lookup_default",
        "Hash ring lookups that fell back to the first adapter match"
    );
    describe_histogram!(
        "hash_lookup_iterations",
        "Ring points visited per hash lookup"
    );
    describe_counter!(
        "dispatcher_messages_total",
        "Pub/sub messages handled by stream and outcome"
    );
    describe_gauge!(
        "dispatcher_messenger_backoff_seconds",
        "Current backoff applied before receiving the next message"
    );
}

pub fn start_prometheus(config: PrometheusConfig) {
    init_metrics();

    let duration_matcher = Matcher::Suffix(String::from("duration_seconds"));
    let duration_bucket = [
        0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
    ];
    let iterations_matcher = Matcher::Full(String::from("hash_lookup_iterations"));
    let iterations_bucket = [1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0];

    let ip_addr: IpAddr = config
        .host
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
    let socket_addr = SocketAddr::new(ip_addr, config.port);

    let builder = PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .upkeep_timeout(Duration::from_secs(5 * 60))
        .set_buckets_for_metric(duration_matcher, &duration_bucket)
        .and_then(|b| b.set_buckets_for_metric(iterations_matcher, &iterations_bucket));

    match builder.and_then(|b| b.install()) {
        Ok(()) => info!("Prometheus exporter listening on {}", socket_addr),
        Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
    }
}

pub struct DispatcherMetrics;

impl DispatcherMetrics {
    pub fn record_request(model: &str, request_type: RequestType, status: u16) {
        counter!("dispatcher_requests_total",
            "model" => model.to_string(),
            "request_type" => request_type.to_string(),
            "status_code" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_request_duration(model: &str, request_type: RequestType, duration: Duration) {
        histogram!("dispatcher_request_duration_seconds",
            "model" => model.to_string(),
            "request_type" => request_type.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_retry(model: &str, status: Option<u16>) {
        let reason = status.map_or_else(|| "transport".to_string(), |s| s.to_string());
        counter!("dispatcher_retries_total",
            "model" => model.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn increment_endpoint_group_in_flight(model: &str) {
        gauge!("endpoint_group_in_flight",
            "model" => model.to_string()
        )
        .increment(1.0);
    }

    pub fn decrement_endpoint_group_in_flight(model: &str) {
        gauge!("endpoint_group_in_flight",
            "model" => model.to_string()
        )
        .decrement(1.0);
    }

    pub fn record_hash_lookup_initial(endpoint: &str) {
        counter!("hash_lookup_initial",
            "endpoint" => endpoint.to_string()
        )
        .increment(1);
    }

    pub fn record_hash_lookup_final(endpoint: &str) {
        counter!("hash_lookup_final",
            "endpoint" => endpoint.to_string()
        )
        .increment(1);
    }

    pub fn record_hash_lookup_default(endpoint: &str) {
        counter!("hash_lookup_default",
            "endpoint" => endpoint.to_string()
        )
        .increment(1);
    }

    pub fn record_hash_lookup_iterations(iterations: usize) {
        histogram!("hash_lookup_iterations").record(iterations as f64);
    }

    pub fn record_message(stream: &str, outcome: &'static str) {
        counter!("dispatcher_messages_total",
            "stream" => stream.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn set_messenger_backoff(stream: &str, backoff: Duration) {
        gauge!("dispatcher_messenger_backoff_seconds",
            "stream" => stream.to_string()
        )
        .set(backoff.as_secs_f64());
    }
}

/// Counts a request in `inference_requests_active` for as long as it lives.
pub struct ActiveRequestGuard {
    model: String,
    request_type: RequestType,
}

impl ActiveRequestGuard {
    pub fn new(model: &str, request_type: RequestType) -> Self {
        Self::gauge(model, request_type).increment(1.0);
        Self {
            model: model.to_string(),
            request_type,
        }
    }

    fn gauge(model: &str, request_type: RequestType) -> metrics::Gauge {
        gauge!("inference_requests_active",
            "request_model" => model.to_string(),
            "request_type" => request_type.to_string()
        )
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        Self::gauge(&self.model, self.request_type).decrement(1.0);
    }
}
