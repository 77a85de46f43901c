//! Inference requests consumed from a pub/sub subscription.
//!
//! Each stream receives `{"metadata", "path", "body"}` messages, routes the
//! embedded request like the HTTP proxy does and publishes
//! `{"metadata", "status_code", "body"}` to the response topic.

pub mod broker;
pub mod memory;
pub mod nats;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::broker::{open_subscription, open_topic, BrokerError, Message, OutboundMessage, Topic};
use crate::config::MessageStreamConfig;
use crate::core::{LoadBalancer, ModelClient};
use crate::metrics::{ActiveRequestGuard, DispatcherMetrics, RequestType};
use crate::protocols::request::{parse_request, Request};
use crate::protocols::spec::InferenceRequest;
use crate::types::{error_body, DispatchError};

const MAX_RESTART_ATTEMPTS: u32 = 20;
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(10);
const REQUEST_MESSAGE_ID: &str = "request_message_id";

/// Delay before the next receive after `errors` consecutive failures.
pub fn consecutive_error_backoff(errors: u32, max: Duration) -> Duration {
    Duration::from_secs(u64::from(errors)).min(max)
}

#[derive(Debug, Default, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    body: Option<Box<serde_json::value::RawValue>>,
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        InferenceRequest::COMPLETIONS_PATH.to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Embed the upstream body as JSON when it is JSON, otherwise as a string.
fn embed_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

pub struct Messenger {
    requests_url: String,
    responses: Box<dyn Topic>,
    max_handlers: usize,
    error_max_backoff: Duration,
    model_client: Arc<dyn ModelClient>,
    load_balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    consecutive_errors: AtomicU32,
}

impl Messenger {
    /// Open the response topic of `stream`. The request subscription is
    /// opened by [`Messenger::run`].
    pub async fn new(
        stream: &MessageStreamConfig,
        default_error_max_backoff: Duration,
        model_client: Arc<dyn ModelClient>,
        load_balancer: Arc<LoadBalancer>,
        client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let responses = open_topic(&stream.responses_url).await?;
        Ok(Self {
            requests_url: stream.requests_url.clone(),
            responses,
            max_handlers: stream.max_handlers.max(1),
            error_max_backoff: stream
                .error_max_backoff
                .unwrap_or(default_error_max_backoff),
            model_client,
            load_balancer,
            client,
            consecutive_errors: AtomicU32::new(0),
        })
    }

    pub fn requests_url(&self) -> &str {
        &self.requests_url
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    fn add_consecutive_error(&self) {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn reset_consecutive_errors(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Receive and handle messages until `cancel` fires, then wait for
    /// in-flight handlers to finish.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_handlers));
        let mut requests = open_subscription(&self.requests_url).await?;
        let mut restart_attempt: u32 = 0;

        info!(
            "Messenger receiving from {} with {} handlers",
            self.requests_url, self.max_handlers
        );

        let result = loop {
            let message = match requests.receive(&cancel).await {
                Ok(message) => {
                    restart_attempt = 0;
                    message
                }
                Err(BrokerError::Cancelled) => break Ok(()),
                Err(e) => {
                    if restart_attempt > MAX_RESTART_ATTEMPTS {
                        error!(
                            "Error receiving from {}: {}. Restarted subscription {} times, giving up",
                            self.requests_url, e, restart_attempt
                        );
                        break Err(anyhow::anyhow!("receiving from {}: {e}", self.requests_url));
                    }
                    warn!("Error receiving from {}: {}", self.requests_url, e);
                    if let Err(e) = requests.close().await {
                        warn!("Error closing subscription {}: {:#}", self.requests_url, e);
                    }

                    let wait = Duration::from_secs(u64::from(restart_attempt)).min(MAX_RESTART_BACKOFF);
                    info!(
                        "Waiting {:?} before reopening subscription {}",
                        wait, self.requests_url
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => break Ok(()),
                    }

                    match open_subscription(&self.requests_url).await {
                        Ok(reopened) => requests = reopened,
                        Err(e) => {
                            error!("Error reopening subscription {}: {:#}", self.requests_url, e);
                            break Err(e);
                        }
                    }
                    restart_attempt += 1;
                    continue;
                }
            };

            debug!("Received message {}", message.loggable_id());

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break Err(e.into()),
                },
                _ = cancel.cancelled() => {
                    if message.nackable() {
                        message.nack();
                    }
                    break Ok(());
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.handle_message(message).await;
            });

            let errors = self.consecutive_errors();
            if errors > 0 {
                let wait = consecutive_error_backoff(errors, self.error_max_backoff);
                DispatcherMetrics::set_messenger_backoff(&self.requests_url, wait);
                info!(
                    "After {} consecutive errors, waiting {:?} before the next message",
                    errors, wait
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => break Ok(()),
                }
            }
        };

        // Drain: every permit back means every handler has finished.
        let _ = semaphore.acquire_many(self.max_handlers as u32).await;
        if let Err(e) = requests.close().await {
            warn!("Error closing subscription {}: {:#}", self.requests_url, e);
        }
        info!("Messenger for {} stopped", self.requests_url);
        result
    }

    /// Handle one message through to publishing its response.
    pub async fn handle_message(&self, message: Message) {
        // Handlers are not cut short by shutdown; the receive loop drains them.
        let cancel = CancellationToken::new();

        let inbound: InboundMessage = match serde_json::from_slice(message.body()) {
            Ok(inbound) => inbound,
            Err(e) => {
                let err = DispatchError::BadRequest(format!("unmarshalling message as json: {e}"));
                self.send_error(message, None, err).await;
                return;
            }
        };
        let metadata = inbound.metadata;
        let path = normalize_path(&inbound.path);
        let body = inbound
            .body
            .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
            .unwrap_or_default();

        let request = match parse_request(
            self.model_client.as_ref(),
            body,
            &path,
            &HeaderMap::new(),
        )
        .await
        {
            Ok(request) => request,
            Err(e) => {
                self.send_error(message, metadata, e).await;
                return;
            }
        };

        let _active = ActiveRequestGuard::new(&request.model, RequestType::Message);

        if let Err(e) = self
            .model_client
            .scale_at_least_one_replica(&request.model)
            .await
        {
            let err = DispatchError::Internal(format!("scale model: {e:#}"));
            self.send_error(message, metadata, err).await;
            return;
        }

        debug!("Awaiting endpoint for message {}", message.loggable_id());
        let (address, guard) = match self.load_balancer.await_best_address(&cancel, &request).await {
            Ok(selected) => selected,
            Err(e) => {
                self.send_error(message, metadata, e).await;
                return;
            }
        };

        let url = format!("http://{address}{path}");
        debug!("Sending message {} to {}", message.loggable_id(), url);
        let upstream = self.send_upstream(&url, &request).await;
        guard.release();

        match upstream {
            Ok((status, body)) => self.publish(message, metadata, status, &body).await,
            Err(e) => {
                let err = DispatchError::Upstream(format!("sending request to {url}: {e}"));
                self.send_error(message, metadata, err).await;
            }
        }
    }

    async fn send_upstream(&self, url: &str, request: &Request) -> reqwest::Result<(u16, Bytes)> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(request.body.clone())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok((status, body))
    }

    async fn send_error(&self, message: Message, metadata: Option<Map<String, Value>>, err: DispatchError) {
        warn!(
            "Message {} failed: {}",
            message.loggable_id(),
            err
        );
        let status = err.status_code();
        let body = error_body(status, &err.to_string());
        self.publish(message, metadata, status.as_u16(), &body).await;
    }

    async fn publish(
        &self,
        message: Message,
        metadata: Option<Map<String, Value>>,
        status_code: u16,
        body: &[u8],
    ) {
        let id = message.loggable_id().to_string();
        let failed = status_code >= StatusCode::MULTIPLE_CHOICES.as_u16();

        let mut metadata = metadata.unwrap_or_default();
        metadata.insert(REQUEST_MESSAGE_ID.to_string(), Value::String(id.clone()));
        let response = serde_json::json!({
            "metadata": metadata,
            "status_code": status_code,
            "body": embed_body(body),
        });

        let outbound = OutboundMessage {
            body: Bytes::from(response.to_string()),
            metadata: [(REQUEST_MESSAGE_ID.to_string(), id.clone())].into(),
        };
        if let Err(e) = self.responses.send(outbound).await {
            error!("Error sending response for message {}: {:#}", id, e);
            self.add_consecutive_error();
            DispatcherMetrics::record_message(&self.requests_url, "publish_failed");
            if message.nackable() {
                message.nack();
            }
            return;
        }

        debug!("Sent response for message {} with status {}", id, status_code);
        if failed {
            self.add_consecutive_error();
            DispatcherMetrics::record_message(&self.requests_url, "error");
        } else {
            self.reset_consecutive_errors();
            DispatcherMetrics::record_message(&self.requests_url, "ok");
        }
        message.ack();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_error_backoff() {
        let max = Duration::from_secs(3);
        assert_eq!(consecutive_error_backoff(0, max), Duration::ZERO);
        assert_eq!(consecutive_error_backoff(2, max), Duration::from_secs(2));
        assert_eq!(consecutive_error_backoff(30, max), max);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/v1/completions");
        assert_eq!(normalize_path("v1/embeddings"), "/v1/embeddings");
        assert_eq!(normalize_path("/v1/chat/completions"), "/v1/chat/completions");
    }

    #[test]
    fn test_embed_body() {
        assert_eq!(embed_body(br#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(embed_body(b"not json"), Value::String("not json".into()));
    }

    struct FailingTopic;

    #[async_trait::async_trait]
    impl Topic for FailingTopic {
        async fn send(&self, _message: OutboundMessage) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("topic unavailable"))
        }
    }

    fn messenger_with_failing_responses() -> Messenger {
        Messenger {
            requests_url: "mem://unused".to_string(),
            responses: Box::new(FailingTopic),
            max_handlers: 1,
            error_max_backoff: Duration::from_millis(10),
            model_client: Arc::new(crate::core::StaticModelClient::new(Vec::new())),
            load_balancer: Arc::new(LoadBalancer::default()),
            client: reqwest::Client::new(),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn test_failed_publish_of_error_response_counts_once() {
        use super::broker::Subscription;

        let name = "messenger-test-publish-fails";
        memory::publish(name, "not json");
        let sub = memory::MemorySubscription::open(name);
        let message = sub.receive(&CancellationToken::new()).await.unwrap();

        let messenger = messenger_with_failing_responses();
        messenger.handle_message(message).await;
        assert_eq!(messenger.consecutive_errors(), 1);

        // The nacked message comes back; a second failure adds exactly one more.
        let message = sub.receive(&CancellationToken::new()).await.unwrap();
        messenger.handle_message(message).await;
        assert_eq!(messenger.consecutive_errors(), 2);
    }

    #[test]
    fn test_inbound_message_defaults() {
        let inbound: InboundMessage =
            serde_json::from_str(r#"{"body": {"model": "m"}}"#).unwrap();
        assert!(inbound.metadata.is_none());
        assert_eq!(inbound.path, "");
        assert_eq!(inbound.body.unwrap().get(), r#"{"model": "m"}"#);
    }
}
