//! `nats://<subject>` driver over NATS core subscriptions.
//!
//! Subscriptions join a queue group named after the subject so replicas share
//! the load. Core NATS has no redelivery, so messages are not nackable.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::broker::{AckHandle, BrokerError, Message, OutboundMessage, Subscription, Topic};

pub const SCHEME: &str = "nats";

const SERVER_URL_ENV: &str = "NATS_SERVER_URL";
const DEFAULT_SERVER_URL: &str = "nats://127.0.0.1:4222";
const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

async fn connect() -> anyhow::Result<async_nats::Client> {
    let server = std::env::var(SERVER_URL_ENV).unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
    let client = async_nats::connect(&server)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to NATS at {server}: {e}"))?;
    info!("Connected to NATS at {}", server);
    Ok(client)
}

struct NoAck;

impl AckHandle for NoAck {
    fn ack(self: Box<Self>) {}

    fn nackable(&self) -> bool {
        false
    }

    fn nack(self: Box<Self>) {}
}

pub struct NatsSubscription {
    subject: String,
    subscriber: Mutex<Option<async_nats::Subscriber>>,
}

impl NatsSubscription {
    pub async fn open(subject: &str) -> anyhow::Result<Self> {
        let client = connect().await?;
        let subscriber = client
            .queue_subscribe(subject.to_string(), subject.to_string())
            .await
            .map_err(|e| anyhow::anyhow!("subscribing to {subject}: {e}"))?;
        Ok(Self {
            subject: subject.to_string(),
            subscriber: Mutex::new(Some(subscriber)),
        })
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Message, BrokerError> {
        let mut guard = self.subscriber.lock().await;
        let subscriber = guard.as_mut().ok_or(BrokerError::Closed)?;
        let next = tokio::select! {
            next = subscriber.next() => next,
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
        };
        let message = next.ok_or(BrokerError::Closed)?;
        let id = message
            .headers
            .as_ref()
            .and_then(|h| h.get(MESSAGE_ID_HEADER))
            .map(|v| v.as_str().to_string())
            .unwrap_or_else(|| format!("{}-{}", self.subject, uuid::Uuid::new_v4()));
        Ok(Message::new(message.payload, id, Box::new(NoAck)))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(mut subscriber) = self.subscriber.lock().await.take() {
            subscriber
                .unsubscribe()
                .await
                .map_err(|e| anyhow::anyhow!("unsubscribing from {}: {e}", self.subject))?;
        }
        Ok(())
    }
}

pub struct NatsTopic {
    subject: String,
    client: async_nats::Client,
}

impl NatsTopic {
    pub async fn open(subject: &str) -> anyhow::Result<Self> {
        Ok(Self {
            subject: subject.to_string(),
            client: connect().await?,
        })
    }
}

#[async_trait]
impl Topic for NatsTopic {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        for (key, value) in &message.metadata {
            headers.insert(key.as_str(), value.as_str());
        }
        self.client
            .publish_with_headers(self.subject.clone(), headers, message.body)
            .await
            .map_err(|e| anyhow::anyhow!("publishing to {}: {e}", self.subject))?;
        self.client
            .flush()
            .await
            .map_err(|e| anyhow::anyhow!("flushing {}: {e}", self.subject))
    }
}
