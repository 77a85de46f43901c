//! Minimal pub/sub abstraction used by the message dispatcher.
//!
//! A driver is selected by the URL scheme: `mem://<name>` for the in-process
//! broker and `nats://<subject>` for NATS core subjects.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{memory, nats};
use crate::types::ConfigurationError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("receive cancelled")]
    Cancelled,
    #[error("subscription closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Driver side of a received message
pub trait AckHandle: Send {
    fn ack(self: Box<Self>);
    fn nackable(&self) -> bool;
    fn nack(self: Box<Self>);
}

/// A message received from a subscription. Acked or nacked at most once.
pub struct Message {
    body: Bytes,
    loggable_id: String,
    handle: Option<Box<dyn AckHandle>>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("loggable_id", &self.loggable_id)
            .field("len", &self.body.len())
            .finish()
    }
}

impl Message {
    pub fn new(body: Bytes, loggable_id: impl Into<String>, handle: Box<dyn AckHandle>) -> Self {
        Self {
            body,
            loggable_id: loggable_id.into(),
            handle: Some(handle),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn loggable_id(&self) -> &str {
        &self.loggable_id
    }

    pub fn ack(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.ack();
        }
    }

    pub fn nackable(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.nackable())
    }

    pub fn nack(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.nack();
        }
    }
}

/// Message to publish, with transport-level metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait for the next message. Returns [`BrokerError::Cancelled`] as soon
    /// as `cancel` fires.
    async fn receive(&self, cancel: &CancellationToken) -> Result<Message, BrokerError>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Topic: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()>;
}

fn parse_url(raw: &str) -> Result<(String, String), ConfigurationError> {
    let url =
        Url::parse(raw).map_err(|e| ConfigurationError(format!("invalid pub/sub url {raw:?}: {e}")))?;
    let name = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
    if name.is_empty() {
        return Err(ConfigurationError(format!(
            "pub/sub url {raw:?} does not name a topic"
        )));
    }
    Ok((url.scheme().to_string(), name))
}

pub async fn open_subscription(raw: &str) -> anyhow::Result<Box<dyn Subscription>> {
    let (scheme, name) = parse_url(raw)?;
    match scheme.as_str() {
        memory::SCHEME => Ok(Box::new(memory::MemorySubscription::open(&name))),
        nats::SCHEME => Ok(Box::new(nats::NatsSubscription::open(&name).await?)),
        other => Err(ConfigurationError(format!("unsupported pub/sub scheme {other:?} in {raw:?}")).into()),
    }
}

pub async fn open_topic(raw: &str) -> anyhow::Result<Box<dyn Topic>> {
    let (scheme, name) = parse_url(raw)?;
    match scheme.as_str() {
        memory::SCHEME => Ok(Box::new(memory::MemoryTopic::open(&name))),
        nats::SCHEME => Ok(Box::new(nats::NatsTopic::open(&name).await?)),
        other => Err(ConfigurationError(format!("unsupported pub/sub scheme {other:?} in {raw:?}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        assert_eq!(
            parse_url("mem://requests").unwrap(),
            ("mem".to_string(), "requests".to_string())
        );
        assert_eq!(
            parse_url("nats://inference.requests").unwrap(),
            ("nats".to_string(), "inference.requests".to_string())
        );
        assert_eq!(parse_url("mem://team/requests").unwrap().1, "team/requests");
        assert!(parse_url("requests").is_err());
        assert!(parse_url("mem://").is_err());
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_configuration_error() {
        let err = open_topic("kafka://requests").await.err().unwrap();
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }
}
