//! `mem://` in-process broker.
//!
//! Topics are process-wide and looked up by name; all subscriptions to a name
//! compete for its messages. Nack puts the message back on the topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::broker::{AckHandle, BrokerError, Message, OutboundMessage, Subscription, Topic};

pub const SCHEME: &str = "mem";

#[derive(Debug)]
enum Delivery {
    Message(OutboundMessage),
    /// Makes the next receive fail, for exercising subscription recovery
    Fault(String),
}

struct Channel {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    next_id: AtomicU64,
}

fn channels() -> &'static Mutex<HashMap<String, Arc<Channel>>> {
    static CHANNELS: OnceLock<Mutex<HashMap<String, Arc<Channel>>>> = OnceLock::new();
    CHANNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn channel(name: &str) -> Arc<Channel> {
    channels()
        .lock()
        .entry(name.to_string())
        .or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Channel {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                next_id: AtomicU64::new(1),
            })
        })
        .clone()
}

/// Make the next receive on `name` fail with `reason`.
pub fn inject_receive_error(name: &str, reason: &str) {
    let _ = channel(name).tx.send(Delivery::Fault(reason.to_string()));
}

struct MemoryAck {
    channel: Arc<Channel>,
    message: OutboundMessage,
}

impl AckHandle for MemoryAck {
    fn ack(self: Box<Self>) {}

    fn nackable(&self) -> bool {
        true
    }

    fn nack(self: Box<Self>) {
        let _ = self.channel.tx.send(Delivery::Message(self.message));
    }
}

pub struct MemorySubscription {
    name: String,
    channel: Arc<Channel>,
    closed: AtomicBool,
}

impl MemorySubscription {
    pub fn open(name: &str) -> Self {
        Self {
            name: name.to_string(),
            channel: channel(name),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Message, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let delivery = tokio::select! {
            delivery = async { self.channel.rx.lock().await.recv().await } => delivery,
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
        };
        match delivery {
            Some(Delivery::Message(message)) => {
                let id = self.channel.next_id.fetch_add(1, Ordering::SeqCst);
                let body = message.body.clone();
                Ok(Message::new(
                    body,
                    format!("{}-{}", self.name, id),
                    Box::new(MemoryAck {
                        channel: self.channel.clone(),
                        message,
                    }),
                ))
            }
            Some(Delivery::Fault(reason)) => Err(BrokerError::Other(reason)),
            None => Err(BrokerError::Closed),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryTopic {
    channel: Arc<Channel>,
}

impl MemoryTopic {
    pub fn open(name: &str) -> Self {
        Self {
            channel: channel(name),
        }
    }
}

#[async_trait]
impl Topic for MemoryTopic {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.channel
            .tx
            .send(Delivery::Message(message))
            .map_err(|_| anyhow::anyhow!("memory topic closed"))
    }
}

/// Publish `body` on `name` without metadata.
pub fn publish(name: &str, body: impl Into<Bytes>) {
    let _ = channel(name).tx.send(Delivery::Message(OutboundMessage {
        body: body.into(),
        metadata: HashMap::new(),
    }));
}
