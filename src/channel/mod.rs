//! Pub/sub channels between clients
//!
//! Clients never share memory; they only exchange serialized messages
//! over named topics. A [`Channel`] is one client's endpoint: closing it
//! stops that client from publishing or subscribing without affecting
//! anyone else.

mod local;

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::SyncResult;

pub use local::{LocalBus, LocalEndpoint};

/// One client's endpoint on the shared pub/sub medium
pub trait Channel: Send + Sync {
    /// Publish a serialized message to every subscriber of `topic`
    ///
    /// Subscribers on the same endpoint receive it too; receivers filter
    /// their own messages by origin.
    fn publish(&self, topic: &str, payload: &str) -> SyncResult<()>;

    /// Start receiving messages published on `topic` from now on
    fn subscribe(&self, topic: &str) -> SyncResult<Subscription>;

    /// Close the endpoint; later publish/subscribe calls fail
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Receiving half of a topic subscription, FIFO per topic
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(topic: &str, rx: broadcast::Receiver<String>) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the topic is gone
    ///
    /// A slow receiver that falls behind skips the overwritten messages
    /// and logs how many were lost.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
