//! In-process pub/sub bus
//!
//! One tokio broadcast channel per topic, created on first use. Every
//! client in the process gets its own [`LocalEndpoint`] on the same bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Channel, Subscription};
use crate::error::{SyncError, SyncResult};

/// Shared topic registry
#[derive(Clone)]
pub struct LocalBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
    published: Arc<AtomicU64>,
}

impl LocalBus {
    /// Create a bus buffering up to `capacity` messages per topic
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// New endpoint for one client
    pub fn endpoint(&self) -> LocalEndpoint {
        LocalEndpoint {
            bus: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Total messages published on any topic
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One client's view of a [`LocalBus`]
pub struct LocalEndpoint {
    bus: LocalBus,
    closed: AtomicBool,
}

impl Channel for LocalEndpoint {
    fn publish(&self, topic: &str, payload: &str) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::Channel(format!("publish on closed endpoint ({})", topic)));
        }
        self.bus.published.fetch_add(1, Ordering::SeqCst);
        // Ignore errors - just means no subscribers yet
        let _ = self.bus.sender(topic).send(payload.to_string());
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> SyncResult<Subscription> {
        if self.is_closed() {
            return Err(SyncError::Channel(format!("subscribe on closed endpoint ({})", topic)));
        }
        Ok(Subscription::new(topic, self.bus.sender(topic).subscribe()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
