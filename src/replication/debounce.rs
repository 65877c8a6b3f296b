//! Debounced broadcast queue
//!
//! Each leader write is queued with a due time one debounce window after
//! it executed locally. A single task drains the queue in order, sleeping
//! until each message is due, so broadcasts keep the local execution
//! order. Aborting the task drops everything still pending.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{SyncError, SyncResult};
use crate::types::WriteMessage;

struct Pending {
    due: Instant,
    message: WriteMessage,
}

/// Sending half of the debounce queue
pub struct DebounceQueue {
    tx: mpsc::UnboundedSender<Pending>,
    window: Duration,
}

impl DebounceQueue {
    /// Spawn the drain task publishing to `topic`
    pub fn spawn(
        channel: Arc<dyn Channel>,
        topic: String,
        window: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::run(rx, channel, topic));
        (Self { tx, window }, task)
    }

    /// Schedule `message` for broadcast after the debounce window
    pub fn schedule(&self, message: WriteMessage) -> SyncResult<()> {
        let pending = Pending {
            due: Instant::now() + self.window,
            message,
        };
        self.tx.send(pending).map_err(|_| SyncError::ShutDown)
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<Pending>,
        channel: Arc<dyn Channel>,
        topic: String,
    ) {
        while let Some(pending) = rx.recv().await {
            sleep_until(pending.due).await;

            let payload = match pending.message.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, tag = pending.message.operation_tag(), "unserializable write dropped");
                    continue;
                }
            };
            match channel.publish(&topic, &payload) {
                Ok(()) => debug!(topic = %topic, tag = pending.message.operation_tag(), "broadcast write"),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "broadcast failed, stopping queue");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalBus;

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_waits_for_window() {
        let bus = LocalBus::default();
        let listener = bus.endpoint();
        let mut sub = listener.subscribe("t").unwrap();
        let (queue, _task) = DebounceQueue::spawn(
            Arc::new(bus.endpoint()),
            "t".to_string(),
            Duration::from_millis(500),
        );

        let start = Instant::now();
        queue
            .schedule(WriteMessage::new("a", "DELETE FROM notes", vec![], "delete"))
            .unwrap();

        let raw = sub.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(WriteMessage::from_json(&raw).unwrap().sql_text(), "DELETE FROM notes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_is_preserved() {
        let bus = LocalBus::default();
        let listener = bus.endpoint();
        let mut sub = listener.subscribe("t").unwrap();
        let (queue, _task) =
            DebounceQueue::spawn(Arc::new(bus.endpoint()), "t".to_string(), Duration::from_millis(50));

        for i in 0..5 {
            let sql = format!("UPDATE notes SET title = 't{}' WHERE id = 'n1'", i);
            queue.schedule(WriteMessage::new("a", sql, vec![], "update")).unwrap();
        }

        for i in 0..5 {
            let msg = WriteMessage::from_json(&sub.recv().await.unwrap()).unwrap();
            assert!(msg.sql_text().contains(&format!("'t{}'", i)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_drops_pending() {
        let bus = LocalBus::default();
        let (queue, task) =
            DebounceQueue::spawn(Arc::new(bus.endpoint()), "t".to_string(), Duration::from_millis(500));

        queue
            .schedule(WriteMessage::new("a", "DELETE FROM notes", vec![], "delete"))
            .unwrap();
        task.abort();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(bus.published_count(), 0);
        assert!(queue.schedule(WriteMessage::new("a", "x", vec![], "x")).is_err());
    }
}
