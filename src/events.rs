//! Status event bus — fire-and-forget pipeline observability.
//!
//! **Why this exists**: every stage transition of every job is announced so
//! observers (log tailers, a future UI) can follow progress. Delivery is
//! best-effort by design: a slow or dead subscriber must never stall the
//! pipeline, so sends that would block are dropped and counted instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

/// Bounded depth per subscriber; beyond this, events are dropped.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// One pipeline status notification.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub job_id: Uuid,
    /// Stage the job just entered, as its snake_case name.
    pub stage: String,
    /// ISO 8601 emission time.
    pub timestamp: String,
    /// Human-readable detail (file name, error summary, decision origin).
    pub detail: String,
}

impl StatusEvent {
    pub fn now(job_id: Uuid, stage: &str, detail: impl Into<String>) -> Self {
        Self {
            job_id,
            stage: stage.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            detail: detail.into(),
        }
    }
}

/// Fan-out publisher for `StatusEvent`s.
///
/// Subscribers receive over bounded channels; `publish` never blocks.
pub struct EventBus {
    subscribers: Mutex<Vec<SyncSender<StatusEvent>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE_DEPTH);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Deliver `event` to every live subscriber. Never blocks.
    ///
    /// Full queues drop the event (counted); disconnected subscribers are
    /// pruned on the spot.
    pub fn publish(&self, event: StatusEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Events dropped because a subscriber queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(StatusEvent::now(Uuid::new_v4(), "queued", "scan.pdf"));
        assert_eq!(bus.dropped_count(), 0);
    }

    #[test]
    fn subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(StatusEvent::now(id, "queued", "a"));
        bus.publish(StatusEvent::now(id, "backing_up", "b"));

        assert_eq!(rx.recv().unwrap().stage, "queued");
        assert_eq!(rx.recv().unwrap().stage, "backing_up");
    }

    #[test]
    fn full_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();
        let id = Uuid::new_v4();

        // One more than the queue depth; the last must be dropped, not block.
        for i in 0..=SUBSCRIBER_QUEUE_DEPTH {
            bus.publish(StatusEvent::now(id, "extracting", format!("page {i}")));
        }
        assert_eq!(bus.dropped_count(), 1);
    }

    #[test]
    fn disconnected_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.publish(StatusEvent::now(Uuid::new_v4(), "done", "x"));
        // A second publish exercises the pruned list.
        bus.publish(StatusEvent::now(Uuid::new_v4(), "done", "y"));
        assert_eq!(bus.dropped_count(), 0);
    }

    #[test]
    fn multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish(StatusEvent::now(Uuid::new_v4(), "verifying", "scan.pdf"));
        assert_eq!(rx1.recv().unwrap().stage, "verifying");
        assert_eq!(rx2.recv().unwrap().stage, "verifying");
    }

    #[test]
    fn event_serializes_with_snake_case_stage() {
        let event = StatusEvent::now(Uuid::new_v4(), "backing_up", "scan.pdf");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"backing_up\""));
        assert!(json.contains("scan.pdf"));
    }
}
