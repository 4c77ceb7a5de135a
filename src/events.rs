//! Lifecycle events and the fan-out bus feeding observer connections.
//!
//! Publishing never blocks on a slow observer: each subscriber hangs off a
//! bounded broadcast channel, and a receiver that falls behind loses the
//! oldest events and sees exactly one warning for the gap. Per-subscriber
//! delivery is FIFO; cross-subscriber ordering is only the monotonic
//! timestamps carried on the events themselves.

use crate::models::{ApprovalOutcome, ExecutionContext};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Bound on each subscriber's outbox.
pub const SUBSCRIBER_QUEUE: usize = 1024;

/// One lifecycle event as it appears on the observer wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    CommandReceived {
        fingerprint: String,
        command: String,
        working_dir: String,
        execution_context: ExecutionContext,
    },
    EvaluationCompleted {
        fingerprint: String,
        decision: String,
        rule: Option<String>,
        message: Option<String>,
    },
    ApprovalNeeded {
        approval_id: String,
        fingerprint: String,
        command: String,
        rule: String,
        reason: String,
        timeout_secs: u64,
    },
    ApprovalResolved {
        approval_id: String,
        fingerprint: String,
        outcome: ApprovalOutcome,
        reason: Option<String>,
    },
    ExecutionCompleted {
        fingerprint: String,
        executed: bool,
        exit_code: Option<i32>,
        execution_time_ms: Option<u64>,
    },
    DaemonStatus {
        version: String,
        rules_loaded: usize,
        pending_approvals: usize,
        uptime_ms: u64,
        /// Diagnostics ride along here (e.g. fail-open evaluator errors).
        note: Option<String>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CommandReceived { .. } => "command_received",
            EventKind::EvaluationCompleted { .. } => "evaluation_completed",
            EventKind::ApprovalNeeded { .. } => "approval_needed",
            EventKind::ApprovalResolved { .. } => "approval_resolved",
            EventKind::ExecutionCompleted { .. } => "execution_completed",
            EventKind::DaemonStatus { .. } => "daemon_status",
        }
    }
}

/// Broadcast fan-out handle. Cheap to clone; the subscriber set lives in the
/// underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        Self { tx }
    }

    /// Stamp and publish. Never blocks; without subscribers this is a no-op.
    pub fn publish(&self, kind: EventKind) {
        let event = Event {
            kind,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            warned: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's receive side. Dropping it unsubscribes.
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    warned: bool,
}

impl EventSubscription {
    /// Next event in FIFO order, or `None` once the bus is gone. A lagging
    /// subscriber skips the overwritten events and keeps going.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if !self.warned {
                        self.warned = true;
                        tracing::warn!(missed, "observer outbox overflowed; oldest events dropped");
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(note: &str) -> EventKind {
        EventKind::DaemonStatus {
            version: "test".to_string(),
            rules_loaded: 0,
            pending_approvals: 0,
            uptime_ms: 0,
            note: Some(note.to_string()),
        }
    }

    fn note_of(event: &Event) -> String {
        match &event.kind {
            EventKind::DaemonStatus { note, .. } => note.clone().unwrap_or_default(),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.publish(status_event(&format!("n{i}")));
        }
        for i in 0..5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(note_of(&event), format!("n{i}"));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(status_event("nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_keeps_newest() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        // Overflow the bounded outbox without ever receiving.
        for i in 0..(SUBSCRIBER_QUEUE + 10) {
            bus.publish(status_event(&format!("n{i}")));
        }

        // The first delivered event is a later one; the tail is intact.
        let first = sub.recv().await.unwrap();
        assert_ne!(note_of(&first), "n0");

        let mut last = first;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), sub.recv()).await
        {
            last = event;
        }
        assert_eq!(note_of(&last), format!("n{}", SUBSCRIBER_QUEUE + 9));
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(status_event("shared"));
        assert_eq!(note_of(&a.recv().await.unwrap()), "shared");
        assert_eq!(note_of(&b.recv().await.unwrap()), "shared");

        // Dropping one subscriber does not disturb the other.
        drop(a);
        bus.publish(status_event("after-drop"));
        assert_eq!(note_of(&b.recv().await.unwrap()), "after-drop");
    }

    #[test]
    fn test_wire_shape() {
        let event = Event {
            kind: EventKind::ApprovalResolved {
                approval_id: "ab12".to_string(),
                fingerprint: "00ff".to_string(),
                outcome: ApprovalOutcome::Timeout,
                reason: Some("timeout".to_string()),
            },
            timestamp_ms: 1700000000000,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "approval_resolved");
        assert_eq!(json["timestamp_ms"], 1700000000000i64);
        assert_eq!(json["payload"]["approval_id"], "ab12");
        assert_eq!(json["payload"]["outcome"], "timeout");
    }

    #[test]
    fn test_timestamps_monotone_nondecreasing() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(status_event("a"));
        bus.publish(status_event("b"));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let first = sub.recv().await.unwrap();
            let second = sub.recv().await.unwrap();
            assert!(second.timestamp_ms >= first.timestamp_ms);
        });
    }
}
