//! Pipeline event bus
//!
//! An in-process broadcast bus for observability collaborators. Emitting
//! never blocks: with no subscribers the event is dropped, and a lagging
//! subscriber loses its oldest buffered events rather than stalling the
//! pipeline.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::PostStatus;

pub type EventReceiver = broadcast::Receiver<Event>;

/// Broadcast bus distributing [`Event`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity
    /// (recommended: 100).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers. Non-blocking; an error from the
    /// channel just means nobody is listening.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Events emitted by the pipeline components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job entered the ready queue
    JobEnqueued { job_type: String, job_id: String },

    /// A job finished and was removed
    JobCompleted { job_type: String, job_id: String },

    /// A job failed and was re-queued with backoff
    JobFailed {
        job_type: String,
        job_id: String,
        retry_count: u32,
        error: String,
    },

    /// A job exhausted its retries and moved to the dead-letter queue
    JobDeadLettered {
        job_type: String,
        job_id: String,
        error: String,
    },

    /// A job record expired while its identifier was still in flight
    JobRecordLost { job_type: String, job_id: String },

    /// A stale in-flight marker was returned to the ready queue
    JobReclaimed { job_type: String, job_id: String },

    /// A post moved between lifecycle states
    PostTransitioned {
        post_id: String,
        from: PostStatus,
        to: PostStatus,
    },

    /// The rate limiter refused a publish attempt
    RateLimitRefused {
        platform: String,
        account_id: String,
    },

    /// A credential refresh failed; the account needs a reconnect
    CredentialRefreshFailed {
        platform: String,
        account_id: String,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.emit(Event::JobEnqueued {
            job_type: "publish_post".to_string(),
            job_id: "job-1".to_string(),
        });

        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, Event::JobEnqueued { job_id, .. } if job_id == "job-1"));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_block() {
        let bus = EventBus::new(10);
        bus.emit(Event::JobCompleted {
            job_type: "publish_post".to_string(),
            job_id: "job-1".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut r1 = bus.subscribe();
        let mut r2 = bus.subscribe();

        bus.emit(Event::RateLimitRefused {
            platform: "mastodon".to_string(),
            account_id: "acct-1".to_string(),
        });

        assert!(matches!(
            r1.recv().await.unwrap(),
            Event::RateLimitRefused { .. }
        ));
        assert!(matches!(
            r2.recv().await.unwrap(),
            Event::RateLimitRefused { .. }
        ));
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::PostTransitioned {
            post_id: "post-1".to_string(),
            from: PostStatus::Scheduled,
            to: PostStatus::Queued,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("post_transitioned"));
        assert!(json.contains("scheduled"));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Event::PostTransitioned { .. }));
    }
}
