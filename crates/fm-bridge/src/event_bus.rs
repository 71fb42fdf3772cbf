use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fm_core::types::{JobState, PipelineState, Role};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Per-subscriber buffer. Observers that fall further behind than this
/// lose messages rather than stalling the dispatch path.
const SUBSCRIBER_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// PipelineMessage
// ---------------------------------------------------------------------------

/// In-process notifications about pipeline progress, for observers (status
/// dashboards, log tails). Not the durable record; that is the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineMessage {
    JobCreated {
        job_id: Uuid,
        pipeline_id: Uuid,
        role: Role,
    },
    JobFinished {
        job_id: Uuid,
        pipeline_id: Uuid,
        state: JobState,
    },
    PipelineState {
        pipeline_id: Uuid,
        state: PipelineState,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Lossy broadcast bus for pipeline progress.
///
/// Publishing happens inside the push path, under the dispatcher's call
/// stack, so it must never block or grow without bound: each subscriber
/// gets a bounded channel, delivery is `try_send`, and a subscriber whose
/// buffer is full simply misses that message (counted in
/// [`lagged_count`](EventBus::lagged_count)). Observers that need a
/// complete record read the event log instead.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<flume::Sender<PipelineMessage>>>>,
    lagged: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Messages published from this point on are
    /// delivered until the receiver is dropped or falls
    /// [`SUBSCRIBER_BUFFER`] messages behind.
    pub fn subscribe(&self) -> flume::Receiver<PipelineMessage> {
        let (tx, rx) = flume::bounded(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber without blocking. Full buffers
    /// drop the message for that subscriber only; disconnected subscribers
    /// are removed.
    pub fn publish(&self, msg: PipelineMessage) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        let mut lagged = 0u64;
        subscribers.retain(|tx| match tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                lagged += 1;
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
        if lagged > 0 {
            self.lagged.fetch_add(lagged, Ordering::Relaxed);
            warn!(lagged, "event bus subscribers missed a message");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }

    /// Total messages dropped on full subscriber buffers since startup.
    pub fn lagged_count(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> PipelineMessage {
        PipelineMessage::PipelineState {
            pipeline_id: Uuid::new_v4(),
            state: PipelineState::Running,
        }
    }

    #[test]
    fn subscribers_receive_published_messages() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(message());

        let msg = rx.try_recv().unwrap();
        assert!(matches!(msg, PipelineMessage::PipelineState { .. }));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        bus.publish(message());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn messages_before_subscription_are_not_delivered() {
        let bus = EventBus::new();
        bus.publish(message());
        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_subscriber_loses_messages_but_stays_subscribed() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        // One more than the buffer holds, with nobody draining.
        for _ in 0..=SUBSCRIBER_BUFFER {
            bus.publish(message());
        }

        assert_eq!(bus.lagged_count(), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(rx.len(), SUBSCRIBER_BUFFER);

        // After draining, delivery resumes.
        while rx.try_recv().is_ok() {}
        bus.publish(message());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn publish_never_blocks_on_a_stalled_subscriber() {
        let bus = EventBus::new();
        let _stalled = bus.subscribe();

        // Far more than the buffer; must return promptly every time.
        for _ in 0..(SUBSCRIBER_BUFFER * 3) {
            bus.publish(message());
        }
        assert_eq!(bus.lagged_count(), (SUBSCRIBER_BUFFER * 2) as u64);
    }
}
