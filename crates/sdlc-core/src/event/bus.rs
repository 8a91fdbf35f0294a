//! Per-workflow step event fan-out.
//!
//! Each workflow owns one bus, so a slow subscriber of one workflow never
//! costs another workflow buffer space. The channel holds the last
//! `event_buffer` transitions; a subscriber further behind than that skips
//! the oldest and sees `RecvError::Lagged(n)`. The driver loop never waits
//! on subscribers.
//!
//! The bus closes when its owning handle is dropped, which ends every
//! receiver after it drains what is still buffered.

use sdlc_types::event::StepEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StepEvent>,
    capacity: usize,
}

impl EventBus {
    /// A bus buffering at most `capacity` events (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.sender.subscribe()
    }

    /// Fan `event` out to current receivers. Dropped when nobody listens.
    pub fn publish(&self, event: StepEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("step event published with no subscribers");
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sdlc_types::event::OutcomeSummary;
    use sdlc_types::workflow::Stage;
    use uuid::Uuid;

    use super::*;

    fn transition(sequence: u64) -> StepEvent {
        StepEvent::Transition {
            workflow_id: Uuid::now_v7(),
            sequence,
            from_stage: Stage::MarketValidation,
            to_stage: Stage::SolutionArchitecture,
            outcome_summary: OutcomeSummary {
                success: true,
                decision: None,
                attempt: 1,
                error_count: 0,
                artifacts: vec![],
                requires_escalation: false,
            },
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(transition(2));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.sequence(), Some(2));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(transition(2));

        assert_eq!(rx1.recv().await.unwrap().sequence(), Some(2));
        assert_eq!(rx2.recv().await.unwrap().sequence(), Some(2));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(transition(2));
        bus.publish(transition(3));
    }

    #[tokio::test]
    async fn lagged_receiver_drops_oldest() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for seq in 1..=10 {
            bus.publish(transition(seq));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        // The newest `capacity` events are still delivered, in order.
        for seq in 7..=10 {
            assert_eq!(rx.recv().await.unwrap().sequence(), Some(seq));
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(transition(2));

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("capacity: 1"));
        assert!(debug.contains("subscribers: 1"));
    }

    #[tokio::test]
    async fn dropping_bus_ends_receivers_after_buffered_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(transition(2));
        drop(bus);

        assert_eq!(rx.recv().await.unwrap().sequence(), Some(2));
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
