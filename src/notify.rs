use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per engineer or company id.
/// Slow subscribers lag and lose events; the engine never waits on them.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to everything that happens to visits of `party_id`.
    pub fn subscribe(&self, party_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(party_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver to the engineer and the company of the affected visit.
    /// No-op for parties nobody listens to.
    pub fn publish(&self, engineer_id: Ulid, company_id: Ulid, event: &Event) {
        for party in [engineer_id, company_id] {
            if let Some(sender) = self.channels.get(&party) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppointmentStatus;

    #[tokio::test]
    async fn engineer_and_company_both_receive() {
        let hub = NotifyHub::new();
        let (engineer, company) = (Ulid::new(), Ulid::new());
        let mut eng_rx = hub.subscribe(engineer);
        let mut company_rx = hub.subscribe(company);

        let event = Event::AppointmentStatusChanged {
            id: Ulid::new(),
            status: AppointmentStatus::Confirmada,
        };
        hub.publish(engineer, company, &event);

        assert_eq!(eng_rx.recv().await.unwrap(), event);
        assert_eq!(company_rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(
            Ulid::new(),
            Ulid::new(),
            &Event::ValidationCompleted {
                validation_id: Ulid::new(),
            },
        );
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let kept = hub.subscribe(Ulid::new());
        drop(hub.subscribe(Ulid::new()));
        assert_eq!(hub.channel_count(), 2);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
        drop(kept);
    }
}
