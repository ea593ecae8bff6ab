//! Interaction channel plumbing.
//!
//! The [`EventBus`] fans server events out to two kinds of listeners: global
//! subscribers on a broadcast channel (CLI watchers, telemetry) and at most one
//! attached [`channel::InteractionChannel`] per process. Attaching a new
//! channel supersedes the previous one.

pub mod channel;
pub mod codec;
pub mod request;

use cp_protocol::Event;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub use channel::InteractionChannel;

const BROADCAST_CAPACITY: usize = 256;

struct ChannelSlot {
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<Event>,
}

/// Routes events to subscribers and attached channels.
pub struct EventBus {
    broadcast: broadcast::Sender<Event>,
    channels: Mutex<HashMap<Uuid, ChannelSlot>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            broadcast,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Uuid, ChannelSlot>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive every event of every process from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let process_id = event.process_id();
        {
            let mut slots = self.slots();
            let closed = slots
                .get(&process_id)
                .is_some_and(|slot| slot.tx.send(event.clone()).is_err());
            if closed {
                slots.remove(&process_id);
            }
        }
        // No subscribers is not an error.
        let _ = self.broadcast.send(event);
    }

    /// Attach a channel for `process_id`, replacing any previous one.
    ///
    /// # Returns
    ///
    /// The new connection id and the receiving end of its event stream.
    pub fn register(&self, process_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        self.slots()
            .insert(process_id, ChannelSlot { connection_id, tx });
        (connection_id, rx)
    }

    /// Detach `connection_id` from `process_id`.
    ///
    /// Returns false when that connection was already superseded or removed.
    pub fn unregister(&self, process_id: Uuid, connection_id: Uuid) -> bool {
        let mut slots = self.slots();
        if slots
            .get(&process_id)
            .is_some_and(|slot| slot.connection_id == connection_id)
        {
            slots.remove(&process_id);
            true
        } else {
            false
        }
    }

    /// Whether `connection_id` is the channel currently attached to the process.
    pub fn is_current(&self, process_id: Uuid, connection_id: Uuid) -> bool {
        self.slots()
            .get(&process_id)
            .is_some_and(|slot| slot.connection_id == connection_id)
    }

    #[cfg(test)]
    fn has_channel(&self, process_id: Uuid) -> bool {
        self.slots().contains_key(&process_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(process_id: Uuid) -> Event {
        Event::ProcessCompleted { process_id }
    }

    #[tokio::test]
    async fn test_events_reach_channel_and_subscribers() {
        let bus = EventBus::new();
        let process_id = Uuid::new_v4();
        let mut subscriber = bus.subscribe();
        let (_, mut rx) = bus.register(process_id);

        bus.emit(completed(process_id));
        bus.emit(completed(Uuid::new_v4()));

        assert_eq!(rx.recv().await, Some(completed(process_id)));
        assert!(rx.try_recv().is_err());
        assert_eq!(subscriber.recv().await.unwrap(), completed(process_id));
    }

    #[test]
    fn test_new_registration_supersedes_old() {
        let bus = EventBus::new();
        let process_id = Uuid::new_v4();
        let (first, _rx1) = bus.register(process_id);
        let (second, _rx2) = bus.register(process_id);

        assert!(!bus.is_current(process_id, first));
        assert!(bus.is_current(process_id, second));
        assert!(!bus.unregister(process_id, first));
        assert!(bus.has_channel(process_id));
        assert!(bus.unregister(process_id, second));
        assert!(!bus.has_channel(process_id));
    }

    #[test]
    fn test_dropped_receiver_is_pruned_on_emit() {
        let bus = EventBus::new();
        let process_id = Uuid::new_v4();
        let (_, rx) = bus.register(process_id);
        drop(rx);

        bus.emit(completed(process_id));
        assert!(!bus.has_channel(process_id));
    }
}
