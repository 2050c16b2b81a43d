//! In-process `EventBus` implementation: fan-out to any number of
//! subscribers via channels, best-effort (a subscriber that never drains its
//! channel eventually backs up only itself, never the publisher).

use std::convert::Infallible;
use std::sync::mpsc;
use std::sync::Mutex;

use crate::bus::{EventBus, Subscription};

pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: Clone + Send + 'static> EventBus<M> for InMemoryEventBus<M> {
    type Error = Infallible;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        // Drop subscribers whose receiver has gone away; a publish must never
        // fail because some unrelated subscriber stopped listening.
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_out_to_all_live_subscribers() {
        let bus = InMemoryEventBus::<i32>::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.recv(), Some(7));
        assert_eq!(b.recv(), Some(7));
    }

    #[test]
    fn publish_succeeds_with_no_subscribers() {
        let bus = InMemoryEventBus::<i32>::new();
        assert!(bus.publish(1).is_ok());
    }

    #[test]
    fn dropped_subscriber_does_not_break_publish() {
        let bus = InMemoryEventBus::<i32>::new();
        {
            let _dropped = bus.subscribe();
        }
        let survivor = bus.subscribe();
        bus.publish(3).unwrap();
        assert_eq!(survivor.recv(), Some(3));
    }
}
