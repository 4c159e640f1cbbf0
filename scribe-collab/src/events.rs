//! Ordered fan-out of events to explicit subscribers.
//!
//! Each subscriber owns an unbounded queue. Events are delivered to every
//! live subscriber in emission order. A [`Subscription`] detaches exactly
//! once, either through [`Subscription::unsubscribe`] or on drop, and
//! subscribers whose receiving end is gone are pruned on the next emit.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct Registry<E> {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<E>)>,
}

/// Multi-subscriber event queue.
pub struct EventBus<E> {
    inner: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reg = self.inner.lock();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.subscribers.push((id, tx));

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
            detached: false,
        }
    }

    /// Deliver `event` to every live subscriber. Returns the delivery count.
    pub fn emit(&self, event: E) -> usize {
        let mut reg = self.inner.lock();
        reg.subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        reg.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Detach every subscriber. Their queues end after draining.
    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`EventBus`].
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    bus: std::sync::Weak<Mutex<Registry<E>>>,
    detached: bool,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Detach from the bus. Returns false if the bus had already dropped
    /// this subscriber.
    pub fn unsubscribe(mut self) -> bool {
        self.detach()
    }

    fn detach(&mut self) -> bool {
        if self.detached {
            return false;
        }
        self.detached = true;

        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut reg = bus.lock();
        let before = reg.subscribers.len();
        reg.subscribers.retain(|(id, _)| *id != self.id);
        reg.subscribers.len() != before
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.detach();
    }
}
