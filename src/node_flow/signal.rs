//! Multi-subscriber notification channel used between components.
//!
//! Handlers are invoked on the emitting thread after the subscriber list
//! has been cloned, so no lock is held while a handler runs and a handler
//! may subscribe, unsubscribe or emit again.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Identifies one subscription so it can be removed later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Signal<A> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<A>)>>,
    next_id: AtomicU64,
}

impl<A> Signal<A> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn emit(&self, arg: &A) {
        let handlers: Vec<Handler<A>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(arg);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let signal = Signal::<usize>::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = Arc::clone(&total);
            signal.subscribe(move |n| {
                total.fetch_add(*n, Ordering::SeqCst);
            });
        }
        signal.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe() {
        let signal = Signal::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = signal.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit(&());
        assert!(signal.unsubscribe(id));
        assert!(!signal.unsubscribe(id));
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_can_reenter_signal() {
        let signal = Arc::new(Signal::<u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&signal);
        let counter = Arc::clone(&hits);
        signal.subscribe(move |depth| {
            counter.fetch_add(1, Ordering::SeqCst);
            if *depth > 0 {
                if let Some(signal) = weak.upgrade() {
                    signal.emit(&(depth - 1));
                }
            }
        });
        signal.emit(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
