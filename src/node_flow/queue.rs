use parking_lot::Mutex;
use std::collections::VecDeque;

use super::signal::Signal;

/// A bounded FIFO that refuses new items once full and announces when it
/// has room again
pub struct NotifyingQueue<T> {
    state: Mutex<QueueState<T>>,
    enqueued: Signal<()>,
    unlocked: Signal<()>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    locked: bool,
}

impl<T> NotifyingQueue<T> {
    /// Creates a new queue that locks once it holds `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity,
                locked: capacity == 0,
            }),
            enqueued: Signal::new(),
            unlocked: Signal::new(),
        }
    }

    /// Appends `item` unless the queue is locked, in which case the item is
    /// handed back untouched
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.locked {
                return Err(item);
            }
            state.items.push_back(item);
            if state.items.len() >= state.capacity {
                state.locked = true;
            }
        }
        self.enqueued.emit(&());
        Ok(())
    }

    /// Removes the head item, unlocking the queue if it drops below capacity
    pub fn try_dequeue(&self) -> Option<T> {
        let (item, unlocked) = {
            let mut state = self.state.lock();
            let item = state.items.pop_front()?;
            let unlocked = state.locked && state.items.len() < state.capacity;
            if unlocked {
                state.locked = false;
            }
            (item, unlocked)
        };
        if unlocked {
            self.unlocked.emit(&());
        }
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Changes the capacity. Shrinking to or below the current size locks
    /// the queue; growing past it unlocks a locked queue.
    pub fn set_capacity(&self, capacity: usize) {
        let unlocked = {
            let mut state = self.state.lock();
            if state.capacity == capacity {
                return;
            }
            state.capacity = capacity;
            let full = state.items.len() >= capacity;
            let unlocked = state.locked && !full;
            state.locked = full;
            unlocked
        };
        if unlocked {
            self.unlocked.emit(&());
        }
    }

    /// Drops every queued item and returns how many were dropped
    pub fn clear(&self) -> usize {
        let (dropped, unlocked) = {
            let mut state = self.state.lock();
            let dropped = state.items.len();
            state.items.clear();
            let unlocked = state.locked && state.capacity > 0;
            if unlocked {
                state.locked = false;
            }
            (dropped, unlocked)
        };
        if unlocked {
            self.unlocked.emit(&());
        }
        dropped
    }

    /// Fired after every successful enqueue
    pub fn on_enqueued(&self) -> &Signal<()> {
        &self.enqueued
    }

    /// Fired when the queue leaves the locked state
    pub fn on_unlocked(&self) -> &Signal<()> {
        &self.unlocked
    }
}
