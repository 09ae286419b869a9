//! Pull-based value producers feeding node inputs.
//!
//! Every source announces through [`ValueSource::on_value_ready`] that a
//! [`ValueSource::pull`] is likely to succeed. Announcements are hints: a
//! consumer must always be prepared for a pull to come back empty.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::queue::NotifyingQueue;
use super::signal::{Signal, SubscriptionId};
use crate::any::{into_value, FlowValue, Value, ValueType};

/// The capability every producer attached to a node input implements
pub trait ValueSource: Send + Sync {
    /// Type of the values this source hands out
    fn value_type(&self) -> ValueType;

    /// An exhausted source will never produce again and can be detached
    fn is_exhausted(&self) -> bool;

    fn is_value_ready(&self) -> bool;

    /// Hands over one value, or `None` if nothing is available right now
    fn pull(&self) -> Option<Value>;

    /// Fired whenever a value becomes available
    fn on_value_ready(&self) -> &Signal<()>;
}

/// A single constant, handed out once or forever
pub struct ConstSource {
    value: Value,
    value_type: ValueType,
    state: Mutex<ConstState>,
    ready: Signal<()>,
}

struct ConstState {
    exhaustible: bool,
    exhausted: bool,
}

impl ConstSource {
    pub fn new<T: FlowValue>(value: T, exhaustible: bool) -> Self {
        Self {
            value: into_value(value),
            value_type: ValueType::of::<T>(),
            state: Mutex::new(ConstState {
                exhaustible,
                exhausted: false,
            }),
            ready: Signal::new(),
        }
    }

    pub fn exhaustible(&self) -> bool {
        self.state.lock().exhaustible
    }

    /// Switching the mode makes the constant available again
    pub fn set_exhaustible(&self, exhaustible: bool) {
        {
            let mut state = self.state.lock();
            if state.exhaustible == exhaustible {
                return;
            }
            state.exhaustible = exhaustible;
            state.exhausted = false;
        }
        self.ready.emit(&());
    }
}

impl ValueSource for ConstSource {
    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn is_exhausted(&self) -> bool {
        self.state.lock().exhausted
    }

    fn is_value_ready(&self) -> bool {
        !self.state.lock().exhausted
    }

    fn pull(&self) -> Option<Value> {
        let repeat = {
            let mut state = self.state.lock();
            if state.exhausted {
                return None;
            }
            if state.exhaustible {
                state.exhausted = true;
            }
            !state.exhaustible
        };
        if repeat {
            // The same constant is immediately available again
            self.ready.emit(&());
        }
        Some(self.value.clone())
    }

    fn on_value_ready(&self) -> &Signal<()> {
        &self.ready
    }
}

/// A finite sequence, consumed once or cycled forever
pub struct EnumerableSource {
    items: Vec<Value>,
    value_type: ValueType,
    exhaustible: bool,
    cursor: Mutex<usize>,
    ready: Signal<()>,
}

impl EnumerableSource {
    pub fn new<T, I>(items: I, exhaustible: bool) -> Self
    where
        T: FlowValue,
        I: IntoIterator<Item = T>,
    {
        Self {
            items: items.into_iter().map(into_value).collect(),
            value_type: ValueType::of::<T>(),
            exhaustible,
            cursor: Mutex::new(0),
            ready: Signal::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of values still to come in the current pass
    pub fn remaining(&self) -> usize {
        self.items.len() - *self.cursor.lock()
    }
}

impl ValueSource for EnumerableSource {
    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn is_exhausted(&self) -> bool {
        self.exhaustible && *self.cursor.lock() >= self.items.len()
    }

    fn is_value_ready(&self) -> bool {
        if self.items.is_empty() {
            return false;
        }
        !self.exhaustible || *self.cursor.lock() < self.items.len()
    }

    fn pull(&self) -> Option<Value> {
        let (value, more) = {
            let mut cursor = self.cursor.lock();
            if *cursor >= self.items.len() {
                if self.exhaustible || self.items.is_empty() {
                    return None;
                }
                // Restart the sequence
                *cursor = 0;
            }
            let value = self.items[*cursor].clone();
            *cursor += 1;
            (value, !self.exhaustible || *cursor < self.items.len())
        };
        if more {
            self.ready.emit(&());
        }
        Some(value)
    }

    fn on_value_ready(&self) -> &Signal<()> {
        &self.ready
    }
}

/// One consumer's view onto a node output's queue
///
/// In exclusive mode several views share a queue; in broadcast mode each
/// view owns one. The owning output may rebind the view to a new queue
/// when its mode changes.
pub struct OutputSource {
    value_type: ValueType,
    binding: Mutex<Binding>,
    ready: Signal<()>,
    unlocked: Signal<()>,
    this: Weak<OutputSource>,
}

struct Binding {
    queue: Arc<NotifyingQueue<Value>>,
    enqueued_sub: SubscriptionId,
    unlocked_sub: SubscriptionId,
}

impl OutputSource {
    pub(crate) fn new(value_type: ValueType, queue: Arc<NotifyingQueue<Value>>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<OutputSource>| {
            let (enqueued_sub, unlocked_sub) = Self::subscribe_to(&queue, this);
            Self {
                value_type,
                binding: Mutex::new(Binding {
                    queue,
                    enqueued_sub,
                    unlocked_sub,
                }),
                ready: Signal::new(),
                unlocked: Signal::new(),
                this: this.clone(),
            }
        })
    }

    fn subscribe_to(
        queue: &NotifyingQueue<Value>,
        this: &Weak<OutputSource>,
    ) -> (SubscriptionId, SubscriptionId) {
        let weak = this.clone();
        let enqueued_sub = queue.on_enqueued().subscribe(move |_| {
            if let Some(source) = weak.upgrade() {
                source.ready.emit(&());
            }
        });
        let weak = this.clone();
        let unlocked_sub = queue.on_unlocked().subscribe(move |_| {
            if let Some(source) = weak.upgrade() {
                source.unlocked.emit(&());
            }
        });
        (enqueued_sub, unlocked_sub)
    }

    /// Points this view at another queue
    pub(crate) fn rebind(&self, queue: Arc<NotifyingQueue<Value>>) {
        let (enqueued_sub, unlocked_sub) = Self::subscribe_to(&queue, &self.this);
        let old = {
            let mut binding = self.binding.lock();
            std::mem::replace(
                &mut *binding,
                Binding {
                    queue,
                    enqueued_sub,
                    unlocked_sub,
                },
            )
        };
        old.queue.on_enqueued().unsubscribe(old.enqueued_sub);
        old.queue.on_unlocked().unsubscribe(old.unlocked_sub);
    }

    pub(crate) fn queue(&self) -> Arc<NotifyingQueue<Value>> {
        Arc::clone(&self.binding.lock().queue)
    }

    pub fn is_locked(&self) -> bool {
        self.queue().is_locked()
    }

    /// Fired when the backing queue leaves the locked state
    pub fn on_unlocked(&self) -> &Signal<()> {
        &self.unlocked
    }
}

impl Drop for OutputSource {
    fn drop(&mut self) {
        let binding = self.binding.get_mut();
        binding.queue.on_enqueued().unsubscribe(binding.enqueued_sub);
        binding.queue.on_unlocked().unsubscribe(binding.unlocked_sub);
    }
}

impl ValueSource for OutputSource {
    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn is_exhausted(&self) -> bool {
        false
    }

    fn is_value_ready(&self) -> bool {
        !self.queue().is_empty()
    }

    fn pull(&self) -> Option<Value> {
        // Never hold the binding lock while dequeuing: an unlock
        // notification may come back into this view.
        let queue = self.queue();
        queue.try_dequeue()
    }

    fn on_value_ready(&self) -> &Signal<()> {
        &self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::any::downcast;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pull_i32(source: &dyn ValueSource) -> Option<i32> {
        source.pull().map(|v| downcast::<i32>(v).unwrap())
    }

    fn ready_counter(source: &dyn ValueSource) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&hits);
        source.on_value_ready().subscribe(move |_| {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    #[test]
    fn test_exhaustible_const() {
        let source = ConstSource::new(5i32, true);
        assert!(source.is_value_ready());
        assert_eq!(pull_i32(&source), Some(5));
        assert!(source.is_exhausted());
        assert_eq!(pull_i32(&source), None);
    }

    #[test]
    fn test_repeating_const_never_exhausts() {
        let source = ConstSource::new(5i32, false);
        let ready = ready_counter(&source);
        for _ in 0..100 {
            assert_eq!(pull_i32(&source), Some(5));
        }
        assert!(!source.is_exhausted());
        assert_eq!(ready.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_const_mode_switch_rearms() {
        let source = ConstSource::new(1i32, true);
        assert_eq!(pull_i32(&source), Some(1));
        assert!(source.is_exhausted());
        source.set_exhaustible(false);
        assert!(!source.exhaustible());
        assert_eq!(pull_i32(&source), Some(1));
        assert!(!source.is_exhausted());
    }

    #[test]
    fn test_exhaustible_sequence_yields_each_item_once() {
        let source = EnumerableSource::new(vec![1i32, 2, 3], true);
        assert_eq!(source.len(), 3);
        let pulled: Vec<i32> = std::iter::from_fn(|| pull_i32(&source)).collect();
        assert_eq!(pulled, vec![1, 2, 3]);
        assert!(source.is_exhausted());
        assert!(!source.is_value_ready());
        assert_eq!(pull_i32(&source), None);
        assert_eq!(pull_i32(&source), None);
    }

    #[test]
    fn test_cycling_sequence_restarts() {
        let source = EnumerableSource::new(vec![1i32, 2], false);
        let pulled: Vec<i32> = (0..5).filter_map(|_| pull_i32(&source)).collect();
        assert_eq!(pulled, vec![1, 2, 1, 2, 1]);
        assert!(!source.is_exhausted());
        assert!(source.is_value_ready());
    }

    #[test]
    fn test_empty_sequence() {
        let source = EnumerableSource::new(Vec::<i32>::new(), false);
        assert!(!source.is_value_ready());
        assert_eq!(pull_i32(&source), None);
        assert!(!source.is_exhausted());

        let source = EnumerableSource::new(Vec::<i32>::new(), true);
        assert!(source.is_exhausted());
    }

    #[test]
    fn test_output_source_follows_its_queue() {
        let queue = Arc::new(NotifyingQueue::new(2));
        let source = OutputSource::new(ValueType::of::<i32>(), Arc::clone(&queue));
        let ready = ready_counter(source.as_ref());

        assert!(!source.is_value_ready());
        queue.try_enqueue(into_value(7i32)).unwrap();
        assert!(source.is_value_ready());
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        assert_eq!(pull_i32(source.as_ref()), Some(7));
        assert!(!source.is_exhausted());

        let other = Arc::new(NotifyingQueue::new(2));
        source.rebind(Arc::clone(&other));
        queue.try_enqueue(into_value(1i32)).unwrap();
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        other.try_enqueue(into_value(2i32)).unwrap();
        assert_eq!(ready.load(Ordering::SeqCst), 2);
        assert_eq!(pull_i32(source.as_ref()), Some(2));
    }
}
