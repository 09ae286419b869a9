//! One result slot of a node and the queues behind it.
//!
//! In exclusive mode every consumer view shares one queue, so each value
//! reaches exactly one consumer. In broadcast mode every view owns a queue
//! and receives every value. The output counts as locked while the shared
//! queue, or any broadcast queue, is full.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::queue::NotifyingQueue;
use super::signal::Signal;
use super::source::OutputSource;
use super::terminator::OutputTerminator;
use crate::any::{FlowValue, Value, ValueType};
use crate::core::config::FlowConfig;
use crate::core::errors::{FlowError, Result};

pub struct NodeOutput {
    value_type: ValueType,
    index: usize,
    state: Mutex<OutputState>,
    unlocked: Signal<()>,
    exceptions: Signal<Arc<FlowError>>,
    this: Weak<NodeOutput>,
}

struct OutputState {
    exclusive: bool,
    capacity: usize,
    discard_if_locked: bool,
    shared: Option<Arc<NotifyingQueue<Value>>>,
    views: Vec<Arc<OutputSource>>,
}

impl OutputState {
    fn is_locked(&self) -> bool {
        match &self.shared {
            Some(queue) if self.exclusive => queue.is_locked(),
            _ => self.views.iter().any(|view| view.is_locked()),
        }
    }

    /// Every distinct queue currently behind this output
    fn queues(&self) -> Vec<Arc<NotifyingQueue<Value>>> {
        match &self.shared {
            Some(queue) if self.exclusive => vec![Arc::clone(queue)],
            _ => self.views.iter().map(|view| view.queue()).collect(),
        }
    }
}

impl NodeOutput {
    pub(crate) fn new(value_type: ValueType, index: usize, config: &FlowConfig) -> Arc<Self> {
        let exclusive = config.default_exclusive_mode;
        let capacity = config.default_queue_capacity;
        Arc::new_cyclic(|this| Self {
            value_type,
            index,
            state: Mutex::new(OutputState {
                exclusive,
                capacity,
                discard_if_locked: config.default_discard_if_locked,
                shared: exclusive.then(|| Arc::new(NotifyingQueue::new(capacity))),
                views: Vec::new(),
            }),
            unlocked: Signal::new(),
            exceptions: Signal::new(),
            this: this.clone(),
        })
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Position of this slot among the node's outputs
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().is_locked()
    }

    pub fn exclusive_mode(&self) -> bool {
        self.state.lock().exclusive
    }

    pub fn queue_capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn discard_if_locked(&self) -> bool {
        self.state.lock().discard_if_locked
    }

    /// Drop results instead of waiting for room while the output is locked
    pub fn set_discard_if_locked(&self, discard: bool) {
        self.state.lock().discard_if_locked = discard;
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().views.len()
    }

    /// Values pushed but not yet pulled by any consumer
    pub fn queued(&self) -> usize {
        let queues = self.state.lock().queues();
        queues.iter().map(|queue| queue.len()).sum()
    }

    /// Fired once none of the queues behind this output is locked
    pub fn on_unlocked(&self) -> &Signal<()> {
        &self.unlocked
    }

    /// Execution errors of the owning node
    pub fn on_exception(&self) -> &Signal<Arc<FlowError>> {
        &self.exceptions
    }

    pub(crate) fn notify_exception(&self, error: &Arc<FlowError>) {
        self.exceptions.emit(error);
    }

    /// Queues `value` for the consumers, handing it back if the output is
    /// locked.
    pub fn try_push(&self, value: Value) -> std::result::Result<(), Value> {
        let (targets, exclusive) = {
            let state = self.state.lock();
            if state.is_locked() {
                return Err(value);
            }
            (state.queues(), state.exclusive)
        };

        // Enqueue outside the output lock: consumers are notified
        // synchronously and may pull, which can come back here through an
        // unlock relay.
        if exclusive {
            return match targets.first() {
                Some(queue) => queue.try_enqueue(value),
                None => Err(value),
            };
        }

        let Some((last, rest)) = targets.split_last() else {
            debug!(output = self.index, "Broadcast output has no consumers, value dropped");
            return Ok(());
        };
        for queue in rest {
            if queue.try_enqueue(value.clone()).is_err() {
                warn!(output = self.index, "Broadcast queue filled concurrently, value lost for one consumer");
            }
        }
        if last.try_enqueue(value).is_err() {
            warn!(output = self.index, "Broadcast queue filled concurrently, value lost for one consumer");
        }
        Ok(())
    }

    /// Creates a new consumer-facing view onto this output.
    ///
    /// The view stays attached until [`release_value_source`] is called,
    /// even once every handle to it is dropped. In broadcast mode an
    /// attached view nobody reads keeps filling, and a bounded output locks
    /// for good once it is full.
    ///
    /// [`release_value_source`]: Self::release_value_source
    pub fn take_value_source(&self) -> Arc<OutputSource> {
        let view = {
            let mut state = self.state.lock();
            let queue = match &state.shared {
                Some(queue) if state.exclusive => Arc::clone(queue),
                _ => Arc::new(NotifyingQueue::new(state.capacity)),
            };
            let view = OutputSource::new(self.value_type, queue);
            let weak = self.this.clone();
            view.on_unlocked().subscribe(move |_| {
                if let Some(output) = weak.upgrade() {
                    output.relay_unlocked();
                }
            });
            state.views.push(Arc::clone(&view));
            view
        };
        debug!(output = self.index, consumers = self.consumer_count(), "Consumer attached");
        view
    }

    /// Switches between exclusive and broadcast distribution. Values still
    /// queued under the old topology are dropped.
    pub fn set_exclusive_mode(&self, exclusive: bool) {
        let dropped = {
            let mut state = self.state.lock();
            if state.exclusive == exclusive {
                return;
            }
            let dropped: usize = state.queues().iter().map(|queue| queue.len()).sum();
            state.exclusive = exclusive;
            if exclusive {
                let shared = Arc::new(NotifyingQueue::new(state.capacity));
                for view in &state.views {
                    view.rebind(Arc::clone(&shared));
                }
                state.shared = Some(shared);
            } else {
                for view in &state.views {
                    view.rebind(Arc::new(NotifyingQueue::new(state.capacity)));
                }
                state.shared = None;
            }
            dropped
        };
        if dropped > 0 {
            warn!(
                output = self.index,
                dropped, exclusive, "Output mode switched, queued values dropped"
            );
        }
        self.relay_unlocked();
    }

    /// Applies a new capacity to every queue behind this output
    pub fn set_queue_capacity(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(FlowError::configuration_field(
                "queue capacity must be greater than 0",
                "queue_capacity",
            ));
        }
        let queues = {
            let mut state = self.state.lock();
            if state.capacity == capacity {
                return Ok(());
            }
            state.capacity = capacity;
            state.queues()
        };
        for queue in queues {
            queue.set_capacity(capacity);
        }
        // An output without consumers has nobody to relay its unlock
        self.relay_unlocked();
        Ok(())
    }

    /// Attaches a fresh terminator collecting this output's values
    pub fn terminate<T: FlowValue>(&self) -> Result<OutputTerminator<T>> {
        let terminator = OutputTerminator::new();
        terminator.add(self)?;
        Ok(terminator)
    }

    /// Detaches a view taken with [`take_value_source`](Self::take_value_source).
    /// The view keeps whatever it already holds but receives nothing more.
    /// Returns false if the view was not attached to this output.
    pub fn release_value_source(&self, view: &OutputSource) -> bool {
        let (released, unlocked) = {
            let mut state = self.state.lock();
            let was_locked = state.is_locked();
            let before = state.views.len();
            state
                .views
                .retain(|attached| !std::ptr::eq(Arc::as_ptr(attached), view));
            (state.views.len() != before, was_locked && !state.is_locked())
        };
        if released {
            debug!(output = self.index, consumers = self.consumer_count(), "Consumer released");
        }
        if unlocked {
            self.unlocked.emit(&());
        }
        released
    }

    fn relay_unlocked(&self) {
        if !self.is_locked() {
            self.unlocked.emit(&());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::any::{downcast, into_value};
    use crate::node_flow::source::ValueSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn output(exclusive: bool, capacity: usize) -> Arc<NodeOutput> {
        let config = FlowConfig {
            default_exclusive_mode: exclusive,
            default_queue_capacity: capacity,
            ..FlowConfig::default()
        };
        NodeOutput::new(ValueType::of::<i32>(), 0, &config)
    }

    fn pull_i32(view: &OutputSource) -> Option<i32> {
        view.pull().map(|v| downcast::<i32>(v).unwrap())
    }

    #[test]
    fn test_exclusive_views_share_values() {
        let output = output(true, 10);
        let a = output.take_value_source();
        let b = output.take_value_source();
        for i in 0..4 {
            output.try_push(into_value(i)).unwrap();
        }
        assert_eq!(pull_i32(&a), Some(0));
        assert_eq!(pull_i32(&b), Some(1));
        assert_eq!(pull_i32(&a), Some(2));
        assert_eq!(pull_i32(&b), Some(3));
        assert_eq!(pull_i32(&a), None);
    }

    #[test]
    fn test_broadcast_views_see_every_value() {
        let output = output(false, 10);
        let a = output.take_value_source();
        let b = output.take_value_source();
        output.try_push(into_value(1)).unwrap();
        output.try_push(into_value(2)).unwrap();
        assert_eq!(pull_i32(&a), Some(1));
        assert_eq!(pull_i32(&a), Some(2));
        assert_eq!(pull_i32(&b), Some(1));
        assert_eq!(pull_i32(&b), Some(2));
    }

    #[test]
    fn test_locked_output_hands_value_back() {
        let output = output(true, 1);
        output.try_push(into_value(1)).unwrap();
        assert!(output.is_locked());
        let rejected = output.try_push(into_value(2)).unwrap_err();
        assert_eq!(downcast::<i32>(rejected).unwrap(), 2);
    }

    #[test]
    fn test_broadcast_locks_on_slowest_consumer() {
        let output = output(false, 1);
        let fast = output.take_value_source();
        let _slow = output.take_value_source();
        let unlocked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&unlocked);
        output.on_unlocked().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        output.try_push(into_value(1)).unwrap();
        assert!(output.is_locked());
        assert_eq!(pull_i32(&fast), Some(1));
        // The slow consumer still holds its copy
        assert!(output.is_locked());
        assert_eq!(unlocked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_released_view_no_longer_holds_the_output() {
        let output = output(false, 1);
        let reader = output.take_value_source();
        let gone = output.take_value_source();
        let unlocked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&unlocked);
        output.on_unlocked().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        output.try_push(into_value(1)).unwrap();
        assert_eq!(pull_i32(&reader), Some(1));
        assert!(output.is_locked());

        assert!(output.release_value_source(&gone));
        assert!(!output.release_value_source(&gone));
        assert_eq!(output.consumer_count(), 1);
        assert!(!output.is_locked());
        assert_eq!(unlocked.load(Ordering::SeqCst), 1);

        // Only the remaining reader receives new values
        output.try_push(into_value(2)).unwrap();
        assert_eq!(pull_i32(&reader), Some(2));
        assert_eq!(pull_i32(&gone), Some(1));
        assert_eq!(pull_i32(&gone), None);
    }

    #[test]
    fn test_unlock_is_relayed_once_all_queues_drain() {
        let output = output(false, 1);
        let a = output.take_value_source();
        let b = output.take_value_source();
        let unlocked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&unlocked);
        output.on_unlocked().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        output.try_push(into_value(1)).unwrap();
        pull_i32(&a);
        assert_eq!(unlocked.load(Ordering::SeqCst), 0);
        pull_i32(&b);
        assert_eq!(unlocked.load(Ordering::SeqCst), 1);
        assert!(!output.is_locked());
    }

    #[test]
    fn test_mode_switch_rebuilds_queues() {
        let output = output(true, 10);
        let a = output.take_value_source();
        let b = output.take_value_source();
        output.try_push(into_value(1)).unwrap();
        assert_eq!(output.queued(), 1);

        output.set_exclusive_mode(false);
        assert!(!output.exclusive_mode());
        // Unread values do not survive the switch
        assert_eq!(output.queued(), 0);
        output.try_push(into_value(2)).unwrap();
        assert_eq!(pull_i32(&a), Some(2));
        assert_eq!(pull_i32(&b), Some(2));

        output.set_exclusive_mode(true);
        output.try_push(into_value(3)).unwrap();
        assert_eq!(pull_i32(&b), Some(3));
        assert_eq!(pull_i32(&a), None);
    }

    #[test]
    fn test_capacity_propagates_to_every_queue() {
        let output = output(false, 1);
        let a = output.take_value_source();
        output.try_push(into_value(1)).unwrap();
        assert!(output.is_locked());

        output.set_queue_capacity(3).unwrap();
        assert_eq!(output.queue_capacity(), 3);
        assert!(!output.is_locked());
        assert_eq!(a.queue().capacity(), 3);

        let err = output.set_queue_capacity(0).unwrap_err();
        assert!(err.is_configuration());
    }
}
