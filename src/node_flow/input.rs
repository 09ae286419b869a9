//! One parameter slot of a node.
//!
//! A slot buffers at most one value. Capture is single-flight: while one
//! thread pulls from a source, any other ready notification only asks the
//! active capturer to rescan, so reentrant notifications (a repeating
//! constant re-announcing itself from inside its own pull) never fill the
//! slot twice.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::output::NodeOutput;
use super::signal::{Signal, SubscriptionId};
use super::source::{ConstSource, EnumerableSource, ValueSource};
use crate::any::{FlowValue, Value, ValueType};
use crate::core::errors::Result;

pub struct NodeInput {
    value_type: ValueType,
    index: usize,
    state: Mutex<InputState>,
    captured: Signal<()>,
    this: Weak<NodeInput>,
}

struct AttachedSource {
    source: Arc<dyn ValueSource>,
    subscription: SubscriptionId,
}

#[derive(Default)]
struct InputState {
    sources: Vec<AttachedSource>,
    cursor: usize,
    value: Option<Value>,
    capturing: bool,
    rescan: bool,
    silenced: bool,
    latched: bool,
}

impl InputState {
    /// Next ready source in round-robin order
    fn next_ready(&mut self) -> Option<Arc<dyn ValueSource>> {
        let len = self.sources.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            if self.sources[index].source.is_value_ready() {
                self.cursor = (index + 1) % len;
                return Some(Arc::clone(&self.sources[index].source));
            }
        }
        None
    }

    fn detach(&mut self, source: &Arc<dyn ValueSource>) {
        if let Some(index) = self
            .sources
            .iter()
            .position(|attached| Arc::ptr_eq(&attached.source, source))
        {
            let attached = self.sources.remove(index);
            attached
                .source
                .on_value_ready()
                .unsubscribe(attached.subscription);
            if self.cursor > index {
                self.cursor -= 1;
            }
            if self.cursor >= self.sources.len() {
                self.cursor = 0;
            }
        }
    }
}

impl NodeInput {
    pub(crate) fn new(value_type: ValueType, index: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            value_type,
            index,
            state: Mutex::new(InputState::default()),
            captured: Signal::new(),
            this: this.clone(),
        })
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Position of this slot among the node's inputs
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether a captured value is waiting in the slot
    pub fn is_value_ready(&self) -> bool {
        self.state.lock().value.is_some()
    }

    pub fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Fired whenever the slot goes from empty to holding a value
    pub fn on_value_captured(&self) -> &Signal<()> {
        &self.captured
    }

    /// Attaches a source and immediately tries to capture from it
    pub fn add_source(&self, source: Arc<dyn ValueSource>) -> Result<()> {
        self.value_type.expect(
            source.value_type(),
            &format!("source attached to input {}", self.index),
        )?;

        let weak_input = self.this.clone();
        let weak_source = Arc::downgrade(&source);
        let subscription = source.on_value_ready().subscribe(move |_| {
            if let (Some(input), Some(source)) = (weak_input.upgrade(), weak_source.upgrade()) {
                input.capture(Some(source));
            }
        });
        self.state.lock().sources.push(AttachedSource {
            source: Arc::clone(&source),
            subscription,
        });

        self.capture(Some(source));
        Ok(())
    }

    /// Attaches a constant that is consumed by a single invocation
    pub fn add_value<T: FlowValue>(&self, value: T) -> Result<()> {
        self.add_source(Arc::new(ConstSource::new(value, true)))
    }

    /// Attaches a constant that feeds every invocation
    pub fn add_repeating<T: FlowValue>(&self, value: T) -> Result<()> {
        self.add_source(Arc::new(ConstSource::new(value, false)))
    }

    /// Attaches a sequence that is consumed once
    pub fn add_values<T, I>(&self, values: I) -> Result<()>
    where
        T: FlowValue,
        I: IntoIterator<Item = T>,
    {
        self.add_source(Arc::new(EnumerableSource::new(values, true)))
    }

    /// Attaches a sequence that restarts once consumed
    pub fn add_cycle<T, I>(&self, values: I) -> Result<()>
    where
        T: FlowValue,
        I: IntoIterator<Item = T>,
    {
        self.add_source(Arc::new(EnumerableSource::new(values, false)))
    }

    /// Taps another node's output
    pub fn add_output(&self, output: &NodeOutput) -> Result<()> {
        self.value_type.expect(
            output.value_type(),
            &format!("output wired to input {}", self.index),
        )?;
        self.add_source(output.take_value_source())
    }

    /// Empties the slot and eagerly refills it from the attached sources
    pub fn try_take_value(&self) -> Option<Value> {
        let value = self.state.lock().value.take()?;
        self.capture(None);
        Some(value)
    }

    /// While silenced, captures latch their notification instead of firing
    /// it; un-silencing replays one notification if a value is waiting.
    pub(crate) fn set_silenced(&self, silenced: bool) {
        let replay = {
            let mut state = self.state.lock();
            if state.silenced == silenced {
                return;
            }
            state.silenced = silenced;
            let replay = !silenced && state.latched && state.value.is_some();
            if !silenced {
                state.latched = false;
            }
            replay
        };
        if replay {
            self.captured.emit(&());
        }
    }

    /// Fills an empty slot from `preferred`, falling back to any ready source.
    fn capture(&self, preferred: Option<Arc<dyn ValueSource>>) {
        let mut candidate = preferred;
        let mut misses = 0;
        loop {
            let source = {
                let mut state = self.state.lock();
                if state.capturing {
                    state.rescan = true;
                    return;
                }
                if state.value.is_some() {
                    return;
                }
                let source = match candidate.take() {
                    Some(source) => source,
                    None => match state.next_ready() {
                        Some(source) => source,
                        None => return,
                    },
                };
                state.capturing = true;
                state.rescan = false;
                source
            };

            // Pull without holding the slot lock, the source may notify
            // straight back into this slot.
            let pulled = source.pull();
            let exhausted = source.is_exhausted();

            let notify = {
                let mut state = self.state.lock();
                state.capturing = false;
                if exhausted {
                    debug!(input = self.index, "Detaching exhausted source");
                    state.detach(&source);
                }
                match pulled {
                    Some(value) => {
                        state.value = Some(value);
                        if state.silenced {
                            state.latched = true;
                            false
                        } else {
                            true
                        }
                    }
                    None => {
                        // Another source may be ready, or may have announced
                        // itself while we were pulling.
                        misses += 1;
                        if state.rescan {
                            misses = 0;
                        }
                        if misses > state.sources.len() {
                            return;
                        }
                        continue;
                    }
                }
            };

            if notify {
                self.captured.emit(&());
            }
            return;
        }
    }
}

impl Drop for NodeInput {
    fn drop(&mut self) {
        for attached in self.state.get_mut().sources.drain(..) {
            attached
                .source
                .on_value_ready()
                .unsubscribe(attached.subscription);
        }
    }
}
