//! Terminal collector for node outputs.
//!
//! A terminator drains every output it is attached to as soon as values
//! arrive, keeps them in arrival order, and records the execution errors
//! of the producing nodes. Callers block on [`OutputTerminator::wait_for_results`]
//! until enough results and errors have come in.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use super::output::NodeOutput;
use super::source::{OutputSource, ValueSource};
use crate::any::{downcast, value_type_of, FlowValue, ValueType};
use crate::core::errors::{FlowError, Result};

pub struct OutputTerminator<T: FlowValue> {
    inner: Arc<TerminatorInner<T>>,
}

struct TerminatorInner<T> {
    log: Mutex<Log<T>>,
    appended: Condvar,
    drain: Mutex<DrainState>,
}

struct Log<T> {
    results: Vec<T>,
    errors: Vec<Arc<FlowError>>,
    /// Outstanding waiters and how many more entries each still needs
    waiters: HashMap<u64, usize>,
    next_waiter: u64,
}

impl<T> Log<T> {
    fn total(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    fn count_append(&mut self) {
        for remaining in self.waiters.values_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }
}

#[derive(Default)]
struct DrainState {
    views: Vec<Arc<OutputSource>>,
    draining: bool,
    redrain: bool,
}

impl<T: FlowValue> OutputTerminator<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TerminatorInner {
                log: Mutex::new(Log {
                    results: Vec::new(),
                    errors: Vec::new(),
                    waiters: HashMap::new(),
                    next_waiter: 0,
                }),
                appended: Condvar::new(),
                drain: Mutex::new(DrainState::default()),
            }),
        }
    }

    /// Starts collecting from `output`. Values already queued are taken
    /// right away.
    pub fn add(&self, output: &NodeOutput) -> Result<()> {
        ValueType::of::<T>().expect(output.value_type(), "terminator")?;

        let weak: Weak<TerminatorInner<T>> = Arc::downgrade(&self.inner);
        output.on_exception().subscribe(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.append_error(Arc::clone(err));
            }
        });

        let view = output.take_value_source();
        let weak: Weak<TerminatorInner<T>> = Arc::downgrade(&self.inner);
        view.on_value_ready().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.drain();
            }
        });
        self.inner.drain.lock().views.push(view);

        debug!(output = output.index(), "Terminator attached");
        self.inner.drain();
        Ok(())
    }

    /// Blocks until at least `count` results and errors were collected in
    /// total
    pub fn wait_for_results(&self, count: usize) {
        let mut log = self.inner.log.lock();
        let Some(id) = self.inner.register_waiter(&mut log, count) else {
            return;
        };
        while log.waiters.get(&id).copied().unwrap_or(0) > 0 {
            self.inner.appended.wait(&mut log);
        }
        log.waiters.remove(&id);
    }

    /// Like [`wait_for_results`](Self::wait_for_results), giving up with a
    /// [`FlowError::Timeout`] once `timeout` has elapsed. A timeout too
    /// large to represent as a deadline waits without limit.
    pub fn wait_for_results_timeout(&self, count: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut log = self.inner.log.lock();
        let Some(id) = self.inner.register_waiter(&mut log, count) else {
            return Ok(());
        };
        while log.waiters.get(&id).copied().unwrap_or(0) > 0 {
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .appended
                        .wait_until(&mut log, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.inner.appended.wait(&mut log),
            }
        }
        let remaining = log.waiters.remove(&id).unwrap_or(0);
        if remaining > 0 {
            return Err(FlowError::timeout(
                format!("waiting for {} results ({} collected)", count, log.total()),
                timeout.as_millis() as u64,
            ));
        }
        Ok(())
    }

    pub fn wait_for_results_ms(&self, count: usize, timeout_ms: u64) -> Result<()> {
        self.wait_for_results_timeout(count, Duration::from_millis(timeout_ms))
    }

    /// Snapshot of the results collected so far, in arrival order
    pub fn results(&self) -> Vec<T> {
        self.inner.log.lock().results.clone()
    }

    /// Snapshot of the execution errors collected so far
    pub fn exceptions(&self) -> Vec<Arc<FlowError>> {
        self.inner.log.lock().errors.clone()
    }

    pub fn result_count(&self) -> usize {
        self.inner.log.lock().results.len()
    }

    pub fn exception_count(&self) -> usize {
        self.inner.log.lock().errors.len()
    }
}

impl<T: FlowValue> Default for OutputTerminator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FlowValue> Clone for OutputTerminator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: FlowValue> TerminatorInner<T> {
    /// Registers a waiter for `count` entries in total, or returns `None`
    /// if that many are already there
    fn register_waiter(&self, log: &mut Log<T>, count: usize) -> Option<u64> {
        let remaining = count.saturating_sub(log.total());
        if remaining == 0 {
            return None;
        }
        let id = log.next_waiter;
        log.next_waiter += 1;
        log.waiters.insert(id, remaining);
        Some(id)
    }

    fn append_result(&self, value: T) {
        let mut log = self.log.lock();
        log.results.push(value);
        log.count_append();
        self.appended.notify_all();
    }

    fn append_error(&self, err: Arc<FlowError>) {
        let mut log = self.log.lock();
        log.errors.push(err);
        log.count_append();
        self.appended.notify_all();
    }

    /// Pulls every available value from every view. Single-flight across
    /// views; readiness announced mid-drain makes the drain go round again.
    fn drain(&self) {
        {
            let mut state = self.drain.lock();
            if state.draining {
                state.redrain = true;
                return;
            }
            state.draining = true;
            state.redrain = false;
        }

        loop {
            let views = self.drain.lock().views.clone();
            for view in &views {
                // Pulling may unlock the producer, which publishes straight
                // back into this view.
                while let Some(value) = view.pull() {
                    match downcast::<T>(value) {
                        Ok(value) => self.append_result(value),
                        Err(value) => error!(
                            got = %value_type_of(&value),
                            "Terminator received a value of the wrong type"
                        ),
                    }
                }
            }

            let mut state = self.drain.lock();
            if state.redrain {
                state.redrain = false;
                continue;
            }
            state.draining = false;
            return;
        }
    }
}
