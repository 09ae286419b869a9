//! The node scheduler.
//!
//! A node launches an invocation whenever every input holds a value and
//! fewer than `concurrency_limit` invocations are in flight. Invocations
//! run on the worker pool and may complete in any order, but their results
//! are published in launch order: a finished invocation whose predecessor
//! is still in flight parks its publish on that predecessor and is resumed
//! when the predecessor retires.
//!
//! Lock discipline: the scheduler state is a leaf. It is never held while
//! pushing to an output, taking from an input, emitting an event or
//! spawning work.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use super::events::{EventSink, NodeEvent, NodeEventEnvelope};
use super::function::{
    signature_name, IntoFallibleNodeFunction, IntoNodeFunction, NodeFunction,
};
use super::input::NodeInput;
use super::output::NodeOutput;
use super::pool::WorkerPool;
use super::signal::{Signal, SubscriptionId};
use crate::any::{value_type_of, Value};
use crate::core::config::FlowConfig;
use crate::core::errors::{panic_message, ArgumentList, FlowError, Result};

type RetireCallback = Box<dyn FnOnce() + Send>;

/// Handle to a node. Cloning is cheap and every clone drives the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    name: String,
    function: Arc<dyn NodeFunction>,
    inputs: Vec<Arc<NodeInput>>,
    outputs: Vec<Arc<NodeOutput>>,
    pool: WorkerPool,
    event_sink: Option<Arc<dyn EventSink>>,
    event_sequence: AtomicU64,
    exceptions: Signal<Arc<FlowError>>,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    limit: usize,
    next_sequence: u64,
    /// In-flight invocations keyed by launch sequence
    in_flight: BTreeMap<u64, Invocation>,
    dispatching: bool,
    redispatch: bool,
}

#[derive(Default)]
struct Invocation {
    /// Publishes of later invocations parked until this one retires
    on_retired: Vec<(u64, RetireCallback)>,
}

/// Optional settings for a node under construction
pub struct NodeBuilder {
    function: Arc<dyn NodeFunction>,
    name: Option<String>,
    concurrency: Option<usize>,
    pool: Option<WorkerPool>,
    config: Option<FlowConfig>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl NodeBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Maximum number of invocations in flight at once
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    /// Runs invocations on `pool` instead of the global pool
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Port defaults (queue capacity, distribution mode, discard flag) and
    /// the default concurrency limit
    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Node> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let limit = self.concurrency.unwrap_or(config.default_concurrency_limit);
        if limit == 0 {
            return Err(FlowError::configuration_field(
                "concurrency limit must be greater than 0",
                "concurrency",
            ));
        }

        let input_types = self.function.input_types();
        let output_types = self.function.output_types();
        if input_types.is_empty() {
            return Err(FlowError::configuration(
                "node function must take at least one input",
            ));
        }

        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::global()?,
        };
        let name = self
            .name
            .unwrap_or_else(|| signature_name(&input_types, &output_types));

        let inputs: Vec<_> = input_types
            .iter()
            .enumerate()
            .map(|(index, value_type)| NodeInput::new(*value_type, index))
            .collect();
        let outputs: Vec<_> = output_types
            .iter()
            .enumerate()
            .map(|(index, value_type)| NodeOutput::new(*value_type, index, &config))
            .collect();

        let inner = Arc::new(NodeInner {
            name,
            function: self.function,
            inputs,
            outputs,
            pool,
            event_sink: self.event_sink,
            event_sequence: AtomicU64::new(0),
            exceptions: Signal::new(),
            state: Mutex::new(SchedulerState {
                limit,
                next_sequence: 0,
                in_flight: BTreeMap::new(),
                dispatching: false,
                redispatch: false,
            }),
        });

        for input in &inner.inputs {
            let weak: Weak<NodeInner> = Arc::downgrade(&inner);
            input.on_value_captured().subscribe(move |_| {
                if let Some(node) = weak.upgrade() {
                    node.try_dispatch();
                }
            });
        }

        info!(
            node = %inner.name,
            inputs = inner.inputs.len(),
            outputs = inner.outputs.len(),
            concurrency = limit,
            "Node created"
        );
        Ok(Node { inner })
    }
}

impl Node {
    /// Starts building a node around an infallible closure
    pub fn builder<M>(function: impl IntoNodeFunction<M>) -> NodeBuilder {
        Self::from_function(function.into_node_function())
    }

    /// Starts building a node around a closure returning `Result`
    pub fn try_builder<M>(function: impl IntoFallibleNodeFunction<M>) -> NodeBuilder {
        Self::from_function(function.into_node_function())
    }

    pub fn from_function(function: Arc<dyn NodeFunction>) -> NodeBuilder {
        NodeBuilder {
            function,
            name: None,
            concurrency: None,
            pool: None,
            config: None,
            event_sink: None,
        }
    }

    /// Builds a node with default settings
    pub fn new<M>(function: impl IntoNodeFunction<M>) -> Result<Node> {
        Self::builder(function).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn inputs(&self) -> &[Arc<NodeInput>] {
        &self.inner.inputs
    }

    pub fn outputs(&self) -> &[Arc<NodeOutput>] {
        &self.inner.outputs
    }

    pub fn input(&self, index: usize) -> Result<&Arc<NodeInput>> {
        self.inner.inputs.get(index).ok_or_else(|| {
            FlowError::configuration(format!(
                "node {} has no input {} ({} inputs)",
                self.inner.name,
                index,
                self.inner.inputs.len()
            ))
        })
    }

    pub fn output(&self, index: usize) -> Result<&Arc<NodeOutput>> {
        self.inner.outputs.get(index).ok_or_else(|| {
            FlowError::configuration(format!(
                "node {} has no output {} ({} outputs)",
                self.inner.name,
                index,
                self.inner.outputs.len()
            ))
        })
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.state.lock().limit
    }

    /// Changes the concurrency limit. Raising it may launch waiting
    /// invocations right away; lowering it never cancels running ones.
    pub fn set_concurrency_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(FlowError::configuration_field(
                "concurrency limit must be greater than 0",
                "concurrency",
            ));
        }
        self.inner.state.lock().limit = limit;
        debug!(node = %self.inner.name, limit, "Concurrency limit changed");
        self.inner.try_dispatch();
        Ok(())
    }

    /// Invocations launched but not yet retired
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Fires once per failed invocation, before the error is sent down the
    /// outputs. Nodes without outputs report failures only here.
    pub fn on_exception(&self) -> &Signal<Arc<FlowError>> {
        &self.inner.exceptions
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("inputs", &self.inner.inputs.len())
            .field("outputs", &self.inner.outputs.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl NodeInner {
    fn emit(&self, event: NodeEvent) {
        if let Some(sink) = &self.event_sink {
            sink.emit(&NodeEventEnvelope {
                node: self.name.clone(),
                sequence: self.event_sequence.fetch_add(1, Ordering::SeqCst),
                timestamp: chrono::Utc::now(),
                event,
            });
        }
    }

    /// Launches invocations for as long as the node stays eligible.
    ///
    /// Only one thread dispatches at a time; a check requested meanwhile is
    /// remembered and picked up by the active dispatcher.
    fn try_dispatch(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatching {
                state.redispatch = true;
                return;
            }
            state.dispatching = true;
        }

        loop {
            {
                let mut state = self.state.lock();
                state.redispatch = false;
                if state.in_flight.len() >= state.limit {
                    state.dispatching = false;
                    return;
                }
            }

            if self.launch_next() {
                continue;
            }

            let mut state = self.state.lock();
            if !state.redispatch {
                state.dispatching = false;
                return;
            }
        }
    }

    /// Takes one argument set and hands it to the pool. Returns false when
    /// some input is still empty.
    fn launch_next(self: &Arc<Self>) -> bool {
        if !self.inputs.iter().all(|input| input.is_value_ready()) {
            return false;
        }

        // Refills triggered by the takes below must not start a dispatch
        // check per slot.
        for input in &self.inputs {
            input.set_silenced(true);
        }
        let args: Vec<Value> = self
            .inputs
            .iter()
            .filter_map(|input| input.try_take_value())
            .collect();
        let sequence = (args.len() == self.inputs.len()).then(|| {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.in_flight.insert(sequence, Invocation::default());
            sequence
        });
        for input in &self.inputs {
            input.set_silenced(false);
        }

        let Some(sequence) = sequence else {
            error!(
                node = %self.name,
                taken = args.len(),
                "Input drained outside the scheduler, partial argument set dropped"
            );
            return false;
        };

        debug!(node = %self.name, sequence, args = %ArgumentList(&args), "Launching invocation");
        self.emit(NodeEvent::InvocationLaunched { sequence });

        let node = Arc::clone(self);
        self.pool.spawn(move || node.run(sequence, args));
        true
    }

    /// Body of one invocation, executed on the worker pool
    fn run(self: Arc<Self>, sequence: u64, args: Vec<Value>) {
        let snapshot = args.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.function.invoke(args)));

        let error = match outcome {
            Ok(Ok(values)) => match self.check_outputs(&values) {
                None => {
                    self.attempt_publish(sequence, values);
                    return;
                }
                Some(message) => FlowError::execution(&self.name, message, snapshot),
            },
            Ok(Err(err)) => FlowError::execution_with_source(&self.name, snapshot, err),
            Err(payload) => {
                FlowError::execution(&self.name, panic_message(payload.as_ref()), snapshot)
            }
        };
        self.fail(sequence, Arc::new(error));
    }

    /// Describes how `values` disagrees with the declared outputs, if it does
    fn check_outputs(&self, values: &[Value]) -> Option<String> {
        if values.len() != self.outputs.len() {
            return Some(format!(
                "produced {} values for {} outputs",
                values.len(),
                self.outputs.len()
            ));
        }
        self.outputs
            .iter()
            .zip(values)
            .find(|(output, value)| output.value_type() != value_type_of(value))
            .map(|(output, value)| {
                format!(
                    "output {} expects {}, got {}",
                    output.index(),
                    output.value_type(),
                    value_type_of(value)
                )
            })
    }

    fn fail(self: &Arc<Self>, sequence: u64, error: Arc<FlowError>) {
        warn!(
            node = %self.name,
            sequence,
            args = %ArgumentList(error.arguments()),
            "Invocation failed: {}",
            error
        );
        self.emit(NodeEvent::InvocationFailed {
            sequence,
            message: error.to_string(),
        });
        self.exceptions.emit(&error);
        if self.outputs.is_empty() && self.exceptions.subscriber_count() == 0 {
            warn!(node = %self.name, "Node has no outputs or exception subscribers, execution error not delivered");
        }
        for output in &self.outputs {
            output.notify_exception(&error);
        }
        // Nothing was produced, so there is nothing to keep in order
        self.retire(sequence);
    }

    /// Publishes `values` unless an earlier invocation is still in flight,
    /// in which case the publish is parked on that invocation.
    fn attempt_publish(self: &Arc<Self>, sequence: u64, values: Vec<Value>) {
        let ready = {
            let mut state = self.state.lock();
            match state.in_flight.range_mut(..sequence).next_back() {
                Some((&predecessor, invocation)) => {
                    let node = Arc::clone(self);
                    invocation.on_retired.push((
                        sequence,
                        Box::new(move || node.attempt_publish(sequence, values)),
                    ));
                    Err(predecessor)
                }
                None => Ok(values),
            }
        };

        match ready {
            Ok(values) => self.publish(sequence, values),
            Err(predecessor) => {
                debug!(node = %self.name, sequence, predecessor, "Publish deferred");
                self.emit(NodeEvent::PublishDeferred {
                    sequence,
                    predecessor,
                });
            }
        }
    }

    fn publish(self: &Arc<Self>, sequence: u64, values: Vec<Value>) {
        let mut pending = Vec::new();
        for (output, value) in self.outputs.iter().zip(values) {
            if let Err(value) = output.try_push(value) {
                if output.discard_if_locked() {
                    debug!(node = %self.name, sequence, output = output.index(), "Output locked, value discarded");
                } else {
                    pending.push((Arc::clone(output), value));
                }
            }
        }

        if pending.is_empty() {
            debug!(node = %self.name, sequence, "Published");
            self.emit(NodeEvent::Published { sequence });
            self.retire(sequence);
            return;
        }

        let locked: Vec<usize> = pending.iter().map(|(output, _)| output.index()).collect();
        debug!(node = %self.name, sequence, ?locked, "Outputs locked, waiting for room");
        self.emit(NodeEvent::Backpressure {
            sequence,
            outputs: locked,
        });
        PendingPublish::start(Arc::clone(self), sequence, pending);
    }

    /// Drops the invocation, resumes publishes parked on it in launch order,
    /// then looks for more work.
    fn retire(self: &Arc<Self>, sequence: u64) {
        let mut parked = {
            let mut state = self.state.lock();
            match state.in_flight.remove(&sequence) {
                Some(invocation) => invocation.on_retired,
                None => {
                    error!(node = %self.name, sequence, "Retiring an invocation that is not in flight");
                    Vec::new()
                }
            }
        };
        self.emit(NodeEvent::InvocationRetired { sequence });

        parked.sort_by_key(|(later, _)| *later);
        for (_, resume) in parked {
            resume();
        }
        self.try_dispatch();
    }
}

/// Values of one invocation waiting for their outputs to unlock
struct PendingPublish {
    node: Arc<NodeInner>,
    sequence: u64,
    state: Mutex<PendingState>,
}

struct PendingState {
    items: Vec<(Arc<NodeOutput>, Value)>,
    subscriptions: Vec<(Arc<NodeOutput>, SubscriptionId)>,
    retrying: bool,
    again: bool,
    done: bool,
}

impl PendingPublish {
    fn start(node: Arc<NodeInner>, sequence: u64, items: Vec<(Arc<NodeOutput>, Value)>) {
        let mut outputs: Vec<Arc<NodeOutput>> = Vec::new();
        for (output, _) in &items {
            if !outputs.iter().any(|known| Arc::ptr_eq(known, output)) {
                outputs.push(Arc::clone(output));
            }
        }

        let pending = Arc::new(PendingPublish {
            node,
            sequence,
            state: Mutex::new(PendingState {
                items,
                subscriptions: Vec::new(),
                // Unlocks arriving before the first retry only mark it dirty
                retrying: true,
                again: false,
                done: false,
            }),
        });

        let subscriptions = outputs
            .into_iter()
            .map(|output| {
                let retry = Arc::clone(&pending);
                let id = output.on_unlocked().subscribe(move |_| retry.retry());
                (output, id)
            })
            .collect();
        {
            let mut state = pending.state.lock();
            state.subscriptions = subscriptions;
            state.retrying = false;
            state.again = false;
        }
        pending.retry();
    }

    /// Pushes whatever fits. Single-flight: an unlock arriving mid-retry
    /// makes the active retry run once more.
    fn retry(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            if state.retrying {
                state.again = true;
                return;
            }
            state.retrying = true;
        }

        loop {
            let items = {
                let mut state = self.state.lock();
                state.again = false;
                std::mem::take(&mut state.items)
            };

            let mut left = Vec::new();
            for (output, value) in items {
                if let Err(value) = output.try_push(value) {
                    if output.discard_if_locked() {
                        debug!(node = %self.node.name, sequence = self.sequence, output = output.index(), "Output locked, value discarded");
                    } else {
                        left.push((output, value));
                    }
                }
            }

            let subscriptions = {
                let mut state = self.state.lock();
                state.items = left;
                if !state.items.is_empty() {
                    if state.again {
                        continue;
                    }
                    state.retrying = false;
                    return;
                }
                state.done = true;
                state.retrying = false;
                std::mem::take(&mut state.subscriptions)
            };

            for (output, id) in subscriptions {
                output.on_unlocked().unsubscribe(id);
            }
            debug!(node = %self.node.name, sequence = self.sequence, "Deferred values published");
            self.node.emit(NodeEvent::Published {
                sequence: self.sequence,
            });
            self.node.retire(self.sequence);
            return;
        }
    }
}
