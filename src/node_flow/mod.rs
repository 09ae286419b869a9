pub mod events;
pub mod function;
pub mod input;
pub mod node;
pub mod output;
pub mod pool;
pub mod queue;
pub mod signal;
pub mod source;
pub mod terminator;

pub use events::{BufferingEventSink, EventSink, LoggingEventSink, NodeEvent, NodeEventEnvelope};
pub use function::{
    signature_name, Arguments, IntoFallibleNodeFunction, IntoNodeFunction, NodeFunction,
    PortFunction,
};
pub use input::NodeInput;
pub use node::{Node, NodeBuilder};
pub use output::NodeOutput;
pub use pool::WorkerPool;
pub use queue::NotifyingQueue;
pub use signal::{Signal, SubscriptionId};
pub use source::{ConstSource, EnumerableSource, OutputSource, ValueSource};
pub use terminator::OutputTerminator;
