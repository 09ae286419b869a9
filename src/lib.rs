// Core infrastructure modules
pub mod core;

// Type-erased values travelling between ports
pub mod any;

// Nodes, ports and the scheduler
pub mod node_flow;

// Re-exports for convenience
pub use crate::any::{downcast, into_value, FlowValue, Value, ValueType};
pub use crate::core::config::{FlowConfig, QueueSizes};
pub use crate::core::errors::{FlowError, Result};
pub use crate::node_flow::*;
