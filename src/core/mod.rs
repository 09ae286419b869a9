// Shared infrastructure used by every node_flow component

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{FlowConfig, QueueSizes};
pub use errors::{FlowError, Result};
