use std::fmt;
use thiserror::Error;

use crate::any::Value;

/// Unified error type for the whole nodeflow library
#[derive(Debug, Error)]
pub enum FlowError {
    /// A source, output or terminator was wired to a port of another type
    #[error("Type mismatch in {context}: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
        context: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A node function failed (returned an error or panicked)
    #[error("Execution failed in {node}: {message}")]
    Execution {
        node: String,
        message: String,
        arguments: Vec<Value>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FlowError {
    /// Create a type mismatch error
    pub fn type_mismatch<S: Into<String>>(
        expected: &'static str,
        actual: &'static str,
        context: S,
    ) -> Self {
        Self::TypeMismatch {
            expected,
            actual,
            context: context.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error for a named field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an execution error carrying the invocation's arguments
    pub fn execution<N: Into<String>, M: Into<String>>(
        node: N,
        message: M,
        arguments: Vec<Value>,
    ) -> Self {
        Self::Execution {
            node: node.into(),
            message: message.into(),
            arguments,
            source: None,
        }
    }

    /// Create an execution error from the error a node function returned
    pub fn execution_with_source<N: Into<String>>(
        node: N,
        arguments: Vec<Value>,
        source: anyhow::Error,
    ) -> Self {
        Self::Execution {
            node: node.into(),
            message: format!("{:#}", source),
            arguments,
            source: Some(source.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Name of the failed node, for execution errors
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Execution { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Argument snapshot of the failed invocation, for execution errors
    pub fn arguments(&self) -> &[Value] {
        match self {
            Self::Execution { arguments, .. } => arguments,
            _ => &[],
        }
    }

    /// Wiring and construction errors, raised synchronously and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. } | Self::Configuration { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Configuration { .. } => "configuration",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FlowError>;

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

/// Renders a panic payload caught from a node function
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// Compact `(a, b, c)` rendering of an argument snapshot
pub struct ArgumentList<'a>(pub &'a [Value]);

impl fmt::Display for ArgumentList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", value)?;
        }
        write!(f, ")")
    }
}
