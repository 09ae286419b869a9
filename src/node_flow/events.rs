//! Node lifecycle events
//!
//! Nodes built with an [`EventSink`] report every step an invocation goes
//! through, numbered per node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Steps of an invocation's life, keyed by its launch sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEvent {
    InvocationLaunched {
        sequence: u64,
    },
    /// Results are ready but an earlier invocation has not retired yet
    PublishDeferred {
        sequence: u64,
        predecessor: u64,
    },
    Published {
        sequence: u64,
    },
    /// Some outputs were locked; their values wait for room
    Backpressure {
        sequence: u64,
        outputs: Vec<usize>,
    },
    InvocationFailed {
        sequence: u64,
        message: String,
    },
    InvocationRetired {
        sequence: u64,
    },
}

impl NodeEvent {
    /// Stable name of the event, as used in the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvocationLaunched { .. } => "invocation_launched",
            Self::PublishDeferred { .. } => "publish_deferred",
            Self::Published { .. } => "published",
            Self::Backpressure { .. } => "backpressure",
            Self::InvocationFailed { .. } => "invocation_failed",
            Self::InvocationRetired { .. } => "invocation_retired",
        }
    }

    pub fn invocation(&self) -> u64 {
        match self {
            Self::InvocationLaunched { sequence }
            | Self::PublishDeferred { sequence, .. }
            | Self::Published { sequence }
            | Self::Backpressure { sequence, .. }
            | Self::InvocationFailed { sequence, .. }
            | Self::InvocationRetired { sequence } => *sequence,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEventEnvelope {
    pub node: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: NodeEvent,
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &NodeEventEnvelope);
}

/// A simple logging event sink
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &NodeEventEnvelope) {
        tracing::debug!(
            node = %envelope.node,
            sequence = envelope.sequence,
            "Event: {:?}",
            envelope.event
        );
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: Arc<parking_lot::RwLock<Vec<NodeEventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<NodeEventEnvelope> {
        self.events.read().clone()
    }

    /// Events of one invocation, in emission order
    pub fn events_for(&self, invocation: u64) -> Vec<NodeEvent> {
        self.events
            .read()
            .iter()
            .filter(|envelope| envelope.event.invocation() == invocation)
            .map(|envelope| envelope.event.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &NodeEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}
