//! Transition events emitted by the orchestration loop.
//!
//! Every node status change is observable in-process, synchronously with
//! the state change. Delivery over any wire protocol belongs to an external
//! streaming layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::flow::graph::NodeKind;
use crate::flow::status::NodeStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransitionEvent {
    ExecutionStarted {
        workflow: String,
    },
    NodeStarted {
        node_id: String,
        kind: NodeKind,
    },
    NodeCompleted {
        node_id: String,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: String,
        error: String,
    },
    NodeSkipped {
        node_id: String,
    },
    ExecutionCompleted {
        success: bool,
        duration_ms: u64,
    },
}

impl TransitionEvent {
    /// The node status this event witnesses, if it is a node-level event.
    pub fn node_status(&self) -> Option<(&str, NodeStatus)> {
        match self {
            Self::NodeStarted { node_id, .. } => Some((node_id, NodeStatus::Executing)),
            Self::NodeCompleted { node_id, .. } => Some((node_id, NodeStatus::Completed)),
            Self::NodeFailed { node_id, .. } => Some((node_id, NodeStatus::Failed)),
            Self::NodeSkipped { node_id } => Some((node_id, NodeStatus::Skipped)),
            _ => None,
        }
    }
}

/// Event envelope with ordering and run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEnvelope {
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: TransitionEvent,
}

static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Sink for transition events; `emit` is called synchronously with each
/// status change and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &TransitionEnvelope);
}

/// Sink that forwards envelopes to the tracing subscriber.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, envelope: &TransitionEnvelope) {
        tracing::debug!(
            sequence = envelope.sequence,
            run_id = %envelope.run_id,
            event = ?envelope.event,
            "transition"
        );
    }
}

/// Sink that buffers envelopes; used by tests to assert transition order.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TransitionEnvelope>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransitionEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, envelope: &TransitionEnvelope) {
        self.events.lock().unwrap().push(envelope.clone());
    }
}
