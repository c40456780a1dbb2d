//! The orchestration loop.
//!
//! Repeatedly queries the status machine for ready nodes under the
//! concurrency cap, fans them out to the dispatcher, folds each settlement
//! back into the evaluation context and status machine, applies route
//! pruning after switch nodes, and stops at completion or deadlock. The cap
//! bounds total nodes in flight across the entire graph at any instant.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::errors::{MaestroError, Result};
use crate::flow::cascade;
use crate::flow::context::{final_outputs, EvaluationContext};
use crate::flow::dispatch::{DispatchMetadata, NodeDispatcher};
use crate::flow::events::{
    next_sequence, EventSink, TransitionEnvelope, TransitionEvent,
};
use crate::flow::graph::{Graph, DEFAULT_ROUTE};
use crate::flow::status::{ExecutionState, NodeStatus};

/// Terminal record for one node in a finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub node_id: String,
    pub status: NodeStatus,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Result surface handed back to the caller; the engine never serializes or
/// transmits it.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub workflow: String,
    pub success: bool,
    /// Shallow merge of the designated output nodes' stored outputs.
    pub final_outputs: Value,
    pub outcomes: Vec<NodeOutcome>,
    /// Failed node ids with their errors, in definition order.
    pub failed: Vec<(String, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

type Settlement = (String, std::result::Result<Value, String>, u64);

/// Drives a [`Graph`] to completion through a [`NodeDispatcher`].
pub struct Scheduler {
    dispatcher: Arc<dyn NodeDispatcher>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<dyn NodeDispatcher>) -> Self {
        Self {
            dispatcher,
            sinks: Vec::new(),
        }
    }

    /// Attach a sink notified synchronously on every status transition.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Execute the workflow with the given trigger inputs.
    ///
    /// Node-level dispatcher failures are folded into the report and
    /// confined by the skip cascade; `Err` is reserved for fatal conditions
    /// (deadlock, contract violations).
    #[instrument(skip_all, fields(workflow = %graph.name()))]
    pub async fn execute(&self, graph: &Graph, inputs: Value) -> Result<ExecutionReport> {
        let run_id = format!("run_{}", Uuid::new_v4());
        let started_at = Utc::now();
        let context = Arc::new(EvaluationContext::with_variables(
            inputs,
            graph.variables().clone(),
        ));
        let mut state = ExecutionState::new(graph);
        let mut in_flight: FuturesUnordered<JoinHandle<Settlement>> = FuturesUnordered::new();

        info!(run_id = %run_id, nodes = graph.node_count(), cap = graph.concurrency(), "execution started");
        self.emit(
            &run_id,
            TransitionEvent::ExecutionStarted {
                workflow: graph.name().to_string(),
            },
        );

        while !state.is_complete() {
            let capacity = graph.concurrency().saturating_sub(in_flight.len());
            let ready = state.ready_nodes(graph, capacity);

            if ready.is_empty() && in_flight.is_empty() {
                let remaining = state.remaining();
                error!(run_id = %run_id, ?remaining, "deadlock: no runnable nodes remain");
                return Err(MaestroError::deadlock(remaining));
            }

            state.mark_executing(&ready)?;
            for id in &ready {
                let node = graph
                    .node(id)
                    .ok_or_else(|| MaestroError::node_not_found(id.clone()))?;
                debug!(run_id = %run_id, node = %id, kind = %node.kind, in_flight = in_flight.len() + 1, "launching node");
                self.emit(
                    &run_id,
                    TransitionEvent::NodeStarted {
                        node_id: id.clone(),
                        kind: node.kind,
                    },
                );

                let dispatcher = self.dispatcher.clone();
                let context = context.clone();
                let meta = DispatchMetadata {
                    node_id: id.clone(),
                    node_name: node.name.clone(),
                    run_id: run_id.clone(),
                    workflow: graph.name().to_string(),
                };
                let kind = node.kind;
                let config = node.config.clone();
                in_flight.push(tokio::spawn(async move {
                    let clock = Instant::now();
                    let result = dispatcher
                        .execute(kind, &config, &context, &meta)
                        .await
                        .map_err(|e| format!("{e:#}"));
                    (meta.node_id, result, clock.elapsed().as_millis() as u64)
                }));
            }

            // Wait for any dispatched node to settle before re-evaluating
            // readiness.
            let Some(joined) = in_flight.next().await else {
                continue;
            };
            let (node_id, result, duration_ms) = joined
                .map_err(|e| MaestroError::internal(format!("node task aborted: {e}")))?;

            match result {
                Ok(output) => {
                    let route = graph
                        .node(&node_id)
                        .filter(|n| n.kind.is_switch())
                        .map(|_| selected_route(&output));
                    context.store_output(&node_id, output)?;
                    state.mark_completed(&node_id)?;
                    debug!(run_id = %run_id, node = %node_id, duration_ms, "node completed");
                    self.emit(
                        &run_id,
                        TransitionEvent::NodeCompleted {
                            node_id: node_id.clone(),
                            duration_ms,
                        },
                    );
                    if let Some(route) = route {
                        let skipped = cascade::apply_route(&mut state, graph, &node_id, &route)?;
                        self.emit_skips(&run_id, skipped);
                    }
                }
                Err(message) => {
                    warn!(run_id = %run_id, node = %node_id, error = %message, "node failed");
                    let skipped = state.mark_failed(&node_id, message.clone(), graph)?;
                    self.emit(
                        &run_id,
                        TransitionEvent::NodeFailed {
                            node_id: node_id.clone(),
                            error: message,
                        },
                    );
                    self.emit_skips(&run_id, skipped);
                }
            }
        }

        let finished_at = Utc::now();
        let failed = state.failures();
        let delivered = graph
            .outputs()
            .iter()
            .any(|id| state.status(id) == Some(NodeStatus::Completed));
        let success = failed.is_empty() && delivered;
        let report = ExecutionReport {
            final_outputs: final_outputs(&context, graph.outputs()),
            outcomes: outcomes(&state),
            success,
            failed,
            run_id: run_id.clone(),
            workflow: graph.name().to_string(),
            started_at,
            finished_at,
        };

        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        info!(run_id = %run_id, success, ?duration_ms, counts = ?state.counts(), "execution finished");
        self.emit(
            &run_id,
            TransitionEvent::ExecutionCompleted {
                success,
                duration_ms,
            },
        );
        Ok(report)
    }

    fn emit(&self, run_id: &str, event: TransitionEvent) {
        if self.sinks.is_empty() {
            return;
        }
        let envelope = TransitionEnvelope {
            sequence: next_sequence(),
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            event,
        };
        for sink in &self.sinks {
            sink.emit(&envelope);
        }
    }

    fn emit_skips(&self, run_id: &str, skipped: Vec<String>) {
        for node_id in skipped {
            self.emit(run_id, TransitionEvent::NodeSkipped { node_id });
        }
    }
}

/// A switch output's routing decision, falling back to the default route.
fn selected_route(output: &Value) -> String {
    output
        .get("selectedRoute")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ROUTE)
        .to_string()
}

/// Terminal per-node records, in graph definition order.
fn outcomes(state: &ExecutionState) -> Vec<NodeOutcome> {
    state
        .order
        .iter()
        .map(|id| {
            let node_state = &state.states[id];
            let duration_ms = match (node_state.started_at, node_state.finished_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
                _ => None,
            };
            NodeOutcome {
                node_id: id.clone(),
                status: node_state.status,
                error: node_state.error.clone(),
                duration_ms,
            }
        })
        .collect()
}
