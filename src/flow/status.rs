//! Per-node status tracking and the transitions that drive it.
//!
//! Legal transitions: pending -> executing -> {completed, failed}, or
//! pending -> skipped. Terminal statuses are immutable; anything else is a
//! loud contract violation. Execution is complete exactly when no node is
//! pending or executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::core::errors::{MaestroError, Result};
use crate::flow::cascade;
use crate::flow::graph::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// A dependency in this status no longer blocks its dependents. A
    /// skipped dependency unblocks exactly as a completed one does; whether
    /// the dependent references the absent output is a dispatcher concern.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one node across an execution.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeState {
    fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Aggregate status counts, for logging and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Mutable execution state for one run over an immutable [`Graph`].
///
/// Owned and sequentially updated by the orchestration loop; the viable
/// incoming-edge counts back the reachability cascade.
#[derive(Debug)]
pub struct ExecutionState {
    pub(crate) states: HashMap<String, NodeState>,
    /// Node ids in graph definition order; the deterministic readiness
    /// tie-break.
    pub(crate) order: Vec<String>,
    /// Count of incoming edges not yet foreclosed, per node.
    pub(crate) viable_incoming: HashMap<String, usize>,
    /// Indices into `graph.edges()` already counted as foreclosed.
    pub(crate) foreclosed: HashSet<usize>,
}

impl ExecutionState {
    /// Every node starts pending, with its full incoming edge count viable.
    pub fn new(graph: &Graph) -> Self {
        let mut states = HashMap::with_capacity(graph.node_count());
        let mut order = Vec::with_capacity(graph.node_count());
        let mut viable_incoming = HashMap::with_capacity(graph.node_count());
        for node in graph.nodes() {
            states.insert(node.id.clone(), NodeState::pending());
            order.push(node.id.clone());
            viable_incoming.insert(node.id.clone(), graph.incoming_edges(&node.id).len());
        }
        Self {
            states,
            order,
            viable_incoming,
            foreclosed: HashSet::new(),
        }
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.states.get(id).map(|s| s.status)
    }

    pub fn node_state(&self, id: &str) -> Option<&NodeState> {
        self.states.get(id)
    }

    /// Up to `limit` pending nodes whose every dependency is terminal
    /// completed-or-skipped, in graph definition order. Identical state
    /// always yields the identical list.
    pub fn ready_nodes(&self, graph: &Graph, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }
        self.order
            .iter()
            .filter(|id| self.status(id.as_str()) == Some(NodeStatus::Pending))
            .filter(|id| {
                graph
                    .node(id.as_str())
                    .map(|node| {
                        node.dependencies
                            .iter()
                            .all(|dep| self.status(dep).is_some_and(|s| s.unblocks_dependents()))
                    })
                    .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Transition the listed pending nodes to executing.
    pub fn mark_executing(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            let state = self.require(id)?;
            if state.status != NodeStatus::Pending {
                return Err(MaestroError::invalid_transition(
                    id.clone(),
                    state.status,
                    NodeStatus::Executing,
                ));
            }
        }
        let now = Utc::now();
        for id in ids {
            let state = self.states.get_mut(id).unwrap();
            state.status = NodeStatus::Executing;
            state.started_at = Some(now);
        }
        Ok(())
    }

    /// Transition an executing node to completed. The caller must have
    /// stored the node's output into the evaluation context first, so any
    /// dependent becoming ready afterward can resolve references to it.
    pub fn mark_completed(&mut self, id: &str) -> Result<()> {
        let state = self.require(id)?;
        if state.status != NodeStatus::Executing {
            return Err(MaestroError::invalid_transition(
                id,
                state.status,
                NodeStatus::Completed,
            ));
        }
        let state = self.states.get_mut(id).unwrap();
        state.status = NodeStatus::Completed;
        state.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Transition an executing node to failed, then cascade skips into every
    /// descendant left without a viable incoming path. Returns the ids
    /// skipped by the cascade, in the order they were skipped.
    pub fn mark_failed(
        &mut self,
        id: &str,
        error: impl Into<String>,
        graph: &Graph,
    ) -> Result<Vec<String>> {
        let state = self.require(id)?;
        if state.status != NodeStatus::Executing {
            return Err(MaestroError::invalid_transition(
                id,
                state.status,
                NodeStatus::Failed,
            ));
        }
        let error = error.into();
        debug!(node = id, error = %error, "node failed");
        let state = self.states.get_mut(id).unwrap();
        state.status = NodeStatus::Failed;
        state.error = Some(error);
        state.finished_at = Some(Utc::now());
        Ok(cascade::foreclose_outgoing(self, graph, id))
    }

    /// Transition a not-yet-executing node to skipped, then cascade as for a
    /// failure. Returns the ids additionally skipped by the cascade.
    pub fn mark_skipped(&mut self, id: &str, graph: &Graph) -> Result<Vec<String>> {
        let state = self.require(id)?;
        if state.status != NodeStatus::Pending {
            return Err(MaestroError::invalid_transition(
                id,
                state.status,
                NodeStatus::Skipped,
            ));
        }
        let state = self.states.get_mut(id).unwrap();
        state.status = NodeStatus::Skipped;
        state.finished_at = Some(Utc::now());
        Ok(cascade::foreclose_outgoing(self, graph, id))
    }

    /// True iff no node remains pending or executing.
    pub fn is_complete(&self) -> bool {
        self.states.values().all(|s| s.status.is_terminal())
    }

    pub fn executing_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.status == NodeStatus::Executing)
            .count()
    }

    /// Non-terminal node ids, in definition order. Used for deadlock reports.
    pub fn remaining(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !self.states[*id].status.is_terminal())
            .cloned()
            .collect()
    }

    /// Failed node ids with their recorded errors, in definition order.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.order
            .iter()
            .filter_map(|id| {
                let state = &self.states[id];
                if state.status == NodeStatus::Failed {
                    Some((id.clone(), state.error.clone().unwrap_or_default()))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for state in self.states.values() {
            match state.status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Executing => counts.executing += 1,
                NodeStatus::Completed => counts.completed += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    fn require(&self, id: &str) -> Result<&NodeState> {
        self.states
            .get(id)
            .ok_or_else(|| MaestroError::node_not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::builder::WorkflowBuilder;
    use crate::flow::graph::NodeKind;
    use pretty_assertions::assert_eq;

    fn chain() -> Graph {
        WorkflowBuilder::new("chain")
            .node("in", NodeKind::Input)
            .node("t1", NodeKind::Transform)
            .node("t2", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("in", "t1")
            .edge("t1", "t2")
            .edge("t2", "out")
            .build()
            .unwrap()
    }

    fn fan_out() -> Graph {
        WorkflowBuilder::new("fan_out")
            .node("in", NodeKind::Input)
            .node("a", NodeKind::Transform)
            .node("b", NodeKind::Transform)
            .node("c", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("in", "a")
            .edge("in", "b")
            .edge("in", "c")
            .edge("a", "out")
            .edge("b", "out")
            .edge("c", "out")
            .build()
            .unwrap()
    }

    #[test]
    fn test_initialize_all_pending() {
        let graph = chain();
        let state = ExecutionState::new(&graph);

        for node in graph.nodes() {
            assert_eq!(state.status(&node.id), Some(NodeStatus::Pending));
        }
        assert!(!state.is_complete());
        assert_eq!(state.counts().pending, 4);
    }

    #[test]
    fn test_only_trigger_ready_initially() {
        let graph = chain();
        let state = ExecutionState::new(&graph);

        assert_eq!(state.ready_nodes(&graph, 10), vec!["in"]);
    }

    #[test]
    fn test_ready_respects_limit_and_definition_order() {
        let graph = fan_out();
        let mut state = ExecutionState::new(&graph);
        state.mark_executing(&["in".to_string()]).unwrap();
        state.mark_completed("in").unwrap();

        assert_eq!(state.ready_nodes(&graph, 2), vec!["a", "b"]);
        assert_eq!(state.ready_nodes(&graph, 10), vec!["a", "b", "c"]);
        assert!(state.ready_nodes(&graph, 0).is_empty());
        // Identical state, identical answer.
        assert_eq!(state.ready_nodes(&graph, 2), state.ready_nodes(&graph, 2));
    }

    #[test]
    fn test_readiness_is_monotone() {
        let graph = fan_out();
        let mut state = ExecutionState::new(&graph);
        state.mark_executing(&["in".to_string()]).unwrap();
        state.mark_completed("in").unwrap();

        let before: Vec<String> = state.ready_nodes(&graph, 10);
        state.mark_executing(&["a".to_string()]).unwrap();
        state.mark_completed("a").unwrap();
        let after = state.ready_nodes(&graph, 10);

        for id in before {
            // Once ready, a node stays ready until dispatched.
            assert!(id == "a" || after.contains(&id));
        }
    }

    #[test]
    fn test_skipped_dependency_unblocks_dependent() {
        let graph = WorkflowBuilder::new("fan_in")
            .node("in", NodeKind::Input)
            .node("t1", NodeKind::Transform)
            .node("t2", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("in", "t1")
            .edge("in", "t2")
            .edge("t1", "out")
            .edge("t2", "out")
            .build()
            .unwrap();
        let mut state = ExecutionState::new(&graph);
        state.mark_executing(&["in".to_string()]).unwrap();
        state.mark_completed("in").unwrap();
        state.mark_executing(&["t1".to_string()]).unwrap();
        state.mark_completed("t1").unwrap();

        // t2 skipped: out keeps its viable path through t1 and the skipped
        // dependency unblocks it exactly as a completed one would.
        let skipped = state.mark_skipped("t2", &graph).unwrap();
        assert!(skipped.is_empty());
        assert_eq!(state.ready_nodes(&graph, 10), vec!["out"]);
    }

    #[test]
    fn test_invalid_transitions_fail_loudly() {
        let graph = chain();
        let mut state = ExecutionState::new(&graph);

        let err = state.mark_completed("in").unwrap_err();
        assert!(matches!(err, MaestroError::InvalidTransition { .. }));

        state.mark_executing(&["in".to_string()]).unwrap();
        let err = state.mark_executing(&["in".to_string()]).unwrap_err();
        assert!(matches!(err, MaestroError::InvalidTransition { .. }));

        state.mark_completed("in").unwrap();
        let err = state.mark_skipped("in", &graph).unwrap_err();
        assert!(matches!(err, MaestroError::InvalidTransition { .. }));

        let err = state.mark_completed("ghost").unwrap_err();
        assert!(matches!(err, MaestroError::NodeNotFound(_)));
    }

    #[test]
    fn test_failed_terminal_is_immutable() {
        let graph = chain();
        let mut state = ExecutionState::new(&graph);
        state.mark_executing(&["in".to_string()]).unwrap();
        state.mark_failed("in", "boom", &graph).unwrap();

        assert_eq!(state.status("in"), Some(NodeStatus::Failed));
        assert!(state.mark_completed("in").is_err());
        assert_eq!(state.failures(), vec![("in".to_string(), "boom".to_string())]);
    }

    #[test]
    fn test_is_complete_when_all_terminal() {
        let graph = chain();
        let mut state = ExecutionState::new(&graph);
        state.mark_executing(&["in".to_string()]).unwrap();

        // A failure at the trigger forecloses everything downstream.
        let skipped = state.mark_failed("in", "boom", &graph).unwrap();
        assert_eq!(skipped, vec!["t1", "t2", "out"]);
        assert!(state.is_complete());
        assert_eq!(state.executing_count(), 0);
        assert!(state.remaining().is_empty());
    }
}
