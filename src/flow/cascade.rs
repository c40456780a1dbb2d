//! Reachability-aware skip propagation.
//!
//! A descendant is skipped only once every upstream path into it has been
//! foreclosed; while any path remains viable the node stays eligible. The
//! bookkeeping is a per-node count of still-viable incoming edges: an edge
//! is foreclosed when its source fails, is skipped, or is a completed switch
//! whose selected route does not match the edge's branch label. A pending
//! node whose count reaches zero is skipped, and its own outgoing edges
//! foreclose recursively. The graph is acyclic, so this terminates, and
//! already-terminal nodes are never transitioned twice.

use chrono::Utc;
use std::collections::VecDeque;
use tracing::debug;

use crate::core::errors::{MaestroError, Result};
use crate::flow::graph::Graph;
use crate::flow::status::{ExecutionState, NodeStatus};

/// Foreclose every outgoing edge of a node that just became failed or
/// skipped. Returns the ids skipped by the cascade, in skip order.
pub(crate) fn foreclose_outgoing(
    state: &mut ExecutionState,
    graph: &Graph,
    node_id: &str,
) -> Vec<String> {
    foreclose_edges(state, graph, graph.outgoing_edges(node_id).to_vec())
}

/// Apply a completed switch node's route selection: every branch edge whose
/// label differs from `route` is foreclosed; the matching branch and any
/// ordinary data edges stay viable. Returns the ids skipped as a result.
pub fn apply_route(
    state: &mut ExecutionState,
    graph: &Graph,
    switch_id: &str,
    route: &str,
) -> Result<Vec<String>> {
    let node = graph
        .node(switch_id)
        .ok_or_else(|| MaestroError::node_not_found(switch_id))?;
    if !node.kind.is_switch() {
        return Err(MaestroError::internal(format!(
            "route selection applied to non-switch node '{switch_id}'"
        )));
    }

    let pruned: Vec<usize> = graph
        .outgoing_edges(switch_id)
        .iter()
        .copied()
        .filter(|&i| {
            graph.edges()[i]
                .handle
                .label()
                .is_some_and(|label| label != route)
        })
        .collect();

    debug!(
        switch = switch_id,
        route,
        pruned = pruned.len(),
        "applying switch route"
    );
    Ok(foreclose_edges(state, graph, pruned))
}

/// Core of the cascade: drain a queue of foreclosed edge indices, counting
/// each edge at most once, skipping any pending node left with zero viable
/// incoming edges and feeding its outgoing edges back into the queue.
fn foreclose_edges(state: &mut ExecutionState, graph: &Graph, seed: Vec<usize>) -> Vec<String> {
    let mut queue: VecDeque<usize> = seed.into();
    let mut skipped = Vec::new();

    while let Some(edge_idx) = queue.pop_front() {
        if !state.foreclosed.insert(edge_idx) {
            continue;
        }
        let target = &graph.edges()[edge_idx].target;
        let remaining = state
            .viable_incoming
            .get_mut(target)
            .expect("edge target tracked in execution state");
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            continue;
        }
        // Zero viable incoming paths: skip, unless the node already reached
        // a terminal status or is in flight.
        if state.states[target].status != NodeStatus::Pending {
            continue;
        }
        let target = target.clone();
        let node_state = state.states.get_mut(&target).unwrap();
        node_state.status = NodeStatus::Skipped;
        node_state.finished_at = Some(Utc::now());
        debug!(node = %target, "skipped: no viable incoming path remains");
        queue.extend(graph.outgoing_edges(&target));
        skipped.push(target);
    }

    skipped
}
