//! Immutable graph model for workflow execution.
//!
//! A [`Graph`] is built once by the [`builder`](crate::flow::builder) from an
//! externally authored workflow definition and is never mutated while the
//! scheduler drives it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Route label used when a switch input matches none of the configured cases.
pub const DEFAULT_ROUTE: &str = "default";

/// Closed set of node kinds the engine recognizes.
///
/// The scheduler only gives special treatment to `input` (trigger), `output`
/// (result surface) and `switch` (conditional routing); every other kind is
/// opaque and reaches the engine solely through the dispatcher contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Input,
    Output,
    Transform,
    Switch,
    Http,
    Llm,
    Database,
    File,
    Integration,
    Embeddings,
    #[serde(rename = "knowledge-lookup")]
    KnowledgeLookup,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Transform => "transform",
            Self::Switch => "switch",
            Self::Http => "http",
            Self::Llm => "llm",
            Self::Database => "database",
            Self::File => "file",
            Self::Integration => "integration",
            Self::Embeddings => "embeddings",
            Self::KnowledgeLookup => "knowledge-lookup",
        }
    }

    pub fn is_switch(&self) -> bool {
        matches!(self, Self::Switch)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distinguishes ordinary data flow from conditional branch edges.
///
/// A switch node has one `Branch` edge per configured case plus a
/// `Branch(DEFAULT_ROUTE)` edge for the fall-through route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeHandle {
    /// Ordinary data-flow edge, never pruned by routing.
    Data,
    /// Conditional branch labelled with a switch case (or `DEFAULT_ROUTE`).
    Branch(String),
}

impl EdgeHandle {
    /// Parse the raw handle string of an edge definition. Absent handles and
    /// the literal `"data"` are ordinary edges; anything else is a branch
    /// label.
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            None | Some("") | Some("data") => Self::Data,
            Some(other) => Self::Branch(other.to_string()),
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Branch(_))
    }

    /// The branch label, if this is a branch edge.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Data => None,
            Self::Branch(label) => Some(label),
        }
    }
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: String,
    /// The operation kind, dispatched externally.
    pub kind: NodeKind,
    /// Human-readable name.
    pub name: String,
    /// Opaque configuration handed to the dispatcher.
    pub config: Value,
    /// Topological depth: longest dependency chain from the trigger.
    pub depth: usize,
    /// Node ids this node depends on (deduplicated, definition order).
    pub dependencies: Vec<String>,
    /// Node ids depending on this node; exact transpose of `dependencies`.
    pub dependents: Vec<String>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub source_port: Option<String>,
    pub target_port: Option<String>,
    pub handle: EdgeHandle,
}

/// Build-once, read-only representation of a workflow.
///
/// Node order is definition order and doubles as the deterministic tie-break
/// for readiness queries. `levels` is diagnostic only; the scheduler never
/// gates execution on it.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    incoming: HashMap<String, Vec<usize>>,
    outgoing: HashMap<String, Vec<usize>>,
    levels: Vec<Vec<String>>,
    trigger: String,
    outputs: Vec<String>,
    variables: HashMap<String, Value>,
    loops: HashMap<String, Value>,
    concurrency: usize,
}

impl Graph {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        levels: Vec<Vec<String>>,
        trigger: String,
        outputs: Vec<String>,
        variables: HashMap<String, Value>,
        loops: HashMap<String, Value>,
        concurrency: usize,
    ) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            incoming.entry(edge.target.clone()).or_default().push(i);
            outgoing.entry(edge.source.clone()).or_default().push(i);
        }

        Self {
            name,
            nodes,
            index,
            edges,
            incoming,
            outgoing,
            levels,
            trigger,
            outputs,
            variables,
            loops,
            concurrency,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Indices into [`Graph::edges`] for edges arriving at `id`.
    pub fn incoming_edges(&self, id: &str) -> &[usize] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Indices into [`Graph::edges`] for edges leaving `id`.
    pub fn outgoing_edges(&self, id: &str) -> &[usize] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Diagnostic topological grouping by depth.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Id of the single trigger node.
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    /// Ids of the designated output nodes, in definition order.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Initial named variables for the evaluation context.
    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Opaque loop-iteration metadata keyed by loop-owning node id.
    pub fn loops(&self) -> &HashMap<String, Value> {
        &self.loops
    }

    /// Global bound on nodes in flight at any instant. Always positive.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}
