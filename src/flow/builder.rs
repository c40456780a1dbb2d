//! Build-once graph construction.
//!
//! Transforms an externally authored [`WorkflowDefinition`] (JSON or YAML)
//! into the immutable [`Graph`] the scheduler consumes, enforcing the
//! structural invariants: single trigger, at least one output, no dangling
//! edges, acyclic, mutually consistent dependency/dependent sets.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::core::errors::{MaestroError, Result};
use crate::flow::graph::{Edge, EdgeHandle, Graph, Node, NodeKind};

fn default_concurrency() -> usize {
    4
}

/// Externally authored workflow definition, as serialized by the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<EdgeDefinition>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub loops: HashMap<String, Value>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_port: Option<String>,
    #[serde(default)]
    pub target_port: Option<String>,
    /// Absent or `"data"` for ordinary flow; a case label (or `"default"`)
    /// for switch branches.
    #[serde(default)]
    pub handle: Option<String>,
}

impl WorkflowDefinition {
    pub fn from_json_str(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_yaml_str(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Load a definition from a `.json`, `.yaml` or `.yml` file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&data),
            _ => Self::from_json_str(&data),
        }
    }

    /// Validate and transform into the immutable execution graph.
    pub fn build(self) -> Result<Graph> {
        build_graph(self)
    }
}

/// Fluent builder for assembling workflow definitions in code.
#[derive(Debug)]
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            definition: WorkflowDefinition {
                name: name.into(),
                description: None,
                nodes: Vec::new(),
                edges: Vec::new(),
                variables: HashMap::new(),
                loops: HashMap::new(),
                concurrency: default_concurrency(),
            },
        }
    }

    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    pub fn concurrency(mut self, cap: usize) -> Self {
        self.definition.concurrency = cap;
        self
    }

    pub fn variable<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.definition.variables.insert(name.into(), value);
        self
    }

    pub fn node<S: Into<String>>(mut self, id: S, kind: NodeKind) -> Self {
        let id = id.into();
        self.definition.nodes.push(NodeDefinition {
            name: Some(id.clone()),
            id,
            kind,
            config: Value::Null,
        });
        self
    }

    pub fn node_with_config<S: Into<String>>(mut self, id: S, kind: NodeKind, config: Value) -> Self {
        let id = id.into();
        self.definition.nodes.push(NodeDefinition {
            name: Some(id.clone()),
            id,
            kind,
            config,
        });
        self
    }

    /// Ordinary data-flow edge.
    pub fn edge<S1: Into<String>, S2: Into<String>>(mut self, source: S1, target: S2) -> Self {
        self.definition.edges.push(EdgeDefinition {
            id: None,
            source: source.into(),
            target: target.into(),
            source_port: None,
            target_port: None,
            handle: None,
        });
        self
    }

    /// Conditional branch edge out of a switch node.
    pub fn branch<S1: Into<String>, S2: Into<String>, S3: Into<String>>(
        mut self,
        source: S1,
        target: S2,
        label: S3,
    ) -> Self {
        self.definition.edges.push(EdgeDefinition {
            id: None,
            source: source.into(),
            target: target.into(),
            source_port: None,
            target_port: None,
            handle: Some(label.into()),
        });
        self
    }

    pub fn build(self) -> Result<Graph> {
        self.definition.build()
    }
}

fn build_graph(definition: WorkflowDefinition) -> Result<Graph> {
    if definition.nodes.is_empty() {
        return Err(MaestroError::validation("workflow has no nodes"));
    }
    if definition.concurrency == 0 {
        return Err(MaestroError::validation("concurrency must be at least 1"));
    }

    // Unique node ids, definition order preserved.
    let mut ids: HashMap<String, usize> = HashMap::new();
    for (i, node) in definition.nodes.iter().enumerate() {
        if node.id.is_empty() {
            return Err(MaestroError::validation("node id cannot be empty"));
        }
        if ids.insert(node.id.clone(), i).is_some() {
            return Err(MaestroError::validation(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
    }

    // Materialize edges, rejecting dangling endpoints and branch edges that
    // do not originate at a switch node.
    let mut edges = Vec::with_capacity(definition.edges.len());
    for def in &definition.edges {
        let source_idx = *ids.get(&def.source).ok_or_else(|| {
            MaestroError::validation(format!("edge source '{}' does not exist", def.source))
        })?;
        if !ids.contains_key(&def.target) {
            return Err(MaestroError::validation(format!(
                "edge target '{}' does not exist",
                def.target
            )));
        }
        if def.source == def.target {
            return Err(MaestroError::validation(format!(
                "self-edge on node '{}'",
                def.source
            )));
        }
        let handle = EdgeHandle::from_label(def.handle.as_deref());
        if handle.is_branch() && !definition.nodes[source_idx].kind.is_switch() {
            return Err(MaestroError::validation(format!(
                "branch edge '{}' -> '{}' originates at non-switch node",
                def.source, def.target
            )));
        }
        edges.push(Edge {
            id: def
                .id
                .clone()
                .unwrap_or_else(|| format!("edge_{}", cuid2::create_id())),
            source: def.source.clone(),
            target: def.target.clone(),
            source_port: def.source_port.clone(),
            target_port: def.target_port.clone(),
            handle,
        });
    }

    // Dependency/dependent sets, deduplicated, definition order. Multiple
    // edges between the same pair (several switch cases into one target)
    // collapse to one dependency.
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &edges {
        let deps = dependencies.entry(edge.target.clone()).or_default();
        if !deps.contains(&edge.source) {
            deps.push(edge.source.clone());
        }
        let outs = dependents.entry(edge.source.clone()).or_default();
        if !outs.contains(&edge.target) {
            outs.push(edge.target.clone());
        }
    }

    // Exactly one trigger node, with no dependencies.
    let mut triggers = definition
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Input);
    let trigger = match (triggers.next(), triggers.next()) {
        (Some(t), None) => t.id.clone(),
        (None, _) => return Err(MaestroError::validation("workflow has no input node")),
        (Some(_), Some(_)) => {
            return Err(MaestroError::validation(
                "workflow has more than one input node",
            ))
        }
    };
    if dependencies.contains_key(&trigger) {
        return Err(MaestroError::validation(format!(
            "input node '{trigger}' has incoming edges"
        )));
    }

    // At least one output node.
    let outputs: Vec<String> = definition
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Output)
        .map(|n| n.id.clone())
        .collect();
    if outputs.is_empty() {
        return Err(MaestroError::validation("workflow has no output node"));
    }

    // Every non-trigger node must be reachable through at least one edge,
    // otherwise it could never become ready.
    for node in &definition.nodes {
        if node.id != trigger && !dependencies.contains_key(&node.id) {
            return Err(MaestroError::validation(format!(
                "node '{}' has no incoming edges and is not the trigger",
                node.id
            )));
        }
    }

    // Cycle check and topological order via petgraph.
    let mut dag: DiGraph<&str, ()> = DiGraph::new();
    let mut petgraph_index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &definition.nodes {
        petgraph_index.insert(&node.id, dag.add_node(node.id.as_str()));
    }
    for edge in &edges {
        dag.add_edge(
            petgraph_index[edge.source.as_str()],
            petgraph_index[edge.target.as_str()],
            (),
        );
    }
    let topo_order = toposort(&dag, None)
        .map_err(|cycle| {
            MaestroError::validation(format!(
                "workflow contains a cycle through node '{}'",
                dag[cycle.node_id()]
            ))
        })?
        .into_iter()
        .map(|idx| dag[idx].to_string())
        .collect::<Vec<_>>();

    // Depth: longest dependency chain, walked in topological order.
    let mut depths: HashMap<String, usize> = HashMap::new();
    for id in &topo_order {
        let depth = dependencies
            .get(id)
            .map(|deps| deps.iter().map(|d| depths[d] + 1).max().unwrap_or(0))
            .unwrap_or(0);
        depths.insert(id.clone(), depth);
    }

    // Diagnostic levels grouped by depth, definition order within a level.
    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut levels = vec![Vec::new(); max_depth + 1];
    for node in &definition.nodes {
        levels[depths[&node.id]].push(node.id.clone());
    }

    let nodes = definition
        .nodes
        .into_iter()
        .map(|def| {
            let dependencies = dependencies.remove(&def.id).unwrap_or_default();
            let dependents = dependents.remove(&def.id).unwrap_or_default();
            Node {
                name: def.name.unwrap_or_else(|| def.id.clone()),
                depth: depths[&def.id],
                id: def.id,
                kind: def.kind,
                config: def.config,
                dependencies,
                dependents,
            }
        })
        .collect();

    Ok(Graph::new(
        definition.name,
        nodes,
        edges,
        levels,
        trigger,
        outputs,
        definition.variables,
        definition.loops,
        definition.concurrency,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn linear() -> WorkflowBuilder {
        WorkflowBuilder::new("linear")
            .node("in", NodeKind::Input)
            .node("t1", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("in", "t1")
            .edge("t1", "out")
    }

    #[test]
    fn test_builds_linear_graph() {
        let graph = linear().build().unwrap();

        assert_eq!(graph.name(), "linear");
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.trigger(), "in");
        assert_eq!(graph.outputs(), ["out".to_string()]);
        assert_eq!(graph.node("t1").unwrap().dependencies, vec!["in"]);
        assert_eq!(graph.node("t1").unwrap().dependents, vec!["out"]);
        assert_eq!(graph.node("in").unwrap().depth, 0);
        assert_eq!(graph.node("t1").unwrap().depth, 1);
        assert_eq!(graph.node("out").unwrap().depth, 2);
        assert_eq!(graph.levels().len(), 3);
    }

    #[test]
    fn test_dependents_are_transpose_of_dependencies() {
        let graph = WorkflowBuilder::new("diamond")
            .node("in", NodeKind::Input)
            .node("b", NodeKind::Transform)
            .node("c", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("in", "b")
            .edge("in", "c")
            .edge("b", "out")
            .edge("c", "out")
            .build()
            .unwrap();

        for node in graph.nodes() {
            for dep in &node.dependencies {
                assert!(graph.node(dep).unwrap().dependents.contains(&node.id));
            }
            for dependent in &node.dependents {
                assert!(graph
                    .node(dependent)
                    .unwrap()
                    .dependencies
                    .contains(&node.id));
            }
        }
        assert_eq!(graph.node("out").unwrap().depth, 2);
    }

    #[test]
    fn test_rejects_cycle() {
        let err = WorkflowBuilder::new("cyclic")
            .node("in", NodeKind::Input)
            .node("a", NodeKind::Transform)
            .node("b", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("in", "a")
            .edge("a", "b")
            .edge("b", "a")
            .edge("b", "out")
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let err = linear().edge("t1", "ghost").build().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rejects_duplicate_node_id() {
        let err = linear().node("t1", NodeKind::Transform).build().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_missing_trigger_and_output() {
        let err = WorkflowBuilder::new("no_input")
            .node("t", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("t", "out")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("input"));

        let err = WorkflowBuilder::new("no_output")
            .node("in", NodeKind::Input)
            .node("t", NodeKind::Transform)
            .edge("in", "t")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("output"));
    }

    #[test]
    fn test_rejects_second_trigger() {
        let err = WorkflowBuilder::new("two_inputs")
            .node("in1", NodeKind::Input)
            .node("in2", NodeKind::Input)
            .node("out", NodeKind::Output)
            .edge("in1", "out")
            .edge("in2", "out")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn test_rejects_branch_edge_from_non_switch() {
        let err = WorkflowBuilder::new("bad_branch")
            .node("in", NodeKind::Input)
            .node("t", NodeKind::Transform)
            .node("out", NodeKind::Output)
            .edge("in", "t")
            .branch("t", "out", "yes")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("non-switch"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = linear().concurrency(0).build().unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parses_yaml_definition() {
        let yaml = r#"
name: enrichment
concurrency: 2
variables:
  region: "eu-west-1"
nodes:
  - id: start
    type: input
  - id: route
    type: switch
    config: { cases: ["fast", "slow"] }
  - id: fast_path
    type: http
  - id: slow_path
    type: llm
  - id: done
    type: output
edges:
  - { source: start, target: route }
  - { source: route, target: fast_path, handle: fast }
  - { source: route, target: slow_path, handle: slow }
  - { source: fast_path, target: done }
  - { source: slow_path, target: done }
"#;
        let graph = WorkflowDefinition::from_yaml_str(yaml)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(graph.concurrency(), 2);
        assert_eq!(graph.trigger(), "start");
        assert_eq!(
            graph.variables().get("region"),
            Some(&Value::String("eu-west-1".to_string()))
        );
        let branch_labels: Vec<_> = graph
            .outgoing_edges("route")
            .iter()
            .filter_map(|&i| graph.edges()[i].handle.label())
            .collect();
        assert_eq!(branch_labels, vec!["fast", "slow"]);
    }

    #[test]
    fn test_parses_json_definition_with_loop_metadata() {
        let json = r#"{
            "name": "batcher",
            "nodes": [
                {"id": "start", "type": "input"},
                {"id": "collect", "type": "knowledge-lookup"},
                {"id": "done", "type": "output"}
            ],
            "edges": [
                {"source": "start", "target": "collect"},
                {"source": "collect", "target": "done"}
            ],
            "loops": {"collect": {"iterations": 3}}
        }"#;
        let graph = WorkflowDefinition::from_json_str(json)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(graph.node("collect").unwrap().kind, NodeKind::KnowledgeLookup);
        assert_eq!(graph.loops()["collect"]["iterations"], 3);
        assert_eq!(graph.concurrency(), 4);
    }
}
