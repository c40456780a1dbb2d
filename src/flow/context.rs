//! Shared evaluation context for a single execution.
//!
//! Holds the immutable trigger inputs, one output per completed node
//! (write-once, enforced), and named variables. Downstream template
//! resolution works against the flattened view; the scheduler guarantees a
//! referenced node is terminal before any dependent executes.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::core::errors::{MaestroError, Result};

#[derive(Debug, Default)]
pub struct EvaluationContext {
    trigger: Value,
    outputs: DashMap<String, Value>,
    variables: DashMap<String, Value>,
}

impl EvaluationContext {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            outputs: DashMap::new(),
            variables: DashMap::new(),
        }
    }

    pub fn with_variables(trigger: Value, variables: HashMap<String, Value>) -> Self {
        let context = Self::new(trigger);
        for (name, value) in variables {
            context.variables.insert(name, value);
        }
        context
    }

    /// The workflow's trigger inputs, immutable for the whole execution.
    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    /// Record a completed node's output. Each node id is written at most
    /// once per execution; a second write is a contract violation.
    pub fn store_output(&self, node_id: &str, output: Value) -> Result<()> {
        match self.outputs.entry(node_id.to_string()) {
            Entry::Occupied(_) => Err(MaestroError::DuplicateOutput(node_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(output);
                Ok(())
            }
        }
    }

    pub fn output(&self, node_id: &str) -> Option<Value> {
        self.outputs.get(node_id).map(|v| v.clone())
    }

    pub fn has_output(&self, node_id: &str) -> bool {
        self.outputs.contains_key(node_id)
    }

    pub fn set_variable<S: Into<String>>(&self, name: S, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|v| v.clone())
    }

    /// Flattened view for template resolution: trigger fields at the top
    /// level, overlaid by variables, overlaid by node outputs keyed by node
    /// id.
    pub fn flattened(&self) -> Value {
        let mut flat = Map::new();
        if let Value::Object(fields) = &self.trigger {
            flat.extend(fields.clone());
        }
        for entry in self.variables.iter() {
            flat.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in self.outputs.iter() {
            flat.insert(entry.key().clone(), entry.value().clone());
        }
        Value::Object(flat)
    }

    /// Explicit field-path resolution: `NodeId.path.to.field` against a
    /// stored node output, or a bare `path` against variables and then the
    /// trigger inputs. Array segments may be numeric indices.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        if let Some(output) = self.outputs.get(head) {
            return descend(output.value(), &rest).cloned();
        }
        if let Some(variable) = self.variables.get(head) {
            return descend(variable.value(), &rest).cloned();
        }
        let mut full = vec![head];
        full.extend(rest);
        descend(&self.trigger, &full).cloned()
    }
}

fn descend<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Shallow-merge the stored outputs of the designated output nodes, in list
/// order, later keys winning on collision. Nodes without a stored output
/// (skipped or failed) contribute nothing. Non-object outputs are keyed
/// under the node's id.
pub fn final_outputs(context: &EvaluationContext, output_ids: &[String]) -> Value {
    let mut merged = Map::new();
    for id in output_ids {
        match context.output(id) {
            Some(Value::Object(fields)) => merged.extend(fields),
            Some(other) => {
                merged.insert(id.clone(), other);
            }
            None => {}
        }
    }
    Value::Object(merged)
}
