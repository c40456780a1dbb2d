//! The uniform dispatch boundary for concrete node operations.
//!
//! The scheduler knows nothing about what an `http` or `llm` node actually
//! does; every kind is executed through [`NodeDispatcher`]. A dispatcher
//! failure is node-level data, confined by the skip cascade, never a
//! scheduler error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::flow::context::EvaluationContext;
use crate::flow::graph::NodeKind;

/// Observability metadata passed with every dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMetadata {
    pub node_id: String,
    pub node_name: String,
    pub run_id: String,
    pub workflow: String,
}

/// Executes one node's operation. Implementations may run concurrently
/// across nodes but are never invoked more than once concurrently for the
/// same node id.
///
/// Switch nodes report their routing decision through a `selectedRoute`
/// field in the returned output; the engine falls back to the default route
/// when the field is absent.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn execute(
        &self,
        kind: NodeKind,
        config: &Value,
        context: &EvaluationContext,
        meta: &DispatchMetadata,
    ) -> anyhow::Result<Value>;
}

/// Handler for a single node kind, registered with [`HandlerRegistry`].
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(
        &self,
        config: &Value,
        context: &EvaluationContext,
        meta: &DispatchMetadata,
    ) -> anyhow::Result<Value>;
}

/// Dispatcher backed by a kind-to-handler table. Dispatching an unregistered
/// kind fails the node, which the cascade then confines.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: NodeKind, handler: Arc<dyn NodeHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn contains(&self, kind: NodeKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

#[async_trait]
impl NodeDispatcher for HandlerRegistry {
    async fn execute(
        &self,
        kind: NodeKind,
        config: &Value,
        context: &EvaluationContext,
        meta: &DispatchMetadata,
    ) -> anyhow::Result<Value> {
        match self.handlers.get(&kind) {
            Some(handler) => handler.run(config, context, meta).await,
            None => Err(anyhow::anyhow!(
                "no handler registered for node kind '{kind}'"
            )),
        }
    }
}

/// Wraps a plain closure as a [`NodeHandler`]; the common case for tests and
/// simple synchronous transforms.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Value, &EvaluationContext, &DispatchMetadata) -> anyhow::Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> NodeHandler for FnHandler<F>
where
    F: Fn(&Value, &EvaluationContext, &DispatchMetadata) -> anyhow::Result<Value> + Send + Sync,
{
    async fn run(
        &self,
        config: &Value,
        context: &EvaluationContext,
        meta: &DispatchMetadata,
    ) -> anyhow::Result<Value> {
        (self.f)(config, context, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> DispatchMetadata {
        DispatchMetadata {
            node_id: "n1".to_string(),
            node_name: "n1".to_string(),
            run_id: "run_test".to_string(),
            workflow: "wf".to_string(),
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_kind() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            NodeKind::Transform,
            Arc::new(FnHandler::new(|config, _, _| {
                Ok(json!({"echo": config.clone()}))
            })),
        );
        assert!(registry.contains(NodeKind::Transform));

        let context = EvaluationContext::new(json!({}));
        let output = registry
            .execute(NodeKind::Transform, &json!({"k": 1}), &context, &meta())
            .await
            .unwrap();
        assert_eq!(output, json!({"echo": {"k": 1}}));
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_a_node_failure() {
        let registry = HandlerRegistry::new();
        let context = EvaluationContext::new(json!({}));

        let err = registry
            .execute(NodeKind::Http, &Value::Null, &context, &meta())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[tokio::test]
    async fn test_handler_reads_context() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            NodeKind::Transform,
            Arc::new(FnHandler::new(|_, context, _| {
                let upstream = context
                    .resolve("fetch.status")
                    .ok_or_else(|| anyhow::anyhow!("missing upstream output"))?;
                Ok(json!({"seen": upstream}))
            })),
        );

        let context = EvaluationContext::new(json!({}));
        context.store_output("fetch", json!({"status": 200})).unwrap();
        let output = registry
            .execute(NodeKind::Transform, &Value::Null, &context, &meta())
            .await
            .unwrap();
        assert_eq!(output, json!({"seen": 200}));
    }
}
