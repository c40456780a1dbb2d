pub mod builder;
pub mod cascade;
pub mod context;
pub mod dispatch;
pub mod events;
pub mod graph;
pub mod scheduler;
pub mod status;

pub use builder::{EdgeDefinition, NodeDefinition, WorkflowBuilder, WorkflowDefinition};
pub use cascade::apply_route;
pub use context::{final_outputs, EvaluationContext};
pub use dispatch::{DispatchMetadata, FnHandler, HandlerRegistry, NodeDispatcher, NodeHandler};
pub use events::{CollectingSink, EventSink, LoggingSink, TransitionEnvelope, TransitionEvent};
pub use graph::{Edge, EdgeHandle, Graph, Node, NodeKind, DEFAULT_ROUTE};
pub use scheduler::{ExecutionReport, NodeOutcome, Scheduler};
pub use status::{ExecutionState, NodeState, NodeStatus, StatusCounts};
