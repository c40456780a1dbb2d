//! maestro - a workflow DAG execution scheduler.
//!
//! Drives a directed acyclic graph of heterogeneous operation nodes to
//! completion under a global concurrency cap, propagating per-node outputs
//! into a shared evaluation context and handling conditional branching with
//! reachability-aware skip propagation. Concrete node operations (http,
//! llm, database, ...) live behind the [`flow::NodeDispatcher`] contract.

// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// The DAG execution engine
pub mod flow;

// Re-exports for convenience
pub use core::errors::{MaestroError, Result};
pub use flow::*;
