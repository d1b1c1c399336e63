//! Workflow graph: agent/process/decision nodes walked to completion.
//!
//! A `WorkflowGraph` holds `GraphNode`s connected by directed `GraphEdge`s.
//! The `GraphExecutor` starts at an entry node, hands each node to the
//! processor registered for its kind, records the step in the
//! `WorkflowState` history, and follows an outbound edge until a node has
//! none left. Runs are bounded by `MAX_ITERATIONS`.

pub mod definition;
pub mod edge;
pub mod executor;
pub mod node;
pub mod state;

pub use definition::WorkflowDefinition;
pub use edge::{evaluate_condition, GraphEdge};
pub use executor::{
    EdgeSelection, GraphExecutor, NodeProcessor, NodeProcessors, OrchestrationResult,
    PassthroughProcessor, WorkflowGraph, MAX_ITERATIONS,
};
pub use node::{GraphNode, NodeKind};
pub use state::{HistoryEntry, WorkflowState};
