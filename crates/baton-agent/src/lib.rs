//! Workflow execution and the hybrid handoff coordinator.
//!
//! The coordinator walks a [`graph::WorkflowGraph`] and, at every agent
//! node, decides whether the task should move to a better-suited agent.
//! Transfers go through the context handoff manager under a retry policy
//! and a circuit breaker; when they fail, a fallback chain keeps the task
//! running. Close calls between candidates can be escalated to a
//! consensus vote.

pub mod breaker;
pub mod coordinator;
pub mod graph;
pub mod metrics;
pub mod retry;
pub mod router;
pub mod selection;

pub use breaker::{BreakerState, CircuitBreaker};
pub use coordinator::{
    ConfigHealth, CoordinatorBuilder, HandoffRecord, HandoffRoute, HybridHandoffCoordinator,
    TaskResult,
};
pub use graph::{
    GraphEdge, GraphExecutor, GraphNode, NodeKind, NodeProcessor, WorkflowDefinition,
    WorkflowGraph, WorkflowState,
};
pub use metrics::HandoffMetrics;
pub use retry::RetryPolicy;
pub use router::{AgentCapability, CapabilityRegistry};
pub use selection::{AgentSelector, ScoredCandidate};
