use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Working context carried between agents.
pub type ContextMap = HashMap<String, serde_json::Value>;

/// Compression codec. The concrete algorithm lives outside Baton.
pub trait Compressor: Send + Sync + 'static {
    fn compress<'a>(
        &'a self,
        text: &'a str,
        options: &'a CompressionOptions,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;

    fn decompress<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>>;
}

/// Capability router: maps a task to the best-suited available agent.
pub trait CapabilityRouter: Send + Sync + 'static {
    /// The single best agent for a task.
    fn select_agent<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<AgentCandidate>>;

    /// Ranked candidates for a task. Defaults to the single selection.
    fn candidates<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<Vec<AgentCandidate>>> {
        Box::pin(async move { Ok(vec![self.select_agent(task).await?]) })
    }

    /// Current workload reported for an agent (0 = idle).
    fn workload(&self, agent_id: &str) -> u32 {
        let _ = agent_id;
        0
    }
}

/// Decides whether a task should move to another agent. Typically LLM-backed.
pub trait HandoffEvaluator: Send + Sync + 'static {
    fn evaluate<'a>(
        &'a self,
        request: &'a EvaluationRequest,
    ) -> BoxFuture<'a, Result<HandoffEvaluation>>;
}

/// An agent hosted by an external SDK, used as the first fallback.
pub trait ExternalAgent: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether the external agent is willing to take this task.
    fn can_handle<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<bool>>;

    /// Run the task externally and return its output.
    fn handle<'a>(
        &'a self,
        task: &'a Task,
        context: &'a ContextMap,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Runs an agent node on behalf of a concrete agent.
pub trait AgentRunner: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        agent_id: &'a str,
        node_id: &'a str,
        task: &'a Task,
        context: &'a ContextMap,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// An agent that can be polled for a ballot when candidates disagree.
pub trait DecisionVoter: Send + Sync + 'static {
    fn agent_id(&self) -> &str;

    /// Pick one of `options` (by agent id).
    fn choose<'a>(
        &'a self,
        task: &'a Task,
        options: &'a [AgentCandidate],
    ) -> BoxFuture<'a, Result<String>>;
}
