use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::BoxFuture;
use tracing::{debug, info};

use baton_core::error::{BatonError, Result};
use baton_core::traits::CapabilityRouter;
use baton_core::types::{AgentCandidate, Task};

/// Score that maps to full confidence: one specialization hit plus every
/// required capability.
const FULL_MATCH: f64 = 30.0;

/// Describes an agent's strengths for routing decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCapability {
    pub agent_id: String,
    pub name: String,
    /// Domain keywords matched against the task description.
    pub specializations: Vec<String>,
    /// Named capabilities matched against `Task::required_capabilities`.
    pub capabilities: Vec<String>,
}

impl AgentCapability {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            specializations: vec![],
            capabilities: vec![],
        }
    }

    pub fn with_specializations(mut self, specs: Vec<String>) -> Self {
        self.specializations = specs;
        self
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities = caps;
        self
    }

    /// Raw match score; higher is better.
    pub fn match_score(&self, task: &Task) -> f64 {
        let mut score = 0.0;
        let description = task.description.to_lowercase();

        for keyword in &self.specializations {
            if description.contains(&keyword.to_lowercase()) {
                score += 10.0;
            }
        }

        let required = &task.required_capabilities;
        if !required.is_empty() {
            let matched = required
                .iter()
                .filter(|c| self.capabilities.contains(c))
                .count();
            if matched == required.len() {
                score += 20.0;
            } else {
                score += matched as f64 * 5.0;
            }
        }

        score
    }

    /// Match score scaled into `[0, 1]`.
    pub fn confidence(&self, task: &Task) -> f64 {
        (self.match_score(task) / FULL_MATCH).min(1.0)
    }
}

/// In-process capability router over registered agents.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    agents: RwLock<Vec<AgentCapability>>,
    workloads: RwLock<HashMap<String, u32>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn agents(&self) -> RwLockReadGuard<'_, Vec<AgentCapability>> {
        self.agents.read().unwrap_or_else(|p| p.into_inner())
    }

    fn agents_mut(&self) -> RwLockWriteGuard<'_, Vec<AgentCapability>> {
        self.agents.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Register or replace an agent.
    pub fn register(&self, capability: AgentCapability) {
        info!(agent_id = %capability.agent_id, "Registering routable agent");
        let mut agents = self.agents_mut();
        agents.retain(|a| a.agent_id != capability.agent_id);
        agents.push(capability);
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        let mut agents = self.agents_mut();
        let before = agents.len();
        agents.retain(|a| a.agent_id != agent_id);
        agents.len() != before
    }

    pub fn len(&self) -> usize {
        self.agents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents().is_empty()
    }

    pub fn set_workload(&self, agent_id: &str, active: u32) {
        self.workloads
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(agent_id.to_string(), active);
    }

    /// Agents with a positive match, best first.
    pub fn rank(&self, task: &Task) -> Vec<AgentCandidate> {
        let mut ranked: Vec<AgentCandidate> = self
            .agents()
            .iter()
            .map(|a| AgentCandidate::new(a.agent_id.clone(), a.confidence(task)))
            .filter(|c| c.confidence > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        debug!(task_id = %task.id, matches = ranked.len(), "Ranked agents for task");
        ranked
    }
}

impl CapabilityRouter for CapabilityRegistry {
    fn select_agent<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<AgentCandidate>> {
        Box::pin(async move {
            self.rank(task).into_iter().next().ok_or_else(|| {
                BatonError::Routing(format!("no registered agent matches task {}", task.id))
            })
        })
    }

    fn candidates<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<Vec<AgentCandidate>>> {
        Box::pin(async move { Ok(self.rank(task)) })
    }

    fn workload(&self, agent_id: &str) -> u32 {
        self.workloads
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CapabilityRegistry {
        let reg = CapabilityRegistry::new();
        reg.register(
            AgentCapability::new("coder", "Coder")
                .with_specializations(vec!["code".into(), "refactor".into()])
                .with_capabilities(vec!["shell".into(), "git".into()]),
        );
        reg.register(
            AgentCapability::new("writer", "Writer")
                .with_specializations(vec!["docs".into()])
                .with_capabilities(vec!["markdown".into()]),
        );
        reg
    }

    #[test]
    fn test_match_score() {
        let coder = AgentCapability::new("c", "C")
            .with_specializations(vec!["code".into()])
            .with_capabilities(vec!["shell".into()]);
        let task = Task::new("Review this CODE change")
            .with_capabilities(vec!["shell".into(), "git".into()]);
        assert_eq!(coder.match_score(&task), 15.0);
        assert_eq!(coder.confidence(&task), 0.5);
    }

    #[tokio::test]
    async fn test_select_best_agent() {
        let reg = registry();
        let task = Task::new("refactor the code").with_capabilities(vec!["git".into()]);
        let best = reg.select_agent(&task).await.unwrap();
        assert_eq!(best.agent_id, "coder");
        assert_eq!(best.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_no_match_is_routing_error() {
        let err = registry()
            .select_agent(&Task::new("bake bread"))
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::Routing(_)));
    }

    #[test]
    fn test_register_replaces_and_unregister() {
        let reg = registry();
        reg.register(AgentCapability::new("coder", "Coder v2"));
        assert_eq!(reg.len(), 2);
        assert!(reg.unregister("coder"));
        assert!(!reg.unregister("coder"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_workloads() {
        let reg = registry();
        reg.set_workload("writer", 4);
        assert_eq!(reg.workload("writer"), 4);
        assert_eq!(reg.workload("coder"), 0);
    }
}
