use std::collections::BTreeSet;

use futures::future::BoxFuture;

use baton_agent::{AgentCapability, NodeKind, WorkflowDefinition};
use baton_core::error::Result;
use baton_core::traits::{AgentRunner, ContextMap};
use baton_core::types::Task;

/// Runner for `baton run`: every agent just reports what it was given.
pub struct EchoAgents;

impl AgentRunner for EchoAgents {
    fn run<'a>(
        &'a self,
        agent_id: &'a str,
        node_id: &'a str,
        task: &'a Task,
        context: &'a ContextMap,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let mut keys: Vec<&String> = context.keys().collect();
            keys.sort();
            Ok(serde_json::json!({
                format!("{}_handled_by", node_id): agent_id,
                "last_agent": agent_id,
                "task": task.description,
                "seen_keys": keys,
            }))
        })
    }
}

/// One routable agent per distinct `agent_type` among the agent nodes.
///
/// The agent type is its own specialization. A node's `specializations` and
/// `capabilities` metadata arrays are added to its agent.
pub fn capabilities(definition: &WorkflowDefinition) -> Vec<AgentCapability> {
    let mut agents: Vec<AgentCapability> = Vec::new();
    for node in definition.nodes.iter().filter(|n| n.kind == NodeKind::Agent) {
        let Some(agent_type) = node.agent_type.as_deref() else {
            continue;
        };
        let index = match agents.iter().position(|a| a.agent_id == agent_type) {
            Some(i) => i,
            None => {
                agents.push(
                    AgentCapability::new(agent_type, agent_type)
                        .with_specializations(vec![agent_type.to_string()]),
                );
                agents.len() - 1
            }
        };
        let agent = &mut agents[index];
        agent.specializations = merge(&agent.specializations, strings(node, "specializations"));
        agent.capabilities = merge(&agent.capabilities, strings(node, "capabilities"));
    }
    agents
}

fn strings(node: &baton_agent::GraphNode, key: &str) -> Vec<String> {
    node.metadata
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn merge(existing: &[String], extra: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    existing
        .iter()
        .cloned()
        .chain(extra)
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
