use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Closed set of node kinds. Each kind has its own processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Work done by an agent; handoffs are evaluated here.
    Agent,
    /// A deterministic processing step.
    Process,
    /// Shapes the context that the next transition sees.
    Decision,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Process => "process",
            Self::Decision => "decision",
        };
        f.write_str(s)
    }
}

/// A node in a workflow graph. Immutable once added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    /// Preferred agent for agent nodes.
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            agent_type: None,
            metadata: HashMap::new(),
        }
    }

    pub fn agent(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::Agent);
        node.agent_type = Some(agent_type.into());
        node
    }

    pub fn process(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Process)
    }

    pub fn decision(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Decision)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builders() {
        let node = GraphNode::agent("plan", "planner").with_label("Planning");
        assert_eq!(node.kind, NodeKind::Agent);
        assert_eq!(node.agent_type.as_deref(), Some("planner"));
        assert_eq!(node.label, "Planning");

        let node = GraphNode::decision("route").with_metadata("weight", serde_json::json!(2));
        assert_eq!(node.kind, NodeKind::Decision);
        assert_eq!(node.label, "route");
        assert_eq!(node.metadata["weight"], 2);
    }

    #[test]
    fn test_kind_from_toml() {
        let node: GraphNode = toml::from_str(
            r#"
            id = "build"
            kind = "process"
            "#,
        )
        .unwrap();
        assert_eq!(node.kind, NodeKind::Process);
        assert!(node.agent_type.is_none());
    }
}
