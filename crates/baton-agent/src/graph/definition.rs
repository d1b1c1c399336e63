use std::path::Path;

use serde::{Deserialize, Serialize};

use baton_core::error::{BatonError, Result};

use super::edge::GraphEdge;
use super::executor::{EdgeSelection, WorkflowGraph};
use super::node::GraphNode;

/// A workflow as written in TOML:
///
/// ```toml
/// entry = "plan"
/// edge_selection = "evaluate_conditions"
///
/// [[nodes]]
/// id = "plan"
/// kind = "agent"
/// agent_type = "planner"
///
/// [[edges]]
/// source = "plan"
/// target = "build"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub entry: String,
    #[serde(default)]
    pub edge_selection: EdgeSelection,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowDefinition {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BatonError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BatonError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Build the graph, checking ids and edge endpoints.
    pub fn build(&self) -> Result<WorkflowGraph> {
        let mut graph = WorkflowGraph::new();
        for node in &self.nodes {
            graph.add_node(node.clone())?;
        }
        for edge in &self.edges {
            graph.add_edge(edge.clone())?;
        }
        if !graph.contains(&self.entry) {
            return Err(BatonError::NodeNotFound {
                node_id: self.entry.clone(),
                path: vec![],
            });
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;

    const REVIEW_FLOW: &str = r#"
        entry = "plan"
        edge_selection = "evaluate_conditions"

        [[nodes]]
        id = "plan"
        kind = "agent"
        agent_type = "planner"

        [[nodes]]
        id = "check"
        kind = "decision"

        [[nodes]]
        id = "ship"
        kind = "process"
        label = "Ship it"

        [[edges]]
        source = "plan"
        target = "check"

        [[edges]]
        source = "check"
        target = "ship"
        condition = 'verdict == "pass"'
    "#;

    #[test]
    fn test_parse_and_build() {
        let def = WorkflowDefinition::from_toml_str(REVIEW_FLOW).unwrap();
        assert_eq!(def.edge_selection, EdgeSelection::EvaluateConditions);
        assert_eq!(def.nodes[1].kind, NodeKind::Decision);

        let graph = def.build().unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.outbound_edges("plan")[0].id, "plan->check");
        assert_eq!(
            graph.outbound_edges("check")[0].condition.as_deref(),
            Some(r#"verdict == "pass""#)
        );
    }

    #[test]
    fn test_unknown_entry() {
        let def = WorkflowDefinition::from_toml_str(
            r#"
            entry = "missing"
            [[nodes]]
            id = "a"
            kind = "process"
            "#,
        )
        .unwrap();
        assert!(matches!(def.build(), Err(BatonError::NodeNotFound { .. })));
    }

    #[test]
    fn test_dangling_edge() {
        let def = WorkflowDefinition::from_toml_str(
            r#"
            entry = "a"
            [[nodes]]
            id = "a"
            kind = "process"
            [[edges]]
            source = "a"
            target = "b"
            "#,
        )
        .unwrap();
        assert!(def.build().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.toml");
        std::fs::write(&path, REVIEW_FLOW).unwrap();
        let def = WorkflowDefinition::load(&path).unwrap();
        assert_eq!(def.entry, "plan");

        let missing = WorkflowDefinition::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, BatonError::ConfigNotFound(_)));
    }
}
