use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use baton_core::traits::ContextMap;

/// One executed node, appended in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// Context snapshot the node saw.
    pub input: serde_json::Value,
    pub output: serde_json::Value,
}

/// Mutable state of one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_node_id: String,
    pub context: ContextMap,
    pub history: Vec<HistoryEntry>,
}

impl WorkflowState {
    pub fn new(start_node: impl Into<String>, context: ContextMap) -> Self {
        Self {
            current_node_id: start_node.into(),
            context,
            history: Vec::new(),
        }
    }

    pub fn context_snapshot(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn record(&mut self, node_id: &str, input: serde_json::Value, output: serde_json::Value) {
        self.history.push(HistoryEntry {
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            input,
            output,
        });
    }

    /// Fold a node's output into the context: object keys are merged,
    /// anything else is stored under the node id.
    pub fn fold_output(&mut self, node_id: &str, output: &serde_json::Value) {
        match output {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    self.context.insert(k.clone(), v.clone());
                }
            }
            serde_json::Value::Null => {}
            other => {
                self.context.insert(node_id.to_string(), other.clone());
            }
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fold_object_merges() {
        let mut state = WorkflowState::new("a", ContextMap::new());
        state.context.insert("keep".into(), json!(1));
        state.fold_output("a", &json!({"verdict": "pass", "keep": 2}));
        assert_eq!(state.get_str("verdict"), Some("pass"));
        assert_eq!(state.context["keep"], 2);
    }

    #[test]
    fn test_fold_scalar_under_node_id() {
        let mut state = WorkflowState::default();
        state.fold_output("summarize", &json!("short text"));
        assert_eq!(state.get_str("summarize"), Some("short text"));
        state.fold_output("noop", &serde_json::Value::Null);
        assert!(!state.context.contains_key("noop"));
    }

    #[test]
    fn test_history_is_append_only_in_order() {
        let mut state = WorkflowState::default();
        state.record("a", json!({}), json!(1));
        state.record("b", json!({}), json!(2));
        let ids: Vec<_> = state.history.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
