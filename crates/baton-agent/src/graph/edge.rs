use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Filled in as `source->target` when left empty.
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    /// Expression consulted only under `EdgeSelection::EvaluateConditions`.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GraphEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            condition: None,
            metadata: HashMap::new(),
        }
    }

    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        let mut edge = Self::new(source, target);
        edge.condition = Some(expr.into());
        edge
    }

    /// True when the edge has no condition or its condition holds.
    pub fn admits(&self, context: &HashMap<String, serde_json::Value>) -> bool {
        self.condition
            .as_deref()
            .map_or(true, |expr| evaluate_condition(expr, context))
    }
}

const OPERATORS: [&str; 3] = [" contains ", "!=", "=="];

/// Evaluate `key == "v"`, `key != "v"` or `key contains "v"` against the
/// context. The leftmost operator splits the expression, so values may
/// contain operator text. Non-string values compare by their JSON text.
/// Unparseable expressions and missing keys are false.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let Some((key, op, value)) = split_condition(expr.trim()) else {
        return false;
    };
    let Some(actual) = lookup(context, key) else {
        return false;
    };
    match op {
        "!=" => actual != value,
        "==" => actual == value,
        _ => actual.contains(value),
    }
}

fn lookup(context: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    context.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn split_condition(expr: &str) -> Option<(&str, &'static str, &str)> {
    let (at, op) = OPERATORS
        .iter()
        .filter_map(|op| expr.find(op).map(|at| (at, *op)))
        .min_by_key(|(at, _)| *at)?;
    let key = expr[..at].trim();
    if key.is_empty() {
        return None;
    }
    let value = expr[at + op.len()..].trim().trim_matches('"');
    Some((key, op, value))
}
