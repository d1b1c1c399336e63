use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Urgency of a handoff or task. Drives the compression quality trade-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// High priority favours speed, low priority favours size.
    pub fn compression_quality(&self) -> CompressionQuality {
        match self {
            Self::High => CompressionQuality::Fastest,
            Self::Medium => CompressionQuality::Balanced,
            Self::Low => CompressionQuality::Smallest,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Compression trade-off requested from the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionQuality {
    Fastest,
    Balanced,
    Smallest,
}

impl CompressionQuality {
    /// Numeric level on the usual 1 (fast) to 9 (small) scale.
    pub fn level(&self) -> u32 {
        match self {
            Self::Fastest => 1,
            Self::Balanced => 5,
            Self::Smallest => 9,
        }
    }
}

/// Options handed to a [`crate::traits::Compressor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionOptions {
    pub quality: CompressionQuality,
    pub preserve_semantic: bool,
    pub context_type: String,
}

impl CompressionOptions {
    pub fn for_priority(priority: Priority) -> Self {
        Self {
            quality: priority.compression_quality(),
            preserve_semantic: true,
            context_type: "handoff".to_string(),
        }
    }
}

/// Resolution policy for closing a voting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusAlgorithm {
    SimpleMajority,
    WeightedMajority,
    Supermajority,
    ConsensusThreshold,
}

impl ConsensusAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimpleMajority => "simple-majority",
            Self::WeightedMajority => "weighted-majority",
            Self::Supermajority => "supermajority",
            Self::ConsensusThreshold => "consensus-threshold",
        }
    }
}

impl std::fmt::Display for ConsensusAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work submitted to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Agent holding the task before any handoff.
    #[serde(default)]
    pub assigned_agent: Option<String>,
    /// Node to start from; the coordinator's default entry when absent.
    #[serde(default)]
    pub entry_node: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            priority: Priority::default(),
            assigned_agent: None,
            entry_node: None,
            required_capabilities: vec![],
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_agent = Some(agent_id.into());
        self
    }

    pub fn with_entry(mut self, node_id: impl Into<String>) -> Self {
        self.entry_node = Some(node_id.into());
        self
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.required_capabilities = caps;
        self
    }
}

/// An agent proposed as a handoff target, with how sure the proposer is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCandidate {
    pub agent_id: String,
    pub confidence: f64,
}

impl AgentCandidate {
    pub fn new(agent_id: impl Into<String>, confidence: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            confidence,
        }
    }
}

/// Input to a handoff evaluation at an agent node.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub task: Task,
    pub node_id: String,
    pub current_agent: String,
    pub context: HashMap<String, serde_json::Value>,
    pub depth: u32,
}

/// Verdict of a handoff evaluator or capability router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEvaluation {
    pub should_handoff: bool,
    /// Confidence in the verdict (0.0 to 1.0).
    pub confidence: f64,
    #[serde(default)]
    pub candidates: Vec<AgentCandidate>,
    #[serde(default)]
    pub reason: String,
}

impl HandoffEvaluation {
    pub fn stay(reason: impl Into<String>) -> Self {
        Self {
            should_handoff: false,
            confidence: 1.0,
            candidates: vec![],
            reason: reason.into(),
        }
    }
}
