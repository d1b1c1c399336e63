use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use baton_core::types::ConsensusAlgorithm;

/// One choice offered in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl VoteOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            value: serde_json::Value::Null,
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    pub option_id: String,
    /// Fixed from the agent's expertise when the vote was cast.
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    /// Closed without reaching consensus.
    Closed,
    /// Closed with a binding winner.
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingSession {
    pub id: String,
    pub topic: String,
    pub options: Vec<VoteOption>,
    pub votes: Vec<Vote>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<usize>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ConsensusResult>,
}

impl VotingSession {
    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }

    pub fn has_voted(&self, agent_id: &str) -> bool {
        self.votes.iter().any(|v| v.agent_id == agent_id)
    }

    pub fn total_weight(&self) -> f64 {
        self.votes.iter().map(|v| v.weight).sum()
    }
}

/// Outcome of closing a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub session_id: String,
    /// Set only when consensus was reached.
    pub winning_option: Option<String>,
    /// Leading option's share of the distribution, 0 when no meaningful lead exists.
    pub confidence: f64,
    /// Option id → summed weight (vote count for simple-majority).
    pub vote_distribution: HashMap<String, f64>,
    pub consensus_reached: bool,
    pub resolution_method: ConsensusAlgorithm,
    pub details: String,
}
