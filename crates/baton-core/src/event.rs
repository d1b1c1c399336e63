use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Priority;

/// Every event Baton publishes, one variant per event type.
///
/// Serialized adjacently tagged so an envelope reads
/// `{id, type, timestamp, source, target?, payload, metadata?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "handoff.initiated")]
    HandoffInitiated {
        handoff_id: String,
        source_agent_id: String,
        target_agent_id: String,
        task_id: String,
        priority: Priority,
    },
    #[serde(rename = "handoff.completed")]
    HandoffCompleted {
        handoff_id: String,
        source_agent_id: String,
        target_agent_id: String,
        task_id: String,
        result: serde_json::Value,
        /// Milliseconds from initiation to completion.
        duration: u64,
    },
    #[serde(rename = "handoff.failed")]
    HandoffFailed {
        handoff_id: String,
        source_agent_id: String,
        target_agent_id: String,
        task_id: String,
        error: String,
    },
    #[serde(rename = "handoff.failed.permanently")]
    HandoffFailedPermanently {
        task_id: String,
        error: String,
        kind: String,
    },
    #[serde(rename = "handoff.cancelled")]
    HandoffCancelled { handoff_id: String },
    #[serde(rename = "task.created")]
    TaskCreated {
        task_id: String,
        description: String,
        priority: Priority,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: String,
        duration: u64,
        handoff_count: usize,
        degraded: bool,
    },
    #[serde(rename = "task.failed")]
    TaskFailed { task_id: String, error: String },
    #[serde(rename = "agent.registered")]
    AgentRegistered {
        agent_id: String,
        expertise: Vec<String>,
        weight: f64,
    },
    #[serde(rename = "agent.unregistered")]
    AgentUnregistered { agent_id: String },
    #[serde(rename = "agent.workload.updated")]
    AgentWorkloadUpdated { agent_id: String, active_handoffs: u32 },
    #[serde(rename = "context.compressed")]
    ContextCompressed {
        handoff_id: String,
        original_size: usize,
        compressed_size: usize,
        ratio: f64,
    },
    #[serde(rename = "context.decompressed")]
    ContextDecompressed { handoff_id: String, size: usize },
    #[serde(rename = "performance.metric")]
    PerformanceMetric {
        metric: String,
        value: f64,
        unit: String,
    },
    #[serde(rename = "consensus.session.created")]
    ConsensusSessionCreated {
        session_id: String,
        topic: String,
        option_count: usize,
    },
    #[serde(rename = "consensus.vote.cast")]
    ConsensusVoteCast {
        session_id: String,
        agent_id: String,
        option_id: String,
        weight: f64,
    },
    #[serde(rename = "consensus.session.closed")]
    ConsensusSessionClosed {
        session_id: String,
        consensus_reached: bool,
        winning_option: Option<String>,
        confidence: f64,
    },
}

impl Event {
    /// The wire name of this event's type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::HandoffInitiated { .. } => "handoff.initiated",
            Self::HandoffCompleted { .. } => "handoff.completed",
            Self::HandoffFailed { .. } => "handoff.failed",
            Self::HandoffFailedPermanently { .. } => "handoff.failed.permanently",
            Self::HandoffCancelled { .. } => "handoff.cancelled",
            Self::TaskCreated { .. } => "task.created",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::AgentRegistered { .. } => "agent.registered",
            Self::AgentUnregistered { .. } => "agent.unregistered",
            Self::AgentWorkloadUpdated { .. } => "agent.workload.updated",
            Self::ContextCompressed { .. } => "context.compressed",
            Self::ContextDecompressed { .. } => "context.decompressed",
            Self::PerformanceMetric { .. } => "performance.metric",
            Self::ConsensusSessionCreated { .. } => "consensus.session.created",
            Self::ConsensusVoteCast { .. } => "consensus.vote.cast",
            Self::ConsensusSessionClosed { .. } => "consensus.session.closed",
        }
    }
}

/// An event plus routing and bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Envelope {
    pub fn new(source: impl Into<String>, event: Event) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: source.into(),
            target: None,
            event,
            metadata: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, envelope: Envelope) {
        tracing::trace!(event_type = envelope.event_type(), source = %envelope.source, "Publishing event");
        // Ignore error if no receivers
        let _ = self.tx.send(envelope);
    }

    /// Wrap `event` in an envelope from `source` and publish it.
    pub fn emit(&self, source: &str, event: Event) {
        self.publish(Envelope::new(source, event));
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
