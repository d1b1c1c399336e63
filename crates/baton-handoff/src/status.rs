use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use baton_core::error::{BatonError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffState {
    Pending,
    Transferring,
    Completed,
    Failed,
}

impl HandoffState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Transferring => 1,
            Self::Completed => 2,
            Self::Failed => 3,
        }
    }
}

/// Progress of one handoff id through
/// `pending(0) → transferring(50) → transferring(75) → completed(100)`,
/// with `failed(0)` reachable from any non-terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffStatus {
    pub handoff_id: String,
    pub status: HandoffState,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandoffStatus {
    pub fn pending(handoff_id: impl Into<String>) -> Self {
        Self {
            handoff_id: handoff_id.into(),
            status: HandoffState::Pending,
            progress: 0,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Move forward. Going backwards, standing still, or leaving a terminal
    /// state is a conflict.
    pub fn advance(&mut self, next: HandoffState, progress: u8) -> Result<()> {
        if next == HandoffState::Failed {
            return Err(BatonError::Validation(
                "use HandoffStatus::fail to mark a handoff failed".into(),
            ));
        }
        self.ensure_open(next)?;

        let forward = next.rank() > self.status.rank()
            || (next == self.status && progress > self.progress);
        if !forward || progress < self.progress || progress > 100 {
            return Err(BatonError::Conflict(format!(
                "handoff {}: illegal transition {:?}({}) -> {:?}({})",
                self.handoff_id, self.status, self.progress, next, progress
            )));
        }
        if next == HandoffState::Completed && progress != 100 {
            return Err(BatonError::Conflict(format!(
                "handoff {}: completion must report 100% progress",
                self.handoff_id
            )));
        }

        self.status = next;
        self.progress = progress;
        self.timestamp = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_open(HandoffState::Failed)?;
        self.status = HandoffState::Failed;
        self.progress = 0;
        self.error = Some(error.into());
        self.timestamp = Utc::now();
        Ok(())
    }

    fn ensure_open(&self, next: HandoffState) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BatonError::Conflict(format!(
                "handoff {} is already {:?}, cannot move to {:?}",
                self.handoff_id, self.status, next
            )));
        }
        Ok(())
    }
}
