use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use baton_core::error::{BatonError, Result};
use baton_core::event::{Event, EventBus};
use baton_core::traits::{Compressor, ContextMap};
use baton_core::types::{CompressionOptions, Priority};

use crate::status::{HandoffState, HandoffStatus};
use crate::store::{ContextStore, MemoryContextStore, StoredContext};

const EVENT_SOURCE: &str = "handoff-manager";

/// Request to move a task's context from one agent to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHandoffRequest {
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub task_id: String,
    pub context: ContextMap,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl ContextHandoffRequest {
    pub fn new(
        source_agent_id: impl Into<String>,
        target_agent_id: impl Into<String>,
        task_id: impl Into<String>,
        context: ContextMap,
    ) -> Self {
        Self {
            source_agent_id: source_agent_id.into(),
            target_agent_id: target_agent_id.into(),
            task_id: task_id.into(),
            context,
            priority: Priority::default(),
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHandoffResponse {
    pub success: bool,
    pub handoff_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<usize>,
    /// Milliseconds spent packaging and storing the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PendingHandoff {
    request: ContextHandoffRequest,
    initiated_at: Instant,
}

/// Packages, parks and restores agent context, one handoff id at a time.
///
/// Lock order is always `pending` then `statuses`.
pub struct ContextHandoffManager {
    compressor: Arc<dyn Compressor>,
    store: Arc<dyn ContextStore>,
    event_bus: Arc<EventBus>,
    pending: Mutex<HashMap<String, PendingHandoff>>,
    statuses: Mutex<HashMap<String, HandoffStatus>>,
}

impl ContextHandoffManager {
    pub fn new(compressor: Arc<dyn Compressor>, event_bus: Arc<EventBus>) -> Self {
        Self::with_store(compressor, Arc::new(MemoryContextStore::new()), event_bus)
    }

    pub fn with_store(
        compressor: Arc<dyn Compressor>,
        store: Arc<dyn ContextStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            compressor,
            store,
            event_bus,
            pending: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Start a handoff. Failures are reported in the response, never as `Err`.
    pub async fn initiate_handoff(&self, request: ContextHandoffRequest) -> ContextHandoffResponse {
        let handoff_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        self.statuses
            .lock()
            .await
            .insert(handoff_id.clone(), HandoffStatus::pending(&handoff_id));
        self.pending.lock().await.insert(
            handoff_id.clone(),
            PendingHandoff {
                request: request.clone(),
                initiated_at: started,
            },
        );

        self.event_bus.emit(
            EVENT_SOURCE,
            Event::HandoffInitiated {
                handoff_id: handoff_id.clone(),
                source_agent_id: request.source_agent_id.clone(),
                target_agent_id: request.target_agent_id.clone(),
                task_id: request.task_id.clone(),
                priority: request.priority,
            },
        );
        debug!(
            handoff_id = %handoff_id,
            source = %request.source_agent_id,
            target = %request.target_agent_id,
            "Handoff initiated"
        );

        match self.package(&handoff_id, &request).await {
            Ok(compressed_size) => {
                let elapsed = started.elapsed().as_millis() as u64;
                info!(handoff_id = %handoff_id, compressed_size, elapsed_ms = elapsed, "Context packaged");
                ContextHandoffResponse {
                    success: true,
                    handoff_id,
                    compressed_size: Some(compressed_size),
                    transfer_time_ms: Some(elapsed),
                    error: None,
                }
            }
            Err(e) => {
                warn!(handoff_id = %handoff_id, error = %e, "Handoff packaging failed");
                self.fail(&handoff_id, &request, &e).await;
                ContextHandoffResponse {
                    success: false,
                    handoff_id,
                    compressed_size: None,
                    transfer_time_ms: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn package(&self, handoff_id: &str, request: &ContextHandoffRequest) -> Result<usize> {
        let serialized = serde_json::to_string(&request.context)
            .map_err(|e| BatonError::Serialization(e.to_string()))?;
        let options = CompressionOptions::for_priority(request.priority);
        let payload = self.compressor.compress(&serialized, &options).await?;

        // A cancel that raced the codec wins.
        if !self.pending.lock().await.contains_key(handoff_id) {
            return Err(BatonError::Conflict(format!(
                "handoff {} was cancelled during compression",
                handoff_id
            )));
        }
        self.advance(handoff_id, HandoffState::Transferring, 50).await?;

        let original_size = serialized.len();
        let compressed_size = payload.len();
        let ratio = if original_size == 0 {
            1.0
        } else {
            compressed_size as f64 / original_size as f64
        };
        self.event_bus.emit(
            EVENT_SOURCE,
            Event::ContextCompressed {
                handoff_id: handoff_id.to_string(),
                original_size,
                compressed_size,
                ratio,
            },
        );

        self.store
            .put(
                handoff_id,
                StoredContext {
                    payload,
                    original_size,
                    quality: options.quality,
                    stored_at: Utc::now(),
                },
            )
            .await?;
        self.advance(handoff_id, HandoffState::Transferring, 75).await?;
        Ok(compressed_size)
    }

    /// Claim and restore a handoff's context. Only the named target may claim
    /// it, and only once.
    pub async fn complete_handoff(
        &self,
        handoff_id: &str,
        target_agent_id: &str,
    ) -> Result<ContextMap> {
        let claimed = {
            let mut pending = self.pending.lock().await;
            let entry = pending
                .get(handoff_id)
                .ok_or_else(|| BatonError::HandoffNotFound(handoff_id.to_string()))?;
            if entry.request.target_agent_id != target_agent_id {
                return Err(BatonError::HandoffMisdirected {
                    handoff_id: handoff_id.to_string(),
                    expected: entry.request.target_agent_id.clone(),
                    actual: target_agent_id.to_string(),
                });
            }
            let ready = self.statuses.lock().await.get(handoff_id).map_or(false, |s| {
                s.status == HandoffState::Transferring && s.progress >= 75
            });
            if !ready {
                return Err(BatonError::Conflict(format!(
                    "handoff {} is not ready to complete",
                    handoff_id
                )));
            }
            pending.remove(handoff_id)
        };
        let Some(claimed) = claimed else {
            return Err(BatonError::HandoffNotFound(handoff_id.to_string()));
        };
        let request = claimed.request;

        if let Some(deadline) = request.deadline {
            if Utc::now() > deadline {
                let err = BatonError::HandoffExpired(handoff_id.to_string());
                self.fail(handoff_id, &request, &err).await;
                return Err(err);
            }
        }

        match self.restore(handoff_id).await {
            Ok(context) => {
                let _ = self.store.delete(handoff_id).await;
                self.advance(handoff_id, HandoffState::Completed, 100).await?;

                let duration = claimed.initiated_at.elapsed().as_millis() as u64;
                self.event_bus.emit(
                    EVENT_SOURCE,
                    Event::HandoffCompleted {
                        handoff_id: handoff_id.to_string(),
                        source_agent_id: request.source_agent_id.clone(),
                        target_agent_id: request.target_agent_id.clone(),
                        task_id: request.task_id.clone(),
                        result: serde_json::json!({ "restored_keys": context.len() }),
                        duration,
                    },
                );
                info!(handoff_id = %handoff_id, target = %target_agent_id, duration_ms = duration, "Handoff completed");
                Ok(context)
            }
            Err(e) => {
                self.fail(handoff_id, &request, &e).await;
                Err(e)
            }
        }
    }

    async fn restore(&self, handoff_id: &str) -> Result<ContextMap> {
        let stored = self
            .store
            .get(handoff_id)
            .await?
            .ok_or_else(|| BatonError::HandoffNotFound(handoff_id.to_string()))?;
        let text = self.compressor.decompress(&stored.payload).await?;
        let context: ContextMap =
            serde_json::from_str(&text).map_err(|e| BatonError::Serialization(e.to_string()))?;
        self.event_bus.emit(
            EVENT_SOURCE,
            Event::ContextDecompressed {
                handoff_id: handoff_id.to_string(),
                size: text.len(),
            },
        );
        Ok(context)
    }

    pub async fn get_handoff_status(&self, handoff_id: &str) -> Option<HandoffStatus> {
        self.statuses.lock().await.get(handoff_id).cloned()
    }

    /// Drop a handoff that has not been claimed yet.
    pub async fn cancel_handoff(&self, handoff_id: &str) -> bool {
        let removed = {
            let mut pending = self.pending.lock().await;
            let removed = pending.remove(handoff_id);
            if removed.is_some() {
                self.statuses.lock().await.remove(handoff_id);
            }
            removed
        };
        if removed.is_none() {
            return false;
        }
        if let Err(e) = self.store.delete(handoff_id).await {
            warn!(handoff_id = %handoff_id, error = %e, "Failed to delete cancelled payload");
        }
        self.event_bus.emit(
            EVENT_SOURCE,
            Event::HandoffCancelled {
                handoff_id: handoff_id.to_string(),
            },
        );
        debug!(handoff_id = %handoff_id, "Handoff cancelled");
        true
    }

    /// Handoffs initiated but not yet claimed, failed or cancelled.
    pub async fn active_handoffs(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Forget statuses of completed and failed handoffs. Returns how many.
    pub async fn clear_finished(&self) -> usize {
        let mut statuses = self.statuses.lock().await;
        let before = statuses.len();
        statuses.retain(|_, s| !s.status.is_terminal());
        before - statuses.len()
    }

    /// Drop the status of one completed or failed handoff. Returns false for
    /// unknown ids and handoffs still in flight.
    pub async fn forget(&self, handoff_id: &str) -> bool {
        let mut statuses = self.statuses.lock().await;
        let finished = statuses
            .get(handoff_id)
            .map_or(false, |s| s.status.is_terminal());
        if finished {
            statuses.remove(handoff_id);
        }
        finished
    }

    async fn advance(&self, handoff_id: &str, next: HandoffState, progress: u8) -> Result<()> {
        let mut statuses = self.statuses.lock().await;
        let status = statuses
            .get_mut(handoff_id)
            .ok_or_else(|| BatonError::HandoffNotFound(handoff_id.to_string()))?;
        status.advance(next, progress)
    }

    /// Mark a handoff failed. A handoff cancelled in the meantime has no
    /// status left and gets no failure event.
    async fn fail(&self, handoff_id: &str, request: &ContextHandoffRequest, error: &BatonError) {
        let tracked = {
            let mut pending = self.pending.lock().await;
            pending.remove(handoff_id);
            match self.statuses.lock().await.get_mut(handoff_id) {
                Some(status) => {
                    if let Err(e) = status.fail(error.to_string()) {
                        debug!(handoff_id = %handoff_id, error = %e, "Status already terminal");
                    }
                    true
                }
                None => false,
            }
        };
        let _ = self.store.delete(handoff_id).await;
        if !tracked {
            debug!(handoff_id = %handoff_id, "Handoff was cancelled, not reporting failure");
            return;
        }
        self.event_bus.emit(
            EVENT_SOURCE,
            Event::HandoffFailed {
                handoff_id: handoff_id.to_string(),
                source_agent_id: request.source_agent_id.clone(),
                target_agent_id: request.target_agent_id.clone(),
                task_id: request.task_id.clone(),
                error: error.to_string(),
            },
        );
    }
}
