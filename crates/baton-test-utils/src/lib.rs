//! Mock collaborators shared by the Baton test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, Semaphore};

use baton_core::error::{BatonError, Result};
use baton_core::event::Envelope;
use baton_core::hooks::{HandoffHookInfo, HandoffHooks};
use baton_core::traits::*;
use baton_core::types::*;

/// Identity codec that counts calls and remembers the last options.
#[derive(Default)]
pub struct MockCompressor {
    pub compress_calls: AtomicUsize,
    pub decompress_calls: AtomicUsize,
    pub last_options: Mutex<Option<CompressionOptions>>,
}

impl MockCompressor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_quality(&self) -> Option<CompressionQuality> {
        self.last_options.lock().unwrap().as_ref().map(|o| o.quality)
    }
}

impl Compressor for MockCompressor {
    fn compress<'a>(
        &'a self,
        text: &'a str,
        options: &'a CompressionOptions,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.compress_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_options.lock().unwrap() = Some(options.clone());
            Ok(text.as_bytes().to_vec())
        })
    }

    fn decompress<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.decompress_calls.fetch_add(1, Ordering::SeqCst);
            String::from_utf8(bytes.to_vec()).map_err(|e| BatonError::Compression(e.to_string()))
        })
    }
}

/// Codec whose first `failures` compress calls fail.
pub struct FlakyCompressor {
    failures: usize,
    pub compress_calls: AtomicUsize,
}

impl FlakyCompressor {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            compress_calls: AtomicUsize::new(0),
        })
    }

    /// A codec that never succeeds.
    pub fn broken() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.compress_calls.load(Ordering::SeqCst)
    }
}

impl Compressor for FlakyCompressor {
    fn compress<'a>(
        &'a self,
        text: &'a str,
        _options: &'a CompressionOptions,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let n = self.compress_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(BatonError::Compression("codec unavailable".into()))
            } else {
                Ok(text.as_bytes().to_vec())
            }
        })
    }

    fn decompress<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            String::from_utf8(bytes.to_vec()).map_err(|e| BatonError::Compression(e.to_string()))
        })
    }
}

/// Identity codec that holds each compress call, either until `release`
/// lets it through or for a fixed delay. Records the most calls seen in
/// flight at once.
pub struct GatedCompressor {
    delay: Option<Duration>,
    entered: Semaphore,
    gate: Semaphore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedCompressor {
    /// Every call waits for `release`.
    pub fn closed() -> Arc<Self> {
        Self::build(None)
    }

    /// Every call sleeps for `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(Some(delay))
    }

    fn build(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            entered: Semaphore::new(0),
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Wait until `n` more compress calls have started.
    pub async fn wait_entered(&self, n: u32) {
        if let Ok(permits) = self.entered.acquire_many(n).await {
            permits.forget();
        }
    }

    /// Let `n` held calls finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Compressor for GatedCompressor {
    fn compress<'a>(
        &'a self,
        text: &'a str,
        _options: &'a CompressionOptions,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.entered.add_permits(1);
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    if let Ok(permit) = self.gate.acquire().await {
                        permit.forget();
                    }
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(text.as_bytes().to_vec())
        })
    }

    fn decompress<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            String::from_utf8(bytes.to_vec()).map_err(|e| BatonError::Compression(e.to_string()))
        })
    }
}

/// Router with a fixed candidate list and workload table.
#[derive(Default)]
pub struct StaticRouter {
    pub candidates: Vec<AgentCandidate>,
    pub workloads: HashMap<String, u32>,
    pub fail: bool,
}

impl StaticRouter {
    pub fn new(candidates: Vec<AgentCandidate>) -> Self {
        Self {
            candidates,
            ..Self::default()
        }
    }

    pub fn with_workload(mut self, agent_id: &str, load: u32) -> Self {
        self.workloads.insert(agent_id.to_string(), load);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl CapabilityRouter for StaticRouter {
    fn select_agent<'a>(&'a self, _task: &'a Task) -> BoxFuture<'a, Result<AgentCandidate>> {
        Box::pin(async move {
            if self.fail {
                return Err(BatonError::Routing("router offline".into()));
            }
            self.candidates
                .iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .cloned()
                .ok_or_else(|| BatonError::Routing("no agents".into()))
        })
    }

    fn candidates<'a>(&'a self, _task: &'a Task) -> BoxFuture<'a, Result<Vec<AgentCandidate>>> {
        Box::pin(async move {
            if self.fail {
                return Err(BatonError::Routing("router offline".into()));
            }
            Ok(self.candidates.clone())
        })
    }

    fn workload(&self, agent_id: &str) -> u32 {
        self.workloads.get(agent_id).copied().unwrap_or(0)
    }
}

/// Evaluator returning a canned verdict (or error) and counting calls.
pub struct ScriptedEvaluator {
    verdict: Option<HandoffEvaluation>,
    pub calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn handoff(confidence: f64, candidates: Vec<AgentCandidate>) -> Self {
        Self {
            verdict: Some(HandoffEvaluation {
                should_handoff: true,
                confidence,
                candidates,
                reason: "scripted".into(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn stay() -> Self {
        Self {
            verdict: Some(HandoffEvaluation::stay("scripted")),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            verdict: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HandoffEvaluator for ScriptedEvaluator {
    fn evaluate<'a>(
        &'a self,
        _request: &'a EvaluationRequest,
    ) -> BoxFuture<'a, Result<HandoffEvaluation>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
                .clone()
                .ok_or_else(|| BatonError::Evaluation("evaluator offline".into()))
        })
    }
}

/// Agent runner that echoes who ran which node.
#[derive(Default)]
pub struct EchoRunner {
    pub calls: Mutex<Vec<(String, String)>>,
}

impl EchoRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentRunner for EchoRunner {
    fn run<'a>(
        &'a self,
        agent_id: &'a str,
        node_id: &'a str,
        _task: &'a Task,
        context: &'a ContextMap,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((agent_id.to_string(), node_id.to_string()));
            Ok(serde_json::json!({
                "handled_by": agent_id,
                "node": node_id,
                "context_keys": context.len(),
            }))
        })
    }
}

/// Voter with a fixed preference.
pub struct FixedVoter {
    pub id: String,
    pub choice: String,
}

impl FixedVoter {
    pub fn new(id: &str, choice: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            choice: choice.to_string(),
        })
    }
}

impl DecisionVoter for FixedVoter {
    fn agent_id(&self) -> &str {
        &self.id
    }

    fn choose<'a>(
        &'a self,
        _task: &'a Task,
        _options: &'a [AgentCandidate],
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Ok(self.choice.clone()) })
    }
}

/// External agent with a fixed willingness and outcome.
pub struct MockExternalAgent {
    pub accepts: bool,
    pub succeeds: bool,
    pub calls: AtomicUsize,
}

impl MockExternalAgent {
    pub fn new(accepts: bool, succeeds: bool) -> Arc<Self> {
        Arc::new(Self {
            accepts,
            succeeds,
            calls: AtomicUsize::new(0),
        })
    }
}

impl ExternalAgent for MockExternalAgent {
    fn name(&self) -> &str {
        "mock-external"
    }

    fn can_handle<'a>(&'a self, _task: &'a Task) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.accepts) })
    }

    fn handle<'a>(
        &'a self,
        task: &'a Task,
        _context: &'a ContextMap,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeeds {
                Ok(serde_json::json!({"handled_by": "mock-external", "task": task.id}))
            } else {
                Err(BatonError::ExternalAgent("external sdk unavailable".into()))
            }
        })
    }
}

/// Hooks that count how often each callback fired.
#[derive(Default)]
pub struct CountingHooks {
    pub starts: AtomicUsize,
    pub completes: AtomicUsize,
    pub errors: AtomicUsize,
}

impl CountingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.starts.load(Ordering::SeqCst),
            self.completes.load(Ordering::SeqCst),
            self.errors.load(Ordering::SeqCst),
        )
    }
}

impl HandoffHooks for CountingHooks {
    fn on_handoff_start(&self, _info: &HandoffHookInfo) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_handoff_complete(&self, _info: &HandoffHookInfo, _duration_ms: u64) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_handoff_error(&self, _info: &HandoffHookInfo, _error: &BatonError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drain every event currently buffered on a subscription.
pub fn drain_events(rx: &mut broadcast::Receiver<Envelope>) -> Vec<Envelope> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope);
    }
    events
}

/// Event type names, in publication order.
pub fn event_types(events: &[Envelope]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

/// Context map from `(key, json)` pairs.
pub fn context(pairs: &[(&str, serde_json::Value)]) -> ContextMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
