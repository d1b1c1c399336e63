use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use baton_consensus::{AgentProfile, ConsensusVotingSystem, VoteOption};
use baton_core::config::{HandoffConfig, LoadBalancingStrategy, Preset};
use baton_core::error::{BatonError, Result};
use baton_core::event::{Event, EventBus};
use baton_core::hooks::{HandoffHookInfo, HandoffHooks};
use baton_core::traits::*;
use baton_core::types::*;
use baton_handoff::{ContextHandoffManager, ContextHandoffRequest, IdentityCompressor};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::graph::{
    EdgeSelection, GraphExecutor, GraphNode, NodeProcessor, NodeProcessors, PassthroughProcessor,
    WorkflowGraph, WorkflowState,
};
use crate::metrics::HandoffMetrics;
use crate::retry::RetryPolicy;
use crate::selection::{is_contested, AgentSelector, ScoredCandidate};

const EVENT_SOURCE: &str = "coordinator";

/// How a node ended up with the agent that ran it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffRoute {
    /// Context transferred to the selected target.
    Direct,
    /// The external agent ran the node.
    ExternalAgent,
    /// The router picked an alternative agent after the transfer failed.
    RouterFallback,
    /// Nobody took over; the current agent kept the task.
    Degraded,
}

/// One handoff decision taken during a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub node_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub route: HandoffRoute,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<String>,
    pub attempts: u32,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_session: Option<String>,
}

/// Outcome of `execute_task_with_handoffs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub output: serde_json::Value,
    pub execution_path: Vec<String>,
    pub handoffs: Vec<HandoffRecord>,
    /// Agent holding the task when it finished.
    pub final_agent: String,
    /// A fallback kept the task alive at reduced quality.
    pub degraded: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `check_config_health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

struct Inner {
    config: RwLock<HandoffConfig>,
    graph: Arc<WorkflowGraph>,
    entry_node: String,
    edge_selection: EdgeSelection,
    default_agent: String,
    handoffs: Arc<ContextHandoffManager>,
    voting: Arc<ConsensusVotingSystem>,
    router: Arc<dyn CapabilityRouter>,
    runner: Arc<dyn AgentRunner>,
    evaluator: Option<Arc<dyn HandoffEvaluator>>,
    external: Option<Arc<dyn ExternalAgent>>,
    voters: Vec<Arc<dyn DecisionVoter>>,
    hooks: Vec<Arc<dyn HandoffHooks>>,
    process: Arc<dyn NodeProcessor>,
    decision: Arc<dyn NodeProcessor>,
    breaker: CircuitBreaker,
    selector: AgentSelector,
    metrics: Mutex<HandoffMetrics>,
    in_flight: Mutex<HashMap<String, u32>>,
    permits: Arc<Semaphore>,
    permit_budget: Mutex<PermitBudget>,
    event_bus: Arc<EventBus>,
}

/// Size of the transfer semaphore. `debt` counts permits still to be retired
/// after the limit was lowered while they were held.
#[derive(Debug, Default)]
struct PermitBudget {
    total: usize,
    debt: usize,
}

/// Builds a [`HybridHandoffCoordinator`].
pub struct CoordinatorBuilder {
    graph: WorkflowGraph,
    entry_node: String,
    router: Arc<dyn CapabilityRouter>,
    runner: Arc<dyn AgentRunner>,
    event_bus: Arc<EventBus>,
    config: HandoffConfig,
    edge_selection: EdgeSelection,
    default_agent: String,
    compressor: Arc<dyn Compressor>,
    evaluator: Option<Arc<dyn HandoffEvaluator>>,
    external: Option<Arc<dyn ExternalAgent>>,
    voters: Vec<(Arc<dyn DecisionVoter>, Vec<String>)>,
    hooks: Vec<Arc<dyn HandoffHooks>>,
    process: Arc<dyn NodeProcessor>,
    decision: Arc<dyn NodeProcessor>,
}

impl CoordinatorBuilder {
    pub fn new(
        graph: WorkflowGraph,
        entry_node: impl Into<String>,
        router: Arc<dyn CapabilityRouter>,
        runner: Arc<dyn AgentRunner>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            graph,
            entry_node: entry_node.into(),
            router,
            runner,
            event_bus,
            config: HandoffConfig::default(),
            edge_selection: EdgeSelection::default(),
            default_agent: "generalist".to_string(),
            compressor: Arc::new(IdentityCompressor),
            evaluator: None,
            external: None,
            voters: Vec::new(),
            hooks: Vec::new(),
            process: Arc::new(PassthroughProcessor),
            decision: Arc::new(PassthroughProcessor),
        }
    }

    pub fn config(mut self, config: HandoffConfig) -> Self {
        self.config = config;
        self
    }

    pub fn edge_selection(mut self, selection: EdgeSelection) -> Self {
        self.edge_selection = selection;
        self
    }

    /// Agent holding a task that names none and starts at an untyped node.
    pub fn default_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.default_agent = agent_id.into();
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn HandoffEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn external_agent(mut self, agent: Arc<dyn ExternalAgent>) -> Self {
        self.external = Some(agent);
        self
    }

    /// Add a voter for consensus escalation; it is registered with the
    /// given expertise, which fixes its vote weight.
    pub fn voter(mut self, voter: Arc<dyn DecisionVoter>, expertise: Vec<String>) -> Self {
        self.voters.push((voter, expertise));
        self
    }

    pub fn hook(mut self, hooks: Arc<dyn HandoffHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn process_processor(mut self, processor: Arc<dyn NodeProcessor>) -> Self {
        self.process = processor;
        self
    }

    pub fn decision_processor(mut self, processor: Arc<dyn NodeProcessor>) -> Self {
        self.decision = processor;
        self
    }

    pub fn build(self) -> Result<HybridHandoffCoordinator> {
        self.config.validate()?;
        if !self.graph.contains(&self.entry_node) {
            return Err(BatonError::NodeNotFound {
                node_id: self.entry_node,
                path: vec![],
            });
        }

        let voting = Arc::new(ConsensusVotingSystem::new(self.event_bus.clone()));
        let mut voters = Vec::with_capacity(self.voters.len());
        for (voter, expertise) in self.voters {
            voting.register_agent(AgentProfile::new(voter.agent_id(), expertise))?;
            voters.push(voter);
        }

        let handoffs = Arc::new(ContextHandoffManager::new(
            self.compressor,
            self.event_bus.clone(),
        ));
        let permits = self.config.max_concurrent_handoffs;

        Ok(HybridHandoffCoordinator {
            inner: Arc::new(Inner {
                breaker: CircuitBreaker::new(
                    self.config.circuit_breaker_failure_threshold,
                    Duration::from_millis(self.config.circuit_breaker_timeout_ms),
                ),
                config: RwLock::new(self.config),
                graph: Arc::new(self.graph),
                entry_node: self.entry_node,
                edge_selection: self.edge_selection,
                default_agent: self.default_agent,
                handoffs,
                voting,
                router: self.router,
                runner: self.runner,
                evaluator: self.evaluator,
                external: self.external,
                voters,
                hooks: self.hooks,
                process: self.process,
                decision: self.decision,
                selector: AgentSelector::new(),
                metrics: Mutex::new(HandoffMetrics::default()),
                in_flight: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(permits)),
                permit_budget: Mutex::new(PermitBudget {
                    total: permits,
                    debt: 0,
                }),
                event_bus: self.event_bus,
            }),
        })
    }
}

/// Drives tasks through the workflow graph, moving them between agents with
/// retries, a circuit breaker, fallbacks and consensus escalation.
#[derive(Clone)]
pub struct HybridHandoffCoordinator {
    inner: Arc<Inner>,
}

impl HybridHandoffCoordinator {
    /// Run a task from its entry node to completion.
    ///
    /// Unrecovered failures emit `handoff.failed.permanently`. With fallback
    /// mechanisms enabled they come back as an unsuccessful, degraded
    /// `TaskResult`; otherwise as `Err`.
    pub async fn execute_task_with_handoffs(
        &self,
        task: Task,
        context: ContextMap,
    ) -> Result<TaskResult> {
        let inner = &self.inner;
        let started = Instant::now();
        let entry = task
            .entry_node
            .clone()
            .unwrap_or_else(|| inner.entry_node.clone());

        inner.event_bus.emit(
            EVENT_SOURCE,
            Event::TaskCreated {
                task_id: task.id.clone(),
                description: task.description.clone(),
                priority: task.priority,
            },
        );
        info!(task_id = %task.id, entry = %entry, "Executing task");

        let first_agent = task
            .assigned_agent
            .clone()
            .or_else(|| inner.graph.node(&entry).and_then(|n| n.agent_type.clone()))
            .unwrap_or_else(|| inner.default_agent.clone());
        let run = Arc::new(RunContext {
            task: task.clone(),
            state: Mutex::new(RunState {
                current_agent: first_agent,
                depth: 0,
                handoffs: Vec::new(),
                degraded: false,
                fatal: None,
            }),
        });

        let processors = NodeProcessors {
            agent: Arc::new(AgentNodeProcessor {
                inner: inner.clone(),
                run: run.clone(),
            }),
            process: inner.process.clone(),
            decision: inner.decision.clone(),
        };
        let executor = GraphExecutor::new(inner.graph.clone(), processors)
            .with_edge_selection(inner.edge_selection);

        let outcome = executor.execute(&entry, context).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let (handoffs, degraded, final_agent, fatal) = run.finish();

        let failure = match outcome {
            Ok(result) if result.success => {
                if degraded {
                    inner.metrics().degraded_tasks += 1;
                }
                inner.event_bus.emit(
                    EVENT_SOURCE,
                    Event::TaskCompleted {
                        task_id: task.id.clone(),
                        duration: duration_ms,
                        handoff_count: handoffs.len(),
                        degraded,
                    },
                );
                info!(
                    task_id = %task.id,
                    steps = result.execution_path.len(),
                    handoffs = handoffs.len(),
                    degraded,
                    duration_ms,
                    "Task completed"
                );
                return Ok(TaskResult {
                    task_id: task.id,
                    success: true,
                    output: result.output,
                    execution_path: result.execution_path,
                    handoffs,
                    final_agent,
                    degraded,
                    duration_ms,
                    error: None,
                });
            }
            Ok(result) => fatal.unwrap_or_else(|| BatonError::NodeProcessing {
                node_id: String::new(),
                message: result.error.unwrap_or_default(),
            }),
            Err(e) => e,
        };

        self.backstop(task, failure, handoffs, final_agent, duration_ms)
    }

    fn backstop(
        &self,
        task: Task,
        failure: BatonError,
        handoffs: Vec<HandoffRecord>,
        final_agent: String,
        duration_ms: u64,
    ) -> Result<TaskResult> {
        let inner = &self.inner;
        error!(task_id = %task.id, kind = failure.kind(), error = %failure, "Task failed permanently");
        inner.event_bus.emit(
            EVENT_SOURCE,
            Event::HandoffFailedPermanently {
                task_id: task.id.clone(),
                error: failure.to_string(),
                kind: failure.kind().to_string(),
            },
        );
        inner.event_bus.emit(
            EVENT_SOURCE,
            Event::TaskFailed {
                task_id: task.id.clone(),
                error: failure.to_string(),
            },
        );

        if !inner.config().enable_fallback_mechanisms {
            return Err(failure);
        }
        inner.metrics().degraded_tasks += 1;
        Ok(TaskResult {
            task_id: task.id,
            success: false,
            output: serde_json::Value::Null,
            execution_path: Vec::new(),
            handoffs,
            final_agent,
            degraded: true,
            duration_ms,
            error: Some(failure.to_string()),
        })
    }

    /// Validate and swap in a new config.
    pub fn update_config(&self, config: HandoffConfig) -> Result<()> {
        config.validate()?;
        let inner = &self.inner;

        {
            let mut budget = inner.permit_budget();
            let wanted = config.max_concurrent_handoffs;
            if wanted > budget.total {
                let grow = wanted - budget.total;
                let repaid = grow.min(budget.debt);
                budget.debt -= repaid;
                inner.permits.add_permits(grow - repaid);
            } else if wanted < budget.total {
                let shrink = budget.total - wanted;
                let forgotten = inner.permits.forget_permits(shrink);
                budget.debt += shrink - forgotten;
                if budget.debt > 0 {
                    debug!(
                        debt = budget.debt,
                        "Concurrency limit lowered while handoffs are in flight"
                    );
                }
            }
            budget.total = wanted;
        }
        inner.breaker.reconfigure(
            config.circuit_breaker_failure_threshold,
            Duration::from_millis(config.circuit_breaker_timeout_ms),
        );
        inner.metrics().trim_history(config.latency_history_size);

        info!(
            max_concurrent = config.max_concurrent_handoffs,
            algorithm = ?config.agent_selection_algorithm,
            "Handoff config updated"
        );
        *inner.config.write().unwrap_or_else(|p| p.into_inner()) = config;
        Ok(())
    }

    pub fn apply_preset(&self, preset: Preset) -> Result<()> {
        self.update_config(HandoffConfig::preset(preset))
    }

    pub fn config(&self) -> HandoffConfig {
        self.inner.config()
    }

    /// Snapshot of the running counters.
    pub fn metrics(&self) -> HandoffMetrics {
        self.inner.metrics().clone()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.breaker.state()
    }

    /// The voting system used for escalations.
    pub fn voting(&self) -> &Arc<ConsensusVotingSystem> {
        &self.inner.voting
    }

    /// Transfer permits not currently held.
    pub fn available_transfer_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn handoff_manager(&self) -> &Arc<ContextHandoffManager> {
        &self.inner.handoffs
    }

    /// Config issues plus operational warnings.
    pub fn check_config_health(&self) -> ConfigHealth {
        let config = self.inner.config();
        let metrics = self.metrics();
        let issues = config.issues();
        let mut warnings = Vec::new();

        if metrics.average_latency_ms > config.latency_target_ms as f64 {
            warnings.push(format!(
                "average handoff latency {:.0}ms exceeds target {}ms",
                metrics.average_latency_ms, config.latency_target_ms
            ));
        }
        match self.breaker_state() {
            BreakerState::Closed => {}
            state => warnings.push(format!("circuit breaker is {:?}", state)),
        }
        if metrics.failure_rate() > 0.5 {
            warnings.push(format!(
                "handoff failure rate {:.0}% is above 50%",
                metrics.failure_rate() * 100.0
            ));
        }

        ConfigHealth {
            healthy: issues.is_empty(),
            issues,
            warnings,
        }
    }
}

impl Inner {
    fn config(&self) -> HandoffConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn metrics(&self) -> MutexGuard<'_, HandoffMetrics> {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn permit_budget(&self) -> MutexGuard<'_, PermitBudget> {
        self.permit_budget.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return a transfer permit, retiring it instead if the limit shrank.
    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut budget = self.permit_budget();
        if budget.debt > 0 {
            budget.debt -= 1;
            permit.forget();
        }
    }

    fn workload(&self, strategy: LoadBalancingStrategy, agent_id: &str) -> u32 {
        match strategy {
            LoadBalancingStrategy::Weighted => self.router.workload(agent_id),
            LoadBalancingStrategy::LeastConnections => self
                .in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(agent_id)
                .copied()
                .unwrap_or(0),
            LoadBalancingStrategy::RoundRobin => 0,
        }
    }

    fn adjust_in_flight(&self, agent_id: &str, delta: i32) {
        let active = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            let entry = in_flight.entry(agent_id.to_string()).or_insert(0);
            *entry = entry.saturating_add_signed(delta);
            *entry
        };
        self.event_bus.emit(
            EVENT_SOURCE,
            Event::AgentWorkloadUpdated {
                agent_id: agent_id.to_string(),
                active_handoffs: active,
            },
        );
    }

    /// LLM evaluator first; the router when it is off, unsure or failing.
    async fn evaluate(&self, request: &EvaluationRequest, config: &HandoffConfig) -> HandoffEvaluation {
        if config.enable_llm_evaluation {
            if let Some(evaluator) = &self.evaluator {
                match evaluator.evaluate(request).await {
                    Ok(verdict) if verdict.confidence >= config.confidence_threshold => {
                        return verdict;
                    }
                    Ok(verdict) => debug!(
                        confidence = verdict.confidence,
                        threshold = config.confidence_threshold,
                        "Evaluator unsure, asking router"
                    ),
                    Err(e) => warn!(error = %e, "Handoff evaluator failed, asking router"),
                }
            }
        }

        match self.router.candidates(&request.task).await {
            Ok(candidates) => {
                let top = candidates
                    .iter()
                    .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                    .cloned();
                match top {
                    Some(top) if top.agent_id != request.current_agent => HandoffEvaluation {
                        should_handoff: true,
                        confidence: top.confidence,
                        candidates,
                        reason: format!("router prefers {}", top.agent_id),
                    },
                    Some(top) => HandoffEvaluation {
                        confidence: top.confidence,
                        ..HandoffEvaluation::stay("router prefers the current agent")
                    },
                    None => HandoffEvaluation::stay("router has no candidates"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Capability router failed during evaluation");
                HandoffEvaluation::stay("router unavailable")
            }
        }
    }

    /// Pick a target, escalating to a vote when the top two are too close.
    async fn choose_target(
        &self,
        task: &Task,
        node: &GraphNode,
        current_agent: &str,
        evaluation: &HandoffEvaluation,
        config: &HandoffConfig,
    ) -> Option<(String, Option<String>)> {
        let candidates = if evaluation.candidates.is_empty() {
            match self.router.candidates(task).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "No candidates available for handoff");
                    return None;
                }
            }
        } else {
            evaluation.candidates.clone()
        };

        let strategy = config.load_balancing_strategy;
        let ranked = self.selector.rank(
            &candidates,
            current_agent,
            config.agent_selection_algorithm,
            strategy,
            |id| self.workload(strategy, id),
        );
        let pick = ranked.first()?.agent_id.clone();

        if config.enable_consensus_escalation
            && !self.voters.is_empty()
            && is_contested(&ranked, config.disagreement_margin)
        {
            if let Some((winner, session)) = self.escalate(task, node, &ranked, config).await {
                return Some((winner, Some(session)));
            }
        }
        Some((pick, None))
    }

    /// Vote among the ranked candidates. `None` keeps the selector's choice.
    async fn escalate(
        &self,
        task: &Task,
        node: &GraphNode,
        ranked: &[ScoredCandidate],
        config: &HandoffConfig,
    ) -> Option<(String, String)> {
        self.metrics().consensus_escalations += 1;
        let options = ranked
            .iter()
            .map(|c| {
                VoteOption::new(&c.agent_id, &c.agent_id)
                    .with_value(serde_json::json!({ "confidence": c.confidence }))
            })
            .collect();
        let topic = format!("handoff target for task {} at node {}", task.id, node.id);
        let session = match self.voting.create_voting_session(topic, options, None) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Could not open consensus session");
                return None;
            }
        };

        let ballot: Vec<AgentCandidate> = ranked
            .iter()
            .map(|c| AgentCandidate::new(&c.agent_id, c.confidence))
            .collect();
        for voter in &self.voters {
            let choice = match voter.choose(task, &ballot).await {
                Ok(choice) => choice,
                Err(e) => {
                    warn!(voter = voter.agent_id(), error = %e, "Voter failed");
                    continue;
                }
            };
            if let Err(e) = self.voting.cast_vote(&session, voter.agent_id(), &choice, None) {
                warn!(voter = voter.agent_id(), error = %e, "Vote rejected");
            }
        }

        let closed = self.voting.close_voting_session(
            &session,
            config.consensus_algorithm,
            Some(config.consensus_threshold),
        );
        // Only the id survives, on the handoff record.
        self.voting.remove_session(&session);
        match closed {
            Ok(result) => result.winning_option.map(|winner| (winner, session)),
            Err(e) => {
                warn!(error = %e, "Could not close consensus session");
                None
            }
        }
    }

    /// Transfer context to `target` under the retry policy and breaker.
    async fn transfer(
        &self,
        task: &Task,
        from: &str,
        target: &str,
        context: &ContextMap,
        config: &HandoffConfig,
    ) -> std::result::Result<(String, ContextMap, u32, u64), (BatonError, u32)> {
        let policy = RetryPolicy::from_config(config);
        let mut attempts = 0;
        let mut last_error = None;

        for retry in 0..policy.max_attempts {
            if config.enable_circuit_breaker {
                if let Err(e) = self.breaker.try_acquire() {
                    self.metrics().record_rejection();
                    warn!(target_agent = target, error = %e, "Handoff rejected by circuit breaker");
                    return Err((e, attempts));
                }
            }
            attempts += 1;
            let info = HandoffHookInfo {
                task_id: task.id.clone(),
                source_agent_id: from.to_string(),
                target_agent_id: target.to_string(),
                attempt: attempts,
            };
            for hook in &self.hooks {
                hook.on_handoff_start(&info);
            }

            let started = Instant::now();
            let outcome = self.transfer_once(task, from, target, context, config).await;
            let latency = started.elapsed().as_millis() as u64;

            match outcome {
                Ok((handoff_id, restored)) => {
                    if config.enable_circuit_breaker {
                        self.breaker.record_success();
                    }
                    self.metrics()
                        .record_success(latency, config.latency_history_size);
                    for hook in &self.hooks {
                        hook.on_handoff_complete(&info, latency);
                    }
                    self.event_bus.emit(
                        EVENT_SOURCE,
                        Event::PerformanceMetric {
                            metric: "handoff.latency".to_string(),
                            value: latency as f64,
                            unit: "ms".to_string(),
                        },
                    );
                    return Ok((handoff_id, restored, attempts, latency));
                }
                Err(e) => {
                    if config.enable_circuit_breaker {
                        self.breaker.record_failure();
                    }
                    self.metrics()
                        .record_failure(latency, config.latency_history_size);
                    for hook in &self.hooks {
                        hook.on_handoff_error(&info, &e);
                    }
                    warn!(
                        task_id = %task.id,
                        target_agent = target,
                        attempt = attempts,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Handoff attempt failed"
                    );
                    last_error = Some(e);
                    if retry + 1 < policy.max_attempts {
                        tokio::time::sleep(policy.delay_for(retry)).await;
                    }
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err((
            BatonError::HandoffExhausted {
                attempts,
                last_error,
            },
            attempts,
        ))
    }

    async fn transfer_once(
        &self,
        task: &Task,
        from: &str,
        target: &str,
        context: &ContextMap,
        config: &HandoffConfig,
    ) -> Result<(String, ContextMap)> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BatonError::Conflict("handoff permits closed".into()))?;
        self.adjust_in_flight(target, 1);

        let request = ContextHandoffRequest::new(from, target, &task.id, context.clone())
            .with_priority(more_urgent(task.priority, config.handoff_priority));
        let response = self.handoffs.initiate_handoff(request).await;
        let handoff_id = response.handoff_id.clone();
        let outcome = if response.success {
            self.handoffs
                .complete_handoff(&handoff_id, target)
                .await
                .map(|restored| (response.handoff_id, restored))
        } else {
            Err(BatonError::Compression(
                response.error.unwrap_or_else(|| "handoff packaging failed".into()),
            ))
        };
        if outcome.is_err() {
            self.handoffs.cancel_handoff(&handoff_id).await;
        }
        self.handoffs.forget(&handoff_id).await;

        self.adjust_in_flight(target, -1);
        self.release(permit);
        outcome
    }
}

fn more_urgent(a: Priority, b: Priority) -> Priority {
    let rank = |p: Priority| match p {
        Priority::Low => 0,
        Priority::Medium => 1,
        Priority::High => 2,
    };
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

struct RunState {
    current_agent: String,
    depth: u32,
    handoffs: Vec<HandoffRecord>,
    degraded: bool,
    fatal: Option<BatonError>,
}

/// Per-task state shared with the agent node processor.
struct RunContext {
    task: Task,
    state: Mutex<RunState>,
}

impl RunContext {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn finish(&self) -> (Vec<HandoffRecord>, bool, String, Option<BatonError>) {
        let mut state = self.state();
        (
            std::mem::take(&mut state.handoffs),
            state.degraded,
            state.current_agent.clone(),
            state.fatal.take(),
        )
    }
}

/// Runs agent nodes: evaluate, maybe hand off, then let the holder work.
struct AgentNodeProcessor {
    inner: Arc<Inner>,
    run: Arc<RunContext>,
}

impl AgentNodeProcessor {
    async fn visit(&self, node: &GraphNode, state: &WorkflowState) -> Result<serde_json::Value> {
        let inner = &self.inner;
        let task = &self.run.task;
        let config = inner.config();
        let (current, depth) = {
            let s = self.run.state();
            (s.current_agent.clone(), s.depth)
        };

        let request = EvaluationRequest {
            task: task.clone(),
            node_id: node.id.clone(),
            current_agent: current.clone(),
            context: state.context.clone(),
            depth,
        };
        let evaluation = inner.evaluate(&request, &config).await;
        let warranted = evaluation.should_handoff
            && evaluation.confidence >= config.minimum_confidence_for_handoff
            && depth < config.max_handoff_depth;
        debug!(
            node_id = %node.id,
            agent = %current,
            should_handoff = evaluation.should_handoff,
            confidence = evaluation.confidence,
            depth,
            warranted,
            "Handoff evaluated"
        );

        let mut context = state.context.clone();
        let mut holder = current.clone();

        if warranted {
            if let Some((target, session)) = inner
                .choose_target(task, node, &current, &evaluation, &config)
                .await
            {
                match inner.transfer(task, &current, &target, &context, &config).await {
                    Ok((handoff_id, restored, attempts, latency_ms)) => {
                        context = restored;
                        holder = target.clone();
                        self.record(HandoffRecord {
                            node_id: node.id.clone(),
                            from_agent: current.clone(),
                            to_agent: target,
                            route: HandoffRoute::Direct,
                            handoff_id: Some(handoff_id),
                            attempts,
                            latency_ms,
                            consensus_session: session,
                        });
                    }
                    Err((failure, attempts)) => {
                        return self
                            .fall_back(node, &current, &target, failure, attempts, context, &config)
                            .await;
                    }
                }
            }
        }

        inner.runner.run(&holder, &node.id, task, &context).await
    }

    /// External agent, then a router-picked alternative, then degraded.
    #[allow(clippy::too_many_arguments)]
    async fn fall_back(
        &self,
        node: &GraphNode,
        current: &str,
        failed_target: &str,
        failure: BatonError,
        attempts: u32,
        context: ContextMap,
        config: &HandoffConfig,
    ) -> Result<serde_json::Value> {
        let inner = &self.inner;
        let task = &self.run.task;

        if !config.enable_fallback_mechanisms {
            return Err(self.fatal(node, failure));
        }
        inner.metrics().fallback_activations += 1;
        info!(
            node_id = %node.id,
            failed_target,
            kind = failure.kind(),
            "Handoff failed, entering fallback chain"
        );

        let mut external_failed = false;
        if let Some(external) = &inner.external {
            match external.can_handle(task).await {
                Ok(true) => match external.handle(task, &context).await {
                    Ok(output) => {
                        self.record(self.fallback_record(
                            node,
                            current,
                            external.name(),
                            HandoffRoute::ExternalAgent,
                            attempts,
                        ));
                        return Ok(output);
                    }
                    Err(e) => {
                        warn!(agent = external.name(), error = %e, "External agent failed");
                        external_failed = true;
                    }
                },
                Ok(false) => debug!(agent = external.name(), "External agent declined task"),
                Err(e) => {
                    warn!(agent = external.name(), error = %e, "External agent unavailable");
                    external_failed = true;
                }
            }
        }

        let try_router = !external_failed || config.fallback_to_router_on_external_error;
        if try_router {
            match inner.router.candidates(task).await {
                Ok(candidates) => {
                    let alternative = candidates
                        .into_iter()
                        .filter(|c| c.agent_id != current && c.agent_id != failed_target)
                        .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
                    if let Some(alt) = alternative {
                        match inner.runner.run(&alt.agent_id, &node.id, task, &context).await {
                            Ok(output) => {
                                self.record(self.fallback_record(
                                    node,
                                    current,
                                    &alt.agent_id,
                                    HandoffRoute::RouterFallback,
                                    attempts,
                                ));
                                return Ok(output);
                            }
                            Err(e) => warn!(agent = %alt.agent_id, error = %e, "Router fallback agent failed"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Router fallback unavailable"),
            }
        }

        if config.fallback_to_local_agents_on_router_error {
            warn!(node_id = %node.id, agent = current, "Degraded: current agent keeps the task");
            let output = inner.runner.run(current, &node.id, task, &context).await?;
            self.record(self.fallback_record(
                node,
                current,
                current,
                HandoffRoute::Degraded,
                attempts,
            ));
            self.run.state().degraded = true;
            return Ok(output);
        }

        Err(self.fatal(node, failure))
    }

    fn fallback_record(
        &self,
        node: &GraphNode,
        from: &str,
        to: &str,
        route: HandoffRoute,
        attempts: u32,
    ) -> HandoffRecord {
        HandoffRecord {
            node_id: node.id.clone(),
            from_agent: from.to_string(),
            to_agent: to.to_string(),
            route,
            handoff_id: None,
            attempts,
            latency_ms: 0,
            consensus_session: None,
        }
    }

    fn record(&self, record: HandoffRecord) {
        let mut s = self.run.state();
        if matches!(record.route, HandoffRoute::Direct | HandoffRoute::RouterFallback) {
            s.current_agent = record.to_agent.clone();
            s.depth += 1;
        }
        s.handoffs.push(record);
    }

    /// Stash the real error for the backstop; the executor only sees a summary.
    fn fatal(&self, node: &GraphNode, failure: BatonError) -> BatonError {
        let summary = BatonError::NodeProcessing {
            node_id: node.id.clone(),
            message: failure.to_string(),
        };
        self.run.state().fatal = Some(failure);
        summary
    }
}

impl NodeProcessor for AgentNodeProcessor {
    fn process<'a>(
        &'a self,
        node: &'a GraphNode,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(self.visit(node, state))
    }
}
