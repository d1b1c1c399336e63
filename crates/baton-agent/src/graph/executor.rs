use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use baton_core::error::{BatonError, Result};
use baton_core::traits::ContextMap;

use super::edge::GraphEdge;
use super::node::{GraphNode, NodeKind};
use super::state::WorkflowState;

/// Hard ceiling on node visits per run.
pub const MAX_ITERATIONS: usize = 100;

/// How the next edge is picked when a node has several outbound edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSelection {
    /// Take the first outbound edge; conditions are ignored.
    #[default]
    FirstOutbound,
    /// Take the first edge whose condition is absent or holds. No match ends
    /// the run successfully.
    EvaluateConditions,
}

/// Nodes and edges of a workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    nodes: HashMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: GraphNode) -> Result<()> {
        if node.id.trim().is_empty() {
            return Err(BatonError::Validation("node id must not be empty".into()));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(BatonError::Validation(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Both endpoints must already be in the graph.
    pub fn add_edge(&mut self, mut edge: GraphEdge) -> Result<()> {
        for endpoint in [&edge.source, &edge.target] {
            if !self.nodes.contains_key(endpoint) {
                return Err(BatonError::NodeNotFound {
                    node_id: endpoint.clone(),
                    path: vec![],
                });
            }
        }
        if edge.id.is_empty() {
            edge.id = format!("{}->{}", edge.source, edge.target);
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Outbound edges of a node, in insertion order.
    pub fn outbound_edges(&self, node_id: &str) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }
}

/// Executes one node kind.
pub trait NodeProcessor: Send + Sync + 'static {
    fn process<'a>(
        &'a self,
        node: &'a GraphNode,
        state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Records that a node ran, as `{"<id>_status": "completed"}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

impl NodeProcessor for PassthroughProcessor {
    fn process<'a>(
        &'a self,
        node: &'a GraphNode,
        _state: &'a WorkflowState,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let mut out = serde_json::Map::new();
            out.insert(
                format!("{}_status", node.id),
                serde_json::Value::String("completed".into()),
            );
            Ok(serde_json::Value::Object(out))
        })
    }
}

/// One processor per node kind.
#[derive(Clone)]
pub struct NodeProcessors {
    pub agent: Arc<dyn NodeProcessor>,
    pub process: Arc<dyn NodeProcessor>,
    pub decision: Arc<dyn NodeProcessor>,
}

impl NodeProcessors {
    /// The same processor for every kind.
    pub fn uniform(processor: Arc<dyn NodeProcessor>) -> Self {
        Self {
            agent: processor.clone(),
            process: processor.clone(),
            decision: processor,
        }
    }

    pub fn with_agent(mut self, processor: Arc<dyn NodeProcessor>) -> Self {
        self.agent = processor;
        self
    }

    pub fn with_process(mut self, processor: Arc<dyn NodeProcessor>) -> Self {
        self.process = processor;
        self
    }

    pub fn with_decision(mut self, processor: Arc<dyn NodeProcessor>) -> Self {
        self.decision = processor;
        self
    }

    pub fn for_kind(&self, kind: NodeKind) -> &Arc<dyn NodeProcessor> {
        match kind {
            NodeKind::Agent => &self.agent,
            NodeKind::Process => &self.process,
            NodeKind::Decision => &self.decision,
        }
    }
}

impl Default for NodeProcessors {
    fn default() -> Self {
        Self::uniform(Arc::new(PassthroughProcessor))
    }
}

/// Outcome of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub success: bool,
    pub final_state: WorkflowState,
    /// Output of the last node executed.
    pub output: serde_json::Value,
    pub execution_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestrationResult {
    fn failed(error: &BatonError) -> Self {
        Self {
            success: false,
            final_state: WorkflowState::default(),
            output: serde_json::Value::Null,
            execution_path: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Walks a workflow graph from an entry node.
pub struct GraphExecutor {
    graph: Arc<WorkflowGraph>,
    processors: NodeProcessors,
    edge_selection: EdgeSelection,
    max_iterations: usize,
}

impl GraphExecutor {
    pub fn new(graph: Arc<WorkflowGraph>, processors: NodeProcessors) -> Self {
        Self {
            graph,
            processors,
            edge_selection: EdgeSelection::default(),
            max_iterations: MAX_ITERATIONS,
        }
    }

    pub fn with_edge_selection(mut self, selection: EdgeSelection) -> Self {
        self.edge_selection = selection;
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Run the workflow.
    ///
    /// Unknown nodes and the iteration ceiling are errors carrying the path
    /// walked so far. A processor failure is reported as an unsuccessful
    /// result instead.
    pub async fn execute(
        &self,
        initial_node_id: &str,
        initial_context: ContextMap,
    ) -> Result<OrchestrationResult> {
        if !self.graph.contains(initial_node_id) {
            return Err(BatonError::NodeNotFound {
                node_id: initial_node_id.to_string(),
                path: vec![],
            });
        }

        let start = Instant::now();
        let mut state = WorkflowState::new(initial_node_id, initial_context);
        let mut path: Vec<String> = Vec::new();
        let mut output: serde_json::Value;
        let mut current = initial_node_id.to_string();

        loop {
            if path.len() >= self.max_iterations {
                warn!(limit = self.max_iterations, node_id = %current, "Workflow iteration ceiling hit");
                return Err(BatonError::WorkflowExceededIterations {
                    limit: self.max_iterations,
                    path,
                });
            }

            let node = self
                .graph
                .node(&current)
                .ok_or_else(|| BatonError::NodeNotFound {
                    node_id: current.clone(),
                    path: path.clone(),
                })?;
            path.push(node.id.clone());
            state.current_node_id = node.id.clone();

            debug!(node_id = %node.id, kind = %node.kind, "Executing workflow node");
            let input = state.context_snapshot();
            output = match self.processors.for_kind(node.kind).process(node, &state).await {
                Ok(out) => out,
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Workflow node failed");
                    return Ok(OrchestrationResult::failed(&e));
                }
            };
            state.record(&node.id, input, output.clone());
            state.fold_output(&node.id, &output);

            let outbound = self.graph.outbound_edges(&node.id);
            if outbound.is_empty() {
                debug!(node_id = %node.id, "No outbound edges, workflow complete");
                break;
            }
            let next = match self.edge_selection {
                EdgeSelection::FirstOutbound => outbound.first().map(|e| e.target.clone()),
                EdgeSelection::EvaluateConditions => outbound
                    .iter()
                    .find(|e| e.admits(&state.context))
                    .map(|e| e.target.clone()),
            };
            match next {
                Some(next) => current = next,
                None => {
                    debug!(node_id = %node.id, "No edge condition matched, workflow complete");
                    break;
                }
            }
        }

        info!(
            steps = path.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Workflow complete"
        );
        Ok(OrchestrationResult {
            success: true,
            final_state: state,
            output,
            execution_path: path,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Returns a fixed value per node id, `null` otherwise.
    struct Scripted(HashMap<String, serde_json::Value>);

    impl NodeProcessor for Scripted {
        fn process<'a>(
            &'a self,
            node: &'a GraphNode,
            _state: &'a WorkflowState,
        ) -> BoxFuture<'a, Result<serde_json::Value>> {
            Box::pin(async move { Ok(self.0.get(&node.id).cloned().unwrap_or_default()) })
        }
    }

    struct Failing;

    impl NodeProcessor for Failing {
        fn process<'a>(
            &'a self,
            node: &'a GraphNode,
            _state: &'a WorkflowState,
        ) -> BoxFuture<'a, Result<serde_json::Value>> {
            Box::pin(async move {
                Err(BatonError::NodeProcessing {
                    node_id: node.id.clone(),
                    message: "agent crashed".into(),
                })
            })
        }
    }

    fn chain(ids: &[&str]) -> WorkflowGraph {
        let mut g = WorkflowGraph::new();
        for id in ids {
            g.add_node(GraphNode::process(*id)).unwrap();
        }
        for pair in ids.windows(2) {
            g.add_edge(GraphEdge::new(pair[0], pair[1])).unwrap();
        }
        g
    }

    fn executor(graph: WorkflowGraph) -> GraphExecutor {
        GraphExecutor::new(Arc::new(graph), NodeProcessors::default())
    }

    #[tokio::test]
    async fn test_single_node() {
        let mut g = WorkflowGraph::new();
        g.add_node(GraphNode::agent("solo", "writer")).unwrap();
        let scripted = Arc::new(Scripted(HashMap::from([(
            "solo".to_string(),
            json!("the answer"),
        )])));
        let exec = GraphExecutor::new(Arc::new(g), NodeProcessors::uniform(scripted));

        let result = exec.execute("solo", ContextMap::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.execution_path, vec!["solo"]);
        assert_eq!(result.output, json!("the answer"));
        assert_eq!(result.final_state.history.len(), 1);
    }

    #[tokio::test]
    async fn test_acyclic_terminates_within_node_count() {
        let ids = ["a", "b", "c", "d", "e"];
        let exec = executor(chain(&ids));
        let result = exec.execute("a", ContextMap::new()).await.unwrap();
        assert!(result.success);
        assert!(result.execution_path.len() <= exec.graph().node_count());
        assert_eq!(result.execution_path, ids);
        assert_eq!(result.final_state.get_str("e_status"), Some("completed"));
    }

    #[tokio::test]
    async fn test_cycle_fails_after_exactly_limit() {
        let mut g = chain(&["a", "b"]);
        g.add_edge(GraphEdge::new("b", "a")).unwrap();
        let err = executor(g).execute("a", ContextMap::new()).await.unwrap_err();
        match err {
            BatonError::WorkflowExceededIterations { limit, path } => {
                assert_eq!(limit, MAX_ITERATIONS);
                assert_eq!(path.len(), MAX_ITERATIONS);
                assert_eq!(path[0], "a");
                assert_eq!(path[99], "b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_initial_node_rejected() {
        let err = executor(chain(&["a"]))
            .execute("ghost", ContextMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_processor_error_is_unsuccessful_result() {
        let exec = GraphExecutor::new(
            Arc::new(chain(&["a", "b"])),
            NodeProcessors::default().with_process(Arc::new(Failing)),
        );
        let result = exec.execute("a", ContextMap::new()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("agent crashed"));
        assert!(result.execution_path.is_empty());
        assert_eq!(result.final_state, WorkflowState::default());
    }

    #[tokio::test]
    async fn test_first_outbound_ignores_conditions() {
        let mut g = chain(&["start", "left", "right"]);
        g.edges.clear();
        g.add_edge(GraphEdge::conditional("start", "left", r#"go == "right""#))
            .unwrap();
        g.add_edge(GraphEdge::new("start", "right")).unwrap();

        let result = executor(g).execute("start", ContextMap::new()).await.unwrap();
        assert_eq!(result.execution_path, vec!["start", "left"]);
    }

    #[tokio::test]
    async fn test_decision_output_steers_conditions() {
        let mut g = WorkflowGraph::new();
        for node in [
            GraphNode::decision("route"),
            GraphNode::process("fix"),
            GraphNode::process("ship"),
        ] {
            g.add_node(node).unwrap();
        }
        g.add_edge(GraphEdge::conditional("route", "fix", r#"verdict == "fail""#))
            .unwrap();
        g.add_edge(GraphEdge::conditional("route", "ship", r#"verdict == "pass""#))
            .unwrap();

        let decide = Arc::new(Scripted(HashMap::from([(
            "route".to_string(),
            json!({"verdict": "pass"}),
        )])));
        let exec = GraphExecutor::new(Arc::new(g), NodeProcessors::default().with_decision(decide))
            .with_edge_selection(EdgeSelection::EvaluateConditions);

        let result = exec.execute("route", ContextMap::new()).await.unwrap();
        assert_eq!(result.execution_path, vec!["route", "ship"]);
        assert_eq!(result.final_state.get_str("verdict"), Some("pass"));
    }

    #[tokio::test]
    async fn test_no_matching_condition_ends_run() {
        let mut g = chain(&["a", "b"]);
        g.edges.clear();
        g.add_edge(GraphEdge::conditional("a", "b", r#"never == "true""#))
            .unwrap();
        let exec = executor(g).with_edge_selection(EdgeSelection::EvaluateConditions);
        let result = exec.execute("a", ContextMap::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.execution_path, vec!["a"]);
    }

    #[test]
    fn test_graph_validation() {
        let mut g = chain(&["a"]);
        assert!(matches!(
            g.add_node(GraphNode::process("a")),
            Err(BatonError::Validation(_))
        ));
        assert!(matches!(
            g.add_edge(GraphEdge::new("a", "nowhere")),
            Err(BatonError::NodeNotFound { .. })
        ));
        assert!(g.outbound_edges("a").is_empty());
    }

    #[tokio::test]
    async fn test_history_records_inputs() {
        let mut ctx = ContextMap::new();
        ctx.insert("ticket".into(), json!("BAT-1"));
        let result = executor(chain(&["a", "b"])).execute("a", ctx).await.unwrap();
        let history = &result.final_state.history;
        assert_eq!(history[0].input["ticket"], "BAT-1");
        assert_eq!(history[1].input["a_status"], "completed");
    }
}
