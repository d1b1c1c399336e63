use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use baton_core::config::{AgentSelectionAlgorithm, LoadBalancingStrategy};
use baton_core::types::AgentCandidate;

/// A candidate with the signals its rank was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub agent_id: String,
    pub confidence: f64,
    pub workload: u32,
    pub score: f64,
}

/// Combine confidence and workload per the selection algorithm.
pub fn score(algorithm: AgentSelectionAlgorithm, confidence: f64, workload: u32) -> f64 {
    let availability = 1.0 / (1.0 + workload as f64);
    match algorithm {
        AgentSelectionAlgorithm::ConfidenceBased => confidence,
        AgentSelectionAlgorithm::WorkloadBased => availability,
        AgentSelectionAlgorithm::Hybrid => 0.7 * confidence + 0.3 * availability,
    }
}

/// Ranks handoff targets. Holds the round-robin cursor.
#[derive(Debug, Default)]
pub struct AgentSelector {
    cursor: AtomicUsize,
}

impl AgentSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank `candidates` best-first.
    ///
    /// The current agent is never returned and duplicate ids keep their
    /// highest confidence. Round-robin rotates the eligible list on every
    /// call; the other strategies sort by score, keeping the router's order
    /// on ties.
    pub fn rank(
        &self,
        candidates: &[AgentCandidate],
        current_agent: &str,
        algorithm: AgentSelectionAlgorithm,
        strategy: LoadBalancingStrategy,
        workload: impl Fn(&str) -> u32,
    ) -> Vec<ScoredCandidate> {
        let mut best: Vec<AgentCandidate> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for candidate in candidates {
            if candidate.agent_id == current_agent || candidate.agent_id.is_empty() {
                continue;
            }
            match index.get(candidate.agent_id.as_str()) {
                Some(&i) => {
                    if candidate.confidence > best[i].confidence {
                        best[i].confidence = candidate.confidence;
                    }
                }
                None => {
                    index.insert(&candidate.agent_id, best.len());
                    best.push(candidate.clone());
                }
            }
        }
        if best.is_empty() {
            return Vec::new();
        }

        let mut ranked: Vec<ScoredCandidate> = best
            .into_iter()
            .map(|c| {
                let load = match strategy {
                    LoadBalancingStrategy::RoundRobin => 0,
                    _ => workload(&c.agent_id),
                };
                ScoredCandidate {
                    score: score(algorithm, c.confidence, load),
                    agent_id: c.agent_id,
                    confidence: c.confidence,
                    workload: load,
                }
            })
            .collect();

        match strategy {
            LoadBalancingStrategy::RoundRobin => {
                let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % ranked.len();
                ranked.rotate_left(offset);
            }
            _ => ranked.sort_by(|a, b| b.score.total_cmp(&a.score)),
        }
        ranked
    }
}

/// True when the two most confident candidates are within `margin`.
pub fn is_contested(ranked: &[ScoredCandidate], margin: f64) -> bool {
    let mut confidences: Vec<f64> = ranked.iter().map(|c| c.confidence).collect();
    if confidences.len() < 2 {
        return false;
    }
    confidences.sort_by(|a, b| b.total_cmp(a));
    confidences[0] - confidences[1] <= margin
}
