use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Running handoff counters for the coordinator's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffMetrics {
    /// Transfer attempts made, successful or not.
    pub total_handoffs: u64,
    pub successful_handoffs: u64,
    pub failed_handoffs: u64,
    /// Attempts the circuit breaker refused before they started.
    pub rejected_handoffs: u64,
    /// Mean of `latency_history`, in milliseconds.
    pub average_latency_ms: f64,
    /// Most recent attempt latencies, oldest first.
    pub latency_history: VecDeque<u64>,
    pub fallback_activations: u64,
    pub consensus_escalations: u64,
    pub degraded_tasks: u64,
}

impl HandoffMetrics {
    pub fn record_success(&mut self, latency_ms: u64, history_cap: usize) {
        self.total_handoffs += 1;
        self.successful_handoffs += 1;
        self.push_latency(latency_ms, history_cap);
    }

    pub fn record_failure(&mut self, latency_ms: u64, history_cap: usize) {
        self.total_handoffs += 1;
        self.failed_handoffs += 1;
        self.push_latency(latency_ms, history_cap);
    }

    pub fn record_rejection(&mut self) {
        self.rejected_handoffs += 1;
    }

    /// Share of attempts that failed; 0 before any attempt.
    pub fn failure_rate(&self) -> f64 {
        if self.total_handoffs == 0 {
            0.0
        } else {
            self.failed_handoffs as f64 / self.total_handoffs as f64
        }
    }

    /// Drop the oldest samples beyond `cap`.
    pub fn trim_history(&mut self, cap: usize) {
        while self.latency_history.len() > cap.max(1) {
            self.latency_history.pop_front();
        }
        self.recompute_average();
    }

    fn push_latency(&mut self, latency_ms: u64, cap: usize) {
        self.latency_history.push_back(latency_ms);
        self.trim_history(cap);
    }

    fn recompute_average(&mut self) {
        self.average_latency_ms = if self.latency_history.is_empty() {
            0.0
        } else {
            self.latency_history.iter().sum::<u64>() as f64 / self.latency_history.len() as f64
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_average() {
        let mut m = HandoffMetrics::default();
        m.record_success(100, 10);
        m.record_failure(300, 10);
        assert_eq!(m.total_handoffs, 2);
        assert_eq!(m.successful_handoffs, 1);
        assert_eq!(m.failed_handoffs, 1);
        assert_eq!(m.average_latency_ms, 200.0);
        assert_eq!(m.failure_rate(), 0.5);
    }

    #[test]
    fn test_history_is_capped() {
        let mut m = HandoffMetrics::default();
        for latency in [10, 20, 30, 40] {
            m.record_success(latency, 3);
        }
        assert_eq!(m.latency_history, VecDeque::from(vec![20, 30, 40]));
        assert_eq!(m.average_latency_ms, 30.0);
        assert_eq!(m.total_handoffs, 4);

        m.trim_history(1);
        assert_eq!(m.latency_history, VecDeque::from(vec![40]));
    }

    #[test]
    fn test_empty_rates() {
        let m = HandoffMetrics::default();
        assert_eq!(m.failure_rate(), 0.0);
        assert_eq!(m.average_latency_ms, 0.0);
    }
}
