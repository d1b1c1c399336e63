use std::collections::HashMap;

use baton_core::types::ConsensusAlgorithm;

use crate::session::{ConsensusResult, VotingSession};

/// Threshold used by supermajority and consensus-threshold when none is given.
pub const DEFAULT_THRESHOLD: f64 = 0.67;

/// Resolve a session's votes into a result. Pure: depends only on the final
/// vote set, never on the order votes arrived in.
///
/// `registered` maps every currently registered agent to its weight; only
/// consensus-threshold consults it.
pub fn resolve(
    session: &VotingSession,
    algorithm: ConsensusAlgorithm,
    threshold: f64,
    registered: &HashMap<String, f64>,
) -> ConsensusResult {
    let distribution = distribution(session, algorithm);
    let mut result = ConsensusResult {
        session_id: session.id.clone(),
        winning_option: None,
        confidence: 0.0,
        vote_distribution: distribution,
        consensus_reached: false,
        resolution_method: algorithm,
        details: String::new(),
    };

    if session.votes.is_empty() {
        result.details = "no votes cast".into();
        return result;
    }
    if let Some(quorum) = session.quorum {
        if session.votes.len() < quorum {
            result.details = format!(
                "quorum not met: {} of {} required votes",
                session.votes.len(),
                quorum
            );
            return result;
        }
    }

    let total: f64 = result.vote_distribution.values().sum();
    let Some((leader, lead, tied)) = leader(session, &result.vote_distribution) else {
        result.details = "no option received votes".into();
        return result;
    };
    result.confidence = if total > 0.0 { lead / total } else { 0.0 };

    let (reached, details) = match algorithm {
        ConsensusAlgorithm::SimpleMajority => (
            !tied && lead > total / 2.0,
            format!("{} of {} votes for '{}', need more than half", lead, total, leader),
        ),
        ConsensusAlgorithm::WeightedMajority => (
            !tied && lead > total / 2.0,
            format!("weight {} of {} for '{}', need more than half", lead, total, leader),
        ),
        ConsensusAlgorithm::Supermajority => (
            !tied && lead >= threshold * total,
            format!(
                "weight {} of {} for '{}', need at least {:.0}%",
                lead,
                total,
                leader,
                threshold * 100.0
            ),
        ),
        ConsensusAlgorithm::ConsensusThreshold => {
            match unanimous(session, registered, &leader, lead, threshold) {
                Ok(details) => (true, details),
                Err(details) => {
                    result.confidence = 0.0;
                    (false, details)
                }
            }
        }
    };

    if tied {
        result.details = format!("tie for the lead at {}; no winner", lead);
    } else {
        result.details = details;
    }
    result.consensus_reached = reached;
    if reached {
        result.winning_option = Some(leader);
    }
    result
}

/// Option id → summed weight, or vote count for simple-majority. Every
/// option appears, including those with no votes.
fn distribution(session: &VotingSession, algorithm: ConsensusAlgorithm) -> HashMap<String, f64> {
    let mut dist: HashMap<String, f64> =
        session.options.iter().map(|o| (o.id.clone(), 0.0)).collect();
    for vote in &session.votes {
        let amount = match algorithm {
            ConsensusAlgorithm::SimpleMajority => 1.0,
            _ => vote.weight,
        };
        *dist.entry(vote.option_id.clone()).or_insert(0.0) += amount;
    }
    dist
}

/// The leading option, its tally, and whether another option ties it.
fn leader(session: &VotingSession, dist: &HashMap<String, f64>) -> Option<(String, f64, bool)> {
    let mut best: Option<(&str, f64)> = None;
    let mut tied = false;
    for option in &session.options {
        let tally = dist.get(&option.id).copied().unwrap_or(0.0);
        if tally <= 0.0 {
            continue;
        }
        match best {
            Some((_, lead)) if tally == lead => tied = true,
            Some((_, lead)) if tally < lead => {}
            _ => {
                best = Some((&option.id, tally));
                tied = false;
            }
        }
    }
    best.map(|(id, lead)| (id.to_string(), lead, tied))
}

fn unanimous(
    session: &VotingSession,
    registered: &HashMap<String, f64>,
    leader: &str,
    lead: f64,
    threshold: f64,
) -> Result<String, String> {
    if registered.is_empty() {
        return Err("no registered agents".into());
    }
    let missing = registered
        .keys()
        .filter(|id| !session.has_voted(id))
        .count();
    if missing > 0 {
        return Err(format!(
            "{} of {} registered agents did not vote",
            missing,
            registered.len()
        ));
    }
    if session.votes.iter().any(|v| v.option_id != leader) {
        return Err("votes are split across options".into());
    }
    let electorate: f64 = registered.values().sum();
    if lead < threshold * electorate {
        return Err(format!(
            "weight {} below {:.0}% of registered weight {}",
            lead,
            threshold * 100.0,
            electorate
        ));
    }
    Ok(format!("all {} registered agents chose '{}'", registered.len(), leader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionStatus, Vote, VoteOption};
    use chrono::Utc;

    fn session(votes: &[(&str, &str, f64)], quorum: Option<usize>) -> VotingSession {
        VotingSession {
            id: "s1".into(),
            topic: "next agent".into(),
            options: ["A", "B", "C"]
                .iter()
                .map(|id| VoteOption::new(*id, *id))
                .collect(),
            votes: votes
                .iter()
                .map(|(agent, option, weight)| Vote {
                    agent_id: agent.to_string(),
                    option_id: option.to_string(),
                    weight: *weight,
                    timestamp: Utc::now(),
                    rationale: None,
                })
                .collect(),
            status: SessionStatus::Open,
            quorum,
            created_at: Utc::now(),
            result: None,
        }
    }

    fn registry(agents: &[(&str, f64)]) -> HashMap<String, f64> {
        agents.iter().map(|(id, w)| (id.to_string(), *w)).collect()
    }

    const ALL: [ConsensusAlgorithm; 4] = [
        ConsensusAlgorithm::SimpleMajority,
        ConsensusAlgorithm::WeightedMajority,
        ConsensusAlgorithm::Supermajority,
        ConsensusAlgorithm::ConsensusThreshold,
    ];

    #[test]
    fn weighted_tie_has_no_winner() {
        let s = session(&[("a1", "A", 1.0), ("a2", "A", 1.0), ("a3", "B", 2.0)], None);
        let r = resolve(&s, ConsensusAlgorithm::WeightedMajority, DEFAULT_THRESHOLD, &HashMap::new());
        assert!(!r.consensus_reached);
        assert!(r.winning_option.is_none());
        assert_eq!(r.vote_distribution["A"], 2.0);
        assert_eq!(r.vote_distribution["B"], 2.0);
    }

    #[test]
    fn simple_majority_counts_heads_not_weight() {
        let s = session(&[("a1", "A", 1.0), ("a2", "A", 1.0), ("a3", "B", 5.0)], None);
        let r = resolve(&s, ConsensusAlgorithm::SimpleMajority, DEFAULT_THRESHOLD, &HashMap::new());
        assert!(r.consensus_reached);
        assert_eq!(r.winning_option.as_deref(), Some("A"));
        assert_eq!(r.vote_distribution["B"], 1.0);

        let r = resolve(&s, ConsensusAlgorithm::WeightedMajority, DEFAULT_THRESHOLD, &HashMap::new());
        assert_eq!(r.winning_option.as_deref(), Some("B"));
    }

    #[test]
    fn weighted_distribution_conserves_weight() {
        let s = session(&[("a1", "A", 1.5), ("a2", "B", 1.0), ("a3", "C", 3.0)], None);
        for algo in [
            ConsensusAlgorithm::WeightedMajority,
            ConsensusAlgorithm::Supermajority,
            ConsensusAlgorithm::ConsensusThreshold,
        ] {
            let r = resolve(&s, algo, DEFAULT_THRESHOLD, &HashMap::new());
            let sum: f64 = r.vote_distribution.values().sum();
            assert!((sum - s.total_weight()).abs() < 1e-9, "{algo}");
        }
    }

    #[test]
    fn supermajority_is_monotonic_in_threshold() {
        let s = session(&[("a1", "A", 2.0), ("a2", "A", 1.0), ("a3", "B", 1.0)], None);
        let thresholds = [0.1, 0.3, 0.5, 0.67, 0.75, 0.8, 0.95, 1.0];
        for (i, t2) in thresholds.iter().enumerate() {
            let high = resolve(&s, ConsensusAlgorithm::Supermajority, *t2, &HashMap::new());
            if high.consensus_reached {
                for t1 in &thresholds[..i] {
                    let low = resolve(&s, ConsensusAlgorithm::Supermajority, *t1, &HashMap::new());
                    assert!(low.consensus_reached, "reached at {t2} but not at {t1}");
                }
            }
        }
        // 3 of 4 = 0.75
        assert!(resolve(&s, ConsensusAlgorithm::Supermajority, 0.75, &HashMap::new()).consensus_reached);
        assert!(!resolve(&s, ConsensusAlgorithm::Supermajority, 0.8, &HashMap::new()).consensus_reached);
    }

    #[test]
    fn quorum_gates_every_algorithm() {
        let s = session(&[("a1", "A", 1.0), ("a2", "A", 1.0)], Some(3));
        let reg = registry(&[("a1", 1.0), ("a2", 1.0)]);
        for algo in ALL {
            let r = resolve(&s, algo, DEFAULT_THRESHOLD, &reg);
            assert!(!r.consensus_reached, "{algo}");
            assert!(r.winning_option.is_none());
            assert!(r.details.contains("quorum"));
        }
    }

    #[test]
    fn zero_votes_yield_null_winner() {
        let s = session(&[], None);
        for algo in ALL {
            let r = resolve(&s, algo, DEFAULT_THRESHOLD, &HashMap::new());
            assert!(r.winning_option.is_none());
            assert_eq!(r.confidence, 0.0);
        }
    }

    #[test]
    fn consensus_threshold_requires_every_registered_agent() {
        let s = session(&[("a1", "A", 1.0), ("a2", "A", 1.0)], None);
        let reg = registry(&[("a1", 1.0), ("a2", 1.0), ("a3", 1.0)]);
        let r = resolve(&s, ConsensusAlgorithm::ConsensusThreshold, DEFAULT_THRESHOLD, &reg);
        assert!(!r.consensus_reached);
        assert!(r.winning_option.is_none());
        assert_eq!(r.confidence, 0.0);

        let s = session(&[("a1", "A", 1.0), ("a2", "A", 1.0), ("a3", "A", 1.0)], None);
        let r = resolve(&s, ConsensusAlgorithm::ConsensusThreshold, DEFAULT_THRESHOLD, &reg);
        assert!(r.consensus_reached);
        assert_eq!(r.winning_option.as_deref(), Some("A"));
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn consensus_threshold_rejects_split_votes() {
        let s = session(&[("a1", "A", 1.0), ("a2", "A", 1.0), ("a3", "B", 1.0)], None);
        let reg = registry(&[("a1", 1.0), ("a2", 1.0), ("a3", 1.0)]);
        let r = resolve(&s, ConsensusAlgorithm::ConsensusThreshold, 0.5, &reg);
        assert!(!r.consensus_reached);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn confidence_is_leading_share() {
        let s = session(&[("a1", "A", 3.0), ("a2", "B", 1.0)], None);
        let r = resolve(&s, ConsensusAlgorithm::WeightedMajority, DEFAULT_THRESHOLD, &HashMap::new());
        assert!(r.consensus_reached);
        assert!((r.confidence - 0.75).abs() < 1e-9);
    }
}
