use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use baton_core::error::{BatonError, Result};
use baton_core::event::{Event, EventBus};
use baton_core::types::ConsensusAlgorithm;

use crate::algorithm::{self, DEFAULT_THRESHOLD};
use crate::session::{ConsensusResult, SessionStatus, Vote, VoteOption, VotingSession};

const EVENT_SOURCE: &str = "consensus";

/// A voter and the expertise its weight derives from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub expertise: Vec<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, expertise: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            expertise,
        }
    }

    /// `max(1, expertise / 2)`, real division.
    pub fn weight(&self) -> f64 {
        (self.expertise.len() as f64 / 2.0).max(1.0)
    }
}

#[derive(Default)]
struct State {
    agents: HashMap<String, AgentProfile>,
    sessions: HashMap<String, VotingSession>,
}

/// In-memory agent registry plus voting sessions.
///
/// All operations are synchronous; events are published after the state
/// lock is released.
pub struct ConsensusVotingSystem {
    state: Mutex<State>,
    event_bus: Arc<EventBus>,
}

impl ConsensusVotingSystem {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            event_bus,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register or replace an agent.
    pub fn register_agent(&self, profile: AgentProfile) -> Result<()> {
        if profile.id.trim().is_empty() {
            return Err(BatonError::Validation("agent id must not be empty".into()));
        }
        let event = Event::AgentRegistered {
            agent_id: profile.id.clone(),
            expertise: profile.expertise.clone(),
            weight: profile.weight(),
        };
        self.state().agents.insert(profile.id.clone(), profile);
        self.event_bus.emit(EVENT_SOURCE, event);
        Ok(())
    }

    /// Returns false when the agent was not registered. Votes already cast
    /// keep their weight.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.state().agents.remove(agent_id).is_some();
        if removed {
            self.event_bus.emit(
                EVENT_SOURCE,
                Event::AgentUnregistered {
                    agent_id: agent_id.to_string(),
                },
            );
        }
        removed
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.state().agents.contains_key(agent_id)
    }

    pub fn registered_agents(&self) -> Vec<AgentProfile> {
        let mut agents: Vec<_> = self.state().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn create_voting_session(
        &self,
        topic: impl Into<String>,
        options: Vec<VoteOption>,
        quorum: Option<usize>,
    ) -> Result<String> {
        let topic = topic.into();
        if options.is_empty() {
            return Err(BatonError::Validation(
                "a voting session needs at least one option".into(),
            ));
        }
        let mut seen = HashSet::new();
        for option in &options {
            if !seen.insert(option.id.as_str()) {
                return Err(BatonError::Validation(format!(
                    "duplicate option id '{}'",
                    option.id
                )));
            }
        }
        if quorum == Some(0) {
            return Err(BatonError::Validation("quorum must be at least 1".into()));
        }

        let session_id = Uuid::new_v4().to_string();
        let option_count = options.len();
        let session = VotingSession {
            id: session_id.clone(),
            topic: topic.clone(),
            options,
            votes: Vec::new(),
            status: SessionStatus::Open,
            quorum,
            created_at: Utc::now(),
            result: None,
        };
        self.state().sessions.insert(session_id.clone(), session);

        self.event_bus.emit(
            EVENT_SOURCE,
            Event::ConsensusSessionCreated {
                session_id: session_id.clone(),
                topic,
                option_count,
            },
        );
        debug!(session_id = %session_id, option_count, "Voting session created");
        Ok(session_id)
    }

    /// Record one agent's vote. Every rejection is a typed error.
    pub fn cast_vote(
        &self,
        session_id: &str,
        agent_id: &str,
        option_id: &str,
        rationale: Option<String>,
    ) -> Result<()> {
        let weight = {
            let mut state = self.state();
            let weight = state
                .agents
                .get(agent_id)
                .map(AgentProfile::weight)
                .ok_or_else(|| BatonError::AgentNotRegistered(agent_id.to_string()))?;
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| BatonError::SessionNotFound(session_id.to_string()))?;

            if session.status != SessionStatus::Open {
                return Err(BatonError::Conflict(format!(
                    "session {} is no longer accepting votes",
                    session_id
                )));
            }
            if !session.has_option(option_id) {
                return Err(BatonError::Validation(format!(
                    "unknown option '{}' for session {}",
                    option_id, session_id
                )));
            }
            if session.has_voted(agent_id) {
                return Err(BatonError::Conflict(format!(
                    "agent {} already voted in session {}",
                    agent_id, session_id
                )));
            }

            session.votes.push(Vote {
                agent_id: agent_id.to_string(),
                option_id: option_id.to_string(),
                weight,
                timestamp: Utc::now(),
                rationale,
            });
            weight
        };

        self.event_bus.emit(
            EVENT_SOURCE,
            Event::ConsensusVoteCast {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                option_id: option_id.to_string(),
                weight,
            },
        );
        Ok(())
    }

    /// Close a session and compute its result. A session closes once.
    pub fn close_voting_session(
        &self,
        session_id: &str,
        algorithm: ConsensusAlgorithm,
        threshold: Option<f64>,
    ) -> Result<ConsensusResult> {
        let threshold = threshold.unwrap_or(DEFAULT_THRESHOLD);
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(BatonError::Validation(format!(
                "threshold must be within (0, 1], got {}",
                threshold
            )));
        }

        let result = {
            let mut state = self.state();
            let registered: HashMap<String, f64> = state
                .agents
                .values()
                .map(|a| (a.id.clone(), a.weight()))
                .collect();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| BatonError::SessionNotFound(session_id.to_string()))?;
            if session.status != SessionStatus::Open {
                return Err(BatonError::Conflict(format!(
                    "session {} is already closed",
                    session_id
                )));
            }

            let result = algorithm::resolve(session, algorithm, threshold, &registered);
            session.status = if result.consensus_reached {
                SessionStatus::Resolved
            } else {
                SessionStatus::Closed
            };
            session.result = Some(result.clone());
            result
        };

        self.event_bus.emit(
            EVENT_SOURCE,
            Event::ConsensusSessionClosed {
                session_id: session_id.to_string(),
                consensus_reached: result.consensus_reached,
                winning_option: result.winning_option.clone(),
                confidence: result.confidence,
            },
        );
        info!(
            session_id = %session_id,
            algorithm = %algorithm,
            reached = result.consensus_reached,
            winner = ?result.winning_option,
            "Voting session closed"
        );
        Ok(result)
    }

    /// Snapshot of a session, open or closed.
    pub fn get_session(&self, session_id: &str) -> Option<VotingSession> {
        self.state().sessions.get(session_id).cloned()
    }

    /// Drop one closed session. Open sessions are kept.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut state = self.state();
        let closed = state
            .sessions
            .get(session_id)
            .map_or(false, |s| s.status != SessionStatus::Open);
        if closed {
            state.sessions.remove(session_id);
        }
        closed
    }

    /// Drop closed sessions. Returns how many were removed.
    pub fn prune_closed(&self) -> usize {
        let mut state = self.state();
        let before = state.sessions.len();
        state.sessions.retain(|_, s| s.status == SessionStatus::Open);
        before - state.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_test_utils::{drain_events, event_types};

    fn expertise(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("skill-{i}")).collect()
    }

    fn system_with(agents: &[(&str, usize)]) -> (ConsensusVotingSystem, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let sys = ConsensusVotingSystem::new(bus.clone());
        for (id, n) in agents {
            sys.register_agent(AgentProfile::new(*id, expertise(*n))).unwrap();
        }
        (sys, bus)
    }

    fn abc() -> Vec<VoteOption> {
        vec![
            VoteOption::new("A", "Option A"),
            VoteOption::new("B", "Option B"),
            VoteOption::new("C", "Option C"),
        ]
    }

    #[test]
    fn weight_from_expertise() {
        assert_eq!(AgentProfile::new("a", vec![]).weight(), 1.0);
        assert_eq!(AgentProfile::new("a", expertise(1)).weight(), 1.0);
        assert_eq!(AgentProfile::new("a", expertise(3)).weight(), 1.5);
        assert_eq!(AgentProfile::new("a", expertise(4)).weight(), 2.0);
    }

    #[test]
    fn weighted_tie_scenario() {
        let (sys, _bus) = system_with(&[("a1", 1), ("a2", 2), ("a3", 4)]);
        let sid = sys.create_voting_session("next step", abc(), None).unwrap();
        sys.cast_vote(&sid, "a1", "A", None).unwrap();
        sys.cast_vote(&sid, "a2", "A", None).unwrap();
        sys.cast_vote(&sid, "a3", "B", Some("more context".into())).unwrap();

        let r = sys
            .close_voting_session(&sid, ConsensusAlgorithm::WeightedMajority, None)
            .unwrap();
        assert!(!r.consensus_reached);
        assert!(r.winning_option.is_none());
        assert_eq!(sys.get_session(&sid).unwrap().status, SessionStatus::Closed);
    }

    #[test]
    fn weight_is_fixed_at_cast_time() {
        let (sys, _bus) = system_with(&[("a1", 4), ("a2", 1)]);
        let sid = sys.create_voting_session("t", abc(), None).unwrap();
        sys.cast_vote(&sid, "a1", "A", None).unwrap();

        sys.register_agent(AgentProfile::new("a1", vec![])).unwrap();
        sys.cast_vote(&sid, "a2", "B", None).unwrap();

        let r = sys
            .close_voting_session(&sid, ConsensusAlgorithm::WeightedMajority, None)
            .unwrap();
        assert_eq!(r.vote_distribution["A"], 2.0);
        assert_eq!(r.winning_option.as_deref(), Some("A"));
        assert_eq!(sys.get_session(&sid).unwrap().status, SessionStatus::Resolved);
    }

    #[test]
    fn duplicate_vote_is_conflict() {
        let (sys, _bus) = system_with(&[("a1", 1)]);
        let sid = sys.create_voting_session("t", abc(), None).unwrap();
        sys.cast_vote(&sid, "a1", "A", None).unwrap();
        let err = sys.cast_vote(&sid, "a1", "B", None).unwrap_err();
        assert!(matches!(err, BatonError::Conflict(_)));
        assert_eq!(sys.get_session(&sid).unwrap().votes.len(), 1);
    }

    #[test]
    fn rejected_votes() {
        let (sys, _bus) = system_with(&[("a1", 1)]);
        let sid = sys.create_voting_session("t", abc(), None).unwrap();

        assert!(matches!(
            sys.cast_vote(&sid, "a1", "Z", None),
            Err(BatonError::Validation(_))
        ));
        assert!(matches!(
            sys.cast_vote(&sid, "ghost", "A", None),
            Err(BatonError::AgentNotRegistered(_))
        ));
        assert!(matches!(
            sys.cast_vote("nope", "a1", "A", None),
            Err(BatonError::SessionNotFound(_))
        ));
    }

    #[test]
    fn closed_session_rejects_votes_and_reclose() {
        let (sys, _bus) = system_with(&[("a1", 1), ("a2", 1)]);
        let sid = sys.create_voting_session("t", abc(), None).unwrap();
        sys.cast_vote(&sid, "a1", "A", None).unwrap();
        sys.close_voting_session(&sid, ConsensusAlgorithm::SimpleMajority, None)
            .unwrap();

        assert!(matches!(
            sys.cast_vote(&sid, "a2", "A", None),
            Err(BatonError::Conflict(_))
        ));
        let err = sys
            .close_voting_session(&sid, ConsensusAlgorithm::SimpleMajority, None)
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn remove_session_only_drops_closed() {
        let (sys, _bus) = system_with(&[("a1", 1)]);
        let open = sys.create_voting_session("open", abc(), None).unwrap();
        let done = sys.create_voting_session("done", abc(), None).unwrap();
        sys.cast_vote(&done, "a1", "B", None).unwrap();
        sys.close_voting_session(&done, ConsensusAlgorithm::SimpleMajority, None)
            .unwrap();

        assert!(!sys.remove_session(&open));
        assert!(sys.remove_session(&done));
        assert!(!sys.remove_session(&done));
        assert!(sys.get_session(&open).is_some());
        assert_eq!(sys.prune_closed(), 0);
    }

    #[test]
    fn quorum_blocks_every_algorithm() {
        for algo in [
            ConsensusAlgorithm::SimpleMajority,
            ConsensusAlgorithm::WeightedMajority,
            ConsensusAlgorithm::Supermajority,
            ConsensusAlgorithm::ConsensusThreshold,
        ] {
            let (sys, _bus) = system_with(&[("a1", 2), ("a2", 2)]);
            let sid = sys.create_voting_session("t", abc(), Some(3)).unwrap();
            sys.cast_vote(&sid, "a1", "A", None).unwrap();
            sys.cast_vote(&sid, "a2", "A", None).unwrap();
            let r = sys.close_voting_session(&sid, algo, None).unwrap();
            assert!(!r.consensus_reached, "{algo}");
        }
    }

    #[test]
    fn consensus_threshold_missing_voter() {
        let (sys, _bus) = system_with(&[("a1", 2), ("a2", 2), ("a3", 2)]);
        let sid = sys.create_voting_session("t", abc(), None).unwrap();
        sys.cast_vote(&sid, "a1", "A", None).unwrap();
        sys.cast_vote(&sid, "a2", "A", None).unwrap();

        let r = sys
            .close_voting_session(&sid, ConsensusAlgorithm::ConsensusThreshold, None)
            .unwrap();
        assert!(!r.consensus_reached);
        assert!(r.winning_option.is_none());
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn invalid_sessions_and_thresholds() {
        let (sys, _bus) = system_with(&[]);
        assert!(sys.create_voting_session("t", vec![], None).is_err());
        let dup = vec![VoteOption::new("A", "x"), VoteOption::new("A", "y")];
        assert!(sys.create_voting_session("t", dup, None).is_err());
        assert!(sys.create_voting_session("t", abc(), Some(0)).is_err());

        let sid = sys.create_voting_session("t", abc(), None).unwrap();
        for bad in [0.0, -0.5, 1.5, f64::NAN] {
            assert!(sys
                .close_voting_session(&sid, ConsensusAlgorithm::Supermajority, Some(bad))
                .is_err());
        }
        // Still open after rejected closes.
        assert_eq!(sys.get_session(&sid).unwrap().status, SessionStatus::Open);
    }

    #[test]
    fn registry_events() {
        let (sys, bus) = system_with(&[]);
        let mut rx = bus.subscribe();
        sys.register_agent(AgentProfile::new("a1", expertise(2))).unwrap();
        assert!(sys.unregister_agent("a1"));
        assert!(!sys.unregister_agent("a1"));

        assert_eq!(
            event_types(&drain_events(&mut rx)),
            vec!["agent.registered", "agent.unregistered"]
        );
    }

    #[test]
    fn session_events() {
        let (sys, bus) = system_with(&[("a1", 1)]);
        let mut rx = bus.subscribe();
        let sid = sys.create_voting_session("t", abc(), None).unwrap();
        sys.cast_vote(&sid, "a1", "C", None).unwrap();
        let r = sys
            .close_voting_session(&sid, ConsensusAlgorithm::Supermajority, Some(1.0))
            .unwrap();
        assert_eq!(r.winning_option.as_deref(), Some("C"));

        assert_eq!(
            event_types(&drain_events(&mut rx)),
            vec![
                "consensus.session.created",
                "consensus.vote.cast",
                "consensus.session.closed"
            ]
        );
        assert_eq!(sys.prune_closed(), 1);
        assert!(sys.get_session(&sid).is_none());
    }
}
