//! Consensus voting: turn per-agent votes into one binding decision.
//!
//! Agents register with their expertise, which fixes their vote weight.
//! A `VotingSession` collects at most one vote per agent over a fixed set of
//! options; closing it runs one `ConsensusAlgorithm` and yields an immutable
//! `ConsensusResult`.

pub mod algorithm;
pub mod session;
pub mod system;

pub use algorithm::DEFAULT_THRESHOLD;
pub use session::{ConsensusResult, SessionStatus, Vote, VoteOption, VotingSession};
pub use system::{AgentProfile, ConsensusVotingSystem};
