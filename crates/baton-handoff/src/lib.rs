//! Context handoff: moving a task's working context between agents.
//!
//! `ContextHandoffManager::initiate_handoff` serializes and compresses the
//! context, parks the payload in a `ContextStore` under a fresh handoff id,
//! and tracks its `HandoffStatus`. The target agent later claims it exactly
//! once with `complete_handoff`.

pub mod codec;
pub mod manager;
pub mod status;
pub mod store;

pub use codec::IdentityCompressor;
pub use manager::{ContextHandoffManager, ContextHandoffRequest, ContextHandoffResponse};
pub use status::{HandoffState, HandoffStatus};
pub use store::{ContextStore, MemoryContextStore, StoredContext};
