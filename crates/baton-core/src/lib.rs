pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod traits;
pub mod types;

pub use config::{AppConfig, HandoffConfig, Preset};
pub use error::{BatonError, Result};
pub use event::{Envelope, Event, EventBus};
pub use traits::ContextMap;
pub use types::*;
