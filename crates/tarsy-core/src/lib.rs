//! Tarsy Core - entities, error taxonomy, event bus, history repository, hooks.

pub mod clock;
pub mod error;
pub mod event_bus;
pub mod history;
pub mod hooks;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use event_bus::{Event, EventBus};
pub use history::{HistoryRepository, InMemoryHistoryRepository};
pub use hooks::HookContext;
pub use types::*;
