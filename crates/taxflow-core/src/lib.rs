pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod execution;
pub mod handoff;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, Result, TaxflowError};
pub use event::{EventBus, WorkflowEvent};
pub use handoff::HandoffContext;
pub use types::*;
