//! Conversation orchestration runtime
//!
//! Owns the per-conversation in-flight guard and drives submission cycles
//! against the store, the AI provider and the fan-out collaborators.

pub mod context;
mod executor;
mod guard;
pub mod recovery;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use context::ContextTurn;
pub use executor::{
    ErrorKind, Orchestrator, OrchestratorConfig, OrchestratorError, SubmitOutcome, SubmitRequest,
};
pub use recovery::{reply_status, ReplyStatus};
pub use traits::*;

/// Type alias for the production orchestrator with concrete collaborators
pub type ProductionOrchestrator = Orchestrator<DatabaseStore, RegistryReplyGenerator>;
