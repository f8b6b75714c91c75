//! Events that drive a submission cycle

use super::state::ProviderFailure;
use crate::db::Turn;
use crate::runtime::ContextTurn;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum CycleEvent {
    /// Caller submitted content
    Submitted { content: String },

    /// Store acknowledged an append
    UserTurnPersisted { turn: Turn },
    AssistantTurnPersisted { turn: Turn },

    /// Prompt context projected from history
    ContextBuilt { context: Vec<ContextTurn> },

    // Provider outcomes
    ProviderReplied { content: String },
    ProviderFailed { failure: ProviderFailure },

    /// Analytics and voice fan-out dispatched
    Reported,

    /// Result returned to the caller
    Responded,
}

impl CycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CycleEvent::Submitted { .. } => "submitted",
            CycleEvent::UserTurnPersisted { .. } => "user_turn_persisted",
            CycleEvent::AssistantTurnPersisted { .. } => "assistant_turn_persisted",
            CycleEvent::ContextBuilt { .. } => "context_built",
            CycleEvent::ProviderReplied { .. } => "provider_replied",
            CycleEvent::ProviderFailed { .. } => "provider_failed",
            CycleEvent::Reported => "reported",
            CycleEvent::Responded => "responded",
        }
    }
}
