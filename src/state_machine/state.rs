//! Cycle state types

use crate::db::{Provenance, Turn};
use serde::Serialize;

/// Immutable facts about one submission, fixed before the cycle starts
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub conversation_id: String,
    pub user_id: String,
    pub provenance: Provenance,
    /// Caller asked for spoken output in addition to text
    pub want_audio: bool,
    /// Last stored sequence number when the cycle began (0 for a new conversation)
    pub last_sequence: i64,
    /// A voice pipeline is configured to speak the reply
    pub voice_available: bool,
}

impl CycleContext {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        provenance: Provenance,
        want_audio: bool,
        last_sequence: i64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            provenance,
            want_audio,
            last_sequence,
            voice_available: true,
        }
    }

    #[must_use]
    pub fn with_voice_available(mut self, available: bool) -> Self {
        self.voice_available = available;
        self
    }

    /// Voice input always gets a spoken reply, when there is a voice to speak it
    pub fn wants_synthesis(&self) -> bool {
        self.voice_available && (self.want_audio || self.provenance == Provenance::Voice)
    }
}

/// Why the provider step produced no reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub message: String,
    pub retryable: bool,
}

impl ProviderFailure {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
        }
    }
}

/// Result of a resolved cycle. Exactly one of these per submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Replied { user_turn: Turn, assistant_turn: Turn },
    Failed { user_turn: Turn, failure: ProviderFailure },
}

impl CycleOutcome {
    pub fn user_turn(&self) -> &Turn {
        match self {
            CycleOutcome::Replied { user_turn, .. } | CycleOutcome::Failed { user_turn, .. } => {
                user_turn
            }
        }
    }
}

/// Cycle state
///
/// `Created -> UserTurnAppended -> AwaitingProvider ->
/// {AssistantTurnAppended | ProviderFailed} -> Reported -> Done`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CycleState {
    /// Input validated, nothing written yet
    #[default]
    Created,

    /// User turn is durable. A crash from here on leaves an unanswered
    /// user turn, which is an accepted terminal state.
    UserTurnAppended { user_turn: Turn },

    /// Provider call outstanding
    AwaitingProvider { user_turn: Turn },

    AssistantTurnAppended { user_turn: Turn, assistant_turn: Turn },

    ProviderFailed {
        user_turn: Turn,
        failure: ProviderFailure,
    },

    /// Fan-out dispatched
    Reported { outcome: CycleOutcome },

    /// Result handed back to the caller
    Done { outcome: CycleOutcome },
}

impl CycleState {
    pub fn name(&self) -> &'static str {
        match self {
            CycleState::Created => "created",
            CycleState::UserTurnAppended { .. } => "user_turn_appended",
            CycleState::AwaitingProvider { .. } => "awaiting_provider",
            CycleState::AssistantTurnAppended { .. } => "assistant_turn_appended",
            CycleState::ProviderFailed { .. } => "provider_failed",
            CycleState::Reported { .. } => "reported",
            CycleState::Done { .. } => "done",
        }
    }
}
