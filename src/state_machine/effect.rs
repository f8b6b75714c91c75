//! Effects produced by state transitions

use crate::analytics::EventKind;
use crate::db::NewTurn;
use crate::runtime::ContextTurn;

/// Text to speak for an assistant turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub sequence: i64,
    pub text: String,
}

/// Effects to be executed after a state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Append a turn to the conversation store
    AppendTurn(NewTurn),

    /// Project the prompt context from the in-memory history
    BuildContext,

    /// Call the AI provider (bounded by the provider timeout)
    RequestReply { context: Vec<ContextTurn> },

    /// Fire-and-forget fan-out: one analytics event, optional synthesis
    Report {
        kind: EventKind,
        sequence: i64,
        retryable: Option<bool>,
        synthesize: Option<Synthesis>,
    },

    /// Hand the outcome back to the caller
    Respond,
}

impl Effect {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::AppendTurn(_) => "append_turn",
            Effect::BuildContext => "build_context",
            Effect::RequestReply { .. } => "request_reply",
            Effect::Report { .. } => "report",
            Effect::Respond => "respond",
        }
    }
}
