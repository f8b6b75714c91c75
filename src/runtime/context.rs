//! Prompt context projection
//!
//! The provider sees a bounded window of the most recent turns. Stored
//! history is never touched; this is a read-time view.

use crate::db::{Role, Turn};
use crate::llm::LlmMessage;

/// One entry of the prompt context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTurn {
    pub role: Role,
    pub content: String,
}

impl ContextTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Turn> for ContextTurn {
    fn from(turn: &Turn) -> Self {
        Self::new(turn.role, turn.content.clone())
    }
}

impl From<&ContextTurn> for LlmMessage {
    fn from(turn: &ContextTurn) -> Self {
        match turn.role {
            Role::User => LlmMessage::user(turn.content.clone()),
            Role::Assistant => LlmMessage::assistant(turn.content.clone()),
        }
    }
}

/// The last `window` turns in stored order. A window of 0 is treated as 1
/// so the newest user turn always reaches the provider.
pub fn project(turns: &[Turn], window: usize) -> Vec<ContextTurn> {
    let start = turns.len().saturating_sub(window.max(1));
    turns[start..].iter().map(ContextTurn::from).collect()
}
