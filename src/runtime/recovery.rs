//! Inspection of interrupted cycles
//!
//! A cycle that dies after its user turn was appended (crash, provider
//! failure, cancelled request) leaves the history ending in a user turn with
//! no reply. That is an accepted terminal state: it is reported, never
//! retried automatically. A fresh submission is the only way forward.

use crate::db::{Role, Turn};
use serde::Serialize;

/// Where a conversation's history stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyStatus {
    /// No turns yet
    Empty,
    /// Last turn is an assistant reply
    Answered { last_sequence: i64 },
    /// Last turn is a user turn that never got a reply
    AwaitingReply { user_sequence: i64 },
}

impl ReplyStatus {
    pub fn is_awaiting_reply(self) -> bool {
        matches!(self, ReplyStatus::AwaitingReply { .. })
    }
}

/// Classify a conversation by its last turn
pub fn reply_status(turns: &[Turn]) -> ReplyStatus {
    match turns.last() {
        None => ReplyStatus::Empty,
        Some(turn) if turn.role == Role::User => ReplyStatus::AwaitingReply {
            user_sequence: turn.sequence,
        },
        Some(turn) => ReplyStatus::Answered {
            last_sequence: turn.sequence,
        },
    }
}
