//! Database schema and record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS turns (
    conversation_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    provenance TEXT,
    created_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_sequence ON turns(conversation_id, sequence_id);

CREATE TABLE IF NOT EXISTS turn_audio (
    conversation_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    media_type TEXT NOT NULL,
    data BLOB NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (conversation_id, sequence_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS analytics_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    latency_ms INTEGER NOT NULL,
    retryable BOOLEAN,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_analytics_conversation ON analytics_events(conversation_id);
";

/// Who authored a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// How the content of a turn entered the system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Text,
    Voice,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Text => write!(f, "text"),
            Provenance::Voice => write!(f, "voice"),
        }
    }
}

/// A turn waiting to be appended. The sequence number is chosen by the
/// orchestrator, never by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTurn {
    pub sequence: i64,
    pub role: Role,
    pub content: String,
    pub provenance: Option<Provenance>,
}

impl NewTurn {
    pub fn user(sequence: i64, content: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            sequence,
            role: Role::User,
            content: content.into(),
            provenance: Some(provenance),
        }
    }

    pub fn assistant(sequence: i64, content: impl Into<String>) -> Self {
        Self {
            sequence,
            role: Role::Assistant,
            content: content.into(),
            provenance: None,
        }
    }
}

/// Turn record. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub conversation_id: String,
    pub sequence: i64,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    pub created_at: DateTime<Utc>,
}

/// Conversation record with its full ordered history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Highest sequence number in the history, 0 when empty
    pub fn last_sequence(&self) -> i64 {
        self.turns.last().map_or(0, |t| t.sequence)
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// Conversation listing entry (no turns)
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub user_id: String,
    pub turn_count: i64,
    pub last_sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
