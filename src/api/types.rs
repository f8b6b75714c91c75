//! API request and response types

use crate::db::{ConversationSummary, Turn};
use crate::runtime::{ReplyStatus, SubmitOutcome};
use crate::voice::AudioClip;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to send a text message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    /// Omitted to start a new conversation
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub want_audio: bool,
}

/// Request to send a spoken message
#[derive(Debug, Deserialize)]
pub struct VoiceRequest {
    /// `audio` (base64) and `media_type`
    #[serde(flatten)]
    pub clip: AudioClip,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Reply to a chat or voice submission
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub turn: Turn,
    pub sequence_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl From<SubmitOutcome> for ChatResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        Self {
            conversation_id: outcome.conversation_id,
            turn: outcome.turn,
            sequence_number: outcome.sequence_number,
            transcript: outcome.transcript,
        }
    }
}

/// Response with a list of conversations
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

/// Response with a conversation and its full history
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: String,
    pub turns: Vec<Turn>,
    pub reply_status: ReplyStatus,
    /// Last turn is a user turn that never got a reply
    pub awaiting_reply: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Model information with metadata
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub description: String,
    pub context_window: usize,
}

/// Response for model list
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    pub default: String,
    pub voice_enabled: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// The user turn that was saved before the provider failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_turn: Option<Turn>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            retryable: None,
            user_turn: None,
        }
    }

    pub fn provider_failure(message: impl Into<String>, retryable: bool, user_turn: Turn) -> Self {
        Self {
            error: message.into(),
            retryable: Some(retryable),
            user_turn: Some(user_turn),
        }
    }
}
