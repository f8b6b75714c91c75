//! Trait abstractions for orchestrator I/O
//!
//! These traits let the orchestrator run against mock collaborators in tests.

use super::context::ContextTurn;
use crate::db::{Conversation, ConversationSummary, Database, DbError, DbResult, NewTurn, Turn};
use crate::llm::{LlmError, LlmMessage, LlmRequest, ModelRegistry, SystemContent};
use crate::voice::AudioClip;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    NotFound(String),
    #[error("Sequence conflict: expected {expected}, got {got}")]
    SequenceConflict { expected: i64, got: i64 },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(id) => StoreError::NotFound(id),
            DbError::SequenceConflict { expected, got, .. } => {
                StoreError::SequenceConflict { expected, got }
            }
            DbError::Sqlite(e) => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Durable conversations and their ordered turns
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation owned by `user_id`
    async fn create(&self, user_id: &str) -> Result<Conversation, StoreError>;

    /// Load a conversation with its full history
    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError>;

    /// Append a turn. Must reject any sequence other than last + 1.
    async fn append(&self, conversation_id: &str, turn: NewTurn) -> Result<Turn, StoreError>;

    /// Conversations owned by a user, most recently updated first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>, StoreError>;
}

/// Synthesized audio, keyed by the assistant turn it speaks
#[async_trait]
pub trait AudioStore: Send + Sync {
    async fn save_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
        clip: AudioClip,
    ) -> Result<(), StoreError>;

    async fn load_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> Result<Option<AudioClip>, StoreError>;
}

/// Combined storage trait for convenience
pub trait Storage: ConversationStore + AudioStore {}
impl<T: ConversationStore + AudioStore> Storage for T {}

/// Generated reply text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub content: String,
}

/// Produces a reply for an ordered prompt context
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, context: &[ContextTurn]) -> Result<Reply, LlmError>;

    fn model_id(&self) -> &str;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn create(&self, user_id: &str) -> Result<Conversation, StoreError> {
        (**self).create(user_id).await
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        (**self).load(conversation_id).await
    }

    async fn append(&self, conversation_id: &str, turn: NewTurn) -> Result<Turn, StoreError> {
        (**self).append(conversation_id, turn).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        (**self).list_for_user(user_id).await
    }
}

#[async_trait]
impl<T: AudioStore + ?Sized> AudioStore for Arc<T> {
    async fn save_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
        clip: AudioClip,
    ) -> Result<(), StoreError> {
        (**self).save_audio(conversation_id, sequence, clip).await
    }

    async fn load_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> Result<Option<AudioClip>, StoreError> {
        (**self).load_audio(conversation_id, sequence).await
    }
}

#[async_trait]
impl<T: ReplyGenerator + ?Sized> ReplyGenerator for Arc<T> {
    async fn generate(&self, context: &[ContextTurn]) -> Result<Reply, LlmError> {
        (**self).generate(context).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStore {
    db: Database,
}

impl DatabaseStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Run a blocking database call off the async workers
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> DbResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Store task failed: {e}")))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl ConversationStore for DatabaseStore {
    async fn create(&self, user_id: &str) -> Result<Conversation, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let user_id = user_id.to_string();
        self.blocking(move |db| db.create_conversation(&id, &user_id))
            .await
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let id = conversation_id.to_string();
        self.blocking(move |db| db.get_conversation(&id)).await
    }

    async fn append(&self, conversation_id: &str, turn: NewTurn) -> Result<Turn, StoreError> {
        let id = conversation_id.to_string();
        self.blocking(move |db| db.append_turn(&id, &turn)).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.list_conversations(&user_id))
            .await
    }
}

#[async_trait]
impl AudioStore for DatabaseStore {
    async fn save_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
        clip: AudioClip,
    ) -> Result<(), StoreError> {
        let id = conversation_id.to_string();
        self.blocking(move |db| db.save_audio(&id, sequence, &clip))
            .await
    }

    async fn load_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> Result<Option<AudioClip>, StoreError> {
        let id = conversation_id.to_string();
        self.blocking(move |db| db.get_audio(&id, sequence)).await
    }
}

/// Adapter to use `ModelRegistry` as `ReplyGenerator`
pub struct RegistryReplyGenerator {
    registry: Arc<ModelRegistry>,
    system_prompt: String,
    max_tokens: u32,
}

impl RegistryReplyGenerator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        system_prompt: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            registry,
            system_prompt: system_prompt.into(),
            max_tokens,
        }
    }

    fn build_request(&self, context: &[ContextTurn]) -> LlmRequest {
        LlmRequest {
            system: vec![SystemContent::cached(self.system_prompt.clone())],
            messages: context.iter().map(LlmMessage::from).collect(),
            max_tokens: Some(self.max_tokens),
        }
    }
}

#[async_trait]
impl ReplyGenerator for RegistryReplyGenerator {
    async fn generate(&self, context: &[ContextTurn]) -> Result<Reply, LlmError> {
        let llm = self
            .registry
            .default()
            .ok_or_else(|| LlmError::unknown("No LLM provider configured"))?;
        let response = llm.complete(&self.build_request(context)).await?;
        Ok(Reply {
            content: response.text,
        })
    }

    fn model_id(&self) -> &str {
        self.registry.default_model_id()
    }
}
