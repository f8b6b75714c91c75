//! Conversation orchestrator
//!
//! Drives one submission cycle at a time per conversation: feeds events to
//! the pure state machine, executes the effects it returns and loops until
//! the cycle is done.

use super::context::project;
use super::guard::InFlightGuard;
use super::traits::{ReplyGenerator, Storage, StoreError};
use crate::analytics::{AnalyticsEvent, AnalyticsSink, EventKind};
use crate::db::{Conversation, ConversationSummary, Provenance, Turn};
use crate::llm::LlmError;
use crate::state_machine::{
    transition, validate_content, CycleContext, CycleEvent, CycleOutcome, CycleState, Effect,
    ProviderFailure, Synthesis, TransitionError,
};
use crate::voice::{AudioClip, VoiceError, VoicePipeline};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful conversational assistant. Keep replies clear and concise; \
     they may be read aloud.";

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Most recent turns sent to the provider
    pub context_turns: usize,
    /// Hard deadline for one provider call
    pub provider_timeout: Duration,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            context_turns: 20,
            provider_timeout: Duration::from_secs(60),
            max_tokens: 1024,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            context_turns: env_parse("COLLOQUY_CONTEXT_TURNS")
                .map_or(defaults.context_turns, |n: usize| n.max(1)),
            provider_timeout: env_parse("COLLOQUY_PROVIDER_TIMEOUT_SECS")
                .map_or(defaults.provider_timeout, Duration::from_secs),
            max_tokens: env_parse("COLLOQUY_MAX_TOKENS").unwrap_or(defaults.max_tokens),
            system_prompt: std::env::var("COLLOQUY_SYSTEM_PROMPT")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.system_prompt),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// A user utterance to process
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Absent to start a new conversation
    pub conversation_id: Option<String>,
    pub user_id: String,
    pub content: String,
    pub provenance: Provenance,
    pub want_audio: bool,
}

impl SubmitRequest {
    pub fn text(
        conversation_id: Option<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            user_id: user_id.into(),
            content: content.into(),
            provenance: Provenance::Text,
            want_audio: false,
        }
    }

    #[must_use]
    pub fn with_audio(mut self, want_audio: bool) -> Self {
        self.want_audio = want_audio;
        self
    }
}

/// Successful submission result
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub conversation_id: String,
    /// The assistant turn
    pub turn: Turn,
    pub sequence_number: i64,
    /// Set for voice submissions
    pub transcript: Option<String>,
}

/// Error classification for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    ProviderFailure,
    StoreFailure,
    Internal,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Transcription failed: {0}")]
    Transcription(#[source] VoiceError),
    #[error("Conversation not found: {0}")]
    NotFound(String),
    /// The user turn was saved but no reply was generated
    #[error("Provider failure: {message}")]
    ProviderFailure {
        message: String,
        retryable: bool,
        user_turn: Box<Turn>,
    },
    #[error("Store failure: {0}")]
    StoreFailure(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidInput(_) | OrchestratorError::Transcription(_) => {
                ErrorKind::InvalidInput
            }
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::ProviderFailure { .. } => ErrorKind::ProviderFailure,
            OrchestratorError::StoreFailure(_) => ErrorKind::StoreFailure,
            OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::StoreFailure(other.to_string()),
        }
    }
}

impl From<TransitionError> for OrchestratorError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::EmptyContent => {
                OrchestratorError::InvalidInput("Message content is empty".to_string())
            }
            TransitionError::InvalidTransition(msg) => OrchestratorError::Internal(msg),
        }
    }
}

/// Working set of one cycle. Lives only while the in-flight lease is held.
struct Cycle {
    context: CycleContext,
    state: CycleState,
    /// Full history, extended as turns are appended
    turns: Vec<Turn>,
    started: Instant,
}

/// Conversation orchestrator, generic over its I/O collaborators.
///
/// Cheap to clone; clones share the store, the provider and the in-flight
/// guard.
pub struct Orchestrator<S: Storage + 'static, G: ReplyGenerator + 'static> {
    store: Arc<S>,
    generator: Arc<G>,
    voice: Option<Arc<dyn VoicePipeline>>,
    analytics: Arc<dyn AnalyticsSink>,
    guard: InFlightGuard,
    config: Arc<OrchestratorConfig>,
}

impl<S: Storage + 'static, G: ReplyGenerator + 'static> Clone for Orchestrator<S, G> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            generator: Arc::clone(&self.generator),
            voice: self.voice.clone(),
            analytics: Arc::clone(&self.analytics),
            guard: self.guard.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: Storage + 'static, G: ReplyGenerator + 'static> Orchestrator<S, G> {
    pub fn new(
        store: S,
        generator: G,
        analytics: Arc<dyn AnalyticsSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store: Arc::new(store),
            generator: Arc::new(generator),
            voice: None,
            analytics,
            guard: InFlightGuard::new(),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn with_voice(mut self, voice: Arc<dyn VoicePipeline>) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn voice_enabled(&self) -> bool {
        self.voice.is_some()
    }

    pub fn model_id(&self) -> &str {
        self.generator.model_id()
    }

    /// Accept a user utterance, obtain a reply and append both turns.
    ///
    /// Submissions for the same conversation are processed one at a time in
    /// arrival order. On provider failure the user turn stays stored and the
    /// error carries it back.
    ///
    /// The cycle runs on its own task that owns the in-flight lease. If the
    /// caller goes away the cycle still runs to completion, and the next
    /// submission for the conversation waits for it.
    pub async fn submit_user_message(
        &self,
        request: SubmitRequest,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let started = Instant::now();
        let content = validate_content(&request.content)?;

        let orchestrator = self.clone();
        let task = tokio::spawn(async move {
            orchestrator.run_submission(request, content, started).await
        });

        task.await.map_err(|e| {
            tracing::error!(error = %e, "Submission task failed");
            OrchestratorError::Internal(format!("Submission task failed: {e}"))
        })?
    }

    async fn run_submission(
        self,
        request: SubmitRequest,
        content: String,
        started: Instant,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let conversation_id = match request.conversation_id {
            Some(id) => id,
            None => {
                let conversation = self.store.create(&request.user_id).await?;
                tracing::info!(
                    conv_id = %conversation.id,
                    user_id = %request.user_id,
                    "Created conversation"
                );
                conversation.id
            }
        };

        let lease = self.guard.acquire(&conversation_id).await;
        tracing::debug!(
            conv_id = %lease.conversation_id(),
            in_flight = self.guard.active(),
            waited_ms = %started.elapsed().as_millis(),
            "Acquired conversation"
        );

        // Loaded under the lease so the last sequence cannot move underneath us
        let conversation = self.owned_conversation(&conversation_id, &request.user_id).await?;

        let mut cycle = Cycle {
            context: CycleContext::new(
                &conversation_id,
                &request.user_id,
                request.provenance,
                request.want_audio,
                conversation.last_sequence(),
            )
            .with_voice_available(self.voice.is_some()),
            state: CycleState::Created,
            turns: conversation.turns,
            started,
        };

        let outcome = self.run_cycle(&mut cycle, CycleEvent::Submitted { content }).await?;
        tracing::info!(
            conv_id = %conversation_id,
            user_seq = outcome.user_turn().sequence,
            replied = matches!(outcome, CycleOutcome::Replied { .. }),
            elapsed_ms = %started.elapsed().as_millis(),
            "Cycle resolved"
        );

        match outcome {
            CycleOutcome::Replied { assistant_turn, .. } => Ok(SubmitOutcome {
                conversation_id,
                sequence_number: assistant_turn.sequence,
                turn: assistant_turn,
                transcript: None,
            }),
            CycleOutcome::Failed { user_turn, failure } => Err(OrchestratorError::ProviderFailure {
                message: failure.message,
                retryable: failure.retryable,
                user_turn: Box::new(user_turn),
            }),
        }
    }

    /// Transcribe spoken input, then submit it as a voice turn.
    ///
    /// Nothing is created when transcription fails.
    pub async fn submit_voice_message(
        &self,
        conversation_id: Option<String>,
        user_id: &str,
        audio: AudioClip,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let voice = self
            .voice
            .as_ref()
            .ok_or_else(|| OrchestratorError::InvalidInput("Voice pipeline not configured".into()))?;

        if audio.is_empty() {
            return Err(OrchestratorError::Transcription(VoiceError::EmptyAudio));
        }

        let transcript = voice.transcribe(&audio).await.map_err(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "Transcription failed");
            OrchestratorError::Transcription(e)
        })?;

        let request = SubmitRequest {
            conversation_id,
            user_id: user_id.to_string(),
            content: transcript.clone(),
            provenance: Provenance::Voice,
            want_audio: true,
        };

        let mut outcome = self.submit_user_message(request).await?;
        outcome.transcript = Some(transcript);
        Ok(outcome)
    }

    /// Full stored history, never truncated
    pub async fn history(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, OrchestratorError> {
        self.owned_conversation(conversation_id, user_id).await
    }

    pub async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, OrchestratorError> {
        Ok(self.store.list_for_user(user_id).await?)
    }

    /// Synthesized audio for an assistant turn, `None` until it is ready
    pub async fn audio_for_turn(
        &self,
        conversation_id: &str,
        user_id: &str,
        sequence: i64,
    ) -> Result<Option<AudioClip>, OrchestratorError> {
        self.owned_conversation(conversation_id, user_id).await?;
        Ok(self.store.load_audio(conversation_id, sequence).await?)
    }

    /// Load a conversation, hiding other users' conversations as not found
    async fn owned_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, OrchestratorError> {
        let conversation = self.store.load(conversation_id).await?;
        if conversation.is_owned_by(user_id) {
            Ok(conversation)
        } else {
            Err(OrchestratorError::NotFound(conversation_id.to_string()))
        }
    }

    async fn run_cycle(
        &self,
        cycle: &mut Cycle,
        event: CycleEvent,
    ) -> Result<CycleOutcome, OrchestratorError> {
        let mut events = vec![event];

        while let Some(event) = events.pop() {
            let result = transition(&cycle.state, &cycle.context, event)?;

            tracing::debug!(
                conv_id = %cycle.context.conversation_id,
                from = cycle.state.name(),
                to = result.new_state.name(),
                "Cycle transition"
            );
            cycle.state = result.new_state;

            for effect in result.effects {
                if let Some(next) = self.execute_effect(cycle, effect).await? {
                    events.push(next);
                }
            }
        }

        match std::mem::take(&mut cycle.state) {
            CycleState::Done { outcome } => Ok(outcome),
            other => Err(OrchestratorError::Internal(format!(
                "Cycle stopped in state {}",
                other.name()
            ))),
        }
    }

    async fn execute_effect(
        &self,
        cycle: &mut Cycle,
        effect: Effect,
    ) -> Result<Option<CycleEvent>, OrchestratorError> {
        let conv_id = cycle.context.conversation_id.clone();

        match effect {
            Effect::AppendTurn(new_turn) => {
                let role = new_turn.role;
                let turn = self.store.append(&conv_id, new_turn).await.map_err(|e| {
                    tracing::error!(conv_id = %conv_id, role = %role, error = %e, "Failed to append turn");
                    OrchestratorError::from(e)
                })?;

                tracing::info!(conv_id = %conv_id, seq = turn.sequence, role = %turn.role, "Turn appended");
                cycle.turns.push(turn.clone());

                Ok(Some(match turn.role {
                    crate::db::Role::User => CycleEvent::UserTurnPersisted { turn },
                    crate::db::Role::Assistant => CycleEvent::AssistantTurnPersisted { turn },
                }))
            }

            Effect::BuildContext => Ok(Some(CycleEvent::ContextBuilt {
                context: project(&cycle.turns, self.config.context_turns),
            })),

            Effect::RequestReply { context } => {
                let start = Instant::now();
                let result =
                    tokio::time::timeout(self.config.provider_timeout, self.generator.generate(&context))
                        .await
                        .unwrap_or_else(|_| {
                            Err(LlmError::timeout(format!(
                                "No reply within {}s",
                                self.config.provider_timeout.as_secs_f64()
                            )))
                        });

                match result {
                    Ok(reply) => {
                        tracing::info!(
                            conv_id = %conv_id,
                            model = %self.generator.model_id(),
                            context_turns = context.len(),
                            duration_ms = %start.elapsed().as_millis(),
                            "Provider replied"
                        );
                        Ok(Some(CycleEvent::ProviderReplied {
                            content: reply.content,
                        }))
                    }
                    Err(e) => {
                        tracing::warn!(
                            conv_id = %conv_id,
                            model = %self.generator.model_id(),
                            duration_ms = %start.elapsed().as_millis(),
                            retryable = e.is_retryable(),
                            error = %e,
                            "Provider failed"
                        );
                        Ok(Some(CycleEvent::ProviderFailed {
                            failure: ProviderFailure::new(e.message.clone(), e.is_retryable()),
                        }))
                    }
                }
            }

            Effect::Report {
                kind,
                sequence,
                retryable,
                synthesize,
            } => {
                self.record_event(cycle, kind, sequence, retryable);
                if let Some(synthesis) = synthesize {
                    self.dispatch_synthesis(&conv_id, synthesis);
                }
                Ok(Some(CycleEvent::Reported))
            }

            Effect::Respond => Ok(Some(CycleEvent::Responded)),
        }
    }

    fn record_event(&self, cycle: &Cycle, kind: EventKind, sequence: i64, retryable: Option<bool>) {
        let latency_ms = u64::try_from(cycle.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let event = AnalyticsEvent {
            user_id: cycle.context.user_id.clone(),
            conversation_id: cycle.context.conversation_id.clone(),
            kind,
            sequence,
            timestamp: Utc::now(),
            latency_ms,
            retryable,
        };

        if let Err(e) = self.analytics.record(event) {
            tracing::warn!(
                conv_id = %cycle.context.conversation_id,
                kind = %kind,
                error = %e,
                "Analytics event dropped"
            );
        }
    }

    /// Speak the reply in the background; the caller already has the text
    fn dispatch_synthesis(&self, conv_id: &str, synthesis: Synthesis) {
        let Some(voice) = self.voice.clone() else {
            tracing::debug!(conv_id = %conv_id, "Audio requested but voice is not configured");
            return;
        };

        let store = Arc::clone(&self.store);
        let conv_id = conv_id.to_string();
        tokio::spawn(async move {
            let Synthesis { sequence, text } = synthesis;
            let clip = match voice.synthesize(&text).await {
                Ok(clip) => clip,
                Err(e) => {
                    tracing::warn!(conv_id = %conv_id, seq = sequence, error = %e, "Voice synthesis failed");
                    return;
                }
            };

            match store.save_audio(&conv_id, sequence, clip).await {
                Ok(()) => tracing::debug!(conv_id = %conv_id, seq = sequence, "Reply audio stored"),
                Err(e) => {
                    tracing::warn!(conv_id = %conv_id, seq = sequence, error = %e, "Failed to store reply audio");
                }
            }
        });
    }
}
