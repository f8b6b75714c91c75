//! Mock implementations for testing
//!
//! These mocks enable orchestrator testing without real I/O.

use super::context::ContextTurn;
use super::traits::*;
use crate::analytics::{AnalyticsError, AnalyticsEvent, AnalyticsSink};
use crate::db::{Conversation, ConversationSummary, NewTurn, Role, Turn};
use crate::llm::LlmError;
use crate::voice::{AudioClip, VoiceError, VoicePipeline};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// In-memory Store
// ============================================================================

/// Store with the same sequence rules as the database
#[derive(Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    audio: Mutex<HashMap<(String, i64), AudioClip>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    reject_assistant_turns: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the backend were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail only assistant appends, leaving user appends working
    pub fn reject_assistant_turns(&self) {
        self.reject_assistant_turns.store(true, Ordering::SeqCst);
    }

    pub fn turns(&self, conversation_id: &str) -> Vec<Turn> {
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }

    pub fn stored_audio(&self, conversation_id: &str, sequence: i64) -> Option<AudioClip> {
        self.audio
            .lock()
            .unwrap()
            .get(&(conversation_id.to_string(), sequence))
            .cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create(&self, user_id: &str) -> Result<Conversation, StoreError> {
        self.check_available()?;
        let id = format!("conv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let now = Utc::now();
        let conversation = Conversation {
            id: id.clone(),
            user_id: user_id.to_string(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.conversations
            .lock()
            .unwrap()
            .insert(id, conversation.clone());
        Ok(conversation)
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        self.check_available()?;
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
    }

    async fn append(&self, conversation_id: &str, turn: NewTurn) -> Result<Turn, StoreError> {
        // Give other tasks a chance to run between read and write
        tokio::task::yield_now().await;
        self.check_available()?;
        if turn.role == Role::Assistant && self.reject_assistant_turns.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("assistant append rejected".to_string()));
        }

        let mut conversations = self.conversations.lock().unwrap();
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;

        let expected = conversation.last_sequence() + 1;
        if turn.sequence != expected {
            return Err(StoreError::SequenceConflict {
                expected,
                got: turn.sequence,
            });
        }

        let stored = Turn {
            conversation_id: conversation_id.to_string(),
            sequence: turn.sequence,
            role: turn.role,
            content: turn.content,
            provenance: turn.provenance,
            created_at: Utc::now(),
        };
        conversation.turns.push(stored.clone());
        conversation.updated_at = stored.created_at;
        Ok(stored)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        self.check_available()?;
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.is_owned_by(user_id))
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                user_id: c.user_id.clone(),
                turn_count: c.turns.len() as i64,
                last_sequence: c.last_sequence(),
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

#[async_trait]
impl AudioStore for InMemoryStore {
    async fn save_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
        clip: AudioClip,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.audio
            .lock()
            .unwrap()
            .insert((conversation_id.to_string(), sequence), clip);
        Ok(())
    }

    async fn load_audio(
        &self,
        conversation_id: &str,
        sequence: i64,
    ) -> Result<Option<AudioClip>, StoreError> {
        self.check_available()?;
        Ok(self.stored_audio(conversation_id, sequence))
    }
}

// ============================================================================
// Mock Reply Generator
// ============================================================================

/// Returns queued replies, then echoes the latest user turn
pub struct MockReplyGenerator {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<Vec<ContextTurn>>>,
}

impl MockReplyGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queue_reply(&self, text: impl Into<String>) {
        self.script.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<Vec<ContextTurn>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn echo(content: &str) -> String {
        format!("reply to: {content}")
    }
}

impl Default for MockReplyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplyGenerator for MockReplyGenerator {
    async fn generate(&self, context: &[ContextTurn]) -> Result<Reply, LlmError> {
        self.requests.lock().unwrap().push(context.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        tokio::task::yield_now().await;

        let scripted = self.script.lock().unwrap().pop_front();
        let content = match scripted {
            Some(result) => result?,
            None => {
                let last_user = context
                    .iter()
                    .rev()
                    .find(|t| t.role == Role::User)
                    .map_or("", |t| t.content.as_str());
                Self::echo(last_user)
            }
        };
        Ok(Reply { content })
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

// ============================================================================
// Mock Voice Pipeline
// ============================================================================

pub struct MockVoice {
    /// `None` transcribes to nothing
    transcript: Option<String>,
    fail_synthesis: bool,
    synthesized: Mutex<Vec<String>>,
}

impl MockVoice {
    pub fn transcribing(text: impl Into<String>) -> Self {
        Self {
            transcript: Some(text.into()),
            fail_synthesis: false,
            synthesized: Mutex::new(Vec::new()),
        }
    }

    pub fn silent() -> Self {
        Self {
            transcript: None,
            fail_synthesis: false,
            synthesized: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_synthesis(mut self) -> Self {
        self.fail_synthesis = true;
        self
    }

    pub fn synthesized(&self) -> Vec<String> {
        self.synthesized.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoicePipeline for MockVoice {
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, VoiceError> {
        if audio.is_empty() {
            return Err(VoiceError::EmptyAudio);
        }
        self.transcript.clone().ok_or(VoiceError::EmptyTranscript)
    }

    async fn synthesize(&self, text: &str) -> Result<AudioClip, VoiceError> {
        self.synthesized.lock().unwrap().push(text.to_string());
        if self.fail_synthesis {
            return Err(VoiceError::Provider {
                status: 503,
                message: "speech backend down".to_string(),
            });
        }
        Ok(AudioClip::new(text.as_bytes().to_vec(), "audio/mpeg"))
    }
}

// ============================================================================
// Analytics Sinks
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AnalyticsSink for RecordingSink {
    fn record(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Sink whose delivery always fails
pub struct FailingSink;

impl AnalyticsSink for FailingSink {
    fn record(&self, _event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        Err(AnalyticsError::Closed)
    }
}

// ============================================================================
// Orchestrator Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::EventKind;
    use crate::db::Provenance;
    use crate::runtime::{
        reply_status, ErrorKind, Orchestrator, OrchestratorConfig, OrchestratorError, ReplyStatus,
        SubmitRequest,
    };
    use proptest::prelude::*;
    use std::sync::Arc;

    type TestOrchestrator = Orchestrator<Arc<InMemoryStore>, Arc<MockReplyGenerator>>;

    struct Harness {
        store: Arc<InMemoryStore>,
        generator: Arc<MockReplyGenerator>,
        sink: Arc<RecordingSink>,
        orchestrator: Arc<TestOrchestrator>,
    }

    fn harness_with(generator: MockReplyGenerator, config: OrchestratorConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let generator = Arc::new(generator);
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&generator),
            sink.clone(),
            config,
        ));
        Harness {
            store,
            generator,
            sink,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(MockReplyGenerator::new(), OrchestratorConfig::default())
    }

    fn voice_harness(voice: MockVoice) -> (Harness, Arc<MockVoice>) {
        let store = Arc::new(InMemoryStore::new());
        let generator = Arc::new(MockReplyGenerator::new());
        let sink = Arc::new(RecordingSink::default());
        let voice = Arc::new(voice);
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::clone(&store),
                Arc::clone(&generator),
                sink.clone(),
                OrchestratorConfig::default(),
            )
            .with_voice(voice.clone()),
        );
        (
            Harness {
                store,
                generator,
                sink,
                orchestrator,
            },
            voice,
        )
    }

    async fn wait_for_audio(store: &InMemoryStore, conv_id: &str, seq: i64) -> Option<AudioClip> {
        for _ in 0..100 {
            if let Some(clip) = store.stored_audio(conv_id, seq) {
                return Some(clip);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Appends finish on their own task after a delay, the way a blocking
    /// database write keeps going after its caller is dropped
    struct DetachedAppendStore {
        inner: Arc<InMemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl ConversationStore for DetachedAppendStore {
        async fn create(&self, user_id: &str) -> Result<Conversation, StoreError> {
            self.inner.create(user_id).await
        }

        async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
            self.inner.load(conversation_id).await
        }

        async fn append(&self, conversation_id: &str, turn: NewTurn) -> Result<Turn, StoreError> {
            let inner = Arc::clone(&self.inner);
            let conversation_id = conversation_id.to_string();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.append(&conversation_id, turn).await
            })
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        }

        async fn list_for_user(
            &self,
            user_id: &str,
        ) -> Result<Vec<ConversationSummary>, StoreError> {
            self.inner.list_for_user(user_id).await
        }
    }

    #[async_trait]
    impl AudioStore for DetachedAppendStore {
        async fn save_audio(
            &self,
            conversation_id: &str,
            sequence: i64,
            clip: AudioClip,
        ) -> Result<(), StoreError> {
            self.inner.save_audio(conversation_id, sequence, clip).await
        }

        async fn load_audio(
            &self,
            conversation_id: &str,
            sequence: i64,
        ) -> Result<Option<AudioClip>, StoreError> {
            self.inner.load_audio(conversation_id, sequence).await
        }
    }

    fn roles_and_sequences(turns: &[Turn]) -> Vec<(i64, Role)> {
        turns.iter().map(|t| (t.sequence, t.role)).collect()
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let h = harness();
        h.generator.queue_reply("hi there");

        let outcome = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "hello"))
            .await
            .unwrap();

        assert_eq!(outcome.turn.content, "hi there");
        assert_eq!(outcome.sequence_number, 2);
        assert!(outcome.transcript.is_none());

        let turns = h.store.turns(&outcome.conversation_id);
        assert_eq!(
            roles_and_sequences(&turns),
            vec![(1, Role::User), (2, Role::Assistant)]
        );
        assert_eq!(turns[0].content, "hello");
        assert_eq!(turns[0].provenance, Some(Provenance::Text));
        assert_eq!(turns[1].content, "hi there");

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageSent);
        assert_eq!(events[0].sequence, 2);
        assert_eq!(events[0].conversation_id, outcome.conversation_id);
        assert_eq!(events[0].user_id, "user-1");
        assert_eq!(events[0].retryable, None);
    }

    #[tokio::test]
    async fn test_provider_timeout_keeps_user_turn() {
        let config = OrchestratorConfig {
            provider_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        };
        let h = harness_with(
            MockReplyGenerator::new().with_delay(Duration::from_secs(5)),
            config,
        );

        // Existing conversation with one completed exchange
        let conv = h.store.create("user-1").await.unwrap();
        h.store
            .append(&conv.id, NewTurn::user(1, "hello", Provenance::Text))
            .await
            .unwrap();
        h.store
            .append(&conv.id, NewTurn::assistant(2, "hi there"))
            .await
            .unwrap();

        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(
                Some(conv.id.clone()),
                "user-1",
                "are you there?",
            ))
            .await
            .unwrap_err();

        match &err {
            OrchestratorError::ProviderFailure {
                retryable,
                user_turn,
                ..
            } => {
                assert!(*retryable);
                assert_eq!(user_turn.sequence, 3);
                assert_eq!(user_turn.content, "are you there?");
            }
            other => panic!("expected provider failure, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::ProviderFailure);

        let turns = h.store.turns(&conv.id);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[2].role, Role::User);
        assert_eq!(
            reply_status(&turns),
            ReplyStatus::AwaitingReply { user_sequence: 3 }
        );

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageFailed);
        assert_eq!(events[0].sequence, 3);
        assert_eq!(events[0].retryable, Some(true));
    }

    #[tokio::test]
    async fn test_provider_error_surfaces_retryable_flag() {
        let h = harness();
        h.generator.queue_error(LlmError::auth("bad key"));

        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ProviderFailure {
                retryable: false,
                ..
            }
        ));

        // Explicit resubmission by the caller works and continues the sequence
        let conv_id = h.store.list_for_user("user-1").await.unwrap()[0].id.clone();
        let outcome = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(Some(conv_id.clone()), "user-1", "hello"))
            .await
            .unwrap();
        assert_eq!(outcome.sequence_number, 3);
        assert_eq!(
            roles_and_sequences(&h.store.turns(&conv_id)),
            vec![(1, Role::User), (2, Role::User), (3, Role::Assistant)]
        );
    }

    #[tokio::test]
    async fn test_blank_reply_is_failure() {
        let h = harness();
        h.generator.queue_reply("  \n ");

        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "hello"))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::ProviderFailure {
                retryable,
                user_turn,
                ..
            } => {
                assert!(!retryable);
                assert_eq!(h.store.turns(&user_turn.conversation_id).len(), 1);
            }
            other => panic!("expected provider failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_input_creates_nothing() {
        let h = harness();
        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "   \n\t"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(h.store.conversation_count(), 0);
        assert!(h.sink.events().is_empty());
        assert!(h.generator.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn test_content_is_trimmed() {
        let h = harness();
        let outcome = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "  hello  "))
            .await
            .unwrap();
        assert_eq!(h.store.turns(&outcome.conversation_id)[0].content, "hello");
        assert_eq!(outcome.turn.content, "reply to: hello");
    }

    #[tokio::test]
    async fn test_other_users_conversation_is_not_found() {
        let h = harness();
        let conv = h.store.create("user-1").await.unwrap();

        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(Some(conv.id.clone()), "user-2", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(h.store.turns(&conv.id).is_empty());

        let err = h.orchestrator.history(&conv.id, "user-2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = h
            .orchestrator
            .audio_for_turn(&conv.id, "user-2", 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_not_found() {
        let h = harness();
        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(
                Some("missing".to_string()),
                "user-1",
                "hi",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_store_unavailable_is_store_failure() {
        let h = harness();
        h.store.set_unavailable(true);

        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreFailure);
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_assistant_append_failure_aborts_cycle() {
        let h = harness();
        h.store.reject_assistant_turns();

        let err = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreFailure);

        let conv_id = h.store.list_for_user("user-1").await.unwrap()[0].id.clone();
        assert_eq!(
            roles_and_sequences(&h.store.turns(&conv_id)),
            vec![(1, Role::User)]
        );
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_failing_analytics_does_not_change_result() {
        let store = Arc::new(InMemoryStore::new());
        let generator = Arc::new(MockReplyGenerator::new());
        generator.queue_reply("hi there");
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            generator,
            Arc::new(FailingSink),
            OrchestratorConfig::default(),
        );

        let outcome = orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "hello"))
            .await
            .unwrap();
        assert_eq!(outcome.turn.content, "hi there");
        assert_eq!(outcome.sequence_number, 2);
        assert_eq!(store.turns(&outcome.conversation_id).len(), 2);
    }

    #[tokio::test]
    async fn test_sequences_gap_free_over_many_submissions() {
        let h = harness();
        let mut conv_id = None;
        for i in 0..5 {
            let outcome = h
                .orchestrator
                .submit_user_message(SubmitRequest::text(
                    conv_id.clone(),
                    "user-1",
                    format!("message {i}"),
                ))
                .await
                .unwrap();
            assert_eq!(outcome.sequence_number, 2 * (i + 1));
            conv_id = Some(outcome.conversation_id);
        }

        let turns = h.store.turns(&conv_id.unwrap());
        let sequences: Vec<i64> = turns.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
        assert_eq!(h.sink.events().len(), 5);
    }

    #[tokio::test]
    async fn test_context_window_bounds_prompt_not_history() {
        let config = OrchestratorConfig {
            context_turns: 3,
            ..OrchestratorConfig::default()
        };
        let h = harness_with(MockReplyGenerator::new(), config);

        let mut conv_id = None;
        for text in ["one", "two", "three"] {
            let outcome = h
                .orchestrator
                .submit_user_message(SubmitRequest::text(conv_id.clone(), "user-1", text))
                .await
                .unwrap();
            conv_id = Some(outcome.conversation_id);
        }

        let requests = h.generator.recorded_requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0], vec![ContextTurn::new(Role::User, "one")]);
        assert_eq!(
            requests[2],
            vec![
                ContextTurn::new(Role::User, "two"),
                ContextTurn::new(Role::Assistant, "reply to: two"),
                ContextTurn::new(Role::User, "three"),
            ]
        );

        let history = h
            .orchestrator
            .history(&conv_id.unwrap(), "user-1")
            .await
            .unwrap();
        assert_eq!(history.turns.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_are_not_interleaved() {
        let h = harness_with(
            MockReplyGenerator::new().with_delay(Duration::from_millis(20)),
            OrchestratorConfig::default(),
        );
        let conv = h.store.create("user-1").await.unwrap();

        let submit = |text: &'static str| {
            let orchestrator = Arc::clone(&h.orchestrator);
            let conv_id = conv.id.clone();
            tokio::spawn(async move {
                orchestrator
                    .submit_user_message(SubmitRequest::text(Some(conv_id), "user-1", text))
                    .await
            })
        };

        let a = submit("A");
        let b = submit("B");
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        let mut assistant_sequences = [a.sequence_number, b.sequence_number];
        assistant_sequences.sort_unstable();
        assert_eq!(assistant_sequences, [2, 4]);

        let turns = h.store.turns(&conv.id);
        assert_eq!(turns.len(), 4);
        assert_eq!(
            roles_and_sequences(&turns),
            vec![
                (1, Role::User),
                (2, Role::Assistant),
                (3, Role::User),
                (4, Role::Assistant)
            ]
        );
        // Each reply directly follows the message it answers
        assert_eq!(turns[1].content, MockReplyGenerator::echo(&turns[0].content));
        assert_eq!(turns[3].content, MockReplyGenerator::echo(&turns[2].content));
        assert_ne!(turns[0].content, turns[2].content);
    }

    #[tokio::test]
    async fn test_abandoned_submission_finishes_before_the_next() {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(
            DetachedAppendStore {
                inner: Arc::clone(&store),
                delay: Duration::from_millis(100),
            },
            MockReplyGenerator::new(),
            sink.clone(),
            OrchestratorConfig::default(),
        );
        let conv = store.create("user-1").await.unwrap();

        // The caller gives up while the user turn is still being written
        let abandoned = tokio::time::timeout(
            Duration::from_millis(30),
            orchestrator.submit_user_message(SubmitRequest::text(
                Some(conv.id.clone()),
                "user-1",
                "A",
            )),
        )
        .await;
        assert!(abandoned.is_err());

        let outcome = orchestrator
            .submit_user_message(SubmitRequest::text(Some(conv.id.clone()), "user-1", "B"))
            .await
            .unwrap();
        assert_eq!(outcome.sequence_number, 4);

        let contents: Vec<String> = store
            .turns(&conv.id)
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(contents, ["A", "reply to: A", "B", "reply to: B"]);

        let events = event_kinds(&sink);
        assert_eq!(events, vec![(EventKind::MessageSent, 2), (EventKind::MessageSent, 4)]);
    }

    fn event_kinds(sink: &RecordingSink) -> Vec<(EventKind, i64)> {
        sink.events().iter().map(|e| (e.kind, e.sequence)).collect()
    }

    #[tokio::test]
    async fn test_voice_submission_transcribes_and_synthesizes() {
        let (h, voice) = voice_harness(MockVoice::transcribing("hello"));

        let outcome = h
            .orchestrator
            .submit_voice_message(None, "user-1", AudioClip::new(vec![1, 2, 3], "audio/wav"))
            .await
            .unwrap();

        assert_eq!(outcome.transcript.as_deref(), Some("hello"));
        assert_eq!(outcome.turn.content, "reply to: hello");

        let turns = h.store.turns(&outcome.conversation_id);
        assert_eq!(turns[0].provenance, Some(Provenance::Voice));

        let clip = wait_for_audio(&h.store, &outcome.conversation_id, 2)
            .await
            .expect("audio stored");
        assert_eq!(clip.media_type, "audio/mpeg");
        assert_eq!(voice.synthesized(), vec!["reply to: hello".to_string()]);

        let audio = h
            .orchestrator
            .audio_for_turn(&outcome.conversation_id, "user-1", 2)
            .await
            .unwrap();
        assert!(audio.is_some());

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::VoiceUsed);
    }

    #[tokio::test]
    async fn test_text_with_audio_requested_synthesizes() {
        let (h, _voice) = voice_harness(MockVoice::transcribing("unused"));

        let outcome = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "read this").with_audio(true))
            .await
            .unwrap();

        assert!(wait_for_audio(&h.store, &outcome.conversation_id, 2)
            .await
            .is_some());
        assert_eq!(h.sink.events()[0].kind, EventKind::VoiceUsed);
    }

    #[tokio::test]
    async fn test_synthesis_failure_keeps_text_reply() {
        let (h, voice) = voice_harness(MockVoice::transcribing("hello").failing_synthesis());

        let outcome = h
            .orchestrator
            .submit_voice_message(None, "user-1", AudioClip::new(vec![1], "audio/wav"))
            .await
            .unwrap();
        assert_eq!(outcome.turn.content, "reply to: hello");

        for _ in 0..100 {
            if !voice.synthesized().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(voice.synthesized().len(), 1);
        assert!(h
            .orchestrator
            .audio_for_turn(&outcome.conversation_id, "user-1", 2)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transcription_failure_creates_nothing() {
        let (h, _voice) = voice_harness(MockVoice::silent());

        let err = h
            .orchestrator
            .submit_voice_message(None, "user-1", AudioClip::new(vec![1, 2], "audio/wav"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Transcription(VoiceError::EmptyTranscript)
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(h.store.conversation_count(), 0);
        assert!(h.sink.events().is_empty());

        let err = h
            .orchestrator
            .submit_voice_message(None, "user-1", AudioClip::new(Vec::new(), "audio/wav"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Transcription(VoiceError::EmptyAudio)
        ));
    }

    #[tokio::test]
    async fn test_voice_not_configured() {
        let h = harness();
        assert!(!h.orchestrator.voice_enabled());

        let err = h
            .orchestrator
            .submit_voice_message(None, "user-1", AudioClip::new(vec![1], "audio/wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        // Audio requested without a voice pipeline still returns the reply
        let outcome = h
            .orchestrator
            .submit_user_message(SubmitRequest::text(None, "user-1", "hello").with_audio(true))
            .await
            .unwrap();
        assert_eq!(outcome.sequence_number, 2);

        // Nothing was spoken, so nothing is reported as voice use
        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageSent);
    }

    #[tokio::test]
    async fn test_list_conversations_per_user() {
        let h = harness();
        for user in ["user-1", "user-1", "user-2"] {
            h.orchestrator
                .submit_user_message(SubmitRequest::text(None, user, "hello"))
                .await
                .unwrap();
        }

        let listed = h.orchestrator.list_conversations("user-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|c| c.user_id == "user-1" && c.turn_count == 2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// N concurrent callers on one conversation produce a gap-free,
        /// non-interleaved history
        #[test]
        fn prop_concurrent_callers_gap_free(n in 2usize..10) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let turns = runtime.block_on(async move {
                let h = harness();
                let conv = h.store.create("user-1").await.unwrap();

                let tasks: Vec<_> = (0..n)
                    .map(|i| {
                        let orchestrator = Arc::clone(&h.orchestrator);
                        let conv_id = conv.id.clone();
                        tokio::spawn(async move {
                            orchestrator
                                .submit_user_message(SubmitRequest::text(
                                    Some(conv_id),
                                    "user-1",
                                    format!("message {i}"),
                                ))
                                .await
                        })
                    })
                    .collect();

                for task in tasks {
                    task.await.unwrap().unwrap();
                }
                h.store.turns(&conv.id)
            });

            prop_assert_eq!(turns.len(), 2 * n);
            for (i, turn) in turns.iter().enumerate() {
                prop_assert_eq!(turn.sequence, i as i64 + 1);
            }
            for pair in turns.chunks(2) {
                prop_assert_eq!(pair[0].role, Role::User);
                prop_assert_eq!(pair[1].role, Role::Assistant);
                prop_assert_eq!(&pair[1].content, &MockReplyGenerator::echo(&pair[0].content));
            }
        }
    }
}
