//! LLM provider abstraction
//!
//! Provides a common interface for interacting with various LLM providers.

mod anthropic;
mod error;
mod models;
mod openai;
mod registry;
mod types;

pub use anthropic::AnthropicService;
pub use error::{LlmError, LlmErrorKind};
pub use models::{all_models, ModelDef, Provider};
pub use openai::OpenAIService;
pub use registry::{LlmConfig, ModelRegistry};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;

    /// Get the context window size in tokens
    fn context_window(&self) -> usize;
}

/// Logging wrapper for LLM services
///
/// Retryable failures are logged at `warn`, permanent ones at `error`. A
/// reply cut off by the token limit is still returned but flagged.
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let model = self.inner.model_id();
        let start = std::time::Instant::now();
        let result = self.inner.complete(request).await;
        let duration_ms = start.elapsed().as_millis();

        match &result {
            Ok(response) if response.end_turn => tracing::info!(
                model,
                %duration_ms,
                messages = request.messages.len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "LLM request completed"
            ),
            Ok(response) => tracing::warn!(
                model,
                %duration_ms,
                max_tokens = ?request.max_tokens,
                output_tokens = response.usage.output_tokens,
                "LLM reply truncated"
            ),
            Err(e) if e.is_retryable() => tracing::warn!(
                model,
                %duration_ms,
                kind = ?e.kind,
                retry_after = ?e.retry_after,
                error = %e,
                "LLM request failed"
            ),
            Err(e) => tracing::error!(
                model,
                %duration_ms,
                kind = ?e.kind,
                error = %e,
                "LLM request failed"
            ),
        }

        result
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn context_window(&self) -> usize {
        self.inner.context_window()
    }
}
