//! Model registry for managing available LLM providers

use super::{all_models, LlmService, LoggingService, ModelDef, Provider};
use std::collections::HashMap;
use std::sync::Arc;

const PREFERRED_DEFAULT: &str = "claude-4.5-sonnet";

/// Configuration for LLM providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    /// Override for OpenAI-compatible endpoints
    pub openai_base_url: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            anthropic_api_key: non_empty("ANTHROPIC_API_KEY"),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_base_url: non_empty("OPENAI_BASE_URL"),
            default_model: non_empty("COLLOQUY_MODEL"),
        }
    }
}

/// Registry of available LLM models
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model: String,
}

impl ModelRegistry {
    /// Create an empty registry
    #[cfg(test)]
    pub fn new_empty() -> Self {
        Self {
            services: HashMap::new(),
            default_model: "test-model".to_string(),
        }
    }

    /// Create a registry holding one service, which is also the default
    #[cfg(test)]
    pub fn with_service(service: Arc<dyn LlmService>) -> Self {
        let default_model = service.model_id().to_string();
        let mut services = HashMap::new();
        services.insert(default_model.clone(), service);
        Self {
            services,
            default_model,
        }
    }

    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        for model_def in all_models() {
            if let Some(service) = Self::try_create_model(model_def, config) {
                services.insert(model_def.id.to_string(), service);
            }
        }

        let default_model = config
            .default_model
            .clone()
            .or_else(|| {
                if services.contains_key(PREFERRED_DEFAULT) {
                    Some(PREFERRED_DEFAULT.to_string())
                } else {
                    // Fall back to the first available model in definition order
                    all_models()
                        .iter()
                        .find(|def| services.contains_key(def.id))
                        .map(|def| def.id.to_string())
                }
            })
            .unwrap_or_else(|| PREFERRED_DEFAULT.to_string());

        Self {
            services,
            default_model,
        }
    }

    fn try_create_model(model_def: &ModelDef, config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
        let (api_key, base_url) = match model_def.provider {
            Provider::Anthropic => (config.anthropic_api_key.as_ref()?, None),
            Provider::OpenAI => (
                config.openai_api_key.as_ref()?,
                config.openai_base_url.as_deref(),
            ),
        };

        if api_key.is_empty() {
            return None;
        }

        match (model_def.factory)(api_key, base_url) {
            Ok(service) => Some(Arc::new(LoggingService::new(service))),
            Err(e) => {
                tracing::warn!(
                    model = model_def.id,
                    env = model_def.provider.api_key_env_var(),
                    error = %e,
                    "Failed to initialize model"
                );
                None
            }
        }
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    /// Get the default model
    pub fn default(&self) -> Option<Arc<dyn LlmService>> {
        self.get(&self.default_model)
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// List all available model IDs
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }

    /// Get detailed information about available models
    pub fn available_model_info(&self) -> Vec<crate::api::ModelInfo> {
        all_models()
            .iter()
            .filter_map(|def| {
                let service = self.services.get(def.id)?;
                Some(crate::api::ModelInfo {
                    id: def.id.to_string(),
                    provider: def.provider.display_name().to_string(),
                    description: def.description.to_string(),
                    context_window: service.context_window(),
                })
            })
            .collect()
    }

    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }
}
