//! `OpenAI`-compatible speech endpoints

use super::{AudioClip, VoiceError, VoicePipeline};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for the voice pipeline
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub transcription_model: String,
    pub speech_model: String,
    pub speech_voice: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            transcription_model: "whisper-1".to_string(),
            speech_model: "tts-1".to_string(),
            speech_voice: "alloy".to_string(),
        }
    }
}

impl VoiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            transcription_model: defaults.transcription_model,
            speech_model: defaults.speech_model,
            speech_voice: std::env::var("COLLOQUY_TTS_VOICE").unwrap_or(defaults.speech_voice),
        }
    }
}

/// Voice pipeline backed by the `OpenAI` audio API
pub struct OpenAiVoice {
    client: Client,
    api_key: String,
    config: VoiceConfig,
}

impl OpenAiVoice {
    pub fn new(api_key: String, config: VoiceConfig) -> Result<Self, VoiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| VoiceError::Request(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VoiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(VoiceError::Provider {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl VoicePipeline for OpenAiVoice {
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, VoiceError> {
        if audio.is_empty() {
            return Err(VoiceError::EmptyAudio);
        }

        let part = Part::bytes(audio.data.clone())
            .file_name(format!("speech.{}", audio.file_extension()))
            .mime_str(&audio.media_type)
            .map_err(|e| VoiceError::Request(format!("Invalid media type: {e}")))?;

        let form = Form::new()
            .text("model", self.config.transcription_model.clone())
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Request(e.to_string()))?;

        let body: TranscriptionResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| VoiceError::Request(format!("Failed to parse transcription: {e}")))?;

        let text = body.text.trim();
        if text.is_empty() {
            return Err(VoiceError::EmptyTranscript);
        }
        Ok(text.to_string())
    }

    async fn synthesize(&self, text: &str) -> Result<AudioClip, VoiceError> {
        let request = SpeechRequest {
            model: &self.config.speech_model,
            input: text,
            voice: &self.config.speech_voice,
            response_format: "mp3",
        };

        let response = self
            .client
            .post(self.endpoint("audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Request(e.to_string()))?;

        let bytes = Self::check_status(response)
            .await?
            .bytes()
            .await
            .map_err(|e| VoiceError::Request(format!("Failed to read audio: {e}")))?;

        Ok(AudioClip::new(bytes.to_vec(), "audio/mpeg"))
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}
