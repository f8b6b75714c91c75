//! Voice pipeline abstraction
//!
//! Speech-to-text runs before a submission (the transcript becomes the user
//! turn's content); text-to-speech runs as fan-out after an assistant turn
//! exists. Both are independently failable.

mod openai;

pub use openai::{OpenAiVoice, VoiceConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Encoded audio with its media type. Base64 under `audio` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioClip {
    #[serde(rename = "audio", with = "base64_bytes")]
    pub data: Vec<u8>,
    pub media_type: String,
}

impl AudioClip {
    pub fn new(data: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            data,
            media_type: media_type.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// File extension the transcription endpoint uses to sniff the format
    pub fn file_extension(&self) -> &'static str {
        match self.media_type.as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
            "audio/webm" => "webm",
            "audio/ogg" => "ogg",
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
            "audio/flac" => "flac",
            _ => "mp3",
        }
    }
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("Audio input is empty")]
    EmptyAudio,
    #[error("Transcription produced no text")]
    EmptyTranscript,
    #[error("Voice request failed: {0}")]
    Request(String),
    #[error("Voice provider returned {status}: {message}")]
    Provider { status: u16, message: String },
}

/// Speech-to-text and text-to-speech provider
#[async_trait]
pub trait VoicePipeline: Send + Sync {
    /// Convert recorded speech into text
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, VoiceError>;

    /// Render text as speech
    async fn synthesize(&self, text: &str) -> Result<AudioClip, VoiceError>;
}

#[async_trait]
impl<T: VoicePipeline + ?Sized> VoicePipeline for Arc<T> {
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, VoiceError> {
        (**self).transcribe(audio).await
    }

    async fn synthesize(&self, text: &str) -> Result<AudioClip, VoiceError> {
        (**self).synthesize(text).await
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
