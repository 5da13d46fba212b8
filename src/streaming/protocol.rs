//! Gemini Live API protocol types
//!
//! This module defines the JSON messages exchanged with the
//! `BidiGenerateContent` WebSocket endpoint.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=...`
//! 2. Send `setup` with model, response modality, voice and system instruction
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent` with inline audio parts and `interrupted` flags

use serde::{Deserialize, Serialize};

use crate::audio::pcm::is_pcm_audio;

/// Gemini Live API endpoint (API key is appended as a query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Response modalities the model can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Text,
    Audio,
}

/// Inline binary data with its mime type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

/// One part of a content turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Body of the initial `setup` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    /// Fully qualified model name (`models/...`)
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

/// Body of a `realtimeInput` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Transport session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Model identifier, with or without the `models/` prefix
    pub model: String,
    pub response_modality: Modality,
    pub voice: String,
    pub system_instruction: String,
}

impl SessionConfig {
    /// Build the `setup` body for this session
    pub fn to_setup(&self) -> Setup {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };

        let speech_config = (self.response_modality == Modality::Audio && !self.voice.is_empty())
            .then(|| SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: self.voice.clone(),
                    },
                },
            });

        let system_instruction = (!self.system_instruction.is_empty()).then(|| Content {
            parts: vec![Part::text(self.system_instruction.clone())],
            role: None,
        });

        Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![self.response_modality],
                speech_config,
            },
            system_instruction,
        }
    }
}

// ============================================================================
// Client Messages (sent TO the Live API)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Initial session configuration
    Setup(Setup),
    /// Streamed media input
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn setup(config: &SessionConfig) -> Self {
        Self::Setup(config.to_setup())
    }

    /// Wrap one encoded audio chunk
    pub fn media(chunk: Blob) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the Live API)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    /// Set when the user started speaking over the model
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub generation_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// A message from the Live API. Every field is optional; unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Inline PCM audio parts of the model turn, in order
    pub fn audio_payloads(&self) -> impl Iterator<Item = &Blob> {
        self.server_content
            .as_ref()
            .and_then(|content| content.model_turn.as_ref())
            .into_iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| is_pcm_audio(&blob.mime_type))
    }

    /// Whether the server signalled barge-in
    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.interrupted)
            .unwrap_or(false)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.turn_complete)
            .unwrap_or(false)
    }
}
