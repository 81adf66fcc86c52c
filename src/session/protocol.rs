//! Wire messages of the bidirectional live session (JSON over WebSocket).
//!
//! Client → server: one `setup` message when the socket opens, then a stream
//! of `realtimeInput` messages carrying base64 PCM. Server → client messages
//! are a loose envelope; only the fields the call pipeline reacts to are
//! modelled, everything else is ignored by serde.

use crate::audio::codec::WireAudioPayload;
use serde::{Deserialize, Serialize};

/// Parameters fixed when a session is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub model: String,
    pub voice_name: String,
    pub language_code: String,
    pub system_instruction: String,
}

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Audio,
    Text,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
    pub language_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SetupMessage {
    pub fn from_request(request: &ConnectRequest) -> Self {
        let model = if request.model.starts_with("models/") {
            request.model.clone()
        } else {
            format!("models/{}", request.model)
        };

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec![Modality::Audio],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: request.voice_name.clone(),
                            },
                        },
                        language_code: request.language_code.clone(),
                    },
                },
                system_instruction: Content {
                    parts: vec![Part::text(request.system_instruction.clone())],
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

impl RealtimeInputMessage {
    pub fn audio(payload: &WireAudioPayload) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: payload.mime_type.clone(),
                    data: payload.to_base64(),
                }],
            },
        }
    }
}

/// Base64 data with its MIME type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: String) -> Self {
        Self {
            text: Some(text),
            inline_data: None,
        }
    }
}

/// Any message received from the server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<serde_json::Value>,
    pub error: Option<ServerError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub message: String,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Inline audio of the model turn, if the message carries any.
    pub fn audio(&self) -> Option<&Blob> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .iter()
            .find_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
    }

    /// The engine detected user speech over its own output.
    pub fn interrupted(&self) -> bool {
        self.server_content.as_ref().map(|c| c.interrupted).unwrap_or(false)
    }

    pub fn turn_complete(&self) -> bool {
        self.server_content.as_ref().map(|c| c.turn_complete).unwrap_or(false)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}
