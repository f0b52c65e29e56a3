//! # Live Protocol Frames
//!
//! Serde models of the JSON frames spoken on the live audio WebSocket.
//!
//! ## Outbound:
//! - **setup**: sent once after connecting (model, audio-only responses, voice, persona)
//! - **realtimeInput**: one per captured microphone block
//!
//! ## Inbound:
//! Server frames are decoded into an ordered list of [`LiveEvent`]s. A single
//! frame can carry several audio parts and an interruption flag at once; the
//! audio comes first so that the interruption discards it together with
//! everything already scheduled.

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};

/// MIME tag of every outbound microphone chunk.
pub const OUTBOUND_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Parameters of one live session, fixed at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl SessionSetup {
    /// Model name as the endpoint expects it (`models/<id>`).
    pub fn qualified_model(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    /// Serialize the setup frame.
    pub fn to_frame(&self) -> Result<String, VoiceError> {
        let frame = SetupFrame {
            setup: Setup {
                model: self.qualified_model(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO"],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: &self.voice,
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: &self.system_instruction,
                    }],
                },
            },
        };

        serde_json::to_string(&frame).map_err(|e| VoiceError::Protocol(e.to_string()))
    }
}

#[derive(Serialize)]
struct SetupFrame<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

/// One encoded microphone block on its way to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChunk {
    pub mime_type: String,
    pub data: String,
}

impl OutboundChunk {
    /// A PCM16 microphone chunk with the fixed outbound MIME tag.
    pub fn pcm(data: String) -> Self {
        Self {
            mime_type: OUTBOUND_MIME_TYPE.to_string(),
            data,
        }
    }

    /// Serialize as a `realtimeInput` frame.
    pub fn to_frame(&self) -> Result<String, VoiceError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RealtimeInputFrame<'a> {
            realtime_input: RealtimeInput<'a>,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RealtimeInput<'a> {
            media_chunks: [&'a OutboundChunk; 1],
        }

        serde_json::to_string(&RealtimeInputFrame {
            realtime_input: RealtimeInput { media_chunks: [self] },
        })
        .map_err(|e| VoiceError::Send(e.to_string()))
    }
}

/// Something the service told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// The setup frame was accepted; the session is open
    SetupComplete,
    /// Base64 PCM16 audio at the output rate
    Audio(String),
    /// The user barged in; unplayed audio must be discarded
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The connection ended (with the close reason, if any)
    Closed(Option<String>),
    /// The connection failed
    Error(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    #[serde(default)]
    data: String,
}

/// Decode one server frame into events, in the order they must be handled.
///
/// Frames the client does not care about (usage metadata, transcriptions)
/// produce no events. Invalid JSON is a [`VoiceError::Protocol`].
pub fn parse_server_message(text: &str) -> Result<Vec<LiveEvent>, VoiceError> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| VoiceError::Protocol(e.to_string()))?;

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(LiveEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|inline| !inline.data.is_empty())
                    .map(|inline| LiveEvent::Audio(inline.data)),
            );
        }
        if content.interrupted {
            events.push(LiveEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(LiveEvent::TurnComplete);
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "gemini-test".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "Be brief.".to_string(),
        }
    }

    #[test]
    fn test_setup_frame_shape() {
        let frame: Value = serde_json::from_str(&setup().to_frame().unwrap()).unwrap();
        let setup = &frame["setup"];

        assert_eq!(setup["model"], "models/gemini-test");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
    }

    #[test]
    fn test_model_prefix_is_not_doubled() {
        let mut setup = setup();
        setup.model = "models/already".to_string();
        assert_eq!(setup.qualified_model(), "models/already");
    }

    #[test]
    fn test_realtime_input_frame_shape() {
        let frame = OutboundChunk::pcm("AAAA".to_string()).to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAAA");
    }

    #[test]
    fn test_parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, vec![LiveEvent::SetupComplete]);
    }

    #[test]
    fn test_every_audio_part_becomes_an_event() {
        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}},
            {"text":"ignored"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQE="}}
        ]}}}"#;
        let events = parse_server_message(text).unwrap();
        assert_eq!(
            events,
            vec![LiveEvent::Audio("AAA=".to_string()), LiveEvent::Audio("AQE=".to_string())]
        );
    }

    #[test]
    fn test_audio_precedes_interruption() {
        let text = r#"{"serverContent":{"interrupted":true,"turnComplete":true,
            "modelTurn":{"parts":[{"inlineData":{"data":"AAA="}}]}}}"#;
        let events = parse_server_message(text).unwrap();
        assert_eq!(
            events,
            vec![
                LiveEvent::Audio("AAA=".to_string()),
                LiveEvent::Interrupted,
                LiveEvent::TurnComplete
            ]
        );
    }

    #[test]
    fn test_unknown_frames_are_ignored() {
        let events = parse_server_message(r#"{"usageMetadata":{"totalTokenCount":12}}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_invalid_json_is_protocol_error() {
        let err = parse_server_message("{not json").unwrap_err();
        assert!(matches!(err, VoiceError::Protocol(_)));
    }
}
