//! # Browser WebSocket Protocol
//!
//! Every frame is a JSON text message tagged with `type`. Event names are the
//! ones the tutoring frontend already listens for, so they are kebab-case.
//!
//! ## Client → Server
//! - `authenticate{token}` (only as the first frame, when no token was given at upgrade)
//! - `start-nova-sonic{session_id, voice_id, patient_name, patient_prompt, patient_id, llm_completion, system_prompt}`
//! - `audio-input{data}` (base64 PCM16 from the microphone)
//! - `text-input{text}`
//! - `text-generation{simulation_group_id, session_id, patient_id, session_name, message, token}`
//! - `end-audio`
//! - `stop-nova-sonic`
//!
//! ## Server → Client
//! - `nova-started{status}`, `nova-error{error}`
//! - `audio-chunk{data}` (base64 PCM16 @ 24 kHz, relayed untouched)
//! - `text-message{text}`, `empathy-feedback{content}`, `empathy-data{...}`
//! - `diagnosis-complete{message}`
//! - `text-stream{data}` (one event of a streamed chat reply, relayed untouched)

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::voice::protocol::{is_truthy, EmpathySummary};

/// Status text sent with `nova-started`.
pub const SESSION_STARTED_STATUS: &str = "Nova Sonic session started";

/// Message sent with `diagnosis-complete` when the process only signals completion.
pub const SESSION_COMPLETED_MESSAGE: &str = "Session completed successfully";

/// Frames accepted from the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "start-nova-sonic")]
    StartNovaSonic(StartRequest),

    #[serde(rename = "audio-input")]
    AudioInput { data: String },

    #[serde(rename = "text-input")]
    TextInput { text: String },

    #[serde(rename = "text-generation")]
    TextGeneration(TextGenerationRequest),

    #[serde(rename = "end-audio")]
    EndAudio,

    #[serde(rename = "stop-nova-sonic")]
    StopNovaSonic,
}

/// Parameters of a voice session. Every field is optional on the wire.
///
/// The frontend is loose about types (numeric ids, `"true"` flags), so text
/// fields accept any JSON scalar and falsy values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    #[serde(deserialize_with = "loose_text")]
    pub session_id: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub voice_id: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub patient_name: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub patient_prompt: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub patient_id: Option<String>,
    #[serde(deserialize_with = "loose_flag")]
    pub llm_completion: Option<bool>,
    #[serde(deserialize_with = "loose_text")]
    pub system_prompt: Option<String>,
}

/// A text chat turn, answered by the text-generation service.
///
/// `token` is forwarded as the `Authorization` header; without it the
/// connection's own bearer token is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextGenerationRequest {
    #[serde(deserialize_with = "loose_text")]
    pub simulation_group_id: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub session_id: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub patient_id: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub session_name: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub message: Option<String>,
    #[serde(deserialize_with = "loose_text")]
    pub token: Option<String>,
}

/// Any truthy JSON value as text: strings as-is, everything else as JSON.
pub(crate) fn loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        _ if !is_truthy(&value) => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn loose_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok((!value.is_null()).then(|| is_truthy(&value)))
}

/// Events pushed to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "nova-started")]
    NovaStarted { status: String },

    #[serde(rename = "nova-error")]
    NovaError { error: String },

    #[serde(rename = "audio-chunk")]
    AudioChunk { data: String },

    #[serde(rename = "text-message")]
    TextMessage { text: String },

    #[serde(rename = "empathy-feedback")]
    EmpathyFeedback { content: serde_json::Value },

    #[serde(rename = "empathy-data")]
    EmpathyData(EmpathySummary),

    #[serde(rename = "diagnosis-complete")]
    DiagnosisComplete { message: String },

    #[serde(rename = "text-stream")]
    TextStream { data: serde_json::Value },
}

impl ServerMessage {
    pub fn started() -> Self {
        ServerMessage::NovaStarted {
            status: SESSION_STARTED_STATUS.to_string(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::NovaError { error: error.into() }
    }

    pub fn session_completed() -> Self {
        ServerMessage::DiagnosisComplete {
            message: SESSION_COMPLETED_MESSAGE.to_string(),
        }
    }

    /// Wire name of this event, used in logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::NovaStarted { .. } => "nova-started",
            ServerMessage::NovaError { .. } => "nova-error",
            ServerMessage::AudioChunk { .. } => "audio-chunk",
            ServerMessage::TextMessage { .. } => "text-message",
            ServerMessage::EmpathyFeedback { .. } => "empathy-feedback",
            ServerMessage::EmpathyData(_) => "empathy-data",
            ServerMessage::DiagnosisComplete { .. } => "diagnosis-complete",
            ServerMessage::TextStream { .. } => "text-stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_fields_are_optional() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"start-nova-sonic"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StartNovaSonic(StartRequest::default()));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"start-nova-sonic","voice_id":"matthew","llm_completion":true,"patient_name":"Ana"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::StartNovaSonic(req) => {
                assert_eq!(req.voice_id.as_deref(), Some("matthew"));
                assert_eq!(req.llm_completion, Some(true));
                assert_eq!(req.patient_name.as_deref(), Some("Ana"));
                assert!(req.session_id.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_start_request_accepts_loose_types() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"start-nova-sonic","llm_completion":"true","patient_id":42,"session_id":"","voice_id":null}"#,
        )
        .unwrap();
        let ClientMessage::StartNovaSonic(req) = msg else {
            panic!("expected a start request");
        };
        assert_eq!(req.llm_completion, Some(true));
        assert_eq!(req.patient_id.as_deref(), Some("42"));
        assert!(req.session_id.is_none());
        assert!(req.voice_id.is_none());

        let req: StartRequest =
            serde_json::from_str(r#"{"llm_completion":0,"patient_id":0}"#).unwrap();
        assert_eq!(req.llm_completion, Some(false));
        assert!(req.patient_id.is_none());
    }

    #[test]
    fn test_unit_client_messages() {
        let end: ClientMessage = serde_json::from_str(r#"{"type":"end-audio"}"#).unwrap();
        assert_eq!(end, ClientMessage::EndAudio);
        let stop: ClientMessage = serde_json::from_str(r#"{"type":"stop-nova-sonic"}"#).unwrap();
        assert_eq!(stop, ClientMessage::StopNovaSonic);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"start-audio"}"#).is_err());
    }

    #[test]
    fn test_server_message_wire_format() {
        let json = serde_json::to_value(ServerMessage::started()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "nova-started", "status": "Nova Sonic session started"})
        );

        let json = serde_json::to_value(ServerMessage::session_completed()).unwrap();
        assert_eq!(json["type"], "diagnosis-complete");
        assert_eq!(json["message"], "Session completed successfully");
    }
}
