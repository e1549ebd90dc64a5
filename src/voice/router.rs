//! Classifies voice-process stdout lines into browser events.
//!
//! JSON lines are dispatched on their `type` tag. Lines that are not JSON at
//! all are scanned for the literal markers older voice scripts print.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::protocol::ServerMessage;
use crate::session::ConnectionSession;
use crate::voice::protocol::{is_truthy, ChildEvent, EmpathySummary};

/// Printed by the voice process once it accepts input.
pub const READY_PHRASE: &str = "Nova Sonic ready";
const COACH_MARKER: &str = "**Empathy Coach:**";
const SPEAKER_LABELS: [&str; 2] = ["User:", "Assistant:"];
const COMPLETION_MARKER: &str = "SESSION COMPLETED";

/// Turn one stdout line into zero or more events for the client.
///
/// May mark the session ready. Line-level errors are logged here and never
/// escalate.
pub fn route(line: &str, session: &mut ConnectionSession) -> Vec<ServerMessage> {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(_) => return route_plain_text(line, session),
    };

    let event = match serde_json::from_value::<ChildEvent>(value) {
        Ok(event) => event,
        Err(err) => {
            let err = RelayError::MalformedEvent(err.to_string());
            warn!(connection_id = %session.connection_id(), error = %err, "Dropping voice process line");
            return Vec::new();
        }
    };

    match event {
        ChildEvent::Audio { data } => vec![ServerMessage::AudioChunk { data }],
        ChildEvent::Debug { text } => {
            debug!(connection_id = %session.connection_id(), "voice debug: {}", text);
            Vec::new()
        }
        ChildEvent::Text { text } => {
            let mut events = Vec::with_capacity(2);
            let ready = text.contains(READY_PHRASE);
            events.push(ServerMessage::TextMessage { text });
            if ready && session.mark_ready() {
                events.push(ServerMessage::started());
            }
            events
        }
        ChildEvent::Empathy { content } => vec![ServerMessage::EmpathyFeedback { content }],
        ChildEvent::EmpathyData { content } => match EmpathySummary::from_evaluation(&content) {
            Ok(summary) => vec![ServerMessage::EmpathyData(summary)],
            Err(err) => {
                warn!(connection_id = %session.connection_id(), error = %err, "Dropping empathy data");
                Vec::new()
            }
        },
        ChildEvent::DiagnosisComplete { text } => {
            vec![ServerMessage::DiagnosisComplete { message: text }]
        }
        ChildEvent::DiagnosisVerdict { verdict } => {
            if is_truthy(&verdict) {
                vec![ServerMessage::session_completed()]
            } else {
                Vec::new()
            }
        }
    }
}

fn route_plain_text(line: &str, session: &mut ConnectionSession) -> Vec<ServerMessage> {
    let mut events = Vec::new();

    if line.contains(READY_PHRASE) && session.mark_ready() {
        events.push(ServerMessage::started());
    }
    if line.contains(COACH_MARKER) {
        events.push(ServerMessage::EmpathyFeedback {
            content: Value::String(line.to_string()),
        });
    }
    if SPEAKER_LABELS.iter().any(|label| line.starts_with(label)) {
        events.push(ServerMessage::TextMessage {
            text: line.to_string(),
        });
    }
    if line.contains(COMPLETION_MARKER) {
        info!(connection_id = %session.connection_id(), "Voice process reported completion");
        events.push(ServerMessage::session_completed());
    }

    if events.is_empty() {
        debug!(connection_id = %session.connection_id(), "voice output: {}", line);
    }
    events
}
