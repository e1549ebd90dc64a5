//! # Text Chat
//!
//! Forwards a chat turn to the text-generation service and relays its
//! server-sent events back to the connection as `text-stream` events.
//!
//! The service answers `POST {endpoint}/student/text_generation?...&stream=true`
//! with an SSE body; each `data: {json}` line is one event. Lines are
//! reassembled across body chunks before parsing.

use actix::Message;
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::error::{RelayError, RelayResult};
use crate::protocol::TextGenerationRequest;

/// One chat event on its way to the connection actor.
#[derive(Debug, Clone, PartialEq, Message)]
#[rtype(result = "()")]
pub struct TextStreamEvent(pub Value);

impl TextStreamEvent {
    /// Failure notice in the shape the frontend renders inline.
    pub fn error(content: impl Into<String>) -> Self {
        Self(json!({"type": "error", "content": content.into()}))
    }
}

pub struct TextGenerationClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TextGenerationClient {
    pub fn new(config: &ChatConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: config.text_generation_endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Send one chat turn and forward every event of the reply, in order.
    ///
    /// Returns the number of events forwarded. Stops early, without error,
    /// once `events` has no receiver.
    pub async fn stream(
        &self,
        request: &TextGenerationRequest,
        token: &str,
        events: &mpsc::UnboundedSender<TextStreamEvent>,
    ) -> RelayResult<usize> {
        if self.endpoint.is_empty() {
            return Err(RelayError::TextGeneration(
                "no text generation endpoint configured".to_string(),
            ));
        }

        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        let response = self
            .http
            .post(format!("{}/student/text_generation", self.endpoint))
            .query(&[
                ("simulation_group_id", text(&request.simulation_group_id)),
                ("session_id", text(&request.session_id)),
                ("patient_id", text(&request.patient_id)),
                ("session_name", text(&request.session_name)),
                ("stream", "true".to_string()),
            ])
            .header(AUTHORIZATION, token)
            .json(&json!({ "message_content": text(&request.message) }))
            .send()
            .await
            .map_err(|e| RelayError::TextGeneration(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::TextGeneration(format!("HTTP {}", status)));
        }

        let mut decoder = SseDecoder::default();
        let mut body = response.bytes_stream();
        let mut forwarded = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RelayError::TextGeneration(e.to_string()))?;
            for event in decoder.push(&chunk) {
                if events.send(TextStreamEvent(event)).is_err() {
                    return Ok(forwarded);
                }
                forwarded += 1;
            }
        }
        if let Some(event) = decoder.finish() {
            if events.send(TextStreamEvent(event)).is_ok() {
                forwarded += 1;
            }
        }

        debug!(events = forwarded, "Text generation stream finished");
        Ok(forwarded)
    }
}

/// Splits an SSE body into `data:` payloads.
///
/// Bytes are buffered until a full line is available, so neither a line nor
/// a multi-byte character split across chunks is lost.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            events.extend(parse_line(&line));
        }
        events
    }

    /// The trailing line of a body that does not end in a newline.
    fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let line = String::from_utf8_lossy(line);
    let data = line
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .strip_prefix("data: ")?;
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "Skipping unparseable chat event: {}", data);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(endpoint: &str) -> TextGenerationClient {
        let config = ChatConfig {
            text_generation_endpoint: endpoint.to_string(),
        };
        TextGenerationClient::new(&config, reqwest::Client::new())
    }

    fn request() -> TextGenerationRequest {
        TextGenerationRequest {
            simulation_group_id: Some("group-1".to_string()),
            session_id: Some("7".to_string()),
            patient_id: Some("p-3".to_string()),
            session_name: Some("Intake".to_string()),
            message: Some("How are you feeling?".to_string()),
            token: None,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TextStreamEvent>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(TextStreamEvent(event)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_streams_events_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"chunk\",\"content\":\"Not \"}\n\n",
            "data: oops\n\n",
            "data: {\"type\":\"chunk\",\"content\":\"great.\"}\n\n",
            "data: {\"type\":\"done\"}",
        );
        Mock::given(method("POST"))
            .and(path("/student/text_generation"))
            .and(query_param("simulation_group_id", "group-1"))
            .and(query_param("session_id", "7"))
            .and(query_param("patient_id", "p-3"))
            .and(query_param("session_name", "Intake"))
            .and(query_param("stream", "true"))
            .and(header("authorization", "chat-token"))
            .and(body_json(json!({"message_content": "How are you feeling?"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarded = client(&format!("{}/", server.uri()))
            .stream(&request(), "chat-token", &tx)
            .await
            .unwrap();

        assert_eq!(forwarded, 3);
        assert_eq!(
            drain(&mut rx),
            vec![
                json!({"type": "chunk", "content": "Not "}),
                json!({"type": "chunk", "content": "great."}),
                json!({"type": "done"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_http_failure_is_text_generation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = client(&server.uri()).stream(&request(), "t", &tx).await;

        assert!(matches!(result, Err(RelayError::TextGeneration(msg)) if msg.contains("500")));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = client("").stream(&request(), "t", &tx).await;
        assert!(matches!(result, Err(RelayError::TextGeneration(_))));
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"content\":\"caf\u{e9}\"}\n".as_bytes();
        // Split inside the two-byte 'é'
        let split = line.iter().position(|&b| b == 0xc3).unwrap() + 1;

        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec![json!({"content": "café"})]);
        assert!(decoder.push(b"data: [DONE]\n").is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_error_event_shape() {
        assert_eq!(
            TextStreamEvent::error("Failed to generate response").0,
            json!({"type": "error", "content": "Failed to generate response"})
        );
    }
}
