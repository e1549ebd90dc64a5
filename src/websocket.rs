//! # WebSocket Relay Handler
//!
//! Bridges one browser connection to one voice subprocess at a time.
//! Clients connect to `/ws`; every frame is JSON (see `protocol.rs`).
//!
//! ## Connection lifecycle:
//! 1. **Upgrade**: the connection limit is checked; a bearer token in the
//!    `Authorization` header or `?token=` query is verified up front (HTTP 401
//!    on failure)
//! 2. **Authenticate**: without an upgrade token, the first frame must be
//!    `authenticate{token}`; anything else closes the connection
//! 3. **Start**: `start-nova-sonic` exchanges the token for temporary
//!    credentials and spawns the voice process
//! 4. **Relay**: `audio-input` / `text-input` / `end-audio` go to the process's
//!    stdin, its stdout is routed back as typed events
//! 5. **Chat**: `text-generation` is answered by the text-generation service,
//!    streamed back as `text-stream` events alongside the voice session
//! 6. **Stop**: `stop-nova-sonic` or closing the socket kills the process
//!
//! ## Ordering:
//! The actor's mailbox is the single ordered inbox for everything that
//! happens to a connection: client frames, process output and process exit.
//! Authentication and start run with `ctx.wait`, so frames that arrive while
//! they are pending are handled afterwards, in order.

use crate::auth::{self, Claims, TemporaryCredentials};
use crate::chat::TextStreamEvent;
use crate::config::AppConfig;
use crate::error::{AppError, RelayError, RelayResult};
use crate::protocol::{ClientMessage, ServerMessage, StartRequest, TextGenerationRequest};
use crate::session::ConnectionSession;
use crate::state::AppState;
use crate::voice::{self, LaunchSpec, ProcessEnv, ProcessOutput, VoiceProcess};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a ping is sent to the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long the client may stay silent before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest accepted frame. Microphone chunks arrive as base64 text.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// WebSocket actor for one relay connection.
pub struct RelayWebSocket {
    connection_id: Uuid,

    state: AppState,

    config: AppConfig,

    launch: LaunchSpec,

    /// `None` until the client has authenticated
    session: Option<ConnectionSession>,

    /// Whether the current process is counted in the voice-process gauge
    process_counted: bool,

    last_heartbeat: Instant,
}

impl RelayWebSocket {
    /// Create the actor, optionally with an identity verified at upgrade.
    pub fn new(state: AppState, authenticated: Option<(Claims, String)>) -> Self {
        let connection_id = Uuid::new_v4();
        let config = state.get_config();
        let launch = LaunchSpec::from(&config.voice);
        let session = authenticated
            .map(|(claims, token)| ConnectionSession::new(connection_id, claims, token));

        Self {
            connection_id,
            state,
            config,
            launch,
            session,
            process_counted: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                debug!(connection_id = %self.connection_id, event = message.event_name(), "Sending event");
                ctx.text(json);
            }
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "Failed to serialize event");
            }
        }
    }

    /// Tell the client why and close the connection.
    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>, reason: &str) {
        self.send(ctx, &ServerMessage::error(reason));
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: Some(reason.to_string()),
        }));
        ctx.stop();
    }

    fn release_process_slot(&mut self) {
        if self.process_counted {
            self.state.voice_process_ended();
            self.process_counted = false;
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                if self.session.is_none() {
                    self.reject(ctx, "Authentication required");
                } else {
                    self.reply_to_invalid(text, &err, ctx);
                }
                return;
            }
        };

        if self.session.is_none() {
            match message {
                ClientMessage::Authenticate { token } => self.authenticate(token, ctx),
                _ => self.reject(ctx, "Authentication required"),
            }
            return;
        }

        match message {
            ClientMessage::Authenticate { .. } => {
                debug!(connection_id = %self.connection_id, "Already authenticated, ignoring");
            }
            ClientMessage::StartNovaSonic(request) => self.start_voice_session(request, ctx),
            ClientMessage::AudioInput { data } => {
                if let Some(session) = self.session.as_mut() {
                    session.send_audio(data);
                }
            }
            ClientMessage::TextInput { text } => {
                if let Some(session) = self.session.as_mut() {
                    session.send_text(text);
                }
            }
            ClientMessage::TextGeneration(request) => self.generate_text(request, ctx),
            ClientMessage::EndAudio => {
                if let Some(session) = self.session.as_mut() {
                    session.end_audio();
                }
            }
            ClientMessage::StopNovaSonic => {
                info!(connection_id = %self.connection_id, "Stop requested by client");
                if let Some(session) = self.session.as_mut() {
                    session.stop();
                }
                self.release_process_slot();
            }
        }
    }

    /// Requests that always get an answer still get one when malformed.
    fn reply_to_invalid(&self, text: &str, err: &serde_json::Error, ctx: &mut ws::WebsocketContext<Self>) {
        let kind = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_string));
        warn!(
            connection_id = %self.connection_id,
            kind = kind.as_deref().unwrap_or("<none>"),
            error = %err,
            "Invalid client message"
        );

        match kind.as_deref() {
            Some("start-nova-sonic") => self.send(ctx, &ServerMessage::error("Invalid start request")),
            Some("text-generation") => self.send(
                ctx,
                &ServerMessage::TextStream {
                    data: TextStreamEvent::error("Failed to generate response").0,
                },
            ),
            _ => {}
        }
    }

    fn authenticate(&mut self, token: String, ctx: &mut ws::WebsocketContext<Self>) {
        let verifier = self.state.verifier.clone();
        let verification = async move {
            let claims = verifier.verify(&token).await?;
            Ok::<_, RelayError>((claims, token))
        };

        ctx.wait(verification.into_actor(self).map(|result, act, ctx| match result {
            Ok((claims, token)) => {
                info!(
                    connection_id = %act.connection_id,
                    user = %claims.email.as_deref().unwrap_or(&claims.sub),
                    "Client authenticated"
                );
                act.session = Some(ConnectionSession::new(act.connection_id, claims, token));
            }
            Err(err) => {
                warn!(connection_id = %act.connection_id, error = %err, "Authentication failed");
                act.reject(ctx, &err.client_message());
            }
        }));
    }

    /// Stream a chat reply without blocking the voice session.
    fn generate_text(&mut self, request: TextGenerationRequest, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let token = request
            .token
            .clone()
            .unwrap_or_else(|| session.token().to_string());
        let connection_id = self.connection_id;
        info!(%connection_id, session_id = ?request.session_id, "Text generation requested");

        let client = self.state.text_generation.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        ctx.add_message_stream(UnboundedReceiverStream::new(events_rx));

        let generation = async move {
            if let Err(err) = client.stream(&request, &token, &events_tx).await {
                warn!(%connection_id, error = %err, "Text generation failed");
                let _ = events_tx.send(TextStreamEvent::error(err.client_message()));
            }
        };
        ctx.spawn(generation.into_actor(self));
    }

    fn start_voice_session(&mut self, request: StartRequest, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let generation = session.begin_start();
        let token = session.token().to_string();
        self.release_process_slot();
        info!(connection_id = %self.connection_id, generation, "Starting voice session");

        let broker = self.state.broker.clone();
        let exchange = async move { broker.exchange(&token).await };

        ctx.wait(exchange.into_actor(self).map(move |credentials, act, ctx| {
            act.launch_process(generation, &request, credentials, ctx);
        }));
    }

    fn launch_process(
        &mut self,
        generation: u64,
        request: &StartRequest,
        credentials: RelayResult<TemporaryCredentials>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let spawned = credentials.and_then(|credentials| {
            let user_id = Some(session.user_id()).filter(|id| !id.is_empty());
            let env = ProcessEnv::build(
                request,
                user_id,
                &credentials,
                &self.config.voice,
                session.token(),
            );
            let (output_tx, output_rx) = mpsc::unbounded_channel();
            let process = VoiceProcess::spawn(&self.launch, &env, generation, output_tx)?;
            Ok((process, output_rx))
        });

        match spawned {
            Ok((process, output_rx)) => {
                ctx.add_message_stream(UnboundedReceiverStream::new(output_rx));
                let attached = self
                    .session
                    .as_mut()
                    .map(|session| session.attach(process))
                    .unwrap_or(false);
                if attached {
                    self.state.voice_process_started();
                    self.process_counted = true;
                }
            }
            Err(err) => {
                error!(connection_id = %self.connection_id, generation, error = %err, "Voice session failed to start");
                if let Some(session) = self.session.as_mut() {
                    session.start_failed(generation);
                }
                self.send(ctx, &ServerMessage::error(err.client_message()));
            }
        }
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            authenticated = self.session.is_some(),
            "WebSocket connection started"
        );

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection_id = %act.connection_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Closing the connection always terminates its voice process.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = self.session.as_mut() {
            session.stop();
        }
        self.release_process_slot();
        self.state.close_connection();
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                warn!(connection_id = %self.connection_id, "Binary frames are not part of the protocol, ignoring");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<ProcessOutput> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: ProcessOutput, ctx: &mut Self::Context) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match msg {
            ProcessOutput::Line { generation, line } => {
                if !session.is_current(generation) {
                    debug!(connection_id = %self.connection_id, generation, "Dropping output of a replaced process");
                    return;
                }
                let events = voice::route(&line, session);
                for event in &events {
                    self.send(ctx, event);
                }
            }
            ProcessOutput::Exited { generation, code } => {
                if !session.on_process_exit(generation) {
                    debug!(connection_id = %self.connection_id, generation, "Replaced process exited");
                    return;
                }
                self.release_process_slot();

                if code == Some(0) {
                    info!(connection_id = %self.connection_id, generation, "Voice process finished");
                } else {
                    let err = RelayError::ProcessRuntime(format!("exit code {:?}", code));
                    warn!(connection_id = %self.connection_id, generation, error = %err, "Voice process stopped");
                    self.send(ctx, &ServerMessage::error(err.client_message()));
                }
            }
        }
    }
}

impl Handler<TextStreamEvent> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: TextStreamEvent, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::TextStream { data: msg.0 });
    }
}

/// WebSocket endpoint handler.
///
/// Admission and upgrade-time authentication happen here, before the actor
/// exists, so rejected clients get a plain HTTP status.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    if !state.try_open_connection() {
        warn!("Connection limit reached, refusing WebSocket upgrade");
        return Err(AppError::ServiceUnavailable("Too many open connections".to_string()).into());
    }

    let authenticated = match auth::bearer_token(&req) {
        Some(token) => match state.verifier.verify(&token).await {
            Ok(claims) => Some((claims, token)),
            Err(err) => {
                state.close_connection();
                warn!(error = %err, "Upgrade token rejected");
                return Err(AppError::from(err).into());
            }
        },
        None => None,
    };

    let actor = RelayWebSocket::new(state.get_ref().clone(), authenticated);
    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()
        .inspect_err(|_| state.close_connection())
}
