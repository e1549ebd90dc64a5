//! # Connection Session
//!
//! Per-connection aggregate: who is connected, the voice process they own
//! (at most one) and where that process is in its lifecycle.
//!
//! ## Phases:
//! ```text
//! Idle ──start──▶ Starting ──"ready" line──▶ Ready ──first audio──▶ Streaming
//!   ▲                │                         ▲                       │
//!   │                └──────────┐              └──────end-audio────────┘
//!   │                           ▼
//!   └────── new start ◀──── Stopped ◀──── stop / process exit (any phase)
//! ```
//!
//! The session is only ever touched from its connection actor, so no locking
//! is needed here.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::token::Claims;
use crate::voice::process::VoiceProcess;
use crate::voice::protocol::ControlMessage;

/// Lifecycle phase of the session's voice process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Authenticated, nothing started yet
    Idle,
    /// Credentials requested or process spawned, waiting for the ready phrase
    Starting,
    /// Process accepts input
    Ready,
    /// `start_audio` sent, audio segment in progress
    Streaming,
    /// Process stopped or exited; a new start is allowed
    Stopped,
}

pub struct ConnectionSession {
    connection_id: Uuid,
    claims: Claims,
    token: String,
    process: Option<VoiceProcess>,
    phase: SessionPhase,
    generation: u64,
}

impl ConnectionSession {
    pub fn new(connection_id: Uuid, claims: Claims, token: String) -> Self {
        Self {
            connection_id,
            claims,
            token,
            process: None,
            phase: SessionPhase::Idle,
            generation: 0,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.claims.sub
    }

    pub fn email(&self) -> Option<&str> {
        self.claims.email.as_deref()
    }

    /// Raw bearer token, needed for credential exchange and the child environment.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.phase, SessionPhase::Ready | SessionPhase::Streaming)
    }

    pub fn audio_started(&self) -> bool {
        self.phase == SessionPhase::Streaming
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Whether output tagged with `generation` belongs to the current process.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.process.is_some()
    }

    /// Tear down any existing process and enter `Starting`.
    ///
    /// Returns the generation the new process must be spawned with.
    pub fn begin_start(&mut self) -> u64 {
        self.stop();
        self.generation += 1;
        self.phase = SessionPhase::Starting;
        self.generation
    }

    /// Adopt a freshly spawned process.
    ///
    /// A process spawned for an older start attempt is terminated instead.
    pub fn attach(&mut self, process: VoiceProcess) -> bool {
        if process.generation() != self.generation || self.phase != SessionPhase::Starting {
            warn!(
                connection_id = %self.connection_id,
                generation = process.generation(),
                current = self.generation,
                "Discarding voice process from a superseded start"
            );
            drop(process);
            return false;
        }
        self.process = Some(process);
        true
    }

    /// Record a start attempt that never produced a process.
    pub fn start_failed(&mut self, generation: u64) {
        if generation == self.generation && self.process.is_none() {
            self.phase = SessionPhase::Stopped;
        }
    }

    /// Handle the readiness phrase. Returns `true` only on the transition,
    /// so the caller announces the session once.
    pub fn mark_ready(&mut self) -> bool {
        if self.phase == SessionPhase::Starting && self.process.is_some() {
            self.phase = SessionPhase::Ready;
            info!(connection_id = %self.connection_id, generation = self.generation, "Voice session ready");
            true
        } else {
            false
        }
    }

    /// Forward one microphone chunk, opening the audio segment first if needed.
    pub fn send_audio(&mut self, data: String) -> bool {
        let Some(process) = self.writable_process("audio") else {
            return false;
        };
        if self.phase == SessionPhase::Ready {
            if !process.write(&ControlMessage::StartAudio) {
                return false;
            }
            debug!(connection_id = %self.connection_id, "Sent start_audio");
            self.phase = SessionPhase::Streaming;
        }
        match &self.process {
            Some(process) => process.write(&ControlMessage::Audio { data }),
            None => false,
        }
    }

    pub fn send_text(&mut self, text: String) -> bool {
        match self.writable_process("text") {
            Some(process) => process.write(&ControlMessage::Text { data: text }),
            None => false,
        }
    }

    /// Close the current audio segment. A no-op unless one is open.
    pub fn end_audio(&mut self) -> bool {
        if self.phase != SessionPhase::Streaming {
            debug!(connection_id = %self.connection_id, "No audio segment open, ignoring end_audio");
            return false;
        }
        let sent = match self.writable_process("end_audio") {
            Some(process) => process.write(&ControlMessage::EndAudio),
            None => false,
        };
        if sent {
            self.phase = SessionPhase::Ready;
        }
        sent
    }

    /// Terminate the process if there is one. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
        if self.phase != SessionPhase::Idle {
            self.phase = SessionPhase::Stopped;
        }
    }

    /// Handle the exit of a process. Returns `false` for a superseded one.
    pub fn on_process_exit(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.process = None;
        self.phase = SessionPhase::Stopped;
        true
    }

    fn writable_process(&self, kind: &str) -> Option<&VoiceProcess> {
        match &self.process {
            Some(process) if self.is_ready() && process.is_writable() => Some(process),
            _ => {
                debug!(
                    connection_id = %self.connection_id,
                    kind,
                    phase = ?self.phase,
                    "Voice process not ready, dropping input"
                );
                None
            }
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot};

    struct Harness {
        stdin: mpsc::UnboundedReceiver<String>,
        kill: oneshot::Receiver<()>,
    }

    fn session() -> ConnectionSession {
        let claims = Claims {
            sub: "user-1".to_string(),
            email: Some("student@example.com".to_string()),
        };
        ConnectionSession::new(Uuid::new_v4(), claims, "token".to_string())
    }

    fn started(session: &mut ConnectionSession) -> (u64, Harness) {
        let generation = session.begin_start();
        let (stdin_tx, stdin) = mpsc::unbounded_channel();
        let (kill_tx, kill) = oneshot::channel();
        assert!(session.attach(VoiceProcess::detached(generation, stdin_tx, kill_tx)));
        (generation, Harness { stdin, kill })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line.trim_end().to_string());
        }
        lines
    }

    #[test]
    fn test_input_dropped_until_ready() {
        let mut session = session();
        assert!(!session.send_audio("AAAA".into()));

        let (_, mut harness) = started(&mut session);
        assert_eq!(session.phase(), SessionPhase::Starting);
        assert!(!session.send_text("hello".into()));
        assert!(drain(&mut harness.stdin).is_empty());

        assert!(session.mark_ready());
        assert!(!session.mark_ready(), "ready is announced once");
        assert!(session.send_text("hello".into()));
        assert_eq!(drain(&mut harness.stdin), vec![r#"{"type":"text","data":"hello"}"#]);
    }

    #[test]
    fn test_start_audio_sent_once_per_segment() {
        let mut session = session();
        let (_, mut harness) = started(&mut session);
        session.mark_ready();

        assert!(session.send_audio("AAAA".into()));
        assert!(session.send_audio("BBBB".into()));
        assert!(session.audio_started());
        assert!(session.end_audio());
        assert!(!session.end_audio(), "redundant end is a no-op");
        assert!(!session.audio_started());
        assert!(session.send_audio("CCCC".into()));

        assert_eq!(
            drain(&mut harness.stdin),
            vec![
                r#"{"type":"start_audio"}"#,
                r#"{"type":"audio","data":"AAAA"}"#,
                r#"{"type":"audio","data":"BBBB"}"#,
                r#"{"type":"end_audio"}"#,
                r#"{"type":"start_audio"}"#,
                r#"{"type":"audio","data":"CCCC"}"#,
            ]
        );
    }

    #[test]
    fn test_end_audio_without_segment_sends_nothing() {
        let mut session = session();
        let (_, mut harness) = started(&mut session);
        session.mark_ready();
        assert!(!session.end_audio());
        assert!(drain(&mut harness.stdin).is_empty());
    }

    #[test]
    fn test_stop_is_idempotent_and_kills() {
        let mut session = session();
        let (_, mut harness) = started(&mut session);
        session.mark_ready();

        session.stop();
        session.stop();
        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert!(!session.is_ready());
        assert!(!session.has_process());
        assert_eq!(harness.kill.try_recv(), Ok(()));
    }

    #[test]
    fn test_unexpected_exit_resets_and_allows_restart() {
        let mut session = session();
        let (first, _harness) = started(&mut session);
        session.mark_ready();
        session.send_audio("AAAA".into());

        assert!(session.on_process_exit(first));
        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert!(!session.is_ready());
        assert!(!session.audio_started());
        assert!(!session.send_text("late".into()));

        let (second, mut harness) = started(&mut session);
        assert_eq!(second, first + 1);
        assert!(!session.on_process_exit(first), "stale exit is ignored");
        assert!(session.has_process());
        session.mark_ready();
        assert!(session.send_text("again".into()));
        assert_eq!(drain(&mut harness.stdin).len(), 1);
    }

    #[test]
    fn test_new_start_terminates_previous_process() {
        let mut session = session();
        let (first, mut old) = started(&mut session);
        let (second, _new) = started(&mut session);

        assert_ne!(first, second);
        assert_eq!(old.kill.try_recv(), Ok(()));
        assert!(session.is_current(second));
        assert!(!session.is_current(first));
    }

    #[test]
    fn test_superseded_process_is_not_attached() {
        let mut session = session();
        let stale = session.begin_start();
        let current = session.begin_start();

        let (stdin_tx, _stdin) = mpsc::unbounded_channel();
        let (kill_tx, mut kill) = oneshot::channel();
        assert!(!session.attach(VoiceProcess::detached(stale, stdin_tx, kill_tx)));
        assert_eq!(kill.try_recv(), Ok(()));

        session.start_failed(current);
        assert_eq!(session.phase(), SessionPhase::Stopped);
    }
}
