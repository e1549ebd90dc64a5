//! # Voice Process Lifecycle
//!
//! Owns one child process per active voice session.
//!
//! ## Tasks per process:
//! - **writer**: drains an unbounded channel of framed lines into stdin
//! - **reader**: forwards every stdout line, in order, as [`ProcessOutput::Line`]
//! - **stderr**: logs every stderr line at warn level
//! - **supervisor**: waits for exit or a kill request, then reports
//!   [`ProcessOutput::Exited`] after the reader has drained stdout
//!
//! Dropping or terminating a [`VoiceProcess`] kills the child. Every output
//! item carries the process generation so that the owner can ignore output
//! from a process it has already replaced.

use actix::Message;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::auth::credentials::TemporaryCredentials;
use crate::config::VoiceConfig;
use crate::error::{RelayError, RelayResult};
use crate::protocol::StartRequest;
use crate::voice::protocol::ControlMessage;

/// How long the supervisor waits for stdout to drain after the child exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the voice process produced, tagged with its generation.
#[derive(Debug, Clone, PartialEq, Message)]
#[rtype(result = "()")]
pub enum ProcessOutput {
    Line { generation: u64, line: String },
    Exited { generation: u64, code: Option<i32> },
}

/// Command line used to launch the voice process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub fallback_command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl From<&VoiceConfig> for LaunchSpec {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            command: config.command.clone(),
            fallback_command: config.fallback_command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
        }
    }
}

/// Environment injected into the voice process, on top of the inherited one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessEnv {
    vars: Vec<(String, String)>,
}

impl ProcessEnv {
    /// Assemble the session environment.
    ///
    /// Absent request fields become empty strings, except `SESSION_ID`
    /// (`"default"`) and `USER_ID` (`"anonymous"`).
    pub fn build(
        request: &StartRequest,
        user_id: Option<&str>,
        credentials: &TemporaryCredentials,
        voice: &VoiceConfig,
        bearer_token: &str,
    ) -> Self {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        let llm_completion = if request.llm_completion.unwrap_or(false) {
            "true"
        } else {
            "false"
        };

        let vars = vec![
            (
                "SESSION_ID",
                request.session_id.clone().unwrap_or_else(|| "default".to_string()),
            ),
            ("VOICE_ID", text(&request.voice_id)),
            ("USER_ID", user_id.unwrap_or("anonymous").to_string()),
            ("AWS_ACCESS_KEY_ID", credentials.access_key_id.clone()),
            ("AWS_SECRET_ACCESS_KEY", credentials.secret_key.clone()),
            ("AWS_SESSION_TOKEN", credentials.session_token.clone()),
            ("SM_DB_CREDENTIALS", voice.db_credentials.clone()),
            ("RDS_PROXY_ENDPOINT", voice.proxy_endpoint.clone()),
            ("PATIENT_NAME", text(&request.patient_name)),
            ("PATIENT_PROMPT", text(&request.patient_prompt)),
            ("PATIENT_ID", text(&request.patient_id)),
            ("LLM_COMPLETION", llm_completion.to_string()),
            ("EXTRA_SYSTEM_PROMPT", text(&request.system_prompt)),
            ("APPSYNC_GRAPHQL_URL", voice.callback_url.clone()),
            ("COGNITO_TOKEN", bearer_token.to_string()),
        ];

        Self {
            vars: vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Handle to a running voice process.
pub struct VoiceProcess {
    generation: u64,
    pid: Option<u32>,
    command: String,
    stdin: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
}

impl VoiceProcess {
    /// Launch the voice process and start its I/O tasks.
    ///
    /// If the primary command does not exist, the fallback command is tried
    /// exactly once with the identical environment. Must be called from
    /// within a tokio runtime.
    pub fn spawn(
        launch: &LaunchSpec,
        env: &ProcessEnv,
        generation: u64,
        output: mpsc::UnboundedSender<ProcessOutput>,
    ) -> RelayResult<Self> {
        let (mut child, command) = match spawn_child(&launch.command, launch, env) {
            Ok(child) => (child, launch.command.clone()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(
                    command = %launch.command,
                    fallback = %launch.fallback_command,
                    "Voice command not found, retrying with fallback"
                );
                let child = spawn_child(&launch.fallback_command, launch, env).map_err(|e| {
                    RelayError::ProcessStart(format!(
                        "{} not found and fallback {} failed: {}",
                        launch.command, launch.fallback_command, e
                    ))
                })?;
                (child, launch.fallback_command.clone())
            }
            Err(err) => {
                return Err(RelayError::ProcessStart(format!(
                    "failed to spawn {}: {}",
                    launch.command, err
                )))
            }
        };

        let pid = child.id();
        info!(generation, pid = ?pid, command = %command, "Voice process spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::ProcessStart("stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::ProcessStart("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RelayError::ProcessStart("stderr was not captured".to_string()))?;

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_stdin(stdin, stdin_rx, generation));
        tokio::spawn(log_stderr(stderr, generation));
        let reader = tokio::spawn(read_stdout(stdout, output.clone(), generation));
        tokio::spawn(supervise(child, kill_rx, reader, output, generation));

        Ok(Self {
            generation,
            pid,
            command,
            stdin: stdin_tx,
            kill: Some(kill_tx),
        })
    }

    /// Queue one framed line for stdin. Returns whether it was accepted.
    ///
    /// Never fails loudly: a dead or closed input is logged and the message
    /// dropped.
    pub fn write(&self, message: &ControlMessage) -> bool {
        if !self.is_writable() {
            debug!(generation = self.generation, kind = message.kind(), "Voice process input closed, dropping");
            return false;
        }
        let line = match message.to_line() {
            Ok(line) => line,
            Err(err) => {
                warn!(generation = self.generation, error = %err, "Failed to frame control message");
                return false;
            }
        };
        self.stdin.send(line).is_ok()
    }

    pub fn is_alive(&self) -> bool {
        self.kill.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.is_alive() && !self.stdin.is_closed()
    }

    /// Signal the child to terminate. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            info!(generation = self.generation, pid = ?self.pid, "Terminating voice process");
            let _ = kill.send(());
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The command that was actually launched (primary or fallback).
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Handle over caller-provided channels, without a child behind it.
    #[cfg(test)]
    pub(crate) fn detached(
        generation: u64,
        stdin: mpsc::UnboundedSender<String>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            generation,
            pid: None,
            command: "detached".to_string(),
            stdin,
            kill: Some(kill),
        }
    }
}

impl Drop for VoiceProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_child(program: &str, launch: &LaunchSpec, env: &ProcessEnv) -> io::Result<Child> {
    let mut command = Command::new(program);
    command
        .args(&launch.args)
        .envs(env.iter())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &launch.working_dir {
        command.current_dir(dir);
    }
    command.spawn()
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    generation: u64,
) {
    while let Some(line) = lines.recv().await {
        let result = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(generation, error = %err, "Voice process stdin write failed");
            break;
        }
    }
}

async fn read_stdout<R>(stdout: R, output: mpsc::UnboundedSender<ProcessOutput>, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if line.trim().is_empty() {
                    continue;
                }
                let item = ProcessOutput::Line {
                    generation,
                    line: line.to_string(),
                };
                if output.send(item).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(generation, error = %err, "Voice process stdout read failed");
                break;
            }
        }
    }
}

async fn log_stderr<R>(stderr: R, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(generation, "voice stderr: {}", line.trim());
    }
}

async fn supervise(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    reader: tokio::task::JoinHandle<()>,
    output: mpsc::UnboundedSender<ProcessOutput>,
    generation: u64,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill and when the handle is dropped
        _ = kill => {
            if let Err(err) = child.start_kill() {
                warn!(generation, error = %err, "Failed to signal voice process");
            }
            child.wait().await
        }
    };

    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err() {
        warn!(generation, "Voice process stdout still open after exit");
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(generation, error = %err, "Failed to collect voice process exit status");
            None
        }
    };
    info!(generation, code = ?code, "Voice process exited");
    let _ = output.send(ProcessOutput::Exited { generation, code });
}
