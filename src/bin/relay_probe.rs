//! # Relay Probe
//!
//! Command-line client for exercising a running relay end to end.
//!
//! ```text
//! relay-probe <ws-url> --token <jwt> [--pcm <file>] [--seconds <n>]
//!             [--wav <out.wav>] [--session-id <id>] [--patient-id <id>]
//! ```
//!
//! Streams `--pcm` (raw 16-bit little-endian mono at 16 kHz) or `--seconds`
//! of silence as microphone input, then paces every returned audio chunk
//! through the playback scheduler and logs when it would start playing.

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tutor_voice_relay::config::{AppConfig, PlaybackConfig};
use tutor_voice_relay::playback::{encode_capture_frame, PlaybackBuffer, PlaybackScheduler};

/// Microphone capture rate of the browser client.
const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// 100 ms of capture audio per `audio-input` frame.
const CAPTURE_FRAME_SAMPLES: usize = 1_600;

/// Give up when the relay stays silent this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Stream microphone audio through a running relay and time the playback
#[derive(Debug, Parser)]
#[command(name = "relay-probe", version = env!("CARGO_PKG_VERSION"))]
struct ProbeArgs {
    /// Relay WebSocket URL, e.g. ws://localhost:3000/ws
    url: String,

    /// Access token sent in the authenticate message
    #[arg(long)]
    token: String,

    /// Raw PCM16 mono 16 kHz file to stream instead of silence
    #[arg(long)]
    pcm: Option<PathBuf>,

    /// Seconds of silence to stream when no PCM file is given
    #[arg(long, default_value_t = 3.0)]
    seconds: f64,

    /// Write the received audio to this WAV file
    #[arg(long)]
    wav: Option<PathBuf>,

    #[arg(long)]
    session_id: Option<String>,

    #[arg(long)]
    patient_id: Option<String>,
}

impl ProbeArgs {
    /// Capture samples to stream: the PCM file, or silence.
    fn capture(&self) -> Result<Vec<f32>> {
        match &self.pcm {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok(PlaybackBuffer::from_pcm16(&bytes, CAPTURE_SAMPLE_RATE)?.into_samples())
            }
            None => Ok(vec![0.0; (self.seconds * CAPTURE_SAMPLE_RATE as f64) as usize]),
        }
    }
}

/// Received audio, with the start time the scheduler gave each segment.
struct PlaybackLog {
    scheduler: PlaybackScheduler,
    sample_rate: u32,
    clock: Instant,
    samples: Vec<i16>,
    segments: usize,
}

impl PlaybackLog {
    fn new(config: &PlaybackConfig) -> Self {
        Self {
            scheduler: PlaybackScheduler::from_config(config),
            sample_rate: config.sample_rate,
            clock: Instant::now(),
            samples: Vec::new(),
            segments: 0,
        }
    }

    fn push(&mut self, data: &str) {
        let buffer = match PlaybackBuffer::from_base64(data, self.sample_rate) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(error = %err, "Skipping undecodable audio chunk");
                return;
            }
        };

        let now = self.clock.elapsed().as_secs_f64();
        let start = self.scheduler.schedule(now, buffer.duration_secs());
        self.segments += 1;
        info!(
            segment = self.segments,
            arrived = %format!("{:.3}", now),
            start = %format!("{:.3}", start),
            duration = %format!("{:.3}", buffer.duration_secs()),
            queued = %format!("{:.3}", self.scheduler.queued(now)),
            "Scheduled audio segment"
        );
        self.samples.extend(buffer.to_pcm16());
    }

    fn write_wav(&self, path: &Path) -> Result<()> {
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, self.sample_rate, 16);
        let mut file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        wav::write(header, &wav::BitDepth::Sixteen(self.samples.clone()), &mut file)?;
        info!(path = %path.display(), samples = self.samples.len(), "Wrote received audio");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_probe=info,tutor_voice_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    let args = ProbeArgs::parse();
    let playback = AppConfig::load()
        .map(|config| config.playback)
        .unwrap_or_default();
    let capture = args.capture()?;

    let (socket, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("connecting to {}", args.url))?;
    info!(url = %args.url, "Connected");
    let (mut sink, mut stream) = socket.split();

    let send = |value: Value| Message::Text(value.to_string());
    sink.send(send(json!({"type": "authenticate", "token": args.token})))
        .await?;
    sink.send(send(json!({
        "type": "start-nova-sonic",
        "session_id": args.session_id,
        "patient_id": args.patient_id,
    })))
    .await?;

    let mut log = PlaybackLog::new(&playback);
    let mut streaming = None;

    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                info!("Relay closed the connection");
                break;
            }
            Err(_) => {
                info!("No events for {:?}, finishing", IDLE_TIMEOUT);
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(reason) => {
                info!("Relay closed the connection: {:?}", reason);
                break;
            }
            _ => continue,
        };
        let event: Value = serde_json::from_str(&text).context("relay sent invalid JSON")?;

        match event["type"].as_str().unwrap_or_default() {
            "nova-started" => {
                info!("Session ready, streaming {} capture samples", capture.len());
                let frames: Vec<String> = capture
                    .chunks(CAPTURE_FRAME_SAMPLES)
                    .map(encode_capture_frame)
                    .collect();
                let mut input = futures_util::stream::iter(frames)
                    .map(|data| {
                        Ok::<_, tokio_tungstenite::tungstenite::Error>(send(json!({"type": "audio-input", "data": data})))
                    });
                // Sent in one burst; the relay does not pace microphone input
                sink.send_all(&mut input).await?;
                sink.send(send(json!({"type": "end-audio"}))).await?;
                streaming = Some(Instant::now());
            }
            "audio-chunk" => log.push(event["data"].as_str().unwrap_or_default()),
            "text-message" => info!("{}", event["text"].as_str().unwrap_or_default()),
            "empathy-feedback" | "empathy-data" => info!(event = %event, "Empathy feedback"),
            "diagnosis-complete" => {
                info!("{}", event["message"].as_str().unwrap_or_default());
                break;
            }
            "nova-error" => {
                warn!("Relay error: {}", event["error"].as_str().unwrap_or_default());
                break;
            }
            other => debug!("Ignoring event {}", other),
        }
    }

    if let Some(started) = streaming {
        info!(
            segments = log.segments,
            elapsed = %format!("{:.1}s", started.elapsed().as_secs_f64()),
            "Session finished"
        );
    }

    // The relay may already be gone; best effort
    let _ = sink.send(send(json!({"type": "stop-nova-sonic"}))).await;
    let _ = sink.close().await;

    if let Some(path) = &args.wav {
        log.write_wav(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<ProbeArgs, clap::Error> {
        ProbeArgs::try_parse_from(std::iter::once("relay-probe").chain(list.iter().copied()))
    }

    #[test]
    fn test_parse_flags() {
        let parsed = args(&[
            "--token",
            "t",
            "ws://localhost/ws",
            "--seconds",
            "1.5",
            "--wav",
            "out.wav",
            "--patient-id",
            "42",
        ])
        .unwrap();
        assert_eq!(parsed.url, "ws://localhost/ws");
        assert_eq!(parsed.token, "t");
        assert_eq!(parsed.seconds, 1.5);
        assert_eq!(parsed.wav, Some(PathBuf::from("out.wav")));
        assert_eq!(parsed.patient_id.as_deref(), Some("42"));
        assert_eq!(parsed.capture().unwrap().len(), 24_000);
    }

    #[test]
    fn test_default_capture_is_three_seconds_of_silence() {
        let parsed = args(&["ws://localhost/ws", "--token", "t"]).unwrap();
        assert_eq!(parsed.seconds, 3.0);
        assert!(parsed.pcm.is_none());
        assert_eq!(parsed.capture().unwrap().len(), 48_000);
    }

    #[test]
    fn test_parse_rejects_missing_token_and_unknown_flags() {
        use clap::error::ErrorKind;

        let missing = args(&["ws://localhost/ws"]).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::MissingRequiredArgument);

        let unknown = args(&["ws://localhost/ws", "--token", "t", "--verbose", "yes"]).unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::UnknownArgument);

        assert!(args(&["ws://localhost/ws", "--token"]).is_err());
        assert!(args(&["ws://localhost/ws", "--token", "t", "--seconds", "soon"]).is_err());
    }

    #[test]
    fn test_playback_log_collects_segments() {
        let mut log = PlaybackLog::new(&PlaybackConfig::default());
        // Four PCM16 samples
        log.push("AAABAAIAAwA=");
        log.push("not base64!");
        assert_eq!(log.segments, 1);
        assert_eq!(log.samples, vec![0, 1, 2, 3]);
    }
}
