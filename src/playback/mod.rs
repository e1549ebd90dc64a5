//! # Client Audio Playback
//!
//! Audio handling that belongs to the listening side of a session:
//!
//! - **buffer**: decodes `audio-chunk` payloads (base64 PCM16 @ 24 kHz) into
//!   float samples, and encodes microphone frames the other way
//! - **scheduler**: the fixed-lookahead jitter buffer that decides when each
//!   decoded segment starts playing
//!
//! The relay itself never decodes audio; these types are used by clients
//! such as the `relay-probe` binary.

pub mod buffer;
pub mod scheduler;

pub use buffer::{encode_capture_frame, PlaybackBuffer};
pub use scheduler::PlaybackScheduler;
