//! # Tutor Voice Relay
//!
//! Relays a browser's voice-tutoring session to a local voice subprocess.
//!
//! ## Architecture:
//! - **websocket**: one actor per browser connection, the relay itself
//! - **session**: per-connection lifecycle (idle, starting, ready, streaming)
//! - **voice**: subprocess spawning, stdio line protocol and output routing
//! - **auth**: bearer-token verification and temporary credential exchange
//! - **chat**: streamed text chat replies from the text-generation service
//! - **playback**: client-side PCM decoding and jitter-buffer scheduling
//! - **config** / **state** / **health** / **middleware** / **handlers**:
//!   the HTTP service around the relay

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod state;
pub mod voice;
pub mod websocket;
