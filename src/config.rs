//! Client configuration.
//!
//! The session is constructed with an explicit `ClientConfig`; there is no
//! ambient global state. `from_env` exists for development setups where the
//! backend address lives in a `.env` file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default backend address when nothing is configured.
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the dialogue backend, without a trailing slash.
    pub base_url: String,

    /// When enabled, start/turn requests use the SSE endpoints and audio is
    /// handed to the playback sink as it streams in. When disabled, the
    /// buffered endpoints are used and the reply plays as one WAV.
    pub streaming_enabled: bool,

    /// How many times a failed chunk upload is retried before the chunk is
    /// permanently dropped (which vetoes the whole turn).
    pub chunk_retry_limit: u32,

    /// Bound on each distinct wait phase (connect, header-wait) in
    /// milliseconds. The body drain of a stream is not bounded; the server
    /// closing the body is the authoritative end signal.
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            streaming_enabled: true,
            chunk_retry_limit: 2,
            request_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Reads `.env` first (development convenience). Recognized variables:
    /// `ATOM_VOICE_BASE_URL`, `ATOM_VOICE_STREAMING`,
    /// `ATOM_VOICE_CHUNK_RETRIES`, `ATOM_VOICE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Ok(url) = std::env::var("ATOM_VOICE_BASE_URL") {
            if !url.is_empty() {
                config.base_url = url;
            }
        }
        if let Ok(flag) = std::env::var("ATOM_VOICE_STREAMING") {
            config.streaming_enabled = matches!(flag.as_str(), "true" | "1" | "yes");
        }
        if let Ok(retries) = std::env::var("ATOM_VOICE_CHUNK_RETRIES") {
            match retries.parse() {
                Ok(n) => config.chunk_retry_limit = n,
                Err(_) => log::warn!("Ignoring non-numeric ATOM_VOICE_CHUNK_RETRIES={}", retries),
            }
        }
        if let Ok(ms) = std::env::var("ATOM_VOICE_TIMEOUT_MS") {
            match ms.parse() {
                Ok(n) => config.request_timeout_ms = n,
                Err(_) => log::warn!("Ignoring non-numeric ATOM_VOICE_TIMEOUT_MS={}", ms),
            }
        }
        config
    }

    /// Per-phase wait bound as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
