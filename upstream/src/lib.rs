//! # Upstream provider client
//!
//! This crate provides a small Rust client for speech-AI providers exposed
//! over WebSocket (realtime transcription/translation APIs).
//!
//! It is a narrow, provider-specific client hidden behind a small trait so
//! the rest of the proxy never has to know which concrete backend it is
//! talking to.
//!
//! ## Supported providers
//!
//! - [`openai`] — OpenAI-style realtime API (`session.update` /
//!   `input_audio_buffer.append` / `response.audio.delta`).
//! - [`gemini`] — Gemini-style Live API (`setup` / `realtimeInput` /
//!   `serverContent`).
//!
//! Both are driven through the provider-agnostic [`ProviderClient`] trait.

pub mod gemini;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which upstream speech-AI provider a session should talk to.
///
/// Corresponds to the `TRANSLATION_PROVIDER` configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Gemini,
}

impl ProviderKind {
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::Openai),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::Openai
    }
}

/// Connection parameters a `ProviderSession` hands to a freshly created client.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// WebSocket endpoint to connect to.
    pub url: String,
    /// API key / bearer token for the provider.
    pub api_key: String,
    /// Sample rate (Hz) the provider expects inbound PCM at.
    pub input_sample_rate: u32,
    /// Sample rate (Hz) the provider emits outbound PCM at.
    pub output_sample_rate: u32,
    /// Seconds of inactivity after which an in-progress turn is force-committed
    /// (`FORCE_COMMIT_TIMEOUT`).
    pub force_commit_timeout_secs: u64,
}

/// One event emitted by an upstream provider connection.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The provider has accepted the session-configuration message and is
    /// ready for realtime audio (`connection: setup_complete`).
    SetupComplete,
    /// A chunk of PCM16 audio, base64-encoded, at `ProviderConfig::output_sample_rate`.
    Audio {
        payload_b64: String,
        /// True when this is the first audio chunk of a new provider "response" —
        /// the caller should snap its outbound RTP clock to wall time.
        response_boundary: bool,
    },
    /// A (possibly interim) transcription/translation result.
    Transcript {
        text: String,
        is_interim: bool,
        language: Option<String>,
    },
    /// A non-fatal provider-reported error (decoding continues).
    ProviderError(String),
    /// The provider closed the connection or the socket errored.
    Closed,
}

/// Uniform contract over an upstream provider's realtime WebSocket session.
///
/// A `ProviderSession` owns exactly one `ProviderClient` for its lifetime;
/// the client is not shared across tags or sessions.
#[async_trait]
pub trait ProviderClient: Send {
    /// Opens the WebSocket connection and sends the initial session-setup message.
    async fn connect(config: ProviderConfig) -> Result<Self>
    where
        Self: Sized;

    /// Sends one chunk of base64 PCM16 audio to the provider.
    async fn send_audio(&mut self, pcm_b64: &str) -> Result<()>;

    /// Awaits the next event from the provider. Returns `Ok(None)` only after
    /// the connection has been cleanly closed by [`ProviderClient::close`].
    async fn recv(&mut self) -> Result<Option<ProviderEvent>>;

    /// Closes the underlying WebSocket. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Constructs a boxed provider client for the given kind.
///
/// This is the one place in the workspace that maps `ProviderKind` to a
/// concrete implementation; `ProviderSession` only ever sees `dyn ProviderClient`.
pub async fn connect(
    kind: ProviderKind,
    config: ProviderConfig,
) -> Result<Box<dyn ProviderClient>> {
    match kind {
        ProviderKind::Openai => Ok(Box::new(openai::OpenAiRealtimeClient::connect(config).await?)),
        ProviderKind::Gemini => Ok(Box::new(gemini::GeminiLiveClient::connect(config).await?)),
    }
}
