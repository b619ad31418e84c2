//! SessionMultiplexer: one per client WebSocket. Demultiplexes the
//! client's JSON event stream by `tag`, owns one [`ProviderSessionHandle`]
//! per tag, and translates [`SessionOutboundEvent`]s back into the wire
//! protocol.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use upstream::ProviderConfig;

use crate::chunk::{AudioFormat, Encoding};
use crate::config::Config;
use crate::provider_session::{ProviderSessionHandle, SessionOutboundEvent};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum ClientEvent {
    Ping { id: Option<u64> },
    Media { media: MediaWire },
    Start { start: StartWire },
}

#[derive(Debug, Deserialize)]
struct MediaWire {
    tag: String,
    payload: String,
    chunk: u32,
    timestamp: u32,
}

#[derive(Debug, Deserialize)]
struct StartWire {
    tag: String,
    #[serde(rename = "mediaFormat")]
    media_format: MediaFormatWire,
}

#[derive(Debug, Deserialize)]
struct MediaFormatWire {
    encoding: Encoding,
    #[serde(rename = "sampleRate")]
    sample_rate: Option<u32>,
}

/// Default format assumed when a `media` event arrives for a tag that never
/// received a `start` event first.
const LAZY_DEFAULT_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum OutboundEvent {
    Pong { id: Option<u64> },
    Media { media: OutboundMediaWire },
}

#[derive(Debug, Serialize)]
struct OutboundMediaWire {
    tag: String,
    chunk: u64,
    timestamp: u32,
    payload: String,
    #[serde(rename = "sequenceNumber")]
    sequence_number: u64,
}

#[derive(Debug, Serialize)]
struct TranscriptionResultWire {
    #[serde(rename = "type")]
    kind: &'static str,
    is_interim: bool,
    participant: ParticipantWire,
    transcript: Vec<TranscriptSegmentWire>,
    timestamp: u64,
    language: Option<String>,
}

#[derive(Debug, Serialize)]
struct ParticipantWire {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TranscriptSegmentWire {
    text: String,
}

/// Serializes one [`SessionOutboundEvent`] into a client-bound text frame.
/// `Closed`/`Error` don't have a wire representation of their own; the
/// caller (the WebSocket driver loop) acts on them directly instead of
/// forwarding a frame.
pub fn render_outbound(event: &SessionOutboundEvent, params: &DispatchParams) -> Option<String> {
    match event {
        SessionOutboundEvent::Audio { tag, chunk, timestamp, payload_b64, sequence_number } => {
            if !params.send_back {
                return None;
            }
            let wire = OutboundEvent::Media {
                media: OutboundMediaWire {
                    tag: tag.clone(),
                    chunk: *chunk,
                    timestamp: *timestamp,
                    payload: payload_b64.clone(),
                    sequence_number: *sequence_number,
                },
            };
            serde_json::to_string(&wire).ok()
        }
        SessionOutboundEvent::Transcript { tag: _, is_interim, text, language } => {
            if !params.transcribe {
                return None;
            }
            let wire = TranscriptionResultWire {
                kind: "transcription-result",
                is_interim: *is_interim,
                participant: ParticipantWire { id: None },
                transcript: vec![TranscriptSegmentWire { text: text.clone() }],
                timestamp: wall_clock_millis(),
                language: language.clone(),
            };
            serde_json::to_string(&wire).ok()
        }
        SessionOutboundEvent::Closed { .. } | SessionOutboundEvent::Error { .. } => None,
    }
}

fn wall_clock_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-connection dispatch parameters lifted from the `/ws` query string.
/// `session_id` and `use_dispatcher` are consumed by the edge before the
/// socket upgrades;
/// the multiplexer only needs the three that shape its own behavior.
#[derive(Debug, Clone)]
pub struct DispatchParams {
    pub default_encoding: Encoding,
    pub send_back: bool,
    pub transcribe: bool,
}

impl Default for DispatchParams {
    fn default() -> Self {
        Self { default_encoding: Encoding::Opus, send_back: true, transcribe: true }
    }
}

/// One client WebSocket's demultiplexer over its per-tag `ProviderSession`s.
pub struct SessionMultiplexer {
    sessions: HashMap<String, ProviderSessionHandle>,
    sequence_counter: Arc<AtomicU64>,
    config: Arc<Config>,
    outbound_tx: mpsc::UnboundedSender<SessionOutboundEvent>,
    params: DispatchParams,
}

impl SessionMultiplexer {
    /// `sequence_counter` is the process-global outbound sequence counter
    /// (spec.md §5): the caller passes in the one instance it owns for the
    /// worker process's whole lifetime, shared across every multiplexer
    /// this process ever spawns, rather than each multiplexer starting its
    /// own count at zero.
    pub fn new(
        config: Arc<Config>,
        sequence_counter: Arc<AtomicU64>,
        outbound_tx: mpsc::UnboundedSender<SessionOutboundEvent>,
        params: DispatchParams,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            sequence_counter,
            config,
            outbound_tx,
            params,
        }
    }

    fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            url: self.config.provider_url.clone(),
            api_key: self.config.provider_api_key.clone(),
            input_sample_rate: self.config.provider_input_sample_rate,
            output_sample_rate: self.config.provider_output_sample_rate,
            force_commit_timeout_secs: self.config.force_commit_timeout_secs,
        }
    }

    fn spawn_session(&mut self, tag: String, media_format: AudioFormat) {
        let handle = ProviderSessionHandle::spawn(
            tag.clone(),
            media_format,
            self.config.translation_provider,
            self.provider_config(),
            self.sequence_counter.clone(),
            self.config.warmup_queue_cap,
            self.outbound_tx.clone(),
        );
        self.sessions.insert(tag, handle);
    }

    /// Handles one client text frame. Returns an immediate reply (only ever
    /// a `pong`) when one is called for; asynchronous effects (audio,
    /// transcripts) arrive later on the outbound channel instead.
    pub fn handle_text(&mut self, raw: &str) -> Option<String> {
        let event: ClientEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed client message ignored: {e:#}");
                return None;
            }
        };

        match event {
            ClientEvent::Ping { id } => {
                serde_json::to_string(&OutboundEvent::Pong { id }).ok()
            }
            ClientEvent::Start { start } => {
                let sample_rate = start.media_format.sample_rate.unwrap_or(LAZY_DEFAULT_SAMPLE_RATE);
                let format = AudioFormat { encoding: start.media_format.encoding, sample_rate };
                debug!("tag {}: start, format={:?}", start.tag, format);
                self.spawn_session(start.tag, format);
                None
            }
            ClientEvent::Media { media } => {
                if !self.sessions.contains_key(&media.tag) {
                    warn!("tag {}: media before start, lazily creating with default format", media.tag);
                    self.spawn_session(
                        media.tag.clone(),
                        AudioFormat { encoding: self.params.default_encoding, sample_rate: LAZY_DEFAULT_SAMPLE_RATE },
                    );
                }
                if let Some(handle) = self.sessions.get(&media.tag) {
                    handle.handle_media(media.tag, media.payload, media.chunk, media.timestamp);
                }
                None
            }
        }
    }

    pub fn params(&self) -> &DispatchParams {
        &self.params
    }

    /// Closes every tag's session and forgets them. Called on client socket
    /// close.
    pub fn close_all(&mut self) {
        for (tag, handle) in self.sessions.drain() {
            debug!("closing session for tag {tag}");
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_is_answered_with_pong_preserving_id() {
        let config = Arc::new(Config {
            routing_mode: crate::dispatch::RoutingMode::Session,
            container_pool_size: 5,
            max_connections_per_container: 10,
            min_containers: 2,
            scale_down_idle_time_ms: 600_000,
            translation_provider: upstream::ProviderKind::Openai,
            force_commit_timeout_secs: 2,
            provider_api_key: "test".to_string(),
            provider_url: "wss://example.invalid".to_string(),
            provider_input_sample_rate: 24000,
            provider_output_sample_rate: 24000,
            listen_addr: std::net::SocketAddr::from(([0, 0, 0, 0], 0)),
            warmup_queue_cap: None,
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let sequence_counter = Arc::new(AtomicU64::new(0));
        let mut mux = SessionMultiplexer::new(config, sequence_counter, tx, DispatchParams::default());
        let reply = mux.handle_text(r#"{"event":"ping","id":42}"#).unwrap();
        assert_eq!(reply, r#"{"event":"pong","id":42}"#);
    }

    #[test]
    fn malformed_message_is_ignored() {
        let config = Arc::new(Config {
            routing_mode: crate::dispatch::RoutingMode::Session,
            container_pool_size: 5,
            max_connections_per_container: 10,
            min_containers: 2,
            scale_down_idle_time_ms: 600_000,
            translation_provider: upstream::ProviderKind::Openai,
            force_commit_timeout_secs: 2,
            provider_api_key: "test".to_string(),
            provider_url: "wss://example.invalid".to_string(),
            provider_input_sample_rate: 24000,
            provider_output_sample_rate: 24000,
            listen_addr: std::net::SocketAddr::from(([0, 0, 0, 0], 0)),
            warmup_queue_cap: None,
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let sequence_counter = Arc::new(AtomicU64::new(0));
        let mut mux = SessionMultiplexer::new(config, sequence_counter, tx, DispatchParams::default());
        assert!(mux.handle_text("not json").is_none());
    }

    #[test]
    fn render_outbound_audio_matches_wire_shape() {
        let event = SessionOutboundEvent::Audio {
            tag: "t1".to_string(),
            chunk: 3,
            timestamp: 1920,
            payload_b64: "QUJD".to_string(),
            sequence_number: 7,
        };
        let rendered = render_outbound(&event, &DispatchParams::default()).unwrap();
        assert!(rendered.contains("\"event\":\"media\""));
        assert!(rendered.contains("\"sequenceNumber\":7"));
    }
}
