//! ProviderSession: owns one tag's decoder, encoder, and upstream
//! provider connection.
//!
//! The pure state-transition logic lives in [`ProviderSessionCore`], which
//! is plain synchronous Rust and fully unit-testable without a Tokio
//! runtime: it never performs I/O itself, it only returns a list of
//! [`CoreAction`]s for the actor loop to carry out. The actor loop
//! (`run_session`, spawned by [`ProviderSessionHandle::spawn`]) is the thin
//! imperative shell: it owns the upstream `ProviderClient`, drives
//! `tokio::select!` over the command channel and the provider's event
//! stream, and executes whatever actions the core hands back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use upstream::{ProviderClient, ProviderConfig, ProviderEvent, ProviderKind};

use crate::audio_decoder::{AudioDecoder, DecodeOutcome, L16Decoder, OpusAudioDecoder, PassThroughDecoder};
use crate::audio_encoder::AudioEncoder;
use crate::chunk::{AudioFormat, Encoding, DecodedAudio, RTP_TIMESTAMP_STEP};
use crate::codec::EncoderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Pending,
    Connected,
    SetupComplete,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecState {
    Ready,
    Failed,
    Closed,
}

/// An effect the actor loop must carry out; the core never performs I/O.
#[derive(Debug)]
pub enum CoreAction {
    SendAudioToProvider(String),
    EmitOutboundAudio {
        chunk: u64,
        timestamp: u32,
        payload_b64: String,
        sequence_number: u64,
    },
    EmitTranscript {
        is_interim: bool,
        text: String,
        language: Option<String>,
    },
    CloseProviderSocket,
    NotifyClosed,
    NotifyError(String),
}

/// Outbound notification the multiplexer relays to the client socket.
#[derive(Debug, Clone)]
pub enum SessionOutboundEvent {
    Audio {
        tag: String,
        chunk: u64,
        timestamp: u32,
        payload_b64: String,
        sequence_number: u64,
    },
    Transcript {
        tag: String,
        is_interim: bool,
        text: String,
        language: Option<String>,
    },
    Closed {
        tag: String,
    },
    Error {
        tag: String,
        reason: String,
    },
}

/// Pure state machine for one tag's session. See module docs.
pub struct ProviderSessionCore {
    tag: String,
    connection_state: ConnectionState,
    encoder_state: CodecState,
    decoder: Option<Box<dyn AudioDecoder>>,
    encoder: Option<AudioEncoder>,
    pending_pcm_chunks: VecDeque<Vec<u8>>,
    chunk_counter: u64,
    timestamp_48k: u32,
    start_wall: Option<Instant>,
    first_outbound_frame_emitted: bool,
    awaiting_response_boundary: bool,
    sequence_counter: Arc<AtomicU64>,
    warmup_cap: Option<usize>,
    closed: bool,
}

fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| anyhow::anyhow!("invalid base64 payload: {e}"))
}

impl ProviderSessionCore {
    /// Constructs decoder + encoder. Decoder init failure is fatal (the
    /// caller must close the session immediately without ever entering the
    /// select loop); encoder init failure is recorded but not fatal.
    pub fn new(
        tag: String,
        media_format: AudioFormat,
        provider_config: &ProviderConfig,
        sequence_counter: Arc<AtomicU64>,
        warmup_cap: Option<usize>,
    ) -> anyhow::Result<Self> {
        let decoder: Box<dyn AudioDecoder> = match media_format.encoding {
            Encoding::Opus => Box::new(OpusAudioDecoder::new(provider_config.input_sample_rate)?),
            // Container-wrapped Opus is forwarded as-is; this proxy does not
            // unwrap Ogg pages, it only tracks sequence/replay on them.
            Encoding::OggOpus => Box::new(PassThroughDecoder::new()),
            Encoding::L16 => {
                Box::new(L16Decoder::new(media_format.sample_rate, provider_config.input_sample_rate)?)
            }
        };

        let (encoder, encoder_state) =
            match AudioEncoder::new(provider_config.output_sample_rate, EncoderConfig::default()) {
                Ok(enc) => (Some(enc), CodecState::Ready),
                Err(e) => {
                    warn!("tag {tag}: encoder init failed, outbound audio suppressed: {e:#}");
                    (None, CodecState::Failed)
                }
            };

        Ok(Self {
            tag,
            connection_state: ConnectionState::Pending,
            encoder_state,
            decoder: Some(decoder),
            encoder,
            // No queue for raw frames awaiting decoder readiness: decoder
            // construction above is synchronous, so `decoder` is always
            // `Some` by the time a caller can reach `on_media`.
            pending_pcm_chunks: VecDeque::new(),
            chunk_counter: 0,
            timestamp_48k: 0,
            start_wall: None,
            first_outbound_frame_emitted: false,
            awaiting_response_boundary: false,
            sequence_counter,
            warmup_cap,
            closed: false,
        })
    }

    fn push_capped(queue: &mut VecDeque<Vec<u8>>, item: Vec<u8>, cap: Option<usize>, what: &str) {
        queue.push_back(item);
        if let Some(cap) = cap {
            while queue.len() > cap {
                queue.pop_front();
                warn!("warmup queue '{what}' exceeded cap {cap}, dropped oldest entry");
            }
        }
    }

    /// `event_tag` is checked against `self.tag` even though the
    /// multiplexer already routes by tag (a defensive check kept in case
    /// that routing invariant is ever violated upstream).
    pub fn on_media(&mut self, event_tag: &str, payload_b64: &str, chunk_no: u32, timestamp: u32) -> Vec<CoreAction> {
        if event_tag != self.tag {
            warn!("tag mismatch: session {} received media for {}", self.tag, event_tag);
            return Vec::new();
        }

        let frame = match base64_decode(payload_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("tag {}: malformed media payload ignored: {e:#}", self.tag);
                return Vec::new();
            }
        };

        let Some(decoder) = self.decoder.as_mut() else {
            warn!("tag {}: media dropped, decoder not ready", self.tag);
            return Vec::new();
        };

        match decoder.decode_chunk(&frame, chunk_no, timestamp) {
            DecodeOutcome::Discard => {
                debug!("tag {}: discarded out-of-order/replayed chunk {chunk_no}", self.tag);
                Vec::new()
            }
            DecodeOutcome::Frames(frames) => {
                let mut actions = Vec::new();
                for decoded in frames {
                    actions.extend(self.send_or_enqueue(decoded));
                }
                actions
            }
        }
    }

    fn send_or_enqueue(&mut self, decoded: DecodedAudio) -> Vec<CoreAction> {
        match self.connection_state {
            ConnectionState::SetupComplete => {
                vec![CoreAction::SendAudioToProvider(base64_encode(&decoded.pcm))]
            }
            ConnectionState::Pending | ConnectionState::Connected => {
                Self::push_capped(&mut self.pending_pcm_chunks, decoded.pcm, self.warmup_cap, "pendingPCMChunks");
                Vec::new()
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                debug!("tag {}: dropping decoded PCM, connection inactive", self.tag);
                Vec::new()
            }
        }
    }

    /// `pending→connected` on upstream socket open.
    pub fn on_connection_opened(&mut self) {
        if self.connection_state == ConnectionState::Pending {
            self.connection_state = ConnectionState::Connected;
            info!("tag {}: upstream connected", self.tag);
        }
    }

    /// `connected→setup_complete` on provider setup-ack; flushes
    /// `pendingPCMChunks` in order.
    pub fn on_setup_complete(&mut self) -> Vec<CoreAction> {
        self.connection_state = ConnectionState::SetupComplete;
        info!("tag {}: upstream setup complete, flushing {} queued PCM chunks", self.tag, self.pending_pcm_chunks.len());
        self.pending_pcm_chunks
            .drain(..)
            .map(|pcm| CoreAction::SendAudioToProvider(base64_encode(&pcm)))
            .collect()
    }

    /// Inbound upstream audio: feed the encoder, stamp each emitted Opus
    /// frame with the session's outbound chunk/timestamp/sequence counters.
    pub fn on_provider_audio(&mut self, payload_b64: &str, response_boundary: bool, now: Instant) -> Vec<CoreAction> {
        if response_boundary {
            self.awaiting_response_boundary = true;
        }

        let Some(encoder) = self.encoder.as_mut() else {
            return Vec::new();
        };
        let packets = match encoder.encode_base64(payload_b64) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("tag {}: outbound opus encode failed: {e:#}", self.tag);
                return Vec::new();
            }
        };

        let mut actions = Vec::with_capacity(packets.len());
        for packet in packets {
            if !self.first_outbound_frame_emitted {
                self.start_wall = Some(now);
                self.timestamp_48k = 0;
                self.first_outbound_frame_emitted = true;
                self.awaiting_response_boundary = false;
            } else if self.awaiting_response_boundary {
                let elapsed_ms = now
                    .duration_since(self.start_wall.expect("start_wall set with first frame"))
                    .as_secs_f64()
                    * 1000.0;
                self.timestamp_48k = (elapsed_ms / 1000.0 * 48000.0).round() as u32;
                self.awaiting_response_boundary = false;
            }

            self.chunk_counter += 1;
            let sequence_number = self.sequence_counter.fetch_add(1, Ordering::SeqCst) + 1;
            actions.push(CoreAction::EmitOutboundAudio {
                chunk: self.chunk_counter,
                timestamp: self.timestamp_48k,
                payload_b64: base64_encode(&packet),
                sequence_number,
            });
            self.timestamp_48k = self.timestamp_48k.wrapping_add(RTP_TIMESTAMP_STEP);
        }
        actions
    }

    pub fn on_provider_transcript(&self, text: String, is_interim: bool, language: Option<String>) -> Vec<CoreAction> {
        vec![CoreAction::EmitTranscript { is_interim, text, language }]
    }

    /// Upstream-induced close (socket error or remote close): fires
    /// `onClosed(tag)` in addition to the usual teardown.
    pub fn on_upstream_closed(&mut self) -> Vec<CoreAction> {
        if self.closed {
            return Vec::new();
        }
        self.connection_state = ConnectionState::Failed;
        let mut actions = self.close_internal();
        actions.push(CoreAction::NotifyClosed);
        actions
    }

    /// Explicit close (client socket closed, or decoder init was fatal).
    /// Idempotent: a second call returns no actions.
    pub fn close(&mut self) -> Vec<CoreAction> {
        if self.closed {
            return Vec::new();
        }
        self.close_internal()
    }

    fn close_internal(&mut self) -> Vec<CoreAction> {
        let mut actions = Vec::new();
        if self.connection_state != ConnectionState::Closed {
            actions.push(CoreAction::CloseProviderSocket);
        }
        self.connection_state = ConnectionState::Closed;
        self.encoder_state = CodecState::Closed;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.free();
        }
        self.decoder = None;
        self.encoder = None;
        self.closed = true;
        actions
    }

    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter
    }
}

/// Handle the multiplexer holds for one tag's running session actor.
#[derive(Clone)]
pub struct ProviderSessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

enum SessionCommand {
    Media { tag: String, payload_b64: String, chunk_no: u32, timestamp: u32 },
    Close,
}

impl ProviderSessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        tag: String,
        media_format: AudioFormat,
        provider_kind: ProviderKind,
        provider_config: ProviderConfig,
        sequence_counter: Arc<AtomicU64>,
        warmup_cap: Option<usize>,
        outbound_tx: mpsc::UnboundedSender<SessionOutboundEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_session(
            tag,
            media_format,
            provider_kind,
            provider_config,
            sequence_counter,
            warmup_cap,
            cmd_rx,
            outbound_tx,
        ));
        Self { cmd_tx }
    }

    pub fn handle_media(&self, tag: String, payload_b64: String, chunk_no: u32, timestamp: u32) {
        let _ = self.cmd_tx.send(SessionCommand::Media { tag, payload_b64, chunk_no, timestamp });
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close);
    }
}

fn dispatch_action(tag: &str, action: CoreAction, outbound_tx: &mpsc::UnboundedSender<SessionOutboundEvent>) -> Option<String> {
    match action {
        CoreAction::SendAudioToProvider(pcm_b64) => Some(pcm_b64),
        CoreAction::EmitOutboundAudio { chunk, timestamp, payload_b64, sequence_number } => {
            let _ = outbound_tx.send(SessionOutboundEvent::Audio {
                tag: tag.to_string(),
                chunk,
                timestamp,
                payload_b64,
                sequence_number,
            });
            None
        }
        CoreAction::EmitTranscript { is_interim, text, language } => {
            let _ = outbound_tx.send(SessionOutboundEvent::Transcript {
                tag: tag.to_string(),
                is_interim,
                text,
                language,
            });
            None
        }
        CoreAction::CloseProviderSocket => None,
        CoreAction::NotifyClosed => {
            let _ = outbound_tx.send(SessionOutboundEvent::Closed { tag: tag.to_string() });
            None
        }
        CoreAction::NotifyError(reason) => {
            let _ = outbound_tx.send(SessionOutboundEvent::Error { tag: tag.to_string(), reason });
            None
        }
    }
}

async fn run_session(
    tag: String,
    media_format: AudioFormat,
    provider_kind: ProviderKind,
    provider_config: ProviderConfig,
    sequence_counter: Arc<AtomicU64>,
    warmup_cap: Option<usize>,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    outbound_tx: mpsc::UnboundedSender<SessionOutboundEvent>,
) {
    let mut core = match ProviderSessionCore::new(tag.clone(), media_format, &provider_config, sequence_counter, warmup_cap) {
        Ok(core) => core,
        Err(e) => {
            warn!("tag {tag}: decoder init failed, session will not start: {e:#}");
            let _ = outbound_tx.send(SessionOutboundEvent::Error { tag: tag.clone(), reason: e.to_string() });
            let _ = outbound_tx.send(SessionOutboundEvent::Closed { tag });
            return;
        }
    };

    let mut provider = match upstream::connect(provider_kind, provider_config).await {
        Ok(client) => {
            core.on_connection_opened();
            client
        }
        Err(e) => {
            warn!("tag {tag}: upstream connect failed: {e:#}");
            for action in core.on_upstream_closed() {
                if let Some(_pcm) = dispatch_action(&tag, action, &outbound_tx) {
                    // no provider to send to; dropped.
                }
            }
            return;
        }
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Media { tag: event_tag, payload_b64, chunk_no, timestamp }) => {
                        let actions = core.on_media(&event_tag, &payload_b64, chunk_no, timestamp);
                        if !send_actions(&tag, actions, &mut provider, &outbound_tx).await {
                            break;
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        let actions = core.close();
                        let _ = send_actions(&tag, actions, &mut provider, &outbound_tx).await;
                        let _ = provider.close().await;
                        break;
                    }
                }
            }
            event = provider.recv() => {
                match event {
                    Ok(Some(ProviderEvent::SetupComplete)) => {
                        let actions = core.on_setup_complete();
                        if !send_actions(&tag, actions, &mut provider, &outbound_tx).await {
                            break;
                        }
                    }
                    Ok(Some(ProviderEvent::Audio { payload_b64, response_boundary })) => {
                        let actions = core.on_provider_audio(&payload_b64, response_boundary, Instant::now());
                        if !send_actions(&tag, actions, &mut provider, &outbound_tx).await {
                            break;
                        }
                    }
                    Ok(Some(ProviderEvent::Transcript { text, is_interim, language })) => {
                        let actions = core.on_provider_transcript(text, is_interim, language);
                        let _ = send_actions(&tag, actions, &mut provider, &outbound_tx).await;
                    }
                    Ok(Some(ProviderEvent::ProviderError(reason))) => {
                        warn!("tag {tag}: provider reported error: {reason}");
                    }
                    Ok(Some(ProviderEvent::Closed)) | Ok(None) => {
                        let actions = core.on_upstream_closed();
                        let _ = send_actions(&tag, actions, &mut provider, &outbound_tx).await;
                        break;
                    }
                    Err(e) => {
                        warn!("tag {tag}: upstream socket error: {e:#}");
                        let actions = core.on_upstream_closed();
                        let _ = send_actions(&tag, actions, &mut provider, &outbound_tx).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Executes a batch of actions in order. Returns `false` if sending to the
/// provider failed (the caller should treat this as an upstream error and
/// tear the session down).
async fn send_actions(
    tag: &str,
    actions: Vec<CoreAction>,
    provider: &mut Box<dyn ProviderClient>,
    outbound_tx: &mpsc::UnboundedSender<SessionOutboundEvent>,
) -> bool {
    for action in actions {
        if let CoreAction::SendAudioToProvider(pcm_b64) = &action {
            if let Err(e) = provider.send_audio(pcm_b64).await {
                warn!("tag {tag}: failed to send audio upstream: {e:#}");
                return false;
            }
            continue;
        }
        if matches!(action, CoreAction::CloseProviderSocket) {
            let _ = provider.close().await;
            continue;
        }
        dispatch_action(tag, action, outbound_tx);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Encoding;

    fn test_provider_config() -> ProviderConfig {
        ProviderConfig {
            url: "wss://example.invalid".to_string(),
            api_key: "test".to_string(),
            input_sample_rate: 24000,
            output_sample_rate: 24000,
            force_commit_timeout_secs: 2,
        }
    }

    fn new_core(tag: &str) -> ProviderSessionCore {
        ProviderSessionCore::new(
            tag.to_string(),
            AudioFormat { encoding: Encoding::L16, sample_rate: 24000 },
            &test_provider_config(),
            Arc::new(AtomicU64::new(0)),
            None,
        )
        .unwrap()
    }

    #[test]
    fn close_is_idempotent() {
        let mut core = new_core("t1");
        core.on_connection_opened();
        let first = core.close();
        assert_eq!(first.len(), 1);
        let second = core.close();
        assert!(second.is_empty());
    }

    #[test]
    fn media_before_setup_complete_is_queued_then_flushed_in_order() {
        let mut core = new_core("t1");
        core.on_connection_opened();

        let frame = base64_encode(&[1, 2, 3, 4]);
        let actions = core.on_media("t1", &frame, 1, 0);
        assert!(actions.is_empty(), "should be queued, not sent yet");

        let flushed = core.on_setup_complete();
        assert_eq!(flushed.len(), 1);
        assert!(matches!(flushed[0], CoreAction::SendAudioToProvider(_)));
    }

    #[test]
    fn mismatched_tag_is_dropped_defensively() {
        let mut core = new_core("t1");
        core.on_connection_opened();
        let frame = base64_encode(&[1, 2, 3, 4]);
        let actions = core.on_media("other-tag", &frame, 1, 0);
        assert!(actions.is_empty());
    }

    #[test]
    fn outbound_chunk_counter_is_contiguous_from_one() {
        let mut core = new_core("t1");
        let silence_frame = vec![0u8; 960 * 2];
        let b64 = base64_encode(&silence_frame);
        let now = Instant::now();

        let first = core.on_provider_audio(&b64, false, now);
        assert_eq!(first.len(), 1);
        if let CoreAction::EmitOutboundAudio { chunk, timestamp, .. } = &first[0] {
            assert_eq!(*chunk, 1);
            assert_eq!(*timestamp, 0);
        } else {
            panic!("expected EmitOutboundAudio");
        }

        let second = core.on_provider_audio(&b64, false, now);
        if let CoreAction::EmitOutboundAudio { chunk, timestamp, .. } = &second[0] {
            assert_eq!(*chunk, 2);
            assert_eq!(*timestamp, 960);
        } else {
            panic!("expected EmitOutboundAudio");
        }
        assert_eq!(core.chunk_counter(), 2);
    }

    #[test]
    fn sequence_number_is_process_global_and_monotone_across_sessions() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut core_a = ProviderSessionCore::new(
            "a".into(),
            AudioFormat { encoding: Encoding::L16, sample_rate: 24000 },
            &test_provider_config(),
            counter.clone(),
            None,
        )
        .unwrap();
        let mut core_b = ProviderSessionCore::new(
            "b".into(),
            AudioFormat { encoding: Encoding::L16, sample_rate: 24000 },
            &test_provider_config(),
            counter,
            None,
        )
        .unwrap();

        let silence = base64_encode(&vec![0u8; 960 * 2]);
        let now = Instant::now();
        let a1 = core_a.on_provider_audio(&silence, false, now);
        let b1 = core_b.on_provider_audio(&silence, false, now);
        let a2 = core_a.on_provider_audio(&silence, false, now);

        let seq = |actions: &[CoreAction]| match &actions[0] {
            CoreAction::EmitOutboundAudio { sequence_number, .. } => *sequence_number,
            _ => panic!("expected EmitOutboundAudio"),
        };
        let (s1, s2, s3) = (seq(&a1), seq(&b1), seq(&a2));
        assert!(s1 < s2 && s2 < s3);
    }
}
