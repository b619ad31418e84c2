//! Wire-facing and internal data model shared across the media pipeline.

use serde::{Deserialize, Serialize};

/// Sentinel marking "chunk-tracking info unavailable" for `chunkNo`/`timestamp`.
pub const NO_CHUNK_INFO: u32 = u32::MAX;

/// RTP-style clock rate the `timestamp` field is always expressed in,
/// regardless of the negotiated Opus output sample rate.
pub const RTP_CLOCK_HZ: u32 = 48_000;

/// 20 ms at the RTP clock rate: the per-frame timestamp step on the
/// outbound path.
pub const RTP_TIMESTAMP_STEP: u32 = 960;

/// A transport-layer unit carrying one encoded audio frame plus its
/// sequence/timestamp tracking info.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub payload: Vec<u8>,
    pub chunk_no: u32,
    pub timestamp: u32,
}

impl Chunk {
    pub fn has_tracking_info(&self) -> bool {
        self.chunk_no != NO_CHUNK_INFO && self.timestamp != NO_CHUNK_INFO
    }
}

/// Distinguishes real-decode output from PLC/FEC concealment output, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedKind {
    Normal,
    Concealment,
}

/// One kind of decode-time error, recorded rather than propagated: decode
/// errors are local to a frame and observed only in metrics/logs.
#[derive(Debug, Clone)]
pub enum DecodeErrorKind {
    /// The native Opus decoder returned a negative status code.
    OpusDecodeFailure {
        frame_no: u64,
        cumulative_input_bytes: u64,
        cumulative_output_samples: u64,
    },
    /// FEC/PLC concealment failed; concealment output for this gap is skipped.
    ConcealFailure { frame_no: u64 },
}

/// The output of one `AudioDecoder::decode_chunk` call (or one element of
/// the list it returns).
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub pcm: Vec<u8>,
    pub samples_decoded: usize,
    pub errors: Vec<DecodeErrorKind>,
    pub kind: DecodedKind,
}

impl DecodedAudio {
    pub fn normal(pcm: Vec<u8>, samples_decoded: usize) -> Self {
        Self {
            pcm,
            samples_decoded,
            errors: Vec::new(),
            kind: DecodedKind::Normal,
        }
    }

    pub fn concealment(pcm: Vec<u8>, samples_decoded: usize) -> Self {
        Self {
            pcm,
            samples_decoded,
            errors: Vec::new(),
            kind: DecodedKind::Concealment,
        }
    }

    pub fn with_errors(mut self, errors: Vec<DecodeErrorKind>) -> Self {
        self.errors = errors;
        self
    }
}

/// Sample rates a decoder/encoder/resampler is allowed to operate at.
pub const SAMPLE_RATE_WHITELIST: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

pub fn is_whitelisted_sample_rate(rate: u32) -> bool {
    SAMPLE_RATE_WHITELIST.contains(&rate)
}

/// Transport encoding of one audio frame, as declared in the client's `start` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    Opus,
    OggOpus,
    L16,
}

/// `{ encoding, sampleRate, channels = 1 }` (the channel count is always 1
/// in this core path; multi-channel audio is out of scope).
#[derive(Debug, Clone, Copy)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub const CHANNELS: u16 = 1;
}
