//! The uniform `AudioDecoder` contract and its three variants: `PassThrough`,
//! `L16`, `Opus`. Each variant composes the same [`crate::gap::GapTracker`]
//! rather than re-implementing gap detection (a tagged variant, trait
//! objects, rather than an inheritance hierarchy).

use tracing::{debug, warn};

use crate::chunk::{is_whitelisted_sample_rate, DecodedAudio, RTP_CLOCK_HZ};
use crate::codec::Codec;
use crate::gap::{GapOutcome, GapTracker};
use crate::resampler;

/// Result of one `decode_chunk` call.
pub enum DecodeOutcome {
    Frames(Vec<DecodedAudio>),
    /// `NULL_DISCARD`: out-of-order/replayed chunk.
    Discard,
}

/// Shared contract implemented by all three decoder variants.
pub trait AudioDecoder: Send {
    /// Readiness signal for asynchronous initialization (Opus WASM load in
    /// the browser/Node original; in this native build, codec init happens
    /// synchronously inside the constructor, so this is always `true` once
    /// a value exists, kept for contract parity with the other language
    /// runtimes this proxy also ships clients for).
    fn is_ready(&self) -> bool {
        true
    }

    fn decode_chunk(&mut self, frame: &[u8], chunk_no: u32, timestamp: u32) -> DecodeOutcome;

    /// Clears sequence tracking; called on upstream reconnect.
    fn reset(&mut self);

    /// Releases any codec resources. Idempotent.
    fn free(&mut self);
}

/// Forwards frames unmodified; used when the provider accepts the client's
/// wire encoding directly and no decode/resample is needed.
pub struct PassThroughDecoder {
    gap: GapTracker,
}

impl PassThroughDecoder {
    pub fn new() -> Self {
        Self {
            gap: GapTracker::new(),
        }
    }
}

impl Default for PassThroughDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoder for PassThroughDecoder {
    fn decode_chunk(&mut self, frame: &[u8], chunk_no: u32, _timestamp: u32) -> DecodeOutcome {
        match self.gap.observe(chunk_no) {
            GapOutcome::Discard => DecodeOutcome::Discard,
            GapOutcome::Accept { .. } => {
                DecodeOutcome::Frames(vec![DecodedAudio::normal(frame.to_vec(), frame.len())])
            }
        }
    }

    fn reset(&mut self) {
        self.gap.reset();
    }

    fn free(&mut self) {}
}

/// Decodes nothing (the wire format already is linear PCM16); resamples
/// `sr_in -> sr_out` if they differ.
pub struct L16Decoder {
    gap: GapTracker,
    sr_in: u32,
    sr_out: u32,
}

impl L16Decoder {
    pub fn new(sr_in: u32, sr_out: u32) -> anyhow::Result<Self> {
        resampler::validate_rate_pair(sr_in, sr_out)?;
        Ok(Self {
            gap: GapTracker::new(),
            sr_in,
            sr_out,
        })
    }
}

impl AudioDecoder for L16Decoder {
    fn decode_chunk(&mut self, frame: &[u8], chunk_no: u32, _timestamp: u32) -> DecodeOutcome {
        match self.gap.observe(chunk_no) {
            GapOutcome::Discard => DecodeOutcome::Discard,
            GapOutcome::Accept { .. } => {
                let pcm = resampler::resample(frame, self.sr_in, self.sr_out);
                let samples = pcm.len() / 2;
                DecodeOutcome::Frames(vec![DecodedAudio::normal(pcm, samples)])
            }
        }
    }

    fn reset(&mut self) {
        self.gap.reset();
    }

    fn free(&mut self) {}
}

/// Full Opus decode path: gap detection, PLC/FEC concealment bounded by
/// both the sequence gap and the RTP timestamp gap, then real decode.
pub struct OpusAudioDecoder {
    codec: Codec,
    gap: GapTracker,
    output_sample_rate: u32,
    last_frame_samples: Option<usize>,
    last_timestamp: Option<u32>,
}

impl OpusAudioDecoder {
    pub fn new(output_sample_rate: u32) -> anyhow::Result<Self> {
        if !is_whitelisted_sample_rate(output_sample_rate) {
            anyhow::bail!("unsupported Opus output sample rate: {output_sample_rate}");
        }
        Ok(Self {
            codec: Codec::new_decoder(output_sample_rate)?,
            gap: GapTracker::new(),
            output_sample_rate,
            last_frame_samples: None,
            last_timestamp: None,
        })
    }

    /// `(timestamp - lastTimestamp) / 48000 * outputSampleRate`, or `None`
    /// (treated as +infinity, i.e. no clamp from this side) when timestamps
    /// are unavailable or non-monotonic.
    fn timestamp_delta_samples(&self, timestamp: u32) -> Option<usize> {
        let last = self.last_timestamp?;
        let delta_48k = timestamp.checked_sub(last)? as u64;
        Some((delta_48k * self.output_sample_rate as u64 / RTP_CLOCK_HZ as u64) as usize)
    }
}

impl AudioDecoder for OpusAudioDecoder {
    fn decode_chunk(&mut self, frame: &[u8], chunk_no: u32, timestamp: u32) -> DecodeOutcome {
        let outcome = match self.gap.observe(chunk_no) {
            GapOutcome::Discard => return DecodeOutcome::Discard,
            GapOutcome::Accept { lost_frames } => lost_frames,
        };

        let mut results = Vec::new();

        if outcome > 0 {
            if let Some(last_frame_samples) = self.last_frame_samples {
                let lost_in_samples = outcome as usize * last_frame_samples;
                let max_conceal = self.output_sample_rate as usize * 120 / 1000;
                let samples_to_conceal = match self.timestamp_delta_samples(timestamp) {
                    Some(ts_delta) => lost_in_samples.min(ts_delta).min(max_conceal),
                    None => lost_in_samples.min(max_conceal),
                };

                debug!(
                    lost_frames = outcome,
                    samples_to_conceal, "opus: concealing gap before chunk {chunk_no}"
                );

                let conceal = self.codec.conceal(Some(frame), samples_to_conceal);
                if !conceal.errors.is_empty() {
                    warn!("opus: concealment failed for chunk {chunk_no}");
                }
                if conceal.samples_decoded > 0 {
                    results.push(
                        DecodedAudio::concealment(conceal.pcm, conceal.samples_decoded)
                            .with_errors(conceal.errors),
                    );
                }
            } else {
                warn!("opus: gap of {outcome} before first successful decode, cannot conceal");
            }
        }

        let decoded = self.codec.decode_frame(frame);
        if decoded.errors.is_empty() {
            self.last_frame_samples = Some(decoded.samples_decoded);
        } else {
            warn!("opus: decode failure for chunk {chunk_no}");
        }
        results.push(DecodedAudio::normal(decoded.pcm, decoded.samples_decoded).with_errors(decoded.errors));

        if timestamp != crate::chunk::NO_CHUNK_INFO {
            self.last_timestamp = Some(timestamp);
        }

        DecodeOutcome::Frames(results)
    }

    fn reset(&mut self) {
        self.gap.reset();
        self.last_frame_samples = None;
        self.last_timestamp = None;
        self.codec.reset();
    }

    fn free(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DecodedKind;

    fn silent_opus_frame(encoder: &mut crate::codec::OpusCodecEncoder) -> Vec<u8> {
        let pcm = vec![0i16; 960];
        encoder.encode_frame(&pcm).unwrap()
    }

    #[test]
    fn single_frame_loss_yields_concealment_then_normal() {
        let mut encoder = crate::codec::OpusCodecEncoder::new(
            48000,
            crate::codec::EncoderConfig::default(),
        )
        .unwrap();
        let mut decoder = OpusAudioDecoder::new(48000).unwrap();

        // Prime lastFrameSamples with an initial normal decode.
        let frame = silent_opus_frame(&mut encoder);
        match decoder.decode_chunk(&frame, 1, 0) {
            DecodeOutcome::Frames(frames) => assert_eq!(frames.len(), 1),
            DecodeOutcome::Discard => panic!("unexpected discard"),
        }

        // Chunk 2 lost; chunk 3 arrives next (gap of 1).
        let frame3 = silent_opus_frame(&mut encoder);
        match decoder.decode_chunk(&frame3, 3, 1920) {
            DecodeOutcome::Frames(frames) => {
                assert_eq!(frames.len(), 2);
                assert_eq!(frames[0].kind, DecodedKind::Concealment);
                assert_eq!(frames[1].kind, DecodedKind::Normal);
                let max_120ms_samples = 48000 * 120 / 1000;
                assert!(frames[0].samples_decoded <= max_120ms_samples);
            }
            DecodeOutcome::Discard => panic!("unexpected discard"),
        }
    }

    #[test]
    fn replaying_same_chunk_discards() {
        let mut encoder = crate::codec::OpusCodecEncoder::new(
            48000,
            crate::codec::EncoderConfig::default(),
        )
        .unwrap();
        let mut decoder = OpusAudioDecoder::new(48000).unwrap();
        let frame = silent_opus_frame(&mut encoder);
        decoder.decode_chunk(&frame, 1, 0);
        decoder.decode_chunk(&frame, 2, 960);
        let frame_dup = silent_opus_frame(&mut encoder);
        assert!(matches!(
            decoder.decode_chunk(&frame_dup, 2, 960),
            DecodeOutcome::Discard
        ));
    }

    #[test]
    fn l16_round_trips_identical_rates() {
        let mut decoder = L16Decoder::new(16000, 16000).unwrap();
        let pcm: Vec<u8> = (0..320u8).collect();
        match decoder.decode_chunk(&pcm, 1, 0) {
            DecodeOutcome::Frames(frames) => assert_eq!(frames[0].pcm, pcm),
            DecodeOutcome::Discard => panic!("unexpected discard"),
        }
    }

    #[test]
    fn l16_rejects_unlisted_sample_rate_at_construction() {
        assert!(L16Decoder::new(44100, 16000).is_err());
    }
}
