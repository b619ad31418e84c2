//! Opus audio encoder: accumulates PCM into a byte buffer and slices off
//! fixed-duration frames as soon as enough samples have arrived.

use base64::Engine;
use tracing::warn;

use crate::codec::{le_bytes_to_i16, EncoderConfig, OpusCodecEncoder};

pub struct AudioEncoder {
    encoder: OpusCodecEncoder,
    /// Little-endian PCM16 accumulation buffer; the tail persists across
    /// calls (there is no explicit flush).
    buffer: Vec<u8>,
    frame_size_bytes: usize,
}

impl AudioEncoder {
    pub fn new(sample_rate: u32, config: EncoderConfig) -> anyhow::Result<Self> {
        let frame_samples = sample_rate as usize / 50; // 20ms
        Ok(Self {
            encoder: OpusCodecEncoder::new(sample_rate, config)?,
            buffer: Vec::new(),
            frame_size_bytes: frame_samples * 2,
        })
    }

    /// Appends raw PCM16 samples and emits every complete 20ms frame they
    /// complete.
    pub fn encode_samples(&mut self, pcm: &[i16]) -> anyhow::Result<Vec<Vec<u8>>> {
        for sample in pcm {
            self.buffer.extend_from_slice(&sample.to_le_bytes());
        }
        self.drain_complete_frames()
    }

    /// Appends base64-encoded PCM16 bytes and emits every complete frame.
    pub fn encode_base64(&mut self, pcm_b64: &str) -> anyhow::Result<Vec<Vec<u8>>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(pcm_b64)
            .map_err(|e| anyhow::anyhow!("invalid base64 PCM payload: {e}"))?;
        self.buffer.extend_from_slice(&bytes);
        self.drain_complete_frames()
    }

    fn drain_complete_frames(&mut self) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        while self.buffer.len() >= self.frame_size_bytes {
            let frame_bytes: Vec<u8> = self.buffer.drain(..self.frame_size_bytes).collect();
            let pcm = le_bytes_to_i16(&frame_bytes);
            match self.encoder.encode_frame(&pcm) {
                Ok(packet) => packets.push(packet),
                Err(e) => warn!("opus encode failed, dropping frame: {:#}", e),
            }
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frame_produces_no_output() {
        let mut encoder = AudioEncoder::new(48000, EncoderConfig::default()).unwrap();
        let half_frame = vec![0i16; 480];
        let packets = encoder.encode_samples(&half_frame).unwrap();
        assert!(packets.is_empty());
    }

    #[test]
    fn full_frame_produces_one_packet_and_keeps_remainder() {
        let mut encoder = AudioEncoder::new(48000, EncoderConfig::default()).unwrap();
        let one_and_a_half_frames = vec![0i16; 960 + 480];
        let packets = encoder.encode_samples(&one_and_a_half_frames).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(encoder.buffer.len(), 480 * 2);
    }

    #[test]
    fn base64_input_is_decoded_before_accumulation() {
        use base64::Engine;
        let mut encoder = AudioEncoder::new(48000, EncoderConfig::default()).unwrap();
        let pcm_bytes = vec![0u8; 960 * 2];
        let b64 = base64::engine::general_purpose::STANDARD.encode(&pcm_bytes);
        let packets = encoder.encode_base64(&b64).unwrap();
        assert_eq!(packets.len(), 1);
    }
}
