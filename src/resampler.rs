//! Linear-interpolation PCM16 mono resampling between whitelisted sample rates.
//!
//! `rubato`'s sinc interpolator is built around fixed-size, multi-call
//! streaming buffers, a poor fit for this module's one-shot
//! `resample(pcm, sr_in, sr_out)` contract over an arbitrary-length buffer
//! with no resampler object persisting between calls. This module
//! implements the linear-interpolation formula directly instead; see
//! DESIGN.md for the dependency trade-off.

use crate::chunk::is_whitelisted_sample_rate;
use crate::codec::le_bytes_to_i16;

/// Resamples mono PCM16 (little-endian bytes) from `sr_in` to `sr_out` using
/// linear interpolation. Returns the input unchanged (no copy) when the
/// rates match.
pub fn resample(pcm16: &[u8], sr_in: u32, sr_out: u32) -> Vec<u8> {
    if sr_in == sr_out {
        return pcm16.to_vec();
    }

    let input = le_bytes_to_i16(pcm16);
    if input.is_empty() {
        return Vec::new();
    }

    let ratio = sr_out as f64 / sr_in as f64;
    let out_len = ((input.len() as f64) * ratio).round() as usize;
    let mut output = Vec::with_capacity(out_len * 2);

    for i in 0..out_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;

        let s0 = input[idx.min(input.len() - 1)] as f64;
        let s1 = input[(idx + 1).min(input.len() - 1)] as f64;
        let interpolated = s0 + (s1 - s0) * frac;
        let sample = interpolated.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        output.extend_from_slice(&sample.to_le_bytes());
    }

    output
}

/// Validates that both rates are in the whitelist; used at decoder
/// construction time (e.g. `L16Decoder::new`).
pub fn validate_rate_pair(sr_in: u32, sr_out: u32) -> anyhow::Result<()> {
    if !is_whitelisted_sample_rate(sr_in) {
        anyhow::bail!("unsupported input sample rate: {sr_in}");
    }
    if !is_whitelisted_sample_rate(sr_out) {
        anyhow::bail!("unsupported output sample rate: {sr_out}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn identity_when_rates_match() {
        let input = pcm16_bytes(&[1, 2, 3, -4]);
        let output = resample(&input, 16000, 16000);
        assert_eq!(input, output);
    }

    #[test]
    fn upsampling_doubles_sample_count_for_2x_ratio() {
        let input = pcm16_bytes(&[0, 1000, 2000, 3000]);
        let output = resample(&input, 8000, 16000);
        assert_eq!(output.len() / 2, 8);
    }

    #[test]
    fn downsampling_preserves_endpoint_values_roughly() {
        let input = pcm16_bytes(&[1000; 48]);
        let output = resample(&input, 48000, 8000);
        let samples = le_bytes_to_i16(&output);
        assert!(samples.iter().all(|&s| (s - 1000).abs() < 5));
    }
}
