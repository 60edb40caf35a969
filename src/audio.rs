//! Audio processing utilities
//!
//! Sample-rate conversion from the 16 kHz client rate to the 24 kHz rate
//! the STT endpoint expects, plus level metering and PCM conversions. The
//! resampler is a stateless polyphase windowed-sinc filter for the fixed
//! 3/2 ratio: every call over N input samples yields exactly ⌊3N/2⌋ output
//! samples, so 20 ms client frames (320 samples) map to 480-sample frames.

use once_cell::sync::Lazy;
use std::f64::consts::PI;

/// Upsampling factor of the 16 kHz → 24 kHz conversion.
const RESAMPLE_UP: usize = 3;
/// Decimation factor of the 16 kHz → 24 kHz conversion.
const RESAMPLE_DOWN: usize = 2;
/// Filter taps per polyphase branch.
const TAPS_PER_PHASE: usize = 32;
const FILTER_LEN: usize = RESAMPLE_UP * TAPS_PER_PHASE;

/// Blackman-windowed sinc low-pass at the 8 kHz input Nyquist, normalized
/// so each polyphase branch has unity DC gain.
static FILTER: Lazy<[f32; FILTER_LEN]> = Lazy::new(build_filter);

fn build_filter() -> [f32; FILTER_LEN] {
    // Cutoff relative to the x3 intermediate rate (8 kHz of 48 kHz).
    let cutoff = 1.0 / (RESAMPLE_UP as f64 * RESAMPLE_DOWN as f64);
    let center = (FILTER_LEN - 1) as f64 / 2.0;

    let mut taps = [0.0f64; FILTER_LEN];
    for (k, tap) in taps.iter_mut().enumerate() {
        let t = k as f64 - center;
        let x = 2.0 * cutoff * t;
        let sinc = if x == 0.0 { 1.0 } else { (PI * x).sin() / (PI * x) };
        let window = 0.42 - 0.5 * (2.0 * PI * k as f64 / (FILTER_LEN - 1) as f64).cos()
            + 0.08 * (4.0 * PI * k as f64 / (FILTER_LEN - 1) as f64).cos();
        *tap = 2.0 * cutoff * sinc * window;
    }

    // Normalize each branch so constant input passes through unchanged.
    let mut out = [0.0f32; FILTER_LEN];
    for phase in 0..RESAMPLE_UP {
        let sum: f64 = (0..TAPS_PER_PHASE).map(|i| taps[phase + RESAMPLE_UP * i]).sum();
        for i in 0..TAPS_PER_PHASE {
            out[phase + RESAMPLE_UP * i] = (taps[phase + RESAMPLE_UP * i] / sum) as f32;
        }
    }
    out
}

/// Resample 16 kHz s16le mono PCM to 24 kHz s16le mono PCM.
///
/// Output length is exactly ⌊3N/2⌋ samples for N input samples.
pub fn resample_16k_to_24k(pcm_bytes: &[u8]) -> Vec<u8> {
    let samples = pcm_to_samples(pcm_bytes);
    let out_len = samples.len() * RESAMPLE_UP / RESAMPLE_DOWN;
    let mut out = Vec::with_capacity(out_len * 2);

    for m in 0..out_len {
        // Position in the x3 zero-stuffed stream, decimated by 2.
        let j = m * RESAMPLE_DOWN;
        let phase = j % RESAMPLE_UP;
        let base = j / RESAMPLE_UP;

        let mut acc = 0.0f64;
        for i in 0..TAPS_PER_PHASE {
            let Some(idx) = base.checked_sub(i) else { break };
            acc += FILTER[phase + RESAMPLE_UP * i] as f64 * samples[idx] as f64;
        }

        let clipped = acc.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        out.extend_from_slice(&clipped.to_le_bytes());
    }

    out
}

/// Calculate the audio level of s16le PCM in dBFS, clamped to [-60, 0].
///
/// Empty and silent buffers report -60.0.
pub fn calculate_level(pcm_bytes: &[u8]) -> f32 {
    let samples = pcm_to_samples(pcm_bytes);
    if samples.is_empty() {
        return -60.0;
    }

    let mean_square = samples
        .iter()
        .map(|&s| (s as f64) * (s as f64))
        .sum::<f64>()
        / samples.len() as f64;
    let rms = mean_square.sqrt();
    if rms < 1e-6 {
        return -60.0;
    }

    let db = 20.0 * (rms / 32768.0).log10();
    db.clamp(-60.0, 0.0) as f32
}

/// Normalize s16le PCM towards a target RMS level in dBFS, with clipping.
///
/// Silence is returned unchanged.
pub fn normalize_audio(pcm_bytes: &[u8], target_db: f32) -> Vec<u8> {
    let samples = pcm_to_samples(pcm_bytes);
    if samples.is_empty() {
        return pcm_bytes.to_vec();
    }

    let mean_square = samples
        .iter()
        .map(|&s| (s as f64) * (s as f64))
        .sum::<f64>()
        / samples.len() as f64;
    let rms = mean_square.sqrt();
    if rms < 1e-6 {
        return pcm_bytes.to_vec();
    }

    let current_db = 20.0 * (rms / 32768.0).log10();
    let gain = 10f64.powf((target_db as f64 - current_db) / 20.0);

    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in &samples {
        let scaled = (s as f64 * gain).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    out
}

/// Convert s16le PCM bytes to f32 samples normalized to [-1, 1].
pub fn pcm_to_float32(pcm_bytes: &[u8]) -> Vec<f32> {
    pcm_to_samples(pcm_bytes)
        .into_iter()
        .map(|s| s as f32 / 32768.0)
        .collect()
}

/// Convert f32 samples in [-1, 1] to s16le PCM bytes, with clipping.
pub fn float32_to_pcm(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let scaled = (s as f64 * 32768.0).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    out
}

fn pcm_to_samples(pcm_bytes: &[u8]) -> Vec<i16> {
    pcm_bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
