use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::features::{FrequencyBalance, StereoImage, WorkerFeatureResult};
use super::loudness;
use crate::error::WorkerError;

const FFT_SIZE: usize = 2048;
const HOP_SIZE: usize = 512;
const FRAMES_PER_CHUNK: usize = 256;

const MIN_BEATS: usize = 4;
const MIN_BEAT_GAP_SECS: f32 = 0.1;
const THRESHOLD_WINDOW_SECS: f32 = 0.25;

const LOW_BAND_HZ: f32 = 20.0;
const LOW_MID_SPLIT_HZ: f32 = 250.0;
const MID_HIGH_SPLIT_HZ: f32 = 4000.0;

/// Spectral summary of one STFT frame.
#[derive(Clone, Copy, Debug, Default)]
struct FrameSummary {
    /// Half-wave rectified magnitude increase over the previous frame
    flux: f32,
    low: f64,
    mid: f64,
    high: f64,
    /// Sum of frequency * magnitude, for the centroid
    weighted_hz: f64,
    magnitude: f64,
}

/// Full native analysis of one track. Runs on the worker thread.
///
/// `abort` is polled between stages and inside the STFT and true-peak
/// passes; once raised the analysis stops with `WorkerError::Aborted`.
pub fn analyze(
    left: &[f32],
    right: Option<&[f32]>,
    sample_rate: u32,
    abort: &AtomicBool,
) -> Result<WorkerFeatureResult, WorkerError> {
    if sample_rate == 0 || left.is_empty() {
        return Err(WorkerError::Compute("empty input".into()));
    }
    if let Some(r) = right {
        if r.len() != left.len() {
            return Err(WorkerError::Compute(format!(
                "channel length mismatch: {} vs {}",
                left.len(),
                r.len()
            )));
        }
    }

    let mid: Cow<[f32]> = match right {
        Some(r) => Cow::Owned(left.iter().zip(r).map(|(l, r)| (l + r) * 0.5).collect()),
        None => Cow::Borrowed(left),
    };
    let duration = left.len() as f32 / sample_rate as f32;

    log::info!("Worker pass 1: spectral frames...");
    let frames = spectral_frames(&mid, sample_rate, abort);
    check_abort(abort)?;

    let frame_rate = sample_rate as f32 / HOP_SIZE as f32;
    let flux_values: Vec<(f32, f32)> = frames
        .iter()
        .enumerate()
        .map(|(i, f)| (i as f32 / frame_rate, f.flux))
        .collect();
    let beat_times = detect_beats(&flux_values, frame_rate);
    let bpm = estimate_tempo(&beat_times);
    check_abort(abort)?;

    log::info!("Worker pass 2: loudness and peak...");
    let channels: Vec<&[f32]> = std::iter::once(left).chain(right).collect();
    let loudness_db = loudness::integrated_loudness(&channels, sample_rate);
    check_abort(abort)?;
    let mut true_peak = loudness::SILENCE_DBTP;
    for channel in &channels {
        let peak = loudness::true_peak(channel, abort).ok_or(WorkerError::Aborted)?;
        true_peak = true_peak.max(peak);
    }

    let stereo = stereo_image(left, right);
    let balance = frequency_balance(&frames);
    let brightness = brightness_label(&frames).to_string();
    let energy = energy_score(loudness_db, beat_times.len(), duration);

    let finite = [bpm, loudness_db, true_peak, energy, stereo.width, stereo.correlation]
        .iter()
        .all(|v| v.is_finite());
    if !finite {
        return Err(WorkerError::Compute("non-finite feature value".into()));
    }

    log::info!(
        "Worker: beats={}, tempo={:.1} BPM, loudness={:.1} LUFS, peak={:.2} dBTP, width={:.2}, corr={:.2}, balance={}",
        beat_times.len(),
        bpm,
        loudness_db,
        true_peak,
        stereo.width,
        stereo.correlation,
        balance.character
    );

    Ok(WorkerFeatureResult {
        bpm,
        loudness_db,
        brightness,
        true_peak,
        energy,
        stereo,
        balance,
    })
}

fn check_abort(abort: &AtomicBool) -> Result<(), WorkerError> {
    if abort.load(Ordering::Relaxed) {
        Err(WorkerError::Aborted)
    } else {
        Ok(())
    }
}

/// One STFT pass over the signal. Frames are processed in parallel chunks;
/// each chunk recomputes the frame before it so flux stays exact. Chunks
/// started after `abort` is raised are skipped, leaving the result short.
fn spectral_frames(samples: &[f32], sample_rate: u32, abort: &AtomicBool) -> Vec<FrameSummary> {
    let n_frames = if samples.len() >= FFT_SIZE {
        (samples.len() - FFT_SIZE) / HOP_SIZE + 1
    } else {
        1
    };

    let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
    let hann = hann_window(FFT_SIZE);
    let bin_hz = sample_rate as f32 / FFT_SIZE as f32;
    let n_chunks = n_frames.div_ceil(FRAMES_PER_CHUNK);

    let chunks: Vec<Vec<FrameSummary>> = (0..n_chunks)
        .into_par_iter()
        .map(|chunk| {
            if abort.load(Ordering::Relaxed) {
                return Vec::new();
            }
            let start = chunk * FRAMES_PER_CHUNK;
            let end = (start + FRAMES_PER_CHUNK).min(n_frames);
            let mut buffer = vec![Complex::new(0.0f32, 0.0); FFT_SIZE];

            let mut prev = if start == 0 {
                vec![0.0f32; FFT_SIZE / 2]
            } else {
                frame_magnitudes(samples, start - 1, &fft, &hann, &mut buffer)
            };

            let mut out = Vec::with_capacity(end - start);
            for frame in start..end {
                let magnitudes = frame_magnitudes(samples, frame, &fft, &hann, &mut buffer);
                out.push(summarize(&magnitudes, &prev, bin_hz));
                prev = magnitudes;
            }
            out
        })
        .collect();

    chunks.into_iter().flatten().collect()
}

fn frame_magnitudes(
    samples: &[f32],
    frame: usize,
    fft: &Arc<dyn Fft<f32>>,
    hann: &[f32],
    buffer: &mut [Complex<f32>],
) -> Vec<f32> {
    let start = frame * HOP_SIZE;
    for (i, slot) in buffer.iter_mut().enumerate() {
        let s = samples.get(start + i).copied().unwrap_or(0.0);
        *slot = Complex::new(s * hann[i], 0.0);
    }
    fft.process(buffer);
    buffer[..FFT_SIZE / 2].iter().map(|c| c.norm()).collect()
}

fn summarize(magnitudes: &[f32], prev: &[f32], bin_hz: f32) -> FrameSummary {
    let mut summary = FrameSummary {
        flux: magnitudes
            .iter()
            .zip(prev)
            .map(|(cur, prev)| (cur - prev).max(0.0))
            .sum(),
        ..Default::default()
    };

    for (bin, &mag) in magnitudes.iter().enumerate().skip(1) {
        let hz = bin as f32 * bin_hz;
        let mag = mag as f64;
        summary.weighted_hz += hz as f64 * mag;
        summary.magnitude += mag;

        let power = mag * mag;
        if hz < LOW_BAND_HZ {
            continue;
        } else if hz < LOW_MID_SPLIT_HZ {
            summary.low += power;
        } else if hz < MID_HIGH_SPLIT_HZ {
            summary.mid += power;
        } else {
            summary.high += power;
        }
    }

    summary
}

/// Onset times (seconds) from an adaptive threshold over spectral flux.
fn detect_beats(flux_values: &[(f32, f32)], frame_rate: f32) -> Vec<f32> {
    if flux_values.is_empty() {
        return Vec::new();
    }

    let window = ((THRESHOLD_WINDOW_SECS * frame_rate).round() as usize).max(1);
    let global_mean = flux_values.iter().map(|(_, f)| f).sum::<f32>() / flux_values.len() as f32;
    let floor = global_mean * 0.05 + 1e-6;
    let mut beat_times = Vec::new();

    for i in 0..flux_values.len() {
        let start = i.saturating_sub(window);
        let end = (i + window + 1).min(flux_values.len());
        let local_mean: f32 =
            flux_values[start..end].iter().map(|(_, f)| f).sum::<f32>() / (end - start) as f32;

        let threshold = local_mean * 1.5 + floor;

        if flux_values[i].1 > threshold {
            let is_peak = (i == 0 || flux_values[i].1 >= flux_values[i - 1].1)
                && (i == flux_values.len() - 1 || flux_values[i].1 >= flux_values[i + 1].1);

            let far_enough = beat_times
                .last()
                .map_or(true, |&last: &f32| flux_values[i].0 - last > MIN_BEAT_GAP_SECS);

            if is_peak && far_enough {
                beat_times.push(flux_values[i].0);
            }
        }
    }

    beat_times
}

/// Tempo from onset intervals: the median picks the beat period, the mean of
/// intervals near it refines it past the hop resolution. 0.0 when undetected.
fn estimate_tempo(beat_times: &[f32]) -> f32 {
    if beat_times.len() < MIN_BEATS {
        return 0.0;
    }

    // 60-200 BPM
    let mut reasonable: Vec<f32> = beat_times
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&i| (0.3..=1.0).contains(&i))
        .collect();

    if reasonable.is_empty() {
        return 0.0;
    }

    reasonable.sort_by(|a, b| a.total_cmp(b));
    let median = reasonable[reasonable.len() / 2];

    let consistent: Vec<f32> = reasonable
        .iter()
        .copied()
        .filter(|i| (i - median).abs() <= median * 0.1)
        .collect();
    let period = consistent.iter().sum::<f32>() / consistent.len() as f32;

    round_to(fold_tempo(60.0 / period), 10.0)
}

/// Fold a tempo into the 70-170 BPM range by octaves.
pub(crate) fn fold_tempo(mut bpm: f32) -> f32 {
    if !bpm.is_finite() || bpm <= 0.0 {
        return 0.0;
    }
    while bpm < 70.0 {
        bpm *= 2.0;
    }
    while bpm > 170.0 {
        bpm /= 2.0;
    }
    bpm
}

/// Width and correlation of a stereo pair. Mono or silent input reads as
/// fully mono-compatible.
pub fn stereo_image(left: &[f32], right: Option<&[f32]>) -> StereoImage {
    let Some(right) = right else {
        return StereoImage::MONO;
    };

    let (mut sum_lr, mut sum_ll, mut sum_rr, mut sum_side, mut sum_mid) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (&l, &r) in left.iter().zip(right) {
        let (l, r) = (l as f64, r as f64);
        sum_lr += l * r;
        sum_ll += l * l;
        sum_rr += r * r;
        sum_side += (l - r) * (l - r);
        sum_mid += (l + r) * (l + r);
    }

    if sum_ll == 0.0 && sum_rr == 0.0 {
        return StereoImage::MONO;
    }

    let denominator = (sum_ll * sum_rr).sqrt();
    let correlation = if denominator == 0.0 { 0.0 } else { sum_lr / denominator };
    let width = if sum_mid == 0.0 { 1.0 } else { (sum_side / sum_mid).min(1.0) };

    StereoImage {
        width: round_to(width as f32, 100.0),
        correlation: round_to(correlation.clamp(-1.0, 1.0) as f32, 100.0),
    }
}

fn frequency_balance(frames: &[FrameSummary]) -> FrequencyBalance {
    let (low, mid, high) = frames
        .iter()
        .fold((0.0f64, 0.0f64, 0.0f64), |(l, m, h), f| (l + f.low, m + f.mid, h + f.high));
    let total = low + mid + high;
    if total <= 0.0 {
        return FrequencyBalance::default();
    }

    let pct = |v: f64| round_to((v / total * 100.0) as f32, 10.0);
    let (low, mid, high) = (pct(low), pct(mid), pct(high));
    let spread = low.max(mid).max(high) - low.min(mid).min(high);

    let character = if low >= 50.0 {
        "Bass Heavy"
    } else if high >= 35.0 {
        "Bright / Airy"
    } else if mid >= 60.0 {
        "Mid Focused"
    } else if spread <= 15.0 {
        "Flat"
    } else {
        "Balanced"
    };

    FrequencyBalance {
        low,
        mid,
        high,
        character: character.into(),
    }
}

fn brightness_label(frames: &[FrameSummary]) -> &'static str {
    let (weighted, magnitude) = frames
        .iter()
        .fold((0.0f64, 0.0f64), |(w, m), f| (w + f.weighted_hz, m + f.magnitude));
    if magnitude <= 1e-9 {
        return "Unknown";
    }

    let centroid = weighted / magnitude;
    if centroid < 500.0 {
        "Very Dark / Deep"
    } else if centroid < 1500.0 {
        "Warm / Mellow"
    } else if centroid < 3000.0 {
        "Neutral / Balanced"
    } else if centroid < 5000.0 {
        "Bright / Crisp"
    } else {
        "Very Bright / Harsh"
    }
}

/// 0.0-1.0 blend of loudness and onset density.
fn energy_score(loudness_db: f32, beats: usize, duration: f32) -> f32 {
    let loudness_score = ((loudness_db + 40.0) / 34.0).clamp(0.0, 1.0);
    let density = if duration > 0.0 { beats as f32 / duration } else { 0.0 };
    let density_score = (density / 4.0).min(1.0);
    round_to(0.7 * loudness_score + 0.3 * density_score, 100.0)
}

fn round_to(value: f32, scale: f32) -> f32 {
    (value * scale).round() / scale
}

pub(crate) fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22050;

    fn sine(freq: f32, amp: f32, secs: f32) -> Vec<f32> {
        let n = (secs * SR as f32) as usize;
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
            .collect()
    }

    fn click_track(bpm: f32, secs: f32) -> Vec<f32> {
        let n = (secs * SR as f32) as usize;
        let mut out = vec![0.0f32; n];
        let period = 60.0 / bpm;
        let click_len = (0.01 * SR as f32) as usize;
        let mut beat = 0;
        loop {
            let start = (beat as f32 * period * SR as f32).round() as usize;
            if start >= n {
                break;
            }
            for i in 0..click_len.min(n - start) {
                let t = i as f32 / SR as f32;
                out[start + i] = 0.8 * (2.0 * std::f32::consts::PI * 1000.0 * t).sin() * (-t / 0.003).exp();
            }
            beat += 1;
        }
        out
    }

    fn noise(seed: u32, n: usize) -> Vec<f32> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
            })
            .collect()
    }

    fn run(left: &[f32], right: Option<&[f32]>) -> WorkerFeatureResult {
        analyze(left, right, SR, &AtomicBool::new(false)).unwrap()
    }

    #[test]
    fn click_track_tempo() {
        let clicks = click_track(120.0, 30.0);
        let result = run(&clicks, None);
        assert!((result.bpm - 120.0).abs() <= 1.0, "got {}", result.bpm);
    }

    #[test]
    fn off_grid_tempo_is_refined() {
        let clicks = click_track(128.0, 40.0);
        let result = run(&clicks, None);
        assert!((result.bpm - 128.0).abs() <= 1.0, "got {}", result.bpm);
    }

    #[test]
    fn silence_falls_back_to_neutral_labels() {
        let silence = vec![0.0f32; SR as usize * 3];
        let result = run(&silence, Some(&silence));
        assert_eq!(result.bpm, 0.0);
        assert_eq!(result.brightness, "Unknown");
        assert_eq!(result.balance, FrequencyBalance::default());
        assert_eq!(result.stereo, StereoImage::MONO);
        assert_eq!(result.loudness_db, loudness::SILENCE_LUFS);
    }

    #[test]
    fn mono_has_no_width() {
        let tone = sine(440.0, 0.5, 2.0);
        assert_eq!(run(&tone, None).stereo, StereoImage::MONO);
    }

    #[test]
    fn identical_channels_correlate() {
        let tone = sine(440.0, 0.5, 2.0);
        let image = stereo_image(&tone, Some(&tone));
        assert_eq!(image.correlation, 1.0);
        assert_eq!(image.width, 0.0);
    }

    #[test]
    fn inverted_channels_anticorrelate() {
        let tone = sine(440.0, 0.5, 2.0);
        let inverted: Vec<f32> = tone.iter().map(|s| -s).collect();
        let image = stereo_image(&tone, Some(&inverted));
        assert_eq!(image.correlation, -1.0);
        assert_eq!(image.width, 1.0);
    }

    #[test]
    fn independent_noise_is_wide_and_uncorrelated() {
        let l = noise(1, SR as usize * 2);
        let mut r = noise(1, SR as usize * 2);
        r.reverse();
        let image = stereo_image(&l, Some(&r));
        assert!(image.correlation.abs() < 0.05, "corr {}", image.correlation);
        assert!(image.width > 0.9, "width {}", image.width);
    }

    #[test]
    fn low_sine_is_bass_heavy_and_dark() {
        let result = run(&sine(80.0, 0.5, 3.0), None);
        assert_eq!(result.balance.character, "Bass Heavy");
        assert_eq!(result.brightness, "Very Dark / Deep");
        let total = result.balance.low + result.balance.mid + result.balance.high;
        assert!((total - 100.0).abs() < 0.5);
    }

    #[test]
    fn high_sine_is_bright() {
        let result = run(&sine(8000.0, 0.5, 3.0), None);
        assert_eq!(result.balance.character, "Bright / Airy");
        assert_eq!(result.brightness, "Very Bright / Harsh");
    }

    #[test]
    fn midrange_sine_is_mid_focused() {
        let result = run(&sine(1000.0, 0.5, 3.0), None);
        assert_eq!(result.balance.character, "Mid Focused");
    }

    #[test]
    fn abort_flag_stops_the_analysis() {
        let tone = sine(440.0, 0.5, 2.0);
        let err = analyze(&tone, None, SR, &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, WorkerError::Aborted));
    }

    #[test]
    fn raised_abort_skips_stft_chunks() {
        let tone = sine(440.0, 0.5, 30.0);
        assert!(spectral_frames(&tone, SR, &AtomicBool::new(true)).is_empty());
        assert!(!spectral_frames(&tone, SR, &AtomicBool::new(false)).is_empty());
    }

    #[test]
    fn empty_input_is_a_compute_failure() {
        let err = analyze(&[], None, SR, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, WorkerError::Compute(_)));
    }

    #[test]
    fn tempo_folds_into_range() {
        assert_eq!(fold_tempo(60.0), 120.0);
        assert_eq!(fold_tempo(200.0), 100.0);
        assert_eq!(fold_tempo(128.0), 128.0);
        assert_eq!(fold_tempo(0.0), 0.0);
    }

    #[test]
    fn too_few_onsets_means_no_tempo() {
        assert_eq!(estimate_tempo(&[0.0, 0.5, 1.0]), 0.0);
    }
}
