//! Integrated loudness and true peak.
//!
//! Loudness follows the ITU-R BS.1770 recipe: K-weighting (high shelf plus
//! high pass), mean square over 400 ms blocks with 75% overlap, an absolute
//! gate at -70 LUFS and a relative gate 10 LU below the ungated level.
//! True peak is the sample peak refined by 4x windowed-sinc interpolation.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reported for digital silence, equal to the absolute gate.
pub const SILENCE_LUFS: f32 = -70.0;
/// Reported when every sample is zero.
pub const SILENCE_DBTP: f32 = -100.0;

const ABSOLUTE_GATE: f64 = -70.0;
const RELATIVE_GATE: f64 = -10.0;
const STEPS_PER_BLOCK: usize = 4; // 400 ms block, 100 ms hop

const OVERSAMPLE: usize = 4;
const HALF_TAPS: usize = 12;
const ABORT_CHECK_INTERVAL: usize = 4096;

#[derive(Clone, Copy, Debug)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn new(b0: f64, b1: f64, b2: f64, a1: f64, a2: f64) -> Self {
        Self { b0, b1, b2, a1, a2, z1: 0.0, z2: 0.0 }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}

/// Pre-filter (head shelf) and RLB high pass, designed for any sample rate.
fn k_weighting(sample_rate: u32) -> [Biquad; 2] {
    let fs = sample_rate as f64;

    let f0 = 1681.974450955533;
    let gain_db = 3.999843853973347;
    let q = 0.7071752369554196;
    let k = (PI * f0 / fs).tan();
    let vh = 10f64.powf(gain_db / 20.0);
    let vb = vh.powf(0.4996667741545416);
    let a0 = 1.0 + k / q + k * k;
    let shelf = Biquad::new(
        (vh + vb * k / q + k * k) / a0,
        2.0 * (k * k - vh) / a0,
        (vh - vb * k / q + k * k) / a0,
        2.0 * (k * k - 1.0) / a0,
        (1.0 - k / q + k * k) / a0,
    );

    let f0 = 38.13547087602444;
    let q = 0.5003270373238773;
    let k = (PI * f0 / fs).tan();
    let a0 = 1.0 + k / q + k * k;
    let high_pass = Biquad::new(
        1.0,
        -2.0,
        1.0,
        2.0 * (k * k - 1.0) / a0,
        (1.0 - k / q + k * k) / a0,
    );

    [shelf, high_pass]
}

fn block_loudness(mean_square: f64) -> f64 {
    -0.691 + 10.0 * mean_square.log10()
}

/// Gated integrated loudness in LUFS, rounded to 0.1.
pub fn integrated_loudness(channels: &[&[f32]], sample_rate: u32) -> f32 {
    let frames = channels.iter().map(|c| c.len()).min().unwrap_or(0);
    if frames == 0 || sample_rate == 0 {
        return SILENCE_LUFS;
    }

    let step = ((sample_rate as f64 * 0.1).round() as usize).max(1);
    let n_steps = frames / step;

    // Sum of K-weighted squares per 100 ms step, summed over channels
    let mut step_energy = vec![0.0f64; n_steps];
    let mut total_energy = 0.0f64;
    for channel in channels {
        let [mut shelf, mut high_pass] = k_weighting(sample_rate);
        for (i, &s) in channel[..frames].iter().enumerate() {
            let y = high_pass.process(shelf.process(s as f64));
            let sq = y * y;
            total_energy += sq;
            if let Some(slot) = step_energy.get_mut(i / step) {
                *slot += sq;
            }
        }
    }

    let block_len = (step * STEPS_PER_BLOCK) as f64;
    let blocks: Vec<f64> = if n_steps < STEPS_PER_BLOCK {
        vec![total_energy / frames as f64]
    } else {
        step_energy
            .windows(STEPS_PER_BLOCK)
            .map(|w| w.iter().sum::<f64>() / block_len)
            .collect()
    };

    let above_absolute: Vec<f64> = blocks
        .into_iter()
        .filter(|&z| z > 0.0 && block_loudness(z) > ABSOLUTE_GATE)
        .collect();
    if above_absolute.is_empty() {
        return SILENCE_LUFS;
    }

    let ungated = above_absolute.iter().sum::<f64>() / above_absolute.len() as f64;
    let relative_threshold = block_loudness(ungated) + RELATIVE_GATE;

    let gated: Vec<f64> = above_absolute
        .into_iter()
        .filter(|&z| block_loudness(z) > relative_threshold)
        .collect();
    let mean = gated.iter().sum::<f64>() / gated.len().max(1) as f64;

    round_to(block_loudness(mean), 10.0) as f32
}

/// Interpolation kernels for the fractional positions 1/4, 2/4, 3/4 between
/// two samples. Each phase is normalized to unity DC gain.
fn oversampling_kernels() -> Vec<[f64; 2 * HALF_TAPS]> {
    (1..OVERSAMPLE)
        .map(|phase| {
            let frac = phase as f64 / OVERSAMPLE as f64;
            let mut taps = [0.0f64; 2 * HALF_TAPS];
            for (k, tap) in taps.iter_mut().enumerate() {
                let t = k as f64 - (HALF_TAPS as f64 - 1.0) - frac;
                let sinc = if t.abs() < 1e-12 { 1.0 } else { (PI * t).sin() / (PI * t) };
                let window = 0.5 * (1.0 + (PI * t / HALF_TAPS as f64).cos());
                *tap = sinc * window;
            }
            let sum: f64 = taps.iter().sum();
            for tap in &mut taps {
                *tap /= sum;
            }
            taps
        })
        .collect()
}

/// Peak of one channel in dBTP, rounded to 0.01. `None` once `abort` is
/// raised.
///
/// Only gaps next to samples within 6 dB of the sample peak are
/// interpolated, since an inter-sample overshoot needs large neighbours.
pub fn true_peak(channel: &[f32], abort: &AtomicBool) -> Option<f32> {
    let sample_peak = channel.iter().fold(0.0f32, |m, s| m.max(s.abs())) as f64;
    if sample_peak == 0.0 {
        return Some(SILENCE_DBTP);
    }

    let kernels = oversampling_kernels();
    let threshold = sample_peak * 0.5;
    let len = channel.len() as isize;
    let mut peak = sample_peak;

    for i in 0..channel.len().saturating_sub(1) {
        if i % ABORT_CHECK_INTERVAL == 0 && abort.load(Ordering::Relaxed) {
            return None;
        }
        let near_peak = channel[i].abs() as f64 >= threshold || channel[i + 1].abs() as f64 >= threshold;
        if !near_peak {
            continue;
        }

        let first = i as isize - HALF_TAPS as isize + 1;
        for kernel in &kernels {
            let mut acc = 0.0f64;
            for (k, &c) in kernel.iter().enumerate() {
                let j = first + k as isize;
                if j >= 0 && j < len {
                    acc += channel[j as usize] as f64 * c;
                }
            }
            peak = peak.max(acc.abs());
        }
    }

    Some(round_to(20.0 * peak.log10(), 100.0) as f32)
}

fn round_to(value: f64, scale: f64) -> f64 {
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak_of(channel: &[f32]) -> f32 {
        true_peak(channel, &AtomicBool::new(false)).unwrap()
    }

    fn sine(freq: f32, amp: f32, phase: f32, secs: f32, sr: u32) -> Vec<f32> {
        let n = (secs * sr as f32) as usize;
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32 + phase).sin())
            .collect()
    }

    #[test]
    fn full_scale_1k_sine_is_about_minus_3() {
        let s = sine(1000.0, 1.0, 0.0, 5.0, 48000);
        let lufs = integrated_loudness(&[s.as_slice()], 48000);
        assert!((lufs - -3.0).abs() < 0.3, "got {}", lufs);
    }

    #[test]
    fn identical_stereo_channels_add_3db() {
        let s = sine(1000.0, 0.5, 0.0, 5.0, 44100);
        let mono = integrated_loudness(&[s.as_slice()], 44100);
        let stereo = integrated_loudness(&[s.as_slice(), s.as_slice()], 44100);
        assert!((stereo - mono - 3.0).abs() < 0.2, "mono {} stereo {}", mono, stereo);
    }

    #[test]
    fn silence_hits_the_floor() {
        let s = vec![0.0f32; 44100 * 2];
        assert_eq!(integrated_loudness(&[s.as_slice()], 44100), SILENCE_LUFS);
        assert_eq!(peak_of(&s), SILENCE_DBTP);
    }

    #[test]
    fn gating_ignores_trailing_silence() {
        let mut s = sine(1000.0, 0.5, 0.0, 10.0, 44100);
        let tone_only = integrated_loudness(&[s.as_slice()], 44100);
        s.extend(std::iter::repeat(0.0).take(44100 * 10));
        let with_silence = integrated_loudness(&[s.as_slice()], 44100);
        assert!((tone_only - with_silence).abs() < 0.3, "{} vs {}", tone_only, with_silence);
    }

    #[test]
    fn short_signal_measured_as_one_block() {
        let s = sine(1000.0, 1.0, 0.0, 0.2, 48000);
        let lufs = integrated_loudness(&[s.as_slice()], 48000);
        assert!(lufs > -4.0 && lufs < -2.0, "got {}", lufs);
    }

    #[test]
    fn short_burst_reads_near_sample_peak() {
        let s = vec![0.0, 0.5, -0.5, 0.0];
        let tp = peak_of(&s);
        assert!(tp >= -6.03 && tp < -5.0, "got {}", tp);
    }

    #[test]
    fn raised_abort_stops_peak_scan() {
        let s = sine(1000.0, 0.9, 0.0, 5.0, 44100);
        assert!(true_peak(&s, &AtomicBool::new(true)).is_none());
    }

    #[test]
    fn detects_inter_sample_overs() {
        // Quarter-rate sine at 45 degrees: samples sit at 0.707 of the real peak
        let s = sine(11025.0, 1.2, std::f32::consts::FRAC_PI_4, 1.0, 44100);
        let sample_peak_db = 20.0 * s.iter().fold(0.0f32, |m, x| m.max(x.abs())).log10();
        assert!(sample_peak_db < 0.0);
        let tp = peak_of(&s);
        assert!(tp > 0.5, "true peak {} should exceed 0 dBFS", tp);
    }
}
