//! Key detection from an averaged chroma profile matched against rotated
//! Krumhansl-Kessler tonal profiles.
//!
//! # Reference
//!
//! Krumhansl, C. L., & Kessler, E. J. (1982). Tracing the Dynamic Changes in Perceived
//! Tonal Organization in a Spatial Representation of Musical Keys. *Psychological Review*,
//! 89(4), 334-368.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft};

use super::KeyEstimate;
use crate::audio::analysis::hann_window;
use crate::audio::features::Mode;

pub const PITCH_CLASSES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

const MAJOR_PROFILE: [f32; 12] = [6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88];
const MINOR_PROFILE: [f32; 12] = [6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17];

const MIN_PITCH_HZ: f32 = 100.0;
const MAX_PITCH_HZ: f32 = 5000.0;
/// Frames whose in-band power per squared frame length is below this (roughly
/// a -60 dBFS sine) carry no pitch information.
const MIN_FRAME_POWER: f32 = 1e-7;

/// The 24 key profiles, indexed by tonic pitch class.
#[derive(Debug, Clone)]
pub struct KeyTemplates {
    major: [[f32; 12]; 12],
    minor: [[f32; 12]; 12],
}

impl KeyTemplates {
    pub fn new() -> Self {
        Self {
            major: std::array::from_fn(|tonic| rotate(&MAJOR_PROFILE, tonic)),
            minor: std::array::from_fn(|tonic| rotate(&MINOR_PROFILE, tonic)),
        }
    }
}

impl Default for KeyTemplates {
    fn default() -> Self {
        Self::new()
    }
}

fn rotate(profile: &[f32; 12], tonic: usize) -> [f32; 12] {
    std::array::from_fn(|pc| profile[(pc + 12 - tonic) % 12])
}

/// Average per-frame-normalized pitch-class energy over the signal.
/// All zeros when nothing tonal was found.
pub fn chroma_profile(samples: &[f32], sample_rate: u32, fft: &Arc<dyn Fft<f32>>) -> [f32; 12] {
    let frame_size = fft.len();
    let hop = frame_size / 2;
    let bin_hz = sample_rate as f32 / frame_size as f32;

    let bin_classes: Vec<Option<usize>> = (0..frame_size / 2)
        .map(|bin| {
            let hz = bin as f32 * bin_hz;
            if !(MIN_PITCH_HZ..=MAX_PITCH_HZ).contains(&hz) {
                return None;
            }
            // MIDI note number; 69 is A4
            let midi = (69.0 + 12.0 * (hz / 440.0).log2()).round() as i32;
            Some(midi.rem_euclid(12) as usize)
        })
        .collect();

    let window = hann_window(frame_size);
    let floor = MIN_FRAME_POWER * (frame_size * frame_size) as f32;

    let mut profile = [0.0f32; 12];
    let mut buffer = vec![Complex::new(0.0f32, 0.0); frame_size];
    let mut pos = 0;
    while pos + frame_size <= samples.len() {
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = Complex::new(samples[pos + i] * window[i], 0.0);
        }
        fft.process(&mut buffer);

        let mut frame = [0.0f32; 12];
        for (bin, class) in bin_classes.iter().enumerate() {
            if let Some(pc) = class {
                frame[*pc] += buffer[bin].norm_sqr();
            }
        }

        let total: f32 = frame.iter().sum();
        if total > floor {
            for (acc, v) in profile.iter_mut().zip(frame) {
                *acc += v / total;
            }
        }
        pos += hop;
    }

    let max = profile.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        for v in &mut profile {
            *v /= max;
        }
    }
    profile
}

/// Best matching key by Pearson correlation, or `None` for an empty profile.
pub fn detect_key(profile: &[f32; 12], templates: &KeyTemplates) -> Option<KeyEstimate> {
    if profile.iter().all(|&v| v <= 0.0) {
        return None;
    }

    let candidates = templates
        .major
        .iter()
        .enumerate()
        .map(|(tonic, t)| (tonic, Mode::Major, t))
        .chain(templates.minor.iter().enumerate().map(|(tonic, t)| (tonic, Mode::Minor, t)));

    let (tonic, mode, strength) = candidates
        .map(|(tonic, mode, t)| (tonic, mode, pearson(profile, t)))
        .max_by(|a, b| a.2.total_cmp(&b.2))?;

    log::debug!("Key match: {} {:?} (r={:.3})", PITCH_CLASSES[tonic], mode, strength);

    Some(KeyEstimate {
        key: PITCH_CLASSES[tonic].to_string(),
        mode,
        strength,
    })
}

fn pearson(a: &[f32; 12], b: &[f32; 12]) -> f32 {
    let mean_a = a.iter().sum::<f32>() / 12.0;
    let mean_b = b.iter().sum::<f32>() / 12.0;
    let (mut cov, mut var_a, mut var_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    if denom <= 0.0 {
        0.0
    } else {
        cov / denom
    }
}
