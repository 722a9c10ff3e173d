use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::key::{self, KeyTemplates};
use super::{KeyEstimate, SpectralBackend, VectorId};
use crate::audio::analysis::{fold_tempo, hann_window};
use crate::error::ExtractorError;

/// Vectors are resampled to at most this rate before analysis.
const TARGET_RATE: u32 = 22050;
const MIN_VECTOR_SECS: f32 = 4.0;

const CHROMA_FFT: usize = 4096;
const FLUX_FFT: usize = 1024;
const FLUX_HOP: usize = 256;

const MIN_BPM: f32 = 70.0;
const MAX_BPM: f32 = 180.0;
const MAX_PERIOD_MULTIPLE: usize = 16;

struct StoredVector {
    samples: Vec<f32>,
    sample_rate: u32,
}

/// In-process spectral backend: chroma key detection and autocorrelation
/// tempo over backend-owned sample vectors.
pub struct NativeSpectralBackend {
    vectors: Mutex<HashMap<u64, Arc<StoredVector>>>,
    next_id: AtomicU64,
    chroma_fft: Arc<dyn Fft<f32>>,
    flux_fft: Arc<dyn Fft<f32>>,
    templates: KeyTemplates,
}

impl NativeSpectralBackend {
    pub fn new() -> Result<Self, ExtractorError> {
        let mut planner = FftPlanner::<f32>::new();
        log::debug!("Planning spectral backend FFTs ({} / {})", CHROMA_FFT, FLUX_FFT);
        Ok(Self {
            vectors: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            chroma_fft: planner.plan_fft_forward(CHROMA_FFT),
            flux_fft: planner.plan_fft_forward(FLUX_FFT),
            templates: KeyTemplates::new(),
        })
    }

    /// Number of uploaded vectors not yet released.
    pub fn live_vectors(&self) -> usize {
        self.vectors.lock().map(|v| v.len()).unwrap_or(0)
    }

    fn vector(&self, id: VectorId) -> Result<Arc<StoredVector>, ExtractorError> {
        let vectors = self
            .vectors
            .lock()
            .map_err(|_| ExtractorError::Compute("vector table poisoned".into()))?;
        vectors
            .get(&id.0)
            .cloned()
            .ok_or_else(|| ExtractorError::Compute(format!("unknown vector {}", id.0)))
    }

    fn onset_envelope(&self, vector: &StoredVector) -> Vec<f32> {
        let hann = hann_window(FLUX_FFT);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); FLUX_FFT];
        let mut prev = vec![0.0f32; FLUX_FFT / 2];
        let mut envelope = Vec::new();

        let mut pos = 0;
        while pos + FLUX_FFT <= vector.samples.len() {
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(vector.samples[pos + i] * hann[i], 0.0);
            }
            self.flux_fft.process(&mut buffer);

            let mut flux = 0.0f32;
            for (bin, p) in prev.iter_mut().enumerate() {
                let mag = buffer[bin].norm();
                flux += (mag - *p).max(0.0);
                *p = mag;
            }
            envelope.push(flux);
            pos += FLUX_HOP;
        }
        envelope
    }
}

impl SpectralBackend for NativeSpectralBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn upload(&self, samples: &[f32], sample_rate: u32) -> Result<VectorId, ExtractorError> {
        if sample_rate == 0 {
            return Err(ExtractorError::Compute("zero sample rate".into()));
        }
        let secs = samples.len() as f32 / sample_rate as f32;
        if secs < MIN_VECTOR_SECS {
            return Err(ExtractorError::Compute(format!(
                "window too short: {:.2}s (need {:.0}s)",
                secs, MIN_VECTOR_SECS
            )));
        }

        let (resampled, rate) = if sample_rate > TARGET_RATE {
            (resample(samples, sample_rate, TARGET_RATE)?, TARGET_RATE)
        } else {
            (samples.to_vec(), sample_rate)
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.vectors
            .lock()
            .map_err(|_| ExtractorError::Compute("vector table poisoned".into()))?
            .insert(
                id,
                Arc::new(StoredVector {
                    samples: resampled,
                    sample_rate: rate,
                }),
            );
        log::debug!("Uploaded vector {} ({:.1}s at {} Hz)", id, secs, rate);
        Ok(VectorId(id))
    }

    fn key(&self, id: VectorId) -> Result<KeyEstimate, ExtractorError> {
        let vector = self.vector(id)?;
        let profile = key::chroma_profile(&vector.samples, vector.sample_rate, &self.chroma_fft);
        key::detect_key(&profile, &self.templates)
            .ok_or_else(|| ExtractorError::Compute("no tonal content".into()))
    }

    fn rhythm(&self, id: VectorId) -> Result<f32, ExtractorError> {
        let vector = self.vector(id)?;
        let envelope = self.onset_envelope(&vector);
        let frame_rate = vector.sample_rate as f32 / FLUX_HOP as f32;
        let bpm = tempo_from_envelope(&envelope, frame_rate)
            .ok_or_else(|| ExtractorError::Compute("no periodicity found".into()))?;
        Ok(fold_tempo(bpm))
    }

    fn release(&self, id: VectorId) {
        if let Ok(mut vectors) = self.vectors.lock() {
            if vectors.remove(&id.0).is_some() {
                log::debug!("Released vector {}", id.0);
            }
        }
    }
}

/// Band-limited resampling of a mono signal with rubato.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, ExtractorError> {
    use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)
        .map_err(|e| ExtractorError::Compute(format!("failed to create resampler: {}", e)))?;

    let output = resampler
        .process(&[samples], None)
        .map_err(|e| ExtractorError::Compute(format!("resampling failed: {}", e)))?;

    log::debug!("Resampled {} Hz -> {} Hz", from_rate, to_rate);
    Ok(output.into_iter().next().unwrap_or_default())
}

/// Beat period from the autocorrelation of the onset envelope.
///
/// The strongest lag in the 70-180 BPM range is refined by locating the peak
/// at 2, 4, 8 and 16 times that lag, each step narrowing the period estimate.
fn tempo_from_envelope(envelope: &[f32], frame_rate: f32) -> Option<f32> {
    let n = envelope.len();
    let mean = envelope.iter().sum::<f32>() / n.max(1) as f32;
    let centered: Vec<f64> = envelope.iter().map(|&v| (v - mean) as f64).collect();

    let min_lag = ((60.0 * frame_rate / MAX_BPM).floor() as usize).max(2);
    let max_lag = (60.0 * frame_rate / MIN_BPM).ceil() as usize;
    if n < 2 * max_lag + 2 {
        return None;
    }

    let acf = |lag: usize| -> f64 {
        centered[..n - lag]
            .iter()
            .zip(&centered[lag..])
            .map(|(a, b)| a * b)
            .sum()
    };

    let (coarse, peak) = (min_lag..=max_lag)
        .map(|lag| (lag, acf(lag)))
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    if peak <= 0.0 {
        return None;
    }

    let mut period = coarse as f64 + parabolic_offset(acf(coarse - 1), peak, acf(coarse + 1));

    let mut k = 2;
    while k <= MAX_PERIOD_MULTIPLE {
        let centre = (period * k as f64).round() as usize;
        if centre + 3 >= n / 2 {
            break;
        }
        let (lag, value) = (centre - 2..=centre + 2)
            .map(|lag| (lag, acf(lag)))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        let refined = lag as f64 + parabolic_offset(acf(lag - 1), value, acf(lag + 1));
        period = refined / k as f64;
        k *= 2;
    }

    Some((60.0 * frame_rate as f64 / period) as f32)
}

fn parabolic_offset(left: f64, centre: f64, right: f64) -> f64 {
    let denom = left - 2.0 * centre + right;
    if denom >= 0.0 {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}
