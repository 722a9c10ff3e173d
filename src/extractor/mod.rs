//! Optional spectral extractor: musical key, mode and a refined tempo.
//!
//! A backend owns the memory of the sample vectors it analyzes. Callers get
//! access through [`AnalysisVector`], which releases the vector when it goes
//! out of scope, on success and on every error path alike. The backend is
//! created at most once per process through an [`ExtractorCell`].

mod key;
mod native;

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use crate::audio::decode::RawAudioBuffer;
use crate::audio::features::{AdvancedFeatureResult, Mode};
use crate::error::ExtractorError;

pub use key::PITCH_CLASSES;
pub use native::NativeSpectralBackend;

/// Handle to a vector held by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VectorId(pub u64);

#[derive(Clone, Debug, PartialEq)]
pub struct KeyEstimate {
    /// Tonic, sharps only ("C", "C#", ... "B")
    pub key: String,
    pub mode: Mode,
    pub strength: f32,
}

pub trait SpectralBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Copy samples into backend-owned memory. Every successful upload must
    /// be paired with exactly one `release`.
    fn upload(&self, samples: &[f32], sample_rate: u32) -> Result<VectorId, ExtractorError>;

    fn key(&self, vector: VectorId) -> Result<KeyEstimate, ExtractorError>;

    /// Tempo in BPM, folded into 70-170.
    fn rhythm(&self, vector: VectorId) -> Result<f32, ExtractorError>;

    fn release(&self, vector: VectorId);
}

/// A vector uploaded to a backend, released on drop.
pub struct AnalysisVector<'a> {
    backend: &'a dyn SpectralBackend,
    id: VectorId,
}

impl<'a> AnalysisVector<'a> {
    pub fn upload(
        backend: &'a dyn SpectralBackend,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Self, ExtractorError> {
        let id = backend.upload(samples, sample_rate)?;
        Ok(Self { backend, id })
    }

    pub fn id(&self) -> VectorId {
        self.id
    }
}

impl Drop for AnalysisVector<'_> {
    fn drop(&mut self) {
        self.backend.release(self.id);
    }
}

type BackendInit = Box<dyn Fn() -> Result<Arc<dyn SpectralBackend>, ExtractorError> + Send + Sync>;

/// Lazily initialized backend slot. Initialization runs at most once; a
/// failed initialization is remembered and the backend stays unavailable.
pub struct ExtractorCell {
    backend: OnceLock<Option<Arc<dyn SpectralBackend>>>,
    init: BackendInit,
}

impl ExtractorCell {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn SpectralBackend>, ExtractorError> + Send + Sync + 'static,
    {
        Self {
            backend: OnceLock::new(),
            init: Box::new(init),
        }
    }

    /// A cell that never yields a backend.
    pub fn unavailable() -> Self {
        Self::new(|| Err(ExtractorError::Unavailable("disabled".into())))
    }

    /// The process-wide cell holding the native backend.
    pub fn global() -> Arc<ExtractorCell> {
        static GLOBAL: OnceLock<Arc<ExtractorCell>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                Arc::new(ExtractorCell::new(|| {
                    let backend = NativeSpectralBackend::new()?;
                    Ok(Arc::new(backend) as Arc<dyn SpectralBackend>)
                }))
            })
            .clone()
    }

    /// The backend, initializing it on first use.
    pub fn backend(&self) -> Result<Arc<dyn SpectralBackend>, ExtractorError> {
        let slot = self.backend.get_or_init(|| match (self.init)() {
            Ok(backend) => {
                log::info!("Spectral backend '{}' ready", backend.name());
                Some(backend)
            }
            Err(e) => {
                log::warn!("Spectral backend failed to initialize: {}", e);
                None
            }
        });
        slot.clone()
            .ok_or_else(|| ExtractorError::Unavailable("initialization failed".into()))
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.get().is_some()
    }
}

impl fmt::Debug for ExtractorCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.backend.get() {
            None => "uninitialized",
            Some(Some(_)) => "ready",
            Some(None) => "unavailable",
        };
        f.debug_struct("ExtractorCell").field("state", &state).finish()
    }
}

/// Frame range analyzed by the extractor: the whole source when it fits in
/// `max_secs`, the first `max_secs` when it is up to twice that long, and a
/// centered `max_secs` window beyond.
pub fn analysis_window(frames: usize, sample_rate: u32, max_secs: u32) -> Range<usize> {
    let max_frames = sample_rate as usize * max_secs.max(1) as usize;
    if frames <= max_frames {
        0..frames
    } else if frames <= 2 * max_frames {
        0..max_frames
    } else {
        let start = (frames - max_frames) / 2;
        start..start + max_frames
    }
}

/// Key, mode and tempo of a buffer. The uploaded vector is released before
/// this returns, whatever the outcome.
pub fn extract(
    backend: &dyn SpectralBackend,
    buffer: &RawAudioBuffer,
    max_window_secs: u32,
) -> Result<AdvancedFeatureResult, ExtractorError> {
    let window = analysis_window(buffer.frames(), buffer.sample_rate(), max_window_secs);
    let analyzed_seconds = window.len() as f32 / buffer.sample_rate() as f32;
    log::debug!(
        "Extractor window {:.1}s-{:.1}s",
        window.start as f32 / buffer.sample_rate() as f32,
        window.end as f32 / buffer.sample_rate() as f32
    );

    let vector = {
        let samples = buffer.mixdown(window);
        AnalysisVector::upload(backend, &samples, buffer.sample_rate())?
    };

    let key = backend.key(vector.id())?;
    let bpm = backend.rhythm(vector.id())?;

    Ok(AdvancedFeatureResult {
        bpm: (bpm * 10.0).round() / 10.0,
        key: key.key,
        mode: key.mode,
        key_strength: key.strength,
        analyzed_seconds,
    })
}
