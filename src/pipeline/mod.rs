//! Decode, analyze on both backends, merge.

pub mod merge;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::audio::decode::{self, RawAudioBuffer};
use crate::audio::features::AudioFeatures;
use crate::audio::worker::{self, Engine, WorkerHandle, WorkerRequest};
use crate::config::AnalysisConfig;
use crate::error::DecodeError;
use crate::extractor::{self, ExtractorCell};

pub use merge::{merge, BackendOutcome};

/// Lifecycle of one analysis, logged at debug level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Decoding,
    WorkerRunning,
    ExtractorRunning,
    Skipped,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decoding => "decoding",
            Stage::WorkerRunning => "worker running",
            Stage::ExtractorRunning => "extractor running",
            Stage::Skipped => "extractor skipped",
            Stage::Merging => "merging",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn enter(stage: Stage) {
    log::debug!("Analysis stage: {}", stage);
}

/// Runs analyses one at a time. Holds a handle to the shared extractor cell,
/// so constructing many analyzers never initializes the backend twice.
#[derive(Clone)]
pub struct Analyzer {
    config: AnalysisConfig,
    extractor: Arc<ExtractorCell>,
    engine: Engine,
}

impl fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyzer")
            .field("config", &self.config)
            .field("extractor", &self.extractor)
            .finish_non_exhaustive()
    }
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        let extractor = if config.advanced {
            ExtractorCell::global()
        } else {
            Arc::new(ExtractorCell::unavailable())
        };
        Self::with_extractor(config, extractor)
    }

    pub fn with_extractor(config: AnalysisConfig, extractor: Arc<ExtractorCell>) -> Self {
        Self {
            config,
            extractor,
            engine: worker::run_analysis,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn analyze_file(&self, path: &Path) -> Result<AudioFeatures, DecodeError> {
        enter(Stage::Decoding);
        let buffer = decode::decode_file(path).inspect_err(|_| enter(Stage::Failed))?;
        Ok(self.analyze_buffer(&buffer))
    }

    /// Analyze an in-memory encoded file. `extension` helps format probing.
    pub fn analyze_bytes(&self, bytes: Vec<u8>, extension: Option<&str>) -> Result<AudioFeatures, DecodeError> {
        enter(Stage::Decoding);
        let buffer = decode::decode_bytes(bytes, extension).inspect_err(|_| enter(Stage::Failed))?;
        Ok(self.analyze_buffer(&buffer))
    }

    /// Analyze decoded audio. Backend failures are absorbed into the record.
    pub fn analyze_buffer(&self, buffer: &RawAudioBuffer) -> AudioFeatures {
        log::info!(
            "Analyzing {:.2}s, {} Hz, {} channel(s)",
            buffer.duration_secs(),
            buffer.sample_rate(),
            buffer.channel_count()
        );

        // The worker gets shared handles; `buffer` stays intact for the extractor
        enter(Stage::WorkerRunning);
        let worker = WorkerHandle::spawn_with(WorkerRequest::from_buffer(buffer), self.engine);

        let advanced = match self.extractor.backend() {
            Ok(backend) => {
                enter(Stage::ExtractorRunning);
                let outcome = BackendOutcome::from(extractor::extract(
                    backend.as_ref(),
                    buffer,
                    self.config.max_window_secs,
                ));
                if let BackendOutcome::Failed(reason) = &outcome {
                    log::warn!("Spectral extractor failed, using worker tempo: {}", reason);
                }
                outcome
            }
            Err(e) => {
                enter(Stage::Skipped);
                log::debug!("Spectral extractor skipped: {}", e);
                BackendOutcome::Unavailable
            }
        };

        let worker = match worker.and_then(|handle| handle.wait(self.config.worker_timeout())) {
            Ok(result) => BackendOutcome::Ok(result),
            Err(e) => {
                log::warn!("DSP worker failed, using defaults: {}", e);
                BackendOutcome::Failed(e.to_string())
            }
        };

        enter(Stage::Merging);
        let features = merge(buffer.duration_secs(), buffer.channel_count(), worker, advanced);
        enter(Stage::Done);

        log::info!(
            "Result: {:?}, {:.1} BPM, key={}, {:.1} LUFS",
            features.method,
            features.bpm,
            features.key.as_deref().unwrap_or("-"),
            features.loudness_db
        );
        features
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(AnalysisConfig::default())
    }
}

/// One-shot analysis of a file with default settings.
pub fn analyze_audio_features(path: impl AsRef<Path>) -> Result<AudioFeatures, DecodeError> {
    Analyzer::default().analyze_file(path.as_ref())
}
