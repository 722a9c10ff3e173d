use std::fmt;

use crate::audio::features::{AdvancedFeatureResult, AudioFeatures, Method, StereoImage, WorkerFeatureResult};

/// What a backend delivered for one analysis.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendOutcome<T> {
    Ok(T),
    /// The backend was disabled or never came up.
    Unavailable,
    Failed(String),
}

impl<T> BackendOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            BackendOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }
}

impl<T, E: fmt::Display> From<Result<T, E>> for BackendOutcome<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => BackendOutcome::Ok(value),
            Err(e) => BackendOutcome::Failed(e.to_string()),
        }
    }
}

/// Combine both backends into the final record.
///
/// | worker  | extractor | bpm       | key/mode  | method   |
/// |---------|-----------|-----------|-----------|----------|
/// | any     | Ok        | extractor | extractor | Advanced |
/// | Ok      | not Ok    | worker    | none      | Native   |
/// | not Ok  | not Ok    | 0         | none      | Native   |
///
/// Loudness, brightness, true peak, energy, stereo and balance always come
/// from the worker, or its fallback values when it did not answer. A mono
/// source reads as `StereoImage::MONO` either way.
pub fn merge(
    duration_secs: f64,
    channels: usize,
    worker: BackendOutcome<WorkerFeatureResult>,
    advanced: BackendOutcome<AdvancedFeatureResult>,
) -> AudioFeatures {
    let mut worker = worker.ok().unwrap_or_else(WorkerFeatureResult::fallback);
    if channels < 2 {
        worker.stereo = StereoImage::MONO;
    }

    let (bpm, key, mode, method) = match advanced {
        BackendOutcome::Ok(adv) => (adv.bpm, Some(adv.key), Some(adv.mode), Method::Advanced),
        BackendOutcome::Unavailable | BackendOutcome::Failed(_) => (worker.bpm, None, None, Method::Native),
    };

    AudioFeatures {
        bpm,
        key,
        mode,
        duration: (duration_secs * 100.0).round() / 100.0,
        method,
        loudness_db: worker.loudness_db,
        energy: worker.energy,
        brightness: worker.brightness,
        true_peak: worker.true_peak,
        stereo: worker.stereo,
        balance: worker.balance,
    }
}
