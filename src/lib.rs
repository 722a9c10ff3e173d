//! Audio feature extraction: tempo, key, loudness, true peak, stereo image
//! and spectral balance for a single file, as one JSON-ready record.

pub mod audio;
pub mod config;
pub mod error;
pub mod extractor;
pub mod pipeline;

pub use audio::decode::{decode_bytes, decode_file, RawAudioBuffer};
pub use audio::features::{AudioFeatures, FrequencyBalance, Method, Mode, StereoImage};
pub use config::{AnalysisConfig, Config};
pub use error::{DecodeError, ExtractorError, WorkerError};
pub use pipeline::{analyze_audio_features, Analyzer};
