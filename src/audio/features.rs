use serde::{Deserialize, Serialize};

/// Stereo image of a track.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoImage {
    /// Side/mid energy ratio, 0.0 (mono) to 1.0
    pub width: f32,
    /// Left/right correlation, -1.0 to 1.0
    pub correlation: f32,
}

impl StereoImage {
    pub const MONO: StereoImage = StereoImage {
        width: 0.0,
        correlation: 1.0,
    };
}

/// Share of spectral energy per band, in percent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBalance {
    pub low: f32,  // 20-250 Hz
    pub mid: f32,  // 250-4000 Hz
    pub high: f32, // 4 kHz - Nyquist
    pub character: String,
}

impl Default for FrequencyBalance {
    fn default() -> Self {
        Self {
            low: 33.0,
            mid: 33.0,
            high: 33.0,
            character: "Flat".into(),
        }
    }
}

/// Output of the background analysis worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFeatureResult {
    /// Tempo in BPM, 0.0 when no beat was found
    pub bpm: f32,
    /// Integrated loudness (LUFS)
    pub loudness_db: f32,
    pub brightness: String,
    /// Oversampled peak in dBTP; above 0.0 means clipping risk
    pub true_peak: f32,
    /// 0.0-1.0
    pub energy: f32,
    pub stereo: StereoImage,
    pub balance: FrequencyBalance,
}

impl WorkerFeatureResult {
    /// Values reported when the worker fails, so callers never see holes.
    pub fn fallback() -> Self {
        Self {
            bpm: 0.0,
            loudness_db: -20.0,
            brightness: "Unknown".into(),
            true_peak: 0.0,
            energy: 0.0,
            stereo: StereoImage {
                width: 0.0,
                correlation: 0.0,
            },
            balance: FrequencyBalance::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Major,
    Minor,
}

/// Output of the optional spectral extractor.
#[derive(Clone, Debug, PartialEq)]
pub struct AdvancedFeatureResult {
    pub bpm: f32,
    pub key: String,
    pub mode: Mode,
    pub key_strength: f32,
    /// Length of the window the backend actually analyzed
    pub analyzed_seconds: f32,
}

/// Which backend produced `bpm` and `key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Advanced,
    Native,
    /// Set by callers that replace the values with a model estimate.
    #[serde(rename = "AI Estimate")]
    AiEstimate,
}

/// The canonical feature record handed to tagging, validation and prompting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFeatures {
    pub bpm: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    /// Seconds, from the decoded buffer, two decimals
    pub duration: f64,
    pub method: Method,
    pub loudness_db: f32,
    pub energy: f32,
    pub brightness: String,
    pub true_peak: f32,
    pub stereo: StereoImage,
    pub balance: FrequencyBalance,
}
