use std::time::Duration;

use thiserror::Error;

/// Fatal failure to turn an input into PCM. The only error an analysis
/// surfaces to its caller.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The source could not be read (missing file, permissions, I/O).
    #[error("file unreadable: {0}")]
    Unreadable(#[from] std::io::Error),

    /// The bytes were read but are not decodable audio.
    #[error("unsupported format: {0}")]
    Unsupported(String),
}

impl DecodeError {
    /// True when the source itself could not be read, as opposed to holding
    /// bytes that are not decodable audio.
    pub fn is_unreadable(&self) -> bool {
        matches!(self, DecodeError::Unreadable(_))
    }
}

/// Failure of the background analysis worker. Recovered with defaults.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker analysis failed: {0}")]
    Compute(String),

    #[error("worker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("worker exited without a response")]
    Disconnected,

    #[error("worker analysis aborted")]
    Aborted,
}

/// Failure of the optional spectral backend. Recovered by falling back to
/// worker-only results.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractorError {
    #[error("spectral backend unavailable: {0}")]
    Unavailable(String),

    #[error("spectral analysis failed: {0}")]
    Compute(String),
}
