use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tunetag", about = "Extract tempo, key, loudness and spectral features from audio files")]
pub struct Cli {
    /// Input audio files (WAV, MP3, FLAC, OGG, M4A)
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Skip the spectral extractor (no key/mode, worker tempo only)
    #[arg(long)]
    pub no_advanced: bool,

    /// Seconds to wait for the DSP worker before falling back to defaults
    #[arg(long, value_name = "SECS")]
    pub worker_timeout: Option<u64>,

    /// Longest window the spectral extractor analyzes, in seconds
    #[arg(long, value_name = "SECS")]
    pub max_window: Option<u32>,

    /// Print compact JSON instead of pretty-printed
    #[arg(long)]
    pub compact: bool,

    /// Config file (defaults to ./tunetag.toml or the user config dir)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}
