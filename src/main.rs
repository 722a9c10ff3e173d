mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use cli::Cli;
use tunetag::config::{self, Config};
use tunetag::{Analyzer, AudioFeatures};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect tunetag.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("tunetag.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("tunetag").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("tunetag").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let mut cfg = match config_path {
        Some(ref path) => match config::load_config(path) {
            Some(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            None => {
                log::warn!("Failed to load config from {}", path.display());
                Config::default()
            }
        },
        None => Config::default(),
    };

    // Merge: flags given on the command line win over the config file
    if cli.no_advanced {
        cfg.analysis.advanced = false;
    }
    if let Some(secs) = cli.worker_timeout {
        cfg.analysis.worker_timeout_secs = secs;
    }
    if let Some(secs) = cli.max_window {
        cfg.analysis.max_window_secs = secs;
    }
    if cli.compact {
        cfg.output.pretty = false;
    }

    log::info!("tunetag - audio feature extraction");
    log::info!(
        "Inputs: {}, extractor: {}, worker timeout: {}s",
        cli.inputs.len(),
        if cfg.analysis.advanced { "on" } else { "off" },
        cfg.analysis.worker_timeout_secs
    );

    let analyzer = Analyzer::new(cfg.analysis.clone());

    let pb = if cli.inputs.len() > 1 {
        let pb = ProgressBar::new(cli.inputs.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({eta}) {msg}")
                .context("Invalid progress template")?
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let mut results: Vec<AudioFeatures> = Vec::with_capacity(cli.inputs.len());
    let mut failures = 0usize;
    for input in &cli.inputs {
        if let Some(ref pb) = pb {
            pb.set_message(input.display().to_string());
        }
        match analyzer.analyze_file(input) {
            Ok(features) => results.push(features),
            Err(e) => {
                failures += 1;
                let line = format!("{}: {}", input.display(), e);
                match pb {
                    Some(ref pb) => pb.println(line),
                    None => eprintln!("{}", line),
                }
            }
        }
        if let Some(ref pb) = pb {
            pb.inc(1);
        }
    }
    if let Some(pb) = pb {
        pb.finish_with_message("done");
    }

    let json = match (results.len(), cli.inputs.len()) {
        (0, _) => None,
        (1, 1) => Some(render(&results[0], cfg.output.pretty)?),
        _ => Some(render(&results, cfg.output.pretty)?),
    };
    if let Some(json) = json {
        println!("{}", json);
    }

    if failures > 0 {
        anyhow::bail!("{} of {} input(s) could not be decoded", failures, cli.inputs.len());
    }
    Ok(())
}

fn render<T: serde::Serialize>(value: &T, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    json.context("Failed to serialize features")
}
