//! Tracing subscriber bootstrap.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::ValueEnum;
use intercept_core::{OutputLayout, RunId};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub verbosity: u8,
    pub nolog: bool,
    pub silent: bool,
    pub format: LogFormat,
    pub output_dir: PathBuf,
}

/// Directive for `-v` count: error, warn, info, then debug.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

/// `RUST_LOG` wins over `-v`; `--nolog` turns everything off.
fn filter(options: &LogOptions) -> anyhow::Result<EnvFilter> {
    if options.nolog {
        return Ok(EnvFilter::new("off"));
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_for(options.verbosity)))
        .context("failed to create log filter")
}

pub fn init(options: &LogOptions, run_id: &RunId) -> anyhow::Result<()> {
    let filter = filter(options)?;

    let (writer, ansi) = if options.silent && !options.nolog {
        let path = OutputLayout::new(options.output_dir.clone()).diagnostics_log(run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        (BoxMakeWriter::new(Mutex::new(file)), false)
    } else {
        (BoxMakeWriter::new(std::io::stderr), true)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);

    let installed = match options.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for(0), "error");
        assert_eq!(level_for(1), "warn");
        assert_eq!(level_for(2), "info");
        assert_eq!(level_for(7), "debug");
    }
}
