use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::{LogFormat, LogOptions};

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(
    name = "intercept",
    version,
    about = "Policy as code compliance engine with SARIF output"
)]
pub struct Cli {
    /// Increase log verbosity (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for reports, logs and scratch files
    #[arg(short = 'o', long = "output-dir", visible_alias = "output", global = true, default_value = ".")]
    pub output_dir: PathBuf,

    /// Write diagnostics to log_intercept_<run>.log instead of stderr
    #[arg(long, global = true)]
    pub silent: bool,

    /// Disable diagnostics entirely
    #[arg(long, global = true)]
    pub nolog: bool,

    /// Report outputs (SARIF, LOG, REPORT), comma separated
    #[arg(long, global = true, value_delimiter = ',', default_value = "SARIF")]
    pub output_type: Vec<String>,

    /// Active config file (default: ./config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub cmd: Command,
}

impl Cli {
    pub fn logging(&self) -> LogOptions {
        LogOptions {
            verbosity: self.verbose,
            nolog: self.nolog,
            silent: self.silent,
            format: self.log_format,
            output_dir: self.output_dir.clone(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Evaluate every selected policy once and write a merged report
    Audit(AuditArgs),
    /// Re-evaluate policies on a schedule or when watched files change
    Observe(ObserveArgs),
    /// Merge a YAML overlay into the active config file
    Config(ConfigArgs),
    /// Check whether a newer release exists
    Update,
    /// Print build info
    Version,
    /// Show versions of the external helper tools
    Sys,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AuditArgs {
    /// Policy bundle path or http(s) URL (default: the active config file)
    #[arg(short, long)]
    pub policy: Option<String>,

    /// Expected SHA-256 of the policy bundle
    #[arg(long)]
    pub checksum: Option<String>,

    /// Directory to evaluate
    #[arg(short, long)]
    pub target: Option<PathBuf>,

    /// Keep policies tagged with any of these (comma separated)
    #[arg(long = "tags_any", visible_alias = "tags-any", default_value = "")]
    pub tags_any: String,

    /// Keep policies tagged with all of these (comma separated)
    #[arg(long = "tags_all", visible_alias = "tags-all", default_value = "")]
    pub tags_all: String,

    /// Active environment for enforcement selection
    #[arg(short, long, default_value = "")]
    pub environment: String,

    /// Detect the environment from common variables when --environment is empty
    #[arg(long = "env-detection")]
    pub env_detection: bool,

    /// Additional ignore rules (*.ext, dir/, or path prefix)
    #[arg(long)]
    pub ignore: Vec<String>,

    /// Write scan manifests and evaluation traces to _debug
    #[arg(long)]
    pub debug: bool,

    /// Exit 1 when a fatal-severity result fires
    #[arg(long = "break", default_value_t = true, action = ArgAction::Set)]
    pub break_on_fatal: bool,

    /// Maximum concurrent policy evaluations
    #[arg(long, default_value_t = intercept_core::engine::DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Reuse results for identical inputs within the cache TTL
    #[arg(long)]
    pub cache: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ObserveArgs {
    #[command(flatten)]
    pub run: AuditArgs,

    /// Cron expression for policies without their own schedule
    #[arg(long)]
    pub schedule: Option<String>,

    /// Cron expression for the merged status report
    #[arg(long)]
    pub report: Option<String>,

    /// Debounce mode for watched paths: first, last or all
    #[arg(long, default_value = "first")]
    pub mode: String,

    /// Index name for bulk hook payloads
    #[arg(long)]
    pub index: Option<String>,

    /// Provision the remote endpoint host key under _rpe
    #[arg(long)]
    pub remote: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ConfigArgs {
    /// YAML file whose top-level keys override the active config
    #[arg(short, long)]
    pub add: Option<PathBuf>,

    /// Delete the active config before applying --add
    #[arg(short, long)]
    pub reset: bool,
}
