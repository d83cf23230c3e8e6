use super::args::*;

pub mod audit;
pub mod config;
pub mod observe;
pub(crate) mod runner_builder;
pub mod sys;
pub mod update;
pub mod version;

use intercept_core::RunId;
use std::path::PathBuf;

/// Flags every command may read.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub output_dir: PathBuf,
    pub output_types: Vec<String>,
    pub config_file: PathBuf,
    pub silent: bool,
}

pub async fn dispatch(cli: Cli, run_id: RunId) -> anyhow::Result<i32> {
    let global = GlobalOpts {
        output_dir: cli.output_dir.clone(),
        output_types: cli.output_type.clone(),
        config_file: cli.config_file(),
        silent: cli.silent,
    };
    match cli.cmd {
        Command::Audit(args) => audit::run(args, &global, run_id).await,
        Command::Observe(args) => observe::run(args, &global, run_id).await,
        Command::Config(args) => config::run(args, &global),
        Command::Update => update::run().await,
        Command::Version => Ok(version::run()),
        Command::Sys => sys::run().await,
    }
}
