//! `intercept config`: maintain the active config file.

use std::path::Path;

use anyhow::{bail, Context};
use serde_yaml::{Mapping, Value};
use tracing::info;

use super::GlobalOpts;
use crate::cli::args::ConfigArgs;
use crate::exit_codes;

pub fn run(args: ConfigArgs, global: &GlobalOpts) -> anyhow::Result<i32> {
    let active = &global.config_file;

    if args.reset && active.is_file() {
        std::fs::remove_file(active)
            .with_context(|| format!("failed to remove {}", active.display()))?;
        info!(config = %active.display(), "config reset");
        println!("Config cleared: {}", active.display());
    }

    let Some(overlay) = args.add else {
        if !args.reset {
            println!("No updates detected");
        }
        return Ok(exit_codes::SUCCESS);
    };
    if !overlay.is_file() {
        bail!("config overlay not found: {}", overlay.display());
    }

    let merged = merge_into(active, &overlay)?;
    let rendered = serde_yaml::to_string(&Value::Mapping(merged))?;
    std::fs::write(active, &rendered)
        .with_context(|| format!("failed to write {}", active.display()))?;
    info!(config = %active.display(), overlay = %overlay.display(), "config updated");
    println!("Config file updated: {}", active.display());
    print!("{rendered}");
    Ok(exit_codes::SUCCESS)
}

fn read_mapping(path: &Path) -> anyhow::Result<Mapping> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    match serde_yaml::from_str::<Value>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?
    {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        _ => bail!("{} is not a YAML mapping", path.display()),
    }
}

/// Top-level keys of `overlay` replace those of `active`.
fn merge_into(active: &Path, overlay: &Path) -> anyhow::Result<Mapping> {
    let mut master = if active.is_file() {
        read_mapping(active)?
    } else {
        Mapping::new()
    };
    for (key, value) in read_mapping(overlay)? {
        master.insert(key, value);
    }
    Ok(master)
}
