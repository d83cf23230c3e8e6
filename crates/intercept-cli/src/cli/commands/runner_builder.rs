//! Shared setup for `audit` and `observe`: load the bundle, resolve flags,
//! build the engine.

use anyhow::{bail, Context};
use intercept_core::{
    detect_environment, load_bundle, Engine, EngineSettings, PolicyFilter, RunId, ToolPaths,
};
use tracing::info;

use super::GlobalOpts;
use crate::cli::args::AuditArgs;

pub(crate) struct Prepared {
    pub engine: Engine,
    pub filter: PolicyFilter,
}

/// `--environment`, else a detected one when `--env-detection` is set.
pub(crate) fn resolve_environment(args: &AuditArgs) -> String {
    let explicit = args.environment.trim();
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    if args.env_detection {
        if let Some(detected) = detect_environment() {
            info!(environment = %detected, "environment detected");
            return detected;
        }
    }
    String::new()
}

/// CLI output types plus the bundle's, without duplicates.
pub(crate) fn merge_output_types(cli: &[String], bundle: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for kind in cli.iter().chain(bundle) {
        let kind = kind.trim().to_ascii_uppercase();
        if !kind.is_empty() && !merged.contains(&kind) {
            merged.push(kind);
        }
    }
    merged
}

pub(crate) async fn build(
    args: &AuditArgs,
    global: &GlobalOpts,
    run_id: RunId,
    index: Option<&str>,
) -> anyhow::Result<Prepared> {
    let reference = match &args.policy {
        Some(policy) => policy.clone(),
        None => {
            if !global.config_file.is_file() {
                bail!(
                    "no policy bundle: pass --policy or create {} with `intercept config --add`",
                    global.config_file.display()
                );
            }
            global.config_file.display().to_string()
        }
    };

    let loaded = load_bundle(&reference, args.checksum.as_deref(), &run_id)
        .await
        .with_context(|| format!("failed to load policy bundle {reference}"))?;
    info!(
        source = %loaded.source,
        digest = %loaded.digest,
        policies = loaded.bundle.policies.len(),
        "policy bundle loaded"
    );

    let mut bundle = loaded.bundle;
    if let Some(index) = index.map(str::trim).filter(|i| !i.is_empty()) {
        bundle.config.flags.index = Some(index.to_string());
    }

    let environment = resolve_environment(args);
    let output_types = merge_output_types(&global.output_types, &bundle.config.flags.output_type);
    let settings = EngineSettings {
        output_dir: global.output_dir.clone(),
        environment: environment.clone(),
        debug: args.debug,
        concurrency: args.concurrency.max(1),
        tools: ToolPaths::from_env(),
        break_on_fatal: args.break_on_fatal,
        output_types,
        command_line: std::env::args().collect::<Vec<_>>().join(" "),
        target: args.target.clone(),
        ignore: args.ignore.clone(),
        cache_results: args.cache,
        ..Default::default()
    };

    let engine = Engine::builder(bundle, settings).run_id(run_id).build()?;
    let filter = PolicyFilter {
        tags_any: args.tags_any.clone(),
        tags_all: args.tags_all.clone(),
        environment,
    };
    Ok(Prepared { engine, filter })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_types_merge_case_insensitively() {
        let merged = merge_output_types(
            &["SARIF".to_string()],
            &["sarif".to_string(), "log".to_string(), " ".to_string()],
        );
        assert_eq!(merged, vec!["SARIF", "LOG"]);
    }
}
