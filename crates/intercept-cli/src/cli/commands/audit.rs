use std::sync::Arc;

use intercept_core::model::ConfigMetadata;
use intercept_core::{run_audit, AuditSummary, Dispatcher, RunId};

use super::runner_builder;
use super::GlobalOpts;
use crate::cli::args::AuditArgs;

pub async fn run(args: AuditArgs, global: &GlobalOpts, run_id: RunId) -> anyhow::Result<i32> {
    let prepared = runner_builder::build(&args, global, run_id, None).await?;
    let metadata = prepared.engine.bundle().config.metadata.clone();
    let engine = Arc::new(prepared.engine);

    let summary = run_audit(engine, Arc::new(Dispatcher::standard()), &prepared.filter).await?;
    if !global.silent {
        print_summary(&summary, &metadata);
    }
    Ok(summary.exit_code())
}

/// Exit banner: the bundle's message for the outcome, or a default.
pub(crate) fn exit_message(summary: &AuditSummary, metadata: &ConfigMetadata) -> String {
    let (custom, fallback) = if summary.has_fatal() {
        (&metadata.msg_exit_critical, "Fatal policy violations detected")
    } else if !summary.is_compliant() {
        (&metadata.msg_exit_warning, "Policy violations detected")
    } else {
        (&metadata.msg_exit_clean, "All policies compliant")
    };
    custom
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn print_summary(summary: &AuditSummary, metadata: &ConfigMetadata) {
    let failing = summary.outcomes.iter().filter(|o| !o.compliant).count();
    println!(
        "Policies evaluated: {} ({} non-compliant)",
        summary.outcomes.len(),
        failing
    );
    if let Some(report) = &summary.report {
        println!("Report: {}", report.path.display());
    }
    println!("{}", exit_message(summary, metadata));
}
