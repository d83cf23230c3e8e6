//! One-shot audit: filter, scan once, evaluate in a bounded pool, merge.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{Dispatcher, PolicyOutcome};
use crate::engine::Engine;
use crate::error::{InterceptError, InterceptResult};
use crate::eval::PolicyJob;
use crate::filter::PolicyFilter;
use crate::model::{normalize_filename, Policy};
use crate::sarif::MergedReport;
use crate::target::{filter_by_pattern, scan_target, write_manifest, ScannedFile};

/// Everything an audit produced.
#[derive(Debug)]
pub struct AuditSummary {
    pub outcomes: Vec<PolicyOutcome>,
    pub report: Option<MergedReport>,
    pub break_on_fatal: bool,
}

impl AuditSummary {
    pub fn is_compliant(&self) -> bool {
        match &self.report {
            Some(report) => report.is_compliant(),
            None => self.outcomes.iter().all(|o| o.compliant),
        }
    }

    pub fn has_fatal(&self) -> bool {
        self.outcomes.iter().any(|o| o.fatal)
    }

    /// `1` when a fatal result fired and breaking is enabled, else `0`.
    pub fn exit_code(&self) -> i32 {
        if self.break_on_fatal && self.has_fatal() {
            1
        } else {
            0
        }
    }
}

/// Work item for the pool: a ready job or a policy that failed before evaluation.
enum Task {
    Evaluate(PolicyJob),
    Failed(Policy, String),
}

/// Run every policy selected by `filter` and merge the results.
pub async fn run_audit(
    engine: Arc<Engine>,
    dispatcher: Arc<Dispatcher>,
    filter: &PolicyFilter,
) -> InterceptResult<AuditSummary> {
    let layout = engine.layout();
    layout.ensure_writable()?;
    layout.prepare(false)?;
    layout.clear_scratch()?;

    let policies = filter.apply(engine.bundle().policies.clone());
    info!(
        run_id = %engine.run_id(),
        policies = policies.len(),
        environment = %engine.environment(),
        "starting audit"
    );

    let target = engine.target_dir();
    let scanned: Result<Vec<ScannedFile>, String> = if policies.iter().any(|p| p.kind.needs_target()) {
        match &target {
            Some(dir) => scan_target(dir, &engine.ignore_rules()).map_err(|e| e.to_string()),
            None => Err("no target directory configured".to_string()),
        }
    } else {
        Ok(Vec::new())
    };
    if let Err(e) = &scanned {
        warn!(error = %e, "target scan failed");
    }

    let tasks = policies
        .into_iter()
        .map(|policy| prepare(&engine, policy, target.clone(), &scanned))
        .collect::<Vec<_>>();

    let outcomes = run_pool(engine.clone(), dispatcher, tasks).await;

    let report = engine.merge(false)?;
    if let Some(merged) = &report {
        if !engine.sinks().is_empty() {
            engine.sinks().report_completed(&merged.report).await;
        }
    }

    let summary = AuditSummary {
        outcomes,
        report,
        break_on_fatal: engine.settings().break_on_fatal,
    };
    info!(
        compliant = summary.is_compliant(),
        fatal = summary.has_fatal(),
        "audit complete"
    );
    Ok(summary)
}

fn prepare(
    engine: &Engine,
    policy: Policy,
    target: Option<std::path::PathBuf>,
    scanned: &Result<Vec<ScannedFile>, String>,
) -> Task {
    if !policy.kind.needs_target() {
        return Task::Evaluate(PolicyJob::new(policy, target, Vec::new()));
    }
    let files = match scanned {
        Ok(files) => files,
        Err(e) => return Task::Failed(policy, e.clone()),
    };
    let files = match filter_by_pattern(files, policy.file_pattern.as_deref()) {
        Ok(files) => files,
        Err(e) => return Task::Failed(policy, e.to_string()),
    };
    if engine.debug() {
        let name = normalize_filename(&policy.id);
        if let Err(e) = write_manifest(&engine.layout().debug_dir(), &name, &files) {
            warn!(policy = %policy.id, error = %e, "failed to write scan manifest");
        }
    }
    Task::Evaluate(PolicyJob::new(policy, target, files))
}

async fn run_pool(engine: Arc<Engine>, dispatcher: Arc<Dispatcher>, tasks: Vec<Task>) -> Vec<PolicyOutcome> {
    let sem = Arc::new(Semaphore::new(engine.settings().concurrency.max(1)));
    let mut join_set = JoinSet::new();

    for task in tasks {
        let permit = match sem.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "worker pool closed");
                break;
            }
        };
        let engine = engine.clone();
        let dispatcher = dispatcher.clone();
        join_set.spawn(async move {
            let _permit = permit;
            match task {
                Task::Evaluate(job) => dispatcher.run_policy(&engine, job).await,
                Task::Failed(policy, message) => {
                    dispatcher.record_failure(&engine, &policy, &message).await
                }
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                let err = InterceptError::evaluator("unknown", format!("join error: {e}"));
                error!(error = %err, "policy task aborted");
            }
        }
    }
    outcomes.sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::host::HostIdentity;
    use crate::model::{Bundle, Enforcement, PolicyType};
    use crate::sarif::SarifResult;
    use crate::severity::SarifLevel;

    fn policy(id: &str, fatal: &str) -> Policy {
        Policy {
            id: id.into(),
            kind: PolicyType::Scan,
            enforcement: vec![Enforcement {
                environment: "all".into(),
                fatal: fatal.into(),
                exceptions: "false".into(),
                confidence: "high".into(),
            }],
            ..Default::default()
        }
    }

    fn engine(dir: &std::path::Path, policies: Vec<Policy>, target: Option<std::path::PathBuf>) -> Arc<Engine> {
        let bundle = Bundle {
            policies,
            ..Default::default()
        };
        let settings = EngineSettings {
            output_dir: dir.join("out"),
            target,
            ..Default::default()
        };
        Arc::new(
            Engine::builder(bundle, settings)
                .host(HostIdentity::from_parts("h", "linux", "x86_64"))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn missing_target_is_a_result_not_an_abort() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            vec![policy("a", "true"), policy("b", "false")],
            Some(dir.path().join("missing")),
        );
        let summary = run_audit(engine, Arc::new(Dispatcher::standard()), &PolicyFilter::default())
            .await
            .unwrap();

        assert_eq!(summary.outcomes.len(), 2);
        assert!(!summary.is_compliant());
        assert_eq!(summary.exit_code(), 1);

        let report = summary.report.unwrap();
        let summaries: Vec<&SarifResult> = report.report.results().filter(|r| r.is_summary()).collect();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|r| r.level == SarifLevel::Error));
        let name = report.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("intercept_") && name.ends_with(".sarif.json"), "{name}");
    }

    #[test]
    fn break_false_keeps_exit_zero() {
        let summary = AuditSummary {
            outcomes: vec![PolicyOutcome {
                policy_id: "a".into(),
                compliant: false,
                fatal: true,
                results: 1,
                cached: false,
            }],
            report: None,
            break_on_fatal: false,
        };
        assert_eq!(summary.exit_code(), 0);
        assert!(!summary.is_compliant());
    }
}
