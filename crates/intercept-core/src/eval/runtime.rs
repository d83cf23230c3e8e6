//! Host assertions through an external prober (goss).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::{Evaluator, PolicyJob};
use crate::engine::Engine;
use crate::sarif::{Location, ResultFactory, SarifResult};
use crate::severity::SarifLevel;

/// One probe record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Probe {
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub result: i64,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub successful: bool,
    #[serde(default)]
    pub summary_line: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProbeSummary {
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub skipped_count: u64,
    #[serde(default)]
    pub summary_line: String,
    #[serde(default)]
    pub test_count: u64,
    #[serde(default)]
    pub total_duration: i64,
}

/// Parsed prober output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub results: Vec<Probe>,
    #[serde(default)]
    pub summary: ProbeSummary,
}

#[async_trait]
pub trait RuntimeProber: Send + Sync {
    async fn probe(&self, config: &Path) -> anyhow::Result<ProbeReport>;
}

/// Runs `goss -g <config> validate --format json`.
#[derive(Debug, Clone)]
pub struct GossProber {
    goss_path: PathBuf,
}

impl GossProber {
    pub fn new(goss_path: impl Into<PathBuf>) -> Self {
        Self {
            goss_path: goss_path.into(),
        }
    }

    fn args(config: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if cfg!(any(target_os = "macos", target_os = "windows")) {
            args.push("--use-alpha=1".to_string());
        }
        args.extend([
            "-g".to_string(),
            config.display().to_string(),
            "validate".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ]);
        args
    }
}

#[async_trait]
impl RuntimeProber for GossProber {
    async fn probe(&self, config: &Path) -> anyhow::Result<ProbeReport> {
        let args = Self::args(config);
        debug!(goss = %self.goss_path.display(), args = ?args, "running runtime probe");
        let output = Command::new(&self.goss_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.goss_path.display()))?;

        // Exit code 1 only means some probes failed; the JSON decides.
        serde_json::from_slice(&output.stdout).with_context(|| {
            format!(
                "failed to parse goss output (exit {:?}): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )
        })
    }
}

/// Resolve the policy's prober config against the working directory.
fn config_path(raw: &str) -> anyhow::Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("runtime config path is not specified in the policy");
    }
    let path = PathBuf::from(raw);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("failed to read current directory")?
            .join(path)
    };
    if !path.exists() {
        bail!("runtime config file does not exist: {}", path.display());
    }
    Ok(path)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeEvaluator;

impl RuntimeEvaluator {
    /// Results for a probe report: one per probe, then the summary.
    pub fn results(factory: &ResultFactory<'_>, report: &ProbeReport) -> Vec<SarifResult> {
        let failing = factory.failing_level();
        let mut results: Vec<SarifResult> = report
            .results
            .iter()
            .map(|probe| {
                let level = match (probe.successful, probe.skipped) {
                    (true, false) => SarifLevel::Note,
                    (true, true) => SarifLevel::Warning,
                    (false, _) => failing,
                };
                let message = match probe.err.as_ref().filter(|e| !e.is_null()) {
                    Some(serde_json::Value::String(err)) => format!("Error: {err}"),
                    Some(err) => format!("Error: {err}"),
                    None => probe.summary_line.clone(),
                };
                let mut result = factory.detail(level, message, vec![Location::uri(probe.resource_id.clone())]);
                result.properties.resource_type = Some(probe.resource_type.clone());
                result.properties.property = Some(probe.property.clone());
                result
            })
            .collect();

        let level = if report.summary.failed_count > 0 {
            failing
        } else {
            SarifLevel::Note
        };
        results.push(factory.summary(
            level,
            report.summary.summary_line.clone(),
            vec![Location::not_applicable()],
        ));
        results
    }
}

#[async_trait]
impl Evaluator for RuntimeEvaluator {
    async fn evaluate(&self, engine: &Engine, job: &PolicyJob) -> anyhow::Result<Vec<SarifResult>> {
        let policy = &job.policy;
        let config = config_path(&policy.runtime.config)?;
        let report = engine.prober().probe(&config).await?;
        debug!(
            policy = %policy.id,
            tests = report.summary.test_count,
            failed = report.summary.failed_count,
            "runtime probe finished"
        );
        let factory = ResultFactory::new(policy, engine.environment());
        Ok(Self::results(&factory, &report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Enforcement, Policy, PolicyType};

    const GOSS_OUTPUT: &str = r#"{
      "results": [
        {"duration": 10, "err": null, "property": "installed", "resource-id": "nginx",
         "resource-type": "Package", "result": 0, "skipped": false, "successful": true,
         "summary-line": "Package: nginx: installed: matches expectation: true", "title": ""},
        {"duration": 3, "err": null, "property": "listening", "resource-id": "tcp:443",
         "resource-type": "Port", "result": 1, "skipped": false, "successful": false,
         "summary-line": "Port: tcp:443: listening: Expected false to equal true", "title": ""},
        {"duration": 0, "err": "permission denied", "property": "exists", "resource-id": "/etc/shadow",
         "resource-type": "File", "result": 1, "skipped": false, "successful": false,
         "summary-line": "", "title": ""},
        {"duration": 0, "err": null, "property": "running", "resource-id": "sshd",
         "resource-type": "Service", "result": 2, "skipped": true, "successful": true,
         "summary-line": "Service: sshd: running: skipped", "title": ""}
      ],
      "summary": {"failed-count": 2, "skipped-count": 1,
                  "summary-line": "Count: 4, Failed: 2, Skipped: 1, Duration: 0.013s",
                  "test-count": 4, "total-duration": 13}
    }"#;

    fn policy() -> Policy {
        Policy {
            id: "host-baseline".into(),
            kind: PolicyType::Runtime,
            enforcement: vec![Enforcement {
                environment: "all".into(),
                fatal: "false".into(),
                exceptions: "false".into(),
                confidence: "high".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn maps_probes_to_levels() {
        let report: ProbeReport = serde_json::from_str(GOSS_OUTPUT).unwrap();
        let policy = policy();
        let factory = ResultFactory::new(&policy, "");
        let results = RuntimeEvaluator::results(&factory, &report);

        let levels: Vec<SarifLevel> = results.iter().map(|r| r.level).collect();
        assert_eq!(
            levels,
            vec![
                SarifLevel::Note,
                SarifLevel::Error,
                SarifLevel::Error,
                SarifLevel::Warning,
                SarifLevel::Error
            ]
        );
        assert_eq!(results[2].message.text, "Error: permission denied");
        assert_eq!(results[1].uri(), Some("tcp:443"));
        assert_eq!(results[1].properties.resource_type.as_deref(), Some("Port"));
        assert!(results[4].is_summary());
        assert_eq!(results[4].uri(), Some("N/A"));
    }

    #[test]
    fn all_passing_summary_is_note() {
        let report = ProbeReport {
            results: vec![Probe {
                successful: true,
                resource_id: "nginx".into(),
                summary_line: "ok".into(),
                ..Default::default()
            }],
            summary: ProbeSummary {
                test_count: 1,
                summary_line: "Count: 1, Failed: 0".into(),
                ..Default::default()
            },
        };
        let policy = policy();
        let results = RuntimeEvaluator::results(&ResultFactory::new(&policy, ""), &report);
        assert!(results.iter().all(|r| r.level == SarifLevel::Note));
    }

    #[test]
    fn missing_config_is_an_error() {
        assert!(config_path("").is_err());
        assert!(config_path("/definitely/not/here.yaml").is_err());
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(config_path(&file.path().display().to_string()).unwrap(), file.path());
    }

    #[test]
    fn prober_args_end_with_json_format() {
        let args = GossProber::args(Path::new("/etc/goss.yaml"));
        assert!(args.ends_with(&[
            "-g".to_string(),
            "/etc/goss.yaml".to_string(),
            "validate".to_string(),
            "--format".to_string(),
            "json".to_string()
        ]));
    }
}
