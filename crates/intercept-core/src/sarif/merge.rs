//! Merge per-policy SARIF artifacts into one report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use super::{read_report, write_report, Driver, Invocation, InvocationProperties, Rule, SarifReport};
use crate::error::{InterceptError, InterceptResult};
use crate::host::HostIdentity;
use crate::output::OutputLayout;
use crate::run_id::RunId;

#[derive(Debug, Clone)]
pub struct MergeOptions<'a> {
    pub run_id: &'a RunId,
    pub rules: Vec<Rule>,
    pub environment: &'a str,
    pub debug: bool,
    pub host: &'a HostIdentity,
    pub command_line: String,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    /// Write under `_status/` with a UTC timestamp prefix.
    pub scheduled: bool,
}

#[derive(Debug, Clone)]
pub struct MergedReport {
    pub report: SarifReport,
    pub path: PathBuf,
}

impl MergedReport {
    pub fn is_compliant(&self) -> bool {
        self.report.is_compliant()
    }
}

/// Concatenate `_sarif/*.sarif` results, write the merged report and remove
/// the artifacts that were read.
///
/// Returns `None` when no per-policy artifact exists. Unreadable artifacts
/// are logged and skipped. Files that appear after the directory listing
/// (including in-progress temp files) are left for the next merge.
pub fn merge_reports(
    layout: &OutputLayout,
    options: MergeOptions<'_>,
) -> InterceptResult<Option<MergedReport>> {
    let sarif_dir = layout.sarif_dir();
    let files = list_artifacts(&sarif_dir)?;

    if files.is_empty() {
        warn!(dir = %sarif_dir.display(), "no SARIF files found, skipping merge");
        return Ok(None);
    }

    let mut results = Vec::new();
    for file in &files {
        match read_report(file) {
            Ok(report) => {
                for run in report.runs {
                    results.extend(run.results);
                }
            }
            Err(e) => {
                let err = InterceptError::Aggregation {
                    path: file.display().to_string(),
                    message: e.to_string(),
                };
                warn!(error = %err, "skipping unreadable SARIF artifact");
            }
        }
    }

    let mut report = SarifReport::new(Driver::intercept(options.rules), results);
    let compliant = report.is_compliant();
    let now = Utc::now();
    let elapsed = options.ended.signed_duration_since(options.started);

    if let Some(run) = report.runs.first_mut() {
        run.invocations = vec![Invocation {
            execution_successful: true,
            command_line: Some(options.command_line),
            properties: InvocationProperties {
                run_id: Some(options.run_id.to_string()),
                start_time: Some(rfc3339(options.started)),
                end_time: Some(rfc3339(options.ended)),
                execution_time_ms: Some(elapsed.num_milliseconds().max(0).to_string()),
                environment: Some(options.environment.to_string()),
                debug: Some(options.debug.to_string()),
                report_timestamp: Some(rfc3339(now)),
                host_data: Some(options.host.data.clone()),
                host_fingerprint: Some(options.host.fingerprint.clone()),
                report_status: Some(
                    if compliant { "compliant" } else { "non-compliant" }.to_string(),
                ),
                report_compliant: compliant,
            },
        }];
    }

    let path = if options.scheduled {
        let utc = now.format("%Y%m%dT%H%M%SZ").to_string();
        layout.status_report(options.run_id, &utc)
    } else {
        layout.merged_report(options.run_id)
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_report(&path, &report)?;
    info!(
        path = %path.display(),
        artifacts = files.len(),
        results = report.results().count(),
        compliant,
        "merged SARIF report written"
    );

    for file in &files {
        match std::fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    debug!(removed = files.len(), "merged SARIF artifacts removed");

    Ok(Some(MergedReport { report, path }))
}

/// `*.sarif` files directly under `dir`, sorted by name.
fn list_artifacts(dir: &Path) -> InterceptResult<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(InterceptError::Aggregation {
                path: dir.display().to_string(),
                message: e.to_string(),
            })
        }
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sarif") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Policy;
    use crate::sarif::{Location, ResultFactory};
    use crate::severity::SarifLevel;

    fn write_policy(layout: &OutputLayout, id: &str, level: SarifLevel) {
        let policy = Policy {
            id: id.into(),
            ..Default::default()
        };
        let factory = ResultFactory::new(&policy, "");
        let report = SarifReport::new(
            Driver::intercept(vec![]),
            vec![factory.summary(level, "summary", vec![Location::not_applicable()])],
        );
        write_report(&layout.policy_sarif(id), &report).unwrap();
    }

    fn options<'a>(run_id: &'a RunId, host: &'a HostIdentity, scheduled: bool) -> MergeOptions<'a> {
        MergeOptions {
            run_id,
            rules: vec![],
            environment: "prod",
            debug: false,
            host,
            command_line: "intercept audit".into(),
            started: Utc::now(),
            ended: Utc::now(),
            scheduled,
        }
    }

    #[test]
    fn merges_and_clears_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.prepare(false).unwrap();
        write_policy(&layout, "a", SarifLevel::Note);
        write_policy(&layout, "b", SarifLevel::Warning);
        std::fs::write(layout.policy_sarif("broken"), "not json").unwrap();

        let run_id = RunId::new();
        let host = HostIdentity::from_parts("h", "linux", "x86_64");
        let merged = merge_reports(&layout, options(&run_id, &host, false))
            .unwrap()
            .unwrap();

        assert_eq!(merged.report.results().count(), 2);
        assert!(!merged.is_compliant());
        let props = merged.report.invocation().unwrap();
        assert_eq!(props.report_status.as_deref(), Some("non-compliant"));
        assert_eq!(props.host_data.as_deref(), Some("h|linux|x86_64"));
        assert_eq!(merged.path, layout.merged_report(&run_id));
        assert!(merged.path.exists());
        assert_eq!(std::fs::read_dir(layout.sarif_dir()).unwrap().count(), 0);
    }

    #[test]
    fn scheduled_merge_goes_to_status() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.prepare(true).unwrap();
        write_policy(&layout, "a", SarifLevel::Note);

        let run_id = RunId::new();
        let host = HostIdentity::from_parts("h", "linux", "x86_64");
        let merged = merge_reports(&layout, options(&run_id, &host, true))
            .unwrap()
            .unwrap();
        assert!(merged.path.starts_with(layout.status_dir()));
        assert!(merged.is_compliant());
        let name = merged.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(&format!("_intercept_{}.sarif.json", run_id.short())));
    }

    #[test]
    fn merge_leaves_unlisted_artifacts_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.prepare(true).unwrap();
        write_policy(&layout, "a", SarifLevel::Note);
        // A per-policy write still in flight when the report tick runs.
        let pending = tempfile::NamedTempFile::new_in(layout.sarif_dir()).unwrap();
        std::fs::write(layout.sarif_dir().join("notes.txt"), "keep").unwrap();

        let run_id = RunId::new();
        let host = HostIdentity::from_parts("h", "linux", "x86_64");
        let merged = merge_reports(&layout, options(&run_id, &host, true))
            .unwrap()
            .unwrap();
        assert_eq!(merged.report.results().count(), 1);
        assert!(!layout.policy_sarif("a").exists());
        assert!(layout.sarif_dir().join("notes.txt").exists());

        pending.persist(layout.policy_sarif("late")).unwrap();
        assert!(layout.policy_sarif("late").exists());
    }

    #[test]
    fn output_dir_with_glob_characters_is_listed_literally() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().join("out[1]*?"));
        layout.prepare(false).unwrap();
        write_policy(&layout, "a", SarifLevel::Note);

        let run_id = RunId::new();
        let host = HostIdentity::from_parts("h", "linux", "x86_64");
        let merged = merge_reports(&layout, options(&run_id, &host, false))
            .unwrap()
            .unwrap();
        assert_eq!(merged.report.results().count(), 1);
    }

    #[test]
    fn empty_scratch_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.prepare(false).unwrap();
        let run_id = RunId::new();
        let host = HostIdentity::from_parts("h", "linux", "x86_64");
        assert!(merge_reports(&layout, options(&run_id, &host, false))
            .unwrap()
            .is_none());
    }
}
