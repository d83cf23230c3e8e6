//! NDJSON compliance log, `c_log_intercept_<short>.log` in the output directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

use super::payload::{policy_records, report_records, Stamp};
use crate::error::InterceptResult;
use crate::host::HostIdentity;
use crate::run_id::RunId;
use crate::sarif::SarifReport;

/// Which per-policy records go to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogTypes {
    pub minimal: bool,
    pub results: bool,
    pub policy: bool,
}

impl LogTypes {
    /// Unknown names are ignored; an empty selection means `minimal`.
    pub fn parse(names: &[String]) -> Self {
        let mut types = Self::default();
        for name in names {
            match name.trim().to_ascii_lowercase().as_str() {
                "minimal" => types.minimal = true,
                "results" => types.results = true,
                "policy" => types.policy = true,
                _ => {}
            }
        }
        if types == Self::default() {
            types.minimal = true;
        }
        types
    }
}

/// Append-only line writer shared by the worker pool.
#[derive(Debug)]
pub struct ComplianceLog {
    path: PathBuf,
    types: LogTypes,
    host_id: String,
    file: Mutex<File>,
}

impl ComplianceLog {
    pub fn open(path: PathBuf, log_types: &[String], host: &HostIdentity) -> InterceptResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            types: LogTypes::parse(log_types),
            host_id: host.fingerprint.clone(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn types(&self) -> LogTypes {
        self.types
    }

    /// Log one policy's report using the configured record types.
    pub fn record_policy(&self, report: &SarifReport, run_id: &RunId) -> InterceptResult<()> {
        let records = policy_records(report, &Stamp::now(self.host_id.as_str(), run_id.as_str()));
        let mut lines = Vec::new();
        if self.types.minimal {
            push_line(&mut lines, &records.minimal)?;
        }
        if self.types.results {
            for record in &records.results {
                push_line(&mut lines, record)?;
            }
        }
        if self.types.policy {
            push_line(&mut lines, &records.policy)?;
        }
        self.append(&lines)
    }

    /// Log the merged report as a single `report` record.
    pub fn record_report(&self, report: &SarifReport, run_id: &RunId) -> InterceptResult<()> {
        let records = report_records(report, &Stamp::now(self.host_id.as_str(), run_id.as_str()));
        let mut lines = Vec::new();
        push_line(&mut lines, &records.report)?;
        self.append(&lines)
    }

    fn append(&self, lines: &[u8]) -> InterceptResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.write_all(lines)?;
        file.flush()?;
        Ok(())
    }
}

fn push_line<T: Serialize>(buf: &mut Vec<u8>, record: &T) -> InterceptResult<()> {
    serde_json::to_writer(&mut *buf, record)?;
    buf.push(b'\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Policy;
    use crate::sarif::{Driver, Location, ResultFactory};
    use crate::severity::SarifLevel;
    use serde_json::Value;

    fn report() -> SarifReport {
        let policy = Policy {
            id: "tls-min".into(),
            ..Default::default()
        };
        let factory = ResultFactory::new(&policy, "prod");
        SarifReport::new(
            Driver::intercept(Vec::new()),
            vec![
                factory.detail(SarifLevel::Warning, "old cipher", vec![Location::artifact("nginx.conf")]),
                factory.summary(SarifLevel::Warning, "failed", vec![Location::not_applicable()]),
            ],
        )
    }

    fn lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn empty_selection_defaults_to_minimal() {
        assert_eq!(
            LogTypes::parse(&[]),
            LogTypes {
                minimal: true,
                ..Default::default()
            }
        );
        let all = LogTypes::parse(&["Results".into(), "policy".into(), "bogus".into()]);
        assert!(all.results && all.policy && !all.minimal);
    }

    #[test]
    fn records_are_appended_per_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c_log.log");
        let host = HostIdentity::from_parts("h", "linux", "x86_64");
        let run_id = RunId::new();
        let log = ComplianceLog::open(
            path.clone(),
            &["minimal".to_string(), "results".to_string()],
            &host,
        )
        .unwrap();

        log.record_policy(&report(), &run_id).unwrap();
        log.record_report(&report(), &run_id).unwrap();

        let records = lines(&path);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["policy-id"], "tls-min");
        assert_eq!(records[0]["policy-compliant"], false);
        assert_eq!(records[0]["host-id"], host.fingerprint.as_str());
        assert_eq!(records[1]["sarif-level"], "warning");
        assert_eq!(records[3]["report-compliant"], false);
        assert_eq!(records[3]["run-id"], run_id.as_str());
    }
}
