//! Hook payload shapes and compliance log records.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InterceptResult;
use crate::sarif::{InvocationProperties, Location, ResultProperties, ResultType, SarifReport, SarifResult, Text};
use crate::severity::SarifLevel;

/// Who and when, stamped on every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub timestamp: String,
    pub host_id: String,
    pub run_id: String,
}

impl Stamp {
    pub fn now(host_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            host_id: host_id.into(),
            run_id: run_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogMinimal {
    pub policy_compliant: bool,
    pub policy_id: String,
    pub timestamp: String,
    pub host_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogResults {
    pub policy_compliant: bool,
    pub policy_id: String,
    pub sarif_level_int: u8,
    pub sarif_level: SarifLevel,
    pub result_type: ResultType,
    pub result: SarifResult,
    pub timestamp: String,
    pub host_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogPolicy {
    pub policy_compliant: bool,
    pub policy_id: String,
    pub summary: SarifResult,
    pub results: Vec<SarifResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_properties: Option<InvocationProperties>,
    pub timestamp: String,
    pub host_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogReport {
    pub report_compliant: bool,
    pub report_id: String,
    pub summary: Vec<SarifResult>,
    pub results: Vec<SarifResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_properties: Option<InvocationProperties>,
    pub timestamp: String,
    pub host_id: String,
    pub run_id: String,
}

/// Records derived from one policy's SARIF report.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRecords {
    pub minimal: LogMinimal,
    pub results: Vec<LogResults>,
    pub policy: LogPolicy,
}

/// Records derived from a merged report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecords {
    pub results: Vec<LogResults>,
    pub report: LogReport,
}

fn result_record(result: &SarifResult, compliant: bool, stamp: &Stamp) -> LogResults {
    LogResults {
        policy_compliant: compliant,
        policy_id: result.rule_id.clone(),
        sarif_level_int: result.level.as_int(),
        sarif_level: result.level,
        result_type: result.properties.result_type,
        result: result.clone(),
        timestamp: stamp.timestamp.clone(),
        host_id: stamp.host_id.clone(),
        run_id: stamp.run_id.clone(),
    }
}

/// Split `report` into log records for a single policy run.
pub fn policy_records(report: &SarifReport, stamp: &Stamp) -> PolicyRecords {
    let compliant = report.is_compliant();
    let mut policy_id = String::new();
    let mut summaries = Vec::new();
    let mut details = Vec::new();
    let mut results = Vec::new();

    for result in report.results() {
        policy_id.clone_from(&result.rule_id);
        results.push(result_record(result, compliant, stamp));
        if result.is_summary() {
            summaries.push(result.clone());
        } else {
            details.push(result.clone());
        }
    }

    let summary = summaries
        .into_iter()
        .next()
        .unwrap_or_else(|| placeholder_summary(&policy_id, &stamp.timestamp));

    PolicyRecords {
        minimal: LogMinimal {
            policy_compliant: compliant,
            policy_id: policy_id.clone(),
            timestamp: stamp.timestamp.clone(),
            host_id: stamp.host_id.clone(),
            run_id: stamp.run_id.clone(),
        },
        results,
        policy: LogPolicy {
            policy_compliant: compliant,
            policy_id,
            summary,
            results: details,
            policy_properties: report.invocation().cloned(),
            timestamp: stamp.timestamp.clone(),
            host_id: stamp.host_id.clone(),
            run_id: stamp.run_id.clone(),
        },
    }
}

fn placeholder_summary(policy_id: &str, timestamp: &str) -> SarifResult {
    SarifResult {
        rule_id: policy_id.to_string(),
        level: SarifLevel::None,
        message: Text::new("No summary results for this policy"),
        locations: vec![Location::not_applicable()],
        properties: ResultProperties {
            result_type: ResultType::Summary,
            observe_run_id: String::new(),
            result_timestamp: timestamp.to_string(),
            environment: String::new(),
            name: String::new(),
            description: String::new(),
            msg_error: String::new(),
            msg_solution: String::new(),
            sarif_int: SarifLevel::None.as_int(),
            resource_type: None,
            property: None,
        },
    }
}

/// Records for a merged report. Per-result compliance is that of the owning policy.
pub fn report_records(report: &SarifReport, stamp: &Stamp) -> ReportRecords {
    let mut per_policy: BTreeMap<&str, bool> = BTreeMap::new();
    for result in report.results() {
        let entry = per_policy.entry(result.rule_id.as_str()).or_insert(true);
        *entry &= !result.level.is_failing();
    }

    let mut summary = Vec::new();
    let mut details = Vec::new();
    let mut results = Vec::new();
    for result in report.results() {
        let compliant = per_policy.get(result.rule_id.as_str()).copied().unwrap_or(true);
        results.push(result_record(result, compliant, stamp));
        if result.is_summary() {
            summary.push(result.clone());
        } else {
            details.push(result.clone());
        }
    }

    let properties = report.invocation().cloned();
    let report_time = properties
        .as_ref()
        .and_then(|p| p.report_timestamp.as_deref())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let run_id = properties
        .as_ref()
        .and_then(|p| p.run_id.clone())
        .unwrap_or_else(|| stamp.run_id.clone());

    ReportRecords {
        results,
        report: LogReport {
            report_compliant: report.is_compliant(),
            report_id: format!("{}_{run_id}", report_time.format("%Y%m%dT%H%M%SZ")),
            summary,
            results: details,
            report_properties: properties,
            timestamp: stamp.timestamp.clone(),
            host_id: stamp.host_id.clone(),
            run_id: stamp.run_id.clone(),
        },
    }
}

/// Standard JSON envelope for hook deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookEnvelope {
    pub webhook_id: String,
    pub time: String,
    pub intercept_run_id: String,
    pub host_id: String,
    pub events: Vec<Value>,
    pub event_count: usize,
    /// Data-lake split of a `policy` envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SarifResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<SarifResult>>,
}

impl HookEnvelope {
    pub fn new<T: Serialize>(webhook_id: String, stamp: &Stamp, events: &[T]) -> InterceptResult<Self> {
        let events = events
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            webhook_id,
            time: stamp.timestamp.clone(),
            intercept_run_id: stamp.run_id.clone(),
            host_id: stamp.host_id.clone(),
            event_count: events.len(),
            events,
            summary: None,
            results: None,
        })
    }
}

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Body of one hook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum HookPayload {
    /// JSON envelope.
    Envelope(HookEnvelope),
    /// One JSON record per line.
    Ndjson(Vec<Value>),
    /// Search-index bulk body: an index action line before every result.
    Bulk { index: String, results: Vec<SarifResult> },
}

impl HookPayload {
    pub fn ndjson<T: Serialize>(records: &[T]) -> InterceptResult<Self> {
        let lines = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Ndjson(lines))
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Envelope(_) => CONTENT_TYPE_JSON,
            Self::Ndjson(_) | Self::Bulk { .. } => CONTENT_TYPE_NDJSON,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Envelope(_) => false,
            Self::Ndjson(lines) => lines.is_empty(),
            Self::Bulk { results, .. } => results.is_empty(),
        }
    }

    pub fn to_body(&self) -> InterceptResult<Vec<u8>> {
        match self {
            Self::Envelope(envelope) => Ok(serde_json::to_vec(envelope)?),
            Self::Ndjson(lines) => {
                let mut body = Vec::new();
                for (i, line) in lines.iter().enumerate() {
                    if i > 0 {
                        body.push(b'\n');
                    }
                    serde_json::to_writer(&mut body, line)?;
                }
                Ok(body)
            }
            Self::Bulk { index, results } => {
                let action = serde_json::to_vec(&serde_json::json!({"index": {"_index": index}}))?;
                let mut body = Vec::new();
                for result in results {
                    body.extend_from_slice(&action);
                    body.push(b'\n');
                    serde_json::to_writer(&mut body, result)?;
                    body.push(b'\n');
                }
                Ok(body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Policy;
    use crate::sarif::{Driver, ResultFactory};

    fn report(levels: &[(&str, SarifLevel, bool)]) -> SarifReport {
        let policy = Policy {
            id: "p".into(),
            ..Default::default()
        };
        let factory = ResultFactory::new(&policy, "");
        let results = levels
            .iter()
            .map(|(id, level, summary)| {
                let mut r = if *summary {
                    factory.summary(*level, "s", vec![Location::not_applicable()])
                } else {
                    factory.detail(*level, "d", vec![Location::not_applicable()])
                };
                r.rule_id = id.to_string();
                r
            })
            .collect();
        SarifReport::new(Driver::intercept(Vec::new()), results)
    }

    fn stamp() -> Stamp {
        Stamp {
            timestamp: "2026-01-01T00:00:00Z".into(),
            host_id: "host".into(),
            run_id: "run".into(),
        }
    }

    #[test]
    fn policy_records_split_summary_and_details() {
        let report = report(&[
            ("p", SarifLevel::Error, false),
            ("p", SarifLevel::Error, true),
        ]);
        let records = policy_records(&report, &stamp());
        assert!(!records.minimal.policy_compliant);
        assert_eq!(records.minimal.policy_id, "p");
        assert_eq!(records.results.len(), 2);
        assert_eq!(records.policy.results.len(), 1);
        assert!(records.policy.summary.is_summary());

        let json = serde_json::to_value(&records.results[0]).unwrap();
        assert_eq!(json["sarif-level"], "error");
        assert_eq!(json["sarif-level-int"], SarifLevel::Error.as_int());
        assert_eq!(json["result-type"], "detail");
    }

    #[test]
    fn report_records_track_compliance_per_policy() {
        let mut report = report(&[
            ("a", SarifLevel::Note, true),
            ("b", SarifLevel::Warning, true),
        ]);
        report.runs[0].invocations[0].properties.run_id = Some("RUN".into());
        report.runs[0].invocations[0].properties.report_timestamp = Some("2026-03-04T05:06:07Z".into());

        let records = report_records(&report, &stamp());
        assert!(records.results[0].policy_compliant);
        assert!(!records.results[1].policy_compliant);
        assert!(!records.report.report_compliant);
        assert_eq!(records.report.report_id, "20260304T050607Z_RUN");
        assert_eq!(records.report.summary.len(), 2);
    }

    #[test]
    fn bulk_body_alternates_actions_and_results() {
        let report = report(&[("a", SarifLevel::Note, false), ("a", SarifLevel::Note, true)]);
        let payload = HookPayload::Bulk {
            index: "intercept".into(),
            results: report.results().cloned().collect(),
        };
        assert_eq!(payload.content_type(), CONTENT_TYPE_NDJSON);
        let body = String::from_utf8(payload.to_body().unwrap()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        for (i, line) in lines.iter().enumerate() {
            let value: Value = serde_json::from_str(line).unwrap();
            if i % 2 == 0 {
                assert_eq!(value["index"]["_index"], "intercept");
            } else {
                assert!(serde_json::from_value::<SarifResult>(value).is_ok());
            }
        }
    }

    #[test]
    fn envelope_counts_events() {
        let records = policy_records(&report(&[("a", SarifLevel::Note, true)]), &stamp());
        let envelope = HookEnvelope::new("my-hook".into(), &stamp(), &[records.minimal]).unwrap();
        let body = HookPayload::Envelope(envelope).to_body().unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["webhook-id"], "my-hook");
        assert_eq!(json["event-count"], 1);
        assert_eq!(json["events"][0]["policy-compliant"], true);
        assert!(json.get("summary").is_none());
    }
}
