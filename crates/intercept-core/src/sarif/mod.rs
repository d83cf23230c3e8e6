//! SARIF 2.1.0 documents produced by the evaluators and the merge step.
//!
//! Every evaluator emits a list of [`SarifResult`]s built through a
//! [`ResultFactory`], which stamps the policy metadata echo, the run id and
//! the result timestamp into `properties`. Exactly one result per policy run
//! carries `result-type: summary`.

pub mod merge;

use std::io::Write;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InterceptResult;
use crate::model::{Bundle, Policy};
use crate::severity::{policy_level, SarifLevel};

pub use merge::{merge_reports, MergeOptions, MergedReport};

/// SARIF schema URI written into every document.
pub const SARIF_SCHEMA: &str =
    "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/main/sarif-2.1/schema/sarif-schema-2.1.0.json";
pub const SARIF_VERSION: &str = "2.1.0";
pub const TOOL_NAME: &str = "INTERCEPT";
pub const INFORMATION_URI: &str = "https://intercept.cc";
/// Placeholder URI for results without a file.
pub const NOT_APPLICABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SarifReport {
    pub version: String,
    #[serde(rename = "$schema")]
    pub schema: String,
    pub runs: Vec<Run>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub tool: Tool,
    #[serde(default)]
    pub results: Vec<SarifResult>,
    #[serde(default)]
    pub invocations: Vec<Invocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub driver: Driver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub semantic_version: String,
    #[serde(default)]
    pub information_uri: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Driver {
    pub fn intercept(rules: Vec<Rule>) -> Self {
        let version = env!("CARGO_PKG_VERSION").to_string();
        Self {
            name: TOOL_NAME.to_string(),
            full_name: format!("{TOOL_NAME} {version}"),
            semantic_version: version.clone(),
            version,
            information_uri: INFORMATION_URI.to_string(),
            rules,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub text: String,
}

impl Text {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub short_description: Text,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_description: Option<Text>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<Text>,
    #[serde(default)]
    pub properties: RuleProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_configuration: Option<DefaultConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleProperties {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultConfiguration {
    pub level: SarifLevel,
}

/// One `tool.driver.rules[]` entry per policy.
pub fn rules_for(bundle: &Bundle, environment: &str) -> Vec<Rule> {
    bundle
        .policies
        .iter()
        .map(|p| Rule {
            id: p.id.clone(),
            short_description: Text::new(p.metadata.name.clone()),
            full_description: non_empty(&p.metadata.description).map(Text::new),
            help: non_empty(&p.metadata.msg_solution).map(Text::new),
            properties: RuleProperties {
                tags: p.metadata.tags.clone(),
            },
            default_configuration: Some(DefaultConfiguration {
                level: policy_level(p, environment),
            }),
        })
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifResult {
    pub rule_id: String,
    pub level: SarifLevel,
    pub message: Text,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    pub properties: ResultProperties,
}

impl SarifResult {
    pub fn is_summary(&self) -> bool {
        self.properties.result_type == ResultType::Summary
    }

    /// First artifact URI, if any.
    pub fn uri(&self) -> Option<&str> {
        self.locations
            .first()
            .map(|l| l.physical_location.artifact_location.uri.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Summary,
    Detail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultProperties {
    pub result_type: ResultType,
    pub observe_run_id: String,
    pub result_timestamp: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub msg_error: String,
    #[serde(default)]
    pub msg_solution: String,
    #[serde(default)]
    pub sarif_int: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub physical_location: PhysicalLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalLocation {
    pub artifact_location: ArtifactLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub start_line: usize,
    pub start_column: usize,
    pub end_column: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<Text>,
}

impl Location {
    /// URI `N/A`, region `1:1-1`, snippet `N/A`.
    pub fn not_applicable() -> Self {
        Self::region(NOT_APPLICABLE, 1, 1, 1, Some(NOT_APPLICABLE.to_string()))
    }

    /// A whole-artifact location with the placeholder region.
    pub fn artifact(uri: impl Into<String>) -> Self {
        Self::region(uri, 1, 1, 1, Some(NOT_APPLICABLE.to_string()))
    }

    /// URI only, no region.
    pub fn uri(uri: impl Into<String>) -> Self {
        Self {
            physical_location: PhysicalLocation {
                artifact_location: ArtifactLocation { uri: uri.into() },
                region: None,
            },
        }
    }

    pub fn region(
        uri: impl Into<String>,
        start_line: usize,
        start_column: usize,
        end_column: usize,
        snippet: Option<String>,
    ) -> Self {
        Self {
            physical_location: PhysicalLocation {
                artifact_location: ArtifactLocation { uri: uri.into() },
                region: Some(Region {
                    start_line: start_line.max(1),
                    start_column: start_column.max(1),
                    end_column: end_column.max(1),
                    snippet: snippet.map(Text::new),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub execution_successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    #[serde(default)]
    pub properties: InvocationProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InvocationProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_status: Option<String>,
    #[serde(default)]
    pub report_compliant: bool,
}

impl SarifReport {
    /// Single-run report with a compliance-stamped invocation.
    pub fn new(driver: Driver, results: Vec<SarifResult>) -> Self {
        let compliant = is_compliant(&results);
        Self {
            version: SARIF_VERSION.to_string(),
            schema: SARIF_SCHEMA.to_string(),
            runs: vec![Run {
                tool: Tool { driver },
                results,
                invocations: vec![Invocation {
                    execution_successful: true,
                    command_line: None,
                    properties: InvocationProperties {
                        report_compliant: compliant,
                        ..Default::default()
                    },
                }],
            }],
        }
    }

    pub fn results(&self) -> impl Iterator<Item = &SarifResult> {
        self.runs.iter().flat_map(|r| r.results.iter())
    }

    pub fn is_compliant(&self) -> bool {
        self.results().all(|r| !r.level.is_failing())
    }

    /// Invocation properties of the first run.
    pub fn invocation(&self) -> Option<&InvocationProperties> {
        self.runs
            .first()
            .and_then(|r| r.invocations.first())
            .map(|i| &i.properties)
    }
}

pub fn is_compliant(results: &[SarifResult]) -> bool {
    results.iter().all(|r| !r.level.is_failing())
}

/// Write `report` as pretty JSON via a temp file in the same directory.
pub fn write_report(path: &Path, report: &SarifReport) -> InterceptResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, report)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn read_report(path: &Path) -> InterceptResult<SarifReport> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Builds results for one policy run.
#[derive(Debug, Clone)]
pub struct ResultFactory<'a> {
    policy: &'a Policy,
    environment: &'a str,
    failing: SarifLevel,
    timestamp: String,
}

impl<'a> ResultFactory<'a> {
    pub fn new(policy: &'a Policy, environment: &'a str) -> Self {
        Self {
            policy,
            environment,
            failing: policy_level(policy, environment),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn policy(&self) -> &Policy {
        self.policy
    }

    /// Level applied to violations.
    pub fn failing_level(&self) -> SarifLevel {
        self.failing
    }

    /// `note` when compliant, the enforcement-derived level otherwise.
    pub fn outcome_level(&self, compliant: bool) -> SarifLevel {
        if compliant {
            SarifLevel::Note
        } else {
            self.failing
        }
    }

    pub fn summary(
        &self,
        level: SarifLevel,
        message: impl Into<String>,
        locations: Vec<Location>,
    ) -> SarifResult {
        self.build(ResultType::Summary, level, message.into(), locations)
    }

    pub fn detail(
        &self,
        level: SarifLevel,
        message: impl Into<String>,
        locations: Vec<Location>,
    ) -> SarifResult {
        self.build(ResultType::Detail, level, message.into(), locations)
    }

    /// Fail-closed summary for an evaluator error.
    pub fn evaluation_error(&self, error: &str) -> SarifResult {
        self.summary(
            self.failing,
            format!("Policy {} evaluation error: {error}", self.policy.id),
            vec![Location::not_applicable()],
        )
    }

    fn build(
        &self,
        result_type: ResultType,
        level: SarifLevel,
        message: String,
        locations: Vec<Location>,
    ) -> SarifResult {
        let meta = &self.policy.metadata;
        SarifResult {
            rule_id: self.policy.id.clone(),
            level,
            message: Text::new(message),
            locations,
            properties: ResultProperties {
                result_type,
                observe_run_id: self.policy.observe_run_id(),
                result_timestamp: self.timestamp.clone(),
                environment: self.environment.to_string(),
                name: meta.name.clone(),
                description: meta.description.clone(),
                msg_error: meta.msg_error.clone(),
                msg_solution: meta.msg_solution.clone(),
                sarif_int: level.as_int(),
                resource_type: None,
                property: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Enforcement;
    use serde_json::json;

    fn policy() -> Policy {
        let mut p = Policy {
            id: "no-secrets".into(),
            run_id: Some("RUN123".into()),
            ..Default::default()
        };
        p.metadata.name = "No secrets".into();
        p.enforcement = vec![Enforcement {
            environment: "all".into(),
            fatal: "true".into(),
            exceptions: "false".into(),
            confidence: "high".into(),
        }];
        p
    }

    #[test]
    fn results_echo_policy_metadata() {
        let policy = policy();
        let factory = ResultFactory::new(&policy, "prod");
        let result = factory.summary(
            factory.outcome_level(false),
            "failed",
            vec![Location::not_applicable()],
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["ruleId"], "no-secrets");
        assert_eq!(value["level"], "error");
        assert_eq!(value["properties"]["result-type"], "summary");
        assert_eq!(value["properties"]["observe-run-id"], "RUN123");
        assert_eq!(value["properties"]["environment"], "prod");
        assert_eq!(value["properties"]["name"], "No secrets");
        assert_eq!(value["properties"]["sarif-int"], 3);
        assert_eq!(
            value["locations"][0]["physicalLocation"]["region"],
            json!({"startLine": 1, "startColumn": 1, "endColumn": 1, "snippet": {"text": "N/A"}})
        );
    }

    #[test]
    fn report_compliance_follows_levels() {
        let policy = policy();
        let factory = ResultFactory::new(&policy, "prod");
        let ok = factory.summary(SarifLevel::Note, "ok", vec![]);
        let none = factory.detail(SarifLevel::None, "info", vec![]);
        let report = SarifReport::new(Driver::intercept(vec![]), vec![ok.clone(), none]);
        assert!(report.is_compliant());
        assert!(report.invocation().unwrap().report_compliant);

        let bad = factory.detail(SarifLevel::Warning, "bad", vec![]);
        let report = SarifReport::new(Driver::intercept(vec![]), vec![ok, bad]);
        assert!(!report.is_compliant());
    }

    #[test]
    fn writes_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.sarif");
        let policy = policy();
        let factory = ResultFactory::new(&policy, "");
        let report = SarifReport::new(
            Driver::intercept(vec![]),
            vec![factory.summary(SarifLevel::Note, "ok", vec![Location::uri("https://x")])],
        );
        write_report(&path, &report).unwrap();
        let back = read_report(&path).unwrap();
        assert_eq!(back, report);
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], "2.1.0");
        assert_eq!(raw["runs"][0]["tool"]["driver"]["name"], "INTERCEPT");
    }

    #[test]
    fn rules_carry_derived_level() {
        let bundle = Bundle {
            policies: vec![policy()],
            ..Default::default()
        };
        let rules = rules_for(&bundle, "prod");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "no-secrets");
        assert_eq!(
            rules[0].default_configuration.as_ref().unwrap().level,
            SarifLevel::Error
        );
        assert!(rules[0].full_description.is_none());
    }
}
