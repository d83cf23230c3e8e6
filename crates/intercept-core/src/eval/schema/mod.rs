//! Schema evaluators for `yml`, `toml`, `json` and `ini` policies.
//!
//! Each input file is converted to JSON and checked against the policy's
//! `_schema.structure` (a JSON Schema written as JSON or YAML). With `patch`
//! set, a corrected copy is written to `_patched/` in the original format.

pub mod convert;
pub mod json_schema;
pub mod patch;

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{uri_of, Evaluator, PolicyJob};
use crate::engine::Engine;
use crate::model::{DocumentFormat, SchemaSpec};
use crate::sarif::{Location, ResultFactory, SarifResult};

pub use json_schema::JsonSchemaEngine;

/// Constraint engine used by the schema and api evaluators.
pub trait SchemaEngine: Send + Sync {
    /// Issues found in `doc`; empty when valid.
    fn validate(&self, doc: &Value, schema: &Value, strict: bool) -> anyhow::Result<Vec<String>>;

    /// Corrected document and a description of every change.
    fn patch(&self, doc: &Value, schema: &Value) -> anyhow::Result<(Value, Vec<String>)>;
}

/// Parse `_schema.structure`; JSON is valid YAML, so one parser covers both.
pub fn parse_schema(spec: &SchemaSpec) -> anyhow::Result<Value> {
    let text = spec.structure.trim();
    if text.is_empty() {
        anyhow::bail!("policy has no schema structure");
    }
    serde_yaml::from_str(text).context("schema structure is neither JSON nor YAML")
}

#[derive(Debug, Clone, Copy)]
pub struct SchemaEvaluator {
    format: DocumentFormat,
}

impl SchemaEvaluator {
    pub fn new(format: DocumentFormat) -> Self {
        Self { format }
    }
}

struct FileOutcome {
    issues: Vec<String>,
    patched: bool,
}

impl SchemaEvaluator {
    fn check_file(
        &self,
        engine: &Engine,
        spec: &SchemaSpec,
        schema: &Value,
        path: &Path,
    ) -> anyhow::Result<FileOutcome> {
        let content =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let doc = match convert::to_json(&content, self.format) {
            Ok(doc) => doc,
            Err(e) => {
                return Ok(FileOutcome {
                    issues: vec![format!(
                        "Error converting {} to JSON: {e:#}",
                        self.format.extension()
                    )],
                    patched: false,
                })
            }
        };

        let issues = engine.schema().validate(&doc, schema, spec.strict)?;
        let mut patched = false;
        if spec.patch && !issues.is_empty() {
            let (fixed, changes) = engine.schema().patch(&doc, schema)?;
            if !changes.is_empty() {
                let bytes = convert::from_json(&fixed, self.format)?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "document".to_string());
                let dir = engine.layout().patched_dir();
                std::fs::create_dir_all(&dir)?;
                let out = dir.join(format!("{name}.patched.{}", self.format.extension()));
                std::fs::write(&out, bytes)?;
                debug!(file = %path.display(), patched = %out.display(), changes = ?changes, "wrote patched copy");
                patched = true;
            }
        }
        Ok(FileOutcome { issues, patched })
    }
}

#[async_trait]
impl Evaluator for SchemaEvaluator {
    async fn evaluate(&self, engine: &Engine, job: &PolicyJob) -> anyhow::Result<Vec<SarifResult>> {
        let policy = &job.policy;
        let schema = parse_schema(&policy.schema)?;
        let factory = ResultFactory::new(policy, engine.environment());
        let level = factory.failing_level();

        let mut results = Vec::new();
        let mut locations = Vec::new();
        let mut any_patched = false;

        for file in &job.files {
            let uri = uri_of(&file.path);
            locations.push(Location::artifact(uri.clone()));
            match self.check_file(engine, &policy.schema, &schema, &file.path) {
                Ok(outcome) => {
                    any_patched |= outcome.patched;
                    for issue in outcome.issues {
                        results.push(factory.detail(
                            level,
                            format!("Schema validation issue: {issue}"),
                            vec![Location::artifact(uri.clone())],
                        ));
                    }
                }
                Err(e) => {
                    warn!(policy = %policy.id, file = %uri, error = %e, "schema check failed");
                    results.push(factory.detail(
                        level,
                        format!("Schema validation issue: {e:#}"),
                        vec![Location::artifact(uri.clone())],
                    ));
                }
            }
        }

        let valid = results.is_empty();
        let mut message = format!(
            "Schema validation {} for policy {}",
            if valid { "passed" } else { "failed" },
            policy.id
        );
        if any_patched {
            message.push_str(" (content patched)");
        }
        if locations.is_empty() {
            locations.push(Location::not_applicable());
        }
        results.push(factory.summary(factory.outcome_level(valid), message, locations));
        Ok(results)
    }

    /// Patching writes files, so only read-only checks are cached.
    fn cacheable(&self, job: &PolicyJob) -> bool {
        !job.policy.schema.patch
    }
}
