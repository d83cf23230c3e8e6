//! Rego policies evaluated by an external engine (`opa eval`).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{uri_of, Evaluator, PolicyJob};
use crate::engine::Engine;
use crate::model::normalize_filename;
use crate::sarif::{Location, ResultFactory, SarifResult, NOT_APPLICABLE};

#[derive(Debug, Clone, Copy)]
pub struct RegoRequest<'a> {
    pub module: &'a Path,
    pub data: Option<&'a Path>,
    pub query: &'a str,
    pub input: &'a Value,
    /// Capture a full evaluation trace.
    pub trace: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegoOutput {
    /// First expression value; `None` when the query is undefined.
    pub value: Option<Value>,
    pub trace: Option<Value>,
}

#[async_trait]
pub trait RegoEngine: Send + Sync {
    async fn eval(&self, request: RegoRequest<'_>) -> anyhow::Result<RegoOutput>;
}

/// `opa eval --format json --stdin-input`.
#[derive(Debug, Clone)]
pub struct OpaCli {
    opa_path: PathBuf,
}

impl OpaCli {
    pub fn new(opa_path: impl Into<PathBuf>) -> Self {
        Self {
            opa_path: opa_path.into(),
        }
    }

    fn args(request: &RegoRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "eval".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--stdin-input".to_string(),
            "-d".to_string(),
            request.module.display().to_string(),
        ];
        if let Some(data) = request.data {
            args.push("-d".to_string());
            args.push(data.display().to_string());
        }
        if request.trace {
            args.push("--explain".to_string());
            args.push("full".to_string());
        }
        args.push(request.query.to_string());
        args
    }
}

#[derive(Deserialize)]
struct OpaOutput {
    #[serde(default)]
    result: Vec<OpaResult>,
    #[serde(default)]
    explanation: Option<Value>,
}

#[derive(Deserialize)]
struct OpaResult {
    #[serde(default)]
    expressions: Vec<OpaExpression>,
}

#[derive(Deserialize)]
struct OpaExpression {
    #[serde(default)]
    value: Value,
}

/// Parse `opa eval --format json` output.
pub fn parse_opa_output(stdout: &[u8]) -> anyhow::Result<RegoOutput> {
    let parsed: OpaOutput = serde_json::from_slice(stdout).context("failed to parse opa output")?;
    let value = parsed
        .result
        .into_iter()
        .flat_map(|r| r.expressions)
        .map(|e| e.value)
        .next();
    Ok(RegoOutput {
        value,
        trace: parsed.explanation,
    })
}

#[async_trait]
impl RegoEngine for OpaCli {
    async fn eval(&self, request: RegoRequest<'_>) -> anyhow::Result<RegoOutput> {
        let args = Self::args(&request);
        debug!(opa = %self.opa_path.display(), args = ?args, "running rego query");
        let mut child = Command::new(&self.opa_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to execute {}", self.opa_path.display()))?;

        let input = serde_json::to_vec(request.input)?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("opa stdin unavailable"))?;
        stdin.write_all(&input).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "opa exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_opa_output(&output.stdout)
    }
}

lazy_static! {
    static ref PACKAGE: Regex = Regex::new(r"(?m)^package\s+(\w+)").unwrap();
}

/// Package declared by a rego module.
pub fn module_package(source: &str) -> Option<String> {
    PACKAGE
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Package a query addresses: `data.<package>...`.
pub fn query_package(query: &str) -> Option<&str> {
    query.trim().split('.').nth(1).filter(|p| !p.is_empty())
}

/// Input document for a file: its JSON body, or a text wrapper.
pub fn input_document(path: &Path, content: &[u8]) -> Value {
    if let Ok(value) = serde_json::from_slice::<Value>(content) {
        return value;
    }
    let text = String::from_utf8_lossy(content);
    json!({
        "content": text,
        "lines": text.split('\n').collect::<Vec<_>>(),
        "blocks": text_blocks(&text),
        "path": uri_of(path),
    })
}

/// Top-level `directive {` ... `}` blocks of a brace-structured text file.
pub fn text_blocks(text: &str) -> Vec<Value> {
    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut directive = String::new();
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if depth == 0 {
            if let Some(head) = trimmed.strip_suffix('{') {
                directive = head.trim_end().to_string();
                body.clear();
                depth = 1;
            }
            continue;
        }
        if trimmed.ends_with('{') {
            depth += 1;
        } else if trimmed == "}" || trimmed == "};" {
            depth -= 1;
            if depth == 0 {
                blocks.push(json!({"directive": directive, "block": body}));
                continue;
            }
        }
        body.push(line);
    }
    blocks
}

/// Compliance and violations derived from a query value.
///
/// An object with a boolean `allow` decides on its own and lists its
/// `violations`; otherwise `true`, non-empty collections and non-null
/// scalars are compliant.
pub fn decide(value: Option<&Value>) -> (bool, Vec<String>) {
    let Some(value) = value else {
        return (false, Vec::new());
    };
    if let Some(allow) = value.get("allow").and_then(Value::as_bool) {
        let violations = value
            .get("violations")
            .and_then(Value::as_array)
            .map(|v| {
                v.iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        return (allow, violations);
    }
    let compliant = match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::String(_) | Value::Number(_) => true,
    };
    (compliant, Vec::new())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RegoEvaluator;

#[async_trait]
impl Evaluator for RegoEvaluator {
    async fn evaluate(&self, engine: &Engine, job: &PolicyJob) -> anyhow::Result<Vec<SarifResult>> {
        let policy = &job.policy;
        let spec = &policy.rego;
        let module = PathBuf::from(spec.policy_file.trim());
        let source = std::fs::read_to_string(&module)
            .with_context(|| format!("failed to read rego module {}", module.display()))?;
        let package = module_package(&source)
            .ok_or_else(|| anyhow!("package name not found in {}", module.display()))?;
        let queried = query_package(&spec.policy_query).unwrap_or_default();
        if queried != package {
            bail!("query package ({queried}) does not match module package ({package})");
        }
        let data = spec
            .policy_data
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        let factory = ResultFactory::new(policy, engine.environment());
        let failing = factory.failing_level();
        let trace = engine.debug();

        let mut inputs: Vec<(String, Value)> = Vec::new();
        for file in &job.files {
            let content = std::fs::read(&file.path)
                .with_context(|| format!("failed to read {}", file.path.display()))?;
            inputs.push((uri_of(&file.path), input_document(&file.path, &content)));
        }
        if inputs.is_empty() {
            inputs.push((NOT_APPLICABLE.to_string(), json!({})));
        }

        let mut results = Vec::new();
        let mut traces = Vec::new();
        for (uri, input) in &inputs {
            let output = engine
                .rego()
                .eval(RegoRequest {
                    module: &module,
                    data: data.as_deref(),
                    query: spec.policy_query.trim(),
                    input,
                    trace,
                })
                .await?;
            if let Some(explanation) = output.trace {
                traces.push(json!({"file": uri, "explanation": explanation}));
            }

            let (compliant, violations) = decide(output.value.as_ref());
            let level = factory.outcome_level(compliant);
            debug!(policy = %policy.id, file = %uri, compliant, violations = violations.len(), "rego evaluated");

            results.push(factory.summary(
                level,
                format!(
                    "Policy {} {} for file {uri} with {} violations",
                    policy.id,
                    if compliant { "passed" } else { "failed" },
                    violations.len()
                ),
                vec![Location::uri(uri.clone())],
            ));
            for violation in violations {
                results.push(factory.detail(
                    if compliant { level } else { failing },
                    format!("{} for file {uri} : Violation [ {violation} ] ", policy.id),
                    vec![Location::uri(uri.clone())],
                ));
            }
        }

        if !traces.is_empty() {
            let dir = engine.layout().debug_dir();
            let path = dir.join(format!("rego_trace_{}.json", normalize_filename(&policy.id)));
            let written = std::fs::create_dir_all(&dir)
                .and_then(|_| std::fs::write(&path, serde_json::to_vec_pretty(&traces).unwrap_or_default()));
            if let Err(e) = written {
                warn!(policy = %policy.id, path = %path.display(), error = %e, "failed to write rego trace");
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::host::HostIdentity;
    use crate::model::{Bundle, Enforcement, Policy, PolicyType, RegoSpec};
    use crate::severity::SarifLevel;
    use crate::target::ScannedFile;
    use std::sync::{Arc, Mutex};

    #[test]
    fn package_extraction() {
        let module = "# comment\npackage nginx\n\ndefault allow := false\n";
        assert_eq!(module_package(module).as_deref(), Some("nginx"));
        assert_eq!(query_package("data.nginx.allow"), Some("nginx"));
        assert_eq!(query_package("data"), None);
    }

    #[test]
    fn truthiness_rules() {
        assert_eq!(decide(Some(&json!(true))), (true, vec![]));
        assert_eq!(decide(Some(&json!(false))), (false, vec![]));
        assert_eq!(decide(Some(&json!([]))), (false, vec![]));
        assert_eq!(decide(Some(&json!(["x"]))), (true, vec![]));
        assert_eq!(decide(Some(&json!("yes"))), (true, vec![]));
        assert_eq!(decide(Some(&Value::Null)), (false, vec![]));
        assert_eq!(decide(None), (false, vec![]));
        assert_eq!(
            decide(Some(&json!({"allow": false, "violations": ["no tls", 3]}))),
            (false, vec!["no tls".to_string(), "3".to_string()])
        );
    }

    #[test]
    fn text_inputs_are_wrapped_with_blocks() {
        let text = "user nginx;\nserver {\n  listen 80;\n  location / {\n    root /srv;\n  }\n}\n";
        let doc = input_document(Path::new("conf/nginx.conf"), text.as_bytes());
        assert_eq!(doc["path"], "conf/nginx.conf");
        assert_eq!(doc["lines"][0], "user nginx;");
        let blocks = doc["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["directive"], "server");
        assert_eq!(blocks[0]["block"].as_array().unwrap().len(), 4);

        let doc = input_document(Path::new("a.json"), br#"{"tls": true}"#);
        assert_eq!(doc, json!({"tls": true}));
    }

    #[test]
    fn parses_opa_json_output() {
        let out = br#"{"result":[{"expressions":[{"value":{"allow":true},"text":"data.p","location":{"row":1,"col":1}}]}]}"#;
        let parsed = parse_opa_output(out).unwrap();
        assert_eq!(parsed.value, Some(json!({"allow": true})));
        assert!(parse_opa_output(b"{}").unwrap().value.is_none());
    }

    struct Scripted {
        value: Value,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl RegoEngine for Scripted {
        async fn eval(&self, request: RegoRequest<'_>) -> anyhow::Result<RegoOutput> {
            self.seen.lock().unwrap().push(request.input.clone());
            Ok(RegoOutput {
                value: Some(self.value.clone()),
                trace: request.trace.then(|| json!([])),
            })
        }
    }

    fn setup(dir: &Path, value: Value) -> (Engine, Arc<Scripted>, Policy) {
        let module = dir.join("policy.rego");
        std::fs::write(&module, "package tls\n\ndefault allow := false\n").unwrap();
        let scripted = Arc::new(Scripted {
            value,
            seen: Mutex::new(Vec::new()),
        });
        let settings = EngineSettings {
            output_dir: dir.join("out"),
            debug: true,
            ..Default::default()
        };
        let engine = Engine::builder(Bundle::default(), settings)
            .host(HostIdentity::from_parts("h", "linux", "x86_64"))
            .rego(scripted.clone())
            .build()
            .unwrap();
        let policy = Policy {
            id: "tls-required".into(),
            kind: PolicyType::Rego,
            enforcement: vec![Enforcement {
                environment: "all".into(),
                fatal: "true".into(),
                ..Default::default()
            }],
            rego: RegoSpec {
                policy_file: module.display().to_string(),
                policy_data: None,
                policy_query: "data.tls".into(),
            },
            ..Default::default()
        };
        (engine, scripted, policy)
    }

    #[tokio::test]
    async fn one_summary_per_file_with_violation_details() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("svc.json");
        std::fs::write(&input, r#"{"tls": false}"#).unwrap();
        let (engine, scripted, policy) =
            setup(dir.path(), json!({"allow": false, "violations": ["tls disabled"]}));
        let job = PolicyJob::new(
            policy,
            Some(dir.path().to_path_buf()),
            vec![ScannedFile {
                path: input.clone(),
                sha256: String::new(),
            }],
        );

        let results = RegoEvaluator.evaluate(&engine, &job).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_summary());
        assert_eq!(results[0].level, SarifLevel::Error);
        assert!(results[0].message.text.ends_with("with 1 violations"));
        assert!(results[1].message.text.contains("Violation [ tls disabled ]"));
        assert_eq!(scripted.seen.lock().unwrap()[0], json!({"tls": false}));
        assert!(engine
            .layout()
            .debug_dir()
            .join("rego_trace_tls-required.json")
            .exists());
    }

    #[tokio::test]
    async fn mismatched_query_package_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _, mut policy) = setup(dir.path(), json!(true));
        policy.rego.policy_query = "data.other.allow".into();
        let job = PolicyJob::new(policy, None, Vec::new());
        let err = RegoEvaluator.evaluate(&engine, &job).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn without_files_evaluates_once_against_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, scripted, policy) = setup(dir.path(), json!(true));
        let job = PolicyJob::new(policy, None, Vec::new());
        let results = RegoEvaluator.evaluate(&engine, &job).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, SarifLevel::Note);
        assert_eq!(results[0].uri(), Some("N/A"));
        assert_eq!(scripted.seen.lock().unwrap().len(), 1);
    }
}
