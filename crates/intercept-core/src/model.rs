//! Policy bundle data model.
//!
//! A bundle is a YAML document with a `Config` block, a semantic `Version`,
//! a `Namespace` and an ordered list of `Policies`. Policy records are flat on
//! the wire (`_schema`, `_rego`, `_regex`, `_api`, `_runtime`); [`Policy::spec`]
//! exposes them as a tagged union keyed by the policy type.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Root document of a policy bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "Config", default)]
    pub config: Config,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
    #[serde(rename = "Policies", default)]
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "Flags", default)]
    pub flags: Flags,
    #[serde(rename = "Metadata", default)]
    pub metadata: ConfigMetadata,
    #[serde(rename = "Hooks", default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookConfig>,
}

/// Bundle-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Index name used by bulk sinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_schedule: Option<String>,
    /// Name of the environment variable holding the webhook secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    /// Record shapes written to the compliance log (`minimal`, `results`, `policy`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    #[serde(rename = "MsgExitClean", default, skip_serializing_if = "Option::is_none")]
    pub msg_exit_clean: Option<String>,
    #[serde(rename = "MsgExitWarning", default, skip_serializing_if = "Option::is_none")]
    pub msg_exit_warning: Option<String>,
    #[serde(rename = "MsgExitCritical", default, skip_serializing_if = "Option::is_none")]
    pub msg_exit_critical: Option<String>,
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth: BTreeMap<String, String>,
    #[serde(default = "default_hook_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub event_types: Vec<String>,
}

fn default_hook_method() -> String {
    "POST".to_string()
}

fn default_retry_delay() -> String {
    "1s".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl HookConfig {
    /// Case-insensitive membership test on `event_types`.
    pub fn has_event(&self, event: &str) -> bool {
        self.event_types
            .iter()
            .any(|e| e.trim().eq_ignore_ascii_case(event))
    }
}

/// Recognized policy type tags.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    #[default]
    Scan,
    Assure,
    Api,
    Runtime,
    #[serde(alias = "yaml")]
    Yml,
    Toml,
    Json,
    Ini,
    Rego,
}

impl PolicyType {
    pub const ALL: [PolicyType; 9] = [
        PolicyType::Scan,
        PolicyType::Assure,
        PolicyType::Api,
        PolicyType::Runtime,
        PolicyType::Yml,
        PolicyType::Toml,
        PolicyType::Json,
        PolicyType::Ini,
        PolicyType::Rego,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::Scan => "scan",
            PolicyType::Assure => "assure",
            PolicyType::Api => "api",
            PolicyType::Runtime => "runtime",
            PolicyType::Yml => "yml",
            PolicyType::Toml => "toml",
            PolicyType::Json => "json",
            PolicyType::Ini => "ini",
            PolicyType::Rego => "rego",
        }
    }

    /// Whether this type evaluates files from the target tree.
    pub fn needs_target(&self) -> bool {
        !matches!(
            self,
            PolicyType::Api | PolicyType::Runtime | PolicyType::Rego
        )
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document formats understood by the schema evaluators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Toml,
    Json,
    Ini,
}

impl DocumentFormat {
    /// File extension used for patched copies.
    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Yaml => "yaml",
            DocumentFormat::Toml => "toml",
            DocumentFormat::Json => "json",
            DocumentFormat::Ini => "ini",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub intercept_id: String,
    #[serde(
        rename = "intercept_run_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(rename = "type")]
    pub kind: PolicyType,
    #[serde(default)]
    pub enforcement: Vec<Enforcement>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(
        rename = "filepattern",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub file_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observe: Option<String>,
    #[serde(rename = "_schema", default, skip_serializing_if = "SchemaSpec::is_empty")]
    pub schema: SchemaSpec,
    #[serde(rename = "_rego", default, skip_serializing_if = "RegoSpec::is_empty")]
    pub rego: RegoSpec,
    #[serde(rename = "_regex", default, skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<String>,
    #[serde(rename = "_api", default, skip_serializing_if = "ApiSpec::is_empty")]
    pub api: ApiSpec,
    #[serde(rename = "_runtime", default, skip_serializing_if = "RuntimeSpec::is_empty")]
    pub runtime: RuntimeSpec,
}

/// Evaluator-specific view of a policy.
#[derive(Debug, Clone, Copy)]
pub enum PolicySpec<'a> {
    Scan {
        patterns: &'a [String],
    },
    Assure {
        patterns: &'a [String],
    },
    Api {
        api: &'a ApiSpec,
        patterns: &'a [String],
        schema: &'a SchemaSpec,
    },
    Runtime {
        runtime: &'a RuntimeSpec,
    },
    Schema {
        format: DocumentFormat,
        schema: &'a SchemaSpec,
    },
    Rego {
        rego: &'a RegoSpec,
    },
}

impl Policy {
    pub fn spec(&self) -> PolicySpec<'_> {
        match self.kind {
            PolicyType::Scan => PolicySpec::Scan {
                patterns: &self.regex,
            },
            PolicyType::Assure => PolicySpec::Assure {
                patterns: &self.regex,
            },
            PolicyType::Api => PolicySpec::Api {
                api: &self.api,
                patterns: &self.regex,
                schema: &self.schema,
            },
            PolicyType::Runtime => PolicySpec::Runtime {
                runtime: &self.runtime,
            },
            PolicyType::Yml => self.schema_spec(DocumentFormat::Yaml),
            PolicyType::Toml => self.schema_spec(DocumentFormat::Toml),
            PolicyType::Json => self.schema_spec(DocumentFormat::Json),
            PolicyType::Ini => self.schema_spec(DocumentFormat::Ini),
            PolicyType::Rego => PolicySpec::Rego { rego: &self.rego },
        }
    }

    fn schema_spec(&self, format: DocumentFormat) -> PolicySpec<'_> {
        PolicySpec::Schema {
            format,
            schema: &self.schema,
        }
    }

    /// Path watched by the observer, if any.
    pub fn observe_path(&self) -> Option<&str> {
        self.observe
            .as_deref()
            .or(self.runtime.observe.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn schedule(&self) -> Option<&str> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// File name stem for per-run artifacts.
    pub fn artifact_stem(&self) -> String {
        match &self.run_id {
            Some(run_id) if !run_id.is_empty() => run_id.clone(),
            _ => normalize_filename(&self.id),
        }
    }

    /// Run id echoed into result properties (`N/A` outside a dispatch).
    pub fn observe_run_id(&self) -> String {
        self.run_id.clone().unwrap_or_else(|| "N/A".to_string())
    }
}

/// Enforcement profile for one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enforcement {
    #[serde(default)]
    pub environment: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub fatal: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub exceptions: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub confidence: String,
}

impl Enforcement {
    pub fn is_fatal(&self) -> bool {
        self.fatal.trim().eq_ignore_ascii_case("true")
    }

    pub fn has_exceptions(&self) -> bool {
        self.exceptions.trim().eq_ignore_ascii_case("true")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub score: String,
    #[serde(default)]
    pub msg_solution: String,
    #[serde(default)]
    pub msg_error: String,
    /// Pre-computed target paths for observe mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_info: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    #[serde(default)]
    pub structure: String,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub patch: bool,
}

impl SchemaSpec {
    pub fn is_empty(&self) -> bool {
        self.structure.trim().is_empty() && !self.strict && !self.patch
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegoSpec {
    #[serde(default)]
    pub policy_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_data: Option<String>,
    #[serde(default)]
    pub policy_query: String,
}

impl RegoSpec {
    pub fn is_empty(&self) -> bool {
        self.policy_file.is_empty() && self.policy_data.is_none() && self.policy_query.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSpec {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth: BTreeMap<String, String>,
}

impl ApiSpec {
    pub fn is_empty(&self) -> bool {
        self.endpoint.is_empty()
            && self.method.is_empty()
            && self.response_type.is_empty()
            && self.body.is_none()
            && self.auth.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observe: Option<String>,
}

impl RuntimeSpec {
    pub fn is_empty(&self) -> bool {
        self.config.is_empty() && self.observe.is_none()
    }
}

/// Accepts YAML scalars (`true`, `3`, `"high"`) as strings.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s,
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected a scalar, found {other:?}"
            )))
        }
    })
}

/// Normalize a policy id: whitespace and `_` become `-`, letters and digits
/// are lowercased, everything else is dropped.
pub fn normalize_policy_id(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() || c == '_' {
                Some('-')
            } else if c.is_alphanumeric() || c == '-' {
                Some(c.to_lowercase().next().unwrap_or(c))
            } else {
                None
            }
        })
        .collect()
}

/// File-system safe form of an identifier.
pub fn normalize_filename(input: &str) -> String {
    normalize_policy_id(input)
}
