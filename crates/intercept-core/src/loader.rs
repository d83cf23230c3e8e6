//! Bundle loader: local files or remote URLs, optional checksum pinning,
//! id normalization and run-scoped identifiers.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{InterceptError, InterceptResult};
use crate::host::sha256_hex;
use crate::model::{normalize_filename, normalize_policy_id, Bundle};
use crate::run_id::RunId;

/// Where a bundle came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    File(PathBuf),
    Url(String),
    Inline,
}

impl fmt::Display for BundleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleSource::File(path) => write!(f, "file:{}", path.display()),
            BundleSource::Url(url) => write!(f, "{url}"),
            BundleSource::Inline => f.write_str("inline"),
        }
    }
}

/// A parsed and normalized bundle.
#[derive(Debug, Clone)]
pub struct LoadedBundle {
    pub bundle: Bundle,
    /// SHA-256 of the raw bundle bytes.
    pub digest: String,
    pub source: BundleSource,
}

/// Load a bundle from a path or an `http(s)` URL.
pub async fn load_bundle(
    reference: &str,
    checksum: Option<&str>,
    run_id: &RunId,
) -> InterceptResult<LoadedBundle> {
    if is_url(reference) {
        let content = fetch_remote(reference).await?;
        return load_bundle_from_bytes(&content, BundleSource::Url(reference.to_string()), checksum, run_id);
    }
    load_bundle_from_file(Path::new(reference), checksum, run_id)
}

pub fn load_bundle_from_file(
    path: &Path,
    checksum: Option<&str>,
    run_id: &RunId,
) -> InterceptResult<LoadedBundle> {
    let source = BundleSource::File(path.to_path_buf());
    let content = std::fs::read(path).map_err(|e| InterceptError::Load {
        source_ref: source.to_string(),
        message: e.to_string(),
    })?;
    load_bundle_from_bytes(&content, source, checksum, run_id)
}

pub fn load_bundle_from_str(content: &str, run_id: &RunId) -> InterceptResult<LoadedBundle> {
    load_bundle_from_bytes(content.as_bytes(), BundleSource::Inline, None, run_id)
}

fn load_bundle_from_bytes(
    content: &[u8],
    source: BundleSource,
    checksum: Option<&str>,
    run_id: &RunId,
) -> InterceptResult<LoadedBundle> {
    let digest = sha256_hex(content);
    if let Some(expected) = checksum.map(str::trim).filter(|c| !c.is_empty()) {
        if !expected.eq_ignore_ascii_case(&digest) {
            return Err(InterceptError::Integrity {
                source_ref: source.to_string(),
                expected: expected.to_string(),
                actual: digest,
            });
        }
    }

    let mut bundle: Bundle =
        serde_yaml::from_slice(content).map_err(|e| InterceptError::Load {
            source_ref: source.to_string(),
            message: e.to_string(),
        })?;

    normalize_bundle(&mut bundle, run_id).map_err(|message| InterceptError::Load {
        source_ref: source.to_string(),
        message,
    })?;

    info!(
        source = %source,
        policies = bundle.policies.len(),
        version = %bundle.version,
        "loaded policy bundle"
    );

    Ok(LoadedBundle {
        bundle,
        digest,
        source,
    })
}

/// Normalize ids, self-tag every policy and stamp intercept ids.
fn normalize_bundle(bundle: &mut Bundle, run_id: &RunId) -> Result<(), String> {
    let mut seen = HashSet::new();
    for policy in &mut bundle.policies {
        let id = normalize_policy_id(&policy.id);
        if id.is_empty() {
            return Err(format!("policy id '{}' is empty after normalization", policy.id));
        }
        if !seen.insert(id.clone()) {
            return Err(format!("duplicate policy id '{id}'"));
        }
        policy.id = id.clone();
        policy.intercept_id = format!("{}-{}", run_id, normalize_filename(&id));
        if !policy.metadata.tags.iter().any(|t| t == &id) {
            policy.metadata.tags.push(id);
        }
    }
    Ok(())
}

async fn fetch_remote(url: &str) -> InterceptResult<Vec<u8>> {
    debug!(url, "fetching remote policy bundle");
    let response = reqwest::get(url).await.map_err(|e| InterceptError::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(InterceptError::Fetch {
            url: url.to_string(),
            message: format!("HTTP status {}", status.as_u16()),
        });
    }

    let bytes = response.bytes().await.map_err(|e| InterceptError::Fetch {
        url: url.to_string(),
        message: format!("failed to read response body: {e}"),
    })?;
    Ok(bytes.to_vec())
}

pub fn is_url(input: &str) -> bool {
    (input.starts_with("http://") || input.starts_with("https://")) && url::Url::parse(input).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r#"
Version: "1.0.0"
Namespace: test
Config:
  Flags:
    policy_schedule: "*/5 * * * *"
Policies:
  - id: "No Secrets"
    type: scan
    enforcement:
      - environment: all
        fatal: "true"
        exceptions: "false"
        confidence: high
    metadata:
      name: No secrets
      tags: [security]
    _regex: ["AKIA[0-9A-Z]{16}"]
  - id: Config_Check
    type: json
    _schema:
      structure: '{"type":"object"}'
"#;

    #[test]
    fn normalizes_and_self_tags() {
        let run_id = RunId::new();
        let loaded = load_bundle_from_str(BUNDLE, &run_id).unwrap();
        let ids: Vec<_> = loaded.bundle.policies.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["no-secrets", "config-check"]);

        let first = &loaded.bundle.policies[0];
        assert_eq!(first.metadata.tags, vec!["security", "no-secrets"]);
        assert_eq!(first.intercept_id, format!("{run_id}-no-secrets"));
    }

    #[test]
    fn loading_twice_is_identical() {
        let run_id = RunId::new();
        let a = load_bundle_from_str(BUNDLE, &run_id).unwrap();
        let b = load_bundle_from_str(BUNDLE, &run_id).unwrap();
        assert_eq!(
            serde_yaml::to_string(&a.bundle.policies).unwrap(),
            serde_yaml::to_string(&b.bundle.policies).unwrap()
        );
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn rejects_duplicate_ids_after_normalization() {
        let yaml = "Policies:\n  - id: A_B\n    type: scan\n  - id: a-b\n    type: scan\n";
        let err = load_bundle_from_str(yaml, &RunId::new()).unwrap_err();
        assert!(matches!(err, InterceptError::Load { .. }), "{err}");
    }

    #[test]
    fn checksum_mismatch_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, BUNDLE).unwrap();

        let err = load_bundle_from_file(&path, Some("deadbeef"), &RunId::new()).unwrap_err();
        assert!(matches!(err, InterceptError::Integrity { .. }));

        let digest = sha256_hex(BUNDLE.as_bytes());
        assert!(load_bundle_from_file(&path, Some(&digest), &RunId::new()).is_ok());
    }

    #[test]
    fn bad_yaml_is_load_error() {
        let err = load_bundle_from_str("Policies: [", &RunId::new()).unwrap_err();
        assert!(matches!(err, InterceptError::Load { .. }));
    }

    #[test]
    fn detects_urls() {
        assert!(is_url("https://example.com/policy.yaml"));
        assert!(!is_url("policy.yaml"));
        assert!(!is_url("ftp://example.com/policy.yaml"));
    }
}
