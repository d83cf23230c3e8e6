//! Policy evaluators.
//!
//! One evaluator per policy type. Each turns a [`PolicyJob`] into SARIF
//! results, ending with exactly one `summary` result. Internal failures are
//! returned as errors and converted into a fail-closed summary by the
//! dispatcher.

pub mod api;
pub mod assure;
pub mod pattern;
pub mod rego;
pub mod runtime;
pub mod scan;
pub mod schema;
pub mod status;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::engine::Engine;
use crate::model::Policy;
use crate::sarif::SarifResult;
use crate::target::ScannedFile;

/// Inputs for one policy execution.
#[derive(Debug, Clone)]
pub struct PolicyJob {
    /// Policy with its run id stamped.
    pub policy: Policy,
    pub target: Option<PathBuf>,
    /// Files already filtered by the policy's file pattern.
    pub files: Vec<ScannedFile>,
}

impl PolicyJob {
    pub fn new(policy: Policy, target: Option<PathBuf>, files: Vec<ScannedFile>) -> Self {
        Self {
            policy,
            target,
            files,
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    /// Hash of everything the evaluator reads: policy body and file hashes.
    pub fn input_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut policy = self.policy.clone();
        policy.run_id = None;
        if let Ok(body) = serde_json::to_vec(&policy) {
            hasher.update(body);
        }
        for file in &self.files {
            hasher.update(file.path.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(file.sha256.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, engine: &Engine, job: &PolicyJob) -> anyhow::Result<Vec<SarifResult>>;

    /// Whether identical inputs may be served from the result cache.
    fn cacheable(&self, _job: &PolicyJob) -> bool {
        false
    }
}

/// Display form of a path for SARIF URIs.
pub(crate) fn uri_of(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_hash_ignores_run_id_but_tracks_content() {
        let policy = Policy {
            id: "p".into(),
            run_id: Some("a".into()),
            ..Default::default()
        };
        let file = ScannedFile {
            path: PathBuf::from("x.txt"),
            sha256: "00".into(),
        };
        let a = PolicyJob::new(policy.clone(), None, vec![file.clone()]);
        let mut other = policy;
        other.run_id = Some("b".into());
        let b = PolicyJob::new(other, None, vec![file.clone()]);
        assert_eq!(a.input_hash(), b.input_hash());

        let changed = ScannedFile {
            sha256: "01".into(),
            ..file
        };
        let c = PolicyJob::new(a.policy.clone(), None, vec![changed]);
        assert_ne!(a.input_hash(), c.input_hash());
    }
}
