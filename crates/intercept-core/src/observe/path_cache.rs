//! Watched path to owning policy.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{InterceptError, InterceptResult};
use crate::model::Policy;

/// Canonical key: cleaned, `/`-separated, no leading `./`, lowercased on
/// Windows. Directory keys end in `/`.
pub fn normalize_key(path: &Path, is_dir: bool) -> String {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    let mut key = cleaned.to_string_lossy().replace('\\', "/");
    if cfg!(windows) {
        key = key.to_lowercase();
    }
    if is_dir && !key.is_empty() && !key.ends_with('/') {
        key.push('/');
    }
    key
}

/// Thread-safe map from observe path to policy. Entries live as long as the
/// observer.
#[derive(Debug, Default)]
pub struct PathCache {
    entries: RwLock<HashMap<String, Policy>>,
}

impl PathCache {
    /// Register `path` for `policy`. Paths overlapping an existing entry are
    /// rejected.
    pub fn register(&self, path: &Path, policy: Policy) -> InterceptResult<String> {
        let key = normalize_key(path, path.is_dir());
        if key.is_empty() {
            return Err(InterceptError::config(format!(
                "policy {}: empty observe path",
                policy.id
            )));
        }

        let mut entries = self.entries.write();
        if let Some((existing, owner)) = entries
            .iter()
            .find(|(existing, _)| overlaps(existing, &key))
        {
            return Err(InterceptError::config(format!(
                "policy {}: observe path {key} overlaps {existing} owned by {}",
                policy.id, owner.id
            )));
        }
        entries.insert(key.clone(), policy);
        Ok(key)
    }

    /// Policy owning `path`, trying the exact file then its directory.
    pub fn lookup(&self, path: &Path) -> Option<Policy> {
        let entries = self.entries.read();
        if let Some(policy) = entries.get(&normalize_key(path, false)) {
            return Some(policy.clone());
        }
        if let Some(policy) = entries.get(&normalize_key(path, true)) {
            return Some(policy.clone());
        }
        let parent = path.parent()?;
        entries.get(&normalize_key(parent, true)).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lookup(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Component-wise prefix match in either direction.
fn overlaps(a: &str, b: &str) -> bool {
    let (a, b) = (Path::new(a), Path::new(b));
    a.starts_with(b) || b.starts_with(a)
}
