//! Target tree walking and per-policy file selection.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{InterceptError, InterceptResult};
use crate::host::sha256_hex;

/// A regular file found under the target root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    scanned: &'a [ScannedFile],
}

/// Walk `root`, hashing every regular file not matched by `ignore`.
///
/// Entries are visited in file-name order so repeated walks of an unchanged
/// tree yield the same list.
pub fn scan_target(root: &Path, ignore: &[String]) -> InterceptResult<Vec<ScannedFile>> {
    if !root.is_dir() {
        return Err(InterceptError::Target {
            path: root.display().to_string(),
            message: "target directory does not exist".to_string(),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || is_ignored(ignore, entry.path()) {
            continue;
        }
        match std::fs::read(entry.path()) {
            Ok(bytes) => files.push(ScannedFile {
                path: entry.path().to_path_buf(),
                sha256: sha256_hex(&bytes),
            }),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to hash file"),
        }
    }

    debug!(root = %root.display(), files = files.len(), "target scanned");
    Ok(files)
}

/// Ignore rules: `*.ext` matches by extension, `dir/` matches anywhere the
/// absolute directory appears, anything else is an absolute prefix match.
pub fn is_ignored(ignore: &[String], path: &Path) -> bool {
    let abs_path = absolute(path);
    let abs_str = abs_path.to_string_lossy();

    ignore.iter().any(|rule| {
        let rule = rule.trim();
        if rule.is_empty() {
            return false;
        }
        if let Some(ext) = rule.strip_prefix("*.") {
            return abs_path
                .extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
                .unwrap_or(false);
        }
        let abs_rule = absolute(Path::new(rule));
        let abs_rule = abs_rule.to_string_lossy();
        if rule.ends_with('/') {
            abs_str.contains(abs_rule.as_ref())
        } else {
            abs_str.starts_with(abs_rule.as_ref())
        }
    })
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Keep files whose path matches `pattern`; no pattern keeps everything.
pub fn filter_by_pattern(
    files: &[ScannedFile],
    pattern: Option<&str>,
) -> InterceptResult<Vec<ScannedFile>> {
    let Some(pattern) = pattern.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(files.to_vec());
    };
    let regex = Regex::new(pattern)
        .map_err(|e| InterceptError::config(format!("invalid filepattern '{pattern}': {e}")))?;
    Ok(files
        .iter()
        .filter(|f| regex.is_match(&f.path.to_string_lossy()))
        .cloned()
        .collect())
}

/// Write `_debug/scanned_files_<policy>.json`.
pub fn write_manifest(debug_dir: &Path, policy: &str, files: &[ScannedFile]) -> InterceptResult<()> {
    let path = debug_dir.join(format!("scanned_files_{policy}.json"));
    let body = serde_json::to_vec_pretty(&Manifest { scanned: files })?;
    std::fs::write(&path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("vendor")).unwrap();
        std::fs::write(dir.path().join("src/main.tf"), "resource {}").unwrap();
        std::fs::write(dir.path().join("src/readme.md"), "# docs").unwrap();
        std::fs::write(dir.path().join("vendor/lib.tf"), "module {}").unwrap();
        dir
    }

    #[test]
    fn hashes_every_file() {
        let dir = tree();
        let files = scan_target(dir.path(), &[]).unwrap();
        assert_eq!(files.len(), 3);
        let main = files.iter().find(|f| f.path.ends_with("main.tf")).unwrap();
        assert_eq!(main.sha256, sha256_hex(b"resource {}"));
    }

    #[test]
    fn ignores_extensions_and_directories() {
        let dir = tree();
        let vendor = format!("{}/", dir.path().join("vendor").display());
        let files = scan_target(dir.path(), &["*.MD".to_string(), vendor]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["main.tf"]);
    }

    #[test]
    fn missing_root_is_target_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_target(&dir.path().join("nope"), &[]).unwrap_err();
        assert!(matches!(err, InterceptError::Target { .. }));
    }

    #[test]
    fn filters_by_pattern() {
        let dir = tree();
        let files = scan_target(dir.path(), &[]).unwrap();
        let tf = filter_by_pattern(&files, Some(r"\.tf$")).unwrap();
        assert_eq!(tf.len(), 2);
        assert_eq!(filter_by_pattern(&files, None).unwrap().len(), 3);
        assert!(filter_by_pattern(&files, Some("(")).is_err());
    }

    #[test]
    fn writes_manifest() {
        let dir = tree();
        let files = scan_target(dir.path(), &[]).unwrap();
        write_manifest(dir.path(), "p1", &files).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("scanned_files_p1.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["scanned"].as_array().unwrap().len(), 3);
    }
}
