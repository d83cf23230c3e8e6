//! Output directory layout.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{InterceptError, InterceptResult};
use crate::run_id::RunId;

pub const SARIF_DIR: &str = "_sarif";
pub const STATUS_DIR: &str = "_status";
pub const PATCHED_DIR: &str = "_patched";
pub const DEBUG_DIR: &str = "_debug";
pub const RPE_DIR: &str = "_rpe";

const WRITE_PROBE: &str = ".test_write";

/// Paths of every artifact under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            root
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sarif_dir(&self) -> PathBuf {
        self.root.join(SARIF_DIR)
    }

    pub fn status_dir(&self) -> PathBuf {
        self.root.join(STATUS_DIR)
    }

    pub fn patched_dir(&self) -> PathBuf {
        self.root.join(PATCHED_DIR)
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.root.join(DEBUG_DIR)
    }

    pub fn rpe_dir(&self) -> PathBuf {
        self.root.join(RPE_DIR)
    }

    /// `_sarif/<stem>.sarif`
    pub fn policy_sarif(&self, stem: &str) -> PathBuf {
        self.sarif_dir().join(format!("{stem}.sarif"))
    }

    pub fn merged_report(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join(format!("intercept_{}.sarif.json", run_id.short()))
    }

    /// `_status/<UTC>_intercept_<short>.sarif.json`
    pub fn status_report(&self, run_id: &RunId, utc: &str) -> PathBuf {
        self.status_dir()
            .join(format!("{utc}_intercept_{}.sarif.json", run_id.short()))
    }

    pub fn compliance_log(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join(format!("c_log_intercept_{}.log", run_id.short()))
    }

    pub fn diagnostics_log(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join(format!("log_intercept_{}.log", run_id.short()))
    }

    /// Create the root and scratch directories; `_status` when observing.
    pub fn prepare(&self, observing: bool) -> InterceptResult<()> {
        std::fs::create_dir_all(&self.root)?;
        let mut dirs = vec![self.sarif_dir(), self.debug_dir(), self.patched_dir()];
        if observing {
            dirs.push(self.status_dir());
        }
        for dir in dirs {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Empty `_sarif`, `_debug` and `_patched`.
    pub fn clear_scratch(&self) -> InterceptResult<()> {
        for dir in [self.sarif_dir(), self.debug_dir(), self.patched_dir()] {
            clear_dir(&dir)?;
        }
        Ok(())
    }

    /// Fail unless the output root accepts writes.
    pub fn ensure_writable(&self) -> InterceptResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            InterceptError::config(format!(
                "output directory {} cannot be created: {e}",
                self.root.display()
            ))
        })?;
        let probe = self.root.join(WRITE_PROBE);
        std::fs::write(&probe, b"").map_err(|e| {
            InterceptError::config(format!(
                "output directory {} is not writable: {e}",
                self.root.display()
            ))
        })?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clear_dir(dir: &Path) -> InterceptResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    debug!(dir = %dir.display(), "cleared directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepares_and_clears_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path().join("out"));
        layout.prepare(true).unwrap();
        assert!(layout.sarif_dir().is_dir());
        assert!(layout.status_dir().is_dir());
        assert!(!layout.rpe_dir().exists());

        std::fs::write(layout.policy_sarif("p1"), "{}").unwrap();
        std::fs::create_dir_all(layout.debug_dir().join("nested")).unwrap();
        layout.clear_scratch().unwrap();
        assert!(layout.sarif_dir().is_dir());
        assert_eq!(std::fs::read_dir(layout.sarif_dir()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(layout.debug_dir()).unwrap().count(), 0);
    }

    #[test]
    fn artifact_names_use_short_run_id() {
        let layout = OutputLayout::new("out");
        let run_id = RunId::new();
        let merged = layout.merged_report(&run_id);
        assert_eq!(
            merged.file_name().unwrap().to_string_lossy(),
            format!("intercept_{}.sarif.json", run_id.short())
        );
        let status = layout.status_report(&run_id, "20240101T000000Z");
        assert!(status.starts_with("out/_status"));
    }

    #[test]
    fn writable_probe_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.ensure_writable().unwrap();
        assert!(!dir.path().join(WRITE_PROBE).exists());
    }
}
