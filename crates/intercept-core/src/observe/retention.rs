//! `_status/` housekeeping: gzip old merged reports, then prune.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};

use crate::error::InterceptResult;

pub const COMPRESSED_SUFFIX: &str = ".gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub compress_after: Duration,
    pub delete_after: Duration,
    pub max_bytes: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            compress_after: Duration::from_secs(24 * 60 * 60),
            delete_after: Duration::from_secs(30 * 24 * 60 * 60),
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub compressed: usize,
    pub deleted: usize,
    pub remaining_bytes: u64,
}

#[derive(Debug)]
struct StatusFile {
    path: PathBuf,
    created: SystemTime,
    size: u64,
}

/// Creation time of a status report: the `%Y%m%dT%H%M%SZ` name prefix when
/// present, else the file's mtime. Compression does not reset it.
fn created_at(path: &Path, modified: SystemTime) -> SystemTime {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('_').next())
        .and_then(|prefix| NaiveDateTime::parse_from_str(prefix, "%Y%m%dT%H%M%SZ").ok())
        .map(|naive| SystemTime::from(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)))
        .unwrap_or(modified)
}

fn list(dir: &Path) -> InterceptResult<Vec<StatusFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                warn!(file = %entry.path().display(), error = %e, "failed to stat status report");
                continue;
            }
        };
        let path = entry.path();
        let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
        files.push(StatusFile {
            created: created_at(&path, modified),
            size: meta.len(),
            path,
        });
    }
    files.sort_by_key(|f| f.created);
    Ok(files)
}

fn compress(path: &Path) -> InterceptResult<PathBuf> {
    let mut target = path.as_os_str().to_owned();
    target.push(COMPRESSED_SUFFIX);
    let target = PathBuf::from(target);

    let mut input = BufReader::new(File::open(path)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(&target)?), Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(target)
}

/// Compress reports older than `compress_after`, delete those older than
/// `delete_after`, then delete oldest-first while the directory is over
/// `max_bytes`.
pub fn manage_status_reports(
    dir: &Path,
    policy: RetentionPolicy,
    now: SystemTime,
) -> InterceptResult<RetentionSummary> {
    std::fs::create_dir_all(dir)?;
    let age = |created: SystemTime| now.duration_since(created).unwrap_or_default();

    let mut summary = RetentionSummary::default();
    let mut kept = Vec::new();
    for mut file in list(dir)? {
        if age(file.created) > policy.delete_after {
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    summary.deleted += 1;
                    info!(file = %file.path.display(), "deleted expired status report");
                }
                Err(e) => warn!(file = %file.path.display(), error = %e, "failed to delete status report"),
            }
            continue;
        }
        let is_compressed = file
            .path
            .to_string_lossy()
            .ends_with(COMPRESSED_SUFFIX);
        if !is_compressed && age(file.created) > policy.compress_after {
            match compress(&file.path) {
                Ok(target) => {
                    summary.compressed += 1;
                    info!(file = %target.display(), "compressed status report");
                    file.size = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(file.size);
                    file.path = target;
                }
                Err(e) => warn!(file = %file.path.display(), error = %e, "failed to compress status report"),
            }
        }
        kept.push(file);
    }

    let mut total: u64 = kept.iter().map(|f| f.size).sum();
    for file in &kept {
        if total <= policy.max_bytes {
            break;
        }
        match std::fs::remove_file(&file.path) {
            Ok(()) => {
                total = total.saturating_sub(file.size);
                summary.deleted += 1;
                info!(file = %file.path.display(), "deleted status report over size limit");
            }
            Err(e) => warn!(file = %file.path.display(), error = %e, "failed to delete status report"),
        }
    }
    summary.remaining_bytes = total;
    Ok(summary)
}
