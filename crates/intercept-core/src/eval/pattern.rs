//! Regex file search behind [`PatternSearcher`], backed by ripgrep.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::debug;

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
    /// Matches within the line, in order.
    pub submatches: Vec<Submatch>,
}

/// One match inside a line; `start..end` are byte offsets into the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl Submatch {
    pub fn new(text: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }

    /// 1-based character columns `(start, end)` within `line`, end exclusive.
    pub fn columns(&self, line: &str) -> (usize, usize) {
        let chars_before = |offset: usize| {
            line.get(..offset)
                .map(|prefix| prefix.chars().count())
                .unwrap_or_else(|| line.chars().count())
        };
        let start = chars_before(self.start) + 1;
        let width = line
            .get(self.start..self.end)
            .map_or_else(|| self.text.chars().count(), |m| m.chars().count());
        (start, start + width)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchRequest<'a> {
    pub patterns: &'a [String],
    pub files: &'a [PathBuf],
    pub ignore: &'a [String],
}

#[async_trait]
pub trait PatternSearcher: Send + Sync {
    async fn search(&self, request: SearchRequest<'_>) -> anyhow::Result<Vec<PatternMatch>>;
}

/// Runs `rg` in PCRE2/JSON mode over batches of files in parallel.
#[derive(Debug, Clone)]
pub struct RipgrepSearcher {
    rg_path: PathBuf,
    batch_size: usize,
    scratch_dir: PathBuf,
}

impl RipgrepSearcher {
    pub fn new(rg_path: impl Into<PathBuf>, batch_size: usize, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            rg_path: rg_path.into(),
            batch_size: batch_size.max(1),
            scratch_dir: scratch_dir.into(),
        }
    }

    fn base_args(pattern_file: &Path, ignore: &[String]) -> Vec<String> {
        let mut args: Vec<String> = ["--pcre2", "--no-heading", "-o", "-p", "-i", "-U", "--json", "-f"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(pattern_file.display().to_string());
        for rule in ignore.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
            args.push("--glob".to_string());
            args.push(format!("!{rule}"));
        }
        args
    }
}

#[async_trait]
impl PatternSearcher for RipgrepSearcher {
    async fn search(&self, request: SearchRequest<'_>) -> anyhow::Result<Vec<PatternMatch>> {
        if request.patterns.is_empty() || request.files.is_empty() {
            return Ok(Vec::new());
        }

        std::fs::create_dir_all(&self.scratch_dir)?;
        let mut pattern_file = tempfile::Builder::new()
            .prefix("search_patterns_")
            .tempfile_in(&self.scratch_dir)
            .context("failed to create pattern file")?;
        for pattern in request.patterns {
            writeln!(pattern_file, "{pattern}")?;
        }
        pattern_file.flush()?;

        let base = Arc::new(Self::base_args(pattern_file.path(), request.ignore));
        let mut set = JoinSet::new();
        for (index, batch) in request.files.chunks(self.batch_size).enumerate() {
            let rg = self.rg_path.clone();
            let base = base.clone();
            let batch: Vec<String> = batch.iter().map(|p| p.display().to_string()).collect();
            set.spawn(async move { (index, run_batch(&rg, &base, &batch).await) });
        }

        let mut batches = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (index, outcome) = joined.context("search batch panicked")?;
            batches.push((index, outcome?));
        }
        // Keep traversal order stable across runs.
        batches.sort_by_key(|(index, _)| *index);

        let matches: Vec<PatternMatch> = batches.into_iter().flat_map(|(_, m)| m).collect();
        debug!(files = request.files.len(), matches = matches.len(), "pattern search finished");
        Ok(matches)
    }
}

async fn run_batch(rg: &Path, base: &[String], files: &[String]) -> anyhow::Result<Vec<PatternMatch>> {
    let output = Command::new(rg)
        .args(base)
        .args(files)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to execute {}", rg.display()))?;

    match output.status.code() {
        Some(0) | Some(1) => Ok(parse_rg_json(&output.stdout)),
        code => bail!(
            "ripgrep exited with {:?}: {}",
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

#[derive(Deserialize)]
struct RgRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<RgData>,
}

#[derive(Deserialize)]
struct RgData {
    path: RgText,
    #[serde(default)]
    line_number: Option<usize>,
    lines: RgText,
    #[serde(default)]
    submatches: Vec<RgSubmatch>,
}

#[derive(Deserialize, Default)]
struct RgText {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct RgSubmatch {
    #[serde(rename = "match")]
    matched: RgText,
    #[serde(default)]
    start: usize,
    #[serde(default)]
    end: usize,
}

/// Parse `rg --json` output, keeping `match` records only.
pub fn parse_rg_json(stdout: &[u8]) -> Vec<PatternMatch> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<RgRecord>(l).ok())
        .filter(|r| r.kind == "match")
        .filter_map(|r| r.data)
        .map(|d| PatternMatch {
            path: d.path.text,
            line_number: d.line_number.unwrap_or(1).max(1),
            line: d.lines.text,
            submatches: d
                .submatches
                .into_iter()
                .map(|s| Submatch::new(s.matched.text, s.start, s.end))
                .collect(),
        })
        .collect()
}
