//! Filesystem change detection.
//!
//! [`PollingWatcher`] snapshots size and mtime of every watched path (and of
//! every file below a watched directory) on a fixed interval. A path that
//! disappears stays registered, so an editor-style remove-and-recreate is
//! picked up on the next poll. [`Debouncer`] collapses bursts per path.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::InterceptError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Write,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// How successive events for one path collapse into evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebounceMode {
    /// Fire on the first event, ignore the rest of the window.
    #[default]
    First,
    /// Fire once the path has been quiet for a full window.
    Last,
    /// Fire on every event.
    All,
}

impl FromStr for DebounceMode {
    type Err = InterceptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "all" => Ok(Self::All),
            other => Err(InterceptError::config(format!(
                "unknown observe mode '{other}' (expected first, last or all)"
            ))),
        }
    }
}

/// Source of filesystem events.
pub trait Watcher: Send + Sync {
    /// Stream change events for `paths` until `cancel` fires.
    fn watch(&self, paths: Vec<PathBuf>, cancel: CancellationToken) -> mpsc::Receiver<WatchEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSnapshot {
    len: u64,
    modified: Option<SystemTime>,
}

type Snapshot = BTreeMap<PathBuf, FileSnapshot>;

fn snapshot_paths(roots: &[PathBuf]) -> Snapshot {
    let mut out = Snapshot::new();
    for root in roots {
        if root.is_dir() {
            for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
                record(&mut out, entry.path());
            }
        } else {
            record(&mut out, root);
        }
    }
    out
}

fn record(out: &mut Snapshot, path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() {
            out.insert(
                path.to_path_buf(),
                FileSnapshot {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
            );
        }
    }
}

fn diff(prev: &Snapshot, curr: &Snapshot) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    for (path, state) in curr {
        match prev.get(path) {
            None => events.push(WatchEvent {
                path: path.clone(),
                kind: ChangeKind::Create,
            }),
            Some(old) if old != state => events.push(WatchEvent {
                path: path.clone(),
                kind: ChangeKind::Write,
            }),
            Some(_) => {}
        }
    }
    for path in prev.keys().filter(|p| !curr.contains_key(*p)) {
        events.push(WatchEvent {
            path: path.clone(),
            kind: ChangeKind::Remove,
        });
    }
    events
}

/// Interval-based watcher that works the same on every platform.
#[derive(Debug, Clone)]
pub struct PollingWatcher {
    interval: Duration,
}

impl Default for PollingWatcher {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Watcher for PollingWatcher {
    fn watch(&self, paths: Vec<PathBuf>, cancel: CancellationToken) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut state = snapshot_paths(&paths);
            debug!(paths = paths.len(), files = state.len(), "path watcher ready");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let current = snapshot_paths(&paths);
                for event in diff(&state, &current) {
                    trace!(path = %event.path.display(), kind = ?event.kind, "watcher caught change");
                    if event.kind == ChangeKind::Remove {
                        debug!(path = %event.path.display(), "path removed, watch stays armed");
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                state = current;
            }
        });
        rx
    }
}

/// Per-path burst collapsing for one [`DebounceMode`].
#[derive(Debug)]
pub struct Debouncer {
    mode: DebounceMode,
    window: Duration,
    last_fired: HashMap<PathBuf, Instant>,
    pending: HashMap<PathBuf, (WatchEvent, Instant)>,
}

impl Debouncer {
    pub fn new(mode: DebounceMode, window: Duration) -> Self {
        Self {
            mode,
            window,
            last_fired: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Feed one event; returns it when it should fire immediately.
    pub fn offer(&mut self, event: WatchEvent, now: Instant) -> Option<WatchEvent> {
        match self.mode {
            DebounceMode::All => Some(event),
            DebounceMode::First => {
                self.last_fired
                    .retain(|_, fired| now.duration_since(*fired) <= self.window);
                if self.last_fired.contains_key(&event.path) {
                    debug!(path = %event.path.display(), "ignored duplicate event within window");
                    return None;
                }
                self.last_fired.insert(event.path.clone(), now);
                Some(event)
            }
            DebounceMode::Last => {
                self.pending.insert(event.path.clone(), (event, now));
                None
            }
        }
    }

    /// Events whose path has been quiet for a full window (`last` mode).
    pub fn drain_quiet(&mut self, now: Instant) -> Vec<WatchEvent> {
        let window = self.window;
        let quiet: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, seen))| now.duration_since(*seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        let mut out: Vec<WatchEvent> = quiet
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|(event, _)| event))
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Earliest moment a pending event becomes quiet.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, seen)| *seen + self.window).min()
    }
}

/// Apply `mode` to a raw event stream.
pub fn debounced(
    mut raw: mpsc::Receiver<WatchEvent>,
    mode: DebounceMode,
    window: Duration,
    cancel: CancellationToken,
) -> mpsc::Receiver<WatchEvent> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut debouncer = Debouncer::new(mode, window);
        loop {
            let deadline = debouncer.next_deadline();
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = raw.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
                _ = sleep_until(deadline) => None,
            };
            let now = Instant::now();
            let mut ready = Vec::new();
            if let Some(event) = event {
                ready.extend(debouncer.offer(event, now));
            }
            ready.extend(debouncer.drain_quiet(now));
            for event in ready {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    });
    rx
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
