//! Long-running observer: cron ticks and filesystem events drive policy
//! re-evaluation; a report task merges what accumulated.

pub mod cron;
pub mod path_cache;
pub mod retention;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatcher, PolicyOutcome};
use crate::engine::Engine;
use crate::error::{InterceptError, InterceptResult};
use crate::eval::PolicyJob;
use crate::filter::PolicyFilter;
use crate::host::sha256_hex;
use crate::model::{normalize_filename, Policy};
use crate::run_id::RunId;
use crate::sarif::MergedReport;
use crate::target::{filter_by_pattern, is_ignored, scan_target, ScannedFile};

pub use cron::{CronSchedule, Scheduler};
pub use path_cache::PathCache;
pub use retention::{manage_status_reports, RetentionPolicy, RetentionSummary};
pub use watcher::{debounced, DebounceMode, PollingWatcher, WatchEvent, Watcher};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line overrides and tuning for [`Observer`].
#[derive(Debug, Clone)]
pub struct ObserveOptions {
    /// Replaces `Config.Flags.policy_schedule`.
    pub policy_schedule: Option<String>,
    /// Replaces `Config.Flags.report_schedule`.
    pub report_schedule: Option<String>,
    pub mode: DebounceMode,
    pub debounce_window: Duration,
    pub shutdown_grace: Duration,
    pub retention: RetentionPolicy,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self {
            policy_schedule: None,
            report_schedule: None,
            mode: DebounceMode::default(),
            debounce_window: watcher::DEFAULT_DEBOUNCE_WINDOW,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tick {
    Policy(String),
    Report,
}

/// What the observer did before it stopped.
#[derive(Debug, Default)]
pub struct ObserveSummary {
    pub ticks: usize,
    pub events: usize,
    pub reports: usize,
    pub outcomes: Vec<PolicyOutcome>,
    pub final_report: Option<MergedReport>,
}

/// State shared with spawned evaluations.
struct Shared {
    engine: Arc<Engine>,
    dispatcher: Arc<Dispatcher>,
    policies: HashMap<String, Policy>,
    paths: PathCache,
    retention: RetentionPolicy,
}

impl Shared {
    /// Evaluate `policy` under a fresh run id. `observed` is the watched
    /// path that changed, if an event triggered the run.
    async fn evaluate(&self, policy: &Policy, observed: Option<&Path>) -> PolicyOutcome {
        let mut policy = policy.clone();
        policy.run_id = Some(format!("{}-{}", RunId::new(), normalize_filename(&policy.id)));
        let engine = &self.engine;

        if !policy.kind.needs_target() {
            let target = observed.map(Path::to_path_buf).or_else(|| engine.target_dir());
            return self
                .dispatcher
                .run_policy(engine, PolicyJob::new(policy, target, Vec::new()))
                .await;
        }

        let (target, files) = match observed {
            Some(path) => (Some(path.to_path_buf()), collect_observed(path, &engine.ignore_rules())),
            None => match engine.target_dir() {
                Some(dir) => {
                    let files = scan_target(&dir, &engine.ignore_rules());
                    (Some(dir), files)
                }
                None => (None, Err(InterceptError::config("no target directory configured"))),
            },
        };
        let files = files.and_then(|files| filter_by_pattern(&files, policy.file_pattern.as_deref()));
        match files {
            Ok(files) => {
                self.dispatcher
                    .run_policy(engine, PolicyJob::new(policy, target, files))
                    .await
            }
            Err(e) => {
                self.dispatcher
                    .record_failure(engine, &policy, &e.to_string())
                    .await
            }
        }
    }

    async fn tick(&self, tick: &Tick) -> Option<PolicyOutcome> {
        match tick {
            Tick::Policy(id) => match self.policies.get(id) {
                Some(policy) => Some(self.evaluate(policy, None).await),
                None => {
                    warn!(policy = %id, "scheduled policy no longer registered");
                    None
                }
            },
            Tick::Report => {
                if let Err(e) = self.report().await {
                    error!(error = %e, "scheduled report failed");
                }
                None
            }
        }
    }

    /// Merge into `_status/`, fan out, then apply retention.
    async fn report(&self) -> InterceptResult<Option<MergedReport>> {
        let merged = self.engine.merge(true)?;
        match &merged {
            Some(merged) => {
                info!(
                    path = %merged.path.display(),
                    compliant = merged.is_compliant(),
                    "observe report written"
                );
                if !self.engine.sinks().is_empty() {
                    self.engine.sinks().report_completed(&merged.report).await;
                }
            }
            None => debug!("no policy results since last report"),
        }

        let status_dir = self.engine.layout().status_dir();
        match manage_status_reports(&status_dir, self.retention, SystemTime::now()) {
            Ok(summary) if summary.compressed + summary.deleted > 0 => {
                info!(compressed = summary.compressed, deleted = summary.deleted, "status retention applied");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "status retention failed"),
        }
        Ok(merged)
    }
}

/// Files under an observed path: the file itself or a walk of the directory.
fn collect_observed(path: &Path, ignore: &[String]) -> InterceptResult<Vec<ScannedFile>> {
    if path.is_dir() {
        return scan_target(path, ignore);
    }
    if is_ignored(ignore, path) {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path).map_err(|e| InterceptError::Target {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(vec![ScannedFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(&bytes),
    }])
}

pub struct Observer {
    shared: Arc<Shared>,
    scheduler: Scheduler<Tick>,
    watcher: Arc<dyn Watcher>,
    watched: Vec<PathBuf>,
    skipped: Vec<String>,
    options: ObserveOptions,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("scheduled", &self.scheduler.len())
            .field("watched", &self.watched)
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl Observer {
    /// Register cron entries and watched paths for every policy selected by
    /// `filter`. Bad per-policy settings are logged and skipped; an invalid
    /// report schedule is a configuration error.
    pub fn new(
        engine: Arc<Engine>,
        dispatcher: Arc<Dispatcher>,
        filter: &PolicyFilter,
        options: ObserveOptions,
    ) -> InterceptResult<Self> {
        let layout = engine.layout();
        layout.ensure_writable()?;
        layout.prepare(true)?;
        layout.clear_scratch()?;

        let flags = &engine.bundle().config.flags;
        let global = options
            .policy_schedule
            .clone()
            .or_else(|| flags.policy_schedule.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let report = options
            .report_schedule
            .clone()
            .or_else(|| flags.report_schedule.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let now = Utc::now();
        let mut scheduler = Scheduler::default();
        let paths = PathCache::default();
        let mut policies = HashMap::new();
        let mut watched = Vec::new();
        let mut skipped = Vec::new();

        for policy in filter.apply(engine.bundle().policies.clone()) {
            let observe = policy.observe_path().map(PathBuf::from);
            let own = policy.schedule().map(str::to_string);

            if let (Some(schedule), Some(path)) = (&own, &observe) {
                error!(
                    policy = %policy.id,
                    schedule = %schedule,
                    observe = %path.display(),
                    "policy has both a schedule and an observe path; skipping"
                );
                skipped.push(policy.id.clone());
                continue;
            }

            if let Some(path) = observe {
                if !path.exists() {
                    warn!(policy = %policy.id, observe = %path.display(), "observe path does not exist; skipping");
                    skipped.push(policy.id.clone());
                    continue;
                }
                match paths.register(&path, policy.clone()) {
                    Ok(key) => {
                        info!(policy = %policy.id, path = %key, "watching");
                        watched.push(path);
                        policies.insert(policy.id.clone(), policy);
                    }
                    Err(e) => {
                        error!(policy = %policy.id, error = %e, "observe path rejected; skipping");
                        skipped.push(policy.id.clone());
                    }
                }
                continue;
            }

            let Some(expr) = own.or_else(|| global.clone()) else {
                debug!(policy = %policy.id, "no schedule or observe path; not observed");
                skipped.push(policy.id.clone());
                continue;
            };
            match CronSchedule::parse(&expr) {
                Ok(schedule) => {
                    info!(policy = %policy.id, schedule = %schedule, "scheduled");
                    scheduler.add(Tick::Policy(policy.id.clone()), schedule, now);
                    policies.insert(policy.id.clone(), policy);
                }
                Err(e) => {
                    error!(policy = %policy.id, error = %e, "invalid schedule; skipping");
                    skipped.push(policy.id.clone());
                }
            }
        }

        if let Some(expr) = report {
            let schedule = CronSchedule::parse(&expr)
                .map_err(|e| InterceptError::config(format!("report schedule: {e}")))?;
            info!(schedule = %schedule, "report task scheduled");
            scheduler.add(Tick::Report, schedule, now);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                dispatcher,
                policies,
                paths,
                retention: options.retention,
            }),
            scheduler,
            watcher: Arc::new(PollingWatcher::default()),
            watched,
            skipped,
            options,
        })
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn scheduled(&self) -> usize {
        self.scheduler.len()
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn path_cache(&self) -> &PathCache {
        &self.shared.paths
    }

    /// Run until the engine's cancel token fires, then drain and merge once more.
    pub async fn run(mut self) -> InterceptResult<ObserveSummary> {
        let shared = self.shared.clone();
        let cancel = shared.engine.cancel_token().clone();
        let permits = Arc::new(Semaphore::new(shared.engine.settings().concurrency.max(1)));
        let mut in_flight: JoinSet<Option<PolicyOutcome>> = JoinSet::new();
        let mut summary = ObserveSummary::default();

        let mut events = if self.watched.is_empty() {
            None
        } else {
            let raw = self.watcher.watch(self.watched.clone(), cancel.child_token());
            Some(debounced(raw, self.options.mode, self.options.debounce_window, cancel.clone()))
        };

        info!(
            scheduled = self.scheduler.len(),
            watched = self.watched.len(),
            skipped = self.skipped.len(),
            "observer started"
        );

        loop {
            let wait = self
                .scheduler
                .next_wakeup()
                .map(|at| (at - Utc::now()).to_std().unwrap_or_default());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_opt(wait) => {
                    for tick in self.scheduler.due(Utc::now()) {
                        summary.ticks += 1;
                        if tick == Tick::Report {
                            summary.reports += 1;
                            shared.tick(&tick).await;
                            continue;
                        }
                        let shared = shared.clone();
                        let permits = permits.clone();
                        in_flight.spawn(async move {
                            let _permit = permits.acquire_owned().await.ok()?;
                            shared.tick(&tick).await
                        });
                    }
                }
                event = recv_opt(&mut events) => match event {
                    Some(event) => {
                        summary.events += 1;
                        match shared.paths.lookup(&event.path) {
                            Some(policy) => {
                                info!(policy = %policy.id, path = %event.path.display(), kind = ?event.kind, "change detected");
                                let shared = shared.clone();
                                let permits = permits.clone();
                                in_flight.spawn(async move {
                                    let _permit = permits.acquire_owned().await.ok()?;
                                    let observed = policy.observe_path().map(PathBuf::from);
                                    Some(shared.evaluate(&policy, observed.as_deref()).await)
                                });
                            }
                            None => debug!(path = %event.path.display(), "no policy owns changed path"),
                        }
                    }
                    None => {
                        warn!("watcher stopped; continuing with schedules only");
                        events = None;
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    collect(&mut summary, joined);
                }
            }
        }

        info!(in_flight = in_flight.len(), "observer shutting down");
        let drain = async {
            while let Some(joined) = in_flight.join_next().await {
                collect(&mut summary, joined);
            }
        };
        if tokio::time::timeout(self.options.shutdown_grace, drain).await.is_err() {
            warn!(grace = ?self.options.shutdown_grace, "in-flight evaluations did not finish; aborting");
            in_flight.abort_all();
        }

        summary.final_report = shared.report().await?;
        summary.outcomes.sort_by(|a, b| a.policy_id.cmp(&b.policy_id));
        info!(
            ticks = summary.ticks,
            events = summary.events,
            evaluations = summary.outcomes.len(),
            "observer stopped"
        );
        Ok(summary)
    }
}

fn collect(summary: &mut ObserveSummary, joined: Result<Option<PolicyOutcome>, tokio::task::JoinError>) {
    match joined {
        Ok(Some(outcome)) => summary.outcomes.push(outcome),
        Ok(None) => {}
        Err(e) => error!(error = %e, "observed evaluation aborted"),
    }
}

async fn sleep_opt(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<WatchEvent>>) -> Option<WatchEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM.
pub fn cancel_on_shutdown_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = terminate => info!("received SIGTERM"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
}
