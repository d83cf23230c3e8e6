//! Explicit engine context threaded through every evaluation.
//!
//! The [`Engine`] owns the loaded bundle, run-scoped identifiers, the output
//! layout, the pluggable backends (pattern search, runtime probing, rego,
//! schema validation), the status-handler slot, the result cache and the
//! sink fan-out. Nothing in the crate keeps process-wide mutable state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::ResultCache;
use crate::error::InterceptResult;
use crate::eval::pattern::{PatternSearcher, RipgrepSearcher};
use crate::eval::rego::{OpaCli, RegoEngine};
use crate::eval::runtime::{GossProber, RuntimeProber};
use crate::eval::schema::{JsonSchemaEngine, SchemaEngine};
use crate::eval::status::{StatusHandler, StatusSlot};
use crate::host::HostIdentity;
use crate::model::Bundle;
use crate::output::OutputLayout;
use crate::run_id::RunId;
use crate::sarif::{self, MergeOptions, MergedReport, Rule};
use crate::sink::log::ComplianceLog;
use crate::sink::{SinkFanout, WebhookSecret};

pub const DEFAULT_CONCURRENCY: usize = 100;
pub const DEFAULT_SCAN_BATCH: usize = 25;

/// External helper binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub rg: PathBuf,
    pub goss: PathBuf,
    pub opa: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rg: PathBuf::from("rg"),
            goss: PathBuf::from("goss"),
            opa: PathBuf::from("opa"),
        }
    }
}

impl ToolPaths {
    /// Defaults overridden by `INTERCEPT_RG_PATH`, `INTERCEPT_GOSS_PATH`, `INTERCEPT_OPA_PATH`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, fallback: PathBuf| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(fallback)
        };
        Self {
            rg: var("INTERCEPT_RG_PATH", defaults.rg),
            goss: var("INTERCEPT_GOSS_PATH", defaults.goss),
            opa: var("INTERCEPT_OPA_PATH", defaults.opa),
        }
    }
}

/// Runtime options that do not live in the bundle.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub output_dir: PathBuf,
    pub environment: String,
    pub debug: bool,
    pub concurrency: usize,
    pub scan_batch_size: usize,
    pub tools: ToolPaths,
    /// Exit non-zero when a fatal-severity result fires.
    pub break_on_fatal: bool,
    /// `SARIF`, `LOG`, `REPORT` (case-insensitive).
    pub output_types: Vec<String>,
    pub command_line: String,
    /// Overrides `Config.Flags.target`.
    pub target: Option<PathBuf>,
    /// Added to `Config.Flags.ignore`.
    pub ignore: Vec<String>,
    pub api_attempts: u32,
    pub api_backoff: Duration,
    /// Deduplicate identical evaluator inputs through the result cache.
    pub cache_results: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            environment: String::new(),
            debug: false,
            concurrency: DEFAULT_CONCURRENCY,
            scan_batch_size: DEFAULT_SCAN_BATCH,
            tools: ToolPaths::default(),
            break_on_fatal: true,
            output_types: vec!["SARIF".to_string()],
            command_line: String::new(),
            target: None,
            ignore: Vec::new(),
            api_attempts: 3,
            api_backoff: Duration::from_millis(500),
            cache_results: false,
        }
    }
}

impl EngineSettings {
    pub fn has_output(&self, kind: &str) -> bool {
        self.output_types
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(kind))
    }
}

pub struct Engine {
    settings: EngineSettings,
    bundle: Bundle,
    rules: Vec<Rule>,
    run_id: RunId,
    host: HostIdentity,
    layout: OutputLayout,
    searcher: Arc<dyn PatternSearcher>,
    prober: Arc<dyn RuntimeProber>,
    rego: Arc<dyn RegoEngine>,
    schema: Arc<dyn SchemaEngine>,
    status: StatusSlot,
    cache: ResultCache,
    sinks: SinkFanout,
    compliance_log: Option<ComplianceLog>,
    cancel: CancellationToken,
    started: DateTime<Utc>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("run_id", &self.run_id)
            .field("environment", &self.settings.environment)
            .field("policies", &self.bundle.policies.len())
            .field("output", &self.layout.root())
            .finish()
    }
}

impl Engine {
    pub fn builder(bundle: Bundle, settings: EngineSettings) -> EngineBuilder {
        EngineBuilder::new(bundle, settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn environment(&self) -> &str {
        &self.settings.environment
    }

    pub fn debug(&self) -> bool {
        self.settings.debug
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn searcher(&self) -> &dyn PatternSearcher {
        self.searcher.as_ref()
    }

    pub fn prober(&self) -> &dyn RuntimeProber {
        self.prober.as_ref()
    }

    pub fn rego(&self) -> &dyn RegoEngine {
        self.rego.as_ref()
    }

    pub fn schema(&self) -> &dyn SchemaEngine {
        self.schema.as_ref()
    }

    pub fn status(&self) -> &StatusSlot {
        &self.status
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn sinks(&self) -> &SinkFanout {
        &self.sinks
    }

    pub fn compliance_log(&self) -> Option<&ComplianceLog> {
        self.compliance_log.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// CLI target, else `Config.Flags.target`.
    pub fn target_dir(&self) -> Option<PathBuf> {
        self.settings.target.clone().or_else(|| {
            self.bundle
                .config
                .flags
                .target
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(PathBuf::from)
        })
    }

    /// Bundle ignore rules plus CLI additions.
    pub fn ignore_rules(&self) -> Vec<String> {
        let mut rules = self.bundle.config.flags.ignore.clone();
        rules.extend(self.settings.ignore.iter().cloned());
        rules
    }

    /// Merge `_sarif/` into the final report and record it in the compliance log.
    pub fn merge(&self, scheduled: bool) -> InterceptResult<Option<MergedReport>> {
        let merged = sarif::merge_reports(
            &self.layout,
            MergeOptions {
                run_id: &self.run_id,
                rules: self.rules.clone(),
                environment: &self.settings.environment,
                debug: self.settings.debug,
                host: &self.host,
                command_line: self.settings.command_line.clone(),
                started: self.started,
                ended: Utc::now(),
                scheduled,
            },
        )?;
        if let (Some(merged), Some(log)) = (&merged, &self.compliance_log) {
            if self.settings.has_output("REPORT") {
                log.record_report(&merged.report, &self.run_id)?;
            }
        }
        Ok(merged)
    }
}

/// Assembles an [`Engine`]; unset backends get their subprocess defaults.
pub struct EngineBuilder {
    bundle: Bundle,
    settings: EngineSettings,
    run_id: Option<RunId>,
    host: Option<HostIdentity>,
    searcher: Option<Arc<dyn PatternSearcher>>,
    prober: Option<Arc<dyn RuntimeProber>>,
    rego: Option<Arc<dyn RegoEngine>>,
    schema: Option<Arc<dyn SchemaEngine>>,
    status: Option<Arc<dyn StatusHandler>>,
    secret: Option<WebhookSecret>,
    cache: Option<ResultCache>,
    cancel: Option<CancellationToken>,
}

impl EngineBuilder {
    pub fn new(bundle: Bundle, settings: EngineSettings) -> Self {
        Self {
            bundle,
            settings,
            run_id: None,
            host: None,
            searcher: None,
            prober: None,
            rego: None,
            schema: None,
            status: None,
            secret: None,
            cache: None,
            cancel: None,
        }
    }

    pub fn run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn host(mut self, host: HostIdentity) -> Self {
        self.host = Some(host);
        self
    }

    pub fn searcher(mut self, searcher: Arc<dyn PatternSearcher>) -> Self {
        self.searcher = Some(searcher);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn RuntimeProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn rego(mut self, rego: Arc<dyn RegoEngine>) -> Self {
        self.rego = Some(rego);
        self
    }

    pub fn schema(mut self, schema: Arc<dyn SchemaEngine>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn status_handler(mut self, handler: Arc<dyn StatusHandler>) -> Self {
        self.status = Some(handler);
        self
    }

    pub fn webhook_secret(mut self, secret: WebhookSecret) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> InterceptResult<Engine> {
        let settings = self.settings;
        let layout = OutputLayout::new(settings.output_dir.clone());
        let run_id = self.run_id.unwrap_or_default();
        let host = self.host.unwrap_or_else(HostIdentity::detect);

        let searcher = self.searcher.unwrap_or_else(|| {
            Arc::new(RipgrepSearcher::new(
                settings.tools.rg.clone(),
                settings.scan_batch_size,
                std::env::temp_dir(),
            ))
        });
        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(GossProber::new(settings.tools.goss.clone())));
        let rego = self
            .rego
            .unwrap_or_else(|| Arc::new(OpaCli::new(settings.tools.opa.clone())));
        let schema = self
            .schema
            .unwrap_or_else(|| Arc::new(JsonSchemaEngine::default()));

        let status = StatusSlot::default();
        status.set(self.status);

        let flags = &self.bundle.config.flags;
        let secret = match self.secret {
            Some(secret) => secret,
            None => WebhookSecret::resolve(flags.webhook_secret.as_deref())?,
        };
        let sinks = SinkFanout::new(
            self.bundle.config.hooks.clone(),
            secret,
            flags.index.clone(),
            run_id.clone(),
            host.clone(),
        )?;

        let compliance_log = if settings.has_output("LOG") || settings.has_output("REPORT") {
            Some(ComplianceLog::open(
                layout.compliance_log(&run_id),
                &flags.log_types,
                &host,
            )?)
        } else {
            None
        };

        let rules = sarif::rules_for(&self.bundle, &settings.environment);

        info!(
            run_id = %run_id,
            environment = %settings.environment,
            policies = self.bundle.policies.len(),
            hooks = self.bundle.config.hooks.len(),
            "engine ready"
        );

        Ok(Engine {
            settings,
            bundle: self.bundle,
            rules,
            run_id,
            host,
            layout,
            searcher,
            prober,
            rego,
            schema,
            status,
            cache: self.cache.unwrap_or_default(),
            sinks,
            compliance_log,
            cancel: self.cancel.unwrap_or_default(),
            started: Utc::now(),
        })
    }
}
