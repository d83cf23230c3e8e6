//! Policy dispatch.
//!
//! The [`Dispatcher`] is a typed event bus: one evaluator bound per
//! `policy.<type>` event. Publishing a job runs the bound evaluator, writes
//! the per-policy SARIF artifact and hands the report to the compliance log
//! and the per-policy hooks.

pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info, warn};

use crate::cache;
use crate::engine::Engine;
use crate::error::{InterceptError, InterceptResult};
use crate::eval::api::ApiEvaluator;
use crate::eval::assure::AssureEvaluator;
use crate::eval::rego::RegoEvaluator;
use crate::eval::runtime::RuntimeEvaluator;
use crate::eval::scan::ScanEvaluator;
use crate::eval::schema::SchemaEvaluator;
use crate::eval::{Evaluator, PolicyJob};
use crate::model::{DocumentFormat, Policy, PolicyType};
use crate::sarif::{self, Driver, InvocationProperties, ResultFactory, SarifReport, SarifResult};
use crate::severity::{self, SarifLevel};

pub use pool::{run_audit, AuditSummary};

/// Event name for a policy type.
pub fn event_name(kind: PolicyType) -> String {
    format!("policy.{kind}")
}

/// Outcome of one policy execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub policy_id: String,
    pub compliant: bool,
    /// An `error` result fired under a `fatal: true` enforcement.
    pub fatal: bool,
    pub results: usize,
    pub cached: bool,
}

#[derive(Default)]
pub struct Dispatcher {
    listeners: HashMap<String, Arc<dyn Evaluator>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut events: Vec<_> = self.listeners.keys().collect();
        events.sort();
        f.debug_struct("Dispatcher").field("events", &events).finish()
    }
}

impl Dispatcher {
    /// Dispatcher with every built-in evaluator bound.
    pub fn standard() -> Self {
        let mut dispatcher = Self::default();
        let bindings: [(PolicyType, Arc<dyn Evaluator>); 9] = [
            (PolicyType::Scan, Arc::new(ScanEvaluator)),
            (PolicyType::Assure, Arc::new(AssureEvaluator)),
            (PolicyType::Api, Arc::new(ApiEvaluator)),
            (PolicyType::Runtime, Arc::new(RuntimeEvaluator)),
            (PolicyType::Rego, Arc::new(RegoEvaluator)),
            (PolicyType::Yml, Arc::new(SchemaEvaluator::new(DocumentFormat::Yaml))),
            (PolicyType::Toml, Arc::new(SchemaEvaluator::new(DocumentFormat::Toml))),
            (PolicyType::Json, Arc::new(SchemaEvaluator::new(DocumentFormat::Json))),
            (PolicyType::Ini, Arc::new(SchemaEvaluator::new(DocumentFormat::Ini))),
        ];
        for (kind, evaluator) in bindings {
            dispatcher.listeners.insert(event_name(kind), evaluator);
        }
        dispatcher
    }

    /// Bind `evaluator` to `policy.<kind>`. Each event takes one listener.
    pub fn bind(&mut self, kind: PolicyType, evaluator: Arc<dyn Evaluator>) -> InterceptResult<()> {
        let event = event_name(kind);
        if self.listeners.contains_key(&event) {
            return Err(InterceptError::config(format!("{event} already has a listener")));
        }
        self.listeners.insert(event, evaluator);
        Ok(())
    }

    /// Swap the listener for `policy.<kind>`.
    pub fn rebind(&mut self, kind: PolicyType, evaluator: Arc<dyn Evaluator>) {
        self.listeners.insert(event_name(kind), evaluator);
    }

    pub fn listener(&self, kind: PolicyType) -> Option<&Arc<dyn Evaluator>> {
        self.listeners.get(&event_name(kind))
    }

    /// Publish `policy.<type>` for `job` and persist the outcome.
    pub async fn run_policy(&self, engine: &Engine, job: PolicyJob) -> PolicyOutcome {
        let policy = &job.policy;
        let event = event_name(policy.kind);
        debug!(policy = %policy.id, event = %event, files = job.files.len(), "dispatching policy");

        let (results, cached) = match self.listeners.get(&event) {
            Some(evaluator) => self.evaluate(engine, evaluator.as_ref(), &job).await,
            None => {
                let factory = ResultFactory::new(policy, engine.environment());
                error!(policy = %policy.id, event = %event, "no evaluator bound");
                (
                    vec![factory.evaluation_error(&format!("no evaluator bound for {event}"))],
                    false,
                )
            }
        };

        self.complete(engine, policy, results, cached).await
    }

    /// Record a policy that could not be evaluated, e.g. an unreadable target.
    pub async fn record_failure(&self, engine: &Engine, policy: &Policy, message: &str) -> PolicyOutcome {
        let factory = ResultFactory::new(policy, engine.environment());
        let result = factory.summary(
            factory.failing_level(),
            format!("Policy {} target error: {message}", policy.id),
            vec![sarif::Location::not_applicable()],
        );
        self.complete(engine, policy, vec![result], false).await
    }

    async fn evaluate(
        &self,
        engine: &Engine,
        evaluator: &dyn Evaluator,
        job: &PolicyJob,
    ) -> (Vec<SarifResult>, bool) {
        let policy = &job.policy;
        let cache_key = (engine.settings().cache_results && evaluator.cacheable(job))
            .then(|| cache::key(&policy.id, &job.input_hash()));

        if let Some(key) = &cache_key {
            if let Some(hit) = engine.cache().get(key) {
                debug!(policy = %policy.id, "serving cached results");
                let observe_run_id = policy.observe_run_id();
                let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                let results = hit
                    .iter()
                    .cloned()
                    .map(|mut r| {
                        r.properties.observe_run_id.clone_from(&observe_run_id);
                        r.properties.result_timestamp.clone_from(&timestamp);
                        r
                    })
                    .collect();
                return (results, true);
            }
        }

        let outcome = tokio::select! {
            outcome = evaluator.evaluate(engine, job) => outcome,
            _ = engine.cancel_token().cancelled() => Err(anyhow::anyhow!("evaluation cancelled")),
        };

        match outcome {
            Ok(results) => {
                if let Some(key) = cache_key {
                    engine.cache().insert(key, results.clone());
                }
                (results, false)
            }
            Err(e) => {
                let err = InterceptError::evaluator(policy.id.as_str(), format!("{e:#}"));
                error!(policy = %policy.id, error = %err, "policy failed closed");
                let factory = ResultFactory::new(policy, engine.environment());
                (vec![factory.evaluation_error(&format!("{e:#}"))], false)
            }
        }
    }

    async fn complete(
        &self,
        engine: &Engine,
        policy: &Policy,
        results: Vec<SarifResult>,
        cached: bool,
    ) -> PolicyOutcome {
        let fatal = severity::is_fatal_in(policy, engine.environment())
            && results.iter().any(|r| r.level == SarifLevel::Error);
        let count = results.len();

        let report = policy_report(engine, policy, results);
        let compliant = report.is_compliant();

        let path = engine.layout().policy_sarif(&policy.artifact_stem());
        if let Err(e) = sarif::write_report(&path, &report) {
            error!(policy = %policy.id, path = %path.display(), error = %e, "failed to write policy SARIF");
        }

        if engine.settings().has_output("LOG") {
            if let Some(log) = engine.compliance_log() {
                if let Err(e) = log.record_policy(&report, engine.run_id()) {
                    warn!(policy = %policy.id, error = %e, "failed to write compliance log");
                }
            }
        }
        if !engine.sinks().is_empty() {
            engine.sinks().policy_completed(&report).await;
        }

        info!(policy = %policy.id, compliant, fatal, results = count, cached, "policy evaluated");
        PolicyOutcome {
            policy_id: policy.id.clone(),
            compliant,
            fatal,
            results: count,
            cached,
        }
    }
}

/// Single-policy SARIF document with its own invocation record.
fn policy_report(engine: &Engine, policy: &Policy, results: Vec<SarifResult>) -> SarifReport {
    let rules = engine
        .rules()
        .iter()
        .filter(|r| r.id == policy.id)
        .cloned()
        .collect();
    let mut report = SarifReport::new(Driver::intercept(rules), results);
    let compliant = report.is_compliant();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let run_id = policy
        .run_id
        .clone()
        .unwrap_or_else(|| engine.run_id().to_string());

    if let Some(invocation) = report.runs.first_mut().and_then(|r| r.invocations.first_mut()) {
        invocation.command_line = Some(engine.settings().command_line.clone());
        invocation.properties = InvocationProperties {
            run_id: Some(run_id),
            environment: Some(engine.environment().to_string()),
            debug: Some(engine.debug().to_string()),
            report_timestamp: Some(now),
            host_data: Some(engine.host().data.clone()),
            host_fingerprint: Some(engine.host().fingerprint.clone()),
            report_status: Some(if compliant { "compliant" } else { "non-compliant" }.to_string()),
            report_compliant: compliant,
            ..Default::default()
        };
    }
    report
}
