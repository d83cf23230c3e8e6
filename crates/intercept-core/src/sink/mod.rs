//! Hook fan-out and the compliance log.
//!
//! Payload shape is chosen per hook from its event types. Per-policy
//! events (`minimal`, `policy`, `policy` with `bulk`) go out after each
//! policy run; report events (`results`, `results` with `bulk`, `report`)
//! go out from the merged report.
//! Delivery failures are logged and never change the run outcome.

pub mod http;
pub mod log;
pub mod payload;
pub mod signature;

use futures::future::join_all;
use tracing::{debug, error};

use crate::error::{InterceptError, InterceptResult};
use crate::host::HostIdentity;
use crate::model::{normalize_policy_id, HookConfig};
use crate::run_id::RunId;
use crate::sarif::SarifReport;
use payload::{policy_records, report_records, HookEnvelope, HookPayload, Stamp};

pub use signature::WebhookSecret;

pub const DEFAULT_BULK_INDEX: &str = "intercept";

/// Configured hooks plus everything needed to stamp and sign deliveries.
#[derive(Debug)]
pub struct SinkFanout {
    hooks: Vec<HookConfig>,
    secret: WebhookSecret,
    index: String,
    run_id: RunId,
    host: HostIdentity,
}

impl SinkFanout {
    pub fn new(
        hooks: Vec<HookConfig>,
        secret: WebhookSecret,
        index: Option<String>,
        run_id: RunId,
        host: HostIdentity,
    ) -> InterceptResult<Self> {
        for hook in &hooks {
            url::Url::parse(hook.endpoint.trim()).map_err(|e| {
                InterceptError::config(format!("hook {}: invalid endpoint {:?}: {e}", hook.name, hook.endpoint))
            })?;
        }
        Ok(Self {
            hooks,
            secret,
            index: index
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BULK_INDEX.to_string()),
            run_id,
            host,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn hooks(&self) -> &[HookConfig] {
        &self.hooks
    }

    pub fn secret(&self) -> &WebhookSecret {
        &self.secret
    }

    fn stamp(&self) -> Stamp {
        Stamp::now(self.host.fingerprint.clone(), self.run_id.as_str())
    }

    /// Payload for one hook after a single policy run, if it subscribes to one.
    pub fn policy_payload(
        &self,
        hook: &HookConfig,
        report: &SarifReport,
        stamp: &Stamp,
    ) -> InterceptResult<Option<HookPayload>> {
        let records = policy_records(report, stamp);
        let as_log = hook.has_event("log");
        let webhook_id = normalize_policy_id(&hook.name);

        if hook.has_event("policy") {
            if hook.has_event("bulk") {
                return Ok(Some(HookPayload::Bulk {
                    index: self.index.clone(),
                    results: report.results().cloned().collect(),
                }));
            }
            if as_log {
                return HookPayload::ndjson(&[&records.policy]).map(Some);
            }
            let mut envelope = HookEnvelope::new(webhook_id, stamp, &[&records.policy])?;
            if hook.has_event("datalake") {
                envelope.summary = Some(records.policy.summary.clone());
                envelope.results = Some(records.policy.results.clone());
            }
            return Ok(Some(HookPayload::Envelope(envelope)));
        }
        if hook.has_event("minimal") {
            if as_log {
                return HookPayload::ndjson(&[&records.minimal]).map(Some);
            }
            let envelope = HookEnvelope::new(webhook_id, stamp, &[&records.minimal])?;
            return Ok(Some(HookPayload::Envelope(envelope)));
        }
        Ok(None)
    }

    /// Payload for one hook from the merged report, if it subscribes to one.
    pub fn report_payload(
        &self,
        hook: &HookConfig,
        report: &SarifReport,
        stamp: &Stamp,
    ) -> InterceptResult<Option<HookPayload>> {
        let records = report_records(report, stamp);
        let as_log = hook.has_event("log");
        let webhook_id = normalize_policy_id(&hook.name);

        if hook.has_event("report") {
            if as_log {
                return HookPayload::ndjson(&[&records.report]).map(Some);
            }
            let envelope = HookEnvelope::new(webhook_id, stamp, &[&records.report])?;
            return Ok(Some(HookPayload::Envelope(envelope)));
        }
        if hook.has_event("results") {
            if hook.has_event("bulk") {
                return Ok(Some(HookPayload::Bulk {
                    index: self.index.clone(),
                    results: report.results().cloned().collect(),
                }));
            }
            if as_log {
                return HookPayload::ndjson(&records.results).map(Some);
            }
            let envelope = HookEnvelope::new(webhook_id, stamp, &records.results)?;
            return Ok(Some(HookPayload::Envelope(envelope)));
        }
        Ok(None)
    }

    /// Deliver per-policy events to every subscribed hook.
    pub async fn policy_completed(&self, report: &SarifReport) {
        let stamp = self.stamp();
        self.fan_out("policy", |hook| self.policy_payload(hook, report, &stamp))
            .await;
    }

    /// Deliver report events to every subscribed hook.
    pub async fn report_completed(&self, report: &SarifReport) {
        let stamp = self.stamp();
        self.fan_out("report", |hook| self.report_payload(hook, report, &stamp))
            .await;
    }

    async fn fan_out<F>(&self, stage: &str, build: F)
    where
        F: Fn(&HookConfig) -> InterceptResult<Option<HookPayload>>,
    {
        let mut deliveries = Vec::new();
        for hook in &self.hooks {
            match build(hook) {
                Ok(Some(payload)) if !payload.is_empty() => deliveries.push(async move {
                    if let Err(e) = http::deliver(hook, &payload, &self.secret).await {
                        error!(hook = %hook.name, stage, error = %e, "webhook delivery failed");
                    }
                }),
                Ok(_) => debug!(hook = %hook.name, stage, "no payload for hook"),
                Err(e) => error!(hook = %hook.name, stage, error = %e, "failed to build webhook payload"),
            }
        }
        join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Policy;
    use crate::sarif::{Driver, Location, ResultFactory};
    use crate::severity::SarifLevel;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hook(endpoint: &str, events: &[&str]) -> HookConfig {
        HookConfig {
            name: "Data Lake".into(),
            endpoint: endpoint.into(),
            insecure: false,
            auth: BTreeMap::new(),
            method: "POST".into(),
            headers: BTreeMap::new(),
            retry_attempts: 0,
            retry_delay: "1ms".into(),
            timeout_seconds: 5,
            event_types: events.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn report() -> SarifReport {
        let policy = Policy {
            id: "no-secrets".into(),
            ..Default::default()
        };
        let factory = ResultFactory::new(&policy, "");
        SarifReport::new(
            Driver::intercept(Vec::new()),
            vec![
                factory.detail(SarifLevel::Error, "leak", vec![Location::artifact("a.txt")]),
                factory.summary(SarifLevel::Error, "failed", vec![Location::not_applicable()]),
            ],
        )
    }

    fn fanout(hooks: Vec<HookConfig>) -> SinkFanout {
        SinkFanout::new(
            hooks,
            WebhookSecret::generate(),
            None,
            RunId::new(),
            HostIdentity::from_parts("h", "linux", "x86_64"),
        )
        .unwrap()
    }

    fn stamp() -> Stamp {
        Stamp::now("host", "run")
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let err = SinkFanout::new(
            vec![hook("not a url", &["minimal"])],
            WebhookSecret::generate(),
            None,
            RunId::new(),
            HostIdentity::from_parts("h", "linux", "x86_64"),
        )
        .unwrap_err();
        assert!(matches!(err, InterceptError::Config { .. }));
    }

    #[test]
    fn policy_with_datalake_splits_summary_and_results() {
        let sinks = fanout(Vec::new());
        let h = hook("http://localhost/", &["policy", "datalake"]);
        let Some(HookPayload::Envelope(envelope)) = sinks.policy_payload(&h, &report(), &stamp()).unwrap()
        else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.webhook_id, "data-lake");
        assert_eq!(envelope.event_count, 1);
        assert!(envelope.summary.unwrap().is_summary());
        assert_eq!(envelope.results.unwrap().len(), 1);
    }

    #[test]
    fn log_event_switches_to_ndjson() {
        let sinks = fanout(Vec::new());
        let h = hook("http://localhost/", &["minimal", "log"]);
        let payload = sinks.policy_payload(&h, &report(), &stamp()).unwrap().unwrap();
        assert!(matches!(payload, HookPayload::Ndjson(ref lines) if lines.len() == 1));

        let h = hook("http://localhost/", &["results", "log"]);
        let payload = sinks.report_payload(&h, &report(), &stamp()).unwrap().unwrap();
        assert!(matches!(payload, HookPayload::Ndjson(ref lines) if lines.len() == 2));
    }

    #[test]
    fn report_events_are_not_sent_per_policy() {
        let sinks = fanout(Vec::new());
        let h = hook("http://localhost/", &["results", "bulk"]);
        assert!(sinks.policy_payload(&h, &report(), &stamp()).unwrap().is_none());
        let h = hook("http://localhost/", &["minimal"]);
        assert!(sinks.report_payload(&h, &report(), &stamp()).unwrap().is_none());
    }

    #[test]
    fn policy_bulk_hook_gets_per_policy_bulk_body() {
        let sinks = fanout(Vec::new());
        let h = hook("http://localhost/", &["policy", "bulk"]);
        let payload = sinks.policy_payload(&h, &report(), &stamp()).unwrap().unwrap();
        let HookPayload::Bulk { results, .. } = &payload else {
            panic!("expected bulk payload");
        };
        assert_eq!(results.len(), 2);
        assert_eq!(payload.content_type(), payload::CONTENT_TYPE_NDJSON);
    }

    #[tokio::test]
    async fn bulk_hook_receives_alternating_lines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bulk"))
            .and(header("content-type", "application/x-ndjson"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sinks = fanout(vec![hook(&format!("{}/bulk", server.uri()), &["results", "bulk"])]);
        sinks.report_completed(&report()).await;

        let received = server.received_requests().await.unwrap();
        let body = String::from_utf8(received[0].body.clone()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains(r#""_index":"intercept""#));
        assert!(lines[1].contains(r#""ruleId":"no-secrets""#));
    }

    #[tokio::test]
    async fn delivery_failure_does_not_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let sinks = fanout(vec![hook(&server.uri(), &["minimal"])]);
        sinks.policy_completed(&report()).await;
    }
}
