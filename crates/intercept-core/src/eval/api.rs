//! HTTP endpoint checks.
//!
//! One request per policy. The body is matched against `_regex` when
//! patterns are present, otherwise parsed as JSON and validated against
//! `_schema.structure`.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::pattern::SearchRequest;
use super::schema::parse_schema;
use super::{Evaluator, PolicyJob};
use crate::engine::Engine;
use crate::http::{self, auth_header, env_lookup};
use crate::model::Policy;
use crate::sarif::{Location, ResultFactory, SarifResult};
use crate::severity::SarifLevel;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy)]
pub struct ApiEvaluator;

/// Response body, or the reason there is none.
enum Fetched {
    Body(Vec<u8>),
    Failed(String),
}

/// `INTERCEPT_<ID>` with the id uppercased and `-` mapped to `_`.
pub fn fallback_var(policy_id: &str) -> String {
    format!("INTERCEPT_{}", policy_id.to_uppercase().replace('-', "_"))
}

impl ApiEvaluator {
    async fn fetch(&self, engine: &Engine, policy: &Policy) -> anyhow::Result<Fetched> {
        let api = &policy.api;
        if api.endpoint.trim().is_empty() {
            bail!("policy has no API endpoint");
        }
        let method = if api.method.trim().is_empty() {
            Method::GET
        } else {
            Method::from_bytes(api.method.trim().to_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method {:?}", api.method))?
        };
        let fallback = fallback_var(&policy.id);
        let auth = auth_header(&api.auth, Some(fallback.as_str()), env_lookup)?;
        let client = http::client(REQUEST_TIMEOUT, api.insecure)?;

        let attempts = engine.settings().api_attempts.max(1);
        let base_backoff = engine.settings().api_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = client.request(method.clone(), api.endpoint.trim());
            if !api.response_type.trim().is_empty() {
                request = request.header(CONTENT_TYPE, api.response_type.trim());
            }
            if let Some((name, value)) = &auth {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(body) = api.body.as_deref().filter(|b| !b.is_empty()) {
                if method != Method::GET {
                    request = request.body(body.to_string());
                }
            }

            let failure = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let body = response.bytes().await.context("failed to read API response")?;
                    return Ok(Fetched::Body(body.to_vec()));
                }
                Ok(response) if response.status().is_server_error() => status_text(response.status()),
                Ok(response) => return Ok(Fetched::Failed(status_text(response.status()))),
                Err(e) => e.to_string(),
            };

            if attempt >= attempts {
                return Ok(Fetched::Failed(failure));
            }
            let backoff = base_backoff * (1u32 << (attempt - 1).min(16));
            warn!(
                policy = %policy.id,
                error = %failure,
                retry = attempt,
                max_retries = attempts - 1,
                backoff_ms = backoff.as_millis() as u64,
                "retrying API request"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn body_matches(&self, engine: &Engine, policy: &Policy, body: &[u8]) -> anyhow::Result<bool> {
        let mut scratch = tempfile::Builder::new()
            .prefix("api_response_")
            .suffix(".json")
            .tempfile()
            .context("failed to create response file")?;
        scratch.write_all(body)?;
        scratch.flush()?;
        let files = vec![scratch.path().to_path_buf()];
        let matches = engine
            .searcher()
            .search(SearchRequest {
                patterns: &policy.regex,
                files: &files,
                ignore: &[],
            })
            .await?;
        Ok(!matches.is_empty())
    }
}

fn status_text(status: StatusCode) -> String {
    format!("HTTP {status}")
}

#[async_trait]
impl Evaluator for ApiEvaluator {
    async fn evaluate(&self, engine: &Engine, job: &PolicyJob) -> anyhow::Result<Vec<SarifResult>> {
        let policy = &job.policy;
        let factory = ResultFactory::new(policy, engine.environment());
        let level = factory.failing_level();
        let endpoint = policy.api.endpoint.trim().to_string();
        let here = || vec![Location::artifact(endpoint.clone())];

        let body = match self.fetch(engine, policy).await? {
            Fetched::Body(body) => body,
            Fetched::Failed(reason) => {
                warn!(policy = %policy.id, endpoint = %endpoint, reason = %reason, "API request failed");
                return Ok(vec![factory.summary(
                    level,
                    format!("API request failed for policy {}: {reason}", policy.id),
                    here(),
                )]);
            }
        };
        debug!(policy = %policy.id, bytes = body.len(), "API response received");

        if !policy.regex.is_empty() {
            let found = self.body_matches(engine, policy, &body).await?;
            let mut results = Vec::new();
            if !found {
                results.push(factory.detail(
                    level,
                    "API validation issue: Required pattern not found in API response",
                    here(),
                ));
            }
            let message = if found {
                format!("API assurance passed for policy {}: Pattern found", policy.id)
            } else {
                format!("API assurance failed for policy {}: Pattern not found", policy.id)
            };
            results.push(factory.summary(factory.outcome_level(found), message, here()));
            return Ok(results);
        }

        if policy.schema.structure.trim().is_empty() {
            bail!("no processing method specified for policy {}", policy.id);
        }
        let schema = parse_schema(&policy.schema)?;
        let issues = match serde_json::from_slice::<Value>(&body) {
            Ok(doc) => engine.schema().validate(&doc, &schema, policy.schema.strict)?,
            Err(e) => vec![format!("Error parsing API response as JSON: {e}")],
        };

        let valid = issues.is_empty();
        let mut results: Vec<SarifResult> = issues
            .into_iter()
            .map(|issue| factory.detail(level, format!("API validation issue: {issue}"), here()))
            .collect();
        results.push(factory.summary(
            if valid { SarifLevel::Note } else { level },
            format!(
                "API validation {} for policy {}",
                if valid { "passed" } else { "failed" },
                policy.id
            ),
            here(),
        ));
        Ok(results)
    }
}
