//! Webhook delivery with signing and retry.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use tracing::{info, warn};

use super::payload::HookPayload;
use super::signature::WebhookSecret;
use crate::error::{InterceptError, InterceptResult};
use crate::http::{self, auth_header, env_lookup};
use crate::model::HookConfig;

pub const SIGNATURE_HEADER: &str = "X-Signature";

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// `retry_delay` as a humantime duration; invalid values fall back to 1 s.
pub fn retry_delay(hook: &HookConfig) -> Duration {
    humantime::parse_duration(hook.retry_delay.trim()).unwrap_or(DEFAULT_RETRY_DELAY)
}

/// POST (or the hook's method) `payload` to `hook.endpoint`.
///
/// Makes `retry_attempts + 1` attempts spaced by `retry_delay`. Returns the
/// final HTTP status on success.
pub async fn deliver(
    hook: &HookConfig,
    payload: &HookPayload,
    secret: &WebhookSecret,
) -> InterceptResult<u16> {
    let body = payload.to_body()?;
    let signature = secret.sign(&body)?;
    let method = Method::from_bytes(hook.method.trim().to_uppercase().as_bytes())
        .map_err(|e| InterceptError::config(format!("hook {}: invalid method: {e}", hook.name)))?;
    let auth = auth_header(&hook.auth, None, env_lookup)?;
    let client = http::client(Duration::from_secs(hook.timeout_seconds.max(1)), hook.insecure)?;

    let event_type = hook.event_types.join(",");
    let attempts = hook.retry_attempts.saturating_add(1);
    let delay = retry_delay(hook);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let mut request = client
            .request(method.clone(), hook.endpoint.trim())
            .header(CONTENT_TYPE, payload.content_type())
            .header(SIGNATURE_HEADER, signature.as_str());
        for (name, value) in &hook.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((name, value)) = &auth {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.body(body.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                info!(
                    hook = %hook.name,
                    event_type = %event_type,
                    status,
                    attempt,
                    content_type = payload.content_type(),
                    "webhook delivered"
                );
                return Ok(status);
            }
            Ok(response) => {
                let status = response.status().as_u16();
                warn!(hook = %hook.name, event_type = %event_type, status, attempt, "webhook request failed");
                last_error = Some(InterceptError::transport(
                    format!("hook {} returned HTTP {status}", hook.name),
                    Some(status),
                ));
            }
            Err(e) => {
                warn!(hook = %hook.name, event_type = %event_type, error = %e, attempt, "webhook request failed");
                last_error = Some(InterceptError::from(e));
            }
        }

        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    Err(last_error.unwrap_or_else(|| {
        InterceptError::transport(format!("hook {} was not attempted", hook.name), None)
    }))
}
