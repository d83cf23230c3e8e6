//! Shared HTTP client setup for the api evaluator, hooks and remote bundles.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};

use crate::error::{InterceptError, InterceptResult};

/// User agent for every outbound request.
pub const USER_AGENT_VALUE: &str = concat!("intercept/", env!("CARGO_PKG_VERSION"));

/// Client with the intercept user agent, a request timeout and optional
/// certificate verification bypass.
pub fn client(timeout: Duration, insecure: bool) -> InterceptResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(|e| InterceptError::transport(format!("failed to create HTTP client: {e}"), None))
}

/// Header derived from an auth map.
///
/// `type` selects `basic` (`username_env`, `password_env`), `bearer` or
/// `token` (`token_env`), or `api_key` (`header`, `key_env`). Secrets are
/// read through `lookup` from the environment variables the map names;
/// `fallback` names a variable holding `user:pass` (basic) or the token.
pub fn auth_header<F>(
    auth: &BTreeMap<String, String>,
    fallback: Option<&str>,
    lookup: F,
) -> InterceptResult<Option<(String, String)>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(kind) = auth.get("type").map(|t| t.trim().to_ascii_lowercase()) else {
        return Ok(None);
    };
    let from_env = |key: &str| {
        auth.get(key)
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .and_then(&lookup)
    };
    let from_fallback = || fallback.and_then(&lookup);

    match kind.as_str() {
        "" | "none" => Ok(None),
        "basic" => {
            let credentials = match (from_env("username_env"), from_env("password_env")) {
                (Some(user), Some(pass)) => format!("{user}:{pass}"),
                (Some(user), None) => format!("{user}:"),
                _ => from_fallback().unwrap_or_default(),
            };
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            Ok(Some((AUTHORIZATION.to_string(), format!("Basic {encoded}"))))
        }
        "bearer" | "token" => {
            let token = from_env("token_env")
                .or_else(from_fallback)
                .unwrap_or_default();
            Ok(Some((AUTHORIZATION.to_string(), format!("Bearer {token}"))))
        }
        "api_key" => {
            let header = auth
                .get("header")
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .ok_or_else(|| InterceptError::config("api_key auth requires a header name"))?;
            let key = from_env("key_env").or_else(from_fallback).unwrap_or_default();
            Ok(Some((header, key)))
        }
        other => Err(InterceptError::config(format!(
            "unsupported authentication type: {other}"
        ))),
    }
}

/// Read a secret from the process environment.
pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
