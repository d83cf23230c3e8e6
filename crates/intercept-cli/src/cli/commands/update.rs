//! `intercept update`: report whether a newer release exists. The binary is
//! never replaced.

use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::exit_codes;

pub const RELEASES_URL: &str = "https://api.github.com/repos/xfhg/intercept/releases/latest";
const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    html_url: Option<String>,
}

pub async fn run() -> anyhow::Result<i32> {
    let url = std::env::var("INTERCEPT_RELEASES_URL").unwrap_or_else(|_| RELEASES_URL.to_string());
    let (tag, page) = latest_release(&url).await?;
    if is_newer(&tag, CURRENT_VERSION) {
        println!("A newer version is available: {tag} (current {CURRENT_VERSION})");
        if let Some(page) = page {
            println!("Download: {page}");
        }
    } else {
        println!("Current version {CURRENT_VERSION} is the latest");
    }
    Ok(exit_codes::SUCCESS)
}

async fn latest_release(url: &str) -> anyhow::Result<(String, Option<String>)> {
    let client = intercept_core::http::client(Duration::from_secs(15), false)?;
    let response = client
        .get(url)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .with_context(|| format!("failed to query {url}"))?;
    if !response.status().is_success() {
        bail!("release query failed: HTTP {}", response.status());
    }
    let release: Release = response.json().await.context("unexpected release payload")?;
    Ok((release.tag_name, release.html_url))
}

fn parse_version(raw: &str) -> Option<Vec<u64>> {
    let core = raw.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    core.split('.').map(|part| part.parse().ok()).collect()
}

/// Whether `candidate` is a strictly higher `major.minor.patch` than `current`.
pub(crate) fn is_newer(candidate: &str, current: &str) -> bool {
    match (parse_version(candidate), parse_version(current)) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => false,
    }
}
