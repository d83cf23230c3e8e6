//! `intercept sys`: versions of the helper binaries the evaluators shell out to.

use std::path::Path;

use intercept_core::ToolPaths;
use tokio::process::Command;
use tracing::debug;

use crate::exit_codes;

pub const NOT_FOUND: &str = "not found";

pub async fn run() -> anyhow::Result<i32> {
    let tools = ToolPaths::from_env();
    let checks: [(&str, &Path, &[&str]); 3] = [
        ("rg", &tools.rg, &["--version"]),
        ("goss", &tools.goss, &["--version"]),
        ("opa", &tools.opa, &["version"]),
    ];
    for (name, path, args) in checks {
        let version = tool_version(path, args).await;
        println!("{name:<5} {}", version.as_deref().unwrap_or(NOT_FOUND));
    }
    Ok(exit_codes::SUCCESS)
}

/// First non-empty stdout line of `<path> <args>`, or `None` when the tool
/// is missing or fails.
pub(crate) async fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = match Command::new(path).args(args).output().await {
        Ok(output) => output,
        Err(e) => {
            debug!(tool = %path.display(), error = %e, "helper not runnable");
            return None;
        }
    };
    if !output.status.success() {
        debug!(tool = %path.display(), status = ?output.status.code(), "helper exited with failure");
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
