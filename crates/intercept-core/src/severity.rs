//! Enforcement selection and SARIF level derivation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Enforcement, Policy};

/// SARIF result level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SarifLevel {
    None,
    Note,
    Warning,
    Error,
}

impl SarifLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SarifLevel::None => "none",
            SarifLevel::Note => "note",
            SarifLevel::Warning => "warning",
            SarifLevel::Error => "error",
        }
    }

    /// Numeric form used in log records (`none`=0 .. `error`=3).
    pub fn as_int(&self) -> u8 {
        match self {
            SarifLevel::None => 0,
            SarifLevel::Note => 1,
            SarifLevel::Warning => 2,
            SarifLevel::Error => 3,
        }
    }

    /// Whether a result at this level breaks compliance.
    pub fn is_failing(&self) -> bool {
        matches!(self, SarifLevel::Warning | SarifLevel::Error)
    }
}

impl fmt::Display for SarifLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the rule for `environment`, then `all`, then the first one.
///
/// A policy without enforcement gets a non-fatal, low confidence profile.
pub fn select_enforcement(policy: &Policy, environment: &str) -> Enforcement {
    let environment = environment.trim();
    let exact = (!environment.is_empty())
        .then(|| {
            policy
                .enforcement
                .iter()
                .find(|e| e.environment.eq_ignore_ascii_case(environment))
        })
        .flatten();

    exact
        .or_else(|| {
            policy
                .enforcement
                .iter()
                .find(|e| e.environment.eq_ignore_ascii_case("all"))
        })
        .or_else(|| policy.enforcement.first())
        .cloned()
        .unwrap_or_else(|| Enforcement {
            environment: "all".to_string(),
            fatal: "false".to_string(),
            exceptions: "false".to_string(),
            confidence: "low".to_string(),
        })
}

pub fn level_for(enforcement: &Enforcement) -> SarifLevel {
    let confidence = enforcement.confidence.trim().to_ascii_lowercase();
    match (
        enforcement.is_fatal(),
        enforcement.has_exceptions(),
        confidence.as_str(),
    ) {
        (true, _, _) => SarifLevel::Error,
        (false, false, "high") => SarifLevel::Error,
        (false, true, "high") => SarifLevel::Warning,
        (false, false, "low") => SarifLevel::Warning,
        (false, true, "low") => SarifLevel::Note,
        (false, true, "info") => SarifLevel::None,
        _ => SarifLevel::Warning,
    }
}

/// Level of a failing result for `policy` in `environment`.
pub fn policy_level(policy: &Policy, environment: &str) -> SarifLevel {
    level_for(&select_enforcement(policy, environment))
}

/// Whether an `error` result from `policy` counts as fatal for the exit code.
pub fn is_fatal_in(policy: &Policy, environment: &str) -> bool {
    select_enforcement(policy, environment).is_fatal()
}
