//! Error types for the compliance engine.

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    /// Unreadable or unparseable configuration, bad cron expression, overlapping observe path.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Missing target directory or unreadable target file.
    #[error("target error: {path}: {message}")]
    Target { path: String, message: String },

    /// Subprocess failure, schema compile failure, rego evaluation error.
    #[error("evaluator error in policy {policy}: {message}")]
    Evaluator { policy: String, message: String },

    /// HTTP or webhook failure.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },

    /// Unreadable per-policy SARIF artifact.
    #[error("aggregation error: {path}: {message}")]
    Aggregation { path: String, message: String },

    /// Remote or local bundle checksum mismatch.
    #[error("checksum mismatch for {source_ref}: expected {expected}, got {actual}")]
    Integrity {
        source_ref: String,
        expected: String,
        actual: String,
    },

    /// Bundle syntax error.
    #[error("failed to load policy bundle {source_ref}: {message}")]
    Load { source_ref: String, message: String },

    /// Remote bundle unreachable.
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl InterceptError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn evaluator(policy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Evaluator {
            policy: policy.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Transport {
            message: message.into(),
            status,
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Integrity { .. } => 3,
            Self::Fetch { .. } | Self::Transport { .. } => 4,
            _ => 2,
        }
    }

    /// Whether the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch { .. } => true,
            Self::Transport { status, .. } => status.map_or(true, |s| s >= 500),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for InterceptError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<serde_json::Error> for InterceptError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for InterceptError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type InterceptResult<T> = Result<T, InterceptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retry_depends_on_status() {
        assert!(InterceptError::transport("reset", None).is_retryable());
        assert!(InterceptError::transport("bad gateway", Some(502)).is_retryable());
        assert!(!InterceptError::transport("not found", Some(404)).is_retryable());
        assert!(!InterceptError::config("bad cron").is_retryable());
    }

    #[test]
    fn integrity_has_dedicated_exit_code() {
        let err = InterceptError::Integrity {
            source_ref: "policy.yaml".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.exit_code(), 3);
        assert_eq!(InterceptError::config("x").exit_code(), 2);
    }
}
