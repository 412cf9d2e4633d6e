//! Crucible error types.
//!
//! Configuration problems fail closed with the offending section named;
//! transient provider failures are absorbed by the health layer and never
//! surface here unless every candidate is exhausted.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for core operations.
pub type CrucibleResult<T> = Result<T, CrucibleError>;

/// Failure raised by an agent-turn capability.
///
/// Carries the provider metadata the failure classifier inspects: an
/// HTTP-like status code and an optional server-suggested retry delay.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct TurnError {
    /// Provider or transport error message.
    pub message: String,
    /// HTTP-like status code, when the provider reported one.
    pub status: Option<u16>,
    /// Server-suggested retry delay in seconds (e.g. from `retry-after`).
    pub retry_after: Option<u64>,
}

impl TurnError {
    /// Create a turn error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Attach an HTTP-like status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a server-suggested retry delay in seconds.
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

/// Errors surfaced by the core library.
#[derive(Error, Debug)]
pub enum CrucibleError {
    /// Malformed or missing configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A single scope entry failed validation.
    #[error("scope '{scope}': {message}")]
    ScopeConfig { scope: String, message: String },

    /// Unrecognized phase name.
    #[error("unsupported phase '{0}'")]
    UnknownPhase(String),

    /// Run metadata missing from an expected location.
    #[error("run metadata not found at {}", .path.display())]
    RunNotFound { path: PathBuf },

    /// Finalize found the run directory incomplete.
    #[error("finalize aborted due to missing artifacts:\n- {}", .missing.join("\n- "))]
    MissingArtifacts { missing: Vec<String> },

    /// Every configured model candidate failed within one iteration.
    #[error("all {attempted} configured model candidates failed on iteration {iteration}")]
    AllCandidatesFailed { iteration: u32, attempted: usize },

    /// Non-retryable agent-turn failure, propagated unchanged.
    #[error("agent turn failed: {0}")]
    Turn(#[from] TurnError),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CrucibleError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a scope configuration error naming the offending scope.
    pub fn scope(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScopeConfig {
            scope: scope.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_error_builder() {
        let err = TurnError::new("rate limited")
            .with_status(429)
            .with_retry_after(12);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(12));
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn test_scope_error_names_scope() {
        let err = CrucibleError::scope("polish", "missing 'focus' field");
        assert!(err.to_string().contains("polish"));
        assert!(err.to_string().contains("focus"));
    }

    #[test]
    fn test_missing_artifacts_lists_every_gap() {
        let err = CrucibleError::MissingArtifacts {
            missing: vec![
                "Missing advocate outputs (advocate_*.md).".to_string(),
                "Missing summary file.".to_string(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("advocate_*.md"));
        assert!(text.contains("summary"));
    }

    #[test]
    fn test_turn_error_converts() {
        let err: CrucibleError = TurnError::new("boom").into();
        assert!(matches!(err, CrucibleError::Turn(_)));
    }
}
