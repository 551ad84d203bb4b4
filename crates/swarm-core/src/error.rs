//! Error taxonomy for the swarm core
//!
//! [`SwarmError`] is what callers see. [`BackendError`] is what a model backend
//! reports, and carries the transient / permanent / configuration split that
//! drives retries and agent status.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the core
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, SwarmError>;

/// How a backend failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Network, timeout, server side trouble. Worth another attempt.
    Transient,
    /// The request itself is wrong. Retrying will not help.
    Permanent,
    /// Credentials or model setup is broken. Not retried, flips the agent to `error`.
    Configuration,
}

/// Failures reported by a model backend
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("rate limited by backend")]
    RateLimited,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("backend credentials are not configured")]
    MissingCredentials,

    #[error("stream error: {0}")]
    Stream(String),
}

impl BackendError {
    /// Map an HTTP status and body to an error class
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            // 402: out of credits
            401 | 402 | 403 => Self::Authentication(body),
            404 => Self::ModelNotFound(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited,
            500..=599 => Self::Server {
                status,
                message: body,
            },
            _ => Self::BadRequest(body),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Network(_)
            | Self::Timeout(_)
            | Self::Server { .. }
            | Self::RateLimited
            | Self::Stream(_) => FaultKind::Transient,
            Self::BadRequest(_) => FaultKind::Permanent,
            Self::Authentication(_) | Self::ModelNotFound(_) | Self::MissingCredentials => {
                FaultKind::Configuration
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FaultKind::Transient
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == FaultKind::Configuration
    }

    /// A message safe to show end users: no response bodies, no credentials.
    pub fn sanitized(&self) -> String {
        match self {
            Self::Network(_) | Self::Stream(_) => "The model backend could not be reached".into(),
            Self::Timeout(_) => "The model backend took too long to respond".into(),
            Self::Server { status, .. } => {
                format!("The model backend reported an internal error ({})", status)
            }
            Self::RateLimited => "The model backend is rate limiting requests".into(),
            Self::BadRequest(_) => "The model backend rejected the request".into(),
            Self::Authentication(_) | Self::MissingCredentials => {
                "The model backend is not configured correctly".into()
            }
            Self::ModelNotFound(_) => "The requested model is not available".into(),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(Duration::ZERO);
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() || err.is_body() {
            return Self::Stream(err.to_string());
        }
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(BackendError::from_status(400, "x"), BackendError::BadRequest(_)));
        assert!(matches!(BackendError::from_status(401, "x"), BackendError::Authentication(_)));
        assert!(matches!(BackendError::from_status(403, "x"), BackendError::Authentication(_)));
        assert!(matches!(BackendError::from_status(404, "x"), BackendError::ModelNotFound(_)));
        assert!(matches!(BackendError::from_status(429, "x"), BackendError::RateLimited));
        assert!(matches!(
            BackendError::from_status(503, "x"),
            BackendError::Server { status: 503, .. }
        ));
        assert!(matches!(BackendError::from_status(402, "x"), BackendError::Authentication(_)));
        for status in [405, 409, 410, 413, 422] {
            assert!(
                matches!(BackendError::from_status(status, "x"), BackendError::BadRequest(_)),
                "status {status}"
            );
        }
    }

    #[test]
    fn test_only_server_side_statuses_retry() {
        for status in [402, 405, 409, 410, 418] {
            assert!(!BackendError::from_status(status, "x").is_transient(), "status {status}");
        }
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(BackendError::from_status(status, "x").is_transient(), "status {status}");
        }
        assert!(BackendError::from_status(402, "no credits").is_configuration());
    }

    #[test]
    fn test_fault_kinds() {
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(BackendError::from_status(502, "bad gateway").is_transient());
        assert_eq!(BackendError::BadRequest("x".into()).kind(), FaultKind::Permanent);
        assert!(BackendError::MissingCredentials.is_configuration());
        assert!(BackendError::Authentication("bad key".into()).is_configuration());
        assert!(BackendError::ModelNotFound("gpt-9".into()).is_configuration());
    }

    #[test]
    fn test_sanitized_hides_details() {
        let err = BackendError::Authentication("invalid key sk-or-v1-abcdef".into());
        assert!(!err.sanitized().contains("sk-or"));

        let err = BackendError::Server {
            status: 500,
            message: "traceback: secret internals".into(),
        };
        let msg = err.sanitized();
        assert!(msg.contains("500"));
        assert!(!msg.contains("traceback"));
    }

    #[test]
    fn test_swarm_error_from_backend() {
        let err: SwarmError = BackendError::RateLimited.into();
        assert!(matches!(err, SwarmError::Backend(BackendError::RateLimited)));
        assert_eq!(err.to_string(), "rate limited by backend");
    }
}
