use campus_common::is_inactive_call_message;
use thiserror::Error;

use crate::sdk::SdkError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Gateway answered with a non-success status.
    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid gateway url: {0}")]
    Url(#[from] url::ParseError),

    #[error("video sdk error: {0}")]
    Sdk(#[from] SdkError),

    #[error("screen capture failed: {0}")]
    ScreenCapture(String),

    #[error("not in a call")]
    NotInCall,

    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// The attempt was cancelled or the client is leaving.
    #[error("operation cancelled")]
    Cancelled,

    /// The world moved on while the operation was in flight.
    #[error("stale result: {0}")]
    Stale(String),

    #[error(transparent)]
    Common(#[from] campus_common::Error),
}

impl ClientError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Outcomes of racing the rest of the world rather than real failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Stale(_)) || self.is_inactive_call()
    }

    /// Whether the message says the call stopped being active mid-request.
    pub fn is_inactive_call(&self) -> bool {
        is_inactive_call_message(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_call_errors_are_benign() {
        let err = ClientError::api(409, "Video call is not active");
        assert!(err.is_inactive_call());
        assert!(err.is_benign());
        assert_eq!(err.status(), Some(409));
    }

    #[test]
    fn test_real_failures_are_not_benign() {
        let err = ClientError::api(500, "Database error");
        assert!(!err.is_benign());
        assert!(!ClientError::Sdk(SdkError::Rejected("call full".into())).is_benign());
        assert!(ClientError::Cancelled.is_benign());
    }
}
