use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Signaling failed (HTTP {status}): {message}")]
    Signaling { status: u16, message: String },

    #[error("Signaling request timed out after {0} ms")]
    SignalingTimeout(u64),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status code attached to a signaling failure, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::Signaling { status, .. } => Some(*status),
            AppError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this error came out of the offer/answer exchange
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            AppError::Signaling { .. } | AppError::SignalingTimeout(_) | AppError::Http(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_error_display() {
        let err = AppError::Signaling {
            status: 404,
            message: "path not found".to_string(),
        };
        assert_eq!(err.to_string(), "Signaling failed (HTTP 404): path not found");
        assert_eq!(err.status_code(), Some(404));
        assert!(err.is_signaling());
    }

    #[test]
    fn test_non_signaling_error() {
        let err = AppError::WebRtcError("ice failed".to_string());
        assert_eq!(err.status_code(), None);
        assert!(!err.is_signaling());
        assert!(AppError::SignalingTimeout(10_000).is_signaling());
    }
}
