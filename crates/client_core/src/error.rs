use shared::error::ErrorCode;
use thiserror::Error;

/// Every failure the controllers surface. `Display` is the human-readable
/// message shown next to the form that triggered the request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("{message}")]
    AuthRejected { status: u16, message: String },
    #[error("server error ({status}): {message}")]
    ServerFault { status: u16, message: String },
    #[error("{0}")]
    MalformedResponse(String),
    #[error("not signed in: sign in to continue")]
    AuthorizationMissing,
    #[error("{0}")]
    InvalidUpload(String),
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(_) => ErrorCode::Transport,
            Self::AuthRejected { .. } => ErrorCode::AuthRejected,
            Self::ServerFault { .. } => ErrorCode::ServerFault,
            Self::MalformedResponse(_) => ErrorCode::MalformedResponse,
            Self::AuthorizationMissing => ErrorCode::AuthorizationMissing,
            Self::InvalidUpload(_) => ErrorCode::InvalidUpload,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthRejected { status, .. } | Self::ServerFault { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport("request timed out".to_string())
        } else if err.is_decode() {
            Self::MalformedResponse(format!("unexpected response body: {err}"))
        } else {
            Self::Transport(err.to_string())
        }
    }
}
