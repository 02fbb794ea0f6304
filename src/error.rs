//! Error types for the storage provider and its credential broker

use reqwest::StatusCode;
use thiserror::Error;

pub type DriveResult<T> = std::result::Result<T, DriveError>;

#[derive(Debug, Error)]
pub enum DriveError {
    /// The provider rejected the access token (401/403)
    #[error("Unauthorized ({status}): {body}")]
    Unauthorized { status: StatusCode, body: String },

    /// The token endpoint refused the refresh token; re-authorization is required
    #[error("Refresh token rejected by the token endpoint: {0}")]
    CredentialRejected(String),

    #[error("Drive API error ({status}): {message}")]
    Api { status: StatusCode, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl DriveError {
    /// Whether a credential refresh may fix this error
    pub fn is_auth(&self) -> bool {
        matches!(self, DriveError::Unauthorized { .. })
    }

    /// Build the error for a non-success response
    pub fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            DriveError::Unauthorized { status, body }
        } else {
            DriveError::Api {
                status,
                message: body,
            }
        }
    }
}

/// True when any error in the chain is a rejected refresh token
pub fn is_credential_rejected(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<DriveError>(), Some(DriveError::CredentialRejected(_))))
}
