use crate::store::StoreError;
use crate::types::InvalidTimestamp;
use hyper::StatusCode;
use thiserror::Error;

/// Why an inbound protocol call was refused.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("not authorized")]
    Forbidden,
    #[error("no common protocol version, peer offered [{}]", .offered.join(", "))]
    UnsupportedVersion { offered: Vec<String> },
    #[error("invalid offline_mode_at: {0}")]
    InvalidTimestamp(#[from] InvalidTimestamp),
    #[error("missing X-Request-ID header")]
    MissingRequestId,
    #[error("invalid JSON payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RegistrationError {
    /// A record that disappears after the guard let the call through is
    /// reported the same way as an unknown credential.
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => RegistrationError::Forbidden,
            other => RegistrationError::Store(other),
        }
    }
}

impl RegistrationError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistrationError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistrationError::Forbidden => StatusCode::FORBIDDEN,
            RegistrationError::UnsupportedVersion { .. }
            | RegistrationError::InvalidTimestamp(_)
            | RegistrationError::MissingRequestId
            | RegistrationError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RegistrationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
