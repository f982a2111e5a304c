//! Error types for the authority.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use marquee_ledger::LedgerError;
use marquee_types::{LicenseResponse, LicenseStatus};
use thiserror::Error;
use tracing::error;

/// Result type for authority operations.
pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Errors surfaced by the authority.
///
/// License-level refusals (unknown key, revoked, over limit, ...) are not
/// errors; they are ordinary [`LicenseResponse`] values.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An operator command named a license that does not exist.
    #[error("license not found: {0}")]
    NotFound(String),

    /// Persistence failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Every generated key collided with an existing one.
    #[error("could not generate a unique key after {0} attempts")]
    KeyExhausted(usize),

    /// A blocking ledger task did not complete.
    #[error("task failed: {0}")]
    Task(String),
}

impl AuthorityError {
    /// HTTP status this error maps to.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Ledger(_) | Self::KeyExhausted(_) | Self::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthorityError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::InvalidRequest(_) | Self::NotFound(_) => self.to_string(),
            Self::Ledger(_) | Self::KeyExhausted(_) | Self::Task(_) => {
                error!(error = %self, "license request failed");
                "internal error".to_string()
            }
        };
        (
            status,
            Json(LicenseResponse::rejected(LicenseStatus::Invalid, message)),
        )
            .into_response()
    }
}
