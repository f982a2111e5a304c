//! Error types for the license client.

use marquee_types::LicenseStatus;
use std::path::PathBuf;
use thiserror::Error;

/// License client errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// The authority could not be reached, timed out, or failed server-side.
    #[error("license authority unreachable: {0}")]
    Unreachable(String),

    /// The authority answered and refused the key.
    #[error("license rejected ({status}): {message}")]
    Rejected {
        status: LicenseStatus,
        message: String,
    },

    /// The data directory cannot hold the instance id, key or cache.
    #[error("data directory {} is not usable: {source}", path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP client construction failed.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LicenseError {
    /// Returns true for conditions that the grace period can cover.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Returns true when the authority explicitly refused the key.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { status, .. } if status.is_rejection())
    }
}

/// Result type for license client operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
