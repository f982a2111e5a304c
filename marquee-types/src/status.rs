//! License status as reported on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a validate-family call against the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    /// Known, active, unexpired and (for activation) admitted.
    Active,
    /// Past its expiry timestamp.
    Expired,
    /// Revoked by an operator or marked inactive.
    Revoked,
    /// Every deployment slot is taken.
    OverLimit,
    /// Unknown key or malformed request.
    Invalid,
    /// This machine's deployment no longer holds a slot.
    Deactivated,
}

impl LicenseStatus {
    /// Returns true for statuses that represent an explicit refusal of trust.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Expired | Self::Revoked | Self::OverLimit | Self::Invalid
        )
    }

    /// Returns the snake_case wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::OverLimit => "over_limit",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
