//! Row types persisted by the ledger.

use chrono::{DateTime, Utc};
use marquee_types::{DeploymentId, LicenseId, Plan};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// An issued license.
///
/// `revoked_at` being set implies `is_active == false`; the ledger enforces
/// this when revoking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub id: LicenseId,
    pub key: String,
    pub plan: Plan,
    pub owner: String,
    pub max_deployments: u32,
    pub is_active: bool,
    /// Explicit feature list. `None` on rows written before features were stored.
    pub features: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One machine holding (or having held) a slot on a license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub license_id: LicenseId,
    pub machine_fingerprint: String,
    pub label: String,
    pub last_seen_ip: String,
    pub reported_version: String,
    pub first_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub is_active: bool,
}

/// Fields written when a deployment is admitted or re-admitted.
#[derive(Debug, Clone)]
pub struct DeploymentUpsert<'a> {
    pub license_id: LicenseId,
    pub machine_fingerprint: &'a str,
    pub label: &'a str,
    pub ip: &'a str,
    pub version: &'a str,
    pub at: DateTime<Utc>,
}

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Activated,
    Deactivated,
    Heartbeat,
    Validated,
    Revoked,
    Expired,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Activated => "activated",
            Self::Deactivated => "deactivated",
            Self::Heartbeat => "heartbeat",
            Self::Validated => "validated",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "activated" => Ok(Self::Activated),
            "deactivated" => Ok(Self::Deactivated),
            "heartbeat" => Ok(Self::Heartbeat),
            "validated" => Ok(Self::Validated),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            other => Err(LedgerError::InvalidData(format!("unknown event type: {other}"))),
        }
    }
}

/// An audit row as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub license_id: LicenseId,
    pub event_type: EventType,
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An audit row about to be appended.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub license_id: LicenseId,
    pub event_type: EventType,
    pub fingerprint: Option<String>,
    pub ip: Option<String>,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    #[must_use]
    pub fn new(license_id: LicenseId, event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            license_id,
            event_type,
            fingerprint: None,
            ip: None,
            details: None,
            timestamp,
        }
    }

    #[must_use]
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    #[must_use]
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        let ip = ip.into();
        if !ip.is_empty() {
            self.ip = Some(ip);
        }
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
