//! JSON bodies exchanged between the license client and the authority.
//!
//! All four endpoints answer with [`LicenseResponse`]; a non-2xx HTTP
//! status always accompanies `valid: false`.

use crate::{LicenseStatus, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `POST /license/validate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub license_key: String,
    pub machine_fingerprint: String,
}

/// `POST /license/activate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub license_key: String,
    pub machine_fingerprint: String,
    #[serde(default)]
    pub machine_label: String,
    #[serde(default)]
    pub server_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// `POST /license/heartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub license_key: String,
    pub machine_fingerprint: String,
    #[serde(default)]
    pub server_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// `POST /license/deactivate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateRequest {
    pub license_key: String,
    pub machine_fingerprint: String,
}

/// Uniform answer from every authority endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub status: LicenseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deployments: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

impl LicenseResponse {
    /// Builds a refusal carrying only a status and a human-readable reason.
    #[must_use]
    pub fn rejected(status: LicenseStatus, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            plan: None,
            status,
            message: Some(message.into()),
            max_deployments: None,
            grace_days: None,
            expires_at: None,
            features: None,
        }
    }

    /// Returns the granted features, or an empty slice when none were sent.
    #[must_use]
    pub fn features(&self) -> &[String] {
        self.features.as_deref().unwrap_or(&[])
    }
}
