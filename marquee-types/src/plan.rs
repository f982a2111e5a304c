//! License plans and the entitlements they carry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Feature flag gating live IPTV channels.
pub const FEATURE_LIVE_CHANNELS: &str = "live_channels";

/// The plan a license was sold under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// Single household server.
    Personal,
    /// Small fleet of servers.
    Business,
    /// Large fleet; unlocks live channels.
    Enterprise,
}

impl Plan {
    /// Returns the deployment-slot count used when issuance does not specify one.
    #[must_use]
    pub fn default_max_deployments(&self) -> u32 {
        match self {
            Self::Personal => 1,
            Self::Business => 5,
            Self::Enterprise => 50,
        }
    }

    /// Returns the feature flags granted by this plan alone.
    #[must_use]
    pub fn default_features(&self) -> Vec<String> {
        match self {
            Self::Personal | Self::Business => Vec::new(),
            Self::Enterprise => vec![FEATURE_LIVE_CHANNELS.to_string()],
        }
    }

    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "personal" => Ok(Self::Personal),
            "business" => Ok(Self::Business),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(crate::Error::UnknownPlan(other.to_string())),
        }
    }
}
