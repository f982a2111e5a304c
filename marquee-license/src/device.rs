//! Machine fingerprinting.
//!
//! The fingerprint binds a deployment slot to one installation. It combines a
//! random instance id, generated once and kept in the data directory, with the
//! hostname, so it survives reboots and hardware swaps but changes when the
//! data directory is wiped or copied to another host.

use crate::error::{LicenseError, LicenseResult};
use crate::store::write_private;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// File under the data directory holding the instance id.
pub const INSTANCE_ID_FILE: &str = "instance_id";

/// Information about the current host, reported as the deployment label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Operating system name.
    pub os_name: String,
    /// CPU architecture.
    pub arch: String,
    /// Hostname, empty if unavailable.
    pub hostname: String,
}

impl DeviceInfo {
    /// Collects information about the current host.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            hostname: get_hostname(),
        }
    }

    /// Human-readable label used when none is configured.
    #[must_use]
    pub fn label(&self) -> String {
        if self.hostname.is_empty() {
            format!("{}-{}", self.os_name, self.arch)
        } else {
            self.hostname.clone()
        }
    }
}

/// Returns this installation's fingerprint, creating the instance id on
/// first use.
///
/// An unwritable data directory is an error; callers treat it as fatal.
pub fn machine_fingerprint(data_dir: &Path) -> LicenseResult<String> {
    let instance_id = load_or_create_instance_id(data_dir)?;
    Ok(fingerprint_from(&instance_id, &get_hostname()))
}

/// Hashes an instance id and hostname into a 64-character hex fingerprint.
#[must_use]
pub fn fingerprint_from(instance_id: &str, hostname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(b"|");
    hasher.update(hostname.as_bytes());
    hex::encode(hasher.finalize())
}

fn load_or_create_instance_id(data_dir: &Path) -> LicenseResult<String> {
    let path = data_dir.join(INSTANCE_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(existing) if !existing.trim().is_empty() => return Ok(existing.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(LicenseError::DataDir { path, source }),
    }

    let id = Uuid::new_v4().to_string();
    write_private(&path, id.as_bytes()).map_err(|source| LicenseError::DataDir {
        path: path.clone(),
        source,
    })?;
    info!("generated new instance id");
    Ok(id)
}

fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}
