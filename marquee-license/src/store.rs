//! On-disk client state: the local license cache and the stored key.
//!
//! Every file is written whole through a temp file and rename, with
//! owner-only permissions, so a reader never observes a partial write.

use crate::error::{LicenseError, LicenseResult};
use chrono::{DateTime, Utc};
use marquee_types::{LicenseResponse, LicenseStatus, Plan};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Cache file name under the data directory.
pub const CACHE_FILE: &str = "license_cache.json";

/// Stored key file name under the data directory.
pub const KEY_FILE: &str = "license.key";

/// The last answer the authority gave this installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCache {
    pub key: String,
    pub plan: Option<Plan>,
    pub valid: bool,
    pub status: LicenseStatus,
    /// Offline grace in days, as advertised by the authority.
    pub grace_days: u32,
    pub validated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
    pub reported_version: String,
    #[serde(default)]
    pub features: Vec<String>,
}

impl LocalCache {
    /// Builds a cache entry from an authority response.
    #[must_use]
    pub fn from_response(
        key: &str,
        fingerprint: &str,
        version: &str,
        resp: &LicenseResponse,
        validated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.to_string(),
            plan: resp.plan,
            valid: resp.valid,
            status: resp.status,
            grace_days: resp.grace_days.unwrap_or_default(),
            validated_at,
            expires_at: resp.expires_at,
            fingerprint: fingerprint.to_string(),
            reported_version: version.to_string(),
            features: resp.features().to_vec(),
        }
    }

    /// True if this entry belongs to `key` on this machine.
    #[must_use]
    pub fn matches(&self, key: &str, fingerprint: &str) -> bool {
        self.key == key && self.fingerprint == fingerprint
    }
}

/// Serialized access to the cache file.
pub struct CacheStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CacheStore {
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CACHE_FILE),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cache. A missing or unreadable file is treated as no cache.
    #[must_use]
    pub fn load(&self) -> Option<LocalCache> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read license cache: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring corrupt license cache: {e}");
                None
            }
        }
    }

    /// Overwrites the cache.
    pub fn save(&self, cache: &LocalCache) -> LicenseResult<()> {
        let json = serde_json::to_vec_pretty(cache)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        write_private(&self.path, &json)?;
        debug!(status = %cache.status, valid = cache.valid, "license cache written");
        Ok(())
    }
}

/// Reads the stored key, if any.
pub fn read_key_file(data_dir: &Path) -> LicenseResult<Option<String>> {
    match std::fs::read_to_string(data_dir.join(KEY_FILE)) {
        Ok(raw) => {
            let key = marquee_types::key::normalize_key(&raw);
            Ok((!key.is_empty()).then_some(key))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Stores the key for the next start.
pub fn write_key_file(data_dir: &Path, key: &str) -> LicenseResult<()> {
    write_private(&data_dir.join(KEY_FILE), key.as_bytes())?;
    Ok(())
}

/// Creates the data directory (owner-only on unix) if it is missing.
pub fn ensure_data_dir(data_dir: &Path) -> LicenseResult<()> {
    let result = std::fs::create_dir_all(data_dir).and_then(|()| {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    });
    result.map_err(|source| LicenseError::DataDir {
        path: data_dir.to_path_buf(),
        source,
    })
}

/// Atomically replaces `path` with `contents`, readable only by the owner.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut file = temp.as_file();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents)?;
        file.sync_all()?;
    }
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
