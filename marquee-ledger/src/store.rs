//! SQLite-backed persistence for licenses, deployments and the audit log.
//!
//! Every method takes the connection lock for the duration of a single short
//! statement (or a short read-then-update pair in [`Ledger::sweep_stale`]).
//! Callers composing several calls, such as the admission check, get no
//! isolation across them.

use crate::error::{LedgerError, LedgerResult};
use crate::records::{
    DeploymentRecord, DeploymentUpsert, EventRecord, EventType, LicenseRecord, NewEvent,
};
use chrono::{DateTime, Utc};
use marquee_types::{DeploymentId, LicenseId, Plan};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const LICENSE_COLUMNS: &str = "id, license_key, plan, owner, max_deployments, is_active, \
     features, expires_at, revoked_at, created_at";

const DEPLOYMENT_COLUMNS: &str = "id, license_id, machine_fingerprint, label, last_seen_ip, \
     reported_version, first_seen, last_heartbeat, is_active";

/// Persistent ledger backed by SQLite.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Opens (or creates) a ledger at the given path.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.init_schema()?;
        debug!(path = %path.as_ref().display(), "ledger opened");
        Ok(ledger)
    }

    /// Opens an in-memory ledger (for testing).
    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> LedgerResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS licenses (
                id TEXT PRIMARY KEY,
                license_key TEXT NOT NULL UNIQUE,
                plan TEXT NOT NULL,
                owner TEXT NOT NULL,
                max_deployments INTEGER NOT NULL,
                is_active INTEGER NOT NULL,
                features TEXT,
                expires_at INTEGER,
                revoked_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                license_id TEXT NOT NULL REFERENCES licenses(id),
                machine_fingerprint TEXT NOT NULL,
                label TEXT NOT NULL,
                last_seen_ip TEXT NOT NULL,
                reported_version TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_heartbeat INTEGER NOT NULL,
                is_active INTEGER NOT NULL,
                UNIQUE(license_id, machine_fingerprint)
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_heartbeat
                ON deployments(is_active, last_heartbeat);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                license_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                fingerprint TEXT,
                ip TEXT,
                details TEXT,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_license ON events(license_id, id);
            ",
        )?;
        Ok(())
    }

    // ── Licenses ─────────────────────────────────────────────────

    /// Inserts a freshly issued license.
    pub fn insert_license(&self, license: &LicenseRecord) -> LedgerResult<()> {
        let conn = self.conn();
        let features = encode_features(license.features.as_deref())?;
        conn.execute(
            "INSERT INTO licenses (id, license_key, plan, owner, max_deployments, is_active, \
             features, expires_at, revoked_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                license.id.to_string(),
                license.key,
                license.plan.as_str(),
                license.owner,
                license.max_deployments,
                license.is_active,
                features,
                license.expires_at.map(to_millis),
                license.revoked_at.map(to_millis),
                to_millis(license.created_at),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref f, _) if f.code == ErrorCode::ConstraintViolation => {
                LedgerError::DuplicateKey
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// Looks a license up by its key.
    pub fn license_by_key(&self, key: &str) -> LedgerResult<Option<LicenseRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {LICENSE_COLUMNS} FROM licenses WHERE license_key = ?1"),
                params![key],
                LicenseRow::read,
            )
            .optional()?;
        row.map(LicenseRecord::try_from).transpose()
    }

    /// Looks a license up by id.
    pub fn license_by_id(&self, id: LicenseId) -> LedgerResult<Option<LicenseRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {LICENSE_COLUMNS} FROM licenses WHERE id = ?1"),
                params![id.to_string()],
                LicenseRow::read,
            )
            .optional()?;
        row.map(LicenseRecord::try_from).transpose()
    }

    /// Returns every license, oldest first.
    pub fn licenses(&self) -> LedgerResult<Vec<LicenseRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {LICENSE_COLUMNS} FROM licenses ORDER BY id"))?;
        let rows = stmt
            .query_map([], LicenseRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(LicenseRecord::try_from).collect()
    }

    /// Sets `revoked_at` and clears `is_active`. Returns false if no such license.
    pub fn revoke_license(&self, id: LicenseId, at: DateTime<Utc>) -> LedgerResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE licenses SET revoked_at = ?2, is_active = 0 WHERE id = ?1",
            params![id.to_string(), to_millis(at)],
        )?;
        Ok(changed > 0)
    }

    /// Changes the slot limit. Existing active deployments are left alone.
    pub fn set_max_deployments(&self, id: LicenseId, max: u32) -> LedgerResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE licenses SET max_deployments = ?2 WHERE id = ?1",
            params![id.to_string(), max],
        )?;
        Ok(changed > 0)
    }

    /// Overrides (or, with `None`, clears) the stored feature list.
    pub fn set_features(&self, id: LicenseId, features: Option<&[String]>) -> LedgerResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE licenses SET features = ?2 WHERE id = ?1",
            params![id.to_string(), encode_features(features)?],
        )?;
        Ok(changed > 0)
    }

    // ── Deployments ──────────────────────────────────────────────

    /// Finds the deployment for a fingerprint on a license, active or not.
    pub fn find_deployment(
        &self,
        license_id: LicenseId,
        fingerprint: &str,
    ) -> LedgerResult<Option<DeploymentRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
                     WHERE license_id = ?1 AND machine_fingerprint = ?2"
                ),
                params![license_id.to_string(), fingerprint],
                DeploymentRow::read,
            )
            .optional()?;
        row.map(DeploymentRecord::try_from).transpose()
    }

    /// Counts deployments currently holding a slot.
    pub fn count_active_deployments(&self, license_id: LicenseId) -> LedgerResult<u32> {
        let conn = self.conn();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM deployments WHERE license_id = ?1 AND is_active = 1",
            params![license_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Inserts a deployment or reactivates the existing row for the same
    /// fingerprint, refreshing its label, address, version and heartbeat.
    pub fn upsert_deployment(&self, up: &DeploymentUpsert<'_>) -> LedgerResult<DeploymentRecord> {
        let conn = self.conn();
        let at = to_millis(up.at);
        conn.execute(
            "INSERT INTO deployments (id, license_id, machine_fingerprint, label, last_seen_ip, \
             reported_version, first_seen, last_heartbeat, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1) \
             ON CONFLICT(license_id, machine_fingerprint) DO UPDATE SET \
                label = excluded.label, \
                last_seen_ip = excluded.last_seen_ip, \
                reported_version = excluded.reported_version, \
                last_heartbeat = excluded.last_heartbeat, \
                is_active = 1",
            params![
                DeploymentId::new().to_string(),
                up.license_id.to_string(),
                up.machine_fingerprint,
                up.label,
                up.ip,
                up.version,
                at,
            ],
        )?;
        let row = conn.query_row(
            &format!(
                "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
                 WHERE license_id = ?1 AND machine_fingerprint = ?2"
            ),
            params![up.license_id.to_string(), up.machine_fingerprint],
            DeploymentRow::read,
        )?;
        DeploymentRecord::try_from(row)
    }

    /// Refreshes heartbeat, address and version of an *active* deployment.
    /// Returns false if the fingerprint holds no slot.
    pub fn touch_deployment(
        &self,
        license_id: LicenseId,
        fingerprint: &str,
        ip: &str,
        version: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE deployments SET last_heartbeat = ?3, \
                last_seen_ip = CASE WHEN ?4 = '' THEN last_seen_ip ELSE ?4 END, \
                reported_version = CASE WHEN ?5 = '' THEN reported_version ELSE ?5 END \
             WHERE license_id = ?1 AND machine_fingerprint = ?2 AND is_active = 1",
            params![license_id.to_string(), fingerprint, to_millis(at), ip, version],
        )?;
        Ok(changed > 0)
    }

    /// Releases a deployment's slot. Returns false if the fingerprint was never seen.
    pub fn deactivate_deployment(
        &self,
        license_id: LicenseId,
        fingerprint: &str,
    ) -> LedgerResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE deployments SET is_active = 0 \
             WHERE license_id = ?1 AND machine_fingerprint = ?2",
            params![license_id.to_string(), fingerprint],
        )?;
        Ok(changed > 0)
    }

    /// Marks inactive every active deployment whose last heartbeat is older
    /// than `cutoff`, returning the rows it reclaimed.
    pub fn sweep_stale(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<DeploymentRecord>> {
        let conn = self.conn();
        let cutoff = to_millis(cutoff);
        let stale = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
                 WHERE is_active = 1 AND last_heartbeat < ?1"
            ))?;
            stmt.query_map(params![cutoff], DeploymentRow::read)?
                .collect::<Result<Vec<_>, _>>()?
        };
        conn.execute(
            "UPDATE deployments SET is_active = 0 WHERE is_active = 1 AND last_heartbeat < ?1",
            params![cutoff],
        )?;
        stale
            .into_iter()
            .map(|row| {
                DeploymentRecord::try_from(row).map(|mut d| {
                    d.is_active = false;
                    d
                })
            })
            .collect()
    }

    /// Lists a license's deployments, oldest first.
    pub fn deployments_for_license(
        &self,
        license_id: LicenseId,
    ) -> LedgerResult<Vec<DeploymentRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE license_id = ?1 ORDER BY first_seen, id"
        ))?;
        let rows = stmt
            .query_map(params![license_id.to_string()], DeploymentRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(DeploymentRecord::try_from).collect()
    }

    // ── Audit log ────────────────────────────────────────────────

    /// Appends an audit row and returns its id.
    pub fn append_event(&self, event: &NewEvent) -> LedgerResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO events (license_id, event_type, fingerprint, ip, details, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.license_id.to_string(),
                event.event_type.as_str(),
                event.fingerprint,
                event.ip,
                event.details,
                to_millis(event.timestamp),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Returns a license's audit trail in append order.
    pub fn events_for_license(&self, license_id: LicenseId) -> LedgerResult<Vec<EventRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, license_id, event_type, fingerprint, ip, details, timestamp \
             FROM events WHERE license_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![license_id.to_string()], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    license_id: row.get(1)?,
                    event_type: row.get(2)?,
                    fingerprint: row.get(3)?,
                    ip: row.get(4)?,
                    details: row.get(5)?,
                    timestamp: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EventRecord::try_from).collect()
    }
}

// ── Row decoding ─────────────────────────────────────────────────

struct LicenseRow {
    id: String,
    key: String,
    plan: String,
    owner: String,
    max_deployments: u32,
    is_active: bool,
    features: Option<String>,
    expires_at: Option<i64>,
    revoked_at: Option<i64>,
    created_at: i64,
}

impl LicenseRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key: row.get(1)?,
            plan: row.get(2)?,
            owner: row.get(3)?,
            max_deployments: row.get(4)?,
            is_active: row.get(5)?,
            features: row.get(6)?,
            expires_at: row.get(7)?,
            revoked_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

impl TryFrom<LicenseRow> for LicenseRecord {
    type Error = LedgerError;

    fn try_from(row: LicenseRow) -> LedgerResult<Self> {
        Ok(Self {
            id: parse_license_id(&row.id)?,
            key: row.key,
            plan: row
                .plan
                .parse::<Plan>()
                .map_err(|e| LedgerError::InvalidData(e.to_string()))?,
            owner: row.owner,
            max_deployments: row.max_deployments,
            is_active: row.is_active,
            features: decode_features(row.features)?,
            expires_at: row.expires_at.map(from_millis).transpose()?,
            revoked_at: row.revoked_at.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

struct DeploymentRow {
    id: String,
    license_id: String,
    machine_fingerprint: String,
    label: String,
    last_seen_ip: String,
    reported_version: String,
    first_seen: i64,
    last_heartbeat: i64,
    is_active: bool,
}

impl DeploymentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            license_id: row.get(1)?,
            machine_fingerprint: row.get(2)?,
            label: row.get(3)?,
            last_seen_ip: row.get(4)?,
            reported_version: row.get(5)?,
            first_seen: row.get(6)?,
            last_heartbeat: row.get(7)?,
            is_active: row.get(8)?,
        })
    }
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = LedgerError;

    fn try_from(row: DeploymentRow) -> LedgerResult<Self> {
        Ok(Self {
            id: DeploymentId::parse(&row.id)
                .map_err(|e| LedgerError::InvalidData(format!("deployment id: {e}")))?,
            license_id: parse_license_id(&row.license_id)?,
            machine_fingerprint: row.machine_fingerprint,
            label: row.label,
            last_seen_ip: row.last_seen_ip,
            reported_version: row.reported_version,
            first_seen: from_millis(row.first_seen)?,
            last_heartbeat: from_millis(row.last_heartbeat)?,
            is_active: row.is_active,
        })
    }
}

struct EventRow {
    id: i64,
    license_id: String,
    event_type: String,
    fingerprint: Option<String>,
    ip: Option<String>,
    details: Option<String>,
    timestamp: i64,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = LedgerError;

    fn try_from(row: EventRow) -> LedgerResult<Self> {
        Ok(Self {
            id: row.id,
            license_id: parse_license_id(&row.license_id)?,
            event_type: row.event_type.parse::<EventType>()?,
            fingerprint: row.fingerprint,
            ip: row.ip,
            details: row.details,
            timestamp: from_millis(row.timestamp)?,
        })
    }
}

fn parse_license_id(raw: &str) -> LedgerResult<LicenseId> {
    LicenseId::parse(raw).map_err(|e| LedgerError::InvalidData(format!("license id: {e}")))
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> LedgerResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::InvalidData(format!("timestamp out of range: {ms}")))
}

fn encode_features(features: Option<&[String]>) -> LedgerResult<Option<String>> {
    features
        .map(|f| serde_json::to_string(f).map_err(LedgerError::from))
        .transpose()
}

/// Decodes the `features` column.
///
/// `NULL` and blank values mean "not stored". Older rows hold a bare
/// comma-separated list instead of a JSON array.
fn decode_features(raw: Option<String>) -> LedgerResult<Option<Vec<String>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.starts_with('[') {
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
    Ok(Some(
        trimmed
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect(),
    ))
}
