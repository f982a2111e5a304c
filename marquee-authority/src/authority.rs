//! The license authority: issuance, validation, admission control,
//! heartbeats, deactivation and the stale sweep.
//!
//! The authority holds no per-request state. Every call reads the ledger,
//! decides, writes, and returns a [`LicenseResponse`]. Refusals are ordinary
//! responses; only malformed input and persistence failures are errors.

use crate::error::{AuthorityError, AuthorityResult};
use crate::features::resolve_features;
use crate::keygen::generate_key;
use chrono::{DateTime, Duration, Utc};
use marquee_ledger::{
    DeploymentRecord, DeploymentUpsert, EventRecord, EventType, Ledger, LedgerError,
    LicenseRecord, NewEvent,
};
use marquee_types::key::normalize_key;
use marquee_types::{
    ActivateRequest, Clock, DeactivateRequest, HeartbeatRequest, LicenseId, LicenseResponse,
    LicenseStatus, Plan, SystemClock, ValidateRequest,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Offline grace, in days, advertised to clients.
pub const DEFAULT_GRACE_DAYS: u32 = 30;

/// Default age, in seconds, after which a silent deployment loses its slot.
pub const DEFAULT_STALE_THRESHOLD_SECS: i64 = 24 * 60 * 60;

const KEY_ATTEMPTS: usize = 5;

/// Parameters for issuing a license.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub plan: Plan,
    pub owner: String,
    /// Defaults to the plan's slot count.
    pub max_deployments: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Defaults to the plan's features.
    pub features: Option<Vec<String>>,
}

impl IssueRequest {
    #[must_use]
    pub fn new(plan: Plan, owner: impl Into<String>) -> Self {
        Self {
            plan,
            owner: owner.into(),
            max_deployments: None,
            expires_at: None,
            features: None,
        }
    }
}

/// Result of checking a key against the ledger, before any side effects.
enum Verdict {
    /// The license may be used.
    Usable(LicenseRecord),
    /// The license exists but is refused.
    Refused(LicenseResponse),
    /// No such key.
    Unknown(LicenseResponse),
}

/// Server-side license authority.
#[derive(Clone)]
pub struct Authority {
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    grace_days: u32,
}

impl Authority {
    /// Creates an authority over `ledger` using the system clock.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self::with_clock(ledger, Arc::new(SystemClock))
    }

    /// Creates an authority with an explicit clock.
    #[must_use]
    pub fn with_clock(ledger: Ledger, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            clock,
            grace_days: DEFAULT_GRACE_DAYS,
        }
    }

    /// Overrides the grace period advertised to clients.
    #[must_use]
    pub fn grace_days(mut self, days: u32) -> Self {
        self.grace_days = days;
        self
    }

    /// Returns the underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // ── Issuance ─────────────────────────────────────────────────

    /// Issues a new license and records a `created` event.
    pub fn issue(&self, req: IssueRequest) -> AuthorityResult<LicenseRecord> {
        let owner = req.owner.trim().to_string();
        if owner.is_empty() {
            return Err(AuthorityError::InvalidRequest("owner is required".into()));
        }
        let max_deployments = req
            .max_deployments
            .unwrap_or_else(|| req.plan.default_max_deployments());
        if max_deployments == 0 {
            return Err(AuthorityError::InvalidRequest(
                "max_deployments must be at least 1".into(),
            ));
        }
        let now = self.clock.now();
        let features = req.features.unwrap_or_else(|| req.plan.default_features());

        for _ in 0..KEY_ATTEMPTS {
            let license = LicenseRecord {
                id: LicenseId::new(),
                key: generate_key(req.plan),
                plan: req.plan,
                owner: owner.clone(),
                max_deployments,
                is_active: true,
                features: Some(features.clone()),
                expires_at: req.expires_at,
                revoked_at: None,
                created_at: now,
            };
            match self.ledger.insert_license(&license) {
                Ok(()) => {
                    self.ledger.append_event(
                        &NewEvent::new(license.id, EventType::Created, now).details(format!(
                            "plan={} max_deployments={}",
                            license.plan, license.max_deployments
                        )),
                    )?;
                    info!(license_id = %license.id, plan = %license.plan, "license issued");
                    return Ok(license);
                }
                Err(LedgerError::DuplicateKey) => {
                    warn!("generated key collided; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthorityError::KeyExhausted(KEY_ATTEMPTS))
    }

    // ── Machine-facing protocol ──────────────────────────────────

    /// Checks a key without touching any deployment.
    pub fn validate(&self, req: &ValidateRequest, ip: &str) -> AuthorityResult<LicenseResponse> {
        let key = required_key(&req.license_key)?;
        let fingerprint = required(&req.machine_fingerprint, "machine_fingerprint")?;
        let now = self.clock.now();
        match self.verdict(&key, fingerprint, ip, now)? {
            Verdict::Usable(license) => {
                self.ledger.append_event(
                    &NewEvent::new(license.id, EventType::Validated, now)
                        .fingerprint(fingerprint)
                        .ip(ip),
                )?;
                Ok(self.granted(&license))
            }
            Verdict::Refused(resp) | Verdict::Unknown(resp) => Ok(resp),
        }
    }

    /// Admits a machine onto a license, enforcing the slot limit.
    ///
    /// A fingerprint that already holds a slot is always re-admitted. The
    /// count-then-write sequence is not atomic, so concurrent activations of
    /// different fingerprints near the limit may briefly over-admit.
    pub fn activate(&self, req: &ActivateRequest, ip: &str) -> AuthorityResult<LicenseResponse> {
        let key = required_key(&req.license_key)?;
        let fingerprint = required(&req.machine_fingerprint, "machine_fingerprint")?;
        let now = self.clock.now();
        let license = match self.verdict(&key, fingerprint, ip, now)? {
            Verdict::Usable(license) => license,
            Verdict::Refused(resp) | Verdict::Unknown(resp) => return Ok(resp),
        };

        let holds_slot = self
            .ledger
            .find_deployment(license.id, fingerprint)?
            .is_some_and(|d| d.is_active);
        if !holds_slot {
            let active = self.ledger.count_active_deployments(license.id)?;
            if active >= license.max_deployments {
                warn!(
                    license_id = %license.id,
                    fingerprint,
                    active,
                    max = license.max_deployments,
                    "activation refused: deployment limit reached"
                );
                return Ok(LicenseResponse {
                    plan: Some(license.plan),
                    max_deployments: Some(license.max_deployments),
                    ..LicenseResponse::rejected(
                        LicenseStatus::OverLimit,
                        format!(
                            "all {} deployment slots are in use; deactivate another server first",
                            license.max_deployments
                        ),
                    )
                });
            }
        }

        let deployment = self.ledger.upsert_deployment(&DeploymentUpsert {
            license_id: license.id,
            machine_fingerprint: fingerprint,
            label: req.machine_label.trim(),
            ip,
            version: req.server_version.trim(),
            at: now,
        })?;
        let mut details = format!(
            "label={} version={}",
            deployment.label, deployment.reported_version
        );
        if let Some(domain) = req.domain.as_deref().filter(|d| !d.is_empty()) {
            details.push_str(&format!(" domain={domain}"));
        }
        self.ledger.append_event(
            &NewEvent::new(license.id, EventType::Activated, now)
                .fingerprint(fingerprint)
                .ip(ip)
                .details(details),
        )?;
        info!(
            license_id = %license.id,
            fingerprint,
            reactivated = holds_slot,
            "deployment activated"
        );
        Ok(self.granted(&license))
    }

    /// Validates and refreshes an admitted deployment's liveness.
    ///
    /// The slot limit is not re-checked. A fingerprint with no active
    /// deployment (for example one reclaimed by the stale sweep) gets
    /// `deactivated` and must activate again.
    pub fn heartbeat(&self, req: &HeartbeatRequest, ip: &str) -> AuthorityResult<LicenseResponse> {
        let key = required_key(&req.license_key)?;
        let fingerprint = required(&req.machine_fingerprint, "machine_fingerprint")?;
        let now = self.clock.now();
        let license = match self.verdict(&key, fingerprint, ip, now)? {
            Verdict::Usable(license) => license,
            Verdict::Refused(resp) | Verdict::Unknown(resp) => return Ok(resp),
        };

        let touched = self.ledger.touch_deployment(
            license.id,
            fingerprint,
            ip,
            req.server_version.trim(),
            now,
        )?;
        if !touched {
            debug!(license_id = %license.id, fingerprint, "heartbeat from inactive deployment");
            return Ok(LicenseResponse {
                plan: Some(license.plan),
                ..LicenseResponse::rejected(
                    LicenseStatus::Deactivated,
                    "deployment is not active; activate again",
                )
            });
        }

        let mut event = NewEvent::new(license.id, EventType::Heartbeat, now)
            .fingerprint(fingerprint)
            .ip(ip);
        if let Some(domain) = req.domain.as_deref().filter(|d| !d.is_empty()) {
            event = event.details(format!("domain={domain}"));
        }
        self.ledger.append_event(&event)?;
        Ok(self.granted(&license))
    }

    /// Releases a machine's slot. Succeeds even if it was already inactive.
    pub fn deactivate(
        &self,
        req: &DeactivateRequest,
        ip: &str,
    ) -> AuthorityResult<LicenseResponse> {
        let key = required_key(&req.license_key)?;
        let fingerprint = required(&req.machine_fingerprint, "machine_fingerprint")?;
        let now = self.clock.now();
        let Some(license) = self.ledger.license_by_key(&key)? else {
            return Ok(unknown_key());
        };

        if self.ledger.deactivate_deployment(license.id, fingerprint)? {
            self.ledger.append_event(
                &NewEvent::new(license.id, EventType::Deactivated, now)
                    .fingerprint(fingerprint)
                    .ip(ip),
            )?;
            info!(license_id = %license.id, fingerprint, "deployment deactivated");
        }
        Ok(LicenseResponse {
            valid: true,
            plan: Some(license.plan),
            status: LicenseStatus::Deactivated,
            message: Some("deployment deactivated".to_string()),
            max_deployments: Some(license.max_deployments),
            grace_days: None,
            expires_at: license.expires_at,
            features: None,
        })
    }

    /// Reclaims slots from deployments silent for longer than `threshold`.
    /// Returns how many were reclaimed.
    pub fn stale_sweep(&self, threshold: Duration) -> AuthorityResult<usize> {
        if threshold < Duration::zero() {
            return Err(AuthorityError::InvalidRequest(
                "stale threshold must not be negative".into(),
            ));
        }
        let now = self.clock.now();
        let cutoff = now.checked_sub_signed(threshold).ok_or_else(|| {
            AuthorityError::InvalidRequest(format!("stale threshold out of range: {threshold}"))
        })?;
        let swept = self.ledger.sweep_stale(cutoff)?;
        for deployment in &swept {
            let event = NewEvent::new(deployment.license_id, EventType::Deactivated, now)
                .fingerprint(deployment.machine_fingerprint.clone())
                .details(format!(
                    "stale: last heartbeat {}",
                    deployment.last_heartbeat.to_rfc3339()
                ));
            if let Err(e) = self.ledger.append_event(&event) {
                warn!(error = %e, "failed to record stale deactivation");
            }
        }
        if !swept.is_empty() {
            info!(count = swept.len(), "stale deployments reclaimed");
        }
        Ok(swept.len())
    }

    // ── Operator write path ──────────────────────────────────────

    /// Revokes a license. Existing deployments are refused on their next call.
    pub fn revoke(&self, key: &str) -> AuthorityResult<LicenseRecord> {
        let license = self.operator_lookup(key)?;
        let now = self.clock.now();
        self.ledger.revoke_license(license.id, now)?;
        self.ledger
            .append_event(&NewEvent::new(license.id, EventType::Revoked, now))?;
        info!(license_id = %license.id, "license revoked");
        self.operator_lookup(key)
    }

    /// Changes the slot limit. Already-admitted deployments keep their slots;
    /// only the next activation sees the new limit.
    pub fn set_max_deployments(&self, key: &str, max: u32) -> AuthorityResult<LicenseRecord> {
        if max == 0 {
            return Err(AuthorityError::InvalidRequest(
                "max_deployments must be at least 1".into(),
            ));
        }
        let license = self.operator_lookup(key)?;
        self.ledger.set_max_deployments(license.id, max)?;
        self.operator_lookup(key)
    }

    /// Overrides (or with `None` clears) a license's stored features.
    pub fn set_features(
        &self,
        key: &str,
        features: Option<Vec<String>>,
    ) -> AuthorityResult<LicenseRecord> {
        let license = self.operator_lookup(key)?;
        self.ledger.set_features(license.id, features.as_deref())?;
        self.operator_lookup(key)
    }

    /// Lists a license's deployments.
    pub fn deployments(&self, key: &str) -> AuthorityResult<Vec<DeploymentRecord>> {
        let license = self.operator_lookup(key)?;
        Ok(self.ledger.deployments_for_license(license.id)?)
    }

    /// Returns a license's audit trail.
    pub fn events(&self, key: &str) -> AuthorityResult<Vec<EventRecord>> {
        let license = self.operator_lookup(key)?;
        Ok(self.ledger.events_for_license(license.id)?)
    }

    // ── Internals ────────────────────────────────────────────────

    fn operator_lookup(&self, key: &str) -> AuthorityResult<LicenseRecord> {
        let key = normalize_key(key);
        self.ledger
            .license_by_key(&key)?
            .ok_or(AuthorityError::NotFound(key))
    }

    /// Classifies a key: unknown, revoked/inactive, expired, or usable.
    fn verdict(
        &self,
        key: &str,
        fingerprint: &str,
        ip: &str,
        now: DateTime<Utc>,
    ) -> AuthorityResult<Verdict> {
        let Some(license) = self.ledger.license_by_key(key)? else {
            debug!(fingerprint, "unknown license key");
            return Ok(Verdict::Unknown(unknown_key()));
        };

        if license.revoked_at.is_some() || !license.is_active {
            let resp = self.refused(&license, LicenseStatus::Revoked, "license has been revoked");
            return Ok(Verdict::Refused(resp));
        }

        if let Some(expires_at) = license.expires_at.filter(|exp| now >= *exp) {
            self.ledger.append_event(
                &NewEvent::new(license.id, EventType::Expired, now)
                    .fingerprint(fingerprint)
                    .ip(ip),
            )?;
            let message = format!("license expired on {}", expires_at.format("%Y-%m-%d"));
            let resp = self.refused(&license, LicenseStatus::Expired, message);
            return Ok(Verdict::Refused(resp));
        }

        Ok(Verdict::Usable(license))
    }

    fn granted(&self, license: &LicenseRecord) -> LicenseResponse {
        LicenseResponse {
            valid: true,
            plan: Some(license.plan),
            status: LicenseStatus::Active,
            message: None,
            max_deployments: Some(license.max_deployments),
            grace_days: Some(self.grace_days),
            expires_at: license.expires_at,
            features: Some(resolve_features(
                license.features.as_deref(),
                &license.key,
                license.plan,
            )),
        }
    }

    fn refused(
        &self,
        license: &LicenseRecord,
        status: LicenseStatus,
        message: impl Into<String>,
    ) -> LicenseResponse {
        LicenseResponse {
            plan: Some(license.plan),
            max_deployments: Some(license.max_deployments),
            expires_at: license.expires_at,
            ..LicenseResponse::rejected(status, message)
        }
    }
}

fn unknown_key() -> LicenseResponse {
    LicenseResponse::rejected(LicenseStatus::Invalid, "unknown license key")
}

fn required_key(value: &str) -> AuthorityResult<String> {
    let key = normalize_key(value);
    if key.is_empty() {
        return Err(AuthorityError::InvalidRequest("license_key is required".into()));
    }
    Ok(key)
}

fn required<'a>(value: &'a str, field: &str) -> AuthorityResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AuthorityError::InvalidRequest(format!("{field} is required")));
    }
    Ok(trimmed)
}
