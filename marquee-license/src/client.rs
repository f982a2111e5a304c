//! The license client state machine.
//!
//! A [`LicenseClient`] resolves trust once at startup, then keeps it fresh
//! with one background heartbeat loop. Request handlers read its in-memory
//! status through [`LicenseClient::is_valid`] and
//! [`LicenseClient::has_feature`]; neither touches the network.
//!
//! Startup, for a configured key:
//! - a matching positive cache younger than the validity window (capped at
//!   the grace window) grants `licensed` at once and revalidates in the
//!   background;
//! - an older cache still inside the grace window triggers a synchronous
//!   activation, falling back to `grace` if the authority is unreachable;
//! - anything else requires a successful activation, or startup fails.

use crate::device::{machine_fingerprint, DeviceInfo};
use crate::error::{LicenseError, LicenseResult};
use crate::store::{ensure_data_dir, read_key_file, write_key_file, CacheStore, LocalCache};
use crate::transport::{AuthorityTransport, HttpTransport};
use chrono::{DateTime, Utc};
use marquee_types::key::normalize_key;
use marquee_types::{
    ActivateRequest, Clock, DeactivateRequest, HeartbeatRequest, LicenseResponse, LicenseStatus,
    Plan, SystemClock,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A cached answer younger than this is trusted without a round trip.
pub const DEFAULT_VALIDITY_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Offline allowance used when the authority did not advertise one.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// License client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Key from configuration. Takes precedence over the stored key.
    pub license_key: Option<String>,
    /// Holds the instance id, stored key and cache.
    pub data_dir: PathBuf,
    /// Base URL of the license authority.
    pub authority_url: String,
    /// Version reported on activation and heartbeat.
    pub server_version: String,
    /// Deployment label. Defaults to the hostname.
    pub machine_label: Option<String>,
    /// Public domain, reported for the audit log.
    pub domain: Option<String>,
    pub validity_window: Duration,
    /// Upper bound on grace. A shorter grace advertised by the authority wins.
    pub grace_window: Duration,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            license_key: None,
            data_dir: PathBuf::from("data"),
            authority_url: "http://localhost:8470".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            machine_label: None,
            domain: None,
            validity_window: DEFAULT_VALIDITY_WINDOW,
            grace_window: DEFAULT_GRACE_WINDOW,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Where the client currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No key configured. Only the admin surface is served.
    Demo,
    /// The authority (or a fresh cache) vouches for the key.
    Licensed,
    /// The authority is unreachable and the cache is inside its grace window.
    Grace,
    /// Explicitly refused, or grace ran out.
    Invalid,
}

impl Mode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Licensed => "licensed",
            Self::Grace => "grace",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the client, for display and gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub mode: Mode,
    pub plan: Option<Plan>,
    pub features: Vec<String>,
    pub message: String,
    pub grace_deadline: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct State {
    key: Option<String>,
    mode: Mode,
    plan: Option<Plan>,
    features: Vec<String>,
    message: String,
    grace_deadline: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

impl State {
    fn demo() -> Self {
        Self {
            key: None,
            mode: Mode::Demo,
            plan: None,
            features: Vec::new(),
            message: "no license key; demo mode".to_string(),
            grace_deadline: None,
            expires_at: None,
        }
    }

    fn from_cache(key: &str, mode: Mode, cache: &LocalCache, message: String) -> Self {
        Self {
            key: Some(key.to_string()),
            mode,
            plan: cache.plan,
            features: cache.features.clone(),
            message,
            grace_deadline: None,
            expires_at: cache.expires_at,
        }
    }

    fn effective_mode(&self, now: DateTime<Utc>) -> Mode {
        match self.mode {
            Mode::Grace if !self.grace_deadline.is_some_and(|deadline| now < deadline) => {
                Mode::Invalid
            }
            mode => mode,
        }
    }
}

struct Inner {
    config: ClientConfig,
    fingerprint: String,
    label: String,
    transport: Arc<dyn AuthorityTransport>,
    clock: Arc<dyn Clock>,
    state: RwLock<State>,
    cache: CacheStore,
    /// Cancels the running heartbeat loop. Held across a whole start, rekey
    /// or shutdown so that at most one loop exists.
    lifecycle: tokio::sync::Mutex<Option<CancellationToken>>,
}

/// Customer-side license client. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LicenseClient {
    inner: Arc<Inner>,
}

impl LicenseClient {
    /// Creates a client talking HTTP to `config.authority_url`.
    ///
    /// Fails if the data directory cannot be created or written.
    pub fn new(config: ClientConfig) -> LicenseResult<Self> {
        let transport = HttpTransport::new(config.authority_url.clone(), config.request_timeout)?;
        Self::with_transport(config, Arc::new(transport), Arc::new(SystemClock))
    }

    /// Creates a client over an explicit transport and clock.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn AuthorityTransport>,
        clock: Arc<dyn Clock>,
    ) -> LicenseResult<Self> {
        ensure_data_dir(&config.data_dir)?;
        let fingerprint = machine_fingerprint(&config.data_dir)?;
        let label = config
            .machine_label
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| DeviceInfo::collect().label());
        let cache = CacheStore::new(&config.data_dir);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                fingerprint,
                label,
                transport,
                clock,
                state: RwLock::new(State::demo()),
                cache,
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// This installation's machine fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    /// Resolves trust for the configured or stored key.
    ///
    /// Returns an error only when a key is present, no usable cache exists,
    /// and activation fails; the caller should then refuse to start.
    pub async fn start(&self) -> LicenseResult<()> {
        let configured = self
            .inner
            .config
            .license_key
            .as_deref()
            .map(normalize_key)
            .filter(|k| !k.is_empty());
        let key = match configured {
            Some(key) => Some(key),
            None => read_key_file(&self.inner.config.data_dir)?,
        };
        let mut lifecycle = self.inner.lifecycle.lock().await;
        stop_loop(&mut lifecycle);
        self.resolve(key, &mut lifecycle).await
    }

    /// Replaces the key: stops the heartbeat loop, stores the new key and
    /// resolves trust for it from scratch.
    pub async fn rekey(&self, key: &str) -> LicenseResult<()> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(LicenseError::Rejected {
                status: LicenseStatus::Invalid,
                message: "license key is empty".to_string(),
            });
        }
        let mut lifecycle = self.inner.lifecycle.lock().await;
        stop_loop(&mut lifecycle);
        write_key_file(&self.inner.config.data_dir, &key)?;
        info!("license key replaced");
        self.resolve(Some(key), &mut lifecycle).await
    }

    /// Stops the heartbeat loop and releases this machine's slot in the
    /// background.
    ///
    /// The deactivation is attempted once. The returned handle may be awaited
    /// to let it finish before the process exits.
    pub async fn shutdown(&self) -> Option<JoinHandle<()>> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        stop_loop(&mut lifecycle);

        let key = self.read_state().key.clone()?;
        let transport = Arc::clone(&self.inner.transport);
        let req = DeactivateRequest {
            license_key: key,
            machine_fingerprint: self.inner.fingerprint.clone(),
        };
        Some(tokio::spawn(async move {
            match transport.deactivate(&req).await {
                Ok(resp) => debug!(status = %resp.status, "deployment released"),
                Err(e) => warn!("deactivate on shutdown failed: {e}"),
            }
        }))
    }

    /// True in demo and licensed mode, and in grace until the deadline passes.
    ///
    /// Evaluated against the clock on every call, so a client in grace turns
    /// invalid without any further network activity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self.mode(), Mode::Demo | Mode::Licensed | Mode::Grace)
    }

    /// True if the last accepted answer granted `feature`.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.read_state().features.iter().any(|f| f == feature)
    }

    /// Current mode, with an expired grace period reported as invalid.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.read_state().effective_mode(self.inner.clock.now())
    }

    /// Snapshot of the current status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        let now = self.inner.clock.now();
        let state = self.read_state();
        let mode = state.effective_mode(now);
        let message = match (state.mode, mode, state.grace_deadline) {
            (Mode::Grace, Mode::Invalid, Some(deadline)) => {
                format!("grace period ended on {}", deadline.format("%Y-%m-%d"))
            }
            _ => state.message.clone(),
        };
        ClientStatus {
            mode,
            plan: state.plan,
            features: state.features.clone(),
            message,
            grace_deadline: state.grace_deadline,
            expires_at: state.expires_at,
        }
    }

    // ── Trust resolution ─────────────────────────────────────────

    async fn resolve(
        &self,
        key: Option<String>,
        lifecycle: &mut Option<CancellationToken>,
    ) -> LicenseResult<()> {
        let Some(key) = key else {
            info!("no license key configured; running in demo mode");
            *self.write_state() = State::demo();
            return Ok(());
        };

        let now = self.inner.clock.now();
        let cache = self
            .inner
            .cache
            .load()
            .filter(|c| c.valid && c.matches(&key, &self.inner.fingerprint))
            .filter(|c| c.expires_at.is_none_or(|exp| now < exp));

        if let Some(cache) = cache {
            let age = now - cache.validated_at;
            if age < self.freshness_window(&cache) {
                info!(plan = ?cache.plan, "licensed from cache; revalidating in background");
                let message = licensed_message(cache.plan);
                *self.write_state() = State::from_cache(&key, Mode::Licensed, &cache, message);
                let token = self.start_loop(lifecycle);
                self.spawn_revalidation(key, token);
                return Ok(());
            }

            let grace = self.grace_window(&cache);
            if age < grace {
                let result = self.call_activate(&key).await;
                return match self.settle(&key, result) {
                    Ok(()) => {
                        self.start_loop(lifecycle);
                        Ok(())
                    }
                    Err(e) if e.is_unreachable() => {
                        warn!("license authority unreachable at startup: {e}");
                        self.enter_grace(&key, &cache, cache.validated_at + grace);
                        self.start_loop(lifecycle);
                        Ok(())
                    }
                    Err(e) if e.is_rejection() => Ok(()),
                    Err(e) => Err(e),
                };
            }
        }

        let result = self.call_activate(&key).await;
        if let Err(e) = self.settle(&key, result) {
            if !e.is_rejection() {
                self.set_invalid(&key, format!("license could not be verified: {e}"));
            }
            error!("license activation failed: {e}");
            return Err(e);
        }
        self.start_loop(lifecycle);
        Ok(())
    }

    async fn call_activate(&self, key: &str) -> LicenseResult<LicenseResponse> {
        let req = ActivateRequest {
            license_key: key.to_string(),
            machine_fingerprint: self.inner.fingerprint.clone(),
            machine_label: self.inner.label.clone(),
            server_version: self.inner.config.server_version.clone(),
            domain: self.inner.config.domain.clone(),
        };
        self.inner.transport.activate(&req).await
    }

    /// Applies an authority answer: acceptance refreshes the cache and
    /// licenses; refusal persists the refusal and invalidates.
    fn settle(&self, key: &str, result: LicenseResult<LicenseResponse>) -> LicenseResult<()> {
        let resp = result?;
        if resp.valid {
            self.accept(key, &resp);
            Ok(())
        } else {
            Err(self.reject(key, &resp))
        }
    }

    fn accept(&self, key: &str, resp: &LicenseResponse) {
        let cache = self.cache_entry(key, resp);
        if let Err(e) = self.inner.cache.save(&cache) {
            error!("failed to write license cache: {e}");
        }
        info!(plan = ?resp.plan, features = ?resp.features(), "license accepted");
        *self.write_state() =
            State::from_cache(key, Mode::Licensed, &cache, licensed_message(cache.plan));
    }

    fn reject(&self, key: &str, resp: &LicenseResponse) -> LicenseError {
        let cache = self.cache_entry(key, resp);
        if let Err(e) = self.inner.cache.save(&cache) {
            error!("failed to persist license refusal: {e}");
        }
        let message = resp
            .message
            .clone()
            .unwrap_or_else(|| format!("license {}", resp.status));
        warn!(status = %resp.status, "license refused: {message}");
        self.set_invalid(key, message.clone());
        LicenseError::Rejected {
            status: resp.status,
            message,
        }
    }

    fn set_invalid(&self, key: &str, message: String) {
        let mut state = self.write_state();
        state.key = Some(key.to_string());
        state.mode = Mode::Invalid;
        state.features.clear();
        state.grace_deadline = None;
        state.message = message;
    }

    fn enter_grace(&self, key: &str, cache: &LocalCache, deadline: DateTime<Utc>) {
        let message = format!("grace period until {}", deadline.format("%Y-%m-%d"));
        warn!(%deadline, "{message}");
        let mut state = State::from_cache(key, Mode::Grace, cache, message);
        state.grace_deadline = Some(deadline);
        *self.write_state() = state;
    }

    /// Re-evaluates the cache after the authority could not be reached.
    fn fall_back(&self, key: &str) {
        let Some(cache) = self
            .inner
            .cache
            .load()
            .filter(|c| c.valid && c.matches(key, &self.inner.fingerprint))
        else {
            warn!("authority unreachable and no positive cache; keeping current state");
            return;
        };
        let age = self.inner.clock.now() - cache.validated_at;
        let mode = self.read_state().mode;
        match mode {
            Mode::Licensed if age < self.freshness_window(&cache) => {
                debug!("authority unreachable; cached answer still fresh");
                return;
            }
            Mode::Grace => return,
            _ => {}
        }
        let deadline = cache.validated_at + self.grace_window(&cache);
        self.enter_grace(key, &cache, deadline);
    }

    fn cache_entry(&self, key: &str, resp: &LicenseResponse) -> LocalCache {
        LocalCache::from_response(
            key,
            &self.inner.fingerprint,
            &self.inner.config.server_version,
            resp,
            self.inner.clock.now(),
        )
    }

    // ── Background tasks ─────────────────────────────────────────

    fn start_loop(&self, lifecycle: &mut Option<CancellationToken>) -> CancellationToken {
        stop_loop(lifecycle);
        let token = CancellationToken::new();
        *lifecycle = Some(token.clone());
        let client = self.clone();
        let loop_token = token.clone();
        tokio::spawn(async move { client.heartbeat_loop(loop_token).await });
        token
    }

    fn spawn_revalidation(&self, key: String, token: CancellationToken) {
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.call_activate(&key).await;
            if token.is_cancelled() {
                return;
            }
            match result {
                Ok(resp) if resp.valid => client.accept(&key, &resp),
                Ok(resp) => warn!(status = %resp.status, "background revalidation refused"),
                Err(e) => warn!("background revalidation failed: {e}"),
            }
        });
    }

    async fn heartbeat_loop(self, token: CancellationToken) {
        let interval = self.inner.config.heartbeat_interval;
        debug!(?interval, "heartbeat loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if !self.heartbeat_once(&token).await {
                break;
            }
        }
        debug!("heartbeat loop stopped");
    }

    /// One heartbeat. Returns false when the loop should end.
    async fn heartbeat_once(&self, token: &CancellationToken) -> bool {
        let Some(key) = self.read_state().key.clone() else {
            return false;
        };
        let req = HeartbeatRequest {
            license_key: key.clone(),
            machine_fingerprint: self.inner.fingerprint.clone(),
            server_version: self.inner.config.server_version.clone(),
            domain: self.inner.config.domain.clone(),
        };
        let mut result = self.inner.transport.heartbeat(&req).await;
        if token.is_cancelled() {
            return false;
        }

        if matches!(&result, Ok(resp) if resp.status == LicenseStatus::Deactivated) {
            info!("deployment slot was released; activating again");
            result = self.call_activate(&key).await;
            if token.is_cancelled() {
                return false;
            }
        }

        match self.settle(&key, result) {
            Ok(()) => true,
            Err(e) if e.is_unreachable() => {
                warn!("heartbeat failed: {e}");
                self.fall_back(&key);
                true
            }
            Err(e) if e.is_rejection() => false,
            Err(e) => {
                warn!("heartbeat error: {e}");
                true
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// How long a cached answer is trusted without asking again. Never
    /// longer than the grace window.
    fn freshness_window(&self, cache: &LocalCache) -> chrono::Duration {
        to_chrono(self.inner.config.validity_window).min(self.grace_window(cache))
    }

    /// The shorter of the configured grace and the one the authority advertised.
    fn grace_window(&self, cache: &LocalCache) -> chrono::Duration {
        let configured = to_chrono(self.inner.config.grace_window);
        if cache.grace_days > 0 {
            configured.min(chrono::Duration::days(i64::from(cache.grace_days)))
        } else {
            configured
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn stop_loop(lifecycle: &mut Option<CancellationToken>) {
    if let Some(token) = lifecycle.take() {
        token.cancel();
    }
}

fn licensed_message(plan: Option<Plan>) -> String {
    match plan {
        Some(plan) => format!("licensed ({plan})"),
        None => "licensed".to_string(),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
