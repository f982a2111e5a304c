//! Shared test helpers for license client tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use marquee_authority::{Authority, IssueRequest};
use marquee_ledger::{Ledger, LicenseRecord};
use marquee_license::{AuthorityTransport, ClientConfig, LicenseClient, LicenseError, LicenseResult};
use marquee_types::{
    ActivateRequest, DeactivateRequest, HeartbeatRequest, LicenseResponse, ManualClock, Plan,
    ValidateRequest,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
}

/// Routes client calls straight into an in-process authority, with a switch
/// that simulates a network partition.
pub struct LocalTransport {
    pub authority: Authority,
    online: AtomicBool,
    calls: AtomicUsize,
}

impl LocalTransport {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> LicenseResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LicenseError::Unreachable("connection refused".into()))
        }
    }

    fn answer(
        result: marquee_authority::AuthorityResult<LicenseResponse>,
    ) -> LicenseResult<LicenseResponse> {
        result.map_err(|e| LicenseError::Unreachable(e.to_string()))
    }
}

#[async_trait]
impl AuthorityTransport for LocalTransport {
    async fn validate(&self, req: &ValidateRequest) -> LicenseResult<LicenseResponse> {
        self.check()?;
        Self::answer(self.authority.validate(req, "127.0.0.1"))
    }

    async fn activate(&self, req: &ActivateRequest) -> LicenseResult<LicenseResponse> {
        self.check()?;
        Self::answer(self.authority.activate(req, "127.0.0.1"))
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> LicenseResult<LicenseResponse> {
        self.check()?;
        Self::answer(self.authority.heartbeat(req, "127.0.0.1"))
    }

    async fn deactivate(&self, req: &DeactivateRequest) -> LicenseResult<LicenseResponse> {
        self.check()?;
        Self::answer(self.authority.deactivate(req, "127.0.0.1"))
    }
}

/// An authority, its transport and the clock both sides share.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub transport: Arc<LocalTransport>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_authority(|authority| authority)
    }

    /// Like [`Harness::new`], with the authority advertising `days` of grace.
    pub fn with_grace_days(days: u32) -> Self {
        Self::with_authority(|authority| authority.grace_days(days))
    }

    fn with_authority(build: impl FnOnce(Authority) -> Authority) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let authority = build(Authority::with_clock(
            Ledger::open_in_memory().unwrap(),
            clock.clone(),
        ));
        Self {
            clock,
            transport: Arc::new(LocalTransport {
                authority,
                online: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.transport.authority
    }

    pub fn issue(&self, plan: Plan) -> LicenseRecord {
        self.authority()
            .issue(IssueRequest::new(plan, "ops@example.com"))
            .unwrap()
    }

    pub fn config(&self, data_dir: &Path, key: Option<&str>) -> ClientConfig {
        ClientConfig {
            license_key: key.map(str::to_string),
            data_dir: data_dir.to_path_buf(),
            server_version: "2.1.0".to_string(),
            machine_label: Some("test-box".to_string()),
            ..ClientConfig::default()
        }
    }

    pub fn client(&self, config: ClientConfig) -> LicenseClient {
        LicenseClient::with_transport(config, self.transport.clone(), self.clock.clone()).unwrap()
    }

    pub fn active_slots(&self, license: &LicenseRecord) -> u32 {
        self.authority()
            .ledger()
            .count_active_deployments(license.id)
            .unwrap()
    }
}

/// Polls `cond` until it holds or about two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
