use chrono::{DateTime, Duration, TimeZone, Utc};
use marquee_authority::{Authority, AuthorityError, IssueRequest};
use marquee_ledger::{EventType, Ledger, LicenseRecord};
use marquee_types::key::{is_enterprise_key, is_well_formed};
use marquee_types::{
    ActivateRequest, DeactivateRequest, HeartbeatRequest, LicenseId, LicenseStatus, ManualClock,
    Plan, ValidateRequest, FEATURE_LIVE_CHANNELS,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn setup() -> (Authority, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let authority = Authority::with_clock(Ledger::open_in_memory().unwrap(), clock.clone());
    (authority, clock)
}

fn activate_req(key: &str, fp: &str) -> ActivateRequest {
    ActivateRequest {
        license_key: key.to_string(),
        machine_fingerprint: fp.to_string(),
        machine_label: format!("server-{fp}"),
        server_version: "2.1.0".to_string(),
        domain: None,
    }
}

fn validate_req(key: &str, fp: &str) -> ValidateRequest {
    ValidateRequest {
        license_key: key.to_string(),
        machine_fingerprint: fp.to_string(),
    }
}

fn heartbeat_req(key: &str, fp: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        license_key: key.to_string(),
        machine_fingerprint: fp.to_string(),
        server_version: "2.1.1".to_string(),
        domain: Some("media.example.com".to_string()),
    }
}

fn deactivate_req(key: &str, fp: &str) -> DeactivateRequest {
    DeactivateRequest {
        license_key: key.to_string(),
        machine_fingerprint: fp.to_string(),
    }
}

fn active_count(authority: &Authority, license: &LicenseRecord) -> u32 {
    authority
        .ledger()
        .count_active_deployments(license.id)
        .unwrap()
}

// ── Issue ────────────────────────────────────────────────────────

#[test]
fn issue_defaults_from_plan() {
    let (authority, _) = setup();
    let personal = authority
        .issue(IssueRequest::new(Plan::Personal, "a@example.com"))
        .unwrap();
    assert_eq!(personal.max_deployments, 1);
    assert_eq!(personal.features, Some(vec![]));
    assert!(is_well_formed(&personal.key));
    assert!(!is_enterprise_key(&personal.key));

    let enterprise = authority
        .issue(IssueRequest::new(Plan::Enterprise, "b@example.com"))
        .unwrap();
    assert_eq!(enterprise.max_deployments, 50);
    assert_eq!(
        enterprise.features,
        Some(vec![FEATURE_LIVE_CHANNELS.to_string()])
    );
    assert!(is_enterprise_key(&enterprise.key));
}

#[test]
fn issue_honors_overrides_and_logs_created() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest {
            max_deployments: Some(3),
            features: Some(vec![FEATURE_LIVE_CHANNELS.to_string()]),
            expires_at: Some(t0() + Duration::days(30)),
            ..IssueRequest::new(Plan::Business, "c@example.com")
        })
        .unwrap();
    assert_eq!(license.max_deployments, 3);
    assert_eq!(
        license.features,
        Some(vec![FEATURE_LIVE_CHANNELS.to_string()])
    );

    let events = authority.events(&license.key).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Created);
}

#[test]
fn issue_rejects_missing_owner_and_zero_slots() {
    let (authority, _) = setup();
    assert!(matches!(
        authority.issue(IssueRequest::new(Plan::Personal, "  ")),
        Err(AuthorityError::InvalidRequest(_))
    ));
    assert!(matches!(
        authority.issue(IssueRequest {
            max_deployments: Some(0),
            ..IssueRequest::new(Plan::Personal, "a@example.com")
        }),
        Err(AuthorityError::InvalidRequest(_))
    ));
}

// ── Validate ─────────────────────────────────────────────────────

#[test]
fn validate_unknown_key_is_invalid() {
    let (authority, _) = setup();
    let resp = authority
        .validate(&validate_req("AAAAA-BBBBB-CCCCC-DDDDD", "fp"), "")
        .unwrap();
    assert!(!resp.valid);
    assert_eq!(resp.status, LicenseStatus::Invalid);
}

#[test]
fn validate_active_key_returns_entitlement() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    let resp = authority
        .validate(&validate_req(&license.key, "fp"), "10.0.0.1")
        .unwrap();
    assert!(resp.valid);
    assert_eq!(resp.status, LicenseStatus::Active);
    assert_eq!(resp.plan, Some(Plan::Business));
    assert_eq!(resp.max_deployments, Some(5));
    assert_eq!(resp.grace_days, Some(30));
    assert_eq!(resp.features, Some(vec![]));

    let events = authority.events(&license.key).unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::Validated);
}

#[test]
fn validate_accepts_lowercase_key() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Personal, "a@example.com"))
        .unwrap();
    let resp = authority
        .validate(&validate_req(&license.key.to_lowercase(), "fp"), "")
        .unwrap();
    assert!(resp.valid);
}

#[test]
fn revoked_license_is_revoked_regardless_of_active_flag() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.revoke(&license.key).unwrap();
    let resp = authority.validate(&validate_req(&license.key, "fp"), "").unwrap();
    assert!(!resp.valid);
    assert_eq!(resp.status, LicenseStatus::Revoked);
}

#[test]
fn inactive_license_without_revocation_is_revoked() {
    let clock = Arc::new(ManualClock::new(t0()));
    let ledger = Ledger::open_in_memory().unwrap();
    let license = LicenseRecord {
        id: LicenseId::new(),
        key: "AAAAA-BBBBB-CCCCC-DDDDD".to_string(),
        plan: Plan::Personal,
        owner: "a@example.com".to_string(),
        max_deployments: 1,
        is_active: false,
        features: None,
        expires_at: None,
        revoked_at: None,
        created_at: t0(),
    };
    ledger.insert_license(&license).unwrap();
    let authority = Authority::with_clock(ledger, clock);
    let resp = authority.validate(&validate_req(&license.key, "fp"), "").unwrap();
    assert_eq!(resp.status, LicenseStatus::Revoked);
}

#[test]
fn expired_license_is_expired_and_logged() {
    let (authority, clock) = setup();
    let license = authority
        .issue(IssueRequest {
            expires_at: Some(t0() + Duration::days(10)),
            ..IssueRequest::new(Plan::Business, "a@example.com")
        })
        .unwrap();
    assert!(authority.validate(&validate_req(&license.key, "fp"), "").unwrap().valid);

    clock.advance(Duration::days(10));
    let resp = authority.validate(&validate_req(&license.key, "fp"), "").unwrap();
    assert!(!resp.valid);
    assert_eq!(resp.status, LicenseStatus::Expired);
    assert!(resp.message.unwrap().contains("2024-03-11"));

    let events = authority.events(&license.key).unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::Expired);
}

#[test]
fn legacy_enterprise_row_recovers_features_from_prefix() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Enterprise, "a@example.com"))
        .unwrap();
    authority.set_features(&license.key, None).unwrap();

    let resp = authority.validate(&validate_req(&license.key, "fp"), "").unwrap();
    assert_eq!(resp.features, Some(vec![FEATURE_LIVE_CHANNELS.to_string()]));
}

#[test]
fn malformed_request_is_an_error() {
    let (authority, _) = setup();
    assert!(matches!(
        authority.validate(&validate_req("", "fp"), ""),
        Err(AuthorityError::InvalidRequest(_))
    ));
    assert!(matches!(
        authority.activate(&activate_req("KEY", "  "), ""),
        Err(AuthorityError::InvalidRequest(_))
    ));
}

// ── Activate ─────────────────────────────────────────────────────

#[test]
fn personal_plan_slot_scenario() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Personal, "a@example.com"))
        .unwrap();

    let a = authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    assert!(a.valid);
    assert_eq!(a.status, LicenseStatus::Active);

    let b = authority.activate(&activate_req(&license.key, "B"), "").unwrap();
    assert!(!b.valid);
    assert_eq!(b.status, LicenseStatus::OverLimit);
    assert!(authority
        .ledger()
        .find_deployment(license.id, "B")
        .unwrap()
        .is_none());

    authority.deactivate(&deactivate_req(&license.key, "A"), "").unwrap();
    let b = authority.activate(&activate_req(&license.key, "B"), "").unwrap();
    assert!(b.valid);
    assert_eq!(active_count(&authority, &license), 1);
}

#[test]
fn reactivating_same_fingerprint_does_not_grow_active_set() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    authority.activate(&activate_req(&license.key, "B"), "").unwrap();
    assert_eq!(active_count(&authority, &license), 2);

    for _ in 0..3 {
        let resp = authority.activate(&activate_req(&license.key, "A"), "").unwrap();
        assert!(resp.valid);
        assert_eq!(active_count(&authority, &license), 2);
    }
}

#[test]
fn reactivation_admitted_even_when_full() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Personal, "a@example.com"))
        .unwrap();
    authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    let again = authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    assert!(again.valid);
}

#[test]
fn sequential_activations_never_exceed_limit() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest {
            max_deployments: Some(3),
            ..IssueRequest::new(Plan::Business, "a@example.com")
        })
        .unwrap();
    for i in 0..10 {
        authority
            .activate(&activate_req(&license.key, &format!("fp-{i}")), "")
            .unwrap();
        assert!(active_count(&authority, &license) <= license.max_deployments);
    }
    assert_eq!(active_count(&authority, &license), 3);
}

#[test]
fn deactivate_then_activate_is_idempotent() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Personal, "a@example.com"))
        .unwrap();
    for _ in 0..3 {
        let d = authority.deactivate(&deactivate_req(&license.key, "A"), "").unwrap();
        assert!(d.valid);
        assert_eq!(d.status, LicenseStatus::Deactivated);
        let a = authority.activate(&activate_req(&license.key, "A"), "").unwrap();
        assert!(a.valid);
        assert_eq!(active_count(&authority, &license), 1);
    }
}

#[test]
fn activate_refused_for_revoked_license_creates_nothing() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.revoke(&license.key).unwrap();
    let resp = authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    assert_eq!(resp.status, LicenseStatus::Revoked);
    assert!(authority.deployments(&license.key).unwrap().is_empty());
}

#[test]
fn activation_records_label_version_ip_and_event() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    let mut req = activate_req(&license.key, "A");
    req.domain = Some("media.example.com".to_string());
    authority.activate(&req, "192.0.2.7").unwrap();

    let deployments = authority.deployments(&license.key).unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].label, "server-A");
    assert_eq!(deployments[0].reported_version, "2.1.0");
    assert_eq!(deployments[0].last_seen_ip, "192.0.2.7");

    let last = authority.events(&license.key).unwrap().pop().unwrap();
    assert_eq!(last.event_type, EventType::Activated);
    assert_eq!(last.fingerprint.as_deref(), Some("A"));
    assert!(last.details.unwrap().contains("domain=media.example.com"));
}

#[test]
fn lowering_limit_keeps_existing_deployments_but_blocks_new_ones() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    for fp in ["A", "B", "C"] {
        authority.activate(&activate_req(&license.key, fp), "").unwrap();
    }
    authority.set_max_deployments(&license.key, 1).unwrap();

    let hb = authority.heartbeat(&heartbeat_req(&license.key, "B"), "").unwrap();
    assert!(hb.valid);
    assert_eq!(active_count(&authority, &license), 3);

    let d = authority.activate(&activate_req(&license.key, "D"), "").unwrap();
    assert_eq!(d.status, LicenseStatus::OverLimit);
}

// ── Heartbeat ────────────────────────────────────────────────────

#[test]
fn heartbeat_refreshes_deployment() {
    let (authority, clock) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.activate(&activate_req(&license.key, "A"), "10.0.0.1").unwrap();

    clock.advance(Duration::hours(6));
    let resp = authority.heartbeat(&heartbeat_req(&license.key, "A"), "10.0.0.2").unwrap();
    assert!(resp.valid);
    assert_eq!(resp.status, LicenseStatus::Active);

    let dep = authority
        .ledger()
        .find_deployment(license.id, "A")
        .unwrap()
        .unwrap();
    assert_eq!(dep.last_heartbeat, t0() + Duration::hours(6));
    assert_eq!(dep.last_seen_ip, "10.0.0.2");
    assert_eq!(dep.reported_version, "2.1.1");
}

#[test]
fn heartbeat_without_slot_reports_deactivated() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    let resp = authority.heartbeat(&heartbeat_req(&license.key, "A"), "").unwrap();
    assert!(!resp.valid);
    assert_eq!(resp.status, LicenseStatus::Deactivated);
}

#[test]
fn heartbeat_on_revoked_license_is_revoked() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    authority.revoke(&license.key).unwrap();
    let resp = authority.heartbeat(&heartbeat_req(&license.key, "A"), "").unwrap();
    assert_eq!(resp.status, LicenseStatus::Revoked);
}

// ── Deactivate ───────────────────────────────────────────────────

#[test]
fn deactivate_unknown_key_is_invalid() {
    let (authority, _) = setup();
    let resp = authority
        .deactivate(&deactivate_req("AAAAA-BBBBB-CCCCC-DDDDD", "A"), "")
        .unwrap();
    assert!(!resp.valid);
    assert_eq!(resp.status, LicenseStatus::Invalid);
}

#[test]
fn deactivate_logs_event_once_per_existing_deployment() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.deactivate(&deactivate_req(&license.key, "ghost"), "").unwrap();
    authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    authority.deactivate(&deactivate_req(&license.key, "A"), "").unwrap();

    let deactivations = authority
        .events(&license.key)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::Deactivated)
        .count();
    assert_eq!(deactivations, 1);
}

// ── Stale sweep ──────────────────────────────────────────────────

#[test]
fn stale_sweep_threshold_boundary() {
    let (authority, clock) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.activate(&activate_req(&license.key, "old"), "").unwrap();
    clock.advance(Duration::hours(2));
    authority.activate(&activate_req(&license.key, "fresh"), "").unwrap();
    clock.advance(Duration::hours(23));

    let swept = authority.stale_sweep(Duration::hours(24)).unwrap();
    assert_eq!(swept, 1);

    let ledger = authority.ledger();
    assert!(!ledger.find_deployment(license.id, "old").unwrap().unwrap().is_active);
    assert!(ledger.find_deployment(license.id, "fresh").unwrap().unwrap().is_active);

    let last = authority.events(&license.key).unwrap().pop().unwrap();
    assert_eq!(last.event_type, EventType::Deactivated);
    assert!(last.details.unwrap().starts_with("stale"));
}

#[test]
fn swept_slot_can_be_reclaimed_by_another_machine() {
    let (authority, clock) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Personal, "a@example.com"))
        .unwrap();
    authority.activate(&activate_req(&license.key, "A"), "").unwrap();
    clock.advance(Duration::hours(25));
    authority.stale_sweep(Duration::hours(24)).unwrap();

    let b = authority.activate(&activate_req(&license.key, "B"), "").unwrap();
    assert!(b.valid);
    let hb = authority.heartbeat(&heartbeat_req(&license.key, "A"), "").unwrap();
    assert_eq!(hb.status, LicenseStatus::Deactivated);
}

#[test]
fn stale_sweep_rejects_out_of_range_thresholds() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Business, "a@example.com"))
        .unwrap();
    authority.activate(&activate_req(&license.key, "A"), "").unwrap();

    assert!(matches!(
        authority.stale_sweep(Duration::seconds(9_000_000_000_000)),
        Err(AuthorityError::InvalidRequest(_))
    ));
    assert!(matches!(
        authority.stale_sweep(Duration::hours(-1)),
        Err(AuthorityError::InvalidRequest(_))
    ));
    assert_eq!(active_count(&authority, &license), 1);
}

// ── Operator path ────────────────────────────────────────────────

#[test]
fn operator_commands_on_unknown_key_are_not_found() {
    let (authority, _) = setup();
    assert!(matches!(
        authority.revoke("NOPE"),
        Err(AuthorityError::NotFound(_))
    ));
    assert!(matches!(
        authority.deployments("NOPE"),
        Err(AuthorityError::NotFound(_))
    ));
}

#[test]
fn revoke_sets_revoked_at_and_logs() {
    let (authority, _) = setup();
    let license = authority
        .issue(IssueRequest::new(Plan::Personal, "a@example.com"))
        .unwrap();
    let revoked = authority.revoke(&license.key).unwrap();
    assert!(!revoked.is_active);
    assert_eq!(revoked.revoked_at, Some(t0()));
    let last = authority.events(&license.key).unwrap().pop().unwrap();
    assert_eq!(last.event_type, EventType::Revoked);
}
