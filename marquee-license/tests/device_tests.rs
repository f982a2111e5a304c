use marquee_license::{fingerprint_from, machine_fingerprint, DeviceInfo, INSTANCE_ID_FILE};

#[test]
fn device_info_collection() {
    let info = DeviceInfo::collect();
    assert!(!info.os_name.is_empty());
    assert!(!info.arch.is_empty());
    assert!(!info.label().is_empty());
}

#[test]
fn fingerprint_is_stable_for_a_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let first = machine_fingerprint(dir.path()).unwrap();
    let second = machine_fingerprint(dir.path()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 64);
}

#[test]
fn fingerprint_differs_between_data_dirs() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    assert_ne!(
        machine_fingerprint(a.path()).unwrap(),
        machine_fingerprint(b.path()).unwrap()
    );
}

#[test]
fn fingerprint_follows_persisted_instance_id() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(INSTANCE_ID_FILE), "fixed-instance\n").unwrap();
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    assert_eq!(
        machine_fingerprint(dir.path()).unwrap(),
        fingerprint_from("fixed-instance", &host)
    );
}

#[test]
fn hostname_changes_fingerprint() {
    assert_ne!(
        fingerprint_from("instance", "host-a"),
        fingerprint_from("instance", "host-b")
    );
    assert_eq!(fingerprint_from("instance", ""), fingerprint_from("instance", ""));
}

#[cfg(unix)]
#[test]
fn instance_id_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    machine_fingerprint(dir.path()).unwrap();
    let mode = std::fs::metadata(dir.path().join(INSTANCE_ID_FILE))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn missing_data_dir_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    assert!(machine_fingerprint(&missing).is_err());
}
