use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::fs;
use vivid_client::{
    ClientError, DeviceIdentity, EntitlementCache, LocalEntitlementStore, CACHE_FILE_NAME,
};
use vivid_crypto::KdfParams;
use vivid_types::{ReferralCodeResponse, TrialId, TrialSnapshot, TrialType};

fn identity(device_id: &str) -> DeviceIdentity {
    DeviceIdentity {
        device_id: device_id.into(),
        fingerprint: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08".into(),
        is_simulator: false,
    }
}

fn open(dir: &std::path::Path, device_id: &str) -> LocalEntitlementStore {
    LocalEntitlementStore::open(dir, &identity(device_id), &KdfParams::light()).unwrap()
}

fn sample_cache() -> EntitlementCache {
    let start = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
    EntitlementCache {
        user_id: "alice".into(),
        trial: Some(TrialSnapshot {
            trial_id: TrialId::new(),
            trial_type: TrialType::Limited,
            start_date: start,
            expires_at: start + Duration::days(3),
            is_active: true,
            generations_used: 1,
            max_generations: 3,
        }),
        referral: Some(ReferralCodeResponse {
            referral_code: "K7QX2MPA".into(),
            rewards_granted: 2,
        }),
        last_sync: start,
        verified: true,
    }
}

// ── Round trip ───────────────────────────────────────────────────

#[test]
fn missing_file_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(open(dir.path(), "install-1").load(), None);
}

#[test]
fn save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    let cache = sample_cache();
    store.save(&cache).unwrap();

    assert_eq!(store.load(), Some(cache.clone()));
    // A fresh handle re-derives the same key.
    assert_eq!(open(dir.path(), "install-1").load(), Some(cache));
}

#[test]
fn blob_is_not_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    store.save(&sample_cache()).unwrap();

    let blob = fs::read(store.path()).unwrap();
    let text = String::from_utf8_lossy(&blob);
    assert!(!text.contains("alice"));
    assert!(!text.contains("K7QX2MPA"));
}

#[test]
fn save_overwrites_previous_blob() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    store.save(&sample_cache()).unwrap();

    let mut updated = sample_cache();
    updated.verified = false;
    updated.trial = None;
    store.save(&updated).unwrap();

    assert_eq!(store.load(), Some(updated));
}

#[test]
fn save_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    for _ in 0..3 {
        store.save(&sample_cache()).unwrap();
    }
    let names: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec![CACHE_FILE_NAME.to_string()]);
}

#[test]
fn failed_save_keeps_previous_blob() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    let cache = sample_cache();
    store.save(&cache).unwrap();
    let before = fs::read(store.path()).unwrap();

    // A handle whose directory is the blob itself cannot create its dir.
    let misplaced = open(store.path(), "install-1");
    let mut updated = sample_cache();
    updated.trial = None;
    let err = misplaced.save(&updated).unwrap_err();
    assert!(matches!(err, ClientError::Storage(_)), "got {err:?}");

    assert_eq!(fs::read(store.path()).unwrap(), before);
    assert_eq!(store.load(), Some(cache));
}

#[cfg(unix)]
#[test]
fn save_into_read_only_directory_keeps_previous_blob() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    let cache = sample_cache();
    store.save(&cache).unwrap();

    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555)).unwrap();
    // Privileged users bypass directory permissions; nothing to check then.
    let enforced = fs::File::create(dir.path().join("write-check")).is_err();
    if enforced {
        let mut updated = sample_cache();
        updated.verified = false;
        assert!(store.save(&updated).is_err());
        assert_eq!(store.load(), Some(cache));
    }
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn save_creates_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a").join("b");
    let store = open(&nested, "install-1");
    store.save(&sample_cache()).unwrap();
    assert!(store.load().is_some());
}

// ── Tampering ────────────────────────────────────────────────────

#[test]
fn any_flipped_byte_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    store.save(&sample_cache()).unwrap();
    let original = fs::read(store.path()).unwrap();

    for i in 0..original.len() {
        let mut tampered = original.clone();
        tampered[i] ^= 0x01;
        fs::write(store.path(), &tampered).unwrap();
        assert_eq!(store.load(), None, "byte {i} flipped but cache still loaded");
    }
}

#[test]
fn truncated_or_garbage_blob_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    store.save(&sample_cache()).unwrap();
    let original = fs::read(store.path()).unwrap();

    fs::write(store.path(), &original[..original.len() / 2]).unwrap();
    assert_eq!(store.load(), None);

    fs::write(store.path(), b"not a cache").unwrap();
    assert_eq!(store.load(), None);

    fs::write(store.path(), b"").unwrap();
    assert_eq!(store.load(), None);
}

#[test]
fn blob_from_another_device_does_not_open() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let store_a = open(dir_a.path(), "install-a");
    let store_b = open(dir_b.path(), "install-b");
    store_a.save(&sample_cache()).unwrap();

    fs::copy(store_a.path(), store_b.path()).unwrap();
    assert_eq!(store_b.load(), None);
}

#[test]
fn corrupt_blob_is_replaced_by_next_save() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    fs::write(store.path(), b"garbage").unwrap();
    assert_eq!(store.load(), None);

    let cache = sample_cache();
    store.save(&cache).unwrap();
    assert_eq!(store.load(), Some(cache));
}

#[test]
fn clear_removes_blob_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), "install-1");
    store.save(&sample_cache()).unwrap();

    store.clear().unwrap();
    assert_eq!(store.load(), None);
    assert!(!store.path().exists());
    store.clear().unwrap();
}
