//! End-to-end tests for the job store: persistence, reload across clock
//! states, and concurrent use.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use jobstore::codec;
use jobstore::{
    Clock, ConstraintSet, FileLayout, FlushOutcome, JobKey, JobRecord, JobSet, JobStore,
    JobStoreError, LoadOutcome, ManualClock, NetworkType, ScheduleTime, StoreConfig,
};
use jobstore_config::{ConfigLoader, ConfigValidator};

// ============================================================================
// Test Helpers
// ============================================================================

const T: i64 = 1_700_000_000_000;
const BOOT: i64 = 60_000;

fn clock(trusted: bool) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(T, BOOT, trusted))
}

fn open(dir: &TempDir, clock: Arc<dyn Clock>) -> (JobStore, LoadOutcome) {
    JobStore::open(StoreConfig::with_storage_dir(dir.path()), clock).unwrap()
}

fn persisted(package: &str, user: u32, id: i32) -> JobRecord {
    JobRecord::new(package, user, id).with_persisted(true)
}

fn decode_file(dir: &TempDir) -> JobSet {
    let data = fs::read(dir.path().join("jobs.bin")).unwrap();
    let (_, records) = codec::decode(Bytes::from(data)).unwrap();
    records.into_iter().collect()
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_deadline_survives_restart_with_trusted_clock() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (store, _) = open(&temp_dir, clock(true));
        store
            .add(persisted("app1", 0, 1).with_deadline(ScheduleTime::WallClock(T + 1000)))
            .unwrap();
        store.flush().unwrap();
    }

    let (store, outcome) = open(&temp_dir, clock(true));
    match outcome {
        LoadOutcome::Loaded(report) => {
            assert_eq!(report.loaded, 1);
            assert_eq!(report.skipped, 0);
            assert_eq!(report.rescheduled, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let job = store.get(&JobKey::new("app1", 0, 1)).unwrap();
    assert_eq!(job.deadline, Some(ScheduleTime::WallClock(T + 1000)));
    assert!(job.persisted);
    assert!(!store.is_dirty());
}

#[test]
fn test_full_record_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let constraints = ConstraintSet {
        network: NetworkType::Unmetered,
        requires_charging: true,
        ..Default::default()
    };
    let record = persisted("com.example.sync", 10, -7)
        .with_namespace("uploads")
        .with_tag("nightly-upload")
        .with_constraints(constraints.to_blob().unwrap())
        .with_earliest_run(ScheduleTime::ElapsedBoot(BOOT + 500))
        .with_deadline(ScheduleTime::WallClock(T + 3_600_000));
    let key = record.key.clone();
    {
        let (store, _) = open(&temp_dir, clock(true));
        store.add(record.clone()).unwrap();
        store.flush().unwrap();
    }

    let (store, _) = open(&temp_dir, clock(true));
    let loaded = store.get(&key).unwrap();
    assert_eq!(loaded.tag.as_deref(), Some("nightly-upload"));
    assert_eq!(ConstraintSet::from_blob(&loaded.constraints).unwrap(), constraints);
    // Elapsed times are rebased onto the wall clock through the write-time mapping.
    assert_eq!(loaded.earliest_run, Some(ScheduleTime::WallClock(T + 500)));
    assert_eq!(loaded.deadline, record.deadline);
}

#[test]
fn test_churn_then_flush_matches_surviving_set() {
    let temp_dir = TempDir::new().unwrap();
    let (store, _) = open(&temp_dir, clock(true));

    for id in 0..500 {
        store.add(persisted("app", id as u32 % 4, id)).unwrap();
    }
    let removed = (0..500).filter(|id| id % 3 == 0).count();
    for id in (0..500).filter(|id| id % 3 == 0) {
        assert!(store.remove(&JobKey::new("app", id as u32 % 4, id)).is_some());
    }
    for n in 0..removed as i32 {
        store.add(persisted("app", 0, 10_000 + n)).unwrap();
    }
    assert_eq!(store.len(), 500);

    assert_eq!(
        store.flush().unwrap(),
        FlushOutcome::Written { records: 500, files: 1 }
    );
    assert_eq!(decode_file(&temp_dir), store.persisted_set());
}

#[test]
fn test_mutation_order_does_not_change_file() {
    let forward_dir = TempDir::new().unwrap();
    let backward_dir = TempDir::new().unwrap();
    let (forward, _) = open(&forward_dir, clock(true));
    let (backward, _) = open(&backward_dir, clock(true));

    for id in 0..50 {
        forward.add(persisted("app", 0, id)).unwrap();
        forward.add(JobRecord::new("scratch", 0, id)).unwrap();
    }
    for id in (0..50).filter(|id| id % 5 == 0) {
        forward.remove(&JobKey::new("app", 0, id));
    }

    for id in (0..50).rev().filter(|id| id % 5 != 0) {
        backward.add(persisted("app", 0, id)).unwrap();
    }
    backward.add(persisted("app", 0, 999)).unwrap();
    backward.remove(&JobKey::new("app", 0, 999));

    forward.flush().unwrap();
    backward.flush().unwrap();

    let forward_bytes = fs::read(forward_dir.path().join("jobs.bin")).unwrap();
    let backward_bytes = fs::read(backward_dir.path().join("jobs.bin")).unwrap();
    assert_eq!(forward_bytes, backward_bytes);
    assert_eq!(decode_file(&forward_dir), forward.persisted_set());
    assert_eq!(decode_file(&forward_dir).len(), 40);
}

#[test]
fn test_unknown_version_discards_file() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (store, _) = open(&temp_dir, clock(true));
        store.add(persisted("app", 0, 1)).unwrap();
        store.flush().unwrap();
    }

    let path = temp_dir.path().join("jobs.bin");
    let mut data = fs::read(&path).unwrap();
    data[4..6].copy_from_slice(&2u16.to_be_bytes());
    fs::write(&path, data).unwrap();

    let (store, outcome) = open(&temp_dir, clock(true));
    assert!(matches!(
        outcome,
        LoadOutcome::Discarded(JobStoreError::Format(_))
    ));
    assert!(store.is_empty());

    // The next write replaces the unreadable file.
    store.add(persisted("app", 0, 2)).unwrap();
    store.flush().unwrap();
    let (reopened, outcome) = open(&temp_dir, clock(true));
    assert!(matches!(outcome, LoadOutcome::Loaded(_)));
    assert!(reopened.contains(&JobKey::new("app", 0, 2)));
}

#[test]
fn test_per_user_layout_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::with_storage_dir(temp_dir.path()).with_layout(FileLayout::PerUser);
    {
        let (store, _) = JobStore::open(config.clone(), clock(true)).unwrap();
        for user in [0, 10, 11] {
            store.add(persisted("app", user, 1)).unwrap();
        }
        store.flush().unwrap();
    }

    let (store, outcome) = JobStore::open(config, clock(true)).unwrap();
    assert!(matches!(outcome, LoadOutcome::Loaded(ref r) if r.files == 3 && r.loaded == 3));
    assert!(!store.is_dirty());
    assert_eq!(store.get_by_user(11).len(), 1);
}

// ============================================================================
// Clock reconciliation on reload
// ============================================================================

#[test]
fn test_reload_with_untrusted_clock_keeps_relative_deadline() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (store, _) = open(&temp_dir, clock(true));
        store
            .add(persisted("app", 0, 1).with_deadline(ScheduleTime::WallClock(T + 5_000)))
            .unwrap();
        store.flush().unwrap();
    }

    // After reboot the wall clock is not yet trusted.
    let (store, _) = open(&temp_dir, clock(false));
    let job = store.get(&JobKey::new("app", 0, 1)).unwrap();
    assert_eq!(job.deadline, Some(ScheduleTime::ElapsedBoot(BOOT + 5_000)));
}

#[test]
fn test_untrusted_write_trusted_reload_runs_immediately() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (store, _) = open(&temp_dir, clock(false));
        store
            .add(
                persisted("app", 0, 1)
                    .with_earliest_run(ScheduleTime::ElapsedBoot(BOOT + 1_000))
                    .with_deadline(ScheduleTime::WallClock(T + 5_000)),
            )
            .unwrap();
        store
            .add(persisted("app", 0, 2).with_deadline(ScheduleTime::ElapsedBoot(BOOT + 9_000)))
            .unwrap();
        store.flush().unwrap();
    }

    let (store, outcome) = open(&temp_dir, clock(true));
    match outcome {
        LoadOutcome::Loaded(report) => assert_eq!(report.rescheduled, 1),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let first = store.get(&JobKey::new("app", 0, 1)).unwrap();
    assert_eq!(first.deadline, Some(ScheduleTime::IMMEDIATE));
    assert_eq!(first.earliest_run, Some(ScheduleTime::IMMEDIATE));

    let second = store.get(&JobKey::new("app", 0, 2)).unwrap();
    assert_eq!(second.deadline, Some(ScheduleTime::ElapsedBoot(BOOT + 9_000)));
}

#[test]
fn test_read_from_disk_does_not_touch_store() {
    let temp_dir = TempDir::new().unwrap();
    let (store, _) = open(&temp_dir, clock(true));
    store
        .add(persisted("app", 0, 1).with_deadline(ScheduleTime::WallClock(T + 5_000)))
        .unwrap();
    store.flush().unwrap();
    store.add(persisted("app", 0, 2)).unwrap();

    let (set, report) = store.read_from_disk(false).unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(
        set.get(&JobKey::new("app", 0, 1)).unwrap().deadline,
        Some(ScheduleTime::ElapsedBoot(BOOT + 5_000))
    );
    assert_eq!(store.len(), 2);
    assert!(store.is_dirty());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_adds_while_flushing() {
    let temp_dir = TempDir::new().unwrap();
    let (store, _) = open(&temp_dir, clock(true));

    std::thread::scope(|scope| {
        for user in 0..4u32 {
            let store = &store;
            scope.spawn(move || {
                for id in 0..250 {
                    store.add(persisted("app", user, id)).unwrap();
                    if id % 50 == 0 {
                        let _ = store.query(|r| r.key.job_id % 7 == 0).count();
                    }
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..20 {
                store.flush().unwrap();
            }
        });
    });

    store.flush().unwrap();
    assert_eq!(store.len(), 1000);
    assert!(!store.is_dirty());

    let on_disk = decode_file(&temp_dir);
    assert_eq!(on_disk, store.persisted_set());
    let users: HashSet<u32> = on_disk.iter().map(|r| r.key.user_id).collect();
    assert_eq!(users.len(), 4);
}

#[test]
fn test_parallel_flushes_with_per_user_files() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::with_storage_dir(temp_dir.path()).with_layout(FileLayout::PerUser);
    let (store, _) = JobStore::open(config, clock(true)).unwrap();

    std::thread::scope(|scope| {
        for user in 0..4u32 {
            let store = &store;
            scope.spawn(move || {
                for round in 0..5 {
                    for id in 0..40 {
                        store.add(persisted("app", user, id)).unwrap();
                    }
                    // Drop the user entirely on some rounds so its file goes stale.
                    if (round + user) % 2 == 0 {
                        store.remove_by_user(user);
                    } else {
                        store.remove(&JobKey::new("app", user, round as i32));
                    }
                }
            });
        }
        for _ in 0..3 {
            let store = &store;
            scope.spawn(move || {
                for _ in 0..15 {
                    store.flush().unwrap();
                }
            });
        }
    });

    store.flush().unwrap();
    assert!(!store.is_dirty());

    let (on_disk, report) = store.read_from_disk(true).unwrap();
    assert_eq!(report.skipped, 0);
    assert_eq!(on_disk, store.persisted_set());

    let users: HashSet<u32> = on_disk.iter().map(|r| r.key.user_id).collect();
    for user in 0..4u32 {
        let file = temp_dir.path().join(format!("jobs.u{}.bin", user));
        assert_eq!(file.exists(), users.contains(&user));
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_open_from_toml_config() {
    let temp_dir = TempDir::new().unwrap();
    let toml = format!(
        r#"
[store]
storage_dir = "{}"
file_name = "scheduled.bin"
layout = "per_user"
write_delay_ms = 500

[logging]
level = "debug"
"#,
        temp_dir.path().display()
    );

    let config = ConfigLoader::load_str(&toml).unwrap();
    let warnings = ConfigValidator::validate(&config).unwrap().into_result().unwrap();
    assert!(warnings.is_empty());

    let (store, outcome) = JobStore::open(config.store, clock(true)).unwrap();
    assert!(matches!(outcome, LoadOutcome::Fresh));
    store.add(persisted("app", 3, 1)).unwrap();
    store.flush().unwrap();
    assert!(temp_dir.path().join("scheduled.u3.bin").exists());
}
