// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use drover_core::FakeClock;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn new_store(dir: &TempDir) -> StateStore<FakeClock> {
    StateStore::open(dir.path().join("state.json"), FakeClock::new()).unwrap()
}

fn discovered(id: &str) -> DiscoveredMachine {
    DiscoveredMachine::new(id, "10.0.0.1", "static").with_tag("role", "web")
}

fn jobs(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(|n| PathBuf::from(*n)).collect()
}

// ── Discovery upserts ────────────────────────────────────────────────────────

#[test]
fn upsert_creates_new_record_with_work() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let record = store
        .upsert_discovery(&discovered("i-1"), vec!["web".into()], jobs(&["deploy.yml"]))
        .unwrap();

    assert_eq!(record.overall_status, MachineStatus::New);
    assert_eq!(record.jobs, jobs(&["deploy.yml"]));
    assert_eq!(record.tags["role"], "web");
}

#[test]
fn upsert_creates_skipped_record_without_work() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let record = store.upsert_discovery(&discovered("i-1"), vec![], vec![]).unwrap();

    assert_eq!(record.overall_status, MachineStatus::Skipped);
}

#[test]
fn upsert_refreshes_known_machine_timestamps() {
    let dir = TempDir::new().unwrap();
    let clock = FakeClock::new();
    let store = StateStore::open(dir.path().join("state.json"), clock.clone()).unwrap();
    let first =
        store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();

    clock.advance(Duration::from_secs(60));
    let second =
        store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();

    assert_eq!(second.last_seen_at - first.last_seen_at, chrono::Duration::seconds(60));
    // Refresh does not clobber run state or classification
    assert_eq!(second.overall_status, MachineStatus::New);
}

// ── Classification ───────────────────────────────────────────────────────────

#[test]
fn update_classification_overwrites_groups_and_jobs() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec!["web".into()], jobs(&["a.yml"])).unwrap();

    let record = store
        .update_classification("i-1", vec!["web".into(), "db".into()], jobs(&["a.yml", "b.yml"]))
        .unwrap();

    assert_eq!(record.groups, vec!["web".to_string(), "db".to_string()]);
    assert_eq!(record.jobs, jobs(&["a.yml", "b.yml"]));
}

#[test]
fn update_classification_unknown_machine_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let err = store.update_classification("ghost", vec![], vec![]).unwrap_err();

    assert!(matches!(err, StoreError::NotFound(_)));
}

// ── Job lifecycle ────────────────────────────────────────────────────────────

#[test]
fn begin_job_marks_machine_provisioning() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();

    let result = store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();

    assert_eq!(result.retry_count, 0);
    let record = store.get("i-1").unwrap();
    assert_eq!(record.overall_status, MachineStatus::Provisioning);
    assert_eq!(record.current_job.as_deref(), Some("deploy"));
}

#[test]
fn finish_job_failure_fails_machine_and_clears_current_job() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();
    store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();

    store
        .finish_job("i-1", "deploy", JobStatus::Failed, Some("exit 1".into()), None)
        .unwrap();

    let record = store.get("i-1").unwrap();
    assert!(record.current_job.is_none());
    assert_eq!(record.overall_status, MachineStatus::Failed);
}

#[test]
fn finish_job_unknown_job_is_error() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();

    let err = store.finish_job("i-1", "ghost", JobStatus::Success, None, None).unwrap_err();

    assert!(matches!(err, StoreError::UnknownJob { .. }));
}

#[test]
fn retry_count_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    {
        let store = StateStore::open(&path, FakeClock::new()).unwrap();
        store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();
        for _ in 0..3 {
            store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();
            store
                .finish_job("i-1", "deploy", JobStatus::Failed, Some("boom".into()), None)
                .unwrap();
        }
    }

    let reopened = StateStore::open(&path, FakeClock::new()).unwrap();

    assert_eq!(reopened.get("i-1").unwrap().job_results["deploy"].retry_count, 2);
}

#[test]
fn set_status_new_resets_retry_counts() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();
    store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();
    store.finish_job("i-1", "deploy", JobStatus::Failed, None, None).unwrap();
    store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();
    store.finish_job("i-1", "deploy", JobStatus::Failed, None, None).unwrap();

    store.set_status("i-1", MachineStatus::New).unwrap();

    assert_eq!(store.get("i-1").unwrap().job_results["deploy"].retry_count, 0);
}

// ── Listing and deletion ─────────────────────────────────────────────────────

#[test]
fn list_filters_by_status() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["a.yml"])).unwrap();
    store.upsert_discovery(&discovered("i-2"), vec![], vec![]).unwrap();

    assert_eq!(store.list(None).len(), 2);
    assert_eq!(store.list(Some(MachineStatus::New)).len(), 1);
    assert_eq!(store.list(Some(MachineStatus::Skipped)).len(), 1);
    assert_eq!(store.list(Some(MachineStatus::Failed)).len(), 0);
}

#[test]
fn delete_removes_machine_and_reports_absence() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["a.yml"])).unwrap();

    assert!(store.delete("i-1").unwrap());
    assert!(store.get("i-1").is_none());
    assert!(!store.delete("i-1").unwrap());
}

#[test]
fn stats_counts_by_status() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["a.yml"])).unwrap();
    store.upsert_discovery(&discovered("i-2"), vec![], jobs(&["a.yml"])).unwrap();
    store.upsert_discovery(&discovered("i-3"), vec![], vec![]).unwrap();

    let stats = store.stats();

    assert_eq!(stats["new"], 2);
    assert_eq!(stats["skipped"], 1);
    assert_eq!(stats["total"], 3);
}

// ── Crash recovery ───────────────────────────────────────────────────────────

#[test]
fn recover_interrupted_fails_provisioning_machines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    {
        let store = StateStore::open(&path, FakeClock::new()).unwrap();
        store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();
        store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();
        // Simulated crash: no finish_job, store dropped mid-run
    }

    let store = StateStore::open(&path, FakeClock::new()).unwrap();
    let recovered = store.recover_interrupted().unwrap();

    assert_eq!(recovered, vec!["i-1".to_string()]);
    let record = store.get("i-1").unwrap();
    assert_eq!(record.overall_status, MachineStatus::Failed);
    assert!(record.current_job.is_none());
    let result = &record.job_results["deploy"];
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("interrupted by daemon restart"));
}

#[test]
fn recover_interrupted_leaves_settled_machines_alone() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();

    let recovered = store.recover_interrupted().unwrap();

    assert!(recovered.is_empty());
    assert_eq!(store.get("i-1").unwrap().overall_status, MachineStatus::New);
}

// ── Atomic persistence ───────────────────────────────────────────────────────

#[test]
fn failed_save_leaves_previous_document_intact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let store = StateStore::open(&path, FakeClock::new()).unwrap();
    store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();
    let good_bytes = fs::read(&path).unwrap();

    // Inject a staging-write failure: occupy the staging path with a directory
    fs::create_dir(crate::persist::staging_path(&path)).unwrap();
    let err = store.upsert_discovery(&discovered("i-2"), vec![], jobs(&["deploy.yml"]));

    assert!(err.is_err());
    assert_eq!(fs::read(&path).unwrap(), good_bytes);
}

#[test]
fn reopened_store_rejects_unknown_status() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    fs::write(
        &path,
        r#"{"i-1": {
            "instance_id": "i-1",
            "ip_address": "10.0.0.1",
            "discoverer": "static",
            "overall_status": "retrying",
            "detected_at": "2026-01-01T00:00:00Z",
            "last_seen_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }}"#,
    )
    .unwrap();

    let err = StateStore::open(&path, FakeClock::new());

    assert!(matches!(err, Err(StoreError::Json(_))));
}

// ── Retry-count monotonicity ─────────────────────────────────────────────────

mod properties {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Attempt(bool), // begin + finish; true = success
        Reset,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<bool>().prop_map(Op::Attempt),
            1 => Just(Op::Reset),
        ]
    }

    proptest! {
        #[test]
        fn retry_count_never_decreases_except_on_reset(ops in proptest::collection::vec(op_strategy(), 1..24)) {
            let dir = TempDir::new().unwrap();
            let store = new_store(&dir);
            store.upsert_discovery(&discovered("i-1"), vec![], jobs(&["deploy.yml"])).unwrap();

            let mut last = 0u32;
            for op in ops {
                match op {
                    Op::Attempt(success) => {
                        let result = store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();
                        prop_assert!(result.retry_count >= last);
                        last = result.retry_count;
                        let status = if success { JobStatus::Success } else { JobStatus::Failed };
                        store.finish_job("i-1", "deploy", status, None, None).unwrap();
                    }
                    Op::Reset => {
                        store.set_status("i-1", MachineStatus::New).unwrap();
                        prop_assert_eq!(store.get("i-1").unwrap().job_results["deploy"].retry_count, 0);
                        last = 0;
                    }
                }
            }
        }
    }
}
