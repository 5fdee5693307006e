// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

use drover_adapters::{FakeDetector, FakeNotifier};
use drover_core::{DiscoveredMachine, FakeClock, JobStatus, MachineStatus, Rule};
use drover_engine::FakeRunner;

fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.daemon.state_file = dir.path().join("state.json");
    config.daemon.log_dir = dir.path().join("logs");
    config.daemon.interval_secs = 0;
    config
}

fn assemble_with(
    config: Config,
    detector: &FakeDetector,
    notifier: &FakeNotifier,
    runner: &FakeRunner,
) -> Daemon<FakeRunner, FakeClock> {
    Daemon::assemble(
        config,
        FakeClock::new(),
        runner.clone(),
        DetectorSet::new(vec![Box::new(detector.clone())]),
        NotifierSet::new(vec![Box::new(notifier.clone())]),
    )
    .unwrap()
}

#[tokio::test]
async fn startup_fails_machines_left_provisioning_by_a_crash() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    {
        let store = StateStore::open(&config.daemon.state_file, FakeClock::new()).unwrap();
        store
            .upsert_discovery(
                &DiscoveredMachine::new("i-1", "10.0.0.1", "static"),
                vec![],
                vec!["deploy.yml".into()],
            )
            .unwrap();
        store.begin_job("i-1", "deploy", Path::new("deploy.yml")).unwrap();
        // Crash: the store is dropped with the machine still provisioning
    }

    let daemon =
        assemble_with(config, &FakeDetector::new("fake"), &FakeNotifier::new(), &FakeRunner::new());

    let record = daemon.store.get("i-1").unwrap();
    assert_eq!(record.overall_status, MachineStatus::Failed);
    assert!(record.current_job.is_none());
    assert_eq!(record.job_results["deploy"].status, JobStatus::Failed);
}

#[tokio::test]
async fn run_once_mode_runs_one_cycle_and_drains() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.rules = vec![Rule {
        name: "web".to_string(),
        match_tags: BTreeMap::from([("role".to_string(), "web".to_string())]),
        playbook: "deploy.yml".into(),
        group: None,
    }];
    let detector = FakeDetector::new("fake");
    detector.set_machines(vec![
        DiscoveredMachine::new("m1", "10.0.0.5", "fake").with_tag("role", "web")
    ]);
    let daemon = assemble_with(config, &detector, &FakeNotifier::new(), &FakeRunner::new());
    let store = daemon.store();

    daemon.run(CancellationToken::new()).await.unwrap();

    // The cycle ran and the executor drained before exit
    assert_eq!(store.get("m1").unwrap().overall_status, MachineStatus::Provisioned);
}

#[tokio::test]
async fn second_daemon_on_the_same_state_file_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let first = DaemonRuntime::start(config.clone(), dir.path()).unwrap();
    let second = DaemonRuntime::start(config, dir.path());

    assert!(matches!(second, Err(LifecycleError::LockFailed { .. })));
    drop(first);
}

#[tokio::test]
async fn lock_is_released_when_the_daemon_drops() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    drop(DaemonRuntime::start(config.clone(), dir.path()).unwrap());

    assert!(DaemonRuntime::start(config, dir.path()).is_ok());
}
