// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeMap;
use std::path::PathBuf;

use tempfile::TempDir;

use drover_adapters::{DetectorSet, FakeDetector, FakeNotifier, NotifierSet};
use drover_core::{
    Config, DiscoveredMachine, FakeClock, JobStatus, MachineStatus, Rule,
};
use drover_engine::FakeRunner;

use crate::lifecycle::Daemon;

struct Harness {
    _dir: TempDir,
    detector: FakeDetector,
    notifier: FakeNotifier,
    runner: FakeRunner,
    daemon: Daemon<FakeRunner, FakeClock>,
}

fn rule(name: &str, tag: (&str, &str), playbook: &str) -> Rule {
    Rule {
        name: name.to_string(),
        match_tags: BTreeMap::from([(tag.0.to_string(), tag.1.to_string())]),
        playbook: PathBuf::from(playbook),
        group: None,
    }
}

fn harness(rules: Vec<Rule>, max_retries: u32) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.state_file = dir.path().join("state.json");
    config.daemon.log_dir = dir.path().join("logs");
    config.daemon.max_retries = max_retries;
    config.rules = rules;

    let detector = FakeDetector::new("fake");
    let notifier = FakeNotifier::new();
    let runner = FakeRunner::new();
    let daemon = Daemon::assemble(
        config,
        FakeClock::new(),
        runner.clone(),
        DetectorSet::new(vec![Box::new(detector.clone())]),
        NotifierSet::new(vec![Box::new(notifier.clone())]),
    )
    .unwrap();

    Harness { _dir: dir, detector, notifier, runner, daemon }
}

fn web_machine(id: &str) -> DiscoveredMachine {
    DiscoveredMachine::new(id, "10.0.0.5", "fake").with_tag("role", "web")
}

/// One cycle plus executor drain, so run outcomes are settled before asserts.
async fn cycle(h: &Harness) {
    h.daemon.run_cycle().await.unwrap();
    h.daemon.executor.shutdown().await;
}

#[tokio::test]
async fn discovered_machine_is_classified_and_provisioned() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 2);
    h.detector.set_machines(vec![web_machine("m1")]);

    cycle(&h).await;

    let record = h.daemon.store.get("m1").unwrap();
    assert_eq!(record.jobs, vec![PathBuf::from("deploy.yml")]);
    assert_eq!(record.groups, vec!["web".to_string()]);
    assert_eq!(record.overall_status, MachineStatus::Provisioned);
    assert_eq!(record.job_results["deploy"].status, JobStatus::Success);
    assert_eq!(h.runner.calls().len(), 1);
}

#[tokio::test]
async fn machine_matching_no_rule_is_not_recorded() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 2);
    h.detector
        .set_machines(vec![DiscoveredMachine::new("m1", "10.0.0.5", "fake").with_tag("role", "db")]);

    cycle(&h).await;

    assert!(h.daemon.store.get("m1").is_none());
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn changed_tags_update_classification_without_resurrecting_run_state() {
    let h = harness(
        vec![
            rule("web", ("role", "web"), "deploy.yml"),
            rule("db", ("role", "db"), "database.yml"),
        ],
        2,
    );
    h.detector.set_machines(vec![web_machine("m1")]);
    cycle(&h).await;
    assert_eq!(h.daemon.store.get("m1").unwrap().overall_status, MachineStatus::Provisioned);

    h.detector
        .set_machines(vec![DiscoveredMachine::new("m1", "10.0.0.5", "fake").with_tag("role", "db")]);
    cycle(&h).await;

    let record = h.daemon.store.get("m1").unwrap();
    assert_eq!(record.jobs, vec![PathBuf::from("database.yml")]);
    assert_eq!(record.groups, vec!["db".to_string()]);
    // Terminal status survives a classification change
    assert_eq!(record.overall_status, MachineStatus::Provisioned);
}

#[tokio::test]
async fn orphan_round_trip() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 2);
    h.detector.set_machines(vec![web_machine("m1")]);
    cycle(&h).await;

    // Vanishes from discovery: orphaned, not deleted
    h.detector.set_machines(vec![]);
    cycle(&h).await;
    assert_eq!(h.daemon.store.get("m1").unwrap().overall_status, MachineStatus::Orphaned);

    // Reappears: back through the normal path, ending provisioned again
    h.detector.set_machines(vec![web_machine("m1")]);
    cycle(&h).await;
    let record = h.daemon.store.get("m1").unwrap();
    assert_ne!(record.overall_status, MachineStatus::Orphaned);
    assert_eq!(record.overall_status, MachineStatus::Provisioned);
}

#[tokio::test]
async fn discovery_failure_skips_the_cycle() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 2);
    h.detector.set_machines(vec![web_machine("m1")]);
    cycle(&h).await;

    h.detector.set_failure("cloud api unreachable");
    cycle(&h).await;

    // Nothing was orphaned: the cycle was skipped wholesale
    assert_eq!(h.daemon.store.get("m1").unwrap().overall_status, MachineStatus::Provisioned);
}

#[tokio::test]
async fn failed_machines_retry_until_the_budget_is_spent() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 1);
    h.detector.set_machines(vec![web_machine("m1")]);

    // Attempt 1 fails
    h.runner.push_outcome(1, false);
    cycle(&h).await;
    assert_eq!(h.daemon.store.get("m1").unwrap().overall_status, MachineStatus::Failed);

    // Retry sweep: attempt 2 fails, burning the last retry
    h.runner.push_outcome(1, false);
    cycle(&h).await;
    assert_eq!(h.runner.calls().len(), 2);

    // Budget exhausted: no further attempt is scheduled
    cycle(&h).await;
    assert_eq!(h.runner.calls().len(), 2);
    let record = h.daemon.store.get("m1").unwrap();
    assert_eq!(record.overall_status, MachineStatus::Failed);
    assert_eq!(record.job_results["deploy"].retry_count, 1);
}

#[tokio::test]
async fn manual_reset_reopens_the_retry_budget() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 1);
    h.detector.set_machines(vec![web_machine("m1")]);
    h.runner.push_outcome(1, false);
    h.runner.push_outcome(1, false);
    cycle(&h).await;
    cycle(&h).await;
    cycle(&h).await;
    assert_eq!(h.runner.calls().len(), 2, "budget spent after the second attempt");

    h.daemon.store.set_status("m1", MachineStatus::New).unwrap();
    cycle(&h).await;

    let record = h.daemon.store.get("m1").unwrap();
    assert_eq!(record.overall_status, MachineStatus::Provisioned);
    // Re-baselined to zero, then the successful re-run counted as retry 1
    assert_eq!(record.job_results["deploy"].retry_count, 1);
}

#[tokio::test]
async fn terminal_failure_notifies_exactly_once() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 0);
    h.detector.set_machines(vec![web_machine("m1")]);
    h.runner.push_outcome(2, false);
    cycle(&h).await;

    // The failure landed after this cycle's dispatch; the next cycle notifies
    cycle(&h).await;
    cycle(&h).await;

    let calls = h.notifier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].title, "m1 failed");
    assert!(calls[0].message.contains("deploy"));
    assert!(h.daemon.store.get("m1").unwrap().notified);
}

#[tokio::test]
async fn provisioned_machine_notifies_with_a_success_message() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 2);
    h.detector.set_machines(vec![web_machine("m1")]);
    cycle(&h).await;
    cycle(&h).await;

    let calls = h.notifier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].title, "m1 provisioned");
    assert!(calls[0].message.contains("succeeded"));
}

#[tokio::test]
async fn skipped_and_orphaned_machines_do_not_notify() {
    let h = harness(vec![rule("web", ("role", "web"), "deploy.yml")], 2);
    h.detector.set_machines(vec![web_machine("m1")]);
    cycle(&h).await;
    h.detector.set_machines(vec![]);
    cycle(&h).await;
    cycle(&h).await;

    // Only the provisioned notification; orphaning is silent
    assert_eq!(h.notifier.calls().len(), 1);
}
