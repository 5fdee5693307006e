// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One reconciliation cycle: discover, diff, classify, orphan, schedule.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use drover_core::{Clock, MachineStatus};
use drover_engine::PlaybookRunner;

use crate::lifecycle::Daemon;
use crate::notifications;

impl<R: PlaybookRunner, C: Clock> Daemon<R, C> {
    /// Run one full cycle against the current fleet view.
    ///
    /// A discovery failure skips the whole cycle, since acting on a partial
    /// fleet view would orphan machines that are merely unreachable to one
    /// source. Store failures propagate and stop the daemon: silent state
    /// divergence is worse than stopping.
    pub async fn run_cycle(&self) -> Result<(), drover_store::StoreError> {
        let detected = match self.detectors.detect_all().await {
            Ok(detected) => detected,
            Err(e) => {
                warn!(error = %e, "discovery failed, skipping cycle");
                return Ok(());
            }
        };
        debug!(count = detected.len(), "discovery complete");

        self.diff_and_classify(&detected)?;

        // Fresh work first, then retries of previously failed machines
        let pending = self.store.list(Some(MachineStatus::Pending));
        if !pending.is_empty() {
            info!(count = pending.len(), "scheduling pending machines");
            self.executor.provision(pending);
        }

        let max_retries = self.config.daemon.max_retries;
        let retryable: Vec<_> = self
            .store
            .list(Some(MachineStatus::Failed))
            .into_iter()
            .filter(|m| !m.jobs.is_empty() && !m.retry_budget_exhausted(max_retries))
            .collect();
        if !retryable.is_empty() {
            info!(count = retryable.len(), "retrying failed machines");
            self.executor.provision(retryable);
        }

        notifications::dispatch(&self.store, &self.notifiers, self.config.notify.log_tail_lines)
            .await;
        Ok(())
    }

    fn diff_and_classify(
        &self,
        detected: &[drover_core::DiscoveredMachine],
    ) -> Result<(), drover_store::StoreError> {
        let known_ids: HashSet<String> =
            self.store.list(None).into_iter().map(|m| m.instance_id).collect();

        for machine in detected {
            let classification = self.rules.classify(machine);

            if !known_ids.contains(&machine.instance_id) {
                if classification.is_empty() {
                    debug!(instance_id = %machine.instance_id, "ignored: no matching rules");
                    continue;
                }
                info!(
                    instance_id = %machine.instance_id,
                    jobs = classification.jobs.len(),
                    "new machine discovered"
                );
                self.store.upsert_discovery(
                    machine,
                    classification.groups,
                    classification.jobs,
                )?;
                continue;
            }

            let record =
                self.store.upsert_discovery(machine, Vec::new(), Vec::new())?;

            // A machine that disappeared and came back re-enters the normal
            // flow with a fresh retry budget
            if record.overall_status == MachineStatus::Orphaned {
                info!(instance_id = %machine.instance_id, "orphan rediscovered");
                self.store.set_status(&machine.instance_id, MachineStatus::New)?;
            }

            if record.groups != classification.groups || record.jobs != classification.jobs {
                info!(
                    instance_id = %machine.instance_id,
                    jobs = classification.jobs.len(),
                    "classification changed"
                );
                self.store.update_classification(
                    &machine.instance_id,
                    classification.groups,
                    classification.jobs,
                )?;
            }
        }

        // Mark the vanished. Machines mid-run keep their state: the run's
        // outcome lands first and orphaning waits for a later cycle.
        let detected_ids: HashSet<&str> =
            detected.iter().map(|m| m.instance_id.as_str()).collect();
        for record in self.store.list(None) {
            if detected_ids.contains(record.instance_id.as_str()) {
                continue;
            }
            if matches!(
                record.overall_status,
                MachineStatus::Orphaned | MachineStatus::Provisioning
            ) {
                continue;
            }
            info!(instance_id = %record.instance_id, "machine orphaned");
            self.store.set_status(&record.instance_id, MachineStatus::Orphaned)?;
        }

        // Promote machines awaiting work into the pending queue
        for record in self.store.list(Some(MachineStatus::New)) {
            if record.jobs.is_empty() {
                self.store.set_status(&record.instance_id, MachineStatus::Skipped)?;
            } else {
                self.store.set_status(&record.instance_id, MachineStatus::Pending)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
