// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded-concurrency provisioning executor.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use drover_core::{Clock, JobStatus, MachineRecord, MachineStatus, SystemClock};
use drover_store::{StateStore, StoreError};

use crate::inventory::write_scoped_inventory;
use crate::runner::{PlaybookRunner, RunRequest, RunnerError};

/// Errors from a provisioning run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executor settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker pool size: machines provisioned concurrently
    pub workers: usize,
    /// Maximum re-attempts per job before the machine fails permanently
    pub max_retries: u32,
    /// Root of the per-machine, per-job log artifacts
    pub log_dir: PathBuf,
}

/// Runs every pending job for a set of machines.
///
/// Dispatch is fire-and-forget: `provision` marks each machine and returns
/// immediately; a fixed-size worker pool works through the runs, one
/// machine per worker, jobs strictly in order within a machine.
pub struct ProvisionExecutor<R: PlaybookRunner, C: Clock = SystemClock> {
    store: Arc<StateStore<C>>,
    runner: Arc<R>,
    config: Arc<ExecutorConfig>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl<R: PlaybookRunner, C: Clock> ProvisionExecutor<R, C> {
    pub fn new(store: Arc<StateStore<C>>, runner: Arc<R>, config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self { store, runner, config: Arc::new(config), permits, tracker: TaskTracker::new() }
    }

    /// Dispatch provisioning runs for the given machines and return.
    ///
    /// Machines already provisioning are skipped; re-submission is a no-op,
    /// so a slow run never gets a concurrent twin. Machines with no jobs are
    /// skipped outright: zero eligible work never enters provisioning.
    pub fn provision(&self, machines: Vec<MachineRecord>) {
        for machine in machines {
            let id = machine.instance_id.clone();
            let Some(current) = self.store.get(&id) else {
                continue;
            };
            if current.overall_status == MachineStatus::Provisioning {
                tracing::debug!(instance_id = %id, "already provisioning, skipping");
                continue;
            }
            if machine.jobs.is_empty() {
                tracing::debug!(instance_id = %id, "no jobs resolved, skipping");
                continue;
            }
            if let Err(e) = self.store.mark_provisioning(&id) {
                tracing::error!(instance_id = %id, error = %e, "failed to mark provisioning");
                continue;
            }

            let store = Arc::clone(&self.store);
            let runner = Arc::clone(&self.runner);
            let config = Arc::clone(&self.config);
            let permits = Arc::clone(&self.permits);
            self.tracker.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                // A fault in one machine's run must not take down the pool;
                // the machine is left as-is and recovered at next startup.
                if let Err(e) = run_machine(store, runner, config, &machine).await {
                    tracing::error!(
                        instance_id = %machine.instance_id,
                        error = %e,
                        "provisioning run aborted"
                    );
                }
            });
        }
    }

    /// Stop accepting work and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// One machine's full run: every job in order, on one worker.
async fn run_machine<R: PlaybookRunner, C: Clock>(
    store: Arc<StateStore<C>>,
    runner: Arc<R>,
    config: Arc<ExecutorConfig>,
    machine: &MachineRecord,
) -> Result<(), EngineError> {
    let id = &machine.instance_id;
    let machine_log_dir = config.log_dir.join(id);
    std::fs::create_dir_all(&machine_log_dir)?;

    for playbook in &machine.jobs {
        let name = job_name(playbook);
        let result = store.begin_job(id, &name, playbook)?;

        if result.retry_count > config.max_retries {
            let error = format!(
                "retry budget exhausted after {} attempts (max_retries = {})",
                result.retry_count, config.max_retries
            );
            tracing::error!(instance_id = %id, job = %name, "{error}");
            store.finish_job(id, &name, JobStatus::Failed, Some(error), None)?;
            return Ok(());
        }

        tracing::info!(instance_id = %id, job = %name, retry = result.retry_count, "running job");
        let log_file = machine_log_dir.join(format!("{name}.log"));

        let inventory = match write_scoped_inventory(machine) {
            Ok(path) => path,
            Err(e) => {
                let error = format!("failed to write scoped inventory: {e}");
                store.finish_job(id, &name, JobStatus::Failed, Some(error), None)?;
                return Ok(());
            }
        };

        let request = RunRequest {
            playbook: playbook.clone(),
            inventory: inventory.to_path_buf(),
            log_file: log_file.clone(),
        };
        let outcome = runner.run(&request).await;
        drop(inventory); // scope released whatever the outcome

        match outcome {
            Ok(outcome) if outcome.succeeded() => {
                store.finish_job(id, &name, JobStatus::Success, None, Some(log_file))?;
            }
            Ok(outcome) => {
                let error = if outcome.no_hosts_matched {
                    format!("{name}: tool matched zero hosts (exit {})", outcome.exit_code)
                } else {
                    format!("{name}: failed with exit code {}", outcome.exit_code)
                };
                tracing::warn!(instance_id = %id, job = %name, "{error}");
                store.finish_job(id, &name, JobStatus::Failed, Some(error), Some(log_file))?;
                return Ok(());
            }
            Err(e) => {
                let error = format!("{name}: {e}");
                tracing::warn!(instance_id = %id, job = %name, "{error}");
                store.finish_job(id, &name, JobStatus::Failed, Some(error), Some(log_file))?;
                return Ok(());
            }
        }
    }

    store.set_status(id, MachineStatus::Provisioned)?;
    tracing::info!(instance_id = %id, "machine provisioned");
    Ok(())
}

/// Job results are keyed by the playbook's file stem.
fn job_name(playbook: &std::path::Path) -> String {
    playbook
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| playbook.display().to_string())
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
