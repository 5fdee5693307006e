// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: startup, crash recovery, the run loop, shutdown.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_adapters::{
    build_detectors, build_notifiers, DetectError, DetectorSet, NotifierSet, NotifyError,
};
use drover_core::{Clock, Config, ConfigError, RuleSet, SystemClock};
use drover_engine::{AnsibleRunner, ExecutorConfig, PlaybookRunner, ProvisionExecutor};
use drover_store::{StateStore, StoreError};

use crate::management::Management;

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("detector error: {0}")]
    Detect(#[from] DetectError),
    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),
    #[error("failed to acquire lock {path}: daemon already running?")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The daemon with its production adapter types
pub type DaemonRuntime = Daemon<AnsibleRunner, SystemClock>;

/// The assembled reconciliation daemon.
pub struct Daemon<R: PlaybookRunner, C: Clock> {
    pub(crate) config: Config,
    pub(crate) store: Arc<StateStore<C>>,
    pub(crate) rules: RuleSet,
    pub(crate) detectors: DetectorSet,
    pub(crate) notifiers: NotifierSet,
    pub(crate) executor: ProvisionExecutor<R, C>,
    // NOTE(lifetime): held to maintain the exclusive PID lock; released on drop
    #[allow(dead_code)]
    lock_file: Option<File>,
}

impl DaemonRuntime {
    /// Full production startup: PID lock, store recovery, registries from
    /// config, executor against the real configuration tool.
    pub fn start(config: Config, config_dir: &std::path::Path) -> Result<Self, LifecycleError> {
        let lock_file = acquire_lock(&config.daemon.state_file)?;
        let runner = AnsibleRunner::new(config.daemon.ansible_playbook_bin.clone());
        let detectors = build_detectors(config_dir, &config.detectors)?;
        let notifiers = build_notifiers(&config.notifiers)?;
        let mut daemon = Self::assemble(config, SystemClock, runner, detectors, notifiers)?;
        daemon.lock_file = Some(lock_file);
        Ok(daemon)
    }
}

impl<R: PlaybookRunner, C: Clock> Daemon<R, C> {
    /// Assemble a daemon from explicit parts.
    ///
    /// Opens the store and runs crash recovery: any machine left
    /// `provisioning` by a previous process is failed before the first
    /// cycle; an in-flight run cannot be trusted to resume.
    pub fn assemble(
        config: Config,
        clock: C,
        runner: R,
        detectors: DetectorSet,
        notifiers: NotifierSet,
    ) -> Result<Self, LifecycleError> {
        let store = Arc::new(StateStore::open(config.daemon.state_file.clone(), clock)?);

        let recovered = store.recover_interrupted()?;
        if !recovered.is_empty() {
            warn!(
                count = recovered.len(),
                machines = ?recovered,
                "failed machines left provisioning by a previous run"
            );
        }

        let executor = ProvisionExecutor::new(
            Arc::clone(&store),
            Arc::new(runner),
            ExecutorConfig {
                workers: config.daemon.workers,
                max_retries: config.daemon.max_retries,
                log_dir: config.daemon.log_dir.clone(),
            },
        );

        Ok(Self {
            rules: RuleSet::new(config.rules.clone()),
            store,
            detectors,
            notifiers,
            executor,
            config,
            lock_file: None,
        })
    }

    /// The management/query interface over this daemon's store.
    pub fn management(&self) -> Management<C> {
        Management::new(Arc::clone(&self.store), self.rules.clone())
    }

    /// Shared handle to the state store (read-mostly collaborators).
    pub fn store(&self) -> Arc<StateStore<C>> {
        Arc::clone(&self.store)
    }

    /// Run reconciliation cycles until cancelled.
    ///
    /// A non-positive interval runs a single cycle (dry validation). On the
    /// way out the executor drains and a final snapshot is persisted. A
    /// persistence failure stops the daemon (silent state corruption is
    /// worse than stopping) and is surfaced to the operator.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), LifecycleError> {
        info!("reconciliation loop started");
        let mut outcome = Ok(());
        loop {
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "state store failure, stopping daemon");
                outcome = Err(LifecycleError::Store(e));
                break;
            }

            if self.config.run_once() {
                info!("single-cycle mode, exiting");
                break;
            }

            let interval = Duration::from_secs(self.config.daemon.interval_secs.max(1) as u64);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    info!("shutdown requested, stopping loop");
                    break;
                }
            }
        }

        self.executor.shutdown().await;
        if let Err(e) = self.store.persist() {
            warn!(error = %e, "failed to persist final snapshot");
        }
        info!("daemon stopped");
        outcome
    }
}

/// Take the single-instance lock next to the state file and record our PID.
fn acquire_lock(state_file: &std::path::Path) -> Result<File, LifecycleError> {
    let path = state_file.with_extension("lock");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // Avoid truncating before the lock is held; the file may carry the
    // PID of a daemon that is still running.
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.try_lock_exclusive()
        .map_err(|source| LifecycleError::LockFailed { path: path.clone(), source })?;
    let mut file = file;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
