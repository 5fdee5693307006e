// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The single source of truth for machine records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use drover_core::{
    Clock, DiscoveredMachine, JobResult, JobStatus, MachineRecord, MachineStatus, SystemClock,
};

use crate::persist::{self, Document};

/// Errors from state store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown machine: {0}")]
    NotFound(String),
    #[error("unknown job `{job}` on machine {machine}")]
    UnknownJob { machine: String, job: String },
    #[error("state persistence failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable, thread-safe record of every known machine.
///
/// One coarse lock guards the whole read-modify-write of each operation;
/// operations are cheap and the synchronous persist dominates, so finer
/// sharding buys nothing here. Every mutating call persists the document
/// atomically before returning.
pub struct StateStore<C: Clock = SystemClock> {
    path: PathBuf,
    clock: C,
    machines: Mutex<Document>,
}

impl<C: Clock> StateStore<C> {
    /// Open the store, loading any previously persisted document.
    pub fn open(path: impl Into<PathBuf>, clock: C) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let machines = persist::load(&path)?;
        if !machines.is_empty() {
            tracing::info!(count = machines.len(), path = %path.display(), "loaded machine state");
        }
        Ok(Self { path, clock, machines: Mutex::new(machines) })
    }

    /// Path of the canonical state document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a discovery sighting.
    ///
    /// Creates a `new` record on first sight (`skipped` when the job list is
    /// empty), or refreshes the discovery timestamps and tags of a known
    /// machine. Classification changes for known machines go through
    /// [`StateStore::update_classification`] instead.
    pub fn upsert_discovery(
        &self,
        machine: &DiscoveredMachine,
        groups: Vec<String>,
        jobs: Vec<PathBuf>,
    ) -> Result<MachineRecord, StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let record = match machines.get_mut(&machine.instance_id) {
            Some(existing) => {
                existing.refresh_seen(machine.tags.clone(), now);
                existing.clone()
            }
            None => {
                let record = MachineRecord::new(
                    &machine.instance_id,
                    &machine.ip_address,
                    &machine.discoverer,
                    machine.tags.clone(),
                    groups,
                    jobs,
                    now,
                );
                machines.insert(machine.instance_id.clone(), record.clone());
                record
            }
        };
        persist::save(&self.path, &machines)?;
        Ok(record)
    }

    /// Overwrite a machine's groups and job list after the matcher produced
    /// a different classification.
    pub fn update_classification(
        &self,
        id: &str,
        groups: Vec<String>,
        jobs: Vec<PathBuf>,
    ) -> Result<MachineRecord, StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let record =
            machines.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.reclassify(groups, jobs, now);
        let snapshot = record.clone();
        persist::save(&self.path, &machines)?;
        Ok(snapshot)
    }

    /// Mark a machine provisioning ahead of dispatching its run.
    pub fn mark_provisioning(&self, id: &str) -> Result<(), StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let record =
            machines.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.set_status(MachineStatus::Provisioning, now);
        record.last_attempt_at = Some(now);
        persist::save(&self.path, &machines)?;
        Ok(())
    }

    /// Start (or re-start) the named job on a machine.
    ///
    /// On reuse the job result's retry count increments and its error
    /// clears; the machine's `current_job` is set and its status becomes
    /// `provisioning`.
    pub fn begin_job(
        &self,
        id: &str,
        name: &str,
        source_file: &Path,
    ) -> Result<JobResult, StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let record =
            machines.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let result = record.begin_job(name, source_file, now);
        persist::save(&self.path, &machines)?;
        Ok(result)
    }

    /// Finalize the named job and clear the machine's in-flight marker.
    /// A failing status also moves the machine to `failed`.
    pub fn finish_job(
        &self,
        id: &str,
        name: &str,
        status: JobStatus,
        error: Option<String>,
        log_file: Option<PathBuf>,
    ) -> Result<JobResult, StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let record =
            machines.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let result = record
            .finish_job(name, status, error, log_file, now)
            .ok_or_else(|| StoreError::UnknownJob { machine: id.to_string(), job: name.to_string() })?;
        persist::save(&self.path, &machines)?;
        Ok(result)
    }

    /// Set a machine's overall status.
    ///
    /// Setting `new` re-baselines the machine: every job result's retry
    /// count drops to zero.
    pub fn set_status(&self, id: &str, status: MachineStatus) -> Result<(), StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let record =
            machines.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.set_status(status, now);
        persist::save(&self.path, &machines)?;
        Ok(())
    }

    /// Record that a terminal-status notification went out.
    pub fn mark_notified(&self, id: &str) -> Result<(), StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let record =
            machines.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.notified = true;
        record.updated_at = now;
        persist::save(&self.path, &machines)?;
        Ok(())
    }

    /// Snapshot of all machines, optionally filtered by status.
    ///
    /// Taken under one lock acquisition, so the result reflects a single
    /// consistent point in time.
    pub fn list(&self, status: Option<MachineStatus>) -> Vec<MachineRecord> {
        let machines = self.machines.lock();
        machines
            .values()
            .filter(|m| status.map_or(true, |s| m.overall_status == s))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<MachineRecord> {
        self.machines.lock().get(id).cloned()
    }

    /// Remove a machine entirely. Returns false when it was not present.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut machines = self.machines.lock();
        if machines.remove(id).is_none() {
            return Ok(false);
        }
        persist::save(&self.path, &machines)?;
        Ok(true)
    }

    /// Crash recovery: fail every machine left `provisioning` by a previous
    /// process, finalizing its dangling running job result.
    ///
    /// An in-flight run cannot be trusted to have completed, so the machine
    /// re-enters the normal retry path instead of staying wedged.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, StoreError> {
        let mut machines = self.machines.lock();
        let now = self.clock.now_utc();
        let mut recovered = Vec::new();
        for record in machines.values_mut() {
            if record.overall_status != MachineStatus::Provisioning {
                continue;
            }
            if let Some(job) = record.current_job.clone() {
                record.finish_job(
                    &job,
                    JobStatus::Failed,
                    Some("interrupted by daemon restart".to_string()),
                    None,
                    now,
                );
            }
            record.current_job = None;
            record.set_status(MachineStatus::Failed, now);
            recovered.push(record.instance_id.clone());
        }
        if !recovered.is_empty() {
            persist::save(&self.path, &machines)?;
        }
        Ok(recovered)
    }

    /// Counts by status, plus a `total`.
    pub fn stats(&self) -> BTreeMap<String, usize> {
        let machines = self.machines.lock();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in machines.values() {
            *counts.entry(record.overall_status.to_string()).or_insert(0) += 1;
        }
        counts.insert("total".to_string(), machines.len());
        counts
    }

    /// Persist the current document unconditionally (final shutdown snapshot).
    pub fn persist(&self) -> Result<(), StoreError> {
        let machines = self.machines.lock();
        persist::save(&self.path, &machines)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
