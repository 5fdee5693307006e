// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Machine records and the machine/job state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Overall convergence status of a machine.
///
/// Serialized with a stable string encoding; unknown strings are rejected
/// when loading persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    /// Discovered, not yet queued for work
    New,
    /// Has an eligible job list, awaiting a run
    Pending,
    /// A run is in flight
    Provisioning,
    /// Terminal success
    Provisioned,
    /// Terminal, mixed job outcomes (reserved for multi-branch job lists)
    PartialFailure,
    /// Terminal failure; may be retried by the sweep until the budget is spent
    Failed,
    /// Terminal, no eligible work
    Skipped,
    /// Previously known, no longer visible to discovery
    Orphaned,
}

impl MachineStatus {
    /// Check if this status ends the normal provisioning flow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MachineStatus::Provisioned
                | MachineStatus::PartialFailure
                | MachineStatus::Failed
                | MachineStatus::Skipped
                | MachineStatus::Orphaned
        )
    }

    /// Check if reaching this status should fan out a notification.
    pub fn is_notifiable(&self) -> bool {
        matches!(
            self,
            MachineStatus::Provisioned | MachineStatus::PartialFailure | MachineStatus::Failed
        )
    }
}

crate::simple_display! {
    MachineStatus {
        New => "new",
        Pending => "pending",
        Provisioning => "provisioning",
        Provisioned => "provisioned",
        PartialFailure => "partial_failure",
        Failed => "failed",
        Skipped => "skipped",
        Orphaned => "orphaned",
    }
}

/// Status of a single job attempt series on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Reserved: per-job timeouts are not enforced by the engine yet
    Timeout,
}

impl JobStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Timeout)
    }
}

crate::simple_display! {
    JobStatus {
        Pending => "pending",
        Running => "running",
        Success => "success",
        Failed => "failed",
        Timeout => "timeout",
    }
}

/// Outcome record for one named job on one machine.
///
/// Reused across retries: `retry_count` accumulates, `error` is cleared at
/// the start of every attempt, and the log artifact path stays stable so
/// output appends across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub name: String,
    /// Path to the job definition that was executed
    pub source_file: PathBuf,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Number of times this job has been re-started after a prior attempt.
    /// Never decreases except through an explicit machine reset to `new`.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    /// First attempt for a named job.
    pub fn new(name: impl Into<String>, source_file: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            source_file: source_file.into(),
            status: JobStatus::Running,
            started_at: now,
            completed_at: None,
            duration_secs: None,
            retry_count: 0,
            log_file: None,
            error: None,
        }
    }

    /// Re-start this job for another attempt: bump the retry count, clear
    /// the previous error, and reset the completion fields.
    pub fn restart(&mut self, source_file: impl Into<PathBuf>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.source_file = source_file.into();
        self.status = JobStatus::Running;
        self.started_at = now;
        self.completed_at = None;
        self.duration_secs = None;
        self.error = None;
    }

    /// Finalize the current attempt.
    pub fn finalize(
        &mut self,
        status: JobStatus,
        error: Option<String>,
        log_file: Option<PathBuf>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_secs =
            Some((now - self.started_at).num_milliseconds() as f64 / 1000.0);
        self.error = error;
        if log_file.is_some() {
            self.log_file = log_file;
        }
    }
}

/// One discovered machine and its full provisioning history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub instance_id: String,
    pub ip_address: String,
    /// Name of the discovery source that found this machine
    pub discoverer: String,
    /// Inventory groups assigned by the rule matcher, in rule order
    #[serde(default)]
    pub groups: Vec<String>,
    /// Arbitrary discovered metadata (tag key → value)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Playbooks to execute, in order, for the current desired state
    #[serde(default)]
    pub jobs: Vec<PathBuf>,
    /// Job name → result, one entry per job ever attempted
    #[serde(default)]
    pub job_results: BTreeMap<String, JobResult>,
    pub overall_status: MachineStatus,
    /// Name of the job in flight; non-empty only while provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Whether a notification has been sent for the current status value
    #[serde(default)]
    pub notified: bool,
}

impl MachineRecord {
    /// Create a record for a freshly discovered machine.
    ///
    /// Starts `new`, or `skipped` when no jobs resolved (no eligible work).
    pub fn new(
        instance_id: impl Into<String>,
        ip_address: impl Into<String>,
        discoverer: impl Into<String>,
        tags: BTreeMap<String, String>,
        groups: Vec<String>,
        jobs: Vec<PathBuf>,
        now: DateTime<Utc>,
    ) -> Self {
        let overall_status =
            if jobs.is_empty() { MachineStatus::Skipped } else { MachineStatus::New };
        Self {
            instance_id: instance_id.into(),
            ip_address: ip_address.into(),
            discoverer: discoverer.into(),
            groups,
            tags,
            jobs,
            job_results: BTreeMap::new(),
            overall_status,
            current_job: None,
            detected_at: now,
            last_seen_at: now,
            updated_at: now,
            last_attempt_at: None,
            notified: false,
        }
    }

    /// Move to a new overall status.
    ///
    /// Re-arms the notification flag when the value changes, and zeroes every
    /// job result's retry count on an explicit re-baseline to `new`.
    pub fn set_status(&mut self, status: MachineStatus, now: DateTime<Utc>) {
        if status == MachineStatus::New {
            for result in self.job_results.values_mut() {
                result.retry_count = 0;
            }
        }
        if self.overall_status != status {
            self.notified = false;
        }
        self.overall_status = status;
        self.updated_at = now;
    }

    /// Refresh the discovery timestamps (discovery-diff step only).
    pub fn refresh_seen(&mut self, tags: BTreeMap<String, String>, now: DateTime<Utc>) {
        self.tags = tags;
        self.detected_at = now;
        self.last_seen_at = now;
        self.updated_at = now;
    }

    /// Overwrite classification after the matcher produced a different
    /// group set or job list.
    ///
    /// `skipped` machines gaining work become `pending`; machines losing all
    /// work fall back to `skipped`. Terminal run states are left untouched:
    /// classification never resurrects a machine's run state.
    pub fn reclassify(&mut self, groups: Vec<String>, jobs: Vec<PathBuf>, now: DateTime<Utc>) {
        self.groups = groups;
        self.jobs = jobs;
        match self.overall_status {
            MachineStatus::Skipped if !self.jobs.is_empty() => {
                self.set_status(MachineStatus::Pending, now);
            }
            MachineStatus::New | MachineStatus::Pending if self.jobs.is_empty() => {
                self.set_status(MachineStatus::Skipped, now);
            }
            _ => {
                self.updated_at = now;
            }
        }
    }

    /// Start (or re-start) the named job and mark the machine provisioning.
    pub fn begin_job(
        &mut self,
        name: &str,
        source_file: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> JobResult {
        let result = match self.job_results.get_mut(name) {
            Some(existing) => {
                existing.restart(source_file, now);
                existing.clone()
            }
            None => {
                let result = JobResult::new(name, source_file, now);
                self.job_results.insert(name.to_string(), result.clone());
                result
            }
        };
        self.current_job = Some(name.to_string());
        self.last_attempt_at = Some(now);
        if self.overall_status != MachineStatus::Provisioning {
            self.set_status(MachineStatus::Provisioning, now);
        } else {
            self.updated_at = now;
        }
        result
    }

    /// Finalize the named job and clear the in-flight marker.
    ///
    /// A failing status also moves the machine to `failed` so the record is
    /// never observed with a finished-failed job but a live run state.
    pub fn finish_job(
        &mut self,
        name: &str,
        status: JobStatus,
        error: Option<String>,
        log_file: Option<PathBuf>,
        now: DateTime<Utc>,
    ) -> Option<JobResult> {
        let result = self.job_results.get_mut(name)?;
        result.finalize(status, error, log_file, now);
        let snapshot = result.clone();
        self.current_job = None;
        if status.is_failure() {
            self.set_status(MachineStatus::Failed, now);
        } else {
            self.updated_at = now;
        }
        Some(snapshot)
    }

    /// Check whether any job on this machine has burned through its retry
    /// budget. Such a machine stays `failed` until an explicit reset to `new`.
    pub fn retry_budget_exhausted(&self, max_retries: u32) -> bool {
        self.job_results
            .values()
            .any(|r| r.status.is_failure() && r.retry_count >= max_retries)
    }

    /// Names of jobs whose most recent attempt failed.
    pub fn failed_job_names(&self) -> Vec<String> {
        self.job_results
            .values()
            .filter(|r| r.status.is_failure())
            .map(|r| r.name.clone())
            .collect()
    }

    /// Most recently attempted failed job, if any.
    pub fn last_failed_job(&self) -> Option<&JobResult> {
        self.job_results
            .values()
            .filter(|r| r.status.is_failure())
            .max_by_key(|r| r.started_at)
    }
}

crate::builder! {
    pub struct MachineRecordBuilder => MachineRecord {
        into {
            instance_id: String = "i-test",
            ip_address: String = "10.0.0.1",
            discoverer: String = "static",
        }
        set {
            groups: Vec<String> = Vec::new(),
            tags: BTreeMap<String, String> = BTreeMap::new(),
            jobs: Vec<PathBuf> = Vec::new(),
            job_results: BTreeMap<String, JobResult> = BTreeMap::new(),
            overall_status: MachineStatus = MachineStatus::New,
            notified: bool = false,
        }
        option {
            current_job: String = None,
            last_attempt_at: DateTime<Utc> = None,
        }
        computed {
            detected_at: DateTime<Utc> = Utc::now(),
            last_seen_at: DateTime<Utc> = Utc::now(),
            updated_at: DateTime<Utc> = Utc::now(),
        }
    }
}

crate::builder! {
    pub struct JobResultBuilder => JobResult {
        into {
            name: String = "deploy",
            source_file: PathBuf = "deploy.yml",
        }
        set {
            status: JobStatus = JobStatus::Pending,
            retry_count: u32 = 0,
        }
        option {
            completed_at: DateTime<Utc> = None,
            duration_secs: f64 = None,
            log_file: PathBuf = None,
            error: String = None,
        }
        computed {
            started_at: DateTime<Utc> = Utc::now(),
        }
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
