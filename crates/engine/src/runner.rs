// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Playbook runner: subprocess invocation with streamed log capture.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Output that proves the tool did nothing: an apparently-successful run
/// that matched zero hosts masks inventory or connectivity misconfiguration.
const NO_HOSTS_MARKER: &str = "no hosts matched";

/// Errors from invoking the external configuration tool
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One playbook invocation against one machine's scoped inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub playbook: PathBuf,
    pub inventory: PathBuf,
    /// Append-only log artifact for this (machine, job) pair
    pub log_file: PathBuf,
}

/// What the tool reported for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub no_hosts_matched: bool,
}

impl RunOutcome {
    /// Zero exit, and the run actually touched a host.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.no_hosts_matched
    }
}

/// Adapter for executing one playbook run.
#[async_trait]
pub trait PlaybookRunner: Send + Sync + 'static {
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError>;
}

/// Real runner: `<program> <playbook> -i <inventory>` as a subprocess.
///
/// Combined stdout/stderr stream into the log artifact line by line as
/// produced, so a crash mid-run still leaves a partial, useful log. Each
/// run is delimited by START/END markers carrying a timestamp and the exit
/// code.
pub struct AnsibleRunner {
    program: PathBuf,
}

impl AnsibleRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

#[async_trait]
impl PlaybookRunner for AnsibleRunner {
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError> {
        if let Some(parent) = request.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = Arc::new(Mutex::new(
            std::fs::OpenOptions::new().create(true).append(true).open(&request.log_file)?,
        ));

        append_line(
            &log,
            &format!("\n=== {} START {} ===", timestamp(), request.playbook.display()),
        );

        let mut child = tokio::process::Command::new(&self.program)
            .arg(&request.playbook)
            .arg("-i")
            .arg(&request.inventory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn { program: self.program.clone(), source })?;

        let no_hosts = Arc::new(AtomicBool::new(false));
        let stdout = child.stdout.take().map(|s| stream_lines(s, Arc::clone(&log), Arc::clone(&no_hosts)));
        let stderr = child.stderr.take().map(|s| stream_lines(s, Arc::clone(&log), Arc::clone(&no_hosts)));

        let status = child.wait().await?;
        if let Some(task) = stdout {
            let _ = task.await;
        }
        if let Some(task) = stderr {
            let _ = task.await;
        }

        let exit_code = status.code().unwrap_or(-1);
        append_line(&log, &format!("=== END rc={exit_code} ==="));

        Ok(RunOutcome { exit_code, no_hosts_matched: no_hosts.load(Ordering::Relaxed) })
    }
}

/// Copy one output stream into the shared log, scanning for the marker.
fn stream_lines(
    stream: impl AsyncRead + Unpin + Send + 'static,
    log: Arc<Mutex<std::fs::File>>,
    no_hosts: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.to_lowercase().contains(NO_HOSTS_MARKER) {
                no_hosts.store(true, Ordering::Relaxed);
            }
            append_line(&log, &line);
        }
    })
}

fn append_line(log: &Arc<Mutex<std::fs::File>>, line: &str) {
    use std::io::Write;
    let mut file = log.lock();
    if let Err(e) = writeln!(file, "{line}") {
        tracing::warn!(error = %e, "failed to append to job log");
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::{PlaybookRunner, RunOutcome, RunRequest, RunnerError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    enum Scripted {
        Outcome(RunOutcome),
        Error(String),
    }

    struct FakeRunnerState {
        script: VecDeque<Scripted>,
        calls: Vec<RunRequest>,
    }

    /// Scripted runner for testing; clones share the script and call log.
    ///
    /// Outcomes are consumed in order; when the script runs dry every run
    /// succeeds with exit 0.
    #[derive(Clone)]
    pub struct FakeRunner {
        inner: Arc<Mutex<FakeRunnerState>>,
    }

    impl Default for FakeRunner {
        fn default() -> Self {
            Self {
                inner: Arc::new(Mutex::new(FakeRunnerState {
                    script: VecDeque::new(),
                    calls: Vec::new(),
                })),
            }
        }
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue an outcome for the next unscripted run.
        pub fn push_outcome(&self, exit_code: i32, no_hosts_matched: bool) {
            self.inner
                .lock()
                .script
                .push_back(Scripted::Outcome(RunOutcome { exit_code, no_hosts_matched }));
        }

        /// Queue a runner-level error (spawn failure, etc).
        pub fn push_error(&self, message: impl Into<String>) {
            self.inner.lock().script.push_back(Scripted::Error(message.into()));
        }

        /// Every invocation so far, in dispatch order.
        pub fn calls(&self) -> Vec<RunRequest> {
            self.inner.lock().calls.clone()
        }
    }

    #[async_trait]
    impl PlaybookRunner for FakeRunner {
        async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError> {
            let mut state = self.inner.lock();
            state.calls.push(request.clone());
            match state.script.pop_front() {
                Some(Scripted::Outcome(outcome)) => Ok(outcome),
                Some(Scripted::Error(message)) => Err(RunnerError::Io(std::io::Error::other(message))),
                None => Ok(RunOutcome { exit_code: 0, no_hosts_matched: false }),
            }
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeRunner;

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
