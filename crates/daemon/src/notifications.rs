// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal-status notification fan-out.

use std::path::Path;

use tracing::{info, warn};

use drover_adapters::NotifierSet;
use drover_core::{Clock, MachineRecord, MachineStatus};
use drover_store::StateStore;

/// Notify every machine sitting in a terminal status that has not been
/// announced yet, then mark it notified. One-shot per status value: the
/// flag re-arms when the status changes.
pub(crate) async fn dispatch<C: Clock>(
    store: &StateStore<C>,
    notifiers: &NotifierSet,
    log_tail_lines: usize,
) {
    if notifiers.is_empty() {
        return;
    }

    for machine in store.list(None) {
        if !machine.overall_status.is_notifiable() || machine.notified {
            continue;
        }

        let title = format!("{} {}", machine.instance_id, machine.overall_status);
        let message = build_message(&machine, log_tail_lines);

        let sent = notifiers.notify_all(&title, &message).await;
        if sent > 0 {
            info!(
                instance_id = %machine.instance_id,
                status = %machine.overall_status,
                sent,
                "notification sent"
            );
        }
        if let Err(e) = store.mark_notified(&machine.instance_id) {
            warn!(instance_id = %machine.instance_id, error = %e, "failed to mark notified");
        }
    }
}

fn build_message(machine: &MachineRecord, log_tail_lines: usize) -> String {
    if machine.overall_status == MachineStatus::Provisioned {
        return format!("all {} job(s) succeeded", machine.jobs.len());
    }

    let failed = machine.failed_job_names();
    let mut message = if failed.is_empty() {
        "provisioning failed".to_string()
    } else {
        format!("failed jobs: {}", failed.join(", "))
    };

    if let Some(error) = machine.last_failed_job().and_then(|r| r.error.clone()) {
        message.push('\n');
        message.push_str(&error);
    }

    if log_tail_lines > 0 {
        if let Some(log_file) = machine.last_failed_job().and_then(|r| r.log_file.as_deref()) {
            if let Some(tail) = read_tail(log_file, log_tail_lines) {
                message.push_str("\n---\n");
                message.push_str(&tail);
            }
        }
    }

    message
}

/// Last `lines` lines of a log artifact, if it can be read.
fn read_tail(path: &Path, lines: usize) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
}

#[cfg(test)]
#[path = "notifications_tests.rs"]
mod tests;
