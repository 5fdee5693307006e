// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scoped single-machine inventory files.
//!
//! Each playbook run targets exactly one machine, described by a temporary
//! inventory listing the machine's address under every group the matcher
//! assigned. The returned [`TempPath`] removes the file on drop, so the
//! scope is released after the run whatever its outcome.

use std::io::Write;

use tempfile::TempPath;

use drover_core::MachineRecord;

// Fixed connection parameters for every generated inventory
const CONNECTION_VARS: &str = "\
[all:vars]
ansible_user=ubuntu
ansible_ssh_common_args='-o StrictHostKeyChecking=no'
ansible_python_interpreter=/usr/bin/python3
";

/// Materialize the single-machine inventory for one run.
pub fn write_scoped_inventory(machine: &MachineRecord) -> std::io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("drover-inventory-")
        .suffix(".ini")
        .tempfile()?;

    let mut contents = String::new();
    if machine.groups.is_empty() {
        contents.push_str("[all]\n");
        contents.push_str(&machine.ip_address);
        contents.push_str("\n\n");
    } else {
        for group in &machine.groups {
            contents.push('[');
            contents.push_str(group);
            contents.push_str("]\n");
            contents.push_str(&machine.ip_address);
            contents.push_str("\n\n");
        }
    }
    contents.push_str(CONNECTION_VARS);

    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
#[path = "inventory_tests.rs"]
mod tests;
