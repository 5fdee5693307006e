// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic persistence of the state document.
//!
//! The whole store is one JSON document mapping `instance_id` to its
//! machine record. Every save serializes to a staging file next to the
//! canonical path and atomically renames over it, so a reader never sees a
//! half-written document and a crash mid-write leaves the previous good
//! state untouched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use drover_core::MachineRecord;

use crate::store::StoreError;

pub(crate) type Document = BTreeMap<String, MachineRecord>;

/// Load the document, or an empty one when the file does not exist yet.
///
/// Records with missing optional fields load with defaults; unknown status
/// strings are rejected rather than silently defaulted.
pub(crate) fn load(path: &Path) -> Result<Document, StoreError> {
    if !path.exists() {
        return Ok(Document::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Serialize and atomically replace the canonical file.
pub(crate) fn save(path: &Path, document: &Document) -> Result<(), StoreError> {
    let staging = staging_path(path);
    let bytes = serde_json::to_vec_pretty(document)?;
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)?;
    Ok(())
}

/// Staging path in the same directory (rename must not cross filesystems).
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
