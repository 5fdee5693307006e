// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The row a discovery source produces for one visible machine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A machine as reported by a discovery source.
///
/// `instance_id` must be stable across cycles for the same resource; the
/// reconciliation loop treats the same id from different sources as one
/// machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredMachine {
    pub instance_id: String,
    pub ip_address: String,
    /// Name of the source that reported this machine
    pub discoverer: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl DiscoveredMachine {
    pub fn new(
        instance_id: impl Into<String>,
        ip_address: impl Into<String>,
        discoverer: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            ip_address: ip_address.into(),
            discoverer: discoverer.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Builder-style tag attachment, mostly for tests and fixtures.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
