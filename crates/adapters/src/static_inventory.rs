// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Static inventory discovery source.
//!
//! Reads an Ansible-style INI inventory and reports each host as a
//! discovered machine. The address comes from the host's `ansible_host`
//! variable (falling back to the host name); tags are the host's
//! `key=value` variables merged with any `[group:vars]` / `[all:vars]`
//! sections that apply.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use drover_core::DiscoveredMachine;

use crate::discover::{DetectError, Discover};

const DETECTOR_NAME: &str = "static";

pub struct StaticInventoryDetector {
    inventory_path: PathBuf,
}

impl StaticInventoryDetector {
    /// The inventory must exist up front: a daemon configured against a
    /// missing file should fail at startup, not discover an empty fleet.
    pub fn new(inventory_path: impl Into<PathBuf>) -> Result<Self, DetectError> {
        let inventory_path = inventory_path.into();
        if !inventory_path.exists() {
            return Err(DetectError::InventoryNotFound(inventory_path));
        }
        tracing::info!(inventory = %inventory_path.display(), "static detector ready");
        Ok(Self { inventory_path })
    }
}

#[async_trait]
impl Discover for StaticInventoryDetector {
    fn name(&self) -> &str {
        DETECTOR_NAME
    }

    /// Re-reads the inventory on every cycle so edits show up without a
    /// daemon restart.
    async fn detect(&self) -> Result<Vec<DiscoveredMachine>, DetectError> {
        let raw = std::fs::read_to_string(&self.inventory_path)?;
        Ok(parse_inventory(&raw))
    }
}

#[derive(Debug)]
struct HostEntry {
    name: String,
    groups: Vec<String>,
    vars: BTreeMap<String, String>,
}

/// One pass for hosts, one for group variables.
fn parse_inventory(raw: &str) -> Vec<DiscoveredMachine> {
    let mut hosts: Vec<HostEntry> = Vec::new();
    let mut group_vars: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut section = String::from("ungrouped");
    let mut section_is_vars = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if let Some(group) = header.strip_suffix(":vars") {
                section = group.to_string();
                section_is_vars = true;
            } else if header.ends_with(":children") {
                // Group nesting does not affect addresses or tags
                section = header.to_string();
                section_is_vars = false;
            } else {
                section = header.to_string();
                section_is_vars = false;
            }
            continue;
        }

        if section_is_vars {
            if let Some((key, value)) = split_var(line) {
                group_vars.entry(section.clone()).or_default().insert(key, value);
            }
            continue;
        }
        if section.ends_with(":children") {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else { continue };
        let mut vars = BTreeMap::new();
        for token in tokens {
            if let Some((key, value)) = split_var(token) {
                vars.insert(key, value);
            }
        }

        match hosts.iter_mut().find(|h| h.name == name) {
            Some(existing) => {
                existing.groups.push(section.clone());
                existing.vars.extend(vars);
            }
            None => hosts.push(HostEntry { name: name.to_string(), groups: vec![section.clone()], vars }),
        }
    }

    let mut machines: Vec<DiscoveredMachine> = Vec::new();
    for host in hosts {
        // Group vars apply first; host-line vars override
        let mut tags = group_vars.get("all").cloned().unwrap_or_default();
        for group in &host.groups {
            if let Some(vars) = group_vars.get(group) {
                tags.extend(vars.clone());
            }
        }
        tags.extend(host.vars);

        let ip = tags.get("ansible_host").cloned().unwrap_or_else(|| host.name.clone());
        let instance_id = format!("static-{ip}");

        // Two host lines resolving to the same address are one machine
        match machines.iter_mut().find(|m| m.instance_id == instance_id) {
            Some(existing) => existing.tags.extend(tags),
            None => {
                let mut machine = DiscoveredMachine::new(instance_id, ip, DETECTOR_NAME);
                machine.tags = tags;
                machines.push(machine);
            }
        }
    }
    machines
}

fn split_var(token: &str) -> Option<(String, String)> {
    let (key, value) = token.split_once('=')?;
    let value = value.trim_matches(|c| c == '"' || c == '\'');
    Some((key.trim().to_string(), value.to_string()))
}

#[cfg(test)]
#[path = "static_inventory_tests.rs"]
mod tests;
