// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tag-predicate rules and the pure rule matcher.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::discovery::DiscoveredMachine;

/// One configured rule: a tag predicate, the playbook it contributes, and
/// the inventory group the matched machine is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Tag key → required value. A rule matches when every listed key is
    /// present with an equal value; an empty table matches every machine.
    #[serde(default, rename = "match")]
    pub match_tags: BTreeMap<String, String>,
    pub playbook: PathBuf,
    /// Inventory group contributed on match; defaults to the rule name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Rule {
    /// Evaluate this rule's predicate against a machine's tags.
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.match_tags.iter().all(|(key, want)| tags.get(key) == Some(want))
    }

    /// Group this rule contributes when matched.
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }
}

/// The matcher's verdict for one machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Groups in rule-declaration order, de-duplicated
    pub groups: Vec<String>,
    /// Playbooks in rule-declaration order, de-duplicated first-seen
    pub jobs: Vec<PathBuf>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Ordered rule collection evaluated as a pure function over machine tags.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Map a discovered machine's tags to its group set and ordered job list.
    ///
    /// No matching rule means empty groups and jobs; the caller treats that
    /// as "no eligible work".
    pub fn classify(&self, machine: &DiscoveredMachine) -> Classification {
        let mut groups: IndexSet<String> = IndexSet::new();
        let mut jobs: IndexSet<PathBuf> = IndexSet::new();

        for rule in &self.rules {
            if rule.matches(&machine.tags) {
                groups.insert(rule.group_name().to_string());
                jobs.insert(rule.playbook.clone());
            }
        }

        Classification { groups: groups.into_iter().collect(), jobs: jobs.into_iter().collect() }
    }
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
