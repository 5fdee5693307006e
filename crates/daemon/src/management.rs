// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Management/query interface exposed to UI and CLI collaborators.
//!
//! Every operation answers with a structured response; failures come back
//! as `{success: false, error: …}` rather than surfacing errors to the
//! caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drover_core::{Clock, DiscoveredMachine, MachineRecord, MachineStatus, RuleSet};
use drover_store::StateStore;

/// Management requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    ListMachines {
        #[serde(default)]
        status: Option<MachineStatus>,
    },
    /// Full detail for one machine, including its job history
    GetMachine {
        id: String,
    },
    /// Manually register a machine; the rule matcher classifies it
    AddMachine {
        instance_id: String,
        ip_address: String,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    /// Force a machine back to `new` for a fresh attempt (resets retry budgets)
    ResetMachine {
        id: String,
    },
    DeleteMachine {
        id: String,
    },
    /// Counts by status
    Stats,
}

/// Management response envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self { success: true, error: None, data: Some(value) },
            Err(e) => Self::error(format!("failed to encode response: {e}")),
        }
    }

    fn ok_empty() -> Self {
        Self { success: true, error: None, data: None }
    }

    fn error(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), data: None }
    }
}

/// One row in a machine listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSummary {
    pub instance_id: String,
    pub ip_address: String,
    pub status: MachineStatus,
    pub groups: Vec<String>,
    pub jobs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&MachineRecord> for MachineSummary {
    fn from(record: &MachineRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            ip_address: record.ip_address.clone(),
            status: record.overall_status,
            groups: record.groups.clone(),
            jobs: record.jobs.len(),
            current_job: record.current_job.clone(),
            updated_at: record.updated_at,
        }
    }
}

/// Handler for management requests.
pub struct Management<C: Clock> {
    store: Arc<StateStore<C>>,
    rules: RuleSet,
}

impl<C: Clock> Management<C> {
    pub fn new(store: Arc<StateStore<C>>, rules: RuleSet) -> Self {
        Self { store, rules }
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::ListMachines { status } => {
                let mut machines = self.store.list(status);
                machines.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
                let summaries: Vec<MachineSummary> =
                    machines.iter().map(MachineSummary::from).collect();
                Response::ok(summaries)
            }

            Request::GetMachine { id } => match self.store.get(&id) {
                Some(record) => Response::ok(record),
                None => Response::error(format!("unknown machine: {id}")),
            },

            Request::AddMachine { instance_id, ip_address, tags } => {
                if instance_id.is_empty() {
                    return Response::error("instance_id must not be empty");
                }
                if self.store.get(&instance_id).is_some() {
                    return Response::error(format!("machine already exists: {instance_id}"));
                }
                let mut machine = DiscoveredMachine::new(instance_id, ip_address, "manual");
                machine.tags = tags;
                let classification = self.rules.classify(&machine);
                match self.store.upsert_discovery(
                    &machine,
                    classification.groups,
                    classification.jobs,
                ) {
                    Ok(record) => Response::ok(MachineSummary::from(&record)),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            Request::ResetMachine { id } => {
                match self.store.set_status(&id, MachineStatus::New) {
                    Ok(()) => Response::ok_empty(),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            Request::DeleteMachine { id } => match self.store.delete(&id) {
                Ok(true) => Response::ok_empty(),
                Ok(false) => Response::error(format!("unknown machine: {id}")),
                Err(e) => Response::error(e.to_string()),
            },

            Request::Stats => Response::ok(self.store.stats()),
        }
    }
}

#[cfg(test)]
#[path = "management_tests.rs"]
mod tests;
