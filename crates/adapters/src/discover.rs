// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Discovery source adapter trait, aggregation, and the name registry.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use drover_core::DiscoveredMachine;

use crate::static_inventory::StaticInventoryDetector;

/// Errors from discovery sources
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("inventory file not found: {0}")]
    InventoryNotFound(PathBuf),
    #[error("detector `{name}` failed: {message}")]
    SourceFailed { name: String, message: String },
    #[error("unknown detector: {0}")]
    UnknownDetector(String),
    #[error("bad options for detector `{name}`: {source}")]
    BadOptions {
        name: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of currently-visible machines.
#[async_trait]
pub trait Discover: Send + Sync + 'static {
    /// Registry name of this source (stamped into each record's `discoverer`)
    fn name(&self) -> &str;

    /// Report every machine this source can currently see.
    async fn detect(&self) -> Result<Vec<DiscoveredMachine>, DetectError>;
}

/// All configured discovery sources, queried together each cycle.
pub struct DetectorSet {
    detectors: Vec<Box<dyn Discover>>,
}

impl std::fmt::Debug for DetectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorSet")
            .field("detectors", &self.detectors.len())
            .finish()
    }
}

impl DetectorSet {
    pub fn new(detectors: Vec<Box<dyn Discover>>) -> Self {
        Self { detectors }
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Aggregate every source's view of the fleet.
    ///
    /// Duplicate `instance_id`s across sources are the same machine; the
    /// first source to report wins. Any source failing fails the whole
    /// sweep: a partial fleet view would orphan every machine the failed
    /// source owns, so the caller skips the cycle instead.
    pub async fn detect_all(&self) -> Result<Vec<DiscoveredMachine>, DetectError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut machines = Vec::new();
        for detector in &self.detectors {
            for machine in detector.detect().await? {
                if seen.insert(machine.instance_id.clone()) {
                    machines.push(machine);
                } else {
                    tracing::debug!(
                        instance_id = %machine.instance_id,
                        detector = detector.name(),
                        "duplicate instance id across sources, keeping first"
                    );
                }
            }
        }
        Ok(machines)
    }
}

#[derive(Debug, Deserialize)]
struct StaticOptions {
    #[serde(default = "default_inventory")]
    inventory: PathBuf,
}

fn default_inventory() -> PathBuf {
    PathBuf::from("inventory.ini")
}

/// Build the configured detectors by registry name.
///
/// Relative paths in detector options resolve against the config file's
/// directory. Unknown names are configuration errors, not silently ignored.
pub fn build_detectors(
    config_dir: &Path,
    configured: &BTreeMap<String, toml::Value>,
) -> Result<DetectorSet, DetectError> {
    let mut detectors: Vec<Box<dyn Discover>> = Vec::new();
    for (name, options) in configured {
        match name.as_str() {
            "static" => {
                let opts: StaticOptions = options
                    .clone()
                    .try_into()
                    .map_err(|source| DetectError::BadOptions { name: name.clone(), source })?;
                let inventory = if opts.inventory.is_absolute() {
                    opts.inventory
                } else {
                    config_dir.join(opts.inventory)
                };
                detectors.push(Box::new(StaticInventoryDetector::new(inventory)?));
            }
            other => return Err(DetectError::UnknownDetector(other.to_string())),
        }
    }
    Ok(DetectorSet::new(detectors))
}

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::{DetectError, Discover};
    use async_trait::async_trait;
    use drover_core::DiscoveredMachine;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FakeDetectorState {
        machines: Vec<DiscoveredMachine>,
        failure: Option<String>,
    }

    /// Scripted discovery source for testing.
    ///
    /// Clones share state, so a test can hold one handle and mutate what the
    /// reconciliation loop will see on its next cycle.
    #[derive(Clone)]
    pub struct FakeDetector {
        name: String,
        inner: Arc<Mutex<FakeDetectorState>>,
    }

    impl FakeDetector {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                inner: Arc::new(Mutex::new(FakeDetectorState {
                    machines: Vec::new(),
                    failure: None,
                })),
            }
        }

        /// Replace the visible machine set.
        pub fn set_machines(&self, machines: Vec<DiscoveredMachine>) {
            self.inner.lock().machines = machines;
        }

        /// Make every subsequent detect call fail.
        pub fn set_failure(&self, message: impl Into<String>) {
            self.inner.lock().failure = Some(message.into());
        }

        pub fn clear_failure(&self) {
            self.inner.lock().failure = None;
        }
    }

    #[async_trait]
    impl Discover for FakeDetector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn detect(&self) -> Result<Vec<DiscoveredMachine>, DetectError> {
            let state = self.inner.lock();
            if let Some(message) = &state.failure {
                return Err(DetectError::SourceFailed {
                    name: self.name.clone(),
                    message: message.clone(),
                });
            }
            Ok(state.machines.clone())
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeDetector;

#[cfg(test)]
#[path = "discover_tests.rs"]
mod tests;
