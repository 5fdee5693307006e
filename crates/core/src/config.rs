// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration: one TOML file holding daemon settings, rules,
//! and the detector/notifier registries.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::rules::Rule;

/// Errors from loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid rule `{name}`: {reason}")]
    InvalidRule { name: String, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `[daemon]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between reconciliation cycles; zero or negative means run
    /// one cycle and exit (dry validation)
    pub interval_secs: i64,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    /// Maximum re-attempts per job before the machine fails permanently
    pub max_retries: u32,
    /// Provisioning worker pool size
    pub workers: usize,
    /// External configuration tool invoked per job
    pub ansible_playbook_bin: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            state_file: PathBuf::from("state.json"),
            log_dir: PathBuf::from("logs"),
            max_retries: 3,
            workers: 4,
            ansible_playbook_bin: PathBuf::from("ansible-playbook"),
        }
    }
}

/// `[notify]` table: options shared by every notification sink
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Lines from the tail of the most recent failed job's log to include
    /// in failure notifications (0 disables)
    pub log_tail_lines: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { log_tail_lines: 0 }
    }
}

/// The full configuration document.
///
/// Detector and notifier tables stay opaque (`toml::Value`) here; the
/// adapter registries deserialize their own option structs at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub detectors: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub notifiers: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load and resolve a config file.
    ///
    /// Relative rule playbooks, the state file, and the log directory are
    /// resolved against the config file's directory so the daemon behaves
    /// the same regardless of the working directory it was launched from.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.daemon.state_file = resolve(base, &config.daemon.state_file);
        config.daemon.log_dir = resolve(base, &config.daemon.log_dir);
        for rule in &mut config.rules {
            rule.playbook = resolve(base, &rule.playbook);
        }

        Ok(config)
    }

    /// Check the document for structural problems.
    ///
    /// Missing playbook files are warnings, not errors; a rule may target a
    /// playbook that is deployed later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.workers == 0 {
            return Err(ConfigError::Invalid("daemon.workers must be at least 1".to_string()));
        }

        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(ConfigError::InvalidRule {
                    name: "<unnamed>".to_string(),
                    reason: "rule name must not be empty".to_string(),
                });
            }
            if rule.playbook.as_os_str().is_empty() {
                return Err(ConfigError::InvalidRule {
                    name: rule.name.clone(),
                    reason: "playbook path must not be empty".to_string(),
                });
            }
            if !rule.playbook.exists() {
                tracing::warn!(
                    rule = %rule.name,
                    playbook = %rule.playbook.display(),
                    "playbook file not found"
                );
            }
        }

        Ok(())
    }

    /// Whether the loop should run a single cycle and exit.
    pub fn run_once(&self) -> bool {
        self.daemon.interval_secs <= 0
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
