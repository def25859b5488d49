// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Agent configuration
//!
//! Read from ~/.cluster-agent/config.json (or `--config`), then overridden by
//! the environment and finally by command line flags:
//! - `CA_CLUSTER_NAME` - cluster name used in every identifier
//! - `CA_NAMESPACE` - namespace the agent runs in

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CLUSTER_NAME: &str = "CA_CLUSTER_NAME";
pub const ENV_NAMESPACE: &str = "CA_NAMESPACE";

pub const DEFAULT_AGENT_NAMESPACE: &str = "cluster-agent";

/// The API server rejects watch timeouts of 295 seconds and above
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 294;

/// Get the base agent directory (~/.cluster-agent/)
pub fn base_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".cluster-agent"))
        .context("Could not determine home directory")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster name embedded in WLIDs and SIDs
    pub cluster_name: String,
    /// Namespace the agent is deployed in
    pub agent_namespace: String,
    /// Pause between failed pod listings
    pub resync_backoff_secs: u64,
    /// Server-side watch timeout; every expiry triggers a resync
    pub watch_timeout_secs: u32,
    /// Directory for rotated log files; stderr only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            agent_namespace: DEFAULT_AGENT_NAMESPACE.to_string(),
            resync_backoff_secs: 5,
            watch_timeout_secs: 290,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load config from `path`, or the default location. A missing file
    /// yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.watch_timeout_secs > MAX_WATCH_TIMEOUT_SECS {
            bail!(
                "watch_timeout_secs must be at most {}, got {}",
                MAX_WATCH_TIMEOUT_SECS,
                self.watch_timeout_secs
            );
        }
        Ok(())
    }

    /// Get the config file path (~/.cluster-agent/config.json)
    pub fn config_path() -> Result<PathBuf> {
        Ok(base_dir()?.join("config.json"))
    }

    /// Apply environment overrides; `lookup` is `std::env::var` outside tests
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cluster) = lookup(ENV_CLUSTER_NAME).filter(|v| !v.is_empty()) {
            self.cluster_name = cluster;
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE).filter(|v| !v.is_empty()) {
            self.agent_namespace = namespace;
        }
    }

    /// Apply command line overrides
    pub fn apply_flags(&mut self, cluster: Option<&str>, agent_namespace: Option<&str>) {
        if let Some(cluster) = cluster {
            self.cluster_name = cluster.to_string();
        }
        if let Some(namespace) = agent_namespace {
            self.agent_namespace = namespace.to_string();
        }
    }

    pub fn resync_backoff(&self) -> Duration {
        Duration::from_secs(self.resync_backoff_secs)
    }
}
