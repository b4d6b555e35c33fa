//! Daemon Configuration
//!
//! `AppConfig` is read from an optional YAML file; every field has a default
//! so a partial file (or none) is valid. Command-line flags override the
//! loaded values in `main`.

use crate::error::{Error, Result};
use crate::executor::RunnerConfig;
use crate::filesystem::{BtrfsCommands, ToolPaths};
use crate::storage::Layout;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub tools: ToolPaths,
    /// Timeout for short status queries
    pub status_timeout_secs: u64,
    pub runner: RunnerConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            status_timeout_secs: 60,
            runner: RunnerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_secs: u64,
    pub procfs_root: String,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            procfs_root: "/proc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub health_addr: String,
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

// =============================================================================
// App Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub executor: ExecutorConfig,
    pub layout: Layout,
    pub poller: PollerConfig,
    pub sampler: SamplerConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load from a YAML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Configuration(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_yaml(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("executor.status_timeout_secs", self.executor.status_timeout_secs),
            ("poller.interval_secs", self.poller.interval_secs),
            ("sampler.interval_secs", self.sampler.interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Configuration(format!("{} must be positive", name)));
            }
        }
        if self.executor.runner.retry_attempts == 0 {
            return Err(Error::Configuration(
                "executor.runner.retry_attempts must be at least 1".into(),
            ));
        }

        for (name, root) in [
            ("layout.pool_mount_root", &self.layout.pool_mount_root),
            ("layout.share_mount_root", &self.layout.share_mount_root),
        ] {
            if !root.starts_with('/') {
                return Err(Error::Configuration(format!(
                    "{} must be an absolute path: {}",
                    name, root
                )));
            }
        }
        let snapshot_dir = &self.layout.snapshot_dir;
        if snapshot_dir.is_empty() || snapshot_dir.contains('/') {
            return Err(Error::Configuration(format!(
                "layout.snapshot_dir must be a single path component: {:?}",
                snapshot_dir
            )));
        }

        self.health_addr()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn btrfs_commands(&self) -> BtrfsCommands {
        BtrfsCommands::new(
            self.executor.tools.clone(),
            Duration::from_secs(self.executor.status_timeout_secs),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.interval_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sampler.interval_secs)
    }

    pub fn health_addr(&self) -> Result<SocketAddr> {
        parse_addr("server.health_addr", &self.server.health_addr)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        parse_addr("server.metrics_addr", &self.server.metrics_addr)
    }
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid {} {:?}: {}", name, value, e)))
}
