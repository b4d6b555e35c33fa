//! btrfs Command Builders
//!
//! Assembles the argument vectors for every filesystem, mount and helper tool
//! invocation the storage core performs. Status queries carry the configured
//! timeout; structural and data-moving commands run unbounded.

use crate::domain::model::RedundancyLevel;
use crate::domain::ports::CommandRequest;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Tool Configuration
// =============================================================================

/// Paths of the external binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub btrfs: String,
    pub mkfs: String,
    pub mount: String,
    pub umount: String,
    pub findmnt: String,
    pub mkdir: String,
    pub mv: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            btrfs: "/usr/sbin/btrfs".to_string(),
            mkfs: "/usr/sbin/mkfs.btrfs".to_string(),
            mount: "/usr/bin/mount".to_string(),
            umount: "/usr/bin/umount".to_string(),
            findmnt: "/usr/bin/findmnt".to_string(),
            mkdir: "/usr/bin/mkdir".to_string(),
            mv: "/usr/bin/mv".to_string(),
        }
    }
}

// =============================================================================
// Command Builders
// =============================================================================

/// Builds `CommandRequest`s for the btrfs toolchain
#[derive(Debug, Clone)]
pub struct BtrfsCommands {
    tools: ToolPaths,
    status_timeout: Duration,
}

impl BtrfsCommands {
    pub fn new(tools: ToolPaths, status_timeout: Duration) -> Self {
        Self {
            tools,
            status_timeout,
        }
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    fn btrfs<const N: usize>(&self, args: [&str; N]) -> Vec<String> {
        std::iter::once(self.tools.btrfs.as_str())
            .chain(args)
            .map(str::to_string)
            .collect()
    }

    fn query<const N: usize>(&self, args: [&str; N]) -> CommandRequest {
        CommandRequest::new(self.btrfs(args)).with_timeout(self.status_timeout)
    }

    // -------------------------------------------------------------------------
    // Filesystem / devices
    // -------------------------------------------------------------------------

    pub fn mkfs(&self, label: &str, level: RedundancyLevel, devices: &[String]) -> CommandRequest {
        let mut argv = vec![
            self.tools.mkfs.clone(),
            "-f".into(),
            "-L".into(),
            label.into(),
            "-d".into(),
            level.profile().into(),
            "-m".into(),
            level.profile().into(),
        ];
        argv.extend(devices.iter().cloned());
        CommandRequest::new(argv)
    }

    pub fn filesystem_show(&self, target: &str) -> CommandRequest {
        self.query(["filesystem", "show", "--raw", target])
    }

    pub fn filesystem_usage(&self, mount_point: &str) -> CommandRequest {
        self.query(["filesystem", "usage", "-b", mount_point])
    }

    pub fn device_add(&self, devices: &[String], mount_point: &str) -> CommandRequest {
        let mut argv = self.btrfs(["device", "add", "-f"]);
        argv.extend(devices.iter().cloned());
        argv.push(mount_point.into());
        CommandRequest::new(argv)
    }

    pub fn device_delete(&self, devices: &[String], mount_point: &str) -> CommandRequest {
        let mut argv = self.btrfs(["device", "delete"]);
        argv.extend(devices.iter().cloned());
        argv.push(mount_point.into());
        CommandRequest::new(argv)
    }

    // -------------------------------------------------------------------------
    // Subvolumes
    // -------------------------------------------------------------------------

    pub fn subvolume_create(&self, path: &str) -> CommandRequest {
        CommandRequest::new(self.btrfs(["subvolume", "create", path]))
    }

    pub fn subvolume_delete(&self, path: &str) -> CommandRequest {
        CommandRequest::new(self.btrfs(["subvolume", "delete", path]))
    }

    pub fn subvolume_snapshot(&self, source: &str, dest: &str, readonly: bool) -> CommandRequest {
        if readonly {
            CommandRequest::new(self.btrfs(["subvolume", "snapshot", "-r", source, dest]))
        } else {
            CommandRequest::new(self.btrfs(["subvolume", "snapshot", source, dest]))
        }
    }

    pub fn subvolume_show(&self, path: &str) -> CommandRequest {
        self.query(["subvolume", "show", path])
    }

    // -------------------------------------------------------------------------
    // Quotas
    // -------------------------------------------------------------------------

    pub fn quota_enable(&self, mount_point: &str) -> CommandRequest {
        CommandRequest::new(self.btrfs(["quota", "enable", mount_point]))
    }

    pub fn qgroup_show(&self, mount_point: &str) -> CommandRequest {
        self.query(["qgroup", "show", "--raw", mount_point])
    }

    pub fn qgroup_limit(&self, limit: Option<u64>, qgroup: &str, mount_point: &str) -> CommandRequest {
        let limit = limit
            .map(|bytes| bytes.to_string())
            .unwrap_or_else(|| "none".to_string());
        CommandRequest::new(self.btrfs(["qgroup", "limit", &limit, qgroup, mount_point]))
    }

    pub fn qgroup_destroy(&self, qgroup: &str, mount_point: &str) -> CommandRequest {
        CommandRequest::new(self.btrfs(["qgroup", "destroy", qgroup, mount_point]))
    }

    // -------------------------------------------------------------------------
    // Balance
    // -------------------------------------------------------------------------

    /// Foreground balance, launched as a supervised process
    pub fn balance_start(&self, mount_point: &str, convert: Option<RedundancyLevel>) -> Vec<String> {
        match convert {
            Some(level) => {
                let data = format!("-dconvert={}", level.profile());
                let meta = format!("-mconvert={}", level.profile());
                self.btrfs(["balance", "start", &data, &meta, mount_point])
            }
            None => self.btrfs(["balance", "start", "--full-balance", mount_point]),
        }
    }

    /// Exit code 1 means a balance is running or paused
    pub fn balance_status(&self, mount_point: &str) -> CommandRequest {
        self.query(["balance", "status", mount_point]).accept(&[1])
    }

    pub fn balance_cancel(&self, mount_point: &str) -> CommandRequest {
        CommandRequest::new(self.btrfs(["balance", "cancel", mount_point])).no_retry()
    }

    // -------------------------------------------------------------------------
    // Scrub
    // -------------------------------------------------------------------------

    /// Background scrub; `force` overrides a stale or active status record
    pub fn scrub_start(&self, mount_point: &str, force: bool) -> CommandRequest {
        if force {
            self.query(["scrub", "start", "-f", mount_point])
        } else {
            self.query(["scrub", "start", mount_point])
        }
    }

    pub fn scrub_status(&self, mount_point: &str) -> CommandRequest {
        self.query(["scrub", "status", "-R", mount_point])
    }

    pub fn scrub_cancel(&self, mount_point: &str) -> CommandRequest {
        self.query(["scrub", "cancel", mount_point]).no_retry()
    }

    // -------------------------------------------------------------------------
    // Mounts and helpers
    // -------------------------------------------------------------------------

    pub fn mount(&self, device: &str, target: &str, subvol: Option<&str>) -> CommandRequest {
        let options = match subvol {
            Some(subvol) => format!("subvol={}", subvol),
            None => "defaults".to_string(),
        };
        CommandRequest::new([
            self.tools.mount.as_str(),
            "-t",
            "btrfs",
            "-o",
            options.as_str(),
            device,
            target,
        ])
    }

    pub fn umount(&self, target: &str) -> CommandRequest {
        CommandRequest::new([self.tools.umount.as_str(), target])
    }

    /// Exit code 1 means nothing is mounted at `target`
    pub fn findmnt(&self, target: &str) -> CommandRequest {
        CommandRequest::new([
            self.tools.findmnt.as_str(),
            "-n",
            "-o",
            "TARGET",
            "--mountpoint",
            target,
        ])
        .accept(&[1])
        .with_timeout(self.status_timeout)
    }

    pub fn mkdir(&self, path: &str) -> CommandRequest {
        CommandRequest::new([self.tools.mkdir.as_str(), "-p", path])
    }

    pub fn rename(&self, from: &str, to: &str) -> CommandRequest {
        CommandRequest::new([self.tools.mv.as_str(), "-T", from, to])
    }
}

impl Default for BtrfsCommands {
    fn default() -> Self {
        Self::new(ToolPaths::default(), Duration::from_secs(60))
    }
}
