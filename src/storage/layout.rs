//! Mount Layout
//!
//! Where pools, shares and snapshots live on the host.

use serde::{Deserialize, Serialize};

/// Directory layout of mounted pools and shares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    /// Pools are mounted at `<pool_mount_root>/<pool>`
    pub pool_mount_root: String,
    /// Shares are mounted at `<share_mount_root>/<pool>/<share>`
    pub share_mount_root: String,
    /// Snapshot directory inside each pool
    pub snapshot_dir: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            pool_mount_root: "/mnt2/pools".to_string(),
            share_mount_root: "/mnt2/shares".to_string(),
            snapshot_dir: ".snapshots".to_string(),
        }
    }
}

impl Layout {
    pub fn pool_mount(&self, pool: &str) -> String {
        format!("{}/{}", self.pool_mount_root, pool)
    }

    /// Subvolume path of a share inside its mounted pool
    pub fn share_path(&self, pool_mount: &str, share: &str) -> String {
        format!("{}/{}", pool_mount, share)
    }

    pub fn share_mount(&self, pool: &str, share: &str) -> String {
        format!("{}/{}/{}", self.share_mount_root, pool, share)
    }

    pub fn snapshot_parent(&self, pool_mount: &str, share: &str) -> String {
        format!("{}/{}/{}", pool_mount, self.snapshot_dir, share)
    }

    pub fn snapshot_path(&self, pool_mount: &str, share: &str, snapshot: &str) -> String {
        format!("{}/{}", self.snapshot_parent(pool_mount, share), snapshot)
    }

    /// Where the original subvolume waits while a rollback promotes a snapshot
    pub fn rollback_parking(&self, pool_mount: &str, share: &str) -> String {
        format!("{}/{}/.rollback-{}", pool_mount, self.snapshot_dir, share)
    }
}
