//! Storage Module
//!
//! Pool, share, snapshot and quota lifecycle managers. Every manager calls the
//! command executor, parses the tool output and only then updates persisted
//! rows, so a failed external operation never leaves a row behind.

pub mod layout;
pub mod locks;
pub mod mount;
pub mod pool;
pub mod quota;
pub mod share;
pub mod snapshot;

pub use layout::*;
pub use locks::*;
pub use pool::*;
pub use quota::*;
pub use share::*;
pub use snapshot::*;

use crate::domain::model::{Disk, EntityId, Pool, Share};
use crate::domain::ports::{CommandOutput, CommandRequest, CommandRunnerRef, Repository};
use crate::error::{Error, Result};
use crate::filesystem::{parse_subvolume_id, BtrfsCommands};
use crate::store::Store;
use std::sync::Arc;
use tracing::debug;

/// Collaborators shared by the managers and orchestrators
#[derive(Clone)]
pub struct StorageContext {
    pub store: Store,
    pub runner: CommandRunnerRef,
    pub commands: Arc<BtrfsCommands>,
    pub layout: Arc<Layout>,
    pub locks: Arc<PoolLocks>,
}

impl StorageContext {
    pub fn new(
        store: Store,
        runner: CommandRunnerRef,
        commands: BtrfsCommands,
        layout: Layout,
    ) -> Self {
        Self {
            store,
            runner,
            commands: Arc::new(commands),
            layout: Arc::new(layout),
            locks: PoolLocks::new(),
        }
    }

    pub async fn run(&self, request: CommandRequest) -> Result<CommandOutput> {
        self.runner.run(request).await
    }

    pub async fn pool(&self, pool_id: EntityId) -> Result<Pool> {
        self.store.pools.require(pool_id).await
    }

    pub async fn share(&self, share_id: EntityId) -> Result<Share> {
        self.store.shares.require(share_id).await
    }

    /// Member disks of a pool in membership order
    pub async fn pool_disks(&self, pool: &Pool) -> Result<Vec<Disk>> {
        let mut disks = Vec::with_capacity(pool.disk_ids.len());
        for id in &pool.disk_ids {
            disks.push(self.store.disks.require(*id).await?);
        }
        Ok(disks)
    }

    /// A member device usable as the mount source of the pool
    pub async fn pool_device(&self, pool: &Pool) -> Result<String> {
        let first = pool.disk_ids.first().ok_or_else(|| {
            Error::StateConflict(format!("pool {} has no member disks", pool.name))
        })?;
        Ok(self.store.disks.require(*first).await?.device_path())
    }

    /// Destroy a quota group, tolerating one that is already gone
    pub async fn destroy_qgroup(&self, qgroup: &str, mount_point: &str) -> Result<()> {
        match self
            .run(self.commands.qgroup_destroy(qgroup, mount_point))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::CommandExecution { stderr, .. })
                if stderr
                    .iter()
                    .any(|l| l.contains("No such file") || l.contains("does not exist")) =>
            {
                debug!(qgroup, "quota group already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Subvolume id of the subvolume at `path`
    pub async fn subvolume_id(&self, path: &str) -> Result<u64> {
        let output = self.run(self.commands.subvolume_show(path)).await?;
        parse_subvolume_id(&output.stdout)
    }
}

/// Reject names that are empty, contain path separators or are reserved
pub fn validate_name(kind: &str, name: &str, reserved: &[&str]) -> Result<()> {
    let invalid = name.is_empty()
        || name.len() > 255
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
        || name.starts_with('-')
        || reserved.contains(&name);
    if invalid {
        return Err(Error::Validation(format!("invalid {} name: {:?}", kind, name)));
    }
    Ok(())
}
