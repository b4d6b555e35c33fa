//! Share Manager
//!
//! Shares are subvolumes directly under the pool's top level, each accounted
//! by its own quota group. Resizing only touches the quota limit.

use crate::domain::model::{qgroup_for, EntityId, Share};
use crate::domain::ports::Repository;
use crate::error::{Error, Result};
use crate::storage::{validate_name, SnapshotManager, StorageContext};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ShareManager {
    ctx: StorageContext,
    snapshots: Arc<SnapshotManager>,
}

impl ShareManager {
    pub fn new(ctx: StorageContext, snapshots: Arc<SnapshotManager>) -> Self {
        Self { ctx, snapshots }
    }

    pub async fn get_share(&self, share_id: EntityId) -> Result<Share> {
        self.ctx.share(share_id).await
    }

    pub async fn list_shares(&self, pool_id: EntityId) -> Result<Vec<Share>> {
        self.ctx.store.shares.list_by_parent(pool_id).await
    }

    pub async fn add_share(
        &self,
        pool_id: EntityId,
        name: &str,
        size_limit: Option<u64>,
    ) -> Result<Share> {
        validate_name("share", name, &[self.ctx.layout.snapshot_dir.as_str()])?;
        if size_limit == Some(0) {
            return Err(Error::Validation("size limit must be positive".into()));
        }
        let pool = self.ctx.pool(pool_id).await?;
        if self
            .list_shares(pool_id)
            .await?
            .iter()
            .any(|s| s.name == name)
        {
            return Err(Error::Validation(format!(
                "share {} already exists in pool {}",
                name, pool.name
            )));
        }

        let path = self.ctx.layout.share_path(&pool.mount_point, name);
        self.ctx.run(self.ctx.commands.subvolume_create(&path)).await?;

        let configured = async {
            let subvol_id = self.ctx.subvolume_id(&path).await?;
            let qgroup = qgroup_for(subvol_id);
            if size_limit.is_some() {
                self.ctx
                    .run(self.ctx.commands.qgroup_limit(size_limit, &qgroup, &pool.mount_point))
                    .await?;
            }
            Ok::<_, Error>((subvol_id, qgroup))
        }
        .await;

        let (subvol_id, qgroup) = match configured {
            Ok(ids) => ids,
            Err(e) => {
                // Do not leave an unrecorded subvolume behind
                if let Err(cleanup) = self.ctx.run(self.ctx.commands.subvolume_delete(&path)).await {
                    warn!(share = name, error = %cleanup, "failed to remove half-created subvolume");
                }
                return Err(e);
            }
        };

        let share = self
            .ctx
            .store
            .shares
            .create(Share {
                id: 0,
                pool_id,
                name: name.to_string(),
                subvol_id,
                qgroup,
                referenced_bytes: 0,
                exclusive_bytes: 0,
                size_limit,
                created_at: Utc::now(),
            })
            .await?;
        info!(pool = %pool.name, share = %share.name, subvol_id, "share created");
        Ok(share)
    }

    /// Remove a share: unmount, delete its snapshots newest first, release
    /// the quota group, delete the subvolume, then the row
    pub async fn remove_share(&self, share_id: EntityId) -> Result<()> {
        let share = self.ctx.share(share_id).await?;
        let pool = self.ctx.pool(share.pool_id).await?;

        let mount = self.ctx.layout.share_mount(&pool.name, &share.name);
        self.ctx.ensure_unmounted(&mount).await?;

        for snapshot in self.snapshots.list_snapshots(share_id).await? {
            self.snapshots.delete_snapshot(snapshot.id).await?;
        }

        self.ctx
            .destroy_qgroup(&share.qgroup, &pool.mount_point)
            .await?;
        let path = self.ctx.layout.share_path(&pool.mount_point, &share.name);
        self.ctx.run(self.ctx.commands.subvolume_delete(&path)).await?;
        self.ctx.store.shares.delete(share_id).await?;

        info!(pool = %pool.name, share = %share.name, "share removed");
        Ok(())
    }

    /// Set or clear the quota limit. No data moves.
    pub async fn resize_share(&self, share_id: EntityId, size_limit: Option<u64>) -> Result<Share> {
        if size_limit == Some(0) {
            return Err(Error::Validation("size limit must be positive".into()));
        }
        let mut share = self.ctx.share(share_id).await?;
        let pool = self.ctx.pool(share.pool_id).await?;
        self.ctx
            .run(
                self.ctx
                    .commands
                    .qgroup_limit(size_limit, &share.qgroup, &pool.mount_point),
            )
            .await?;
        share.size_limit = size_limit;
        let share = self.ctx.store.shares.update(share).await?;
        info!(share = %share.name, ?size_limit, "share resized");
        Ok(share)
    }

    /// Mount a share at its export location, returning the mount point
    pub async fn mount_share(&self, share_id: EntityId) -> Result<String> {
        let share = self.ctx.share(share_id).await?;
        let pool = self.ctx.pool(share.pool_id).await?;
        let device = self.ctx.pool_device(&pool).await?;
        let mount = self.ctx.layout.share_mount(&pool.name, &share.name);
        self.ctx
            .ensure_mounted(&device, &mount, Some(&share.name))
            .await?;
        Ok(mount)
    }

    pub async fn unmount_share(&self, share_id: EntityId) -> Result<()> {
        let share = self.ctx.share(share_id).await?;
        let pool = self.ctx.pool(share.pool_id).await?;
        self.ctx
            .ensure_unmounted(&self.ctx.layout.share_mount(&pool.name, &share.name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::RedundancyLevel;
    use crate::testing::Fixture;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_add_share_records_qgroup_and_limit() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;

        let share = fx
            .shares
            .add_share(pool.id, "docs", Some(1 << 30))
            .await
            .unwrap();
        assert_eq!(share.qgroup, qgroup_for(share.subvol_id));
        assert_eq!(share.size_limit, Some(1 << 30));

        let limits = fx.runner.calls_matching(&["btrfs", "qgroup", "limit"]);
        assert_eq!(
            limits,
            vec![vec![
                "btrfs".to_string(),
                "qgroup".into(),
                "limit".into(),
                "1073741824".into(),
                share.qgroup.clone(),
                "/mnt2/pools/data1".into(),
            ]]
        );
    }

    #[tokio::test]
    async fn test_duplicate_share_name_rejected() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        fx.share(&pool, "docs").await;

        let creates = fx.runner.calls_matching(&["btrfs", "subvolume", "create"]).len();
        let err = fx.shares.add_share(pool.id, "docs", None).await.unwrap_err();
        assert_matches!(err, Error::Validation(_));
        assert_eq!(
            fx.runner.calls_matching(&["btrfs", "subvolume", "create"]).len(),
            creates
        );

        let err = fx
            .shares
            .add_share(pool.id, ".snapshots", None)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
    }

    #[tokio::test]
    async fn test_failed_limit_removes_subvolume() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        fx.runner
            .fail(&["btrfs", "qgroup", "limit"], "ERROR: quota not enabled");

        let err = fx
            .shares
            .add_share(pool.id, "docs", Some(4096))
            .await
            .unwrap_err();
        assert_matches!(err, Error::CommandExecution { .. });
        assert!(fx.shares.list_shares(pool.id).await.unwrap().is_empty());
        assert_eq!(
            fx.runner.calls_matching(&["btrfs", "subvolume", "delete"]).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_share_deletes_snapshots_first() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;
        fx.shares.mount_share(share.id).await.unwrap();
        let first = fx
            .snapshots
            .create_snapshot(share.id, "monday", false)
            .await
            .unwrap();
        let second = fx
            .snapshots
            .create_snapshot(share.id, "tuesday", false)
            .await
            .unwrap();

        fx.shares.remove_share(share.id).await.unwrap();

        let deletes = fx.runner.calls_matching(&["btrfs", "subvolume", "delete"]);
        let targets: Vec<&str> = deletes.iter().map(|argv| argv[3].as_str()).collect();
        assert_eq!(
            targets,
            vec![
                "/mnt2/pools/data1/.snapshots/docs/tuesday",
                "/mnt2/pools/data1/.snapshots/docs/monday",
                "/mnt2/pools/data1/docs",
            ]
        );
        assert!(!fx.runner.is_mounted("/mnt2/shares/data1/docs"));

        assert_matches!(
            fx.snapshots.get_snapshot(first.id).await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(
            fx.snapshots.get_snapshot(second.id).await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(fx.shares.get_share(share.id).await, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_resize_only_changes_limit() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;

        let share = fx.shares.resize_share(share.id, Some(2048)).await.unwrap();
        assert_eq!(share.size_limit, Some(2048));
        let share = fx.shares.resize_share(share.id, None).await.unwrap();
        assert_eq!(share.size_limit, None);

        let limits = fx.runner.calls_matching(&["btrfs", "qgroup", "limit"]);
        assert_eq!(limits[1][3], "none");
        assert!(fx.runner.position(&["btrfs", "balance"]).is_none());
    }

    #[tokio::test]
    async fn test_mount_share_is_idempotent() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;

        let mount = fx.shares.mount_share(share.id).await.unwrap();
        fx.shares.mount_share(share.id).await.unwrap();
        assert_eq!(mount, "/mnt2/shares/data1/docs");
        let mounts = fx.runner.calls_matching(&["mount"]);
        // pool mount + one share mount
        assert_eq!(mounts.len(), 2);
        assert!(mounts[1].contains(&"subvol=docs".to_string()));

        fx.shares.unmount_share(share.id).await.unwrap();
        assert!(!fx.runner.is_mounted(&mount));
    }
}
