//! Snapshot Manager
//!
//! Snapshots live under `<pool>/.snapshots/<share>/`. Rollback is
//! all-or-nothing: the original subvolume is parked until the promoted copy
//! is in place, and any failure restores and remounts the original.

use crate::domain::model::{qgroup_for, EntityId, Pool, Share, Snapshot};
use crate::domain::ports::Repository;
use crate::error::{Error, Result};
use crate::storage::{validate_name, StorageContext};
use chrono::Utc;
use tracing::{error, info, warn};

pub struct SnapshotManager {
    ctx: StorageContext,
}

impl SnapshotManager {
    pub fn new(ctx: StorageContext) -> Self {
        Self { ctx }
    }

    pub async fn get_snapshot(&self, snapshot_id: EntityId) -> Result<Snapshot> {
        self.ctx.store.snapshots.require(snapshot_id).await
    }

    /// Snapshots of a share, newest first
    pub async fn list_snapshots(&self, share_id: EntityId) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.ctx.store.snapshots.list_by_parent(share_id).await?;
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    async fn owners(&self, share_id: EntityId) -> Result<(Share, Pool)> {
        let share = self.ctx.share(share_id).await?;
        let pool = self.ctx.pool(share.pool_id).await?;
        Ok((share, pool))
    }

    pub async fn create_snapshot(
        &self,
        share_id: EntityId,
        name: &str,
        writable: bool,
    ) -> Result<Snapshot> {
        validate_name("snapshot", name, &[])?;
        let (share, pool) = self.owners(share_id).await?;
        if self
            .ctx
            .store
            .snapshots
            .list_by_parent(share_id)
            .await?
            .iter()
            .any(|s| s.name == name)
        {
            return Err(Error::Validation(format!(
                "snapshot {} already exists for share {}",
                name, share.name
            )));
        }

        let layout = &self.ctx.layout;
        let source = layout.share_path(&pool.mount_point, &share.name);
        let dest = layout.snapshot_path(&pool.mount_point, &share.name, name);
        self.ctx
            .run(
                self.ctx
                    .commands
                    .mkdir(&layout.snapshot_parent(&pool.mount_point, &share.name)),
            )
            .await?;
        self.ctx
            .run(self.ctx.commands.subvolume_snapshot(&source, &dest, !writable))
            .await?;
        let subvol_id = self.ctx.subvolume_id(&dest).await?;

        let snapshot = self
            .ctx
            .store
            .snapshots
            .create(Snapshot {
                id: 0,
                share_id,
                name: name.to_string(),
                writable,
                subvol_id,
                qgroup: qgroup_for(subvol_id),
                created_at: Utc::now(),
            })
            .await?;
        info!(share = %share.name, snapshot = name, writable, "snapshot created");
        Ok(snapshot)
    }

    /// Delete a snapshot subvolume and its quota group. Irreversible.
    pub async fn delete_snapshot(&self, snapshot_id: EntityId) -> Result<()> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        let (share, pool) = self.owners(snapshot.share_id).await?;

        let path = self
            .ctx
            .layout
            .snapshot_path(&pool.mount_point, &share.name, &snapshot.name);
        self.ctx.run(self.ctx.commands.subvolume_delete(&path)).await?;
        self.ctx
            .destroy_qgroup(&snapshot.qgroup, &pool.mount_point)
            .await?;
        self.ctx.store.snapshots.delete(snapshot_id).await?;

        info!(share = %share.name, snapshot = %snapshot.name, "snapshot deleted");
        Ok(())
    }

    /// Replace a share's contents with a snapshot.
    ///
    /// On success the share points at the promoted copy and the snapshot is
    /// consumed. On failure the original subvolume is back in place, the
    /// share is mounted and `StateConflict` is returned. If the original
    /// cannot be moved back, `Internal` names the path it is parked at.
    pub async fn rollback(&self, share_id: EntityId, snapshot_id: EntityId) -> Result<Share> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        if snapshot.share_id != share_id {
            return Err(Error::Validation(format!(
                "snapshot {} does not belong to share {}",
                snapshot.name, share_id
            )));
        }
        let (mut share, pool) = self.owners(share_id).await?;

        let layout = &self.ctx.layout;
        let device = self.ctx.pool_device(&pool).await?;
        let mount = layout.share_mount(&pool.name, &share.name);
        let share_path = layout.share_path(&pool.mount_point, &share.name);
        let parking = layout.rollback_parking(&pool.mount_point, &share.name);
        let source = layout.snapshot_path(&pool.mount_point, &share.name, &snapshot.name);

        self.ctx.ensure_unmounted(&mount).await?;

        if let Err(e) = self.ctx.run(self.ctx.commands.rename(&share_path, &parking)).await {
            self.remount_original(&device, &mount, &share.name).await;
            return Err(Error::StateConflict(format!(
                "rollback of {} aborted, original kept: {}",
                share.name, e
            )));
        }

        if let Err(e) = self
            .ctx
            .run(self.ctx.commands.subvolume_snapshot(&source, &share_path, false))
            .await
        {
            self.restore_original(&device, &mount, &share_path, &parking, &share.name)
                .await?;
            return Err(Error::StateConflict(format!(
                "rollback of {} to {} failed, original restored: {}",
                share.name, snapshot.name, e
            )));
        }

        // Nothing below touches the row until the promoted copy is mounted
        let old_qgroup = share.qgroup.clone();
        let mut promoted_qgroup: Option<String> = None;
        let committed: Result<Share> = async {
            let subvol_id = self.ctx.subvolume_id(&share_path).await?;
            share.subvol_id = subvol_id;
            share.qgroup = qgroup_for(subvol_id);
            promoted_qgroup = Some(share.qgroup.clone());
            if share.size_limit.is_some() {
                self.ctx
                    .run(
                        self.ctx
                            .commands
                            .qgroup_limit(share.size_limit, &share.qgroup, &pool.mount_point),
                    )
                    .await?;
            }
            self.ctx
                .ensure_mounted(&device, &mount, Some(&share.name))
                .await?;
            self.ctx.store.shares.update(share.clone()).await
        }
        .await;

        let share = match committed {
            Ok(share) => share,
            Err(e) => {
                self.discard_promoted(
                    &mount,
                    &share_path,
                    promoted_qgroup.as_deref(),
                    &pool.mount_point,
                    &share.name,
                )
                .await;
                self.restore_original(&device, &mount, &share_path, &parking, &share.name)
                    .await?;
                return Err(Error::StateConflict(format!(
                    "rollback of {} to {} failed after promotion, original restored: {}",
                    share.name, snapshot.name, e
                )));
            }
        };

        // The original is no longer referenced by any row
        if let Err(e) = self.ctx.run(self.ctx.commands.subvolume_delete(&parking)).await {
            warn!(share = %share.name, error = %e, %parking, "parked subvolume left behind");
        }
        if let Err(e) = self.ctx.destroy_qgroup(&old_qgroup, &pool.mount_point).await {
            warn!(share = %share.name, error = %e, "stale quota group left behind");
        }
        self.delete_snapshot(snapshot.id).await?;

        info!(share = %share.name, snapshot = %snapshot.name, subvol_id = share.subvol_id, "share rolled back");
        Ok(share)
    }

    /// Remove a promoted copy that never became the share's subvolume
    async fn discard_promoted(
        &self,
        mount: &str,
        share_path: &str,
        qgroup: Option<&str>,
        pool_mount: &str,
        share: &str,
    ) {
        if let Err(e) = self.ctx.ensure_unmounted(mount).await {
            warn!(share, error = %e, "promoted copy still mounted");
        }
        if let Err(e) = self.ctx.run(self.ctx.commands.subvolume_delete(share_path)).await {
            warn!(share, error = %e, "failed to delete promoted copy");
        }
        if let Some(qgroup) = qgroup {
            if let Err(e) = self.ctx.destroy_qgroup(qgroup, pool_mount).await {
                warn!(share, qgroup, error = %e, "promoted quota group left behind");
            }
        }
    }

    /// Move the parked original back and remount it. If the move fails the
    /// original stays parked and the error names where.
    async fn restore_original(
        &self,
        device: &str,
        mount: &str,
        share_path: &str,
        parking: &str,
        share: &str,
    ) -> Result<()> {
        if let Err(e) = self.ctx.run(self.ctx.commands.rename(parking, share_path)).await {
            error!(share, error = %e, parking, "failed to restore original subvolume");
            return Err(Error::Internal(format!(
                "rollback of {} could not restore the original subvolume, it remains at {}: {}",
                share, parking, e
            )));
        }
        self.remount_original(device, mount, share).await;
        Ok(())
    }

    async fn remount_original(&self, device: &str, mount: &str, share: &str) {
        if let Err(e) = self.ctx.ensure_mounted(device, mount, Some(share)).await {
            error!(share, error = %e, "failed to remount share after aborted rollback");
        }
    }
}
