//! Quota Engine
//!
//! Turns quota group reports into usage time series. Consecutive identical
//! readings for the same share (or pool) coalesce into one row whose count
//! and timestamp advance; a changed reading starts a new row.

use crate::domain::model::{EntityId, PoolUsage, Share, ShareUsage};
use crate::domain::ports::Repository;
use crate::error::{Error, Result};
use crate::filesystem::parse_qgroup_show;
use crate::metrics::metrics;
use crate::storage::StorageContext;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, trace};

pub struct QuotaEngine {
    ctx: StorageContext,
}

impl QuotaEngine {
    pub fn new(ctx: StorageContext) -> Self {
        Self { ctx }
    }

    /// Read every quota group of a pool and record usage for the shares they
    /// account. Groups without an owning share (the top level, snapshots)
    /// are ignored.
    pub async fn poll_usage(&self, pool_id: EntityId) -> Result<Vec<ShareUsage>> {
        let pool = self.ctx.pool(pool_id).await?;
        let shares: HashMap<String, _> = self
            .ctx
            .store
            .shares
            .list_by_parent(pool.id)
            .await?
            .into_iter()
            .map(|share| (share.qgroup.clone(), share))
            .collect();

        let output = self
            .ctx
            .run(self.ctx.commands.qgroup_show(&pool.mount_point))
            .await?;
        let groups = parse_qgroup_show(&output.stdout)?;

        let mut samples = Vec::new();
        for group in groups {
            let Some(share) = shares.get(&group.qgroupid) else {
                trace!(qgroup = %group.qgroupid, "no share for quota group");
                continue;
            };

            // Only the counters are written; a rollback or resize that landed
            // since the listing keeps its fields
            let qgroup = group.qgroupid.clone();
            let (referenced, exclusive) = (group.referenced_bytes, group.exclusive_bytes);
            let edit = Box::new(move |share: &mut Share| {
                if share.qgroup == qgroup {
                    share.referenced_bytes = referenced;
                    share.exclusive_bytes = exclusive;
                }
            });
            let current = match self.ctx.store.shares.modify(share.id, edit).await {
                Ok(current) => current,
                Err(Error::NotFound { .. }) => {
                    trace!(share = %share.name, "share removed while sampling");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if current.qgroup != group.qgroupid {
                debug!(
                    share = %share.name,
                    qgroup = %group.qgroupid,
                    "share moved to a new quota group while sampling"
                );
                continue;
            }

            samples.push(
                self.record_share_usage(share.id, referenced, exclusive)
                    .await?,
            );
        }

        debug!(pool = %pool.name, samples = samples.len(), "polled quota usage");
        Ok(samples)
    }

    pub async fn record_share_usage(
        &self,
        share_id: EntityId,
        referenced_bytes: u64,
        exclusive_bytes: u64,
    ) -> Result<ShareUsage> {
        let repo = &self.ctx.store.share_usage;
        if let Some(mut latest) = repo.latest_by_parent(share_id).await? {
            if latest.referenced_bytes == referenced_bytes
                && latest.exclusive_bytes == exclusive_bytes
            {
                latest.count += 1;
                latest.ts = Utc::now();
                metrics()
                    .samples
                    .with_label_values(&["share", "coalesced"])
                    .inc();
                return repo.update(latest).await;
            }
        }

        metrics()
            .samples
            .with_label_values(&["share", "inserted"])
            .inc();
        repo.create(ShareUsage {
            id: 0,
            share_id,
            referenced_bytes,
            exclusive_bytes,
            count: 1,
            ts: Utc::now(),
        })
        .await
    }

    pub async fn record_pool_usage(
        &self,
        pool_id: EntityId,
        size_bytes: u64,
        allocated_bytes: u64,
        free_bytes: u64,
    ) -> Result<PoolUsage> {
        let repo = &self.ctx.store.pool_usage;
        if let Some(mut latest) = repo.latest_by_parent(pool_id).await? {
            if (latest.size_bytes, latest.allocated_bytes, latest.free_bytes)
                == (size_bytes, allocated_bytes, free_bytes)
            {
                latest.count += 1;
                latest.ts = Utc::now();
                metrics()
                    .samples
                    .with_label_values(&["pool", "coalesced"])
                    .inc();
                return repo.update(latest).await;
            }
        }

        metrics()
            .samples
            .with_label_values(&["pool", "inserted"])
            .inc();
        repo.create(PoolUsage {
            id: 0,
            pool_id,
            size_bytes,
            allocated_bytes,
            free_bytes,
            count: 1,
            ts: Utc::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::RedundancyLevel;
    use crate::domain::ports::CommandOutput;
    use crate::testing::{qgroup_report, Fixture};

    #[tokio::test]
    async fn test_identical_readings_coalesce() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;

        fx.runner.on(
            &["btrfs", "qgroup", "show"],
            CommandOutput::success(&qgroup_report(&[
                ("0/5", 16384, 16384),
                (share.qgroup.as_str(), 1048576, 524288),
            ])),
        );

        fx.quota.poll_usage(pool.id).await.unwrap();
        let second = fx.quota.poll_usage(pool.id).await.unwrap();

        let rows = fx.ctx.store.share_usage.list_by_parent(share.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 2);
        assert_eq!(second[0], rows[0]);

        let share = fx.shares.get_share(share.id).await.unwrap();
        assert_eq!(share.referenced_bytes, 1048576);
        assert_eq!(share.exclusive_bytes, 524288);
    }

    #[tokio::test]
    async fn test_changed_reading_starts_new_row() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;

        fx.runner.on(
            &["btrfs", "qgroup", "show"],
            CommandOutput::success(&qgroup_report(&[(share.qgroup.as_str(), 100, 100)])),
        );
        fx.runner.on(
            &["btrfs", "qgroup", "show"],
            CommandOutput::success(&qgroup_report(&[(share.qgroup.as_str(), 200, 150)])),
        );
        fx.quota.poll_usage(pool.id).await.unwrap();
        fx.quota.poll_usage(pool.id).await.unwrap();
        fx.quota.poll_usage(pool.id).await.unwrap();

        let rows = fx.ctx.store.share_usage.list_by_parent(share.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].referenced_bytes, rows[0].count), (100, 1));
        assert_eq!((rows[1].referenced_bytes, rows[1].count), (200, 2));
    }

    #[tokio::test]
    async fn test_poll_keeps_concurrent_resize() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;
        fx.runner.on(
            &["btrfs", "qgroup", "show"],
            CommandOutput::success(&qgroup_report(&[(share.qgroup.as_str(), 4096, 2048)])),
        );
        let gate = fx.runner.gate(&["btrfs", "qgroup", "show"]);

        let poll = {
            let quota = fx.quota.clone();
            let pool_id = pool.id;
            tokio::spawn(async move { quota.poll_usage(pool_id).await })
        };
        gate.reached().await;
        fx.shares.resize_share(share.id, Some(1 << 30)).await.unwrap();
        gate.release();
        assert_eq!(poll.await.unwrap().unwrap().len(), 1);

        let share = fx.shares.get_share(share.id).await.unwrap();
        assert_eq!(share.size_limit, Some(1 << 30));
        assert_eq!(share.referenced_bytes, 4096);
    }

    #[tokio::test]
    async fn test_poll_skips_share_moved_to_new_qgroup() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;
        fx.runner.on(
            &["btrfs", "qgroup", "show"],
            CommandOutput::success(&qgroup_report(&[(share.qgroup.as_str(), 4096, 2048)])),
        );
        let gate = fx.runner.gate(&["btrfs", "qgroup", "show"]);

        let poll = {
            let quota = fx.quota.clone();
            let pool_id = pool.id;
            tokio::spawn(async move { quota.poll_usage(pool_id).await })
        };
        gate.reached().await;
        let snap = fx
            .snapshots
            .create_snapshot(share.id, "daily", false)
            .await
            .unwrap();
        let rolled = fx.snapshots.rollback(share.id, snap.id).await.unwrap();
        gate.release();
        assert!(poll.await.unwrap().unwrap().is_empty());

        let stored = fx.shares.get_share(share.id).await.unwrap();
        assert_eq!(stored.qgroup, rolled.qgroup);
        assert_eq!(stored.subvol_id, rolled.subvol_id);
        assert_eq!(stored.referenced_bytes, 0);
        assert!(fx
            .ctx
            .store
            .share_usage
            .list_by_parent(share.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_pool_usage_coalesces() {
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let before = fx.ctx.store.pool_usage.list_by_parent(pool.id).await.unwrap().len();

        fx.quota.record_pool_usage(pool.id, 10, 4, 6).await.unwrap();
        fx.quota.record_pool_usage(pool.id, 10, 4, 6).await.unwrap();
        fx.quota.record_pool_usage(pool.id, 10, 5, 5).await.unwrap();

        let rows = fx.ctx.store.pool_usage.list_by_parent(pool.id).await.unwrap();
        assert_eq!(rows.len(), before + 2);
        let last = rows.last().unwrap();
        assert_eq!((last.allocated_bytes, last.count), (5, 1));
        assert_eq!(rows[rows.len() - 2].count, 2);
    }
}
