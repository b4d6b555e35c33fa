//! Pool Manager
//!
//! Translates desired disk membership and redundancy level into mkfs,
//! device add and device delete invocations, and reconciles persisted pool
//! state against what `btrfs filesystem show` reports. A membership mismatch
//! is surfaced to the caller, never written over.

use crate::domain::model::{Disk, EntityId, OpOrigin, Pool, RedundancyLevel};
use crate::domain::ports::Repository;
use crate::error::{Error, Result};
use crate::filesystem::{parse_filesystem_show, parse_filesystem_usage, FilesystemShow, FilesystemUsage};
use crate::maintenance::BalanceOrchestrator;
use crate::storage::{validate_name, QuotaEngine, StorageContext};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Lock key serializing pool creation (pool ids start at 1)
const CREATE_LOCK: EntityId = 0;

// =============================================================================
// Membership
// =============================================================================

/// Difference between persisted and reported member devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDrift {
    /// Persisted members the tool no longer reports
    pub missing: Vec<String>,
    /// Reported devices with no persisted membership
    pub unexpected: Vec<String>,
}

impl MembershipDrift {
    pub fn between(expected: &[String], show: &FilesystemShow) -> Self {
        let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
        let reported: BTreeSet<&str> = show.devices.iter().map(|d| d.path.as_str()).collect();
        Self {
            missing: expected.difference(&reported).map(|s| s.to_string()).collect(),
            unexpected: reported.difference(&expected).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    pub fn into_error(self, pool: &str) -> Error {
        Error::Inconsistent {
            pool: pool.to_string(),
            missing: self.missing,
            unexpected: self.unexpected,
        }
    }
}

/// Result of reconciling a pool against the filesystem report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolReport {
    pub pool: Pool,
    pub usage: FilesystemUsage,
    pub drift: Option<MembershipDrift>,
}

// =============================================================================
// Pool Manager
// =============================================================================

pub struct PoolManager {
    ctx: StorageContext,
    quota: Arc<QuotaEngine>,
    balance: Arc<BalanceOrchestrator>,
}

impl PoolManager {
    pub fn new(
        ctx: StorageContext,
        quota: Arc<QuotaEngine>,
        balance: Arc<BalanceOrchestrator>,
    ) -> Self {
        Self {
            ctx,
            quota,
            balance,
        }
    }

    /// Add an unowned disk to the inventory
    pub async fn register_disk(&self, name: &str, serial: &str) -> Result<Disk> {
        if name.is_empty() || serial.is_empty() {
            return Err(Error::Validation("disk name and serial are required".into()));
        }
        let disks = self.ctx.store.disks.list().await?;
        if disks.iter().any(|d| d.name == name || d.serial == serial) {
            return Err(Error::Validation(format!(
                "disk {} ({}) is already registered",
                name, serial
            )));
        }
        self.ctx.store.disks.create(Disk::new(name, serial)).await
    }

    pub async fn list_disks(&self) -> Result<Vec<Disk>> {
        self.ctx.store.disks.list().await
    }

    pub async fn get_pool(&self, pool_id: EntityId) -> Result<Pool> {
        self.ctx.pool(pool_id).await
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>> {
        self.ctx.store.pools.list().await
    }

    /// Fetch the given disks, requiring each to exist and be unowned
    async fn unowned_disks(&self, disk_ids: &[EntityId]) -> Result<Vec<Disk>> {
        let unique: BTreeSet<_> = disk_ids.iter().collect();
        if unique.len() != disk_ids.len() {
            return Err(Error::Validation("disk list contains duplicates".into()));
        }
        let mut disks = Vec::with_capacity(disk_ids.len());
        for id in disk_ids {
            let disk = self.ctx.store.disks.require(*id).await?;
            if let Some(owner) = disk.pool_id {
                return Err(Error::Validation(format!(
                    "disk {} already belongs to pool {}",
                    disk.name, owner
                )));
            }
            disks.push(disk);
        }
        Ok(disks)
    }

    async fn show(&self, mount_point: &str) -> Result<FilesystemShow> {
        let output = self
            .ctx
            .run(self.ctx.commands.filesystem_show(mount_point))
            .await?;
        parse_filesystem_show(&output.stdout)
    }

    /// Persist membership details for `disks` as members of `pool_id`
    async fn adopt(&self, pool_id: EntityId, disks: Vec<Disk>, show: &FilesystemShow) -> Result<()> {
        for mut disk in disks {
            let path = disk.device_path();
            if let Some(entry) = show.devices.iter().find(|d| d.path == path) {
                disk.devid = Some(entry.devid);
                disk.size_bytes = entry.size_bytes;
                disk.allocated_bytes = entry.used_bytes;
            }
            disk.pool_id = Some(pool_id);
            self.ctx.store.disks.update(disk).await?;
        }
        Ok(())
    }

    async fn release(&self, disks: Vec<Disk>) -> Result<()> {
        for mut disk in disks {
            disk.pool_id = None;
            disk.devid = None;
            disk.allocated_bytes = 0;
            self.ctx.store.disks.update(disk).await?;
        }
        Ok(())
    }

    /// Create a filesystem over the given disks, mount it and enable quotas.
    /// All validation happens before the first command runs.
    pub async fn create_pool(
        &self,
        name: &str,
        disk_ids: &[EntityId],
        redundancy: RedundancyLevel,
    ) -> Result<Pool> {
        let _guard = self.ctx.locks.lock(CREATE_LOCK).await;

        validate_name("pool", name, &[])?;
        if disk_ids.len() < redundancy.min_disks() {
            return Err(Error::Validation(format!(
                "{} requires at least {} disks, got {}",
                redundancy,
                redundancy.min_disks(),
                disk_ids.len()
            )));
        }
        if self
            .ctx
            .store
            .pools
            .list()
            .await?
            .iter()
            .any(|p| p.name == name)
        {
            return Err(Error::Validation(format!("pool {} already exists", name)));
        }
        let disks = self.unowned_disks(disk_ids).await?;
        let devices: Vec<String> = disks.iter().map(Disk::device_path).collect();

        let mount_point = self.ctx.layout.pool_mount(name);
        self.ctx
            .run(self.ctx.commands.mkfs(name, redundancy, &devices))
            .await?;
        self.ctx
            .ensure_mounted(&devices[0], &mount_point, None)
            .await?;
        self.ctx
            .run(self.ctx.commands.quota_enable(&mount_point))
            .await?;

        let show = self.show(&mount_point).await?;
        let drift = MembershipDrift::between(&devices, &show);
        if !drift.is_empty() {
            warn!(pool = name, ?drift, "new filesystem membership differs from request");
            return Err(drift.into_error(name));
        }

        let usage = self.usage(&mount_point).await?;
        let pool = self
            .ctx
            .store
            .pools
            .create(Pool {
                id: 0,
                name: name.to_string(),
                uuid: Some(show.uuid.clone()),
                redundancy,
                disk_ids: disk_ids.to_vec(),
                mount_point,
                size_bytes: usage.device_size,
                allocated_bytes: usage.device_allocated,
                free_bytes: usage.free_estimated,
                created_at: Utc::now(),
            })
            .await?;
        self.adopt(pool.id, disks, &show).await?;

        info!(pool = %pool.name, id = pool.id, %redundancy, disks = disk_ids.len(), "pool created");
        Ok(pool)
    }

    async fn usage(&self, mount_point: &str) -> Result<FilesystemUsage> {
        let output = self
            .ctx
            .run(self.ctx.commands.filesystem_usage(mount_point))
            .await?;
        parse_filesystem_usage(&output.stdout)
    }

    /// Add member disks, optionally converting the pool's profile with a
    /// user-initiated balance once the devices are in place
    pub async fn add_disks(
        &self,
        pool_id: EntityId,
        disk_ids: &[EntityId],
        convert_to: Option<RedundancyLevel>,
    ) -> Result<Pool> {
        if disk_ids.is_empty() {
            return Err(Error::Validation("no disks to add".into()));
        }

        let pool = {
            let _guard = self.ctx.locks.lock(pool_id).await;
            let mut pool = self.ctx.pool(pool_id).await?;
            let disks = self.unowned_disks(disk_ids).await?;
            let total = pool.disk_ids.len() + disks.len();
            if let Some(level) = convert_to {
                if total < level.min_disks() {
                    return Err(Error::Validation(format!(
                        "{} requires at least {} disks, pool would have {}",
                        level,
                        level.min_disks(),
                        total
                    )));
                }
            }

            let new_devices: Vec<String> = disks.iter().map(Disk::device_path).collect();
            self.ctx
                .run(self.ctx.commands.device_add(&new_devices, &pool.mount_point))
                .await?;

            let mut expected: Vec<String> = self
                .ctx
                .pool_disks(&pool)
                .await?
                .iter()
                .map(Disk::device_path)
                .collect();
            expected.extend(new_devices);
            let show = self.show(&pool.mount_point).await?;
            let drift = MembershipDrift::between(&expected, &show);
            if !drift.is_empty() {
                warn!(pool = %pool.name, ?drift, "membership differs after device add");
                return Err(drift.into_error(&pool.name));
            }

            self.adopt(pool.id, disks, &show).await?;
            pool.disk_ids.extend_from_slice(disk_ids);
            info!(pool = %pool.name, added = disk_ids.len(), "disks added");
            self.ctx.store.pools.update(pool).await?
        };

        if let Some(level) = convert_to {
            self.balance
                .start_with(pool.id, OpOrigin::User, Some(level), false)
                .await?;
        }
        Ok(pool)
    }

    /// Remove member disks, then redistribute data with a system-initiated
    /// balance
    pub async fn remove_disks(&self, pool_id: EntityId, disk_ids: &[EntityId]) -> Result<Pool> {
        if disk_ids.is_empty() {
            return Err(Error::Validation("no disks to remove".into()));
        }

        let pool = {
            let _guard = self.ctx.locks.lock(pool_id).await;
            let mut pool = self.ctx.pool(pool_id).await?;

            if let Some(stranger) = disk_ids.iter().find(|id| !pool.disk_ids.contains(id)) {
                return Err(Error::Validation(format!(
                    "disk {} is not a member of pool {}",
                    stranger, pool.name
                )));
            }
            let remaining: Vec<EntityId> = pool
                .disk_ids
                .iter()
                .copied()
                .filter(|id| !disk_ids.contains(id))
                .collect();
            let minimum = pool.redundancy.min_disks().max(1);
            if remaining.len() < minimum {
                return Err(Error::Validation(format!(
                    "{} requires at least {} disks, {} would remain",
                    pool.redundancy,
                    minimum,
                    remaining.len()
                )));
            }

            let mut removed = Vec::with_capacity(disk_ids.len());
            for id in disk_ids {
                removed.push(self.ctx.store.disks.require(*id).await?);
            }
            let devices: Vec<String> = removed.iter().map(Disk::device_path).collect();
            self.ctx
                .run(self.ctx.commands.device_delete(&devices, &pool.mount_point))
                .await?;

            pool.disk_ids = remaining;
            let expected: Vec<String> = self
                .ctx
                .pool_disks(&pool)
                .await?
                .iter()
                .map(Disk::device_path)
                .collect();
            let show = self.show(&pool.mount_point).await?;
            let drift = MembershipDrift::between(&expected, &show);
            if !drift.is_empty() {
                warn!(pool = %pool.name, ?drift, "membership differs after device delete");
                return Err(drift.into_error(&pool.name));
            }

            self.release(removed).await?;
            let members = self.ctx.pool_disks(&pool).await?;
            self.adopt(pool.id, members, &show).await?;
            info!(pool = %pool.name, removed = disk_ids.len(), "disks removed");
            self.ctx.store.pools.update(pool).await?
        };

        match self
            .balance
            .start_with(pool.id, OpOrigin::System, None, false)
            .await
        {
            Ok(_) => {}
            Err(Error::StateConflict(reason)) => {
                // An active balance already redistributes the data
                warn!(pool = %pool.name, %reason, "post-removal balance not started");
            }
            Err(e) => return Err(e),
        }
        Ok(pool)
    }

    /// Delete an empty, idle pool and release its disks
    pub async fn delete_pool(&self, pool_id: EntityId) -> Result<()> {
        {
            let _guard = self.ctx.locks.lock(pool_id).await;
            let pool = self.ctx.pool(pool_id).await?;

            let shares = self.ctx.store.shares.list_by_parent(pool_id).await?;
            if !shares.is_empty() {
                return Err(Error::StateConflict(format!(
                    "pool {} still has {} shares",
                    pool.name,
                    shares.len()
                )));
            }
            let balancing = self
                .ctx
                .store
                .balances
                .list_by_parent(pool_id)
                .await?
                .iter()
                .any(|op| !op.status.is_terminal());
            let scrubbing = self
                .ctx
                .store
                .scrubs
                .list_by_parent(pool_id)
                .await?
                .iter()
                .any(|op| !op.status.is_terminal());
            if balancing || scrubbing {
                return Err(Error::StateConflict(format!(
                    "pool {} has maintenance in progress",
                    pool.name
                )));
            }

            self.ctx.ensure_unmounted(&pool.mount_point).await?;
            let disks = self.ctx.pool_disks(&pool).await?;
            self.release(disks).await?;
            self.ctx.store.pools.delete(pool_id).await?;
            info!(pool = %pool.name, "pool deleted");
        }
        self.ctx.locks.forget(pool_id);
        Ok(())
    }

    /// Re-read membership and usage, update counters and record a pool usage
    /// sample. Drift is reported, not corrected. Runs without the pool lock,
    /// so only counter fields are written and membership is left to the
    /// structural operations.
    pub async fn refresh_state(&self, pool_id: EntityId) -> Result<PoolReport> {
        let pool = self.ctx.pool(pool_id).await?;
        let show = self.show(&pool.mount_point).await?;
        let usage = self.usage(&pool.mount_point).await?;

        let members = self.ctx.pool_disks(&pool).await?;
        let expected: Vec<String> = members.iter().map(Disk::device_path).collect();
        let drift = MembershipDrift::between(&expected, &show);
        if !drift.is_empty() {
            warn!(
                pool = %pool.name,
                missing = ?drift.missing,
                unexpected = ?drift.unexpected,
                "pool membership drift detected"
            );
        }

        for disk in members {
            let path = disk.device_path();
            let Some(entry) = show.devices.iter().find(|d| d.path == path) else {
                continue;
            };
            if disk.devid == Some(entry.devid) && disk.allocated_bytes == entry.used_bytes {
                continue;
            }
            let (devid, size, used) = (entry.devid, entry.size_bytes, entry.used_bytes);
            let edit = Box::new(move |disk: &mut Disk| {
                // Released since the read
                if disk.pool_id != Some(pool_id) {
                    return;
                }
                disk.devid = Some(devid);
                disk.size_bytes = size;
                disk.allocated_bytes = used;
            });
            match self.ctx.store.disks.modify(disk.id, edit).await {
                Ok(_) | Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let uuid = show.uuid.clone();
        let counters = usage;
        let pool = self
            .ctx
            .store
            .pools
            .modify(
                pool_id,
                Box::new(move |pool: &mut Pool| {
                    pool.uuid = Some(uuid);
                    pool.size_bytes = counters.device_size;
                    pool.allocated_bytes = counters.device_allocated;
                    pool.free_bytes = counters.free_estimated;
                }),
            )
            .await?;
        self.quota
            .record_pool_usage(
                pool.id,
                usage.device_size,
                usage.device_allocated,
                usage.free_estimated,
            )
            .await?;

        Ok(PoolReport {
            pool,
            usage,
            drift: (!drift.is_empty()).then_some(drift),
        })
    }
}
