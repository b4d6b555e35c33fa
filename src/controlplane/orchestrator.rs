//! Main Orchestrator
//!
//! Wires the managers and maintenance handlers around one shared
//! `StorageContext` and exposes them to the daemon and request layer:
//! - Pool, share and snapshot lifecycle
//! - Quota accounting
//! - Balance and scrub dispatch, polling and usage sampling

use crate::domain::model::{BalanceOp, EntityId, OpOrigin, RedundancyLevel, ScrubOp};
use crate::domain::ports::Repository;
use crate::error::Result;
use crate::maintenance::{
    BalanceOrchestrator, MaintenanceDispatch, MaintenanceHandler, OperationPoller,
    ScrubOrchestrator,
};
use crate::sampler::{HostProbe, UsageSampler};
use crate::storage::{PoolManager, QuotaEngine, ShareManager, SnapshotManager, StorageContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// =============================================================================
// Orchestrator
// =============================================================================

/// Storage core facade
pub struct Orchestrator {
    ctx: StorageContext,
    pub pools: Arc<PoolManager>,
    pub shares: Arc<ShareManager>,
    pub snapshots: Arc<SnapshotManager>,
    pub quota: Arc<QuotaEngine>,
    pub balance: Arc<BalanceOrchestrator>,
    pub scrub: Arc<ScrubOrchestrator>,
    /// Handler table shared with the operation poller
    pub dispatch: Arc<MaintenanceDispatch>,
}

impl Orchestrator {
    pub fn new(ctx: StorageContext) -> Self {
        let snapshots = Arc::new(SnapshotManager::new(ctx.clone()));
        let quota = Arc::new(QuotaEngine::new(ctx.clone()));
        let balance = Arc::new(BalanceOrchestrator::new(ctx.clone()));
        let scrub = Arc::new(ScrubOrchestrator::new(ctx.clone()));
        let pools = Arc::new(PoolManager::new(ctx.clone(), quota.clone(), balance.clone()));
        let shares = Arc::new(ShareManager::new(ctx.clone(), snapshots.clone()));

        let handlers: [Arc<dyn MaintenanceHandler>; 2] = [balance.clone(), scrub.clone()];
        let dispatch = Arc::new(MaintenanceDispatch::new(handlers));

        info!(
            kinds = ?dispatch.kinds().collect::<Vec<_>>(),
            "orchestrator initialized"
        );

        Self {
            ctx,
            pools,
            shares,
            snapshots,
            quota,
            balance,
            scrub,
            dispatch,
        }
    }

    pub fn context(&self) -> &StorageContext {
        &self.ctx
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    pub async fn start_balance(
        &self,
        pool_id: EntityId,
        convert_to: Option<RedundancyLevel>,
        force: bool,
    ) -> Result<BalanceOp> {
        self.balance
            .start_with(pool_id, OpOrigin::User, convert_to, force)
            .await
    }

    pub async fn start_scrub(&self, pool_id: EntityId, force: bool) -> Result<ScrubOp> {
        self.scrub.start(pool_id, force).await
    }

    pub async fn list_balances(&self, pool_id: EntityId) -> Result<Vec<BalanceOp>> {
        self.balance.list(pool_id).await
    }

    pub async fn list_scrubs(&self, pool_id: EntityId) -> Result<Vec<ScrubOp>> {
        self.scrub.list(pool_id).await
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    pub fn operation_poller(&self, interval: Duration) -> OperationPoller {
        OperationPoller::new(self.ctx.store.clone(), self.dispatch.clone(), interval)
    }

    pub fn usage_sampler(&self, probe: HostProbe, interval: Duration) -> UsageSampler {
        UsageSampler::new(
            self.ctx.store.clone(),
            self.pools.clone(),
            self.quota.clone(),
            probe,
            interval,
        )
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Inventory summary across all pools
    pub async fn status(&self) -> Result<OrchestratorStatus> {
        let store = &self.ctx.store;
        let pools = store.pools.list().await?;
        let disks = store.disks.list().await?;

        let mut status = OrchestratorStatus {
            pool_count: pools.len() as u64,
            disk_count: disks.len() as u64,
            unowned_disks: disks.iter().filter(|d| d.pool_id.is_none()).count() as u64,
            share_count: store.shares.list().await?.len() as u64,
            snapshot_count: store.snapshots.list().await?.len() as u64,
            total_capacity_bytes: pools.iter().map(|p| p.size_bytes).sum(),
            free_capacity_bytes: pools.iter().map(|p| p.free_bytes).sum(),
            ..Default::default()
        };
        for pool in &pools {
            if self.balance.current(pool.id).await?.is_some() {
                status.active_balances += 1;
            }
            if self.scrub.current(pool.id).await?.is_some() {
                status.active_scrubs += 1;
            }
        }
        Ok(status)
    }
}

/// Orchestrator status summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub pool_count: u64,
    pub disk_count: u64,
    pub unowned_disks: u64,
    pub share_count: u64,
    pub snapshot_count: u64,
    pub active_balances: u64,
    pub active_scrubs: u64,
    pub total_capacity_bytes: u64,
    pub free_capacity_bytes: u64,
}
