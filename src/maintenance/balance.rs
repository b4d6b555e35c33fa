//! Balance Orchestrator
//!
//! Runs `btrfs balance start` as a supervised process and tracks it through a
//! `BalanceOp` row. The row is authoritative: after a restart, with no
//! process handle left, progress is reconstructed from `balance status`.

use crate::domain::model::{BalanceOp, EntityId, OpOrigin, OpStatus, Pool, RedundancyLevel};
use crate::domain::ports::{ProcessExit, Repository, SupervisedProcess};
use crate::error::{Error, Result};
use crate::filesystem::{parse_balance_status, BalanceStatus};
use crate::maintenance::{record_transition, MaintenanceHandler, MaintenanceKind, MaintenanceOp};
use crate::storage::{PoolLocks, StorageContext};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct BalanceOrchestrator {
    ctx: StorageContext,
    /// Supervised `balance start` processes keyed by operation id
    processes: DashMap<EntityId, Box<dyn SupervisedProcess>>,
    /// Serializes row updates per pool between poll and cancel
    rows: Arc<PoolLocks>,
}

impl BalanceOrchestrator {
    pub fn new(ctx: StorageContext) -> Self {
        Self {
            ctx,
            processes: DashMap::new(),
            rows: PoolLocks::new(),
        }
    }

    /// All balances of a pool, oldest first
    pub async fn list(&self, pool_id: EntityId) -> Result<Vec<BalanceOp>> {
        self.ctx.store.balances.list_by_parent(pool_id).await
    }

    /// The pool's non-terminal balance, if any
    pub async fn current(&self, pool_id: EntityId) -> Result<Option<BalanceOp>> {
        Ok(self
            .list(pool_id)
            .await?
            .into_iter()
            .rev()
            .find(|op| !op.status.is_terminal()))
    }

    async fn status(&self, pool: &Pool) -> Result<BalanceStatus> {
        let output = self
            .ctx
            .run(self.ctx.commands.balance_status(&pool.mount_point))
            .await?;
        parse_balance_status(&output.stdout)
    }

    /// User-initiated full balance
    pub async fn start(&self, pool_id: EntityId, force: bool) -> Result<BalanceOp> {
        self.start_with(pool_id, OpOrigin::User, None, force).await
    }

    /// Launch a balance. With `force`, a non-terminal row whose balance is no
    /// longer running is closed as failed; an actually running balance is
    /// never overridden.
    pub async fn start_with(
        &self,
        pool_id: EntityId,
        origin: OpOrigin,
        convert_to: Option<RedundancyLevel>,
        force: bool,
    ) -> Result<BalanceOp> {
        let _pool_guard = self.ctx.locks.lock(pool_id).await;
        let _row_guard = self.rows.lock(pool_id).await;
        let pool = self.ctx.pool(pool_id).await?;

        if let Some(existing) = self.current(pool_id).await? {
            if !force {
                return Err(Error::StateConflict(format!(
                    "balance {} is already {} on pool {}",
                    existing.id, existing.status, pool.name
                )));
            }
            if self.status(&pool).await?.is_active() {
                return Err(Error::StateConflict(format!(
                    "balance is still running on pool {}",
                    pool.name
                )));
            }
            if let Some((_, mut stale)) = self.processes.remove(&existing.id) {
                stale.terminate().await?;
            }
            warn!(pool = %pool.name, op_id = existing.id, "closing stale balance record");
            self.finish(existing, OpStatus::Failed, "superseded by a forced restart".into())
                .await?;
        } else if self.status(&pool).await?.is_active() {
            return Err(Error::StateConflict(format!(
                "an untracked balance is running on pool {}",
                pool.name
            )));
        }

        let argv = self.ctx.commands.balance_start(&pool.mount_point, convert_to);
        let process = self.ctx.runner.spawn(argv).await?;
        let handle = process.pid().map(|pid| format!("pid:{}", pid));

        let op = self
            .ctx
            .store
            .balances
            .create(BalanceOp {
                id: 0,
                pool_id,
                status: OpStatus::Started,
                handle,
                origin,
                convert_to,
                percent_done: 0,
                message: String::new(),
                cancel_requested: false,
                started_at: Utc::now(),
                ended_at: None,
            })
            .await?;
        self.processes.insert(op.id, process);
        record_transition(MaintenanceKind::Balance, OpStatus::Started);

        info!(pool = %pool.name, op_id = op.id, ?origin, ?convert_to, "balance started");
        Ok(op)
    }

    /// Advance the pool's current balance. Returns the latest row.
    pub async fn poll(&self, pool_id: EntityId) -> Result<Option<BalanceOp>> {
        let _row_guard = self.rows.lock(pool_id).await;
        match self.current(pool_id).await? {
            Some(op) => self.advance(op).await.map(Some),
            None => self.ctx.store.balances.latest_by_parent(pool_id).await,
        }
    }

    /// Ask the tool to cancel. The row turns `cancelled` only once the
    /// balance is confirmed stopped, possibly on a later poll.
    pub async fn cancel(&self, pool_id: EntityId) -> Result<BalanceOp> {
        let _row_guard = self.rows.lock(pool_id).await;
        let pool = self.ctx.pool(pool_id).await?;
        let mut op = self.current(pool_id).await?.ok_or_else(|| {
            Error::StateConflict(format!("no balance in progress on pool {}", pool.name))
        })?;

        if !op.cancel_requested {
            op.cancel_requested = true;
            op = self.ctx.store.balances.update(op).await?;
        }

        if let Err(e) = self
            .ctx
            .run(self.ctx.commands.balance_cancel(&pool.mount_point))
            .await
        {
            // Not running is fine; the status check below settles the row
            debug!(pool = %pool.name, error = %e, "balance cancel reported an error");
        }
        info!(pool = %pool.name, op_id = op.id, "balance cancel requested");

        self.advance(op).await
    }

    async fn advance(&self, mut op: BalanceOp) -> Result<BalanceOp> {
        let pool = self.ctx.pool(op.pool_id).await?;

        let mut supervised = false;
        if let Some((id, mut process)) = self.processes.remove(&op.id) {
            match process.try_exit().await? {
                Some(exit) => return self.conclude(op, exit).await,
                None => {
                    self.processes.insert(id, process);
                    supervised = true;
                }
            }
        }

        let status = self.status(&pool).await?;
        if status.is_active() {
            if let Some(percent) = status.percent_done() {
                op.percent_done = op.percent_done.max(percent);
            }
            if let (Some(done), Some(total)) = (status.chunks_balanced, status.chunks_total) {
                op.message = format!("{} out of about {} chunks balanced", done, total);
            }
            if op.status == OpStatus::Started {
                op.status = OpStatus::Running;
                record_transition(MaintenanceKind::Balance, OpStatus::Running);
                debug!(pool = %pool.name, op_id = op.id, "balance running");
            }
            return self.ctx.store.balances.update(op).await;
        }

        if supervised {
            // Launched but not yet registered, or finishing; wait for the exit
            return Ok(op);
        }

        // No process handle (daemon restarted) and nothing running
        if op.cancel_requested {
            self.finish(op, OpStatus::Cancelled, "cancelled".into()).await
        } else {
            op.percent_done = 100;
            self.finish(op, OpStatus::Finished, String::new()).await
        }
    }

    async fn conclude(&self, mut op: BalanceOp, exit: ProcessExit) -> Result<BalanceOp> {
        if op.cancel_requested {
            return self.finish(op, OpStatus::Cancelled, "cancelled".into()).await;
        }
        if exit.succeeded() {
            op.percent_done = 100;
            if let Some(level) = op.convert_to {
                let mut pool = self.ctx.pool(op.pool_id).await?;
                pool.redundancy = level;
                self.ctx.store.pools.update(pool).await?;
            }
            return self.finish(op, OpStatus::Finished, String::new()).await;
        }

        let message = if exit.stderr_tail.is_empty() {
            format!("balance exited with code {}", exit.return_code)
        } else {
            format!(
                "balance exited with code {}: {}",
                exit.return_code,
                exit.stderr_tail.join("\n")
            )
        };
        self.finish(op, OpStatus::Failed, message).await
    }

    /// Write a terminal status. Called once per row.
    async fn finish(&self, mut op: BalanceOp, status: OpStatus, message: String) -> Result<BalanceOp> {
        op.status = status;
        op.message = message;
        op.ended_at = Some(Utc::now());
        self.processes.remove(&op.id);
        let op = self.ctx.store.balances.update(op).await?;
        record_transition(MaintenanceKind::Balance, status);
        info!(pool_id = op.pool_id, op_id = op.id, %status, "balance {}", status);
        Ok(op)
    }
}

#[async_trait]
impl MaintenanceHandler for BalanceOrchestrator {
    fn kind(&self) -> MaintenanceKind {
        MaintenanceKind::Balance
    }

    async fn start(&self, pool_id: EntityId, force: bool) -> Result<MaintenanceOp> {
        BalanceOrchestrator::start(self, pool_id, force)
            .await
            .map(MaintenanceOp::Balance)
    }

    async fn poll(&self, pool_id: EntityId) -> Result<Option<MaintenanceOp>> {
        Ok(BalanceOrchestrator::poll(self, pool_id)
            .await?
            .map(MaintenanceOp::Balance))
    }

    async fn cancel(&self, pool_id: EntityId) -> Result<MaintenanceOp> {
        BalanceOrchestrator::cancel(self, pool_id)
            .await
            .map(MaintenanceOp::Balance)
    }

    async fn active(&self, pool_id: EntityId) -> Result<bool> {
        Ok(self.current(pool_id).await?.is_some())
    }
}
