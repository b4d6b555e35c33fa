//! Scrub Orchestrator
//!
//! Scrubs run in the tool's background mode, so there is no process to
//! supervise: progress, rate, ETA and error counters all come from
//! `btrfs scrub status -R`. A forced start restarts an active scrub and
//! reuses its row.

use crate::domain::model::{EntityId, OpStatus, Pool, ScrubErrors, ScrubOp};
use crate::domain::ports::Repository;
use crate::error::{Error, Result};
use crate::filesystem::{parse_scrub_status, ScrubState, ScrubStatus};
use crate::maintenance::{record_transition, MaintenanceHandler, MaintenanceKind, MaintenanceOp};
use crate::storage::{PoolLocks, StorageContext};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ScrubOrchestrator {
    ctx: StorageContext,
    rows: Arc<PoolLocks>,
}

impl ScrubOrchestrator {
    pub fn new(ctx: StorageContext) -> Self {
        Self {
            ctx,
            rows: PoolLocks::new(),
        }
    }

    pub async fn list(&self, pool_id: EntityId) -> Result<Vec<ScrubOp>> {
        self.ctx.store.scrubs.list_by_parent(pool_id).await
    }

    pub async fn current(&self, pool_id: EntityId) -> Result<Option<ScrubOp>> {
        Ok(self
            .list(pool_id)
            .await?
            .into_iter()
            .rev()
            .find(|op| !op.status.is_terminal()))
    }

    async fn status(&self, pool: &Pool) -> Result<ScrubStatus> {
        let output = self
            .ctx
            .run(self.ctx.commands.scrub_status(&pool.mount_point))
            .await?;
        parse_scrub_status(&output.stdout)
    }

    async fn cancel_command(&self, pool: &Pool) {
        if let Err(e) = self
            .ctx
            .run(self.ctx.commands.scrub_cancel(&pool.mount_point))
            .await
        {
            debug!(pool = %pool.name, error = %e, "scrub cancel reported an error");
        }
    }

    /// Start a background scrub. A scrub the tool reports as running is a
    /// conflict unless `force` is set, in which case it is restarted.
    pub async fn start(&self, pool_id: EntityId, force: bool) -> Result<ScrubOp> {
        let _pool_guard = self.ctx.locks.lock(pool_id).await;
        let _row_guard = self.rows.lock(pool_id).await;
        let pool = self.ctx.pool(pool_id).await?;

        let status = self.status(&pool).await?;
        let mut existing = self.current(pool_id).await?;

        // A row the tool no longer backs is settled first
        if let Some(op) = existing.take() {
            if status.is_running() || matches!(status.state, ScrubState::NotStarted) {
                existing = Some(op);
            } else {
                self.advance(op, &status).await?;
            }
        }

        if !force && (status.is_running() || existing.is_some()) {
            return Err(Error::StateConflict(format!(
                "a scrub is already active on pool {}",
                pool.name
            )));
        }

        if status.is_running() {
            info!(pool = %pool.name, "restarting active scrub");
            self.cancel_command(&pool).await;
        }
        self.ctx
            .run(self.ctx.commands.scrub_start(&pool.mount_point, force))
            .await?;

        let now = Utc::now();
        let op = match existing {
            Some(mut op) => {
                op.status = OpStatus::Started;
                op.bytes_scrubbed = 0;
                op.total_bytes = None;
                op.duration_secs = 0;
                op.rate_bps = 0;
                op.time_left_secs = None;
                op.eta = None;
                op.errors = ScrubErrors::default();
                op.message = "restarted".to_string();
                op.cancel_requested = false;
                op.started_at = now;
                self.ctx.store.scrubs.update(op).await?
            }
            None => {
                self.ctx
                    .store
                    .scrubs
                    .create(ScrubOp {
                        id: 0,
                        pool_id,
                        status: OpStatus::Started,
                        handle: pool.uuid.clone(),
                        bytes_scrubbed: 0,
                        total_bytes: None,
                        duration_secs: 0,
                        rate_bps: 0,
                        time_left_secs: None,
                        eta: None,
                        errors: ScrubErrors::default(),
                        message: String::new(),
                        cancel_requested: false,
                        started_at: now,
                        ended_at: None,
                    })
                    .await?
            }
        };
        record_transition(MaintenanceKind::Scrub, OpStatus::Started);

        info!(pool = %pool.name, op_id = op.id, force, "scrub started");
        Ok(op)
    }

    pub async fn poll(&self, pool_id: EntityId) -> Result<Option<ScrubOp>> {
        let _row_guard = self.rows.lock(pool_id).await;
        match self.current(pool_id).await? {
            Some(op) => {
                let pool = self.ctx.pool(pool_id).await?;
                let status = self.status(&pool).await?;
                self.advance(op, &status).await.map(Some)
            }
            None => self.ctx.store.scrubs.latest_by_parent(pool_id).await,
        }
    }

    pub async fn cancel(&self, pool_id: EntityId) -> Result<ScrubOp> {
        let _row_guard = self.rows.lock(pool_id).await;
        let pool = self.ctx.pool(pool_id).await?;
        let mut op = self.current(pool_id).await?.ok_or_else(|| {
            Error::StateConflict(format!("no scrub in progress on pool {}", pool.name))
        })?;

        if !op.cancel_requested {
            op.cancel_requested = true;
            op = self.ctx.store.scrubs.update(op).await?;
        }
        self.cancel_command(&pool).await;
        info!(pool = %pool.name, op_id = op.id, "scrub cancel requested");

        let status = self.status(&pool).await?;
        self.advance(op, &status).await
    }

    async fn advance(&self, mut op: ScrubOp, status: &ScrubStatus) -> Result<ScrubOp> {
        op.bytes_scrubbed = status.bytes_scrubbed;
        op.total_bytes = status.total_to_scrub;
        op.duration_secs = status.duration_secs;
        op.rate_bps = status.rate_bps();
        op.time_left_secs = status.time_left_secs();
        op.eta = op
            .time_left_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        op.errors = status.errors;

        match status.state {
            ScrubState::Running => {
                if op.status == OpStatus::Started {
                    op.status = OpStatus::Running;
                    record_transition(MaintenanceKind::Scrub, OpStatus::Running);
                }
                self.ctx.store.scrubs.update(op).await
            }
            ScrubState::NotStarted if op.cancel_requested => {
                self.finish(op, OpStatus::Cancelled, "cancelled".into()).await
            }
            ScrubState::NotStarted => self.ctx.store.scrubs.update(op).await,
            ScrubState::Finished => {
                op.time_left_secs = Some(0);
                let message = match status.errors.uncorrectable_errors {
                    0 => String::new(),
                    n => format!("finished with {} uncorrectable errors", n),
                };
                if !message.is_empty() {
                    warn!(pool_id = op.pool_id, op_id = op.id, "{}", message);
                }
                self.finish(op, OpStatus::Finished, message).await
            }
            ScrubState::Aborted | ScrubState::Interrupted if op.cancel_requested => {
                self.finish(op, OpStatus::Cancelled, "cancelled".into()).await
            }
            ScrubState::Aborted => {
                self.finish(op, OpStatus::Failed, "scrub aborted".into()).await
            }
            ScrubState::Interrupted => {
                self.finish(op, OpStatus::Failed, "scrub interrupted".into()).await
            }
        }
    }

    async fn finish(&self, mut op: ScrubOp, status: OpStatus, message: String) -> Result<ScrubOp> {
        op.status = status;
        op.message = message;
        op.ended_at = Some(Utc::now());
        op.eta = None;
        let op = self.ctx.store.scrubs.update(op).await?;
        record_transition(MaintenanceKind::Scrub, status);
        info!(pool_id = op.pool_id, op_id = op.id, %status, "scrub {}", status);
        Ok(op)
    }
}

#[async_trait]
impl MaintenanceHandler for ScrubOrchestrator {
    fn kind(&self) -> MaintenanceKind {
        MaintenanceKind::Scrub
    }

    async fn start(&self, pool_id: EntityId, force: bool) -> Result<MaintenanceOp> {
        ScrubOrchestrator::start(self, pool_id, force)
            .await
            .map(MaintenanceOp::Scrub)
    }

    async fn poll(&self, pool_id: EntityId) -> Result<Option<MaintenanceOp>> {
        Ok(ScrubOrchestrator::poll(self, pool_id)
            .await?
            .map(MaintenanceOp::Scrub))
    }

    async fn cancel(&self, pool_id: EntityId) -> Result<MaintenanceOp> {
        ScrubOrchestrator::cancel(self, pool_id)
            .await
            .map(MaintenanceOp::Scrub)
    }

    async fn active(&self, pool_id: EntityId) -> Result<bool> {
        Ok(self.current(pool_id).await?.is_some())
    }
}
