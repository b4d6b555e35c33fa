//! Operation Poller
//!
//! Background task that advances every non-terminal balance and scrub row
//! on a fixed interval until it reaches a terminal status.

use crate::domain::ports::Repository;
use crate::error::Result;
use crate::maintenance::MaintenanceDispatch;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct OperationPoller {
    store: Store,
    dispatch: Arc<MaintenanceDispatch>,
    interval: Duration,
}

impl OperationPoller {
    pub fn new(store: Store, dispatch: Arc<MaintenanceDispatch>, interval: Duration) -> Self {
        Self {
            store,
            dispatch,
            interval,
        }
    }

    /// Poll every pool once, returning how many rows were advanced.
    /// A failing pool is logged and does not stop the pass.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut advanced = 0;
        for pool in self.store.pools.list().await? {
            let ops = self.dispatch.poll_pool(pool.id).await;
            for op in &ops {
                debug!(
                    pool = %pool.name,
                    kind = %op.kind(),
                    op_id = op.id(),
                    status = %op.status(),
                    "operation polled"
                );
            }
            advanced += ops.len();
        }
        Ok(advanced)
    }

    /// Run until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "operation poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "operation poll pass failed");
                    }
                }
            }
        }
        info!("operation poller stopped");
    }
}
