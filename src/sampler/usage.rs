//! Usage Sampler
//!
//! Independent loop recording pool and share usage through the quota
//! engine's coalescing path and appending host samples directly. It takes no
//! pool locks, so it never waits on structural operations.

use crate::domain::ports::Repository;
use crate::error::Result;
use crate::metrics::metrics;
use crate::sampler::HostProbe;
use crate::storage::{PoolManager, QuotaEngine};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rows touched by one sampling pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleSummary {
    pub pools: usize,
    pub shares: usize,
    pub disks: usize,
    pub host: bool,
}

pub struct UsageSampler {
    store: Store,
    pools: Arc<PoolManager>,
    quota: Arc<QuotaEngine>,
    probe: HostProbe,
    interval: Duration,
}

impl UsageSampler {
    pub fn new(
        store: Store,
        pools: Arc<PoolManager>,
        quota: Arc<QuotaEngine>,
        probe: HostProbe,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            pools,
            quota,
            probe,
            interval,
        }
    }

    /// One pass over every pool and the host. Failures are logged per source.
    pub async fn sample_once(&self) -> Result<SampleSummary> {
        let mut summary = SampleSummary::default();

        for pool in self.store.pools.list().await? {
            match self.pools.refresh_state(pool.id).await {
                Ok(_) => summary.pools += 1,
                Err(e) => {
                    warn!(pool = %pool.name, error = %e, "pool usage sample failed");
                    continue;
                }
            }
            match self.quota.poll_usage(pool.id).await {
                Ok(rows) => summary.shares += rows.len(),
                Err(e) => warn!(pool = %pool.name, error = %e, "share usage sample failed"),
            }
        }

        match self.sample_host().await {
            Ok(disks) => {
                summary.disks = disks;
                summary.host = true;
            }
            Err(e) => warn!(root = %self.probe.root().display(), error = %e, "host sample failed"),
        }

        debug!(?summary, "usage sampled");
        Ok(summary)
    }

    async fn sample_host(&self) -> Result<usize> {
        let disks = self.probe.disk_io().await?;
        let load = self.probe.load().await?;
        let memory = self.probe.memory().await?;

        let count = disks.len();
        for sample in disks {
            self.store.disk_io.create(sample).await?;
        }
        self.store.load.create(load).await?;
        self.store.memory.create(memory).await?;

        let samples = &metrics().samples;
        samples
            .with_label_values(&["disk_io", "inserted"])
            .inc_by(count as u64);
        samples.with_label_values(&["load", "inserted"]).inc();
        samples.with_label_values(&["memory", "inserted"]).inc();
        Ok(count)
    }

    /// Run until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "usage sampler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_once().await {
                        warn!(error = %e, "usage sample pass failed");
                    }
                }
            }
        }
        info!("usage sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::RedundancyLevel;
    use crate::domain::ports::CommandOutput;
    use crate::testing::{qgroup_report, Fixture};
    use std::path::Path;

    fn write_procfs(root: &Path) {
        std::fs::write(
            root.join("diskstats"),
            "   8       0 sda 1 0 8 0 2 0 16 0 0 3 0 0 0 0 0\n   8       1 sda1 1 0 8 0 2 0 16 0 0 3 0 0 0 0 0\n",
        )
        .unwrap();
        std::fs::write(root.join("loadavg"), "0.10 0.20 0.30 1/100 7\n").unwrap();
        std::fs::write(root.join("meminfo"), "MemTotal: 2048 kB\nMemFree: 1024 kB\n").unwrap();
    }

    fn sampler(fx: &Fixture, root: &Path) -> UsageSampler {
        UsageSampler::new(
            fx.ctx.store.clone(),
            fx.pools.clone(),
            fx.quota.clone(),
            HostProbe::new(root),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_sample_once_records_every_series() {
        let dir = tempfile::tempdir().unwrap();
        write_procfs(dir.path());
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;
        let share = fx.share(&pool, "docs").await;
        fx.runner.set(
            &["btrfs", "qgroup", "show"],
            CommandOutput::success(&qgroup_report(&[(share.qgroup.as_str(), 8192, 4096)])),
        );

        let sampler = sampler(&fx, dir.path());
        let summary = sampler.sample_once().await.unwrap();
        assert_eq!(
            summary,
            SampleSummary {
                pools: 1,
                shares: 1,
                disks: 1,
                host: true
            }
        );

        // Identical readings coalesce, host samples append
        sampler.sample_once().await.unwrap();
        let pool_rows = fx.ctx.store.pool_usage.list_by_parent(pool.id).await.unwrap();
        assert_eq!(pool_rows.len(), 1);
        assert_eq!(pool_rows[0].count, 2);
        let share_rows = fx.ctx.store.share_usage.list_by_parent(share.id).await.unwrap();
        assert_eq!(share_rows.len(), 1);
        assert_eq!(share_rows[0].count, 2);
        assert_eq!(fx.ctx.store.load.list().await.unwrap().len(), 2);
        assert_eq!(fx.ctx.store.disk_io.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_host_failure_does_not_skip_pools() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new();
        fx.pool("data1", 1, RedundancyLevel::Single).await;

        let summary = sampler(&fx, &dir.path().join("absent"))
            .sample_once()
            .await
            .unwrap();
        assert_eq!(summary.pools, 1);
        assert!(!summary.host);
    }

    #[tokio::test]
    async fn test_sampling_does_not_wait_on_pool_lock() {
        let dir = tempfile::tempdir().unwrap();
        write_procfs(dir.path());
        let fx = Fixture::new();
        let pool = fx.pool("data1", 1, RedundancyLevel::Single).await;

        let _held = fx.ctx.locks.lock(pool.id).await;
        let summary = tokio::time::timeout(
            Duration::from_secs(1),
            sampler(&fx, dir.path()).sample_once(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.pools, 1);
    }
}
