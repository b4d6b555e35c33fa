//! Per-Pool Exclusivity
//!
//! Structural pool changes and maintenance starts take the pool's lock so the
//! filesystem tool never sees two of them interleaved on one pool.

use crate::domain::model::EntityId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Named mutual exclusion keyed by pool id
#[derive(Debug, Default)]
pub struct PoolLocks {
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

/// Held for the duration of a serialized pool operation
pub struct PoolGuard {
    pub pool_id: EntityId,
    _guard: OwnedMutexGuard<()>,
}

impl PoolLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entry(&self, pool_id: EntityId) -> Arc<Mutex<()>> {
        self.locks
            .entry(pool_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to a pool
    pub async fn lock(&self, pool_id: EntityId) -> PoolGuard {
        trace!(pool_id, "acquiring pool lock");
        let guard = self.entry(pool_id).lock_owned().await;
        PoolGuard {
            pool_id,
            _guard: guard,
        }
    }

    /// Take the lock only if nobody holds it
    pub fn try_lock(&self, pool_id: EntityId) -> Option<PoolGuard> {
        self.entry(pool_id)
            .try_lock_owned()
            .ok()
            .map(|guard| PoolGuard {
                pool_id,
                _guard: guard,
            })
    }

    /// Drop the lock entry of a deleted pool. An entry a waiter still holds
    /// is kept, so that waiter and later callers share one mutex; the waiter
    /// then finds the pool row gone.
    pub fn forget(&self, pool_id: EntityId) {
        // Clones are only made under the shard lock held here
        self.locks
            .remove_if(&pool_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
