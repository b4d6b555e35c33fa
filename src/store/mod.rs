//! Persistence Module
//!
//! Bundles one repository per entity. The managers only depend on the
//! `Repository` port; `Store::in_memory` wires the reference implementation.

pub mod memory;

pub use memory::*;

use crate::domain::model::{
    BalanceOp, Disk, DiskIoSample, LoadSample, MemorySample, Pool, PoolUsage, ScrubOp, Share,
    ShareUsage, Snapshot,
};
use crate::domain::ports::RepositoryRef;
use std::sync::Arc;

/// Repositories for every persisted entity
#[derive(Clone)]
pub struct Store {
    pub pools: RepositoryRef<Pool>,
    pub disks: RepositoryRef<Disk>,
    pub shares: RepositoryRef<Share>,
    pub snapshots: RepositoryRef<Snapshot>,
    pub balances: RepositoryRef<BalanceOp>,
    pub scrubs: RepositoryRef<ScrubOp>,
    pub pool_usage: RepositoryRef<PoolUsage>,
    pub share_usage: RepositoryRef<ShareUsage>,
    pub disk_io: RepositoryRef<DiskIoSample>,
    pub load: RepositoryRef<LoadSample>,
    pub memory: RepositoryRef<MemorySample>,
}

impl Store {
    /// Store backed by in-memory repositories
    pub fn in_memory() -> Self {
        Self {
            pools: Arc::new(MemoryRepository::new()),
            disks: Arc::new(MemoryRepository::new()),
            shares: Arc::new(MemoryRepository::new()),
            snapshots: Arc::new(MemoryRepository::new()),
            balances: Arc::new(MemoryRepository::new()),
            scrubs: Arc::new(MemoryRepository::new()),
            pool_usage: Arc::new(MemoryRepository::new()),
            share_usage: Arc::new(MemoryRepository::new()),
            disk_io: Arc::new(MemoryRepository::new()),
            load: Arc::new(MemoryRepository::new()),
            memory: Arc::new(MemoryRepository::new()),
        }
    }
}
