//! Storage Pool Manager
//!
//! Storage core of a btrfs NAS appliance: pools built from raw disks,
//! shares as quota-limited subvolumes, snapshots with rollback, and
//! supervised balance/scrub maintenance with usage sampling.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Orchestrator                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ Pool Manager │  │Share Manager │  │  Snapshot    │  │  Quota Engine   │  │
//! │  │              │  │              │  │  Manager     │  │  (coalescing)   │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘  └────────┬────────┘  │
//! │         └─────────────────┴────────┬────────┴───────────────────┘           │
//! │                                    │                                        │
//! │  ┌─────────────────────────────────┴───────────────────────────────────┐    │
//! │  │  Maintenance Dispatch: Balance | Scrub  ◀── Operation Poller        │    │
//! │  └─────────────────────────────────┬───────────────────────────────────┘    │
//! │                                    │               Usage Sampler ──▶ store  │
//! ├────────────────────────────────────┴────────────────────────────────────────┤
//! │  Storage Context: PoolLocks │ Layout │ BtrfsCommands │ Store (repositories) │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  Command Runner (tokio::process, argv only, transient retry, supervision)   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator facade
//! - [`storage`]: Pool, share, snapshot and quota managers
//! - [`maintenance`]: Balance and scrub orchestration, operation poller
//! - [`sampler`]: Pool, share and host usage sampling
//! - [`filesystem`]: btrfs command builders and report parsers
//! - [`executor`]: External command execution
//! - [`store`]: Repository bundle and in-memory implementation
//! - [`domain`]: Core domain types and ports
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod executor;
pub mod filesystem;
pub mod maintenance;
pub mod metrics;
pub mod sampler;
pub mod storage;
pub mod store;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use config::AppConfig;

pub use controlplane::{Orchestrator, OrchestratorStatus};

pub use domain::model::{
    BalanceOp, Disk, EntityId, OpOrigin, OpStatus, Pool, PoolUsage, RedundancyLevel, ScrubOp,
    Share, ShareUsage, Snapshot,
};

pub use domain::ports::{CommandOutput, CommandRequest, CommandRunner, Repository};

pub use error::{Error, ErrorAction, Result};

pub use executor::{RunnerConfig, SystemCommandRunner};

pub use filesystem::{BtrfsCommands, ToolPaths};

pub use maintenance::{MaintenanceDispatch, MaintenanceKind, MaintenanceOp, OperationPoller};

pub use sampler::{HostProbe, UsageSampler};

pub use storage::{Layout, StorageContext};

pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
