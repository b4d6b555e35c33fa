//! Domain Model - Persisted entities of the storage core
//!
//! Every entity is a plain value addressed by a numeric id. Relationships are
//! expressed as parent ids and navigated explicitly through the repositories;
//! nothing here holds a live object graph.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identifier assigned by the persistence collaborator
pub type EntityId = u64;

/// A persisted row
pub trait Entity: Clone + Send + Sync + 'static {
    /// Human-readable entity kind, used in `NotFound` errors
    const KIND: &'static str;

    fn id(&self) -> EntityId;

    fn set_id(&mut self, id: EntityId);

    /// Owning row, if the entity has one
    fn parent_id(&self) -> Option<EntityId>;
}

macro_rules! entity {
    (@impl $ty:ty, $kind:literal, |$this:ident| $parent:expr) => {
        impl Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> EntityId {
                self.id
            }

            fn set_id(&mut self, id: EntityId) {
                self.id = id;
            }

            fn parent_id(&self) -> Option<EntityId> {
                let $this = self;
                $parent
            }
        }
    };
    ($ty:ty, $kind:literal) => {
        entity!(@impl $ty, $kind, |_this| None);
    };
    ($ty:ty, $kind:literal, parent = $field:ident) => {
        entity!(@impl $ty, $kind, |this| Some(this.$field));
    };
    ($ty:ty, $kind:literal, optional_parent = $field:ident) => {
        entity!(@impl $ty, $kind, |this| this.$field);
    };
}

// =============================================================================
// Redundancy Level
// =============================================================================

/// Replication/striping profile of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedundancyLevel {
    Single,
    Raid0,
    Raid1,
    Raid1c3,
    Raid1c4,
    Raid10,
    Raid5,
    Raid6,
}

impl RedundancyLevel {
    /// Minimum number of member disks the profile needs
    pub fn min_disks(&self) -> usize {
        match self {
            RedundancyLevel::Single => 1,
            RedundancyLevel::Raid0 | RedundancyLevel::Raid1 | RedundancyLevel::Raid5 => 2,
            RedundancyLevel::Raid1c3 | RedundancyLevel::Raid6 => 3,
            RedundancyLevel::Raid1c4 | RedundancyLevel::Raid10 => 4,
        }
    }

    /// Profile name understood by mkfs and balance convert filters
    pub fn profile(&self) -> &'static str {
        match self {
            RedundancyLevel::Single => "single",
            RedundancyLevel::Raid0 => "raid0",
            RedundancyLevel::Raid1 => "raid1",
            RedundancyLevel::Raid1c3 => "raid1c3",
            RedundancyLevel::Raid1c4 => "raid1c4",
            RedundancyLevel::Raid10 => "raid10",
            RedundancyLevel::Raid5 => "raid5",
            RedundancyLevel::Raid6 => "raid6",
        }
    }
}

impl std::fmt::Display for RedundancyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.profile())
    }
}

impl FromStr for RedundancyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "single" => Ok(RedundancyLevel::Single),
            "raid0" | "stripe" => Ok(RedundancyLevel::Raid0),
            "raid1" | "mirror" => Ok(RedundancyLevel::Raid1),
            "raid1c3" => Ok(RedundancyLevel::Raid1c3),
            "raid1c4" => Ok(RedundancyLevel::Raid1c4),
            "raid10" => Ok(RedundancyLevel::Raid10),
            "raid5" => Ok(RedundancyLevel::Raid5),
            "raid6" => Ok(RedundancyLevel::Raid6),
            other => Err(Error::Validation(format!(
                "unknown redundancy level: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Pool / Disk
// =============================================================================

/// A redundant volume made of member disks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: EntityId,
    pub name: String,
    /// Filesystem UUID reported after creation
    pub uuid: Option<String>,
    pub redundancy: RedundancyLevel,
    /// Ordered member disk ids
    pub disk_ids: Vec<EntityId>,
    pub mount_point: String,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub created_at: DateTime<Utc>,
}

entity!(Pool, "Pool");

/// A physical disk, optionally owned by a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub id: EntityId,
    /// Kernel device name (e.g. `sdb`)
    pub name: String,
    pub serial: String,
    pub pool_id: Option<EntityId>,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
    /// Device index inside the owning filesystem
    pub devid: Option<u64>,
}

entity!(Disk, "Disk", optional_parent = pool_id);

impl Disk {
    pub fn new(name: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            serial: serial.into(),
            pool_id: None,
            size_bytes: 0,
            allocated_bytes: 0,
            devid: None,
        }
    }

    /// Block device path
    pub fn device_path(&self) -> String {
        if self.name.starts_with('/') {
            self.name.clone()
        } else {
            format!("/dev/{}", self.name)
        }
    }
}

// =============================================================================
// Share / Snapshot
// =============================================================================

/// A subvolume inside a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub id: EntityId,
    pub pool_id: EntityId,
    pub name: String,
    pub subvol_id: u64,
    /// Quota group accounting this subvolume (`0/<subvol_id>`)
    pub qgroup: String,
    pub referenced_bytes: u64,
    pub exclusive_bytes: u64,
    pub size_limit: Option<u64>,
    pub created_at: DateTime<Utc>,
}

entity!(Share, "Share", parent = pool_id);

/// Point-in-time copy of a share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: EntityId,
    pub share_id: EntityId,
    pub name: String,
    pub writable: bool,
    pub subvol_id: u64,
    pub qgroup: String,
    pub created_at: DateTime<Utc>,
}

entity!(Snapshot, "Snapshot", parent = share_id);

/// Quota group id for a subvolume id
pub fn qgroup_for(subvol_id: u64) -> String {
    format!("0/{}", subvol_id)
}

// =============================================================================
// Maintenance Operations
// =============================================================================

/// Lifecycle status of a balance or scrub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Started,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl OpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OpStatus::Finished | OpStatus::Failed | OpStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpStatus::Started => write!(f, "started"),
            OpStatus::Running => write!(f, "running"),
            OpStatus::Finished => write!(f, "finished"),
            OpStatus::Failed => write!(f, "failed"),
            OpStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Who asked for a maintenance operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpOrigin {
    User,
    System,
}

/// A rebalance of a pool's data across its member disks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOp {
    pub id: EntityId,
    pub pool_id: EntityId,
    pub status: OpStatus,
    /// Handle of the supervised balance process (`pid:<n>`)
    pub handle: Option<String>,
    pub origin: OpOrigin,
    /// Profile conversion requested with this balance
    pub convert_to: Option<RedundancyLevel>,
    pub percent_done: u8,
    pub message: String,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

entity!(BalanceOp, "Balance", parent = pool_id);

/// Error counters reported by a scrub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubErrors {
    pub read_errors: u64,
    pub csum_errors: u64,
    pub verify_errors: u64,
    pub super_errors: u64,
    pub uncorrectable_errors: u64,
    pub corrected_errors: u64,
}

impl ScrubErrors {
    pub fn total(&self) -> u64 {
        self.read_errors + self.csum_errors + self.verify_errors + self.super_errors
    }
}

/// An integrity verification pass over a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrubOp {
    pub id: EntityId,
    pub pool_id: EntityId,
    pub status: OpStatus,
    /// Filesystem UUID the scrub runs against
    pub handle: Option<String>,
    pub bytes_scrubbed: u64,
    pub total_bytes: Option<u64>,
    pub duration_secs: u64,
    /// Bytes per second
    pub rate_bps: u64,
    pub time_left_secs: Option<u64>,
    pub eta: Option<DateTime<Utc>>,
    pub errors: ScrubErrors,
    pub message: String,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

entity!(ScrubOp, "Scrub", parent = pool_id);

// =============================================================================
// Usage Samples
// =============================================================================

/// Referenced/exclusive usage of a share, coalesced across identical readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareUsage {
    pub id: EntityId,
    pub share_id: EntityId,
    pub referenced_bytes: u64,
    pub exclusive_bytes: u64,
    pub count: u64,
    pub ts: DateTime<Utc>,
}

entity!(ShareUsage, "ShareUsage", parent = share_id);

/// Space usage of a pool, coalesced across identical readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub id: EntityId,
    pub pool_id: EntityId,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub count: u64,
    pub ts: DateTime<Utc>,
}

entity!(PoolUsage, "PoolUsage", parent = pool_id);

/// Cumulative I/O counters of one block device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskIoSample {
    pub id: EntityId,
    pub device: String,
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
    pub ios_in_progress: u64,
    pub ms_doing_io: u64,
    pub ts: DateTime<Utc>,
}

entity!(DiskIoSample, "DiskIoSample");

/// Host load averages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub id: EntityId,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub ts: DateTime<Utc>,
}

entity!(LoadSample, "LoadSample");

/// Host memory statistics in KiB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub id: EntityId,
    pub total_kb: u64,
    pub free_kb: u64,
    pub available_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
    pub ts: DateTime<Utc>,
}

entity!(MemorySample, "MemorySample");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redundancy_parsing() {
        assert_eq!(
            "mirror".parse::<RedundancyLevel>().unwrap(),
            RedundancyLevel::Raid1
        );
        assert_eq!(
            "RAID10".parse::<RedundancyLevel>().unwrap(),
            RedundancyLevel::Raid10
        );
        assert!("raid7".parse::<RedundancyLevel>().is_err());
    }

    #[test]
    fn test_redundancy_min_disks() {
        assert_eq!(RedundancyLevel::Single.min_disks(), 1);
        assert_eq!(RedundancyLevel::Raid1.min_disks(), 2);
        assert_eq!(RedundancyLevel::Raid6.min_disks(), 3);
        assert_eq!(RedundancyLevel::Raid10.min_disks(), 4);
        assert_eq!(format!("{}", RedundancyLevel::Raid1c3), "raid1c3");
    }

    #[test]
    fn test_op_status_terminal() {
        assert!(!OpStatus::Started.is_terminal());
        assert!(!OpStatus::Running.is_terminal());
        assert!(OpStatus::Finished.is_terminal());
        assert!(OpStatus::Failed.is_terminal());
        assert!(OpStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_disk_device_path() {
        assert_eq!(Disk::new("sdb", "S1").device_path(), "/dev/sdb");
        assert_eq!(
            Disk::new("/dev/disk/by-id/ata-X", "S2").device_path(),
            "/dev/disk/by-id/ata-X"
        );
        assert_eq!(qgroup_for(257), "0/257");
    }
}
