//! Filesystem Tool Report Parsers
//!
//! Parses the text reports of `btrfs` subcommands into typed values. The
//! grammars below are the contract verified against btrfs-progs output; both
//! the legacy and the key/value layouts of `scrub status -R` are accepted.

use crate::domain::model::ScrubErrors;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// filesystem show --raw
// =============================================================================

/// One member device line of `filesystem show`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub devid: u64,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub path: String,
}

impl DeviceEntry {
    /// Kernel device name (`/dev/sdb` -> `sdb`)
    pub fn device_name(&self) -> &str {
        self.path.strip_prefix("/dev/").unwrap_or(&self.path)
    }
}

/// Parsed `btrfs filesystem show --raw`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemShow {
    pub label: Option<String>,
    pub uuid: String,
    pub total_devices: u32,
    pub devices: Vec<DeviceEntry>,
    /// The tool reported missing devices
    pub missing: bool,
}

/// Parse the report of a single filesystem
///
/// ```text
/// Label: 'data1'  uuid: 3b4c2a1e-...
///         Total devices 2 FS bytes used 196608
///         devid    1 size 10737418240 used 2185232384 path /dev/sdb
///         devid    2 size 10737418240 used 2185232384 path /dev/sdc
/// ```
pub fn parse_filesystem_show(lines: &[String]) -> Result<FilesystemShow> {
    let mut label = None;
    let mut uuid = None;
    let mut total_devices = 0;
    let mut devices = Vec::new();
    let mut missing = false;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("Label:") {
            if let Some(idx) = trimmed.find("uuid:") {
                uuid = Some(trimmed[idx + 5..].trim().to_string());
                let raw_label = trimmed["Label:".len()..idx].trim();
                if raw_label != "none" {
                    label = Some(raw_label.trim_matches('\'').to_string());
                }
            }
        } else if let Some(rest) = trimmed.strip_prefix("Total devices") {
            total_devices = rest
                .split_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
        } else if trimmed.starts_with("devid") {
            devices.push(parse_device_line(trimmed)?);
        } else if trimmed.contains("devices missing") || trimmed.contains("<missing disks>") {
            missing = true;
        }
    }

    let uuid = uuid.ok_or_else(|| Error::parse("filesystem show", "no uuid line"))?;
    if devices.len() < total_devices as usize {
        missing = true;
    }

    Ok(FilesystemShow {
        label,
        uuid,
        total_devices,
        devices,
        missing,
    })
}

fn parse_device_line(line: &str) -> Result<DeviceEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let value_after = |key: &str| -> Option<&str> {
        fields
            .iter()
            .position(|f| *f == key)
            .and_then(|i| fields.get(i + 1).copied())
    };
    let number = |key: &str| -> Result<u64> {
        value_after(key)
            .ok_or_else(|| Error::parse("device line", format!("missing {}: {}", key, line)))
            .and_then(parse_size)
    };

    Ok(DeviceEntry {
        devid: number("devid")?,
        size_bytes: number("size")?,
        used_bytes: number("used")?,
        path: value_after("path")
            .ok_or_else(|| Error::parse("device line", format!("missing path: {}", line)))?
            .to_string(),
    })
}

// =============================================================================
// filesystem usage -b
// =============================================================================

/// Parsed `btrfs filesystem usage -b` overall section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemUsage {
    pub device_size: u64,
    pub device_allocated: u64,
    pub device_unallocated: u64,
    pub used: u64,
    pub free_estimated: u64,
}

pub fn parse_filesystem_usage(lines: &[String]) -> Result<FilesystemUsage> {
    let mut usage = FilesystemUsage::default();
    let mut seen_size = false;

    for line in lines {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        // "Free (estimated):   9545981952   (min: 9545981952)"
        let first = value.split_whitespace().next().unwrap_or("");
        match key.trim() {
            "Device size" => {
                usage.device_size = parse_size(first)?;
                seen_size = true;
            }
            "Device allocated" => usage.device_allocated = parse_size(first)?,
            "Device unallocated" => usage.device_unallocated = parse_size(first)?,
            "Used" => usage.used = parse_size(first)?,
            "Free (estimated)" => usage.free_estimated = parse_size(first)?,
            _ => {}
        }
    }

    if !seen_size {
        return Err(Error::parse("filesystem usage", "no 'Device size' line"));
    }
    Ok(usage)
}

// =============================================================================
// subvolume show
// =============================================================================

/// Extract `Subvolume ID:` from `btrfs subvolume show`
pub fn parse_subvolume_id(lines: &[String]) -> Result<u64> {
    lines
        .iter()
        .filter_map(|line| line.trim().strip_prefix("Subvolume ID:"))
        .find_map(|value| value.trim().parse().ok())
        .ok_or_else(|| Error::parse("subvolume show", "no 'Subvolume ID' line"))
}

// =============================================================================
// qgroup show --raw
// =============================================================================

/// One quota group accounting line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QgroupEntry {
    pub qgroupid: String,
    pub referenced_bytes: u64,
    pub exclusive_bytes: u64,
}

/// Parse `btrfs qgroup show --raw`, skipping headers and separators
///
/// ```text
/// qgroupid         rfer         excl
/// --------         ----         ----
/// 0/5             16384        16384
/// 0/257         1048576      1048576
/// ```
pub fn parse_qgroup_show(lines: &[String]) -> Result<Vec<QgroupEntry>> {
    let mut entries = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(id) = fields.first() else {
            continue;
        };
        let is_group = id
            .split_once('/')
            .map(|(level, sub)| level.parse::<u64>().is_ok() && sub.parse::<u64>().is_ok())
            .unwrap_or(false);
        if !is_group {
            continue;
        }
        if fields.len() < 3 {
            return Err(Error::parse("qgroup show", format!("short line: {}", line)));
        }
        entries.push(QgroupEntry {
            qgroupid: id.to_string(),
            referenced_bytes: parse_size(fields[1])?,
            exclusive_bytes: parse_size(fields[2])?,
        });
    }
    Ok(entries)
}

// =============================================================================
// balance status
// =============================================================================

/// Whether a balance is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceState {
    Idle,
    Running,
    Paused,
}

/// Parsed `btrfs balance status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceStatus {
    pub state: BalanceState,
    pub cancel_requested: bool,
    pub chunks_balanced: Option<u64>,
    pub chunks_total: Option<u64>,
    pub percent_left: Option<u8>,
}

impl BalanceStatus {
    pub fn is_active(&self) -> bool {
        self.state != BalanceState::Idle
    }

    /// Completion in percent, derived from "% left" or the chunk counts
    pub fn percent_done(&self) -> Option<u8> {
        if let Some(left) = self.percent_left {
            return Some(100u8.saturating_sub(left.min(100)));
        }
        match (self.chunks_balanced, self.chunks_total) {
            (Some(done), Some(total)) if total > 0 => {
                Some(((done.min(total) * 100) / total) as u8)
            }
            _ => None,
        }
    }
}

/// Parse `btrfs balance status`
///
/// ```text
/// Balance on '/mnt2/data1' is running
/// 2 out of about 10 chunks balanced (3 considered),  80% left
/// ```
pub fn parse_balance_status(lines: &[String]) -> Result<BalanceStatus> {
    let mut status = BalanceStatus {
        state: BalanceState::Idle,
        cancel_requested: false,
        chunks_balanced: None,
        chunks_total: None,
        percent_left: None,
    };
    let mut recognized = false;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("No balance found") {
            recognized = true;
        } else if trimmed.starts_with("Balance on") {
            recognized = true;
            if trimmed.contains("is running") {
                status.state = BalanceState::Running;
            } else if trimmed.contains("is paused") {
                status.state = BalanceState::Paused;
            }
            status.cancel_requested = trimmed.contains("cancel requested");
        } else if trimmed.contains("chunks balanced") {
            let words: Vec<&str> = trimmed.split_whitespace().collect();
            status.chunks_balanced = words.first().and_then(|w| w.parse().ok());
            status.chunks_total = words
                .iter()
                .position(|w| *w == "about")
                .and_then(|i| words.get(i + 1))
                .and_then(|w| w.parse().ok());
            status.percent_left = words
                .iter()
                .find(|w| w.ends_with('%'))
                .and_then(|w| w.trim_end_matches('%').parse().ok());
        }
    }

    if !recognized {
        return Err(Error::parse(
            "balance status",
            lines.first().cloned().unwrap_or_else(|| "empty output".into()),
        ));
    }
    Ok(status)
}

// =============================================================================
// scrub status -R
// =============================================================================

/// Scrub state as reported by the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrubState {
    NotStarted,
    Running,
    Finished,
    Aborted,
    Interrupted,
}

/// Parsed `btrfs scrub status -R`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubStatus {
    pub state: ScrubState,
    pub uuid: Option<String>,
    pub duration_secs: u64,
    pub bytes_scrubbed: u64,
    pub total_to_scrub: Option<u64>,
    pub errors: ScrubErrors,
}

impl ScrubStatus {
    pub fn is_running(&self) -> bool {
        self.state == ScrubState::Running
    }

    /// Average rate in bytes per second
    pub fn rate_bps(&self) -> u64 {
        if self.duration_secs == 0 {
            0
        } else {
            self.bytes_scrubbed / self.duration_secs
        }
    }

    /// Seconds remaining at the current rate, when the total is known
    pub fn time_left_secs(&self) -> Option<u64> {
        let total = self.total_to_scrub?;
        let rate = self.rate_bps();
        if rate == 0 {
            return None;
        }
        Some(total.saturating_sub(self.bytes_scrubbed) / rate)
    }
}

/// Parse `btrfs scrub status -R` in either the legacy or key/value layout
pub fn parse_scrub_status(lines: &[String]) -> Result<ScrubStatus> {
    let mut status = ScrubStatus {
        state: ScrubState::NotStarted,
        uuid: None,
        duration_secs: 0,
        bytes_scrubbed: 0,
        total_to_scrub: None,
        errors: ScrubErrors::default(),
    };
    let mut data_bytes = 0;
    let mut tree_bytes = 0;
    let mut recognized = false;

    for line in lines {
        let trimmed = line.trim();

        // Legacy layout
        if let Some(uuid) = trimmed.strip_prefix("scrub status for") {
            status.uuid = Some(uuid.trim().to_string());
            recognized = true;
            continue;
        }
        if trimmed.starts_with("scrub started at") || trimmed.starts_with("scrub resumed at") {
            recognized = true;
            for (marker, state) in [
                ("running for", ScrubState::Running),
                ("finished after", ScrubState::Finished),
                ("aborted after", ScrubState::Aborted),
                ("interrupted after", ScrubState::Interrupted),
            ] {
                if let Some(idx) = trimmed.find(marker) {
                    status.state = state;
                    let rest = trimmed[idx + marker.len()..].trim();
                    let token = rest.split([' ', ',']).next().unwrap_or("");
                    status.duration_secs = parse_duration(token)?;
                }
            }
            continue;
        }
        if trimmed.contains("no stats available") {
            recognized = true;
            status.state = ScrubState::NotStarted;
            continue;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            // Key/value layout
            "UUID" => {
                recognized = true;
                status.uuid = Some(value.to_string());
            }
            "Status" => {
                recognized = true;
                status.state = match value {
                    "running" => ScrubState::Running,
                    "finished" => ScrubState::Finished,
                    "aborted" | "cancelled" => ScrubState::Aborted,
                    "interrupted" => ScrubState::Interrupted,
                    _ => ScrubState::NotStarted,
                };
            }
            "Duration" => status.duration_secs = parse_duration(value)?,
            "Total to scrub" => {
                status.total_to_scrub =
                    Some(parse_size(value.split_whitespace().next().unwrap_or(""))?)
            }
            // Raw counters
            "data_bytes_scrubbed" => data_bytes = parse_size(value)?,
            "tree_bytes_scrubbed" => tree_bytes = parse_size(value)?,
            "read_errors" => status.errors.read_errors = parse_size(value)?,
            "csum_errors" => status.errors.csum_errors = parse_size(value)?,
            "verify_errors" => status.errors.verify_errors = parse_size(value)?,
            "super_errors" => status.errors.super_errors = parse_size(value)?,
            "uncorrectable_errors" => status.errors.uncorrectable_errors = parse_size(value)?,
            "corrected_errors" => status.errors.corrected_errors = parse_size(value)?,
            _ => {}
        }
    }

    if !recognized {
        return Err(Error::parse(
            "scrub status",
            lines.first().cloned().unwrap_or_else(|| "empty output".into()),
        ));
    }

    status.bytes_scrubbed = data_bytes + tree_bytes;
    Ok(status)
}

// =============================================================================
// Scalars
// =============================================================================

/// Parse `H:MM:SS` (hours may exceed two digits)
pub fn parse_duration(s: &str) -> Result<u64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(Error::parse("duration", s));
    }
    let mut secs = 0u64;
    for part in parts {
        let n: u64 = part.parse().map_err(|_| Error::parse("duration", s))?;
        secs = secs * 60 + n;
    }
    Ok(secs)
}

/// Parse a byte count, accepting binary/decimal unit suffixes (`10.00GiB`, `512M`)
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::parse("size", "empty size string"));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    if unit_str.is_empty() && !num_str.contains('.') {
        return num_str
            .parse()
            .map_err(|_| Error::parse("size", format!("invalid number: {}", s)));
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::parse("size", format!("invalid number: {}", s)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KIB" => 1 << 10,
        "M" | "MIB" => 1 << 20,
        "G" | "GIB" => 1 << 30,
        "T" | "TIB" => 1 << 40,
        "P" | "PIB" => 1 << 50,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        other => {
            return Err(Error::parse("size", format!("unknown unit: {}", other)));
        }
    };

    Ok((num * multiplier as f64).round() as u64)
}
