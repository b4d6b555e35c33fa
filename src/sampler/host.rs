//! Host Metrics
//!
//! Readers for `/proc/diskstats`, `/proc/loadavg` and `/proc/meminfo`
//! rooted at a configurable procfs directory.

use crate::domain::model::{DiskIoSample, LoadSample, MemorySample};
use crate::error::{Error, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Reads host counters from a procfs tree
#[derive(Debug, Clone)]
pub struct HostProbe {
    root: PathBuf,
}

impl HostProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, name: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.root.join(name)).await?)
    }

    pub async fn disk_io(&self) -> Result<Vec<DiskIoSample>> {
        parse_diskstats(&self.read("diskstats").await?)
    }

    pub async fn load(&self) -> Result<LoadSample> {
        parse_loadavg(&self.read("loadavg").await?)
    }

    pub async fn memory(&self) -> Result<MemorySample> {
        parse_meminfo(&self.read("meminfo").await?)
    }
}

// =============================================================================
// Parsers
// =============================================================================

const VIRTUAL_PREFIXES: [&str; 4] = ["loop", "ram", "zram", "sr"];

/// Whole disks only: partitions, loop, ram and optical devices are skipped
fn is_whole_disk(name: &str) -> bool {
    if VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        return false;
    }
    // nvme0n1p1, mmcblk0p1
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        return !name
            .rsplit_once('p')
            .is_some_and(|(head, tail)| {
                head.ends_with(|c: char| c.is_ascii_digit())
                    && !tail.is_empty()
                    && tail.chars().all(|c| c.is_ascii_digit())
            });
    }
    // sda1, vdb2
    !name.ends_with(|c: char| c.is_ascii_digit())
        || name.starts_with("md")
        || name.starts_with("dm-")
}

fn field(fields: &[&str], index: usize, what: &str) -> Result<u64> {
    fields
        .get(index)
        .ok_or_else(|| Error::parse(what, format!("missing field {}", index)))?
        .parse()
        .map_err(|_| Error::parse(what, fields.join(" ")))
}

pub fn parse_diskstats(text: &str) -> Result<Vec<DiskIoSample>> {
    let ts = Utc::now();
    let mut samples = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue;
        }
        let device = fields[2];
        if !is_whole_disk(device) {
            continue;
        }
        samples.push(DiskIoSample {
            id: 0,
            device: device.to_string(),
            reads_completed: field(&fields, 3, "diskstats")?,
            sectors_read: field(&fields, 5, "diskstats")?,
            writes_completed: field(&fields, 7, "diskstats")?,
            sectors_written: field(&fields, 9, "diskstats")?,
            ios_in_progress: field(&fields, 11, "diskstats")?,
            ms_doing_io: field(&fields, 12, "diskstats")?,
            ts,
        });
    }
    Ok(samples)
}

pub fn parse_loadavg(text: &str) -> Result<LoadSample> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let load = |index: usize| -> Result<f64> {
        fields
            .get(index)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::parse("loadavg", text.trim()))
    };
    Ok(LoadSample {
        id: 0,
        load_1: load(0)?,
        load_5: load(1)?,
        load_15: load(2)?,
        ts: Utc::now(),
    })
}

pub fn parse_meminfo(text: &str) -> Result<MemorySample> {
    let mut sample = MemorySample {
        id: 0,
        total_kb: 0,
        free_kb: 0,
        available_kb: 0,
        buffers_kb: 0,
        cached_kb: 0,
        swap_total_kb: 0,
        swap_free_kb: 0,
        ts: Utc::now(),
    };
    let mut seen_total = false;

    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match key.trim() {
            "MemTotal" => {
                seen_total = true;
                &mut sample.total_kb
            }
            "MemFree" => &mut sample.free_kb,
            "MemAvailable" => &mut sample.available_kb,
            "Buffers" => &mut sample.buffers_kb,
            "Cached" => &mut sample.cached_kb,
            "SwapTotal" => &mut sample.swap_total_kb,
            "SwapFree" => &mut sample.swap_free_kb,
            _ => continue,
        };
        *slot = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::parse("meminfo", line))?;
    }

    if !seen_total {
        return Err(Error::parse("meminfo", "MemTotal not reported"));
    }
    Ok(sample)
}
