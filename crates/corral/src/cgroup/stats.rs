//! Structured resource-usage snapshots.
//!
//! Parsers here are pure functions over the text the kernel exposes; both
//! hierarchy versions feed them and the managers assemble the snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One snapshot of a container's resource usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    /// CPU usage.
    pub cpu: CpuStats,
    /// Memory usage.
    pub memory: MemoryStats,
    /// Pid counts.
    pub pids: PidsStats,
    /// Block I/O, per device and operation.
    pub io: IoStats,
    /// Hugetlb usage per page size.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hugetlb: BTreeMap<String, HugetlbStats>,
    /// RDMA counters per HCA, when the controller is present.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rdma: BTreeMap<String, RdmaEntry>,
    /// The network class id, when net_cls is present (v1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_classid: Option<u32>,
    /// Controllers that could not be read or were never delegated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

/// CPU time counters, in microseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    /// Total usage.
    pub total_usec: u64,
    /// Time spent in user mode.
    pub user_usec: u64,
    /// Time spent in kernel mode.
    pub system_usec: u64,
    /// Per-cpu usage, when the kernel exposes it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_cpu_usec: Vec<u64>,
}

/// Memory counters, in bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Current usage.
    pub usage: u64,
    /// Configured limit; `None` means unlimited.
    pub limit: Option<u64>,
    /// Page-cache bytes.
    pub cache: u64,
    /// Anonymous/rss bytes.
    pub rss: u64,
    /// Swap usage.
    pub swap: u64,
    /// Times the limit was hit (v1 failcnt).
    pub failcnt: u64,
}

/// Pid counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsStats {
    /// Current number of pids.
    pub current: u64,
    /// Configured maximum; `None` means unlimited.
    pub max: Option<u64>,
}

/// Block I/O counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoStats {
    /// Bytes transferred, per device and operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bytes: Vec<IoEntry>,
    /// Operations completed, per device and operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ios: Vec<IoEntry>,
}

/// One per-device, per-operation counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoEntry {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Operation name (`read`, `write`, ...).
    pub op: String,
    /// Counter value.
    pub value: u64,
}

/// Hugetlb usage for one page size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HugetlbStats {
    /// Current usage in bytes.
    pub usage: u64,
    /// Configured limit; `None` means unlimited.
    pub max: Option<u64>,
    /// Times the limit was hit.
    pub failcnt: u64,
}

/// RDMA counters for one HCA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaEntry {
    /// Open HCA handles.
    pub hca_handles: u64,
    /// Created HCA objects.
    pub hca_objects: u64,
}

/// Parse `key value` lines (`cpu.stat`, `memory.stat`).
#[must_use]
pub fn parse_flat_keyed(content: &str) -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(value) = value.parse() {
                map.insert(key.to_string(), value);
            }
        }
    }
    map
}

/// Parse a single numeric file where `"max"` (or a huge sentinel) means
/// unlimited.
#[must_use]
pub fn parse_limit(content: &str) -> Option<u64> {
    let trimmed = content.trim();
    if trimmed == "max" {
        return None;
    }
    match trimmed.parse::<u64>() {
        // v1 reports "unlimited" as a page-rounded i64::MAX.
        Ok(v) if v >= i64::MAX as u64 / 4096 * 4096 => None,
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

/// Parse whitespace-separated per-cpu counters (`cpuacct.usage_percpu`).
#[must_use]
pub fn parse_per_cpu(content: &str) -> Vec<u64> {
    content
        .split_whitespace()
        .filter_map(|v| v.parse().ok())
        .collect()
}

/// Parse v1 blkio entries (`8:0 Read 12345`).
#[must_use]
pub fn parse_blkio(content: &str) -> Vec<IoEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(dev), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let Some((major, minor)) = dev.split_once(':') else {
            continue;
        };
        let (Ok(major), Ok(minor), Ok(value)) = (major.parse(), minor.parse(), value.parse())
        else {
            continue;
        };
        let op = op.to_ascii_lowercase();
        if op == "total" {
            continue;
        }
        entries.push(IoEntry {
            major,
            minor,
            op,
            value,
        });
    }
    entries
}

/// Parse v2 `io.stat` (`8:16 rbytes=1459200 wbytes=314773504 rios=192 ...`).
#[must_use]
pub fn parse_io_stat(content: &str) -> IoStats {
    let mut stats = IoStats::default();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(dev) = parts.next() else { continue };
        let Some((major, minor)) = dev.split_once(':') else {
            continue;
        };
        let (Ok(major), Ok(minor)) = (major.parse::<u64>(), minor.parse::<u64>()) else {
            continue;
        };

        for field in parts {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse() else { continue };
            let (bucket, op) = match key {
                "rbytes" => (&mut stats.bytes, "read"),
                "wbytes" => (&mut stats.bytes, "write"),
                "rios" => (&mut stats.ios, "read"),
                "wios" => (&mut stats.ios, "write"),
                "dbytes" => (&mut stats.bytes, "discard"),
                "dios" => (&mut stats.ios, "discard"),
                _ => continue,
            };
            bucket.push(IoEntry {
                major,
                minor,
                op: op.to_string(),
                value,
            });
        }
    }
    stats
}

/// Parse `rdma.current` (`mlx4_0 hca_handle=2 hca_object=2000`).
#[must_use]
pub fn parse_rdma(content: &str) -> BTreeMap<String, RdmaEntry> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(hca) = parts.next() else { continue };
        let mut entry = RdmaEntry::default();
        for field in parts {
            match field.split_once('=') {
                Some(("hca_handle", v)) => entry.hca_handles = v.parse().unwrap_or(0),
                Some(("hca_object", v)) => entry.hca_objects = v.parse().unwrap_or(0),
                _ => {}
            }
        }
        map.insert(hca.to_string(), entry);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_keyed_parses_cpu_stat() {
        let map = parse_flat_keyed("usage_usec 4200\nuser_usec 3000\nsystem_usec 1200\n");
        assert_eq!(map.get("usage_usec"), Some(&4200));
        assert_eq!(map.get("system_usec"), Some(&1200));
    }

    #[test]
    fn limit_treats_max_as_unlimited() {
        assert_eq!(parse_limit("max\n"), None);
        assert_eq!(parse_limit("67108864\n"), Some(67_108_864));
        // v1's page-rounded i64::MAX sentinel.
        assert_eq!(parse_limit("9223372036854771712\n"), None);
    }

    #[test]
    fn blkio_skips_totals_and_normalizes_ops() {
        let entries = parse_blkio("8:0 Read 1024\n8:0 Write 2048\nTotal 3072\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, "read");
        assert_eq!(entries[1].value, 2048);
    }

    #[test]
    fn io_stat_splits_bytes_and_ios() {
        let stats = parse_io_stat("8:16 rbytes=1459200 wbytes=314773504 rios=192 wios=353\n");
        assert_eq!(stats.bytes.len(), 2);
        assert_eq!(stats.ios.len(), 2);
        assert_eq!(stats.bytes[0].major, 8);
        assert_eq!(stats.bytes[0].minor, 16);
        assert_eq!(stats.ios[1].value, 353);
    }

    #[test]
    fn rdma_parses_per_hca_counters() {
        let map = parse_rdma("mlx4_0 hca_handle=2 hca_object=2000\nocrdma1 hca_handle=3 hca_object=max\n");
        assert_eq!(
            map.get("mlx4_0"),
            Some(&RdmaEntry {
                hca_handles: 2,
                hca_objects: 2000
            })
        );
        assert_eq!(map.get("ocrdma1").unwrap().hca_objects, 0);
    }
}
