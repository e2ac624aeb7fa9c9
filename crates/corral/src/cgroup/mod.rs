//! Cgroup management behind a hierarchy-version-agnostic contract.
//!
//! One contract, two implementations, chosen at construction time by
//! probing the filesystem type mounted at `/sys/fs/cgroup`.

pub mod devices;
pub mod stats;
mod v1;
mod v2;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_common::{Error, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

pub use devices::DeviceRule;
pub use stats::Stats;
pub use v1::CgroupV1Manager;
pub use v2::CgroupV2Manager;

/// Root of the cgroup filesystem.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Retries for `destroy` when the kernel reports EBUSY.
const DESTROY_RETRIES: u32 = 5;
/// Backoff between destroy retries.
const DESTROY_BACKOFF: Duration = Duration::from_millis(50);
/// Poll attempts for a freezer transition.
pub(crate) const FREEZE_POLL_BUDGET: u32 = 100;
/// Sleep between freezer polls.
pub(crate) const FREEZE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Freezer target states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezerState {
    /// All tasks stopped.
    Frozen,
    /// All tasks runnable.
    Thawed,
}

/// CPU limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuResources {
    /// Relative weight (v1 shares).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    /// Quota per period, in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// Period length, in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// Cpuset cpu list (`"0-2,4"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    /// Cpuset memory-node list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mems: Option<String>,
}

/// Memory limits, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryResources {
    /// Hard limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// Memory+swap limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
    /// Swappiness (0-100, v1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swappiness: Option<u64>,
    /// Soft reservation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,
    /// Kernel memory limit (v1 only, ignored by modern kernels).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<i64>,
}

/// Pid limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsResources {
    /// Maximum number of pids; `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

/// One per-device byte- or io-rate throttle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleDevice {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Rate limit (bytes/sec or ops/sec depending on the key).
    pub rate: u64,
}

/// Block-io limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlkioResources {
    /// Relative weight (10-1000 on v1, 1-10000 on v2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u64>,
    /// Leaf weight (v1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_weight: Option<u64>,
    /// Read bytes/sec throttles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_bps: Vec<ThrottleDevice>,
    /// Write bytes/sec throttles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_bps: Vec<ThrottleDevice>,
    /// Read ops/sec throttles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_iops: Vec<ThrottleDevice>,
    /// Write ops/sec throttles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_iops: Vec<ThrottleDevice>,
}

/// One hugetlb limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HugetlbLimit {
    /// Page size as the kernel names it (`"2MB"`, `"1GB"`).
    pub page_size: String,
    /// Limit in bytes.
    pub limit: u64,
}

/// RDMA limits for one HCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaLimit {
    /// Maximum HCA handles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hca_handles: Option<u32>,
    /// Maximum HCA objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hca_objects: Option<u32>,
}

/// One interface-to-priority entry for net_prio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfPrioMap {
    /// Interface name.
    pub interface: String,
    /// Priority.
    pub priority: u32,
}

/// The full per-subsystem resource specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    /// Memory limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    /// Pid limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsResources>,
    /// Block-io limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blkio: Option<BlkioResources>,
    /// Hugetlb limits per page size.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hugetlb: Vec<HugetlbLimit>,
    /// RDMA limits per HCA.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rdma: BTreeMap<String, RdmaLimit>,
    /// Network class id (v1 net_cls).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_cls_classid: Option<u32>,
    /// Network priority map (v1 net_prio).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net_prio_ifpriomap: Vec<IfPrioMap>,
    /// Device access rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceRule>,
    /// Target freezer state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freezer: Option<FreezerState>,
    /// Raw v2 key-value pairs, written verbatim after known keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unified: BTreeMap<String, String>,
}

/// The hierarchy-version-agnostic manager contract.
pub trait CgroupManager: std::fmt::Debug + Send {
    /// Ensure the cgroup exists and attach `pid`. Idempotent for an
    /// already-attached pid.
    fn apply(&self, pid: Pid) -> Result<()>;

    /// Write resource limits. Atomic per subsystem: a failed write rolls
    /// the subsystem back to its prior contents when recoverable; unknown
    /// or kernel-unsupported keys are skipped with a warning.
    fn set(&self, resources: &Resources) -> Result<()>;

    /// Collect a usage snapshot, reporting skipped controllers.
    fn stats(&self) -> Result<Stats>;

    /// Transition the freezer, polling until the kernel reports the target
    /// state or the poll budget runs out.
    fn freeze(&self, state: FreezerState) -> Result<()>;

    /// Remove the cgroup directory tree, retrying bounded on EBUSY.
    fn destroy(&self) -> Result<()>;

    /// Absolute path of a controller, for diagnostics.
    fn path(&self, subsystem: &str) -> Option<PathBuf>;

    /// Controllers that were skipped (rootless degradation).
    fn degraded(&self) -> &[String];
}

/// Probe the mounted hierarchy version and construct the matching manager.
///
/// `cgroup_path` is the container's path relative to the hierarchy root
/// (e.g. `corral/<id>`).
pub fn probe(cgroup_path: &Path, rootless: bool) -> Result<Box<dyn CgroupManager>> {
    if is_cgroup2() {
        Ok(Box::new(CgroupV2Manager::new(cgroup_path, rootless)?))
    } else {
        Ok(Box::new(CgroupV1Manager::new(cgroup_path, rootless)?))
    }
}

/// True when `/sys/fs/cgroup` is a unified (v2) mount.
#[must_use]
pub fn is_cgroup2() -> bool {
    #[cfg(target_os = "linux")]
    {
        match nix::sys::statfs::statfs(CGROUP_ROOT) {
            Ok(fs) => fs.filesystem_type() == nix::sys::statfs::CGROUP2_SUPER_MAGIC,
            Err(_) => false,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Write `value` to `path` only when the current contents differ.
///
/// Returns whether a write happened. A missing file is reported as an
/// unsupported key to the caller.
pub(crate) fn write_if_changed(path: &Path, value: &str) -> Result<bool> {
    match std::fs::read_to_string(path) {
        Ok(current) if current.trim() == value => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::KernelUnsupported {
                feature: path.display().to_string(),
                detail: "file not present".to_string(),
            })
        }
        // Unreadable but possibly writable (some v1 files are write-only).
        Err(_) => {}
    }

    std::fs::write(path, value).map_err(|e| map_write_err(path, e))?;
    Ok(true)
}

pub(crate) fn map_write_err(path: &Path, e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied {
            operation: format!("write {}", path.display()),
        },
        std::io::ErrorKind::NotFound => Error::KernelUnsupported {
            feature: path.display().to_string(),
            detail: "file not present".to_string(),
        },
        _ => Error::Io(e),
    }
}

/// Apply one subsystem's write plan atomically: a hard failure rolls the
/// already-written keys back to their prior contents; unsupported keys are
/// skipped with a warning.
pub(crate) fn apply_plan(subsystem: &str, plan: &[(PathBuf, String)]) -> Result<()> {
    let mut written: Vec<(PathBuf, String)> = Vec::new();

    for (path, value) in plan {
        let prior = std::fs::read_to_string(path).unwrap_or_default();
        match write_if_changed(path, value) {
            Ok(true) => written.push((path.clone(), prior)),
            Ok(false) => {}
            Err(e) if e.is_kernel_gap() => {
                tracing::warn!(
                    controller = subsystem,
                    key = %path.display(),
                    "Unsupported key ignored"
                );
            }
            Err(e) => {
                for (path, prior) in written.iter().rev() {
                    if let Err(restore) = std::fs::write(path, prior.trim()) {
                        tracing::warn!(
                            key = %path.display(),
                            error = %restore,
                            "Rollback write failed"
                        );
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Remove a cgroup directory tree bottom-up, retrying on EBUSY.
pub(crate) fn remove_tree(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }

    // Children first; only directories exist inside a cgroup.
    let mut stack = vec![root.to_path_buf()];
    let mut order = Vec::new();
    while let Some(dir) = stack.pop() {
        order.push(dir.clone());
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    stack.push(entry.path());
                }
            }
        }
    }

    for dir in order.iter().rev() {
        let mut attempt = 0;
        loop {
            match std::fs::remove_dir(dir) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    attempt += 1;
                    if attempt > DESTROY_RETRIES {
                        return Err(Error::ResourceBusy {
                            resource: dir.display().to_string(),
                        });
                    }
                    std::thread::sleep(DESTROY_BACKOFF);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_if_changed_skips_identical_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pids.max");
        std::fs::write(&path, "10\n").unwrap();

        assert!(!write_if_changed(&path, "10").unwrap());
        assert!(write_if_changed(&path, "20").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "20");
    }

    #[test]
    fn write_if_changed_reports_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_if_changed(&dir.path().join("nope.max"), "1").unwrap_err();
        assert!(err.is_kernel_gap());
    }

    #[test]
    fn remove_tree_handles_nesting_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("corral").join("abc");
        std::fs::create_dir_all(root.join("nested")).unwrap();

        remove_tree(&root).unwrap();
        assert!(!root.exists());
        // Absent tree is not an error.
        remove_tree(&root).unwrap();
    }
}
