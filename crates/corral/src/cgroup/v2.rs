//! Unified (v2) cgroup hierarchy.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use corral_common::{Error, Result};
use nix::unistd::Pid;

use super::devices;
use super::stats::{self, Stats};
use super::{
    apply_plan, map_write_err, remove_tree, CgroupManager, FreezerState, Resources, CGROUP_ROOT,
    FREEZE_POLL_BUDGET, FREEZE_POLL_INTERVAL,
};

/// Controllers the manager asks the parent to delegate.
const WANTED: &[&str] = &["cpu", "cpuset", "memory", "pids", "io", "hugetlb"];

/// Manager for the unified hierarchy.
#[derive(Debug)]
pub struct CgroupV2Manager {
    /// Absolute path of the container's cgroup.
    path: PathBuf,
    /// Controllers available in this cgroup per `cgroup.controllers`.
    controllers: BTreeSet<String>,
    degraded: Vec<String>,
    rootless: bool,
}

impl CgroupV2Manager {
    /// Create the cgroup for `rel_path` (e.g. `corral/<id>`) and enable the
    /// controllers we need in the parents' `cgroup.subtree_control`.
    pub fn new(rel_path: &Path, rootless: bool) -> Result<Self> {
        let path = Path::new(CGROUP_ROOT).join(rel_path);

        enable_subtree_controllers(rel_path, rootless)?;

        std::fs::create_dir_all(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied {
                    operation: format!("create cgroup {}", path.display()),
                }
            } else {
                Error::Io(e)
            }
        })?;

        let controllers: BTreeSet<String> = std::fs::read_to_string(path.join("cgroup.controllers"))
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let degraded: Vec<String> = WANTED
            .iter()
            .filter(|c| !controllers.contains(**c))
            .map(|c| (*c).to_string())
            .collect();
        for controller in &degraded {
            tracing::warn!(controller, "Controller not delegated, degrading");
        }

        Ok(Self {
            path,
            controllers,
            degraded,
            rootless,
        })
    }

    fn has(&self, controller: &str) -> bool {
        self.controllers.contains(controller)
    }

    fn attach_device_program(&self, rules: &[devices::DeviceRule]) -> Result<()> {
        let prog = devices::v2_program(rules)?;

        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;

            let dir = std::fs::File::open(&self.path)?;
            match devices::load_and_attach(&prog, dir.as_raw_fd()) {
                Ok(()) => Ok(()),
                Err(e) if self.rootless => {
                    tracing::warn!(error = %e, "Device program skipped (rootless)");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = prog;
            Err(Error::Unsupported {
                operation: "cgroup device program".to_string(),
            })
        }
    }
}

/// Enable `WANTED` controllers along the chain of parents. Rootless
/// invokers often cannot write the root's `subtree_control`; that is the
/// degradation path, not an error.
fn enable_subtree_controllers(rel_path: &Path, rootless: bool) -> Result<()> {
    let root = Path::new(CGROUP_ROOT);
    let mut dir = root.to_path_buf();

    let mut components = rel_path.components().peekable();
    while components.peek().is_some() {
        let available: BTreeSet<String> = std::fs::read_to_string(dir.join("cgroup.controllers"))
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let wanted: Vec<String> = WANTED
            .iter()
            .filter(|c| available.contains(**c))
            .map(|c| format!("+{c}"))
            .collect();

        if !wanted.is_empty() {
            let control = dir.join("cgroup.subtree_control");
            if let Err(e) = std::fs::write(&control, wanted.join(" ")) {
                if rootless || e.kind() == std::io::ErrorKind::PermissionDenied {
                    tracing::debug!(path = %control.display(), error = %e, "Cannot delegate controllers");
                } else if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(Error::Io(e));
                }
            }
        }

        let next = components.next().expect("peeked");
        dir = dir.join(next);
        if components.peek().is_some() {
            // Intermediate directories must exist before their
            // subtree_control can be written.
            if let Err(e) = std::fs::create_dir_all(&dir) {
                if !rootless {
                    return Err(Error::Io(e));
                }
            }
        }
    }

    Ok(())
}

/// Convert v1 cpu shares (2-262144) to a v2 weight (1-10000).
#[must_use]
pub fn shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 100;
    }
    1 + ((shares.saturating_sub(2)) * 9999) / 262142
}

impl CgroupManager for CgroupV2Manager {
    fn apply(&self, pid: Pid) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        let current = std::fs::read_to_string(&procs_path).unwrap_or_default();
        if current.lines().any(|l| l.trim() == pid.to_string()) {
            return Ok(());
        }
        std::fs::write(&procs_path, pid.to_string()).map_err(|e| map_write_err(&procs_path, e))?;
        tracing::debug!(%pid, path = %self.path.display(), "Attached pid to cgroup");
        Ok(())
    }

    fn set(&self, r: &Resources) -> Result<()> {
        if let Some(cpu) = &r.cpu {
            if self.has("cpu") {
                let mut plan = Vec::new();
                if let Some(shares) = cpu.shares {
                    plan.push((
                        self.path.join("cpu.weight"),
                        shares_to_weight(shares).to_string(),
                    ));
                }
                if cpu.quota.is_some() || cpu.period.is_some() {
                    let period = cpu.period.unwrap_or(100_000);
                    let quota = match cpu.quota {
                        Some(q) if q > 0 => q.to_string(),
                        _ => "max".to_string(),
                    };
                    plan.push((self.path.join("cpu.max"), format!("{quota} {period}")));
                }
                apply_plan("cpu", &plan)?;
            }
            if self.has("cpuset") {
                let mut plan = Vec::new();
                if let Some(cpus) = &cpu.cpus {
                    plan.push((self.path.join("cpuset.cpus"), cpus.clone()));
                }
                if let Some(mems) = &cpu.mems {
                    plan.push((self.path.join("cpuset.mems"), mems.clone()));
                }
                apply_plan("cpuset", &plan)?;
            }
        }

        if let Some(memory) = &r.memory {
            if self.has("memory") {
                let mut plan = Vec::new();
                if let Some(limit) = memory.limit {
                    let value = if limit < 0 {
                        "max".to_string()
                    } else {
                        limit.to_string()
                    };
                    plan.push((self.path.join("memory.max"), value));
                }
                if let Some(reservation) = memory.reservation {
                    plan.push((self.path.join("memory.low"), reservation.to_string()));
                }
                if let Some(swap) = memory.swap {
                    // v1 swap is memory+swap; v2 wants swap alone.
                    let value = match (swap, memory.limit) {
                        (s, _) if s < 0 => "max".to_string(),
                        (s, Some(l)) if l > 0 => (s - l).max(0).to_string(),
                        (s, _) => s.to_string(),
                    };
                    plan.push((self.path.join("memory.swap.max"), value));
                }
                if memory.swappiness.is_some() {
                    tracing::warn!("memory.swappiness has no v2 equivalent, ignored");
                }
                if memory.kernel.is_some() {
                    tracing::warn!("kernel memory limits have no v2 equivalent, ignored");
                }
                apply_plan("memory", &plan)?;
            }
        }

        if let Some(pids) = &r.pids {
            if self.has("pids") {
                let value = match pids.max {
                    Some(max) if max > 0 => max.to_string(),
                    _ => "max".to_string(),
                };
                apply_plan("pids", &[(self.path.join("pids.max"), value)])?;
            }
        }

        if let Some(blkio) = &r.blkio {
            if self.has("io") {
                let mut plan = Vec::new();
                if let Some(weight) = blkio.weight {
                    plan.push((self.path.join("io.weight"), format!("default {weight}")));
                }
                for (key, throttles) in [
                    ("rbps", &blkio.read_bps),
                    ("wbps", &blkio.write_bps),
                    ("riops", &blkio.read_iops),
                    ("wiops", &blkio.write_iops),
                ] {
                    for t in throttles {
                        plan.push((
                            self.path.join("io.max"),
                            format!("{}:{} {key}={}", t.major, t.minor, t.rate),
                        ));
                    }
                }
                apply_plan("io", &plan)?;
            }
        }

        if !r.hugetlb.is_empty() && self.has("hugetlb") {
            let mut plan = Vec::new();
            for limit in &r.hugetlb {
                plan.push((
                    self.path.join(format!("hugetlb.{}.max", limit.page_size)),
                    limit.limit.to_string(),
                ));
            }
            apply_plan("hugetlb", &plan)?;
        }

        if !r.devices.is_empty() {
            self.attach_device_program(&r.devices)?;
        }

        // Raw keys go last so they can override the converted ones.
        if !r.unified.is_empty() {
            let mut plan = Vec::new();
            for (key, value) in &r.unified {
                plan.push((self.path.join(key), value.clone()));
            }
            apply_plan("unified", &plan)?;
        }

        if let Some(state) = r.freezer {
            self.freeze(state)?;
        }

        Ok(())
    }

    fn stats(&self) -> Result<Stats> {
        let read = |f: &str| std::fs::read_to_string(self.path.join(f)).unwrap_or_default();

        let mut s = Stats {
            degraded: self.degraded.clone(),
            ..Default::default()
        };

        let cpu = stats::parse_flat_keyed(&read("cpu.stat"));
        s.cpu.total_usec = cpu.get("usage_usec").copied().unwrap_or(0);
        s.cpu.user_usec = cpu.get("user_usec").copied().unwrap_or(0);
        s.cpu.system_usec = cpu.get("system_usec").copied().unwrap_or(0);

        s.memory.usage = read("memory.current").trim().parse().unwrap_or(0);
        s.memory.limit = stats::parse_limit(&read("memory.max"));
        s.memory.swap = read("memory.swap.current").trim().parse().unwrap_or(0);
        let mem_stat = stats::parse_flat_keyed(&read("memory.stat"));
        s.memory.cache = mem_stat.get("file").copied().unwrap_or(0);
        s.memory.rss = mem_stat.get("anon").copied().unwrap_or(0);
        let events = stats::parse_flat_keyed(&read("memory.events"));
        s.memory.failcnt = events.get("max").copied().unwrap_or(0);

        s.pids.current = read("pids.current").trim().parse().unwrap_or(0);
        s.pids.max = stats::parse_limit(&read("pids.max"));

        s.io = stats::parse_io_stat(&read("io.stat"));

        if let Ok(entries) = std::fs::read_dir(&self.path) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(size) = name
                    .strip_prefix("hugetlb.")
                    .and_then(|n| n.strip_suffix(".current"))
                else {
                    continue;
                };
                s.hugetlb.insert(
                    size.to_string(),
                    stats::HugetlbStats {
                        usage: read(&format!("hugetlb.{size}.current"))
                            .trim()
                            .parse()
                            .unwrap_or(0),
                        max: stats::parse_limit(&read(&format!("hugetlb.{size}.max"))),
                        failcnt: stats::parse_flat_keyed(&read(&format!(
                            "hugetlb.{size}.events"
                        )))
                        .get("max")
                        .copied()
                        .unwrap_or(0),
                    },
                );
            }
        }

        s.rdma = stats::parse_rdma(&read("rdma.current"));

        Ok(s)
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        let target = match state {
            FreezerState::Frozen => "1",
            FreezerState::Thawed => "0",
        };
        let path = self.path.join("cgroup.freeze");
        std::fs::write(&path, target).map_err(|e| map_write_err(&path, e))?;

        let events_path = self.path.join("cgroup.events");
        for _ in 0..FREEZE_POLL_BUDGET {
            let events = std::fs::read_to_string(&events_path).unwrap_or_default();
            let frozen = stats::parse_flat_keyed(&events)
                .get("frozen")
                .copied()
                .unwrap_or(0);
            let reached = match state {
                FreezerState::Frozen => frozen == 1,
                FreezerState::Thawed => frozen == 0,
            };
            if reached {
                tracing::debug!(?state, "Freezer transition complete");
                return Ok(());
            }
            std::thread::sleep(FREEZE_POLL_INTERVAL);
        }

        Err(Error::Timeout {
            operation: format!("freezer transition to {state:?}"),
        })
    }

    fn destroy(&self) -> Result<()> {
        // Only this container's subtree; parents belong to other creators.
        remove_tree(&self.path)
    }

    fn path(&self, subsystem: &str) -> Option<PathBuf> {
        // One directory serves every controller on the unified hierarchy.
        if subsystem == "unified" || self.has(subsystem) {
            Some(self.path.clone())
        } else {
            None
        }
    }

    fn degraded(&self) -> &[String] {
        &self.degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_conversion_spans_the_weight_range() {
        assert_eq!(shares_to_weight(0), 100);
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262144), 10000);
        // The docker default lands near the v2 default.
        let default = shares_to_weight(1024);
        assert!((30..=50).contains(&default), "got {default}");
    }
}
