//! Legacy (v1) cgroup hierarchy: one mount per controller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use corral_common::{Error, Result};
use nix::unistd::Pid;

use super::devices;
use super::stats::{self, Stats};
use super::{
    apply_plan, map_write_err, remove_tree, CgroupManager, FreezerState, Resources,
    CGROUP_ROOT, FREEZE_POLL_BUDGET, FREEZE_POLL_INTERVAL,
};

/// Controllers the manager knows how to drive.
const CONTROLLERS: &[&str] = &[
    "cpu", "cpuset", "cpuacct", "memory", "pids", "blkio", "devices", "freezer", "net_cls",
    "net_prio", "hugetlb", "rdma",
];

#[derive(Debug)]
struct Subsystem {
    name: &'static str,
    /// Absolute path of this container's directory in the controller.
    path: PathBuf,
}

/// Manager for the per-controller v1 hierarchies.
#[derive(Debug)]
pub struct CgroupV1Manager {
    subsystems: Vec<Subsystem>,
    degraded: Vec<String>,
}

impl CgroupV1Manager {
    /// Create the per-controller directories for `rel_path`
    /// (e.g. `corral/<id>`).
    ///
    /// Controllers that are not mounted, or that a rootless invoker cannot
    /// create, are recorded as degraded and skipped from then on.
    pub fn new(rel_path: &Path, rootless: bool) -> Result<Self> {
        let mut subsystems = Vec::new();
        let mut degraded = Vec::new();

        for &name in CONTROLLERS {
            let mount = Path::new(CGROUP_ROOT).join(name);
            if !mount.is_dir() {
                tracing::warn!(controller = name, "Controller not mounted, skipping");
                degraded.push(name.to_string());
                continue;
            }

            let path = mount.join(rel_path);
            if let Err(e) = std::fs::create_dir_all(&path) {
                let denied = e.kind() == std::io::ErrorKind::PermissionDenied;
                if denied && !rootless {
                    return Err(Error::PermissionDenied {
                        operation: format!("create cgroup {}", path.display()),
                    });
                }
                tracing::warn!(
                    controller = name,
                    error = %e,
                    "Cannot create controller directory, degrading"
                );
                degraded.push(name.to_string());
                continue;
            }

            subsystems.push(Subsystem { name, path });
        }

        if subsystems.is_empty() {
            return Err(Error::KernelUnsupported {
                feature: "cgroup v1 controllers".to_string(),
                detail: "no usable controller mounts under /sys/fs/cgroup".to_string(),
            });
        }

        Ok(Self {
            subsystems,
            degraded,
        })
    }

    fn subsystem(&self, name: &str) -> Option<&Subsystem> {
        self.subsystems.iter().find(|s| s.name == name)
    }

    /// The kernel refuses to attach pids to a cpuset whose `cpus`/`mems`
    /// are empty; inherit them from the parent directory first.
    fn inherit_cpuset(&self, sub: &Subsystem) -> Result<()> {
        for file in ["cpuset.cpus", "cpuset.mems"] {
            let path = sub.path.join(file);
            let current = std::fs::read_to_string(&path).unwrap_or_default();
            if !current.trim().is_empty() {
                continue;
            }
            let parent = sub
                .path
                .parent()
                .map(|p| p.join(file))
                .and_then(|p| std::fs::read_to_string(p).ok())
                .unwrap_or_default();
            if !parent.trim().is_empty() {
                std::fs::write(&path, parent.trim()).map_err(|e| map_write_err(&path, e))?;
            }
        }
        Ok(())
    }

    fn set_devices(&self, sub: &Subsystem, rules: &[devices::DeviceRule]) -> Result<()> {
        let list_path = sub.path.join("devices.list");
        let current = std::fs::read_to_string(&list_path).unwrap_or_default();
        let writes = devices::v1_diff(&current, rules);
        if writes.is_empty() {
            return Ok(());
        }

        let deny_path = sub.path.join("devices.deny");
        let allow_path = sub.path.join("devices.allow");
        for entry in &writes.deny {
            std::fs::write(&deny_path, entry).map_err(|e| map_write_err(&deny_path, e))?;
        }
        for entry in &writes.allow {
            std::fs::write(&allow_path, entry).map_err(|e| map_write_err(&allow_path, e))?;
        }
        tracing::debug!(
            denied = writes.deny.len(),
            allowed = writes.allow.len(),
            "Updated device rules"
        );
        Ok(())
    }

    fn set_net_prio(&self, sub: &Subsystem, map: &[super::IfPrioMap]) -> Result<()> {
        let path = sub.path.join("net_prio.ifpriomap");
        let current: BTreeMap<String, u32> = std::fs::read_to_string(&path)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| {
                let (iface, prio) = l.split_once(' ')?;
                Some((iface.to_string(), prio.trim().parse().ok()?))
            })
            .collect();

        for entry in map {
            if current.get(&entry.interface) == Some(&entry.priority) {
                continue;
            }
            let line = format!("{} {}", entry.interface, entry.priority);
            std::fs::write(&path, &line).map_err(|e| map_write_err(&path, e))?;
        }
        Ok(())
    }

    fn set_rdma(&self, sub: &Subsystem, limits: &BTreeMap<String, super::RdmaLimit>) -> Result<()> {
        let path = sub.path.join("rdma.max");
        for (hca, limit) in limits {
            let handles = limit
                .hca_handles
                .map_or_else(|| "max".to_string(), |v| v.to_string());
            let objects = limit
                .hca_objects
                .map_or_else(|| "max".to_string(), |v| v.to_string());
            let line = format!("{hca} hca_handle={handles} hca_object={objects}");
            std::fs::write(&path, &line).map_err(|e| map_write_err(&path, e))?;
        }
        Ok(())
    }
}

impl CgroupManager for CgroupV1Manager {
    fn apply(&self, pid: Pid) -> Result<()> {
        for sub in &self.subsystems {
            if sub.name == "cpuset" {
                self.inherit_cpuset(sub)?;
            }

            let procs_path = sub.path.join("cgroup.procs");
            let current = std::fs::read_to_string(&procs_path).unwrap_or_default();
            if current.lines().any(|l| l.trim() == pid.to_string()) {
                continue;
            }
            std::fs::write(&procs_path, pid.to_string())
                .map_err(|e| map_write_err(&procs_path, e))?;
        }

        tracing::debug!(%pid, subsystems = self.subsystems.len(), "Attached pid to v1 cgroups");
        Ok(())
    }

    fn set(&self, r: &Resources) -> Result<()> {
        if let (Some(cpu), Some(sub)) = (&r.cpu, self.subsystem("cpu")) {
            let mut plan = Vec::new();
            if let Some(shares) = cpu.shares {
                plan.push((sub.path.join("cpu.shares"), shares.to_string()));
            }
            if let Some(period) = cpu.period {
                plan.push((sub.path.join("cpu.cfs_period_us"), period.to_string()));
            }
            if let Some(quota) = cpu.quota {
                plan.push((sub.path.join("cpu.cfs_quota_us"), quota.to_string()));
            }
            apply_plan("cpu", &plan)?;
        }

        if let Some(cpu) = &r.cpu {
            if let Some(sub) = self.subsystem("cpuset") {
                let mut plan = Vec::new();
                if let Some(cpus) = &cpu.cpus {
                    plan.push((sub.path.join("cpuset.cpus"), cpus.clone()));
                }
                if let Some(mems) = &cpu.mems {
                    plan.push((sub.path.join("cpuset.mems"), mems.clone()));
                }
                apply_plan("cpuset", &plan)?;
            }
        }

        if let (Some(memory), Some(sub)) = (&r.memory, self.subsystem("memory")) {
            let mut plan = Vec::new();
            if let Some(limit) = memory.limit {
                plan.push((sub.path.join("memory.limit_in_bytes"), limit.to_string()));
            }
            if let Some(swap) = memory.swap {
                plan.push((
                    sub.path.join("memory.memsw.limit_in_bytes"),
                    swap.to_string(),
                ));
            }
            if let Some(reservation) = memory.reservation {
                plan.push((
                    sub.path.join("memory.soft_limit_in_bytes"),
                    reservation.to_string(),
                ));
            }
            if let Some(kernel) = memory.kernel {
                plan.push((
                    sub.path.join("memory.kmem.limit_in_bytes"),
                    kernel.to_string(),
                ));
            }
            // swappiness after limit_in_bytes, per kernel ordering rules
            if let Some(swappiness) = memory.swappiness {
                plan.push((sub.path.join("memory.swappiness"), swappiness.to_string()));
            }
            apply_plan("memory", &plan)?;
        }

        if let (Some(pids), Some(sub)) = (&r.pids, self.subsystem("pids")) {
            let value = match pids.max {
                Some(max) if max > 0 => max.to_string(),
                _ => "max".to_string(),
            };
            apply_plan("pids", &[(sub.path.join("pids.max"), value)])?;
        }

        if let (Some(blkio), Some(sub)) = (&r.blkio, self.subsystem("blkio")) {
            let mut plan = Vec::new();
            if let Some(weight) = blkio.weight {
                plan.push((sub.path.join("blkio.weight"), weight.to_string()));
            }
            if let Some(leaf) = blkio.leaf_weight {
                plan.push((sub.path.join("blkio.leaf_weight"), leaf.to_string()));
            }
            for (file, throttles) in [
                ("blkio.throttle.read_bps_device", &blkio.read_bps),
                ("blkio.throttle.write_bps_device", &blkio.write_bps),
                ("blkio.throttle.read_iops_device", &blkio.read_iops),
                ("blkio.throttle.write_iops_device", &blkio.write_iops),
            ] {
                for t in throttles {
                    plan.push((
                        sub.path.join(file),
                        format!("{}:{} {}", t.major, t.minor, t.rate),
                    ));
                }
            }
            apply_plan("blkio", &plan)?;
        }

        if let Some(sub) = self.subsystem("hugetlb") {
            let mut plan = Vec::new();
            for limit in &r.hugetlb {
                plan.push((
                    sub.path
                        .join(format!("hugetlb.{}.limit_in_bytes", limit.page_size)),
                    limit.limit.to_string(),
                ));
            }
            apply_plan("hugetlb", &plan)?;
        }

        if !r.devices.is_empty() {
            if let Some(sub) = self.subsystem("devices") {
                self.set_devices(sub, &r.devices)?;
            } else {
                tracing::warn!("devices controller unavailable, rules skipped");
            }
        }

        if let (Some(classid), Some(sub)) = (r.net_cls_classid, self.subsystem("net_cls")) {
            apply_plan(
                "net_cls",
                &[(sub.path.join("net_cls.classid"), classid.to_string())],
            )?;
        }

        if !r.net_prio_ifpriomap.is_empty() {
            if let Some(sub) = self.subsystem("net_prio") {
                self.set_net_prio(sub, &r.net_prio_ifpriomap)?;
            }
        }

        if !r.rdma.is_empty() {
            if let Some(sub) = self.subsystem("rdma") {
                self.set_rdma(sub, &r.rdma)?;
            }
        }

        if let Some(state) = r.freezer {
            self.freeze(state)?;
        }

        Ok(())
    }

    fn stats(&self) -> Result<Stats> {
        let mut s = Stats {
            degraded: self.degraded.clone(),
            ..Default::default()
        };

        if let Some(sub) = self.subsystem("cpuacct") {
            let read = |f: &str| std::fs::read_to_string(sub.path.join(f)).unwrap_or_default();
            // cpuacct.usage is nanoseconds; cpuacct.stat is USER_HZ ticks.
            s.cpu.total_usec = read("cpuacct.usage").trim().parse::<u64>().unwrap_or(0) / 1_000;
            let stat = stats::parse_flat_keyed(&read("cpuacct.stat"));
            s.cpu.user_usec = stat.get("user").copied().unwrap_or(0) * 10_000;
            s.cpu.system_usec = stat.get("system").copied().unwrap_or(0) * 10_000;
            s.cpu.per_cpu_usec = stats::parse_per_cpu(&read("cpuacct.usage_percpu"))
                .into_iter()
                .map(|ns| ns / 1_000)
                .collect();
        }

        if let Some(sub) = self.subsystem("memory") {
            let read = |f: &str| std::fs::read_to_string(sub.path.join(f)).unwrap_or_default();
            s.memory.usage = read("memory.usage_in_bytes").trim().parse().unwrap_or(0);
            s.memory.limit = stats::parse_limit(&read("memory.limit_in_bytes"));
            s.memory.failcnt = read("memory.failcnt").trim().parse().unwrap_or(0);
            let stat = stats::parse_flat_keyed(&read("memory.stat"));
            s.memory.cache = stat.get("cache").copied().unwrap_or(0);
            s.memory.rss = stat.get("rss").copied().unwrap_or(0);
            let memsw: u64 = read("memory.memsw.usage_in_bytes")
                .trim()
                .parse()
                .unwrap_or(0);
            s.memory.swap = memsw.saturating_sub(s.memory.usage);
        }

        if let Some(sub) = self.subsystem("pids") {
            let read = |f: &str| std::fs::read_to_string(sub.path.join(f)).unwrap_or_default();
            s.pids.current = read("pids.current").trim().parse().unwrap_or(0);
            s.pids.max = stats::parse_limit(&read("pids.max"));
        }

        if let Some(sub) = self.subsystem("blkio") {
            let read = |f: &str| std::fs::read_to_string(sub.path.join(f)).unwrap_or_default();
            s.io.bytes = stats::parse_blkio(&read("blkio.throttle.io_service_bytes"));
            s.io.ios = stats::parse_blkio(&read("blkio.throttle.io_serviced"));
        }

        if let Some(sub) = self.subsystem("hugetlb") {
            if let Ok(entries) = std::fs::read_dir(&sub.path) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let Some(size) = name
                        .strip_prefix("hugetlb.")
                        .and_then(|n| n.strip_suffix(".usage_in_bytes"))
                    else {
                        continue;
                    };
                    let read =
                        |f: String| std::fs::read_to_string(sub.path.join(f)).unwrap_or_default();
                    s.hugetlb.insert(
                        size.to_string(),
                        stats::HugetlbStats {
                            usage: read(format!("hugetlb.{size}.usage_in_bytes"))
                                .trim()
                                .parse()
                                .unwrap_or(0),
                            max: stats::parse_limit(&read(format!(
                                "hugetlb.{size}.limit_in_bytes"
                            ))),
                            failcnt: read(format!("hugetlb.{size}.failcnt"))
                                .trim()
                                .parse()
                                .unwrap_or(0),
                        },
                    );
                }
            }
        }

        if let Some(sub) = self.subsystem("rdma") {
            let content = std::fs::read_to_string(sub.path.join("rdma.current")).unwrap_or_default();
            s.rdma = stats::parse_rdma(&content);
        }

        if let Some(sub) = self.subsystem("net_cls") {
            s.network_classid = std::fs::read_to_string(sub.path.join("net_cls.classid"))
                .ok()
                .and_then(|v| v.trim().parse().ok());
        }

        Ok(s)
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        let sub = self
            .subsystem("freezer")
            .ok_or_else(|| Error::KernelUnsupported {
                feature: "freezer controller".to_string(),
                detail: "not mounted or not delegated".to_string(),
            })?;

        let target = match state {
            FreezerState::Frozen => "FROZEN",
            FreezerState::Thawed => "THAWED",
        };
        let path = sub.path.join("freezer.state");
        std::fs::write(&path, target).map_err(|e| map_write_err(&path, e))?;

        for _ in 0..FREEZE_POLL_BUDGET {
            let current = std::fs::read_to_string(&path).unwrap_or_default();
            if current.trim() == target {
                tracing::debug!(state = target, "Freezer transition complete");
                return Ok(());
            }
            std::thread::sleep(FREEZE_POLL_INTERVAL);
        }

        Err(Error::Timeout {
            operation: format!("freezer transition to {target}"),
        })
    }

    fn destroy(&self) -> Result<()> {
        // Only this container's subtree; parents and siblings belong to
        // other creators.
        for sub in &self.subsystems {
            remove_tree(&sub.path)?;
        }
        Ok(())
    }

    fn path(&self, subsystem: &str) -> Option<PathBuf> {
        self.subsystem(subsystem).map(|s| s.path.clone())
    }

    fn degraded(&self) -> &[String] {
        &self.degraded
    }
}
