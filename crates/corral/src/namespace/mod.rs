//! Linux namespace specifications and kernel-ordering rules.
//!
//! A container either creates a namespace of a given kind or joins an
//! existing one by path. The order in which the shim performs these
//! operations is fixed by kernel rules: a created user namespace must come
//! first (it grants the capabilities the rest need), and a network
//! namespace joined by path comes last.

pub mod idmap;

use std::path::PathBuf;

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// One class of kernel isolation domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// Mount namespace (CLONE_NEWNS).
    Mount,
    /// UTS namespace (CLONE_NEWUTS).
    Uts,
    /// IPC namespace (CLONE_NEWIPC).
    Ipc,
    /// User namespace (CLONE_NEWUSER).
    User,
    /// PID namespace (CLONE_NEWPID).
    Pid,
    /// Network namespace (CLONE_NEWNET).
    Network,
    /// Cgroup namespace (CLONE_NEWCGROUP).
    Cgroup,
    /// Time namespace (CLONE_NEWTIME).
    Time,
}

impl NamespaceKind {
    /// The clone flag for this namespace kind.
    #[must_use]
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Network => CloneFlags::CLONE_NEWNET,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            // nix has no constant for time namespaces yet.
            Self::Time => CloneFlags::from_bits_retain(libc::CLONE_NEWTIME),
        }
    }

    /// The name under `/proc/<pid>/ns/`.
    #[must_use]
    pub fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::User => "user",
            Self::Pid => "pid",
            Self::Network => "net",
            Self::Cgroup => "cgroup",
            Self::Time => "time",
        }
    }
}

/// One namespace to create, or to join by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSpec {
    /// The namespace kind.
    pub kind: NamespaceKind,
    /// Path to an existing namespace to join; `None` creates a fresh one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl NamespaceSpec {
    /// A fresh namespace of the given kind.
    #[must_use]
    pub fn fresh(kind: NamespaceKind) -> Self {
        Self { kind, path: None }
    }

    /// Join an existing namespace by path.
    pub fn join(kind: NamespaceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }
}

/// The full namespace request of a container, split into the operations the
/// shim performs, already in kernel order.
#[derive(Debug, Clone)]
pub struct NamespacePlan {
    /// Namespaces joined by path, user first, network last.
    pub joins: Vec<(NamespaceKind, PathBuf)>,
    /// Clone flags for namespaces created fresh, excluding pid.
    pub create_flags: CloneFlags,
    /// Whether a fresh user namespace is created.
    pub new_user: bool,
    /// Whether a fresh pid namespace is created (needs the extra fork).
    pub new_pid: bool,
}

impl Default for NamespacePlan {
    fn default() -> Self {
        Self {
            joins: Vec::new(),
            create_flags: CloneFlags::empty(),
            new_user: false,
            new_pid: false,
        }
    }
}

impl NamespacePlan {
    /// Order the raw specification into the shim's operation plan.
    #[must_use]
    pub fn from_specs(specs: &[NamespaceSpec]) -> Self {
        let mut plan = Self::default();

        for spec in specs {
            match &spec.path {
                Some(path) => plan.joins.push((spec.kind, path.clone())),
                None => match spec.kind {
                    NamespaceKind::User => plan.new_user = true,
                    NamespaceKind::Pid => plan.new_pid = true,
                    kind => plan.create_flags |= kind.clone_flag(),
                },
            }
        }

        // User namespace joins must happen before anything that needs its
        // capabilities; a network namespace joined by path goes last.
        plan.joins.sort_by_key(|(kind, _)| match kind {
            NamespaceKind::User => 0,
            NamespaceKind::Network => 2,
            _ => 1,
        });

        plan
    }
}

/// A single uid or gid range mapping for a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First id inside the container.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Length of the mapped range.
    pub size: u32,
}

impl IdMapping {
    /// A 1:1 mapping of container root onto one host id.
    #[must_use]
    pub fn root_to(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_separates_create_and_join() {
        let specs = vec![
            NamespaceSpec::fresh(NamespaceKind::Mount),
            NamespaceSpec::fresh(NamespaceKind::Pid),
            NamespaceSpec::join(NamespaceKind::Network, "/run/netns/blue"),
            NamespaceSpec::fresh(NamespaceKind::User),
        ];
        let plan = NamespacePlan::from_specs(&specs);

        assert!(plan.new_user);
        assert!(plan.new_pid);
        assert!(plan.create_flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!plan.create_flags.contains(CloneFlags::CLONE_NEWPID));
        assert_eq!(plan.joins.len(), 1);
    }

    #[test]
    fn joins_ordered_user_first_network_last() {
        let specs = vec![
            NamespaceSpec::join(NamespaceKind::Network, "/run/netns/a"),
            NamespaceSpec::join(NamespaceKind::Ipc, "/proc/1/ns/ipc"),
            NamespaceSpec::join(NamespaceKind::User, "/proc/1/ns/user"),
        ];
        let plan = NamespacePlan::from_specs(&specs);
        let order: Vec<NamespaceKind> = plan.joins.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            order,
            vec![
                NamespaceKind::User,
                NamespaceKind::Ipc,
                NamespaceKind::Network
            ]
        );
    }
}
