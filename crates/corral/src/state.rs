//! Persisted container state.
//!
//! One JSON record per container, written atomically (tempfile + rename)
//! and serialized by an exclusive lock on a sibling lock file. A state file
//! is either fully written or absent; readers never observe a partial
//! record.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use corral_common::{Error, Result, RuntimePaths};
use rustix::fs::{flock, FlockOperation};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Observable container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created, init waiting on the start gate.
    Created,
    /// Init process running.
    Running,
    /// Frozen via the cgroup freezer.
    Paused,
    /// Init process gone.
    Stopped,
}

impl ContainerStatus {
    /// Whether `start` is legal from this status.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Created)
    }

    /// Whether signals may be delivered.
    #[must_use]
    pub const fn can_kill(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether `pause` is legal.
    #[must_use]
    pub const fn can_pause(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether `resume` is legal.
    #[must_use]
    pub const fn can_resume(self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Whether `delete` is legal.
    #[must_use]
    pub const fn can_delete(self) -> bool {
        matches!(self, Self::Stopped | Self::Created)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// The persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    /// Container id.
    pub id: String,
    /// Current status.
    pub status: ContainerStatus,
    /// Init pid, while one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Init start time from `/proc`, for pid-reuse detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    /// Cgroup paths: per controller for v1, one `unified` entry for v2.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cgroup_paths: BTreeMap<String, PathBuf>,
    /// Namespace paths of the init process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_paths: BTreeMap<String, PathBuf>,
    /// The effective configuration.
    pub config: Config,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
}

impl ContainerState {
    /// A fresh record for a container being created.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            id: config.id.to_string(),
            status: ContainerStatus::Created,
            pid: None,
            start_time: None,
            cgroup_paths: BTreeMap::new(),
            namespace_paths: BTreeMap::new(),
            config,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Held for the duration of a state transition; the lock releases when the
/// guard drops.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
}

/// The on-disk store of container records.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: RuntimePaths,
}

impl StateStore {
    /// A store over the given layout.
    #[must_use]
    pub fn new(paths: RuntimePaths) -> Self {
        Self { paths }
    }

    /// The layout this store uses.
    #[must_use]
    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Take the exclusive per-container lock, blocking until it is free.
    pub fn lock(&self, id: &str) -> Result<StateLock> {
        let path = self.paths.lock_file(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        flock(&file, FlockOperation::LockExclusive).map_err(|e| Error::Internal {
            message: format!("flock {}: {e}", path.display()),
        })?;
        Ok(StateLock { _file: file })
    }

    /// Write the record atomically: the file either holds the complete new
    /// contents or whatever was there before.
    pub fn save(&self, state: &ContainerState) -> Result<()> {
        let path = self.paths.state_file(&state.id);
        let dir = path.parent().ok_or_else(|| Error::Internal {
            message: "state file has no parent directory".to_string(),
        })?;
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(state).map_err(|e| Error::Internal {
            message: format!("state serialization: {e}"),
        })?;

        let tmp = dir.join(".state.json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(id = %state.id, status = %state.status, "State saved");
        Ok(())
    }

    /// Load a record.
    pub fn load(&self, id: &str) -> Result<ContainerState> {
        let path = self.paths.state_file(id);
        let json = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ContainerNotFound { id: id.to_string() }
            } else {
                Error::Io(e)
            }
        })?;
        serde_json::from_slice(&json).map_err(|e| Error::Internal {
            message: format!("state file {} does not parse: {e}", path.display()),
        })
    }

    /// Whether a record exists.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.paths.state_file(id).exists()
    }

    /// Remove the container's state directory.
    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.paths.container_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            tracing::debug!(id, "State removed");
        }
        Ok(())
    }

    /// Ids with a complete state record.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let root = self.paths.root();
        if !root.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.exists(name) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_common::ContainerId;
    use crate::config::{CapabilitySpec, CgroupSpec, ProcessSpec};

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(RuntimePaths::rooted_at(dir.path()));
        (dir, store)
    }

    fn sample_state(id: &str) -> ContainerState {
        let config = Config {
            id: ContainerId::new(id).unwrap(),
            namespaces: vec![],
            rootfs: PathBuf::from("/tmp/rootfs"),
            mounts: vec![],
            capabilities: CapabilitySpec::default(),
            rlimits: vec![],
            cgroup: CgroupSpec::default(),
            seccomp: None,
            apparmor_profile: None,
            selinux_label: None,
            uid_mappings: vec![],
            gid_mappings: vec![],
            rootless: false,
            hostname: None,
            domainname: None,
            oom_score_adj: None,
            no_new_privileges: false,
            process: ProcessSpec {
                args: vec!["/bin/true".to_string()],
                env: vec![],
                cwd: PathBuf::from("/"),
                terminal: false,
                uid: 0,
                gid: 0,
                additional_gids: vec![],
            },
            seccomp_agent: None,
            uidmap_helper: None,
            gidmap_helper: None,
            deadline_ms: None,
            annotations: std::collections::HashMap::new(),
        };
        ContainerState::new(config)
    }

    #[test]
    fn save_load_round_trip_is_byte_identical() {
        let (_dir, store) = store();
        let state = sample_state("round-trip");
        store.save(&state).unwrap();

        let on_disk = std::fs::read(store.paths().state_file("round-trip")).unwrap();
        let loaded = store.load("round-trip").unwrap();
        store.save(&loaded).unwrap();
        let rewritten = std::fs::read(store.paths().state_file("round-trip")).unwrap();
        assert_eq!(on_disk, rewritten);
    }

    #[test]
    fn missing_state_is_container_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load("ghost"),
            Err(Error::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn remove_deletes_the_container_dir() {
        let (_dir, store) = store();
        let state = sample_state("doomed");
        store.save(&state).unwrap();
        assert!(store.exists("doomed"));
        store.remove("doomed").unwrap();
        assert!(!store.exists("doomed"));
    }

    #[test]
    fn list_returns_only_complete_records() {
        let (_dir, store) = store();
        store.save(&sample_state("one")).unwrap();
        store.save(&sample_state("two")).unwrap();
        // A directory without state.json is not a container.
        std::fs::create_dir_all(store.paths().container_dir("junk")).unwrap();

        assert_eq!(store.list().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn status_gating() {
        assert!(ContainerStatus::Created.can_start());
        assert!(!ContainerStatus::Running.can_start());
        assert!(ContainerStatus::Running.can_pause());
        assert!(ContainerStatus::Paused.can_resume());
        assert!(ContainerStatus::Stopped.can_delete());
        assert!(!ContainerStatus::Running.can_delete());
    }

    #[test]
    fn lock_is_reentrant_across_guards() {
        let (_dir, store) = store();
        let guard = store.lock("locked").unwrap();
        drop(guard);
        let _second = store.lock("locked").unwrap();
    }
}
