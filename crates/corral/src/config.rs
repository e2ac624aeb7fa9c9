//! The immutable container descriptor and its wire framing.
//!
//! The configuration is created by the caller and never mutated by the
//! runtime. On the wire it travels as a self-delimiting blob: magic,
//! version byte, u32 length, JSON payload. An unknown version is fatal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use corral_common::{ContainerId, Error, Result};
use serde::{Deserialize, Serialize};

use crate::cgroup::Resources;
use crate::namespace::{IdMapping, NamespaceSpec};
use crate::seccomp::SeccompPolicy;

/// Leading magic of the config blob.
const MAGIC: &[u8; 4] = b"CRRL";
/// Current blob version.
const VERSION: u8 = 1;

/// One mount operation, applied in list order inside the mount namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Mount source (device, directory, or fs-specific).
    pub source: String,
    /// Target path, relative to the container root.
    pub target: PathBuf,
    /// Filesystem type (`proc`, `tmpfs`, `bind`, ...).
    pub fstype: String,
    /// Mount flag names (`ro`, `nosuid`, `nodev`, `noexec`, `bind`, `rbind`,
    /// `rprivate`, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Filesystem-specific data string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// The five capability sets applied to the init process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Bounding set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding: Vec<String>,
    /// Effective set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effective: Vec<String>,
    /// Permitted set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permitted: Vec<String>,
    /// Inheritable set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritable: Vec<String>,
    /// Ambient set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambient: Vec<String>,
}

/// One resource limit for the init process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rlimit {
    /// The limit name (`RLIMIT_NOFILE`, `RLIMIT_NPROC`, ...).
    pub kind: String,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// The cgroup placement and limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupSpec {
    /// Path relative to the hierarchy root; defaults to `corral/<id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Resource limits.
    #[serde(default)]
    pub resources: Resources,
}

/// The initial process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Argument vector; `args[0]` is the executable.
    pub args: Vec<String>,
    /// Environment, as `KEY=value` strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Working directory inside the container.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Whether a terminal is requested.
    #[serde(default)]
    pub terminal: bool,
    /// Uid inside the container.
    #[serde(default)]
    pub uid: u32,
    /// Gid inside the container.
    #[serde(default)]
    pub gid: u32,
    /// Supplementary gids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

/// The immutable container configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Container id.
    pub id: ContainerId,
    /// Namespaces to create or join.
    pub namespaces: Vec<NamespaceSpec>,
    /// Root filesystem path (already prepared by the caller).
    pub rootfs: PathBuf,
    /// Ordered mount operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    /// Capability sets.
    #[serde(default)]
    pub capabilities: CapabilitySpec,
    /// Resource limits for the init process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
    /// Cgroup placement and limits.
    #[serde(default)]
    pub cgroup: CgroupSpec,
    /// Seccomp policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<SeccompPolicy>,
    /// AppArmor profile name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    /// SELinux process label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selinux_label: Option<String>,
    /// Uid mappings for a created user namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    /// Gid mappings for a created user namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    /// Whether the invoker is unprivileged.
    #[serde(default)]
    pub rootless: bool,
    /// Hostname inside a new UTS namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// NIS domain name inside a new UTS namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domainname: Option<String>,
    /// oom_score_adj for the init process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    /// Set no_new_privs even when no uid transition requires it.
    #[serde(default)]
    pub no_new_privileges: bool,
    /// The initial process.
    pub process: ProcessSpec,
    /// Unix-socket path of the seccomp agent receiving the notify fd.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_agent: Option<PathBuf>,
    /// Override for the uid-map helper binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uidmap_helper: Option<PathBuf>,
    /// Override for the gid-map helper binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gidmap_helper: Option<PathBuf>,
    /// Overall deadline for the create operation, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Free-form annotations, persisted with the state.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Config {
    /// The cgroup path relative to the hierarchy root.
    #[must_use]
    pub fn cgroup_path(&self) -> PathBuf {
        self.cgroup
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("corral").join(self.id.as_str()))
    }

    /// The caller's deadline, when configured.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Reject configurations before any process is spawned or any kernel
    /// state is touched.
    pub fn validate(&self) -> Result<()> {
        if self.process.args.is_empty() {
            return Err(Error::ConfigInvalid {
                reason: "process.args must name an executable".to_string(),
            });
        }
        if self.rootfs.as_os_str().is_empty() {
            return Err(Error::ConfigInvalid {
                reason: "rootfs must not be empty".to_string(),
            });
        }
        if let Some(policy) = &self.seccomp {
            // Kernel-independent part of the policy checks; the API-level
            // gate runs again in the child against the live kernel.
            policy.validate(u32::MAX)?;
        }
        Ok(())
    }

    /// Encode the framed blob.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self).map_err(|e| Error::Internal {
            message: format!("config serialization: {e}"),
        })?;

        let mut blob = Vec::with_capacity(9 + payload.len());
        blob.extend_from_slice(MAGIC);
        blob.push(VERSION);
        blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        blob.extend_from_slice(&payload);
        Ok(blob)
    }

    /// Decode a framed blob; a bad magic, unknown version, or truncated
    /// payload is fatal.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let violation = |detail: String| Error::ProtocolViolation {
            stage: "config-blob".to_string(),
            detail,
        };

        if blob.len() < 9 {
            return Err(violation("blob shorter than its header".to_string()));
        }
        if &blob[0..4] != MAGIC {
            return Err(violation("bad magic".to_string()));
        }
        let version = blob[4];
        if version != VERSION {
            return Err(violation(format!(
                "unknown config version {version}, expected {VERSION}"
            )));
        }
        let len = u32::from_le_bytes(blob[5..9].try_into().expect("four bytes")) as usize;
        let payload = blob
            .get(9..9 + len)
            .ok_or_else(|| violation("truncated payload".to_string()))?;

        serde_json::from_slice(payload)
            .map_err(|e| violation(format!("config payload does not parse: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceKind;

    pub(crate) fn minimal_config() -> Config {
        Config {
            id: ContainerId::new("test-config").unwrap(),
            namespaces: vec![
                NamespaceSpec::fresh(NamespaceKind::Pid),
                NamespaceSpec::fresh(NamespaceKind::Mount),
                NamespaceSpec::fresh(NamespaceKind::Uts),
            ],
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
            hostname: Some("sandbox".to_string()),
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
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn blob_round_trips() {
        let config = minimal_config();
        let blob = config.to_blob().unwrap();
        let decoded = Config::from_blob(&blob).unwrap();
        assert_eq!(decoded.id, config.id);
        assert_eq!(decoded.process.args, config.process.args);
        assert_eq!(decoded.hostname, config.hostname);
    }

    #[test]
    fn unknown_version_is_fatal() {
        let mut blob = minimal_config().to_blob().unwrap();
        blob[4] = 9;
        let err = Config::from_blob(&blob).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation { ref detail, .. } if detail.contains("unknown config version 9")
        ));
    }

    #[test]
    fn bad_magic_and_truncation_are_fatal() {
        let blob = minimal_config().to_blob().unwrap();

        let mut bad = blob.clone();
        bad[0] = b'X';
        assert!(Config::from_blob(&bad).is_err());

        assert!(Config::from_blob(&blob[..blob.len() - 1]).is_err());
        assert!(Config::from_blob(&blob[..4]).is_err());
    }

    #[test]
    fn empty_argv_is_rejected() {
        let mut config = minimal_config();
        config.process.args.clear();
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn default_cgroup_path_is_under_corral() {
        let config = minimal_config();
        assert_eq!(config.cgroup_path(), PathBuf::from("corral/test-config"));
    }
}
