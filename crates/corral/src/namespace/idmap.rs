//! Writing uid/gid maps for a new user namespace.
//!
//! A privileged parent writes `/proc/<pid>/uid_map` and `gid_map` directly.
//! An unprivileged parent must delegate to an external setuid helper
//! (`newuidmap`/`newgidmap`); the helper runs strictly between
//! namespace-create and ready-for-config, while the shim is blocked on the
//! sync channel.

use std::path::{Path, PathBuf};
use std::process::Command;

use corral_common::{Error, Result};
use nix::unistd::Pid;

use super::IdMapping;

/// Default uid-map helper binary.
const DEFAULT_UID_HELPER: &str = "newuidmap";
/// Default gid-map helper binary.
const DEFAULT_GID_HELPER: &str = "newgidmap";

/// Writes id maps either directly or through the external helpers.
#[derive(Debug, Clone)]
pub struct IdMapWriter {
    uid_helper: PathBuf,
    gid_helper: PathBuf,
    use_helper: bool,
}

impl IdMapWriter {
    /// Direct `/proc` writes (privileged invoker).
    #[must_use]
    pub fn direct() -> Self {
        Self {
            uid_helper: PathBuf::from(DEFAULT_UID_HELPER),
            gid_helper: PathBuf::from(DEFAULT_GID_HELPER),
            use_helper: false,
        }
    }

    /// Delegate to the configured helper binaries (rootless invoker).
    pub fn with_helpers(uid_helper: Option<PathBuf>, gid_helper: Option<PathBuf>) -> Self {
        Self {
            uid_helper: uid_helper.unwrap_or_else(|| PathBuf::from(DEFAULT_UID_HELPER)),
            gid_helper: gid_helper.unwrap_or_else(|| PathBuf::from(DEFAULT_GID_HELPER)),
            use_helper: true,
        }
    }

    /// Write both maps for `pid`.
    ///
    /// For direct writes, `setgroups` is denied before the gid map as the
    /// kernel requires for unprivileged user namespaces.
    pub fn write(&self, pid: Pid, uid_maps: &[IdMapping], gid_maps: &[IdMapping]) -> Result<()> {
        if uid_maps.is_empty() && gid_maps.is_empty() {
            return Ok(());
        }

        if self.use_helper {
            if !uid_maps.is_empty() {
                run_helper(&self.uid_helper, pid, uid_maps)?;
            }
            if !gid_maps.is_empty() {
                run_helper(&self.gid_helper, pid, gid_maps)?;
            }
            return Ok(());
        }

        if !uid_maps.is_empty() {
            write_map(&format!("/proc/{pid}/uid_map"), uid_maps)?;
        }
        if !gid_maps.is_empty() {
            deny_setgroups(pid)?;
            write_map(&format!("/proc/{pid}/gid_map"), gid_maps)?;
        }

        Ok(())
    }
}

fn render(maps: &[IdMapping]) -> String {
    maps.iter()
        .map(|m| format!("{} {} {}", m.container_id, m.host_id, m.size))
        .collect::<Vec<_>>()
        .join("\n")
}

fn write_map(path: &str, maps: &[IdMapping]) -> Result<()> {
    std::fs::write(path, render(maps)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied {
                operation: format!("write {path}"),
            }
        } else {
            Error::Io(e)
        }
    })?;
    tracing::debug!(path, "Wrote id map");
    Ok(())
}

fn deny_setgroups(pid: Pid) -> Result<()> {
    let path = format!("/proc/{pid}/setgroups");
    if Path::new(&path).exists() {
        std::fs::write(&path, "deny")?;
    }
    Ok(())
}

fn run_helper(helper: &Path, pid: Pid, maps: &[IdMapping]) -> Result<()> {
    let mut cmd = Command::new(helper);
    cmd.arg(pid.to_string());
    for m in maps {
        cmd.arg(m.container_id.to_string())
            .arg(m.host_id.to_string())
            .arg(m.size.to_string());
    }

    let output = cmd.output().map_err(|e| Error::Internal {
        message: format!("failed to run {}: {e}", helper.display()),
    })?;

    if !output.status.success() {
        return Err(Error::PermissionDenied {
            operation: format!(
                "{} exited {}: {}",
                helper.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    tracing::debug!(helper = %helper.display(), %pid, "Id map written via helper");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lines_match_proc_format() {
        let maps = [
            IdMapping {
                container_id: 0,
                host_id: 100_000,
                size: 65536,
            },
            IdMapping {
                container_id: 65536,
                host_id: 1000,
                size: 1,
            },
        ];
        assert_eq!(render(&maps), "0 100000 65536\n65536 1000 1");
    }
}
