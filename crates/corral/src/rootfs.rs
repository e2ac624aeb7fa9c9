//! Root-filesystem entry: the ordered mount list and the pivot.
//!
//! Preparation of the rootfs contents is the caller's business; this
//! module only performs the child-stage step: make the mount namespace
//! private, apply the mount list, pivot into the new root, and detach the
//! old one.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::path::Path;

use corral_common::{Error, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::config::Mount;

fn flag_bits(options: &[String]) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for opt in options {
        let bit = match opt.as_str() {
            "ro" => MsFlags::MS_RDONLY,
            "nosuid" => MsFlags::MS_NOSUID,
            "nodev" => MsFlags::MS_NODEV,
            "noexec" => MsFlags::MS_NOEXEC,
            "noatime" => MsFlags::MS_NOATIME,
            "nodiratime" => MsFlags::MS_NODIRATIME,
            "relatime" => MsFlags::MS_RELATIME,
            "strictatime" => MsFlags::MS_STRICTATIME,
            "bind" => MsFlags::MS_BIND,
            "rbind" => MsFlags::MS_BIND | MsFlags::MS_REC,
            "private" => MsFlags::MS_PRIVATE,
            "rprivate" => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            "shared" => MsFlags::MS_SHARED,
            "rshared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
            "slave" => MsFlags::MS_SLAVE,
            "rslave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
            // Anything else is filesystem data, not a flag.
            _ => {
                data.push(opt.clone());
                continue;
            }
        };
        flags |= bit;
    }

    (flags, data)
}

fn mount_err(what: &str, e: nix::errno::Errno) -> Error {
    match e {
        nix::errno::Errno::EBUSY => Error::ResourceBusy {
            resource: what.to_string(),
        },
        nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => Error::PermissionDenied {
            operation: format!("mount {what}"),
        },
        other => Error::Internal {
            message: format!("mount {what}: {other}"),
        },
    }
}

/// Apply one mount inside the container root.
fn apply_mount(rootfs: &Path, m: &Mount) -> Result<()> {
    let target = rootfs.join(m.target.strip_prefix("/").unwrap_or(&m.target));
    std::fs::create_dir_all(&target)?;

    let (flags, extra_data) = flag_bits(&m.options);
    let mut data_parts = extra_data;
    if let Some(data) = &m.data {
        data_parts.push(data.clone());
    }
    let data = data_parts.join(",");

    mount(
        Some(m.source.as_str()),
        &target,
        Some(m.fstype.as_str()),
        flags,
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )
    .map_err(|e| mount_err(&target.display().to_string(), e))?;

    tracing::debug!(
        source = %m.source,
        target = %target.display(),
        fstype = %m.fstype,
        "Mounted"
    );
    Ok(())
}

/// Enter the rootfs: privatize propagation, bind the root onto itself so
/// it is a mount point, apply the ordered mount list, pivot, detach the
/// old root, and chdir to `/`.
pub fn enter(rootfs: &Path, mounts: &[Mount]) -> Result<()> {
    // Nothing we mount may leak back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err("/", e))?;

    // pivot_root requires the new root to be a mount point.
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err(&rootfs.display().to_string(), e))?;

    for m in mounts {
        apply_mount(rootfs, m)?;
    }

    pivot(rootfs)?;

    nix::unistd::chdir("/").map_err(|e| Error::Internal {
        message: format!("chdir /: {e}"),
    })?;

    Ok(())
}

/// Pivot into `new_root`, stacking the old root underneath and lazily
/// detaching it, so no host path stays reachable.
fn pivot(new_root: &Path) -> Result<()> {
    nix::unistd::chdir(new_root).map_err(|e| Error::Internal {
        message: format!("chdir {}: {e}", new_root.display()),
    })?;

    // pivot_root(".", ".") avoids needing a scratch directory for the old
    // root; the old root ends up stacked on the same path.
    let dot = CString::new(".").expect("static string");
    // Safety: both paths are valid C strings; this is the raw syscall nix
    // does not wrap with this argument form.
    let rc = unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::Internal {
            message: format!("pivot_root {}: {err}", new_root.display()),
        });
    }

    umount2(".", MntFlags::MNT_DETACH).map_err(|e| Error::Internal {
        message: format!("detach old root: {e}"),
    })?;

    tracing::debug!(rootfs = %new_root.display(), "Pivoted into rootfs");
    Ok(())
}

/// Set hostname and domainname inside a fresh UTS namespace.
pub fn set_uts_names(hostname: Option<&str>, domainname: Option<&str>) -> Result<()> {
    if let Some(hostname) = hostname {
        nix::unistd::sethostname(hostname).map_err(|e| Error::Internal {
            message: format!("sethostname {hostname:?}: {e}"),
        })?;
    }
    if let Some(domainname) = domainname {
        // Safety: the pointer/length pair comes straight from a rust str.
        let rc = unsafe {
            libc::setdomainname(domainname.as_ptr().cast(), domainname.len())
        };
        if rc != 0 {
            return Err(Error::Internal {
                message: format!(
                    "setdomainname {domainname:?}: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_split_into_flags_and_data() {
        let (flags, data) = flag_bits(&[
            "ro".to_string(),
            "nosuid".to_string(),
            "size=65536k".to_string(),
            "mode=755".to_string(),
        ]);
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert_eq!(data, vec!["size=65536k".to_string(), "mode=755".to_string()]);
    }

    #[test]
    fn rbind_implies_recursion() {
        let (flags, _) = flag_bits(&["rbind".to_string()]);
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_REC));
    }
}
