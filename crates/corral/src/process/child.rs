//! The child stage: the process that becomes the container init.
//!
//! Runs inside the freshly built namespaces after the shim forks. The
//! privileged setup runs in a fixed order, with seccomp strictly last
//! before the gate and the exec, and reports either the notify fd and
//! readiness, or a tagged error.

#![allow(unsafe_code)]

use std::convert::Infallible;
use std::ffi::CString;

use corral_common::{Error, Result};
use nix::unistd::{execvpe, setgid, setgroups, setuid, Gid, Uid};

use crate::config::{Config, Rlimit};
use crate::namespace::NamespaceKind;
use crate::rootfs;
use crate::security;

use super::channel::{InitPipe, StartGate, SyncChannel};
use super::entry::StageEnv;
use super::message::SyncMsg;

/// Run the child stage. Never returns on success: ends in `execvpe`.
pub fn run(env: &StageEnv) -> Result<Infallible> {
    let mut sync = SyncChannel::from_raw(env.sync_fd);

    match stage(&mut sync, env) {
        Ok(never) => Ok(never),
        Err(err) => {
            let _ = sync.send(&SyncMsg::Err {
                stage: "child-finalize".to_string(),
                message: err.to_string(),
            });
            Err(err)
        }
    }
}

fn stage(sync: &mut SyncChannel, env: &StageEnv) -> Result<Infallible> {
    sync.send(&SyncMsg::Ready)?;

    match sync.recv()? {
        (SyncMsg::Proceed, _) => {}
        (SyncMsg::Abort, _) => {
            return Err(Error::ChildFailed {
                stage: "child-finalize".to_string(),
                message: "aborted by parent before config delivery".to_string(),
                cleanup: None,
            })
        }
        (other, _) => {
            return Err(Error::ProtocolViolation {
                stage: "child-finalize".to_string(),
                detail: format!("expected proceed, got {other:?}"),
            })
        }
    }

    let config = Config::from_blob(&InitPipe::collect(env.init_fd)?)?;

    // The fifo's host path becomes unreachable once we pivot; hold its
    // directory open now and reach the gate through the handle later.
    let gate_dir = StartGate::open_dir(&env.start_fifo)?;

    finalize(sync, env, &gate_dir, &config)
}

fn has_fresh_ns(config: &Config, kind: NamespaceKind) -> bool {
    config
        .namespaces
        .iter()
        .any(|ns| ns.kind == kind && ns.path.is_none())
}

/// The child-finalize sequence, in its fixed order.
fn finalize(
    sync: &mut SyncChannel,
    env: &StageEnv,
    gate_dir: &std::fs::File,
    config: &Config,
) -> Result<Infallible> {
    if has_fresh_ns(config, NamespaceKind::Mount) {
        rootfs::enter(&config.rootfs, &config.mounts)?;
    }

    if has_fresh_ns(config, NamespaceKind::Uts) {
        rootfs::set_uts_names(config.hostname.as_deref(), config.domainname.as_deref())?;
    }

    set_rlimits(&config.rlimits)?;
    join_session_keyring(config.id.as_str())?;

    security::apply_capabilities(&config.capabilities)?;

    if let Some(profile) = &config.apparmor_profile {
        security::apply_apparmor_profile(profile)?;
    }
    if let Some(label) = &config.selinux_label {
        security::apply_selinux_label(label)?;
    }

    // A user namespace (created or joined) or a uid transition means the
    // seccomp load may not carry privilege; the bit must be set first.
    let uses_user_ns = config
        .namespaces
        .iter()
        .any(|ns| ns.kind == NamespaceKind::User);
    let uid_transition = config.process.uid != nix::unistd::geteuid().as_raw()
        || config.process.gid != nix::unistd::getegid().as_raw();
    if config.no_new_privileges || uses_user_ns || uid_transition {
        set_no_new_privs()?;
    }

    // Seccomp comes after every other privileged step; the notify fd goes
    // out before readiness so the parent can relay it while we block.
    if let Some(policy) = &config.seccomp {
        if let Some(fd) = crate::seccomp::install(policy)? {
            use std::os::fd::AsRawFd;
            sync.send_fd(fd.as_raw_fd())?;
        }
    }

    close_extraneous_fds()?;

    // Always set the supplementary groups, even to an empty list: the
    // groups inherited from the invoking runtime must never leak into the
    // container.
    let gids: Vec<Gid> = config
        .process
        .additional_gids
        .iter()
        .map(|&g| Gid::from_raw(g))
        .collect();
    if let Err(e) = setgroups(&gids) {
        // A rootless user namespace has setgroups denied; with nothing to
        // set, the mapped credentials already carry no groups.
        if e == nix::errno::Errno::EPERM && gids.is_empty() && config.rootless {
            tracing::debug!("setgroups denied in user namespace, no groups requested");
        } else {
            return Err(Error::Internal {
                message: format!("setgroups: {e}"),
            });
        }
    }
    setgid(Gid::from_raw(config.process.gid)).map_err(|e| Error::Internal {
        message: format!("setgid({}): {e}", config.process.gid),
    })?;
    setuid(Uid::from_raw(config.process.uid)).map_err(|e| Error::Internal {
        message: format!("setuid({}): {e}", config.process.uid),
    })?;

    std::env::set_current_dir(&config.process.cwd).map_err(|e| Error::ConfigInvalid {
        reason: format!("cwd {}: {e}", config.process.cwd.display()),
    })?;

    sync.send(&SyncMsg::PreStartReady)?;

    StartGate::wait_at(gate_dir, &env.start_fifo)?;

    let argv: Vec<CString> = config
        .process
        .args
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::ConfigInvalid {
            reason: "argv contains a NUL byte".to_string(),
        })?;
    let envp: Vec<CString> = config
        .process
        .env
        .iter()
        .map(|e| CString::new(e.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::ConfigInvalid {
            reason: "environment contains a NUL byte".to_string(),
        })?;

    tracing::debug!(argv0 = %config.process.args[0], "Executing container process");
    execvpe(&argv[0], &argv, &envp).map_err(|e| Error::Internal {
        message: format!("exec {}: {e}", config.process.args[0]),
    })?;
    unreachable!("execvpe returned without an error");
}

fn rlimit_resource(kind: &str) -> Option<libc::c_int> {
    let resource = match kind {
        "RLIMIT_CPU" => libc::RLIMIT_CPU,
        "RLIMIT_FSIZE" => libc::RLIMIT_FSIZE,
        "RLIMIT_DATA" => libc::RLIMIT_DATA,
        "RLIMIT_STACK" => libc::RLIMIT_STACK,
        "RLIMIT_CORE" => libc::RLIMIT_CORE,
        "RLIMIT_RSS" => libc::RLIMIT_RSS,
        "RLIMIT_NPROC" => libc::RLIMIT_NPROC,
        "RLIMIT_NOFILE" => libc::RLIMIT_NOFILE,
        "RLIMIT_MEMLOCK" => libc::RLIMIT_MEMLOCK,
        "RLIMIT_AS" => libc::RLIMIT_AS,
        "RLIMIT_LOCKS" => libc::RLIMIT_LOCKS,
        "RLIMIT_SIGPENDING" => libc::RLIMIT_SIGPENDING,
        "RLIMIT_MSGQUEUE" => libc::RLIMIT_MSGQUEUE,
        "RLIMIT_NICE" => libc::RLIMIT_NICE,
        "RLIMIT_RTPRIO" => libc::RLIMIT_RTPRIO,
        "RLIMIT_RTTIME" => libc::RLIMIT_RTTIME,
        _ => return None,
    };
    #[allow(clippy::unnecessary_cast)]
    Some(resource as libc::c_int)
}

fn set_rlimits(rlimits: &[Rlimit]) -> Result<()> {
    for rlimit in rlimits {
        let resource = rlimit_resource(&rlimit.kind).ok_or_else(|| Error::ConfigInvalid {
            reason: format!("unknown rlimit {:?}", rlimit.kind),
        })?;
        let value = libc::rlimit {
            rlim_cur: rlimit.soft,
            rlim_max: rlimit.hard,
        };
        // Safety: resource is a valid constant and value is initialized.
        let rc = unsafe { libc::setrlimit(resource as libc::__rlimit_resource_t, &value) };
        if rc != 0 {
            return Err(Error::Internal {
                message: format!(
                    "setrlimit({}): {}",
                    rlimit.kind,
                    std::io::Error::last_os_error()
                ),
            });
        }
    }
    Ok(())
}

/// Detach from the caller's session keyring so keys do not leak into the
/// container. ENOSYS just means the kernel lacks keyrings.
fn join_session_keyring(name: &str) -> Result<()> {
    const KEYCTL_JOIN_SESSION_KEYRING: libc::c_int = 1;
    let name = CString::new(format!("_ses.{name}")).map_err(|_| Error::ConfigInvalid {
        reason: "container id contains a NUL byte".to_string(),
    })?;

    // Safety: keyctl(JOIN_SESSION_KEYRING, name) with a valid C string.
    let rc = unsafe { libc::syscall(libc::SYS_keyctl, KEYCTL_JOIN_SESSION_KEYRING, name.as_ptr()) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOSYS) => {
                tracing::warn!("kernel has no keyring support, session keyring not replaced");
            }
            Some(libc::EACCES) | Some(libc::EPERM) => {
                tracing::warn!(error = %err, "cannot join session keyring, continuing");
            }
            _ => {
                return Err(Error::Internal {
                    message: format!("keyctl(join-session-keyring): {err}"),
                })
            }
        }
    }
    Ok(())
}

fn set_no_new_privs() -> Result<()> {
    // Safety: plain prctl with immediate arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(Error::Internal {
            message: format!(
                "prctl(PR_SET_NO_NEW_PRIVS): {}",
                std::io::Error::last_os_error()
            ),
        });
    }
    tracing::debug!("no_new_privs set");
    Ok(())
}

/// Mark everything above stdio close-on-exec; the channel fds are still
/// needed for the gate, so they close at the exec itself rather than here.
fn close_extraneous_fds() -> Result<()> {
    const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
    // Safety: close_range over a fixed range with a known flag.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3u32,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if rc != 0 {
        // Pre-5.11 kernels: walk /proc/self/fd instead.
        let entries = std::fs::read_dir("/proc/self/fd")?;
        for entry in entries.flatten() {
            if let Some(fd) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<i32>().ok())
            {
                if fd > 2 {
                    // Safety: setting a flag on an fd we own.
                    unsafe {
                        let flags = libc::fcntl(fd, libc::F_GETFD);
                        if flags >= 0 {
                            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
