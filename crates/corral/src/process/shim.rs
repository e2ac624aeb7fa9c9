//! The namespace-entry shim.
//!
//! Runs re-executed, before any other setup, with the channel fds
//! inherited. It performs the namespace operations in kernel order,
//! drives the id-map handshake with the parent, forks the process that
//! becomes the container init, reports its pid, and exits. No managed
//! state survives into the child beyond the channel fds.
//!
//! The shim stays single-threaded throughout: every security primitive
//! the child applies later acts on the current thread, and a second
//! thread here could escape it.

#![allow(unsafe_code)]

use std::convert::Infallible;
use std::fs::File;

use corral_common::{Error, Result};
use nix::sched::{setns, unshare, CloneFlags};
use nix::unistd::{fork, setresgid, setresuid, ForkResult, Gid, Uid};

use super::channel::SyncChannel;
use super::entry::StageEnv;
use super::message::{Bootstrap, SyncMsg};
use super::child;

/// Run the shim stage to completion. Never returns on the success path:
/// the forked child execs and the shim itself exits zero.
pub fn run(env: &StageEnv) -> Result<Infallible> {
    let mut sync = SyncChannel::from_raw(env.sync_fd);

    match stage(&mut sync, env) {
        Ok(never) => Ok(never),
        Err(err) => {
            // Best effort: the parent may already be gone.
            let _ = sync.send(&SyncMsg::Err {
                stage: "namespace-create".to_string(),
                message: err.to_string(),
            });
            Err(err)
        }
    }
}

fn stage(sync: &mut SyncChannel, env: &StageEnv) -> Result<Infallible> {
    let bootstrap = Bootstrap::decode(&sync.recv_raw()?)?;
    tracing::debug!(?bootstrap, "Shim bootstrapped");

    // Children inherit the score, so it must be in place before the fork.
    if let Some(score) = bootstrap.oom_score_adj {
        std::fs::write("/proc/self/oom_score_adj", score.to_string())?;
    }

    let flags = CloneFlags::from_bits_retain(bootstrap.clone_flags as libc::c_int);

    // A created user namespace comes first: it grants the capabilities the
    // remaining operations need when running rootless.
    if flags.contains(CloneFlags::CLONE_NEWUSER) {
        unshare(CloneFlags::CLONE_NEWUSER).map_err(|e| op_err("unshare(user)", e))?;

        if !bootstrap.uid_maps.is_empty() || !bootstrap.gid_maps.is_empty() {
            // The maps are written from the outside while we block here.
            sync.send(&SyncMsg::IdmapRequest)?;
            match sync.recv()? {
                (SyncMsg::IdmapDone, _) => {}
                (SyncMsg::Abort, _) => {
                    return Err(Error::ChildFailed {
                        stage: "namespace-create".to_string(),
                        message: "aborted by parent during id-map setup".to_string(),
                        cleanup: None,
                    })
                }
                (other, _) => {
                    return Err(Error::ProtocolViolation {
                        stage: "namespace-create".to_string(),
                        detail: format!("expected idmap-done, got {other:?}"),
                    })
                }
            }

            setresgid(Gid::from_raw(0), Gid::from_raw(0), Gid::from_raw(0))
                .map_err(|e| op_err("setresgid(0)", e))?;
            setresuid(Uid::from_raw(0), Uid::from_raw(0), Uid::from_raw(0))
                .map_err(|e| op_err("setresuid(0)", e))?;
        }
    }

    // Joins next, already ordered user-first, network-last.
    for (kind, path) in &bootstrap.setns_paths {
        let file = File::open(path).map_err(|e| Error::KernelUnsupported {
            feature: format!("{} namespace at {}", kind.proc_name(), path.display()),
            detail: e.to_string(),
        })?;
        setns(file, kind.clone_flag())
            .map_err(|e| op_err(&format!("setns({})", path.display()), e))?;
        tracing::debug!(kind = kind.proc_name(), path = %path.display(), "Joined namespace");
    }

    // The remaining fresh namespaces, pid last: unshare(NEWPID) moves only
    // the next fork, so it directly precedes it.
    let mut create = flags;
    create.remove(CloneFlags::CLONE_NEWUSER);
    create.remove(CloneFlags::CLONE_NEWPID);
    if !create.is_empty() {
        unshare(create).map_err(|e| op_err("unshare", e))?;
    }
    if flags.contains(CloneFlags::CLONE_NEWPID) {
        unshare(CloneFlags::CLONE_NEWPID).map_err(|e| op_err("unshare(pid)", e))?;
    }

    // Safety: single-threaded by construction; the child only touches the
    // inherited channel fds before exec.
    match unsafe { fork() }.map_err(|e| op_err("fork", e))? {
        ForkResult::Child => child::run(env),
        ForkResult::Parent { child } => {
            sync.send(&SyncMsg::InitPid(child.as_raw() as u32))?;
            tracing::debug!(init_pid = child.as_raw(), "Shim handing off");
            std::process::exit(0);
        }
    }
}

fn op_err(what: &str, e: nix::errno::Errno) -> Error {
    match e {
        nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => Error::PermissionDenied {
            operation: what.to_string(),
        },
        nix::errno::Errno::EINVAL | nix::errno::Errno::ENOSYS => Error::KernelUnsupported {
            feature: what.to_string(),
            detail: e.desc().to_string(),
        },
        other => Error::Internal {
            message: format!("{what}: {other}"),
        },
    }
}
