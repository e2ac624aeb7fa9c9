//! Loading a compiled filter into the current task.

#![allow(unsafe_code)]

use std::os::fd::OwnedFd;

use corral_common::{Error, Result};

use super::compiler::{LoadFlags, SockFilter};

// seccomp(2) operations.
const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_GET_ACTION_AVAIL: libc::c_uint = 2;
const SECCOMP_GET_NOTIF_SIZES: libc::c_uint = 3;

// Filter flags.
const FLAG_TSYNC: libc::c_ulong = 1;
const FLAG_LOG: libc::c_ulong = 1 << 1;
const FLAG_SPEC_ALLOW: libc::c_ulong = 1 << 2;
const FLAG_NEW_LISTENER: libc::c_ulong = 1 << 3;
const FLAG_TSYNC_ESRCH: libc::c_ulong = 1 << 4;

const RET_USER_NOTIF: u32 = 0x7fc0_0000;
const RET_LOG: u32 = 0x7ffc_0000;

#[repr(C)]
struct SockFprog {
    len: libc::c_ushort,
    filter: *const u8,
}

#[cfg(target_os = "linux")]
fn seccomp_syscall(op: libc::c_uint, flags: libc::c_ulong, args: *const libc::c_void) -> i64 {
    // Safety: arguments match the seccomp(2) prototype; pointers are either
    // null or reference live memory owned by the caller.
    unsafe { libc::syscall(libc::SYS_seccomp, op, flags, args) }
}

/// Probe the kernel's seccomp API level, libseccomp-style.
///
/// The levels the policy layer cares about: notify needs the listener
/// machinery (level 6); `log` needs level 3. Anything older reports the
/// highest level its probes pass.
#[must_use]
pub fn api_level() -> u32 {
    #[cfg(not(target_os = "linux"))]
    {
        return 0;
    }
    #[cfg(target_os = "linux")]
    {
        #[repr(C)]
        #[derive(Default)]
        #[allow(dead_code)]
        struct NotifSizes {
            notif: u16,
            notif_resp: u16,
            data: u16,
        }

        let notify_action: u32 = RET_USER_NOTIF;
        let action_avail = seccomp_syscall(
            SECCOMP_GET_ACTION_AVAIL,
            0,
            std::ptr::addr_of!(notify_action).cast(),
        ) == 0;

        if action_avail {
            let mut sizes = NotifSizes::default();
            if seccomp_syscall(
                SECCOMP_GET_NOTIF_SIZES,
                0,
                std::ptr::addr_of_mut!(sizes).cast_const().cast(),
            ) == 0
            {
                return 6;
            }
            return 5;
        }

        let log_action: u32 = RET_LOG;
        if seccomp_syscall(
            SECCOMP_GET_ACTION_AVAIL,
            0,
            std::ptr::addr_of!(log_action).cast(),
        ) == 0
        {
            return 3;
        }

        1
    }
}

/// Load the program into the current task.
///
/// Returns the user-notification fd when `flags.new_listener` is set. The
/// caller owns the no-new-privileges prerequisite.
pub fn load(program: &[SockFilter], flags: &LoadFlags) -> Result<Option<OwnedFd>> {
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (program, flags);
        return Err(Error::Unsupported {
            operation: "seccomp".to_string(),
        });
    }
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::FromRawFd;

        if program.len() > u16::MAX as usize {
            return Err(Error::Internal {
                message: format!("seccomp program too long: {} instructions", program.len()),
            });
        }

        let image: Vec<u8> = program.iter().flat_map(|i| i.encode()).collect();
        let fprog = SockFprog {
            len: program.len() as libc::c_ushort,
            filter: image.as_ptr(),
        };

        let mut raw_flags: libc::c_ulong = 0;
        if flags.log {
            raw_flags |= FLAG_LOG;
        }
        if flags.spec_allow {
            raw_flags |= FLAG_SPEC_ALLOW;
        }
        if flags.new_listener {
            raw_flags |= FLAG_NEW_LISTENER;
            // The kernel rejects TSYNC together with NEW_LISTENER unless
            // the ESRCH variant is used.
            if flags.tsync {
                raw_flags |= FLAG_TSYNC_ESRCH;
            }
        } else if flags.tsync {
            raw_flags |= FLAG_TSYNC;
        }

        let rc = seccomp_syscall(
            SECCOMP_SET_MODE_FILTER,
            raw_flags,
            std::ptr::addr_of!(fprog).cast(),
        );

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EACCES) => Error::PermissionDenied {
                    operation: "seccomp load without no_new_privs".to_string(),
                },
                Some(libc::EINVAL) => Error::KernelUnsupported {
                    feature: "seccomp filter flags".to_string(),
                    detail: err.to_string(),
                },
                _ => Error::Internal {
                    message: format!("seccomp load failed: {err}"),
                },
            });
        }

        if flags.new_listener {
            // Safety: on success with NEW_LISTENER the return value is a
            // fresh fd owned by us.
            let fd = unsafe { OwnedFd::from_raw_fd(rc as std::os::fd::RawFd) };
            tracing::debug!("Seccomp filter loaded with notify listener");
            return Ok(Some(fd));
        }

        tracing::debug!(insns = program.len(), "Seccomp filter loaded");
        Ok(None)
    }
}
