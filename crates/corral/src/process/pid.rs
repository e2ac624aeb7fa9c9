//! The container init-process capability.
//!
//! Two kinds of process end up behind one interface: a child adopted from
//! a checkpoint restorer, which this runtime may wait on, and a foreign
//! pid whose parent is some other process. The shim forks the init before
//! handing off, so the runtime never parents the init directly; every
//! spawned container surfaces as `Foreign`, guarded by its recorded start
//! time. Operations a variant cannot perform return a precise error
//! instead of pretending.

use corral_common::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// A handle to a container's init process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitProcess {
    /// A child adopted from a checkpoint restorer.
    Restored {
        /// The restored pid.
        pid: Pid,
        /// Start time recorded at restore.
        start_time: u64,
    },
    /// A pid we did not parent: the shim's forked init, or one loaded
    /// from persisted state.
    Foreign {
        /// The recorded pid.
        pid: Pid,
        /// Start time recorded when the handle was made.
        start_time: u64,
    },
}

impl InitProcess {
    /// Wrap a pid this process is not the parent of.
    #[must_use]
    pub fn foreign(pid: Pid, start_time: u64) -> Self {
        Self::Foreign { pid, start_time }
    }

    /// The underlying pid.
    #[must_use]
    pub fn pid(&self) -> Pid {
        match self {
            Self::Restored { pid, .. } | Self::Foreign { pid, .. } => *pid,
        }
    }

    /// The recorded start time.
    #[must_use]
    pub fn start_time(&self) -> u64 {
        match self {
            Self::Restored { start_time, .. } | Self::Foreign { start_time, .. } => *start_time,
        }
    }

    /// Whether the recorded process is still the one running under this
    /// pid. A recycled pid has a different start time and is not ours.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(read_start_time(self.pid()), Ok(Some(t)) if t == self.start_time())
    }

    /// Send a signal, guarding against pid reuse.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::Internal {
                message: format!("process {} is gone (or its pid was recycled)", self.pid()),
            });
        }
        kill(self.pid(), signal).map_err(|e| Error::Internal {
            message: format!("kill({}, {signal}): {e}", self.pid()),
        })
    }

    /// Wait for the process to exit and return its status.
    ///
    /// Only available for processes we are the parent of.
    pub fn wait(&self) -> Result<WaitStatus> {
        match self {
            Self::Restored { pid, .. } => waitpid(*pid, None).map_err(|e| Error::Internal {
                message: format!("waitpid({pid}): {e}"),
            }),
            Self::Foreign { pid, .. } => Err(Error::Unsupported {
                operation: format!("waiting on foreign process {pid}"),
            }),
        }
    }
}

/// Read a pid's start time (clock ticks since boot) from `/proc`.
///
/// `Ok(None)` means the process does not exist.
pub fn read_start_time(pid: Pid) -> Result<Option<u64>> {
    let content = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    // The comm field is parenthesized and may itself contain spaces or
    // parens; everything after the last ')' is fixed-position.
    let rest = content.rsplit_once(')').map(|(_, rest)| rest).unwrap_or("");
    let start_time = rest
        .split_whitespace()
        .nth(19) // field 22 overall
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Internal {
            message: format!("unparseable /proc/{pid}/stat"),
        })?;

    Ok(Some(start_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_start_time_is_readable_and_stable() {
        let me = Pid::this();
        let first = read_start_time(me).unwrap().expect("we are running");
        let second = read_start_time(me).unwrap().expect("still running");
        assert_eq!(first, second);
        assert!(first > 0);
    }

    #[test]
    fn missing_pid_reads_as_none() {
        // Pid max on Linux defaults to 4194304; this one cannot exist.
        let pid = Pid::from_raw(i32::MAX - 1);
        assert_eq!(read_start_time(pid).unwrap(), None);
    }

    #[test]
    fn foreign_process_cannot_be_waited_on() {
        let proc = InitProcess::foreign(Pid::from_raw(1), 4);
        let err = proc.wait().unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[test]
    fn recycled_pid_is_not_alive() {
        let me = Pid::this();
        let real = read_start_time(me).unwrap().unwrap();
        let stale = InitProcess::foreign(me, real + 1);
        assert!(!stale.is_alive());
        let fresh = InitProcess::foreign(me, real);
        assert!(fresh.is_alive());
    }
}
