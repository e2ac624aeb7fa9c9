//! The parent orchestrator.
//!
//! Drives the spawn state machine from the outside: re-executes the shim,
//! feeds it the bootstrap blob, writes id maps while the shim blocks,
//! applies cgroups once a pid exists, delivers the configuration, collects
//! the notify fd, and gates the final exec. Every failure path reaps the
//! shim and unwinds the cgroup it populated.

#![allow(unsafe_code)]

use std::os::fd::OwnedFd;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use corral_common::{Error, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::cgroup::CgroupManager;
use crate::config::Config;
use crate::namespace::idmap::IdMapWriter;
use crate::namespace::NamespacePlan;
use crate::notify;

use super::channel::{InitPipe, StartGate, SyncChannel};
use super::message::{Bootstrap, Protocol, SyncMsg};
use super::pid::InitProcess;
use super::{INIT_FD_ENV, STAGE_ENV, STAGE_SHIM, START_FIFO_ENV, SYNC_FD_ENV};

/// Whether the final exec is released immediately or deferred to a later
/// `start` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Record the handle and leave the child waiting on the start gate.
    Create,
    /// Release the gate as soon as the child is ready.
    Run,
}

/// The result of a successful spawn.
#[derive(Debug)]
pub struct SpawnOutcome {
    /// The container init process.
    pub init: InitProcess,
    /// The seccomp notify fd, when the policy requested one and no agent
    /// consumed it.
    pub notify_fd: Option<OwnedFd>,
}

/// Fallback deadline when the caller does not set one.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
/// Grace period between SIGKILL and giving up the reap.
const REAP_GRACE: Duration = Duration::from_secs(2);

/// Spawn the container init process per the configuration.
///
/// `cgroup` must already exist (construction creates it); this function
/// attaches the pid and writes the limits. On failure the cgroup subtree
/// is destroyed and any spawned process is killed and reaped; cleanup
/// failures attach to the original error as secondary causes.
pub fn spawn(
    config: &Config,
    cgroup: &dyn CgroupManager,
    start_fifo: &std::path::Path,
    gate: Gate,
) -> Result<SpawnOutcome> {
    let deadline = Instant::now() + config.deadline().unwrap_or(DEFAULT_DEADLINE);

    StartGate::create(start_fifo)?;

    let mut machine = Machine::launch(config, start_fifo)?;
    match machine.drive(config, cgroup, start_fifo, deadline, gate) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            let err = machine.unwind(err, cgroup);
            let _ = std::fs::remove_file(start_fifo);
            Err(err)
        }
    }
}

struct Machine {
    sync: SyncChannel,
    init_write: Option<OwnedFd>,
    shim: Child,
    shim_reaped: bool,
    init_pid: Option<Pid>,
    protocol: Protocol,
}

impl Machine {
    /// SPAWN: channels up, shim re-executed, bootstrap blob delivered.
    fn launch(config: &Config, start_fifo: &std::path::Path) -> Result<Self> {
        let (mut sync, shim_sync) = SyncChannel::pair()?;
        let (init_read, init_write) = InitPipe::pair()?;

        // The parent-side ends must not leak into the shim: a stray copy
        // of the init-pipe write end would keep the child from ever
        // seeing EOF on the config blob.
        use std::os::fd::AsRawFd;
        sync.set_cloexec()?;
        super::channel::set_cloexec(init_write.as_raw_fd())?;

        let exe = std::fs::read_link("/proc/self/exe").map_err(|e| Error::Internal {
            message: format!("resolving /proc/self/exe: {e}"),
        })?;

        let shim = Command::new(exe)
            .arg("stage")
            .env(STAGE_ENV, STAGE_SHIM)
            .env(SYNC_FD_ENV, shim_sync.as_raw_fd().to_string())
            .env(INIT_FD_ENV, init_read.as_raw_fd().to_string())
            .env(START_FIFO_ENV, start_fifo)
            .spawn()
            .map_err(|e| Error::Internal {
                message: format!("spawning shim: {e}"),
            })?;

        // The shim holds its copies now.
        drop(shim_sync);
        drop(init_read);

        let plan = NamespacePlan::from_specs(&config.namespaces);
        let mut clone_flags = plan.create_flags;
        if plan.new_user {
            clone_flags |= nix::sched::CloneFlags::CLONE_NEWUSER;
        }
        if plan.new_pid {
            clone_flags |= nix::sched::CloneFlags::CLONE_NEWPID;
        }

        let bootstrap = Bootstrap {
            clone_flags: clone_flags.bits() as u64,
            setns_paths: plan.joins,
            uid_maps: config.uid_mappings.clone(),
            gid_maps: config.gid_mappings.clone(),
            oom_score_adj: config.oom_score_adj,
            rootless: config.rootless,
        };
        sync.send_raw(&bootstrap.encode())?;

        tracing::debug!(shim_pid = shim.id(), "Shim launched");

        Ok(Self {
            sync,
            init_write: Some(init_write),
            shim,
            shim_reaped: false,
            init_pid: None,
            protocol: Protocol::default(),
        })
    }

    /// One blocking receive, bounded by the overall deadline.
    fn recv(&mut self, deadline: Instant) -> Result<(SyncMsg, Option<OwnedFd>)> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout {
                operation: "waiting for the next sync message".to_string(),
            });
        }

        let raw = self.sync.as_raw_fd();
        // Safety: the channel owns the fd and outlives the poll call.
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout =
            PollTimeout::try_from(remaining.as_millis().min(i32::MAX as u128) as i32)
                .unwrap_or(PollTimeout::MAX);
        let n = poll(&mut fds, timeout).map_err(|e| Error::Internal {
            message: format!("poll: {e}"),
        })?;
        if n == 0 {
            return Err(Error::Timeout {
                operation: "waiting for the next sync message".to_string(),
            });
        }

        self.sync.recv()
    }

    /// NAMESPACE-CREATE through START: the ordered protocol.
    fn drive(
        &mut self,
        config: &Config,
        cgroup: &dyn CgroupManager,
        start_fifo: &std::path::Path,
        deadline: Instant,
        gate: Gate,
    ) -> Result<SpawnOutcome> {
        // Bootstrap phase: id maps and the init pid, then READY. The pid
        // report (from the shim) and READY (from its child) come from two
        // writers, so their order on the socket is not fixed.
        let mut ready = false;
        while !ready || self.init_pid.is_none() {
            match self.recv(deadline)? {
                (SyncMsg::IdmapRequest, _) => {
                    let writer = if config.rootless {
                        IdMapWriter::with_helpers(
                            config.uidmap_helper.clone(),
                            config.gidmap_helper.clone(),
                        )
                    } else {
                        IdMapWriter::direct()
                    };
                    let shim_pid = Pid::from_raw(self.shim.id() as i32);
                    writer.write(shim_pid, &config.uid_mappings, &config.gid_mappings)?;
                    self.sync.send(&SyncMsg::IdmapDone)?;
                }
                (SyncMsg::InitPid(pid), _) => {
                    self.init_pid = Some(Pid::from_raw(pid as i32));
                    // The shim exits right after reporting; reap it now so
                    // nothing is left behind regardless of the outcome.
                    self.reap_shim();
                }
                (SyncMsg::Ready, _) => {
                    self.protocol.advance(&SyncMsg::Ready)?;
                    ready = true;
                }
                (SyncMsg::Err { stage, message }, _) => {
                    return Err(Error::ChildFailed {
                        stage,
                        message,
                        cleanup: None,
                    })
                }
                (other, _) => {
                    return Err(Error::ProtocolViolation {
                        stage: "parent".to_string(),
                        detail: format!("unexpected {other:?} before ready"),
                    })
                }
            }
        }

        let init_pid = self.init_pid.ok_or_else(|| Error::Internal {
            message: "ready without an init pid".to_string(),
        })?;

        // CGROUP-APPLY: strictly after the pid exists, strictly before the
        // config goes out.
        cgroup.apply(init_pid)?;
        cgroup.set(&config.cgroup.resources)?;

        // CONFIG-DELIVER.
        let init_write = self.init_write.take().ok_or_else(|| Error::Internal {
            message: "init pipe already consumed".to_string(),
        })?;
        InitPipe::deliver(init_write, &config.to_blob()?)?;
        self.protocol.advance(&SyncMsg::Proceed)?;
        self.sync.send(&SyncMsg::Proceed)?;

        // PRE-EXEC-REPORT: the notify fd rides ahead of readiness.
        let mut notify_fd: Option<OwnedFd> = None;
        loop {
            match self.recv(deadline)? {
                (SyncMsg::Fd, Some(fd)) => notify_fd = Some(fd),
                (SyncMsg::Fd, None) => {
                    return Err(Error::ProtocolViolation {
                        stage: "parent".to_string(),
                        detail: "fd message without a descriptor".to_string(),
                    })
                }
                (SyncMsg::PreStartReady, _) => {
                    self.protocol.advance(&SyncMsg::PreStartReady)?;
                    break;
                }
                (SyncMsg::Err { stage, message }, _) => {
                    return Err(Error::ChildFailed {
                        stage,
                        message,
                        cleanup: None,
                    })
                }
                (other, _) => {
                    return Err(Error::ProtocolViolation {
                        stage: "parent".to_string(),
                        detail: format!("unexpected {other:?} before pre-start-ready"),
                    })
                }
            }
        }

        // The agent owns the fd once relayed; our copy closes with the
        // send.
        if let (Some(fd), Some(agent)) = (&notify_fd, &config.seccomp_agent) {
            notify::send_to_agent(agent, fd)?;
            notify_fd = None;
        }

        // START-GATE.
        if gate == Gate::Run {
            self.protocol.advance(&SyncMsg::Start)?;
            StartGate::release(start_fifo)?;
        }

        // The init is the shim's child, not ours; the handle is a foreign
        // pid guarded by its recorded start time.
        let start_time = super::pid::read_start_time(init_pid)?.ok_or_else(|| {
            Error::Internal {
                message: format!("container init {init_pid} died before handoff completed"),
            }
        })?;
        let init = InitProcess::foreign(init_pid, start_time);

        Ok(SpawnOutcome { init, notify_fd })
    }

    fn reap_shim(&mut self) {
        if self.shim_reaped {
            return;
        }
        match self.shim.wait() {
            Ok(status) => {
                self.shim_reaped = true;
                tracing::debug!(?status, "Shim reaped");
            }
            Err(e) => tracing::warn!(error = %e, "Reaping shim failed"),
        }
    }

    /// Tear down after a failure: abort the child, kill what we spawned,
    /// reap the shim, and remove the cgroup. The original error keeps its
    /// kind; cleanup failures only attach as secondary causes.
    fn unwind(&mut self, mut err: Error, cgroup: &dyn CgroupManager) -> Error {
        let _ = self.sync.send(&SyncMsg::Abort);

        if let Some(pid) = self.init_pid {
            let _ = kill(pid, Signal::SIGKILL);
            let reap_until = Instant::now() + REAP_GRACE;
            while Instant::now() < reap_until {
                // Not our direct child; poll until the pid is gone.
                match super::pid::read_start_time(pid) {
                    Ok(None) => break,
                    _ => std::thread::sleep(Duration::from_millis(10)),
                }
            }
        }

        if !self.shim_reaped {
            let shim_pid = Pid::from_raw(self.shim.id() as i32);
            let _ = kill(shim_pid, Signal::SIGKILL);
            let _ = waitpid(shim_pid, Some(WaitPidFlag::empty()));
            self.shim_reaped = true;
        }

        if let Err(cleanup) = cgroup.destroy() {
            tracing::warn!(error = %cleanup, "Cgroup unwind failed");
            err = err.with_cleanup(&cleanup);
        }

        err
    }
}
