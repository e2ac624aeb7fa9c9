//! The container handle and its lifecycle operations.
//!
//! One operation per invocation: create (or run), start, signal, pause,
//! resume, delete. Every transition happens under the per-container lock,
//! reads the persisted record, verifies the status gate, and writes the
//! record back atomically. A failed create leaves nothing behind: no state
//! file, no cgroup, no process.

use std::collections::BTreeMap;
use std::path::PathBuf;

use corral_common::{Error, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::cgroup::{self, CgroupManager, FreezerState, Stats};
use crate::config::Config;
use crate::process::channel::StartGate;
use crate::process::parent::{self, Gate};
use crate::process::pid::InitProcess;
use crate::state::{ContainerState, ContainerStatus, StateStore};

/// A live handle to one container.
pub struct Container {
    state: ContainerState,
    store: StateStore,
    cgroup: Box<dyn CgroupManager>,
    /// The seccomp notify fd, held until an agent (or the caller) takes it.
    notify_fd: Option<std::os::fd::OwnedFd>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.state.id)
            .field("status", &self.state.status)
            .field("pid", &self.state.pid)
            .finish_non_exhaustive()
    }
}

fn namespace_paths(pid: Pid) -> BTreeMap<String, PathBuf> {
    let mut paths = BTreeMap::new();
    let dir = format!("/proc/{pid}/ns");
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                paths.insert(name.to_string(), entry.path());
            }
        }
    }
    paths
}

fn cgroup_paths(manager: &dyn CgroupManager) -> BTreeMap<String, PathBuf> {
    let mut paths = BTreeMap::new();
    if cgroup::is_cgroup2() {
        if let Some(path) = manager.path("unified") {
            paths.insert("unified".to_string(), path);
        }
    } else {
        for controller in [
            "cpu", "cpuset", "cpuacct", "memory", "pids", "blkio", "devices", "freezer",
            "net_cls", "net_prio", "hugetlb", "rdma",
        ] {
            if let Some(path) = manager.path(controller) {
                paths.insert(controller.to_string(), path);
            }
        }
    }
    paths
}

impl Container {
    /// Create a container: build the sandbox and leave the init process
    /// waiting on the start gate.
    pub fn create(config: Config, store: StateStore) -> Result<Self> {
        Self::create_gated(config, store, Gate::Create)
    }

    /// Create and immediately start.
    pub fn run(config: Config, store: StateStore) -> Result<Self> {
        Self::create_gated(config, store, Gate::Run)
    }

    fn create_gated(config: Config, store: StateStore, gate: Gate) -> Result<Self> {
        config.validate()?;
        let id = config.id.to_string();

        let _lock = store.lock(&id)?;
        if store.exists(&id) {
            return Err(Error::ConfigInvalid {
                reason: format!("container {id} already exists"),
            });
        }

        let cgroup = cgroup::probe(&config.cgroup_path(), config.rootless)?;
        let fifo = store.paths().start_fifo(&id);

        let outcome = match parent::spawn(&config, cgroup.as_ref(), &fifo, gate) {
            Ok(outcome) => outcome,
            Err(err) => {
                // spawn unwound the cgroup and processes; the state dir may
                // hold the fifo.
                let _ = store.remove(&id);
                return Err(err);
            }
        };

        let mut state = ContainerState::new(config);
        state.pid = Some(outcome.init.pid().as_raw());
        state.start_time = Some(outcome.init.start_time());
        state.cgroup_paths = cgroup_paths(cgroup.as_ref());
        state.namespace_paths = namespace_paths(outcome.init.pid());
        state.status = match gate {
            Gate::Create => ContainerStatus::Created,
            Gate::Run => ContainerStatus::Running,
        };

        if let Err(err) = store.save(&state) {
            let _ = outcome.init.signal(Signal::SIGKILL);
            let cleanup = cgroup.destroy().err();
            let _ = store.remove(&id);
            let mut failure = Error::ChildFailed {
                stage: "state-persist".to_string(),
                message: err.to_string(),
                cleanup: None,
            };
            if let Some(cleanup) = cleanup {
                failure = failure.with_cleanup(&cleanup);
            }
            return Err(failure);
        }

        tracing::info!(id = %state.id, pid = ?state.pid, status = %state.status, "Container created");
        Ok(Self {
            state,
            store,
            cgroup,
            notify_fd: outcome.notify_fd,
        })
    }

    /// Load an existing container.
    pub fn load(id: &str, store: StateStore) -> Result<Self> {
        let state = store.load(id)?;
        let cgroup = cgroup::probe(&state.config.cgroup_path(), state.config.rootless)?;
        Ok(Self {
            state,
            store,
            cgroup,
            notify_fd: None,
        })
    }

    /// The persisted record.
    #[must_use]
    pub fn state(&self) -> &ContainerState {
        &self.state
    }

    /// Take the seccomp notify fd, when the policy produced one and no
    /// agent consumed it during create.
    pub fn take_notify_fd(&mut self) -> Option<std::os::fd::OwnedFd> {
        self.notify_fd.take()
    }

    /// The current status, refreshed against `/proc`: a recorded init that
    /// is gone means the container stopped, whatever the file says.
    pub fn refresh_status(&mut self) -> Result<ContainerStatus> {
        if matches!(
            self.state.status,
            ContainerStatus::Created | ContainerStatus::Running | ContainerStatus::Paused
        ) && !self.init_process()?.is_alive()
        {
            self.state.status = ContainerStatus::Stopped;
            self.state.pid = None;
            self.store.save(&self.state)?;
        }
        Ok(self.state.status)
    }

    fn init_process(&self) -> Result<InitProcess> {
        let pid = self.state.pid.ok_or_else(|| Error::Internal {
            message: "no init pid recorded".to_string(),
        })?;
        let start_time = self.state.start_time.ok_or_else(|| Error::Internal {
            message: "no start time recorded".to_string(),
        })?;
        Ok(InitProcess::foreign(Pid::from_raw(pid), start_time))
    }

    /// Release the start gate of a created container.
    pub fn start(&mut self) -> Result<()> {
        let _lock = self.store.lock(&self.state.id)?;
        if !self.state.status.can_start() {
            return Err(Error::ConfigInvalid {
                reason: format!("cannot start a {} container", self.state.status),
            });
        }

        StartGate::release(&self.store.paths().start_fifo(&self.state.id))?;
        self.state.status = ContainerStatus::Running;
        self.store.save(&self.state)?;
        tracing::info!(id = %self.state.id, "Container started");
        Ok(())
    }

    /// Deliver a signal to the init process.
    pub fn signal(&mut self, signal: Signal) -> Result<()> {
        let _lock = self.store.lock(&self.state.id)?;
        if !self.state.status.can_kill() {
            return Err(Error::ConfigInvalid {
                reason: format!("cannot signal a {} container", self.state.status),
            });
        }
        self.init_process()?.signal(signal)
    }

    /// Freeze every task in the container.
    pub fn pause(&mut self) -> Result<()> {
        let _lock = self.store.lock(&self.state.id)?;
        if !self.state.status.can_pause() {
            return Err(Error::ConfigInvalid {
                reason: format!("cannot pause a {} container", self.state.status),
            });
        }
        self.cgroup.freeze(FreezerState::Frozen)?;
        self.state.status = ContainerStatus::Paused;
        self.store.save(&self.state)
    }

    /// Thaw a paused container.
    pub fn resume(&mut self) -> Result<()> {
        let _lock = self.store.lock(&self.state.id)?;
        if !self.state.status.can_resume() {
            return Err(Error::ConfigInvalid {
                reason: format!("cannot resume a {} container", self.state.status),
            });
        }
        self.cgroup.freeze(FreezerState::Thawed)?;
        self.state.status = ContainerStatus::Running;
        self.store.save(&self.state)
    }

    /// A resource-usage snapshot.
    pub fn stats(&self) -> Result<Stats> {
        self.cgroup.stats()
    }

    /// Remove the container once its init process is gone.
    ///
    /// With `force`, a live init is killed first. Delete confirms the
    /// process is gone and the cgroup removed before the state file goes.
    pub fn delete(mut self, force: bool) -> Result<()> {
        let _lock = self.store.lock(&self.state.id)?;

        if self.state.pid.is_some() {
            let init = self.init_process()?;
            if init.is_alive() {
                if !force {
                    return Err(Error::ConfigInvalid {
                        reason: format!(
                            "container {} still has a live init process",
                            self.state.id
                        ),
                    });
                }
                init.signal(Signal::SIGKILL)?;
                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
                while init.is_alive() && std::time::Instant::now() < deadline {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                if init.is_alive() {
                    return Err(Error::Timeout {
                        operation: format!("waiting for init {} to die", init.pid()),
                    });
                }
            }
            self.state.status = ContainerStatus::Stopped;
        }

        self.cgroup.destroy()?;
        self.store.remove(&self.state.id)?;
        tracing::info!(id = %self.state.id, "Container deleted");
        Ok(())
    }
}
