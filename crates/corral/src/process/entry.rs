//! Stage dispatch at process entry.
//!
//! The parent re-executes `/proc/self/exe` with [`super::STAGE_ENV`] set;
//! this hook runs before argument parsing, logging setup, or anything else
//! that could disturb the inherited channel fds. A process without the
//! marker falls through to the normal front-end.

use std::os::fd::RawFd;

use corral_common::{Error, Result};

use super::{shim, INIT_FD_ENV, STAGE_ENV, STAGE_SHIM, START_FIFO_ENV, SYNC_FD_ENV};

/// The channel endpoints a re-executed stage inherits.
#[derive(Debug)]
pub struct StageEnv {
    /// Sync-channel fd.
    pub sync_fd: RawFd,
    /// Init-pipe read fd.
    pub init_fd: RawFd,
    /// Start-gate fifo path.
    pub start_fifo: std::path::PathBuf,
}

fn fd_from_env(name: &str) -> Result<RawFd> {
    let value = std::env::var(name).map_err(|_| Error::ProtocolViolation {
        stage: "entry".to_string(),
        detail: format!("{name} is not set"),
    })?;
    value.parse().map_err(|_| Error::ProtocolViolation {
        stage: "entry".to_string(),
        detail: format!("{name}={value} is not a file descriptor"),
    })
}

impl StageEnv {
    fn from_env() -> Result<Self> {
        Ok(Self {
            sync_fd: fd_from_env(SYNC_FD_ENV)?,
            init_fd: fd_from_env(INIT_FD_ENV)?,
            start_fifo: std::env::var(START_FIFO_ENV)
                .map_err(|_| Error::ProtocolViolation {
                    stage: "entry".to_string(),
                    detail: format!("{START_FIFO_ENV} is not set"),
                })?
                .into(),
        })
    }
}

/// Dispatch on the stage marker. Returns only when this process is not a
/// re-executed stage; a stage either execs the user process or exits.
pub fn dispatch() {
    let Ok(stage) = std::env::var(STAGE_ENV) else {
        return;
    };

    // The stages log to stderr like the parent; the subscriber is built
    // here, explicitly per process, so nothing depends on logger state
    // crossing the exec.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let code = match stage.as_str() {
        STAGE_SHIM => match StageEnv::from_env().and_then(|env| shim::run(&env)) {
            // The shim hands off via exec; reaching here means failure.
            Ok(never) => match never {},
            Err(err) => {
                tracing::error!(error = %err, "Stage failed");
                1
            }
        },
        other => {
            tracing::error!(stage = other, "Unknown stage marker");
            1
        }
    };
    std::process::exit(code);
}
