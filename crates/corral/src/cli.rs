//! The minimal command front-end.
//!
//! One lifecycle operation per invocation; the real work lives in
//! [`crate::container`]. Configuration arrives as a JSON rendering of
//! [`crate::config::Config`].

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use corral_common::{Error, Result, RuntimePaths};
use nix::sys::signal::Signal;

use crate::config::Config;
use crate::container::Container;
use crate::state::StateStore;

/// Low-level container runtime: namespaces, cgroups, seccomp.
#[derive(Debug, Parser)]
#[command(name = "corral", version, about)]
pub struct Cli {
    /// Root directory for container state.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Build the sandbox and leave the init process gated.
    Create {
        /// Path to the container configuration (JSON).
        #[arg(long)]
        config: PathBuf,
    },
    /// Create and immediately start.
    Run {
        /// Path to the container configuration (JSON).
        #[arg(long)]
        config: PathBuf,
    },
    /// Release the start gate of a created container.
    Start {
        /// Container id.
        id: String,
    },
    /// Send a signal to the init process.
    Kill {
        /// Container id.
        id: String,
        /// Signal name or number (default SIGTERM).
        #[arg(default_value = "SIGTERM")]
        signal: String,
    },
    /// Freeze the container.
    Pause {
        /// Container id.
        id: String,
    },
    /// Thaw a paused container.
    Resume {
        /// Container id.
        id: String,
    },
    /// Remove a stopped container.
    Delete {
        /// Container id.
        id: String,
        /// Kill a live init process first.
        #[arg(long)]
        force: bool,
    },
    /// Print the persisted state record.
    State {
        /// Container id.
        id: String,
    },
    /// Print a resource-usage snapshot.
    Stats {
        /// Container id.
        id: String,
    },
}

fn parse_signal(value: &str) -> Result<Signal> {
    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| Error::ConfigInvalid {
            reason: format!("unknown signal number {number}"),
        });
    }
    let name = if value.starts_with("SIG") {
        value.to_string()
    } else {
        format!("SIG{value}")
    };
    Signal::from_str(&name).map_err(|_| Error::ConfigInvalid {
        reason: format!("unknown signal {value:?}"),
    })
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| Error::ConfigInvalid {
        reason: format!("{}: {e}", path.display()),
    })
}

impl Cli {
    /// Execute the parsed command.
    pub fn execute(self) -> Result<()> {
        let paths = self
            .root
            .map_or_else(RuntimePaths::system, RuntimePaths::rooted_at);
        let store = StateStore::new(paths);

        match self.command {
            CliCommand::Create { config } => {
                let container = Container::create(load_config(&config)?, store)?;
                println!("{}", container.state().id);
            }
            CliCommand::Run { config } => {
                let container = Container::run(load_config(&config)?, store)?;
                println!("{}", container.state().id);
            }
            CliCommand::Start { id } => Container::load(&id, store)?.start()?,
            CliCommand::Kill { id, signal } => {
                Container::load(&id, store)?.signal(parse_signal(&signal)?)?;
            }
            CliCommand::Pause { id } => Container::load(&id, store)?.pause()?,
            CliCommand::Resume { id } => Container::load(&id, store)?.resume()?,
            CliCommand::Delete { id, force } => Container::load(&id, store)?.delete(force)?,
            CliCommand::State { id } => {
                let mut container = Container::load(&id, store)?;
                container.refresh_status()?;
                let json =
                    serde_json::to_string_pretty(container.state()).map_err(|e| {
                        Error::Internal {
                            message: format!("state serialization: {e}"),
                        }
                    })?;
                println!("{json}");
            }
            CliCommand::Stats { id } => {
                let stats = Container::load(&id, store)?.stats()?;
                let json = serde_json::to_string_pretty(&stats).map_err(|e| Error::Internal {
                    message: format!("stats serialization: {e}"),
                })?;
                println!("{json}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_parsing_accepts_names_and_numbers() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("SIGNOPE").is_err());
    }
}
