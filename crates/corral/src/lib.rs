//! # corral
//!
//! A low-level Linux container runtime core. Given an immutable
//! configuration, it constructs the namespace/cgroup/security envelope,
//! places one process inside it, and supervises the container's lifecycle,
//! one operation per invocation.
//!
//! The three load-bearing subsystems:
//! - [`process`]: the multi-stage init-spawn state machine
//!   (parent / shim / child over typed channels)
//! - [`cgroup`]: the hierarchy-version-agnostic resource manager
//! - [`seccomp`]: the declarative-policy-to-BPF compiler and loader
//!
//! ## Usage
//!
//! ```no_run
//! use corral::container::Container;
//! use corral::state::StateStore;
//! use corral_common::RuntimePaths;
//!
//! # fn example(config: corral::config::Config) -> corral_common::Result<()> {
//! let store = StateStore::new(RuntimePaths::system());
//! let container = Container::create(config, store)?;
//! println!("created {}", container.state().id);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod config;
pub mod container;
pub mod namespace;
pub mod notify;
pub mod process;
pub mod rootfs;
pub mod seccomp;
pub mod security;
pub mod state;

pub use container::Container;
