//! # corral-common
//!
//! Shared foundation for the corral container runtime:
//! - the runtime error taxonomy
//! - validated container ids
//! - the standard state-directory layout

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{Error, Result};
pub use id::ContainerId;
pub use paths::RuntimePaths;
