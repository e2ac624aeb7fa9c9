//! Common error types for the corral runtime.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the runtime core.
///
/// Every setup stage tags its own failures with the stage name; errors that
/// cross the sync-pipe boundary are re-emitted on the parent side with the
/// remote stage and original text preserved verbatim.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// The configuration was rejected before any kernel call.
    #[error("invalid configuration: {reason}")]
    #[diagnostic(code(corral::config::invalid))]
    ConfigInvalid {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// The running kernel lacks a required feature.
    #[error("kernel does not support {feature}: {detail}")]
    #[diagnostic(
        code(corral::kernel::unsupported),
        help("check the kernel version and compiled-in features")
    )]
    KernelUnsupported {
        /// The missing feature (API level, controller, namespace kind).
        feature: String,
        /// Precise version or probing detail.
        detail: String,
    },

    /// A privilege or rootless limitation.
    #[error("permission denied: {operation}")]
    #[diagnostic(
        code(corral::permission_denied),
        help("the operation may require root or delegated cgroup controllers")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// A resource was busy (cgroup EBUSY, busy mount target).
    #[error("resource busy: {resource}")]
    #[diagnostic(code(corral::resource_busy))]
    ResourceBusy {
        /// The busy resource.
        resource: String,
    },

    /// A deadline expired or a bounded poll was exhausted.
    #[error("timed out: {operation}")]
    #[diagnostic(code(corral::timeout))]
    Timeout {
        /// The operation that exceeded its budget.
        operation: String,
    },

    /// An unexpected sync tag or a truncated blob.
    #[error("protocol violation in {stage}: {detail}")]
    #[diagnostic(code(corral::protocol))]
    ProtocolViolation {
        /// The stage observing the violation.
        stage: String,
        /// What was observed.
        detail: String,
    },

    /// The shim or child stage reported a setup failure before exec.
    ///
    /// `cleanup` carries a secondary cause from the parent's own unwinding;
    /// it never displaces the child's error.
    #[error("container setup failed in {stage}: {message}")]
    #[diagnostic(code(corral::child_failed))]
    ChildFailed {
        /// The remote stage that failed.
        stage: String,
        /// The original error text, preserved verbatim.
        message: String,
        /// Secondary cleanup failure, if any.
        cleanup: Option<String>,
    },

    /// The operation is not available on this process variant.
    #[error("operation not supported: {operation}")]
    #[diagnostic(code(corral::unsupported))]
    Unsupported {
        /// The unavailable operation.
        operation: String,
    },

    /// No container with this id is known.
    #[error("container not found: {id}")]
    #[diagnostic(code(corral::container::not_found))]
    ContainerNotFound {
        /// The container id that was not found.
        id: String,
    },

    /// Invalid container id format.
    #[error("invalid container id: {id}")]
    #[diagnostic(
        code(corral::container::invalid_id),
        help("ids are 1-64 alphanumeric/hyphen/underscore characters, starting alphanumeric")
    )]
    InvalidContainerId {
        /// The rejected id.
        id: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(corral::io))]
    Io(#[from] std::io::Error),

    /// An internal invariant was broken.
    #[error("internal error: {message}")]
    #[diagnostic(
        code(corral::internal),
        help("this is a bug, please report it at https://github.com/corral-runtime/corral/issues")
    )]
    Internal {
        /// The broken invariant.
        message: String,
    },
}

impl Error {
    /// Attach a secondary cleanup failure to a child error.
    ///
    /// The child's error is never discarded in favor of the parent's own
    /// cleanup errors; the cleanup text rides along as a secondary cause.
    #[must_use]
    pub fn with_cleanup(self, cleanup_err: &Error) -> Self {
        match self {
            Self::ChildFailed {
                stage,
                message,
                cleanup: prior,
            } => {
                let text = match prior {
                    Some(prior) => format!("{prior}; {cleanup_err}"),
                    None => cleanup_err.to_string(),
                };
                Self::ChildFailed {
                    stage,
                    message,
                    cleanup: Some(text),
                }
            }
            other => other,
        }
    }

    /// True for kernel gaps that are downgradeable for optional features.
    #[must_use]
    pub fn is_kernel_gap(&self) -> bool {
        matches!(self, Self::KernelUnsupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_preserves_remote_text() {
        let err = Error::ChildFailed {
            stage: "child-finalize".to_string(),
            message: "pivot_root failed: EINVAL".to_string(),
            cleanup: None,
        };
        assert_eq!(
            err.to_string(),
            "container setup failed in child-finalize: pivot_root failed: EINVAL"
        );
    }

    #[test]
    fn cleanup_attaches_without_displacing() {
        let err = Error::ChildFailed {
            stage: "cgroup-apply".to_string(),
            message: "write pids.max: EACCES".to_string(),
            cleanup: None,
        };
        let cleanup = Error::ResourceBusy {
            resource: "/sys/fs/cgroup/corral/x".to_string(),
        };
        let combined = err.with_cleanup(&cleanup);
        match combined {
            Error::ChildFailed {
                message, cleanup, ..
            } => {
                assert_eq!(message, "write pids.max: EACCES");
                assert!(cleanup.unwrap().contains("resource busy"));
            }
            other => panic!("unexpected variant: {other}"),
        }
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
