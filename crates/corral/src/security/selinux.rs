//! SELinux process-label application.

use std::path::Path;

use corral_common::{Error, Result};

/// True when an SELinux policy is loaded.
#[must_use]
pub fn is_enabled() -> bool {
    Path::new("/sys/fs/selinux/enforce").exists()
}

fn valid_label(label: &str) -> bool {
    // user:role:type with an optional level.
    let parts = label.split(':').count();
    (3..=5).contains(&parts)
}

/// Arrange for the given label to apply to the process across the next
/// exec.
pub fn apply_selinux_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Ok(());
    }

    if !valid_label(label) {
        return Err(Error::ConfigInvalid {
            reason: format!("malformed SELinux label {label:?}"),
        });
    }

    if !is_enabled() {
        return Err(Error::KernelUnsupported {
            feature: "SELinux".to_string(),
            detail: "no SELinux policy is loaded".to_string(),
        });
    }

    std::fs::write("/proc/self/attr/exec", label).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied {
                operation: format!("set SELinux label {label}"),
            }
        } else {
            Error::Internal {
                message: format!("writing /proc/self/attr/exec: {e}"),
            }
        }
    })?;

    tracing::debug!(label, "SELinux exec label set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_label_is_a_no_op() {
        apply_selinux_label("").unwrap();
    }

    #[test]
    fn malformed_label_is_rejected() {
        let err = apply_selinux_label("not-a-label").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn label_shape_validation() {
        assert!(valid_label("system_u:system_r:container_t:s0"));
        assert!(valid_label("user_u:user_r:user_t"));
        assert!(!valid_label("container_t"));
    }
}
