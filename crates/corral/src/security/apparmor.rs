//! AppArmor profile application.

use std::path::Path;

use corral_common::{Error, Result};

/// True when the kernel has AppArmor enabled.
#[must_use]
pub fn is_enabled() -> bool {
    Path::new("/sys/module/apparmor").exists()
        && Path::new("/sys/kernel/security/apparmor").exists()
}

/// Arrange for the given profile to confine the process across the next
/// exec.
///
/// An `unconfined` profile is a no-op. A configured profile on a kernel
/// without AppArmor is an error: the configuration asked for confinement
/// the host cannot deliver.
pub fn apply_apparmor_profile(profile: &str) -> Result<()> {
    if profile.is_empty() || profile == "unconfined" {
        return Ok(());
    }

    if !is_enabled() {
        return Err(Error::KernelUnsupported {
            feature: "AppArmor".to_string(),
            detail: "apparmor is not enabled on this kernel".to_string(),
        });
    }

    // Newer kernels expose a dedicated apparmor attribute directory.
    let exec_path = if Path::new("/proc/self/attr/apparmor/exec").exists() {
        "/proc/self/attr/apparmor/exec"
    } else {
        "/proc/self/attr/exec"
    };

    std::fs::write(exec_path, format!("exec {profile}")).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied {
                operation: format!("set AppArmor profile {profile}"),
            }
        } else {
            Error::Internal {
                message: format!("writing {exec_path}: {e}"),
            }
        }
    })?;

    tracing::debug!(profile, "AppArmor exec profile set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfined_profile_is_a_no_op() {
        apply_apparmor_profile("unconfined").unwrap();
        apply_apparmor_profile("").unwrap();
    }
}
