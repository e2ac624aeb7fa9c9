//! Seccomp policy model, validation, and installation.
//!
//! The declarative policy compiles to a neutral intermediate representation
//! (arches, flags, resolved rules) which serializes to a classic-BPF
//! program; both steps are pure and deterministic, so the whole pipeline is
//! testable without touching the kernel. Only the final load makes a
//! syscall.

pub mod compiler;
pub mod loader;
pub mod syscalls;

use corral_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Minimum kernel seccomp API level required for user notification.
pub const NOTIFY_MIN_API: u32 = 6;

/// What to do when a syscall matches (or when nothing matches, for the
/// default action).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Let the syscall through.
    Allow,
    /// Fail the syscall with an errno.
    Errno,
    /// Raise SIGSYS in the calling thread.
    Trap,
    /// Kill the calling thread.
    Kill,
    /// Kill the whole process.
    KillProcess,
    /// Report to a tracer, failing with an errno without one.
    Trace,
    /// Log and allow.
    Log,
    /// Suspend the task and notify the user-space agent.
    Notify,
}

/// One argument predicate: compare argument `index` against `value`
/// (and `value2` for the masked compare).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgCmp {
    /// Argument index, 0-5.
    pub index: u32,
    /// Comparison operator.
    pub op: CmpOp,
    /// Right-hand value (the mask for [`CmpOp::MaskedEq`]).
    pub value: u64,
    /// Second value, used by [`CmpOp::MaskedEq`].
    #[serde(default)]
    pub value2: u64,
}

/// Comparison operators for argument predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned less-than.
    Lt,
    /// Unsigned less-or-equal.
    Le,
    /// Unsigned greater-than.
    Gt,
    /// Unsigned greater-or-equal.
    Ge,
    /// `(arg & value) == value2`.
    MaskedEq,
}

/// One syscall rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallRule {
    /// The syscall name.
    pub name: String,
    /// Action on match.
    pub action: Action,
    /// Errno returned for `Errno`/`Trace` actions; defaults to EPERM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno_ret: Option<u16>,
    /// Up to six argument predicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgCmp>,
}

/// Architectures a policy may admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// 32-bit x86.
    X86,
    /// x32 ABI.
    X32,
    /// 64-bit ARM.
    Aarch64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit RISC-V.
    Riscv64,
    /// IBM z.
    S390x,
    /// 64-bit PowerPC, little-endian.
    Ppc64le,
}

impl Arch {
    /// The AUDIT_ARCH token the kernel reports in `seccomp_data.arch`.
    #[must_use]
    pub fn audit_token(self) -> u32 {
        const EM_X86_64: u32 = 62;
        const EM_386: u32 = 3;
        const EM_AARCH64: u32 = 183;
        const EM_ARM: u32 = 40;
        const EM_RISCV: u32 = 243;
        const EM_S390: u32 = 22;
        const EM_PPC64: u32 = 21;
        const AUDIT_ARCH_64BIT: u32 = 0x8000_0000;
        const AUDIT_ARCH_LE: u32 = 0x4000_0000;

        match self {
            Self::X86_64 => EM_X86_64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE,
            Self::X86 => EM_386 | AUDIT_ARCH_LE,
            Self::X32 => EM_X86_64 | AUDIT_ARCH_LE,
            Self::Aarch64 => EM_AARCH64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE,
            Self::Arm => EM_ARM | AUDIT_ARCH_LE,
            Self::Riscv64 => EM_RISCV | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE,
            Self::S390x => EM_S390 | AUDIT_ARCH_64BIT,
            Self::Ppc64le => EM_PPC64 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE,
        }
    }

    /// The architecture this binary was compiled for.
    #[must_use]
    pub fn native() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self::X86_64
        }
        #[cfg(target_arch = "aarch64")]
        {
            Self::Aarch64
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            compile_error!("unsupported seccomp architecture")
        }
    }
}

/// A declarative seccomp policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeccompPolicy {
    /// Action when no rule matches.
    pub default_action: Action,
    /// Errno for a default `Errno` action; defaults to EPERM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_errno_ret: Option<u16>,
    /// Architectures admitted by the filter, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub architectures: Vec<Arch>,
    /// Filter flags: `log`, `spec-allow`, `tsync`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Ordered syscall rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syscalls: Vec<SyscallRule>,
}

impl SeccompPolicy {
    /// Whether any rule (or the default) wants user notification.
    #[must_use]
    pub fn wants_notify(&self) -> bool {
        self.default_action == Action::Notify
            || self.syscalls.iter().any(|r| r.action == Action::Notify)
    }

    /// Reject invalid policies before any kernel call.
    ///
    /// The sync channel that hands the notify fd to the parent needs
    /// `write` to keep working, so neither a notify rule on `write` nor a
    /// notify default action can be accepted.
    pub fn validate(&self, api_level: u32) -> Result<()> {
        if self.default_action == Action::Notify {
            return Err(Error::ConfigInvalid {
                reason: "notify cannot be the default seccomp action".to_string(),
            });
        }

        for rule in &self.syscalls {
            if rule.action == Action::Notify {
                if rule.name == "write" {
                    return Err(Error::ConfigInvalid {
                        reason: "notify cannot be used for the write syscall".to_string(),
                    });
                }
                if api_level < NOTIFY_MIN_API {
                    return Err(Error::KernelUnsupported {
                        feature: "seccomp notify".to_string(),
                        detail: format!(
                            "API level: got {api_level}, want at least {NOTIFY_MIN_API}"
                        ),
                    });
                }
            }

            for arg in &rule.args {
                if arg.index > 5 {
                    return Err(Error::ConfigInvalid {
                        reason: format!(
                            "syscall {} condition references argument {}",
                            rule.name, arg.index
                        ),
                    });
                }
            }
        }

        for flag in &self.flags {
            if !matches!(flag.as_str(), "log" | "spec-allow" | "tsync") {
                return Err(Error::ConfigInvalid {
                    reason: format!("unknown seccomp filter flag {flag:?}"),
                });
            }
        }

        Ok(())
    }
}

/// Validate, compile, and load a policy into the current task.
///
/// Returns the notification fd when the policy uses the notify action.
/// The no-new-privileges bit is owned by the caller and must already be
/// set (or the task must hold CAP_SYS_ADMIN).
pub fn install(policy: &SeccompPolicy) -> Result<Option<std::os::fd::OwnedFd>> {
    policy.validate(loader::api_level())?;
    let ir = compiler::compile(policy)?;
    let program = compiler::serialize(&ir);
    loader::load(&program, &ir.flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with(rules: Vec<SyscallRule>) -> SeccompPolicy {
        SeccompPolicy {
            default_action: Action::Allow,
            default_errno_ret: None,
            architectures: vec![],
            flags: vec![],
            syscalls: rules,
        }
    }

    fn notify_rule(name: &str) -> SyscallRule {
        SyscallRule {
            name: name.to_string(),
            action: Action::Notify,
            errno_ret: None,
            args: vec![],
        }
    }

    #[test]
    fn write_notify_is_rejected() {
        let policy = policy_with(vec![notify_rule("write")]);
        let err = policy.validate(6).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn notify_default_is_rejected() {
        let mut policy = policy_with(vec![]);
        policy.default_action = Action::Notify;
        assert!(matches!(
            policy.validate(6),
            Err(Error::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn notify_requires_api_level_six() {
        let policy = policy_with(vec![notify_rule("getpid")]);
        let err = policy.validate(5).unwrap_err();
        match err {
            Error::KernelUnsupported { detail, .. } => {
                assert!(detail.contains("got 5"));
                assert!(detail.contains("at least 6"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(policy.validate(6).is_ok());
    }

    #[test]
    fn unknown_flag_is_a_hard_error() {
        let mut policy = policy_with(vec![]);
        policy.flags = vec!["log".to_string(), "wait-killable-recv".to_string()];
        assert!(matches!(
            policy.validate(6),
            Err(Error::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn argument_index_out_of_range_is_rejected() {
        let policy = policy_with(vec![SyscallRule {
            name: "openat".to_string(),
            action: Action::Errno,
            errno_ret: None,
            args: vec![ArgCmp {
                index: 6,
                op: CmpOp::Eq,
                value: 0,
                value2: 0,
            }],
        }]);
        assert!(policy.validate(6).is_err());
    }
}
