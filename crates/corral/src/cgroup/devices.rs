//! Device access rules.
//!
//! The same rule list materializes two ways: the v1 `devices` controller
//! consumes legacy allow/deny strings (written as a minimal diff against the
//! kernel's current `devices.list`), while v2 consumes a generated
//! `cgroup_device` BPF program attached to the container's cgroup.

#![allow(unsafe_code)]

use std::collections::BTreeSet;

use corral_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Device node type a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Character devices.
    Char,
    /// Block devices.
    Block,
    /// All device types.
    All,
}

impl DeviceType {
    fn v1_char(self) -> char {
        match self {
            Self::Char => 'c',
            Self::Block => 'b',
            Self::All => 'a',
        }
    }

    /// The kernel's `bpf_cgroup_dev_ctx` type constant, if specific.
    fn bpf_type(self) -> Option<i32> {
        // BPF_DEVCG_DEV_BLOCK / BPF_DEVCG_DEV_CHAR
        match self {
            Self::Block => Some(1),
            Self::Char => Some(2),
            Self::All => None,
        }
    }
}

/// One allow or deny rule for device access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Allow (true) or deny (false).
    pub allow: bool,
    /// Device node type.
    pub dev_type: DeviceType,
    /// Major number; `None` matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    /// Minor number; `None` matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    /// Access string, any combination of `r`, `w`, `m`.
    pub access: String,
}

impl DeviceRule {
    /// Render the legacy cgroup v1 entry (`"c 1:3 rwm"`).
    #[must_use]
    pub fn v1_entry(&self) -> String {
        let major = self.major.map_or_else(|| "*".to_string(), |m| m.to_string());
        let minor = self.minor.map_or_else(|| "*".to_string(), |m| m.to_string());
        format!(
            "{} {}:{} {}",
            self.dev_type.v1_char(),
            major,
            minor,
            self.access
        )
    }

    /// Access bits for the BPF device context (`m`=1, `r`=2, `w`=4).
    fn bpf_access(&self) -> Result<i32> {
        let mut bits = 0;
        for c in self.access.chars() {
            bits |= match c {
                'm' => 1,
                'r' => 2,
                'w' => 4,
                other => {
                    return Err(Error::ConfigInvalid {
                        reason: format!("invalid device access flag {other:?}"),
                    })
                }
            };
        }
        Ok(bits)
    }
}

/// The v1 writes needed to move the kernel's current allow list to the
/// state the rule list describes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct V1Writes {
    /// Entries to append to `devices.allow`.
    pub allow: Vec<String>,
    /// Entries to append to `devices.deny`.
    pub deny: Vec<String>,
}

impl V1Writes {
    /// No writes needed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

/// Materialize the ordered rule list into the final allowed-entry set.
///
/// Returns `(default_allow, entries)`: when a rule for all devices appears,
/// it resets the baseline, and later specific rules refine it.
fn materialize(rules: &[DeviceRule]) -> (bool, BTreeSet<String>) {
    let mut default_allow = true;
    let mut entries: BTreeSet<String> = BTreeSet::new();

    for rule in rules {
        if rule.dev_type == DeviceType::All && rule.major.is_none() && rule.minor.is_none() {
            default_allow = rule.allow;
            entries.clear();
            continue;
        }
        if rule.allow == default_allow {
            // Redundant with the baseline.
            continue;
        }
        entries.insert(rule.v1_entry());
    }

    (default_allow, entries)
}

/// Compute the minimal v1 diff between the kernel's current `devices.list`
/// contents and the rule list.
#[must_use]
pub fn v1_diff(current_list: &str, rules: &[DeviceRule]) -> V1Writes {
    let (default_allow, desired) = materialize(rules);
    let current: BTreeSet<String> = current_list
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let mut writes = V1Writes::default();
    let currently_allow_all = current.iter().any(|e| e.starts_with('a'));

    if default_allow {
        // Baseline allow-everything, desired entries are denials.
        if !currently_allow_all {
            writes.allow.push("a *:* rwm".to_string());
        }
        writes.deny.extend(desired.iter().cloned());
    } else {
        // Baseline deny-everything, desired entries are allowances.
        if currently_allow_all {
            writes.deny.push("a *:* rwm".to_string());
            writes.allow.extend(desired.iter().cloned());
        } else {
            for entry in desired.difference(&current) {
                writes.allow.push(entry.clone());
            }
            for entry in current.difference(&desired) {
                writes.deny.push(entry.clone());
            }
        }
    }

    writes
}

/// One eBPF instruction, serialized little-endian as the kernel expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EbpfInsn {
    code: u8,
    dst: u8,
    src: u8,
    off: i16,
    imm: i32,
}

impl EbpfInsn {
    fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self {
            code,
            dst,
            src,
            off,
            imm,
        }
    }

    /// The 8-byte kernel encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.code;
        bytes[1] = (self.src << 4) | (self.dst & 0x0f);
        bytes[2..4].copy_from_slice(&self.off.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.imm.to_le_bytes());
        bytes
    }
}

// eBPF opcodes used by the generated program.
const LDXW: u8 = 0x61; // dst = *(u32 *)(src + off)
const AND64_K: u8 = 0x57;
const RSH64_K: u8 = 0x77;
const MOV64_K: u8 = 0xb7;
const MOV64_X: u8 = 0xbf;
const JNE_K: u8 = 0x55;
const EXIT: u8 = 0x95;

/// Generate a `cgroup_device` program enforcing the rule list.
///
/// The context layout is the kernel's `bpf_cgroup_dev_ctx`: access_type
/// (device type in the low 16 bits, access bits in the high 16), major,
/// minor. Generation is deterministic: the same rules produce the same
/// instructions.
pub fn v2_program(rules: &[DeviceRule]) -> Result<Vec<EbpfInsn>> {
    let mut default_allow = true;
    let mut specific: Vec<&DeviceRule> = Vec::new();
    for rule in rules {
        if rule.dev_type == DeviceType::All && rule.major.is_none() && rule.minor.is_none() {
            default_allow = rule.allow;
            specific.clear();
        } else {
            specific.push(rule);
        }
    }

    let mut prog = vec![
        // r2 = device type
        EbpfInsn::new(LDXW, 2, 1, 0, 0),
        EbpfInsn::new(AND64_K, 2, 0, 0, 0xffff),
        // r3 = requested access bits
        EbpfInsn::new(LDXW, 3, 1, 0, 0),
        EbpfInsn::new(RSH64_K, 3, 0, 0, 16),
        // r4 = major, r5 = minor
        EbpfInsn::new(LDXW, 4, 1, 4, 0),
        EbpfInsn::new(LDXW, 5, 1, 8, 0),
    ];

    for rule in specific {
        let access = rule.bpf_access()?;
        let mut block: Vec<EbpfInsn> = Vec::new();

        if let Some(bpf_type) = rule.dev_type.bpf_type() {
            block.push(EbpfInsn::new(JNE_K, 2, 0, 0, bpf_type));
        }
        // The rule must cover every requested access bit:
        // (requested & ~granted) != 0 means some bit is not covered.
        block.push(EbpfInsn::new(MOV64_X, 6, 3, 0, 0));
        block.push(EbpfInsn::new(AND64_K, 6, 0, 0, !access));
        block.push(EbpfInsn::new(JNE_K, 6, 0, 0, 0));
        if let Some(major) = rule.major {
            block.push(EbpfInsn::new(JNE_K, 4, 0, 0, major as i32));
        }
        if let Some(minor) = rule.minor {
            block.push(EbpfInsn::new(JNE_K, 5, 0, 0, minor as i32));
        }
        block.push(EbpfInsn::new(MOV64_K, 0, 0, 0, i32::from(rule.allow)));
        block.push(EbpfInsn::new(EXIT, 0, 0, 0, 0));

        // Resolve every jump-on-mismatch to the first instruction after
        // this block. Offsets are relative to the next instruction.
        let len = block.len();
        for (idx, insn) in block.iter_mut().enumerate() {
            if insn.code == JNE_K {
                insn.off = (len - idx - 1) as i16;
            }
        }
        prog.extend(block);
    }

    prog.push(EbpfInsn::new(MOV64_K, 0, 0, 0, i32::from(default_allow)));
    prog.push(EbpfInsn::new(EXIT, 0, 0, 0, 0));
    Ok(prog)
}

/// Serialize a program to the byte image `bpf(2)` loads.
#[must_use]
pub fn encode_program(prog: &[EbpfInsn]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(prog.len() * 8);
    for insn in prog {
        bytes.extend_from_slice(&insn.encode());
    }
    bytes
}

/// Load the program and attach it to the cgroup directory fd.
#[cfg(target_os = "linux")]
pub fn load_and_attach(prog: &[EbpfInsn], cgroup_fd: std::os::fd::RawFd) -> Result<()> {
    use std::os::fd::RawFd;

    const BPF_PROG_LOAD: libc::c_int = 5;
    const BPF_PROG_ATTACH: libc::c_int = 8;
    const BPF_PROG_TYPE_CGROUP_DEVICE: u32 = 15;
    const BPF_CGROUP_DEVICE: u32 = 6;
    const BPF_F_ALLOW_MULTI: u32 = 2;

    #[repr(C)]
    #[derive(Default)]
    struct ProgLoadAttr {
        prog_type: u32,
        insn_cnt: u32,
        insns: u64,
        license: u64,
        log_level: u32,
        log_size: u32,
        log_buf: u64,
        kern_version: u32,
        prog_flags: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct ProgAttachAttr {
        target_fd: u32,
        attach_bpf_fd: u32,
        attach_type: u32,
        attach_flags: u32,
    }

    let insns: Vec<[u8; 8]> = prog.iter().map(EbpfInsn::encode).collect();
    let license = b"Apache-2.0\0";

    let load_attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_CGROUP_DEVICE,
        insn_cnt: prog.len() as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        ..Default::default()
    };

    // Safety: attr points at a properly sized, initialized structure.
    let prog_fd = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_PROG_LOAD,
            &load_attr as *const _ as *const libc::c_void,
            std::mem::size_of::<ProgLoadAttr>(),
        )
    };
    if prog_fd < 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::KernelUnsupported {
            feature: "cgroup_device bpf program".to_string(),
            detail: err.to_string(),
        });
    }
    let prog_fd = prog_fd as RawFd;

    let attach_attr = ProgAttachAttr {
        target_fd: cgroup_fd as u32,
        attach_bpf_fd: prog_fd as u32,
        attach_type: BPF_CGROUP_DEVICE,
        attach_flags: BPF_F_ALLOW_MULTI,
    };

    // Safety: same contract as above.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_PROG_ATTACH,
            &attach_attr as *const _ as *const libc::c_void,
            std::mem::size_of::<ProgAttachAttr>(),
        )
    };
    let attach_err = (rc < 0).then(std::io::Error::last_os_error);

    // Safety: prog_fd came from a successful bpf(2) call above.
    unsafe { libc::close(prog_fd) };

    if let Some(err) = attach_err {
        return Err(Error::Internal {
            message: format!("attaching device program: {err}"),
        });
    }

    tracing::debug!(insns = prog.len(), "Attached cgroup device program");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(dev_type: DeviceType, major: Option<i64>, minor: Option<i64>) -> DeviceRule {
        DeviceRule {
            allow: true,
            dev_type,
            major,
            minor,
            access: "rwm".to_string(),
        }
    }

    fn deny_all() -> DeviceRule {
        DeviceRule {
            allow: false,
            dev_type: DeviceType::All,
            major: None,
            minor: None,
            access: "rwm".to_string(),
        }
    }

    #[test]
    fn v1_entry_renders_wildcards() {
        let rule = allow(DeviceType::Char, Some(1), None);
        assert_eq!(rule.v1_entry(), "c 1:* rwm");
        assert_eq!(deny_all().v1_entry(), "a *:* rwm");
    }

    #[test]
    fn diff_is_empty_when_already_converged() {
        let rules = vec![deny_all(), allow(DeviceType::Char, Some(1), Some(3))];
        let current = "c 1:3 rwm\n";
        let writes = v1_diff(current, &rules);
        assert!(writes.is_empty());
    }

    #[test]
    fn diff_from_allow_all_resets_then_allows() {
        let rules = vec![deny_all(), allow(DeviceType::Char, Some(1), Some(3))];
        let current = "a *:* rwm\n";
        let writes = v1_diff(current, &rules);
        assert_eq!(writes.deny, vec!["a *:* rwm".to_string()]);
        assert_eq!(writes.allow, vec!["c 1:3 rwm".to_string()]);
    }

    #[test]
    fn diff_only_touches_changed_entries() {
        let rules = vec![
            deny_all(),
            allow(DeviceType::Char, Some(1), Some(3)),
            allow(DeviceType::Char, Some(1), Some(5)),
        ];
        let current = "c 1:3 rwm\nc 1:7 rwm\n";
        let writes = v1_diff(current, &rules);
        assert_eq!(writes.allow, vec!["c 1:5 rwm".to_string()]);
        assert_eq!(writes.deny, vec!["c 1:7 rwm".to_string()]);
    }

    #[test]
    fn program_generation_is_deterministic() {
        let rules = vec![
            deny_all(),
            allow(DeviceType::Char, Some(1), Some(3)),
            allow(DeviceType::Block, Some(8), None),
        ];
        let a = encode_program(&v2_program(&rules).unwrap());
        let b = encode_program(&v2_program(&rules).unwrap());
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert_eq!(a.len() % 8, 0);
    }

    #[test]
    fn empty_rules_produce_allow_all_program() {
        let prog = v2_program(&[]).unwrap();
        // Prologue, then `mov r0, 1; exit`.
        assert_eq!(prog.len(), 8);
        let bytes = encode_program(&prog);
        // Final return value is 1 (allow).
        assert_eq!(bytes[bytes.len() - 12], 1);
    }

    #[test]
    fn bad_access_flag_is_config_error() {
        let rule = DeviceRule {
            allow: true,
            dev_type: DeviceType::Char,
            major: Some(1),
            minor: Some(3),
            access: "rwx".to_string(),
        };
        assert!(v2_program(&[deny_all(), rule]).is_err());
    }
}
