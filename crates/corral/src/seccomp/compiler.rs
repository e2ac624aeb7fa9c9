//! Policy compilation: declarative rules to a classic-BPF filter.
//!
//! Compilation is split in two pure steps. `compile` resolves the policy
//! into an intermediate representation with syscall numbers, return values,
//! and the rule-merging semantics applied; `serialize` lays the IR out as a
//! BPF program. Both are deterministic: the same policy always produces the
//! same bytes.

use corral_common::{Error, Result};

use super::{syscalls, Action, Arch, ArgCmp, CmpOp, SeccompPolicy};

/// Rule count beyond which libseccomp-style binary-tree layout would be
/// requested.
const OPTIMIZE_THRESHOLD: usize = 32;

/// EPERM, the errno used when a policy does not name one.
const DEFAULT_ERRNO: u16 = 1;

// Seccomp return values.
const RET_KILL_PROCESS: u32 = 0x8000_0000;
const RET_KILL_THREAD: u32 = 0x0000_0000;
const RET_TRAP: u32 = 0x0003_0000;
const RET_ERRNO: u32 = 0x0005_0000;
const RET_NOTIFY: u32 = 0x7fc0_0000;
const RET_TRACE: u32 = 0x7ff0_0000;
const RET_LOG: u32 = 0x7ffc_0000;
const RET_ALLOW: u32 = 0x7fff_0000;

// Offsets into struct seccomp_data.
const DATA_NR: u32 = 0;
const DATA_ARCH: u32 = 4;
const DATA_ARGS: u32 = 16;

/// Filter flags resolved from the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags {
    /// Synchronize the filter across threads.
    pub tsync: bool,
    /// Log non-allow actions.
    pub log: bool,
    /// Disable speculative-execution mitigation.
    pub spec_allow: bool,
    /// Create a user-notification listener fd.
    pub new_listener: bool,
}

/// One compiled rule: a native syscall number, a return value, and the
/// argument conditions that must all hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrRule {
    /// Native syscall number.
    pub nr: i64,
    /// Seccomp return value on match.
    pub ret: u32,
    /// Conditions, AND-ed together.
    pub conds: Vec<ArgCmp>,
}

/// The neutral representation between policy and BPF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterIr {
    /// Return value when no rule matches.
    pub default_ret: u32,
    /// Audit tokens admitted by the filter, in policy order; the native
    /// token is always present.
    pub arches: Vec<u32>,
    /// Flags for the load step.
    pub flags: LoadFlags,
    /// Compiled rules, in policy order.
    pub rules: Vec<IrRule>,
}

fn action_ret(action: Action, errno_ret: Option<u16>) -> u32 {
    match action {
        Action::Allow => RET_ALLOW,
        Action::Errno => RET_ERRNO | u32::from(errno_ret.unwrap_or(DEFAULT_ERRNO)),
        Action::Trap => RET_TRAP,
        Action::Kill => RET_KILL_THREAD,
        Action::KillProcess => RET_KILL_PROCESS,
        Action::Trace => RET_TRACE | u32::from(errno_ret.unwrap_or(DEFAULT_ERRNO)),
        Action::Log => RET_LOG,
        Action::Notify => RET_NOTIFY,
    }
}

/// Compile a validated policy into the IR.
///
/// Rule-merging semantics, matching the kernel-library behavior the
/// configuration format was written against:
/// - a rule whose action equals the default action is silently dropped;
/// - a syscall name the running kernel does not know is dropped with a
///   debug log, keeping forward-compatible policies loadable;
/// - conditions sharing an argument index split into one rule per
///   condition (OR); conditions on distinct indices stay together (AND).
pub fn compile(policy: &SeccompPolicy) -> Result<FilterIr> {
    let default_ret = action_ret(policy.default_action, policy.default_errno_ret);

    let mut flags = LoadFlags {
        // All threads must end up behind the same filter; tsync is implied
        // even when the policy does not spell it out.
        tsync: true,
        new_listener: policy.wants_notify(),
        ..Default::default()
    };
    for flag in &policy.flags {
        match flag.as_str() {
            "log" => flags.log = true,
            "spec-allow" => flags.spec_allow = true,
            "tsync" => flags.tsync = true,
            other => {
                return Err(Error::ConfigInvalid {
                    reason: format!("unknown seccomp filter flag {other:?}"),
                })
            }
        }
    }

    let native = Arch::native();
    let mut arches: Vec<u32> = Vec::new();
    for arch in &policy.architectures {
        let token = arch.audit_token();
        if !arches.contains(&token) {
            arches.push(token);
        }
    }
    if !arches.contains(&native.audit_token()) {
        arches.insert(0, native.audit_token());
    }

    if policy.syscalls.len() > OPTIMIZE_THRESHOLD {
        // The serializer only implements the linear layout; the same
        // downgrade older libseccomp applies.
        tracing::debug!(
            rules = policy.syscalls.len(),
            "seccomp binary tree optimization not available"
        );
    }

    let mut rules = Vec::new();
    for call in &policy.syscalls {
        if call.name.is_empty() {
            return Err(Error::ConfigInvalid {
                reason: "empty string is not a valid syscall".to_string(),
            });
        }

        let ret = action_ret(call.action, call.errno_ret);
        if ret == default_ret {
            // Redundant with the default action.
            continue;
        }

        let Some(nr) = syscalls::resolve(&call.name) else {
            tracing::debug!(syscall = %call.name, "unknown seccomp syscall ignored");
            continue;
        };

        if call.args.is_empty() {
            rules.push(IrRule {
                nr,
                ret,
                conds: Vec::new(),
            });
            continue;
        }

        let mut index_counts = [0u32; 6];
        for arg in &call.args {
            index_counts[arg.index as usize] += 1;
        }

        if index_counts.iter().any(|&c| c > 1) {
            // Two conditions on one argument can only mean OR; each becomes
            // its own rule.
            for arg in &call.args {
                rules.push(IrRule {
                    nr,
                    ret,
                    conds: vec![*arg],
                });
            }
        } else {
            rules.push(IrRule {
                nr,
                ret,
                conds: call.args.clone(),
            });
        }
    }

    Ok(FilterIr {
        default_ret,
        arches,
        flags,
        rules,
    })
}

/// One classic-BPF instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    /// Opcode.
    pub code: u16,
    /// Jump-if-true offset.
    pub jt: u8,
    /// Jump-if-false offset.
    pub jf: u8,
    /// Immediate operand.
    pub k: u32,
}

impl SockFilter {
    /// The 8-byte wire encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..2].copy_from_slice(&self.code.to_le_bytes());
        bytes[2] = self.jt;
        bytes[3] = self.jf;
        bytes[4..8].copy_from_slice(&self.k.to_le_bytes());
        bytes
    }
}

// Classic BPF opcodes.
const LD_ABS: u16 = 0x20; // BPF_LD | BPF_W | BPF_ABS
const AND_K: u16 = 0x54; // BPF_ALU | BPF_AND | BPF_K
const JEQ_K: u16 = 0x15; // BPF_JMP | BPF_JEQ | BPF_K
const JGT_K: u16 = 0x25; // BPF_JMP | BPF_JGT | BPF_K
const JGE_K: u16 = 0x35; // BPF_JMP | BPF_JGE | BPF_K
const RET_K: u16 = 0x06; // BPF_RET | BPF_K

/// Jump targets used while a rule block is being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum J {
    /// Fall through.
    Here,
    /// Forward by a fixed, already-known distance.
    Fwd(u8),
    /// The first instruction after this block (the next rule).
    End,
}

#[derive(Debug, Clone, Copy)]
struct PendingInsn {
    code: u16,
    jt: J,
    jf: J,
    k: u32,
}

fn p(code: u16, jt: J, jf: J, k: u32) -> PendingInsn {
    PendingInsn { code, jt, jf, k }
}

fn arg_offsets(index: u32) -> (u32, u32) {
    // Little-endian: low word first.
    let lo = DATA_ARGS + index * 8;
    (lo, lo + 4)
}

/// Emit the instructions testing one condition. On mismatch they jump to
/// the end of the rule block; on match they fall through.
fn emit_cond(block: &mut Vec<PendingInsn>, cond: &ArgCmp) {
    let (lo, hi) = arg_offsets(cond.index);
    let vlo = (cond.value & 0xffff_ffff) as u32;
    let vhi = (cond.value >> 32) as u32;

    match cond.op {
        CmpOp::Eq => {
            block.push(p(LD_ABS, J::Here, J::Here, hi));
            block.push(p(JEQ_K, J::Here, J::End, vhi));
            block.push(p(LD_ABS, J::Here, J::Here, lo));
            block.push(p(JEQ_K, J::Here, J::End, vlo));
        }
        CmpOp::Ne => {
            block.push(p(LD_ABS, J::Here, J::Here, hi));
            // High words differ: the values differ, skip the low check.
            block.push(p(JEQ_K, J::Here, J::Fwd(2), vhi));
            block.push(p(LD_ABS, J::Here, J::Here, lo));
            block.push(p(JEQ_K, J::End, J::Here, vlo));
        }
        CmpOp::Gt => {
            block.push(p(LD_ABS, J::Here, J::Here, hi));
            block.push(p(JGT_K, J::Fwd(3), J::Here, vhi));
            block.push(p(JEQ_K, J::Here, J::End, vhi));
            block.push(p(LD_ABS, J::Here, J::Here, lo));
            block.push(p(JGT_K, J::Here, J::End, vlo));
        }
        CmpOp::Ge => {
            block.push(p(LD_ABS, J::Here, J::Here, hi));
            block.push(p(JGT_K, J::Fwd(3), J::Here, vhi));
            block.push(p(JEQ_K, J::Here, J::End, vhi));
            block.push(p(LD_ABS, J::Here, J::Here, lo));
            block.push(p(JGE_K, J::Here, J::End, vlo));
        }
        CmpOp::Lt => {
            block.push(p(LD_ABS, J::Here, J::Here, hi));
            block.push(p(JGT_K, J::End, J::Here, vhi));
            block.push(p(JEQ_K, J::Here, J::Fwd(2), vhi));
            block.push(p(LD_ABS, J::Here, J::Here, lo));
            block.push(p(JGE_K, J::End, J::Here, vlo));
        }
        CmpOp::Le => {
            block.push(p(LD_ABS, J::Here, J::Here, hi));
            block.push(p(JGT_K, J::End, J::Here, vhi));
            block.push(p(JEQ_K, J::Here, J::Fwd(2), vhi));
            block.push(p(LD_ABS, J::Here, J::Here, lo));
            block.push(p(JGT_K, J::End, J::Here, vlo));
        }
        CmpOp::MaskedEq => {
            let mlo = vlo;
            let mhi = vhi;
            let wlo = (cond.value2 & 0xffff_ffff) as u32;
            let whi = (cond.value2 >> 32) as u32;
            block.push(p(LD_ABS, J::Here, J::Here, hi));
            block.push(p(AND_K, J::Here, J::Here, mhi));
            block.push(p(JEQ_K, J::Here, J::End, whi));
            block.push(p(LD_ABS, J::Here, J::Here, lo));
            block.push(p(AND_K, J::Here, J::Here, mlo));
            block.push(p(JEQ_K, J::Here, J::End, wlo));
        }
    }
}

fn resolve_block(block: Vec<PendingInsn>) -> Vec<SockFilter> {
    let len = block.len();
    block
        .into_iter()
        .enumerate()
        .map(|(idx, insn)| {
            let resolve = |j: J| -> u8 {
                match j {
                    J::Here => 0,
                    J::Fwd(n) => n,
                    // Distance to the first instruction after the block;
                    // bounded by the six-condition limit, so it fits u8.
                    J::End => (len - idx - 1) as u8,
                }
            };
            SockFilter {
                code: insn.code,
                jt: resolve(insn.jt),
                jf: resolve(insn.jf),
                k: insn.k,
            }
        })
        .collect()
}

/// Serialize the IR into the final program.
///
/// Layout: an architecture prologue (kill on an unlisted arch, default
/// action on a listed non-native arch, since rule numbers resolve natively
/// only), then one self-contained block per rule, then the default action.
#[must_use]
pub fn serialize(ir: &FilterIr) -> Vec<SockFilter> {
    let native_token = Arch::native().audit_token();
    let has_foreign = ir.arches.iter().any(|&t| t != native_token);

    let mut prog: Vec<SockFilter> = Vec::new();

    // Prologue: load the arch, dispatch per admitted token.
    prog.push(SockFilter {
        code: LD_ABS,
        jt: 0,
        jf: 0,
        k: DATA_ARCH,
    });
    let n = ir.arches.len();
    for (i, &token) in ir.arches.iter().enumerate() {
        // Remaining checks between this one and the kill; then the
        // optional foreign-default return sits just past the kill.
        let checks_after = (n - i - 1) as u8;
        let jt = if token == native_token {
            // Skip the rest of the prologue to the rule body.
            checks_after + 1 + u8::from(has_foreign)
        } else {
            // Land on the foreign-default return.
            checks_after + 1
        };
        prog.push(SockFilter {
            code: JEQ_K,
            jt,
            jf: 0,
            k: token,
        });
    }
    prog.push(SockFilter {
        code: RET_K,
        jt: 0,
        jf: 0,
        k: RET_KILL_THREAD,
    });
    if has_foreign {
        prog.push(SockFilter {
            code: RET_K,
            jt: 0,
            jf: 0,
            k: ir.default_ret,
        });
    }

    // One block per rule. Each block reloads the syscall number, so blocks
    // stay independent of whatever a previous block left in the
    // accumulator.
    for rule in &ir.rules {
        let mut block: Vec<PendingInsn> = Vec::new();
        block.push(p(LD_ABS, J::Here, J::Here, DATA_NR));
        block.push(p(JEQ_K, J::Here, J::End, rule.nr as u32));
        for cond in &rule.conds {
            emit_cond(&mut block, cond);
        }
        block.push(p(RET_K, J::Here, J::Here, rule.ret));
        prog.extend(resolve_block(block));
    }

    prog.push(SockFilter {
        code: RET_K,
        jt: 0,
        jf: 0,
        k: ir.default_ret,
    });

    prog
}

/// Encode a program as the byte image, for fingerprinting and tests.
#[must_use]
pub fn encode(program: &[SockFilter]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(program.len() * 8);
    for insn in program {
        bytes.extend_from_slice(&insn.encode());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seccomp::SyscallRule;

    fn policy(rules: Vec<SyscallRule>) -> SeccompPolicy {
        SeccompPolicy {
            default_action: Action::Allow,
            default_errno_ret: None,
            architectures: vec![],
            flags: vec![],
            syscalls: rules,
        }
    }

    fn rule(name: &str, action: Action, args: Vec<ArgCmp>) -> SyscallRule {
        SyscallRule {
            name: name.to_string(),
            action,
            errno_ret: None,
            args,
        }
    }

    fn cmp(index: u32, op: CmpOp, value: u64) -> ArgCmp {
        ArgCmp {
            index,
            op,
            value,
            value2: 0,
        }
    }

    #[test]
    fn compilation_is_deterministic() {
        let p = policy(vec![
            rule("getpid", Action::Errno, vec![]),
            rule(
                "openat",
                Action::Errno,
                vec![cmp(1, CmpOp::Eq, 0), cmp(2, CmpOp::MaskedEq, 0o700)],
            ),
        ]);
        let a = encode(&serialize(&compile(&p).unwrap()));
        let b = encode(&serialize(&compile(&p).unwrap()));
        assert_eq!(a, b);
    }

    #[test]
    fn default_action_rules_are_dropped() {
        let p = policy(vec![
            rule("getpid", Action::Allow, vec![]),
            rule("kill", Action::Errno, vec![]),
        ]);
        let ir = compile(&p).unwrap();
        assert_eq!(ir.rules.len(), 1);
        assert_eq!(ir.rules[0].nr, libc::SYS_kill);
    }

    #[test]
    fn unknown_syscalls_are_dropped_not_errors() {
        let p = policy(vec![
            rule("frobnicate", Action::Errno, vec![]),
            rule("getpid", Action::Errno, vec![]),
        ]);
        let ir = compile(&p).unwrap();
        assert_eq!(ir.rules.len(), 1);
    }

    #[test]
    fn same_index_conditions_split_into_or_rules() {
        let p = policy(vec![rule(
            "dup3",
            Action::Errno,
            vec![cmp(0, CmpOp::Eq, 1), cmp(0, CmpOp::Eq, 2)],
        )]);
        let ir = compile(&p).unwrap();
        assert_eq!(ir.rules.len(), 2);
        assert_eq!(ir.rules[0].conds.len(), 1);
        assert_eq!(ir.rules[1].conds.len(), 1);
    }

    #[test]
    fn distinct_index_conditions_stay_on_one_rule() {
        let p = policy(vec![rule(
            "dup3",
            Action::Errno,
            vec![cmp(0, CmpOp::Eq, 1), cmp(1, CmpOp::Ge, 2), cmp(2, CmpOp::Ne, 0)],
        )]);
        let ir = compile(&p).unwrap();
        assert_eq!(ir.rules.len(), 1);
        assert_eq!(ir.rules[0].conds.len(), 3);
    }

    #[test]
    fn mixed_index_conditions_split_per_condition() {
        let p = policy(vec![rule(
            "dup3",
            Action::Errno,
            vec![
                cmp(0, CmpOp::Eq, 1),
                cmp(0, CmpOp::Eq, 2),
                cmp(1, CmpOp::Eq, 3),
            ],
        )]);
        let ir = compile(&p).unwrap();
        // Any shared index reverts the whole call to one rule per condition.
        assert_eq!(ir.rules.len(), 3);
    }

    #[test]
    fn errno_return_value_embeds_errno() {
        let p = policy(vec![SyscallRule {
            name: "getpid".to_string(),
            action: Action::Errno,
            errno_ret: Some(38), // ENOSYS
            args: vec![],
        }]);
        let ir = compile(&p).unwrap();
        assert_eq!(ir.rules[0].ret, RET_ERRNO | 38);
    }

    #[test]
    fn notify_rules_request_a_listener() {
        let p = policy(vec![rule("getpid", Action::Notify, vec![])]);
        let ir = compile(&p).unwrap();
        assert!(ir.flags.new_listener);
        assert_eq!(ir.rules[0].ret, RET_NOTIFY);
    }

    #[test]
    fn native_arch_is_always_admitted() {
        let p = policy(vec![]);
        let ir = compile(&p).unwrap();
        assert_eq!(ir.arches, vec![Arch::native().audit_token()]);
    }

    #[test]
    fn arches_keep_policy_order() {
        let mut p = policy(vec![]);
        p.architectures = vec![Arch::native(), Arch::X86];
        let ir = compile(&p).unwrap();
        assert_eq!(
            ir.arches,
            vec![Arch::native().audit_token(), Arch::X86.audit_token()]
        );
    }

    #[test]
    fn empty_filter_is_arch_check_plus_default() {
        let ir = compile(&policy(vec![])).unwrap();
        let prog = serialize(&ir);
        // ld arch; jeq native; ret kill; ret default
        assert_eq!(prog.len(), 4);
        assert_eq!(prog[0].code, LD_ABS);
        assert_eq!(prog[3].k, RET_ALLOW);
    }

    #[test]
    fn foreign_arch_branch_returns_default() {
        let mut p = policy(vec![rule("getpid", Action::Errno, vec![])]);
        p.architectures = vec![Arch::X86];
        let ir = compile(&p).unwrap();
        let prog = serialize(&ir);
        // ld arch; jeq native -> rules; jeq x86 -> foreign default;
        // ret kill; ret default; then the rule body.
        assert_eq!(prog[1].k, Arch::native().audit_token());
        assert_eq!(prog[1].jt, 3);
        assert_eq!(prog[2].k, Arch::X86.audit_token());
        assert_eq!(prog[2].jt, 1);
        assert_eq!(prog[3].k, RET_KILL_THREAD);
        assert_eq!(prog[4].k, RET_ALLOW);
        // Rule body starts with a reload of the syscall number.
        assert_eq!(prog[5].code, LD_ABS);
        assert_eq!(prog[5].k, DATA_NR);
    }

    #[test]
    fn boundary_rule_counts_compile() {
        for count in [0usize, 32, 33] {
            let rules: Vec<SyscallRule> = (0..count)
                .map(|i| {
                    rule(
                        "getpid",
                        Action::Errno,
                        vec![cmp(0, CmpOp::Eq, i as u64)],
                    )
                })
                .collect();
            let ir = compile(&policy(rules)).unwrap();
            assert_eq!(ir.rules.len(), count);
            let prog = serialize(&ir);
            assert!(!prog.is_empty());
            // Every conditional jump must stay inside the program.
            for (idx, insn) in prog.iter().enumerate() {
                let reach = idx + 1 + usize::from(insn.jt.max(insn.jf));
                assert!(reach < prog.len() || insn.code == RET_K);
            }
        }
    }

    #[test]
    fn condition_blocks_fit_eight_bit_jumps() {
        // Worst case: six masked compares on distinct indices.
        let args: Vec<ArgCmp> = (0..6)
            .map(|i| ArgCmp {
                index: i,
                op: CmpOp::MaskedEq,
                value: u64::MAX,
                value2: u64::MAX,
            })
            .collect();
        let ir = compile(&policy(vec![rule("openat", Action::Errno, args)])).unwrap();
        let prog = serialize(&ir);
        for insn in &prog {
            assert!(insn.jt as usize + insn.jf as usize <= prog.len());
        }
    }
}
