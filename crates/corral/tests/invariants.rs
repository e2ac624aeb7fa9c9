//! Cross-module invariants that hold without touching the kernel.

use std::collections::HashMap;
use std::path::PathBuf;

use corral::config::{CapabilitySpec, CgroupSpec, Config, ProcessSpec};
use corral::container::Container;
use corral::seccomp::{
    compiler, Action, ArgCmp, CmpOp, SeccompPolicy, SyscallRule,
};
use corral::state::StateStore;
use corral_common::{ContainerId, Error, RuntimePaths};

fn base_config(id: &str) -> Config {
    Config {
        id: ContainerId::new(id).unwrap(),
        namespaces: vec![],
        rootfs: PathBuf::from("/tmp/rootfs"),
        mounts: vec![],
        capabilities: CapabilitySpec::default(),
        rlimits: vec![],
        cgroup: CgroupSpec::default(),
        seccomp: None,
        apparmor_profile: None,
        selinux_label: None,
        uid_mappings: vec![],
        gid_mappings: vec![],
        rootless: false,
        hostname: None,
        domainname: None,
        oom_score_adj: None,
        no_new_privileges: false,
        process: ProcessSpec {
            args: vec!["/bin/true".to_string()],
            env: vec!["PATH=/bin".to_string()],
            cwd: PathBuf::from("/"),
            terminal: false,
            uid: 0,
            gid: 0,
            additional_gids: vec![],
        },
        seccomp_agent: None,
        uidmap_helper: None,
        gidmap_helper: None,
        deadline_ms: None,
        annotations: HashMap::new(),
    }
}

fn notify_policy(syscall: &str) -> SeccompPolicy {
    SeccompPolicy {
        default_action: Action::Allow,
        default_errno_ret: None,
        architectures: vec![],
        flags: vec![],
        syscalls: vec![SyscallRule {
            name: syscall.to_string(),
            action: Action::Notify,
            errno_ret: None,
            args: vec![],
        }],
    }
}

/// A policy with notify-on-write never reaches the spawn path: Create
/// rejects it before any process exists.
#[test]
fn write_notify_fails_create_before_any_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(RuntimePaths::rooted_at(dir.path()));

    let mut config = base_config("write-notify");
    config.seccomp = Some(notify_policy("write"));

    let err = Container::create(config, store.clone()).unwrap_err();
    assert!(matches!(err, Error::ConfigInvalid { .. }));
    // Nothing was created for the attempt.
    assert!(!store.exists("write-notify"));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

/// Compiling the same policy twice yields byte-identical BPF programs.
#[test]
fn seccomp_compilation_is_reproducible() {
    let policy = SeccompPolicy {
        default_action: Action::Errno,
        default_errno_ret: Some(1),
        architectures: vec![],
        flags: vec!["log".to_string()],
        syscalls: vec![
            SyscallRule {
                name: "getpid".to_string(),
                action: Action::Allow,
                errno_ret: None,
                args: vec![],
            },
            SyscallRule {
                name: "openat".to_string(),
                action: Action::Allow,
                errno_ret: None,
                args: vec![
                    ArgCmp {
                        index: 2,
                        op: CmpOp::MaskedEq,
                        value: 0o3,
                        value2: 0,
                    },
                    ArgCmp {
                        index: 3,
                        op: CmpOp::Le,
                        value: 0o777,
                        value2: 0,
                    },
                ],
            },
        ],
    };

    let first = compiler::encode(&compiler::serialize(&compiler::compile(&policy).unwrap()));
    let second = compiler::encode(&compiler::serialize(&compiler::compile(&policy).unwrap()));
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

/// The full config, resources and seccomp included, survives the blob
/// framing unchanged.
#[test]
fn config_blob_round_trips_full_payload() {
    let mut config = base_config("blob-full");
    config.seccomp = Some(notify_policy("getpid"));
    config.cgroup.resources.pids = Some(corral::cgroup::PidsResources { max: Some(10) });
    config.cgroup.resources.unified =
        [("memory.high".to_string(), "1073741824".to_string())].into();

    let blob = config.to_blob().unwrap();
    let decoded = Config::from_blob(&blob).unwrap();
    assert_eq!(decoded.id, config.id);
    assert_eq!(
        decoded.cgroup.resources.pids,
        config.cgroup.resources.pids
    );
    assert_eq!(decoded.cgroup.resources.unified, config.cgroup.resources.unified);
    assert!(decoded.seccomp.is_some());

    // And the framing itself is deterministic.
    assert_eq!(blob, decoded.to_blob().unwrap());
}
