//! End-to-end lifecycle tests.
//!
//! These need root and a v2 cgroup mount; without them the binary prints a
//! skip notice and exits zero. The harness is disabled because the create
//! path re-executes this very binary as the namespace shim: the stage
//! dispatch must run before anything else, exactly as in the production
//! entry point.

use std::collections::HashMap;
use std::path::PathBuf;

use corral::config::{CapabilitySpec, CgroupSpec, Config, ProcessSpec};
use corral::container::Container;
use corral::namespace::{NamespaceKind, NamespaceSpec};
use corral::state::{ContainerStatus, StateStore};
use corral_common::{ContainerId, RuntimePaths};

fn test_config(id: &str, rootfs: &std::path::Path, memory_max: Option<i64>) -> Config {
    let mut resources = corral::cgroup::Resources::default();
    if let Some(limit) = memory_max {
        resources.memory = Some(corral::cgroup::MemoryResources {
            limit: Some(limit),
            ..Default::default()
        });
    }

    Config {
        id: ContainerId::new(id).unwrap(),
        namespaces: vec![
            NamespaceSpec::fresh(NamespaceKind::Pid),
            NamespaceSpec::fresh(NamespaceKind::Mount),
            NamespaceSpec::fresh(NamespaceKind::Uts),
        ],
        rootfs: rootfs.to_path_buf(),
        mounts: vec![],
        capabilities: CapabilitySpec::default(),
        rlimits: vec![],
        cgroup: CgroupSpec {
            path: None,
            resources,
        },
        seccomp: None,
        apparmor_profile: None,
        selinux_label: None,
        uid_mappings: vec![],
        gid_mappings: vec![],
        rootless: false,
        hostname: Some("lifecycle-test".to_string()),
        domainname: None,
        oom_score_adj: None,
        no_new_privileges: false,
        process: ProcessSpec {
            args: vec!["/bin/true".to_string()],
            env: vec![],
            cwd: PathBuf::from("/"),
            terminal: false,
            uid: 0,
            gid: 0,
            additional_gids: vec![],
        },
        seccomp_agent: None,
        uidmap_helper: None,
        gidmap_helper: None,
        deadline_ms: Some(10_000),
        annotations: HashMap::new(),
    }
}

/// Build a rootfs with a static /bin/true equivalent: busybox if present,
/// else bail.
fn build_rootfs(dir: &std::path::Path) -> Option<PathBuf> {
    let rootfs = dir.join("rootfs");
    std::fs::create_dir_all(rootfs.join("bin")).unwrap();
    // A bind-mounted host /bin/true only works if the host binary is
    // static; busybox is the dependable choice.
    let busybox = ["/bin/busybox", "/usr/bin/busybox"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())?;
    std::fs::copy(&busybox, rootfs.join("bin/busybox")).unwrap();
    std::fs::copy(&busybox, rootfs.join("bin/true")).unwrap();
    Some(rootfs)
}

/// Scenario: create, start, observe exit, delete; nothing left behind.
fn happy_path_exec(base: &std::path::Path) {
    let rootfs = match build_rootfs(base) {
        Some(rootfs) => rootfs,
        None => {
            eprintln!("skipping happy_path_exec: no busybox on this host");
            return;
        }
    };

    let store = StateStore::new(RuntimePaths::rooted_at(base.join("state")));
    let config = test_config("happy-path", &rootfs, Some(67_108_864));

    let container = Container::create(config, store.clone()).unwrap();
    let state = container.state().clone();
    let pid = state.pid.expect("init pid recorded");
    assert_eq!(state.status, ContainerStatus::Created);
    assert!(std::path::Path::new(&format!("/proc/{pid}")).exists());
    assert_eq!(
        state.start_time,
        corral::process::pid::read_start_time(nix::unistd::Pid::from_raw(pid)).unwrap()
    );

    let mut container = Container::load("happy-path", store.clone()).unwrap();
    container.start().unwrap();

    // /bin/true exits promptly.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let status = container.refresh_status().unwrap();
        if status == ContainerStatus::Stopped {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "init did not exit in time"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let cgroup_dir = std::path::Path::new("/sys/fs/cgroup/corral/happy-path");
    Container::load("happy-path", store.clone())
        .unwrap()
        .delete(false)
        .unwrap();
    assert!(!store.exists("happy-path"));
    assert!(!cgroup_dir.exists());
}

/// Scenario: a failing setup step leaves no cgroup and no state file.
fn failed_create_leaves_nothing(base: &std::path::Path) {
    let store = StateStore::new(RuntimePaths::rooted_at(base.join("state-fail")));
    // A rootfs that does not exist fails the mount step in the child.
    let config = test_config("doomed-create", std::path::Path::new("/nonexistent/rootfs"), None);

    let err = Container::create(config, store.clone()).unwrap_err();
    eprintln!("create failed as expected: {err}");

    assert!(!store.exists("doomed-create"));
    assert!(!std::path::Path::new("/sys/fs/cgroup/corral/doomed-create").exists());
}

fn main() {
    // The shim re-executes this binary; hand control to the stage before
    // any test machinery runs.
    corral::process::entry::dispatch();

    if !nix::unistd::geteuid().is_root() {
        eprintln!("skipping lifecycle tests: requires root");
        return;
    }
    if !corral::cgroup::is_cgroup2() {
        eprintln!("skipping lifecycle tests: requires a cgroup v2 mount");
        return;
    }

    let base = tempfile::tempdir().unwrap();
    happy_path_exec(base.path());
    failed_create_leaves_nothing(base.path());
    println!("lifecycle tests passed");
}
