//! Syscall name resolution for the native architecture.
//!
//! Numbers come from libc's `SYS_*` constants so they always match the
//! compile target. A name the kernel (or this table) does not know resolves
//! to `None`; the compiler drops such rules with a debug log so policies
//! written for newer kernels keep loading.

/// Resolve a syscall name to its native number.
#[must_use]
pub fn resolve(name: &str) -> Option<i64> {
    common(name).or_else(|| arch_specific(name))
}

#[allow(clippy::too_many_lines)]
fn common(name: &str) -> Option<i64> {
    let nr = match name {
        "read" => libc::SYS_read,
        "write" => libc::SYS_write,
        "close" => libc::SYS_close,
        "fstat" => libc::SYS_fstat,
        "lseek" => libc::SYS_lseek,
        "mmap" => libc::SYS_mmap,
        "mprotect" => libc::SYS_mprotect,
        "munmap" => libc::SYS_munmap,
        "brk" => libc::SYS_brk,
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "rt_sigpending" => libc::SYS_rt_sigpending,
        "rt_sigtimedwait" => libc::SYS_rt_sigtimedwait,
        "rt_sigqueueinfo" => libc::SYS_rt_sigqueueinfo,
        "rt_sigsuspend" => libc::SYS_rt_sigsuspend,
        "rt_tgsigqueueinfo" => libc::SYS_rt_tgsigqueueinfo,
        "sigaltstack" => libc::SYS_sigaltstack,
        "ioctl" => libc::SYS_ioctl,
        "pread64" => libc::SYS_pread64,
        "pwrite64" => libc::SYS_pwrite64,
        "readv" => libc::SYS_readv,
        "writev" => libc::SYS_writev,
        "preadv" => libc::SYS_preadv,
        "pwritev" => libc::SYS_pwritev,
        "preadv2" => libc::SYS_preadv2,
        "pwritev2" => libc::SYS_pwritev2,
        "sched_yield" => libc::SYS_sched_yield,
        "mremap" => libc::SYS_mremap,
        "msync" => libc::SYS_msync,
        "mincore" => libc::SYS_mincore,
        "madvise" => libc::SYS_madvise,
        "shmget" => libc::SYS_shmget,
        "shmat" => libc::SYS_shmat,
        "shmctl" => libc::SYS_shmctl,
        "shmdt" => libc::SYS_shmdt,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "nanosleep" => libc::SYS_nanosleep,
        "getitimer" => libc::SYS_getitimer,
        "setitimer" => libc::SYS_setitimer,
        "getpid" => libc::SYS_getpid,
        "gettid" => libc::SYS_gettid,
        "sendfile" => libc::SYS_sendfile,
        "socket" => libc::SYS_socket,
        "connect" => libc::SYS_connect,
        "accept" => libc::SYS_accept,
        "accept4" => libc::SYS_accept4,
        "sendto" => libc::SYS_sendto,
        "recvfrom" => libc::SYS_recvfrom,
        "sendmsg" => libc::SYS_sendmsg,
        "recvmsg" => libc::SYS_recvmsg,
        "sendmmsg" => libc::SYS_sendmmsg,
        "recvmmsg" => libc::SYS_recvmmsg,
        "shutdown" => libc::SYS_shutdown,
        "bind" => libc::SYS_bind,
        "listen" => libc::SYS_listen,
        "getsockname" => libc::SYS_getsockname,
        "getpeername" => libc::SYS_getpeername,
        "socketpair" => libc::SYS_socketpair,
        "setsockopt" => libc::SYS_setsockopt,
        "getsockopt" => libc::SYS_getsockopt,
        "clone" => libc::SYS_clone,
        "clone3" => libc::SYS_clone3,
        "execve" => libc::SYS_execve,
        "execveat" => libc::SYS_execveat,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "wait4" => libc::SYS_wait4,
        "waitid" => libc::SYS_waitid,
        "kill" => libc::SYS_kill,
        "tkill" => libc::SYS_tkill,
        "tgkill" => libc::SYS_tgkill,
        "uname" => libc::SYS_uname,
        "semget" => libc::SYS_semget,
        "semop" => libc::SYS_semop,
        "semctl" => libc::SYS_semctl,
        "semtimedop" => libc::SYS_semtimedop,
        "msgget" => libc::SYS_msgget,
        "msgsnd" => libc::SYS_msgsnd,
        "msgrcv" => libc::SYS_msgrcv,
        "msgctl" => libc::SYS_msgctl,
        "fcntl" => libc::SYS_fcntl,
        "flock" => libc::SYS_flock,
        "fsync" => libc::SYS_fsync,
        "fdatasync" => libc::SYS_fdatasync,
        "truncate" => libc::SYS_truncate,
        "ftruncate" => libc::SYS_ftruncate,
        "getcwd" => libc::SYS_getcwd,
        "chdir" => libc::SYS_chdir,
        "fchdir" => libc::SYS_fchdir,
        "fchmod" => libc::SYS_fchmod,
        "fchown" => libc::SYS_fchown,
        "umask" => libc::SYS_umask,
        "gettimeofday" => libc::SYS_gettimeofday,
        "getrlimit" => libc::SYS_getrlimit,
        "getrusage" => libc::SYS_getrusage,
        "sysinfo" => libc::SYS_sysinfo,
        "times" => libc::SYS_times,
        "ptrace" => libc::SYS_ptrace,
        "getuid" => libc::SYS_getuid,
        "syslog" => libc::SYS_syslog,
        "getgid" => libc::SYS_getgid,
        "setuid" => libc::SYS_setuid,
        "setgid" => libc::SYS_setgid,
        "geteuid" => libc::SYS_geteuid,
        "getegid" => libc::SYS_getegid,
        "setpgid" => libc::SYS_setpgid,
        "getppid" => libc::SYS_getppid,
        "setsid" => libc::SYS_setsid,
        "setreuid" => libc::SYS_setreuid,
        "setregid" => libc::SYS_setregid,
        "getgroups" => libc::SYS_getgroups,
        "setgroups" => libc::SYS_setgroups,
        "setresuid" => libc::SYS_setresuid,
        "getresuid" => libc::SYS_getresuid,
        "setresgid" => libc::SYS_setresgid,
        "getresgid" => libc::SYS_getresgid,
        "getpgid" => libc::SYS_getpgid,
        "setfsuid" => libc::SYS_setfsuid,
        "setfsgid" => libc::SYS_setfsgid,
        "getsid" => libc::SYS_getsid,
        "capget" => libc::SYS_capget,
        "capset" => libc::SYS_capset,
        "personality" => libc::SYS_personality,
        "statfs" => libc::SYS_statfs,
        "fstatfs" => libc::SYS_fstatfs,
        "getpriority" => libc::SYS_getpriority,
        "setpriority" => libc::SYS_setpriority,
        "sched_setparam" => libc::SYS_sched_setparam,
        "sched_getparam" => libc::SYS_sched_getparam,
        "sched_setscheduler" => libc::SYS_sched_setscheduler,
        "sched_getscheduler" => libc::SYS_sched_getscheduler,
        "sched_get_priority_max" => libc::SYS_sched_get_priority_max,
        "sched_get_priority_min" => libc::SYS_sched_get_priority_min,
        "sched_rr_get_interval" => libc::SYS_sched_rr_get_interval,
        "sched_setaffinity" => libc::SYS_sched_setaffinity,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        "sched_setattr" => libc::SYS_sched_setattr,
        "sched_getattr" => libc::SYS_sched_getattr,
        "mlock" => libc::SYS_mlock,
        "mlock2" => libc::SYS_mlock2,
        "munlock" => libc::SYS_munlock,
        "mlockall" => libc::SYS_mlockall,
        "munlockall" => libc::SYS_munlockall,
        "vhangup" => libc::SYS_vhangup,
        "pivot_root" => libc::SYS_pivot_root,
        "prctl" => libc::SYS_prctl,
        "adjtimex" => libc::SYS_adjtimex,
        "setrlimit" => libc::SYS_setrlimit,
        "chroot" => libc::SYS_chroot,
        "sync" => libc::SYS_sync,
        "syncfs" => libc::SYS_syncfs,
        "acct" => libc::SYS_acct,
        "settimeofday" => libc::SYS_settimeofday,
        "mount" => libc::SYS_mount,
        "umount2" => libc::SYS_umount2,
        "swapon" => libc::SYS_swapon,
        "swapoff" => libc::SYS_swapoff,
        "reboot" => libc::SYS_reboot,
        "sethostname" => libc::SYS_sethostname,
        "setdomainname" => libc::SYS_setdomainname,
        "init_module" => libc::SYS_init_module,
        "finit_module" => libc::SYS_finit_module,
        "delete_module" => libc::SYS_delete_module,
        "quotactl" => libc::SYS_quotactl,
        "readahead" => libc::SYS_readahead,
        "setxattr" => libc::SYS_setxattr,
        "lsetxattr" => libc::SYS_lsetxattr,
        "fsetxattr" => libc::SYS_fsetxattr,
        "getxattr" => libc::SYS_getxattr,
        "lgetxattr" => libc::SYS_lgetxattr,
        "fgetxattr" => libc::SYS_fgetxattr,
        "listxattr" => libc::SYS_listxattr,
        "llistxattr" => libc::SYS_llistxattr,
        "flistxattr" => libc::SYS_flistxattr,
        "removexattr" => libc::SYS_removexattr,
        "lremovexattr" => libc::SYS_lremovexattr,
        "fremovexattr" => libc::SYS_fremovexattr,
        "futex" => libc::SYS_futex,
        "io_setup" => libc::SYS_io_setup,
        "io_destroy" => libc::SYS_io_destroy,
        "io_getevents" => libc::SYS_io_getevents,
        "io_submit" => libc::SYS_io_submit,
        "io_cancel" => libc::SYS_io_cancel,
        "io_uring_setup" => libc::SYS_io_uring_setup,
        "io_uring_enter" => libc::SYS_io_uring_enter,
        "io_uring_register" => libc::SYS_io_uring_register,
        "lookup_dcookie" => libc::SYS_lookup_dcookie,
        "remap_file_pages" => libc::SYS_remap_file_pages,
        "getdents64" => libc::SYS_getdents64,
        "set_tid_address" => libc::SYS_set_tid_address,
        "restart_syscall" => libc::SYS_restart_syscall,
        "fadvise64" => libc::SYS_fadvise64,
        "timer_create" => libc::SYS_timer_create,
        "timer_settime" => libc::SYS_timer_settime,
        "timer_gettime" => libc::SYS_timer_gettime,
        "timer_getoverrun" => libc::SYS_timer_getoverrun,
        "timer_delete" => libc::SYS_timer_delete,
        "clock_settime" => libc::SYS_clock_settime,
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_getres" => libc::SYS_clock_getres,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "clock_adjtime" => libc::SYS_clock_adjtime,
        "epoll_ctl" => libc::SYS_epoll_ctl,
        "epoll_pwait" => libc::SYS_epoll_pwait,
        "epoll_pwait2" => libc::SYS_epoll_pwait2,
        "epoll_create1" => libc::SYS_epoll_create1,
        "utimensat" => libc::SYS_utimensat,
        "mbind" => libc::SYS_mbind,
        "set_mempolicy" => libc::SYS_set_mempolicy,
        "get_mempolicy" => libc::SYS_get_mempolicy,
        "migrate_pages" => libc::SYS_migrate_pages,
        "move_pages" => libc::SYS_move_pages,
        "openat" => libc::SYS_openat,
        "openat2" => libc::SYS_openat2,
        "mkdirat" => libc::SYS_mkdirat,
        "mknodat" => libc::SYS_mknodat,
        "fchownat" => libc::SYS_fchownat,
        "newfstatat" => libc::SYS_newfstatat,
        "unlinkat" => libc::SYS_unlinkat,
        "renameat" => libc::SYS_renameat,
        "renameat2" => libc::SYS_renameat2,
        "linkat" => libc::SYS_linkat,
        "symlinkat" => libc::SYS_symlinkat,
        "readlinkat" => libc::SYS_readlinkat,
        "fchmodat" => libc::SYS_fchmodat,
        "faccessat" => libc::SYS_faccessat,
        "faccessat2" => libc::SYS_faccessat2,
        "pselect6" => libc::SYS_pselect6,
        "ppoll" => libc::SYS_ppoll,
        "unshare" => libc::SYS_unshare,
        "setns" => libc::SYS_setns,
        "set_robust_list" => libc::SYS_set_robust_list,
        "get_robust_list" => libc::SYS_get_robust_list,
        "splice" => libc::SYS_splice,
        "tee" => libc::SYS_tee,
        "sync_file_range" => libc::SYS_sync_file_range,
        "vmsplice" => libc::SYS_vmsplice,
        "timerfd_create" => libc::SYS_timerfd_create,
        "timerfd_settime" => libc::SYS_timerfd_settime,
        "timerfd_gettime" => libc::SYS_timerfd_gettime,
        "fallocate" => libc::SYS_fallocate,
        "signalfd4" => libc::SYS_signalfd4,
        "eventfd2" => libc::SYS_eventfd2,
        "pipe2" => libc::SYS_pipe2,
        "inotify_init1" => libc::SYS_inotify_init1,
        "inotify_add_watch" => libc::SYS_inotify_add_watch,
        "inotify_rm_watch" => libc::SYS_inotify_rm_watch,
        "perf_event_open" => libc::SYS_perf_event_open,
        "fanotify_init" => libc::SYS_fanotify_init,
        "fanotify_mark" => libc::SYS_fanotify_mark,
        "prlimit64" => libc::SYS_prlimit64,
        "name_to_handle_at" => libc::SYS_name_to_handle_at,
        "open_by_handle_at" => libc::SYS_open_by_handle_at,
        "getcpu" => libc::SYS_getcpu,
        "process_vm_readv" => libc::SYS_process_vm_readv,
        "process_vm_writev" => libc::SYS_process_vm_writev,
        "kcmp" => libc::SYS_kcmp,
        "seccomp" => libc::SYS_seccomp,
        "getrandom" => libc::SYS_getrandom,
        "memfd_create" => libc::SYS_memfd_create,
        "bpf" => libc::SYS_bpf,
        "userfaultfd" => libc::SYS_userfaultfd,
        "membarrier" => libc::SYS_membarrier,
        "copy_file_range" => libc::SYS_copy_file_range,
        "statx" => libc::SYS_statx,
        "rseq" => libc::SYS_rseq,
        "pidfd_send_signal" => libc::SYS_pidfd_send_signal,
        "pidfd_open" => libc::SYS_pidfd_open,
        "pidfd_getfd" => libc::SYS_pidfd_getfd,
        "open_tree" => libc::SYS_open_tree,
        "move_mount" => libc::SYS_move_mount,
        "fsopen" => libc::SYS_fsopen,
        "fsconfig" => libc::SYS_fsconfig,
        "fsmount" => libc::SYS_fsmount,
        "fspick" => libc::SYS_fspick,
        "close_range" => libc::SYS_close_range,
        "process_madvise" => libc::SYS_process_madvise,
        "mount_setattr" => libc::SYS_mount_setattr,
        "landlock_create_ruleset" => libc::SYS_landlock_create_ruleset,
        "landlock_add_rule" => libc::SYS_landlock_add_rule,
        "landlock_restrict_self" => libc::SYS_landlock_restrict_self,
        "process_mrelease" => libc::SYS_process_mrelease,
        "futex_waitv" => libc::SYS_futex_waitv,
        "kexec_load" => libc::SYS_kexec_load,
        "keyctl" => libc::SYS_keyctl,
        "add_key" => libc::SYS_add_key,
        "request_key" => libc::SYS_request_key,
        "ioprio_set" => libc::SYS_ioprio_set,
        "ioprio_get" => libc::SYS_ioprio_get,
        _ => return None,
    };
    Some(nr)
}

#[cfg(target_arch = "x86_64")]
fn arch_specific(name: &str) -> Option<i64> {
    let nr = match name {
        "open" => libc::SYS_open,
        "stat" => libc::SYS_stat,
        "lstat" => libc::SYS_lstat,
        "poll" => libc::SYS_poll,
        "access" => libc::SYS_access,
        "pipe" => libc::SYS_pipe,
        "select" => libc::SYS_select,
        "dup2" => libc::SYS_dup2,
        "pause" => libc::SYS_pause,
        "alarm" => libc::SYS_alarm,
        "fork" => libc::SYS_fork,
        "vfork" => libc::SYS_vfork,
        "getdents" => libc::SYS_getdents,
        "rename" => libc::SYS_rename,
        "mkdir" => libc::SYS_mkdir,
        "rmdir" => libc::SYS_rmdir,
        "creat" => libc::SYS_creat,
        "link" => libc::SYS_link,
        "unlink" => libc::SYS_unlink,
        "symlink" => libc::SYS_symlink,
        "readlink" => libc::SYS_readlink,
        "chmod" => libc::SYS_chmod,
        "chown" => libc::SYS_chown,
        "lchown" => libc::SYS_lchown,
        "getpgrp" => libc::SYS_getpgrp,
        "utime" => libc::SYS_utime,
        "utimes" => libc::SYS_utimes,
        "futimesat" => libc::SYS_futimesat,
        "mknod" => libc::SYS_mknod,
        "uselib" => libc::SYS_uselib,
        "ustat" => libc::SYS_ustat,
        "sysfs" => libc::SYS_sysfs,
        "modify_ldt" => libc::SYS_modify_ldt,
        "arch_prctl" => libc::SYS_arch_prctl,
        "iopl" => libc::SYS_iopl,
        "ioperm" => libc::SYS_ioperm,
        "set_thread_area" => libc::SYS_set_thread_area,
        "get_thread_area" => libc::SYS_get_thread_area,
        "epoll_create" => libc::SYS_epoll_create,
        "epoll_wait" => libc::SYS_epoll_wait,
        "inotify_init" => libc::SYS_inotify_init,
        "signalfd" => libc::SYS_signalfd,
        "eventfd" => libc::SYS_eventfd,
        "time" => libc::SYS_time,
        _ => return None,
    };
    Some(nr)
}

#[cfg(not(target_arch = "x86_64"))]
fn arch_specific(_name: &str) -> Option<i64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_core_syscalls() {
        assert_eq!(resolve("read"), Some(libc::SYS_read));
        assert_eq!(resolve("write"), Some(libc::SYS_write));
        assert_eq!(resolve("getpid"), Some(libc::SYS_getpid));
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        assert_eq!(resolve("not_a_syscall"), None);
        assert_eq!(resolve(""), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn resolves_legacy_syscalls_on_x86_64() {
        assert_eq!(resolve("open"), Some(libc::SYS_open));
        assert_eq!(resolve("fork"), Some(libc::SYS_fork));
    }
}
