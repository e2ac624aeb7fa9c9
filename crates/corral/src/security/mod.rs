//! Process security: capabilities and MAC labels.
//!
//! Everything here acts on the current thread and runs in the child stage,
//! after mounts and before seccomp, in the order `child::finalize` fixes.

mod apparmor;
mod capabilities;
mod selinux;

pub use apparmor::apply_apparmor_profile;
pub use capabilities::apply_capabilities;
pub use selinux::apply_selinux_label;
