//! Standard filesystem layout for runtime state.

use std::path::{Path, PathBuf};

/// Default root directory for container state.
const DEFAULT_ROOT: &str = "/run/corral";

/// Per-container filesystem layout under the runtime root.
///
/// ```text
/// <root>/<id>/state.json   persisted container record
/// <root>/<id>/state.lock   exclusive lock serializing transitions
/// <root>/<id>/start.fifo   start gate between create and start
/// ```
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl RuntimePaths {
    /// Layout rooted at the default location.
    #[must_use]
    pub fn system() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
        }
    }

    /// Layout rooted at a caller-chosen directory.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The runtime root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one container's state.
    #[must_use]
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// The container's persisted state record.
    #[must_use]
    pub fn state_file(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("state.json")
    }

    /// The lock file serializing state transitions.
    #[must_use]
    pub fn lock_file(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("state.lock")
    }

    /// The start-gate fifo.
    #[must_use]
    pub fn start_fifo(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("start.fifo")
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        let paths = RuntimePaths::rooted_at("/tmp/corral-test");
        assert_eq!(
            paths.state_file("abc"),
            PathBuf::from("/tmp/corral-test/abc/state.json")
        );
        assert_eq!(
            paths.lock_file("abc"),
            PathBuf::from("/tmp/corral-test/abc/state.lock")
        );
        assert_eq!(
            paths.start_fifo("abc"),
            PathBuf::from("/tmp/corral-test/abc/start.fifo")
        );
    }
}
