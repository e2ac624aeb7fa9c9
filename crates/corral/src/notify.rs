//! Relaying the seccomp notify fd to an external agent.
//!
//! The agent listens on a unix socket named in the configuration; the fd
//! travels as SCM_RIGHTS ancillary data on a single-byte message. After a
//! successful send the local copy is closed by the caller dropping it.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use corral_common::{Error, Result};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

/// Hand the notify fd to the agent at `path`.
pub fn send_to_agent(path: &Path, fd: &OwnedFd) -> Result<()> {
    let stream = UnixStream::connect(path).map_err(|e| Error::Internal {
        message: format!("connecting to seccomp agent {}: {e}", path.display()),
    })?;

    let payload = [0u8; 1];
    let iov = [std::io::IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None).map_err(|e| {
        Error::Internal {
            message: format!("sending notify fd to {}: {e}", path.display()),
        }
    })?;

    tracing::debug!(agent = %path.display(), "Notify fd relayed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    #[test]
    fn agent_receives_the_descriptor_message() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let file = tempfile::tempfile().unwrap();
        let fd: OwnedFd = file.into();
        send_to_agent(&sock_path, &fd).unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).unwrap();
        assert_eq!(byte, [0]);
    }

    #[test]
    fn missing_agent_socket_is_an_error() {
        let fd: OwnedFd = tempfile::tempfile().unwrap().into();
        assert!(send_to_agent(Path::new("/nonexistent/agent.sock"), &fd).is_err());
    }
}
