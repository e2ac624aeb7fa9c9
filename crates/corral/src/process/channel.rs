//! Channels between the parent and the shim/child stages.
//!
//! The sync channel is a unix socketpair so a file descriptor can ride as
//! ancillary data on an `Fd` message; the init channel is a plain pipe
//! carrying the config blob and then EOF. Channel fds are inherited across
//! the re-exec; their numbers travel in environment variables.

#![allow(unsafe_code)]

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use corral_common::{Error, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use super::message::SyncMsg;

/// One end of the sync channel.
#[derive(Debug)]
pub struct SyncChannel {
    stream: UnixStream,
}

impl SyncChannel {
    /// Create a connected pair; neither end is close-on-exec, so both
    /// survive into the re-executed stages.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| Error::Internal {
            message: format!("socketpair: {e}"),
        })?;
        Ok((Self::from_fd(a), Self::from_fd(b)))
    }

    /// Wrap an inherited fd (the re-executed stage's side).
    #[must_use]
    pub fn from_raw(fd: RawFd) -> Self {
        // Safety: the fd number came from the parent via the environment
        // and is owned exclusively by this stage.
        Self {
            stream: unsafe { UnixStream::from_raw_fd(fd) },
        }
    }

    fn from_fd(fd: OwnedFd) -> Self {
        Self {
            stream: UnixStream::from(fd),
        }
    }

    /// The raw fd, for publishing to the re-executed stage.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Mark this end close-on-exec (the parent keeps its end private).
    pub fn set_cloexec(&self) -> Result<()> {
        set_cloexec(self.stream.as_raw_fd())
    }

    /// Send one message.
    pub fn send(&mut self, msg: &SyncMsg) -> Result<()> {
        self.stream.write_all(&msg.encode())?;
        Ok(())
    }

    /// Send an `Fd` message with the descriptor as ancillary data.
    pub fn send_fd(&mut self, fd: RawFd) -> Result<()> {
        let bytes = SyncMsg::Fd.encode();
        let iov = [std::io::IoSlice::new(&bytes)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None).map_err(
            |e| Error::Internal {
                message: format!("sendmsg(SCM_RIGHTS): {e}"),
            },
        )?;
        Ok(())
    }

    /// Receive one message, plus the descriptor when it is an `Fd`.
    ///
    /// EOF means the peer died without a word; that is a protocol
    /// violation, not a clean shutdown.
    pub fn recv(&mut self) -> Result<(SyncMsg, Option<OwnedFd>)> {
        let mut header = [0u8; 5];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let mut received_fd = None;

        let header_len = header.len();
        {
            let mut iov = [std::io::IoSliceMut::new(&mut header)];
            let res = recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_WAITALL,
            )
            .map_err(|e| Error::Internal {
                message: format!("recvmsg: {e}"),
            })?;

            if res.bytes == 0 {
                return Err(Error::ProtocolViolation {
                    stage: "sync-channel".to_string(),
                    detail: "peer closed the channel mid-protocol".to_string(),
                });
            }
            if res.bytes < header_len {
                return Err(Error::ProtocolViolation {
                    stage: "sync-channel".to_string(),
                    detail: "truncated message header".to_string(),
                });
            }

            for cmsg in res.cmsgs().map_err(|e| Error::Internal {
                message: format!("cmsgs: {e}"),
            })? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    if let Some(&fd) = fds.first() {
                        // Safety: SCM_RIGHTS hands us ownership of a fresh fd.
                        received_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
        }

        let tag = header[0];
        let len = u32::from_le_bytes(header[1..5].try_into().expect("four bytes")) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;

        Ok((SyncMsg::decode(tag, &payload)?, received_fd))
    }

    /// Write a raw byte sequence (the bootstrap blob) ahead of the tagged
    /// protocol.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Read a raw length-prefixed byte sequence.
    pub fn recv_raw(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        self.stream.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

/// Mark a descriptor close-on-exec so it stays out of re-executed stages.
pub fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| Error::Internal {
        message: format!("fcntl(FD_CLOEXEC): {e}"),
    })?;
    Ok(())
}

/// The init channel: parent writes the config blob and closes; the child
/// reads to EOF.
#[derive(Debug)]
pub struct InitPipe;

impl InitPipe {
    /// Create the pipe; returns (read end, write end), neither
    /// close-on-exec.
    pub fn pair() -> Result<(OwnedFd, OwnedFd)> {
        let (read, write) = nix::unistd::pipe().map_err(|e| Error::Internal {
            message: format!("pipe: {e}"),
        })?;
        Ok((read, write))
    }

    /// Write the whole blob and close the write end.
    pub fn deliver(write: OwnedFd, blob: &[u8]) -> Result<()> {
        let mut file = std::fs::File::from(write);
        file.write_all(blob)?;
        // Dropping the file closes the write end; the reader sees EOF.
        Ok(())
    }

    /// Read the whole blob (until EOF) from an inherited fd.
    pub fn collect(fd: RawFd) -> Result<Vec<u8>> {
        // Safety: the fd number came from the environment and belongs to
        // this stage alone.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut blob = Vec::new();
        file.read_to_end(&mut blob)?;
        Ok(blob)
    }
}

/// The start gate: a fifo that outlives the parent on `create`.
#[derive(Debug)]
pub struct StartGate;

impl StartGate {
    /// Create the fifo.
    pub fn create(path: &Path) -> Result<()> {
        mkfifo(path, Mode::from_bits_truncate(0o600)).map_err(|e| Error::Internal {
            message: format!("mkfifo {}: {e}", path.display()),
        })?;
        Ok(())
    }

    /// Open the fifo's directory as an `O_PATH` handle.
    ///
    /// The child grabs this before pivoting: the host path of the fifo is
    /// unreachable from inside the new root, but an `openat` through this
    /// handle still lands on it.
    pub fn open_dir(fifo_path: &Path) -> Result<std::fs::File> {
        use std::os::unix::fs::OpenOptionsExt;

        let dir = fifo_path.parent().ok_or_else(|| Error::Internal {
            message: format!("start fifo {} has no parent", fifo_path.display()),
        })?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
            .open(dir)?;
        Ok(file)
    }

    /// Block until a starter opens the other side and delivers the start
    /// byte. Anything else aborts.
    pub fn wait_at(dir: &std::fs::File, fifo_path: &Path) -> Result<()> {
        let name = fifo_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Internal {
                message: format!("start fifo {} has no file name", fifo_path.display()),
            })?;

        let name_c = std::ffi::CString::new(name).map_err(|_| Error::Internal {
            message: "start fifo name contains a NUL byte".to_string(),
        })?;
        // Safety: valid dirfd and C string. Blocks until the starter opens
        // the write side.
        let fd = unsafe { libc::openat(dir.as_raw_fd(), name_c.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(Error::Internal {
                message: format!(
                    "opening start gate {name}: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        // Safety: openat just handed us this fd.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };

        let mut byte = [0u8; 1];
        file.read_exact(&mut byte)?;
        if byte[0] != SyncMsg::START_BYTE {
            return Err(Error::ProtocolViolation {
                stage: "start-gate".to_string(),
                detail: format!("unexpected start byte 0x{:02x}", byte[0]),
            });
        }
        Ok(())
    }

    /// Release the gate by delivering the start byte.
    ///
    /// The write side opens non-blocking: a fifo with no reader means no
    /// init process is waiting. The child announces readiness slightly
    /// before it reaches the gate, so a missing reader is retried briefly
    /// before it becomes an error rather than a hang.
    pub fn release(path: &Path) -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut file = loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => break file,
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            operation: "waiting for init to reach the start gate".to_string(),
                        });
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        };
        file.write_all(&[SyncMsg::START_BYTE])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;

    use super::*;

    #[test]
    fn sync_channel_carries_messages_in_order() {
        let (mut a, mut b) = SyncChannel::pair().unwrap();
        a.send(&SyncMsg::Ready).unwrap();
        a.send(&SyncMsg::Err {
            stage: "shim".to_string(),
            message: "boom".to_string(),
        })
        .unwrap();

        let (first, fd) = b.recv().unwrap();
        assert_eq!(first, SyncMsg::Ready);
        assert!(fd.is_none());
        let (second, _) = b.recv().unwrap();
        assert!(matches!(second, SyncMsg::Err { .. }));
    }

    #[test]
    fn sync_channel_passes_descriptors() {
        let (mut a, mut b) = SyncChannel::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        a.send_fd(file.as_raw_fd()).unwrap();

        let (msg, fd) = b.recv().unwrap();
        assert_eq!(msg, SyncMsg::Fd);
        let fd = fd.expect("descriptor should arrive with the Fd message");
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn sync_channel_eof_is_a_protocol_violation() {
        let (a, mut b) = SyncChannel::pair().unwrap();
        drop(a);
        let err = b.recv().unwrap_err();
        assert!(matches!(
            err,
            corral_common::Error::ProtocolViolation { .. }
        ));
    }

    #[test]
    fn raw_blob_round_trips() {
        let (mut a, mut b) = SyncChannel::pair().unwrap();
        a.send_raw(b"bootstrap-bytes").unwrap();
        assert_eq!(b.recv_raw().unwrap(), b"bootstrap-bytes");
    }

    #[test]
    fn init_pipe_delivers_blob_then_eof() {
        let (read, write) = InitPipe::pair().unwrap();
        let blob = b"config".to_vec();
        let writer = std::thread::spawn(move || InitPipe::deliver(write, &blob));
        let collected = InitPipe::collect(read.into_raw_fd()).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(collected, b"config");
    }
}
