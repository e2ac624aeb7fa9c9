//! Wire formats for the sync channel and the bootstrap blob.
//!
//! Everything here is a pure codec: one byte of tag, a u32 length prefix,
//! and a payload. Unknown tags, duplicate bootstrap records, and truncated
//! payloads are protocol violations, never silently skipped.

use std::path::PathBuf;

use corral_common::{Error, Result};

use crate::namespace::{IdMapping, NamespaceKind};

/// Messages exchanged on the sync channel.
///
/// `Ready`, `Proceed`, `PreStartReady`, `Start`, and `Abort` are the
/// ordered protocol tags; `Err` and `Fd` are out-of-band. The `Idmap*` and
/// `InitPid` messages belong to the bootstrap phase, before `Ready` opens
/// the tag grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMsg {
    /// The child sits inside the target namespaces.
    Ready,
    /// The parent finished cgroup setup and wrote the config blob.
    Proceed,
    /// The child finished privileged setup and awaits the start gate.
    PreStartReady,
    /// Run the final exec.
    Start,
    /// Tear down instead of proceeding.
    Abort,
    /// A stage failed; stage name and message preserved verbatim.
    Err {
        /// The failing stage.
        stage: String,
        /// The original error text.
        message: String,
    },
    /// A file descriptor follows as ancillary data.
    Fd,
    /// Bootstrap: the shim asks the parent to write its id maps.
    IdmapRequest,
    /// Bootstrap: the parent wrote the id maps.
    IdmapDone,
    /// Bootstrap: the shim reports the pid that becomes the container init.
    InitPid(u32),
}

impl SyncMsg {
    const TAG_READY: u8 = 1;
    const TAG_PROCEED: u8 = 2;
    const TAG_PRE_START_READY: u8 = 3;
    const TAG_START: u8 = 4;
    const TAG_ABORT: u8 = 5;
    const TAG_ERR: u8 = 6;
    const TAG_FD: u8 = 7;
    const TAG_IDMAP_REQUEST: u8 = 0x20;
    const TAG_IDMAP_DONE: u8 = 0x21;
    const TAG_INIT_PID: u8 = 0x22;

    /// The start-gate byte written to the fifo.
    pub const START_BYTE: u8 = Self::TAG_START;

    /// Encode as tag + u32 length + payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload): (u8, Vec<u8>) = match self {
            Self::Ready => (Self::TAG_READY, Vec::new()),
            Self::Proceed => (Self::TAG_PROCEED, Vec::new()),
            Self::PreStartReady => (Self::TAG_PRE_START_READY, Vec::new()),
            Self::Start => (Self::TAG_START, Vec::new()),
            Self::Abort => (Self::TAG_ABORT, Vec::new()),
            Self::Err { stage, message } => {
                let mut p = Vec::new();
                put_bytes(&mut p, stage.as_bytes());
                put_bytes(&mut p, message.as_bytes());
                (Self::TAG_ERR, p)
            }
            Self::Fd => (Self::TAG_FD, Vec::new()),
            Self::IdmapRequest => (Self::TAG_IDMAP_REQUEST, Vec::new()),
            Self::IdmapDone => (Self::TAG_IDMAP_DONE, Vec::new()),
            Self::InitPid(pid) => (Self::TAG_INIT_PID, pid.to_le_bytes().to_vec()),
        };

        let mut out = Vec::with_capacity(5 + payload.len());
        out.push(tag);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decode from a tag byte and its payload.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        let msg = match tag {
            Self::TAG_READY => Self::Ready,
            Self::TAG_PROCEED => Self::Proceed,
            Self::TAG_PRE_START_READY => Self::PreStartReady,
            Self::TAG_START => Self::Start,
            Self::TAG_ABORT => Self::Abort,
            Self::TAG_ERR => {
                let mut cursor = payload;
                let stage = take_string(&mut cursor)?;
                let message = take_string(&mut cursor)?;
                Self::Err { stage, message }
            }
            Self::TAG_FD => Self::Fd,
            Self::TAG_IDMAP_REQUEST => Self::IdmapRequest,
            Self::TAG_IDMAP_DONE => Self::IdmapDone,
            Self::TAG_INIT_PID => {
                let bytes: [u8; 4] = payload.try_into().map_err(|_| truncated("init-pid"))?;
                Self::InitPid(u32::from_le_bytes(bytes))
            }
            other => {
                return Err(Error::ProtocolViolation {
                    stage: "sync-channel".to_string(),
                    detail: format!("unknown tag 0x{other:02x}"),
                })
            }
        };
        Ok(msg)
    }
}

fn truncated(what: &str) -> Error {
    Error::ProtocolViolation {
        stage: "sync-channel".to_string(),
        detail: format!("truncated {what} payload"),
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.len() < 4 {
        return Err(truncated("length prefix"));
    }
    let (len_bytes, rest) = cursor.split_at(4);
    let len = u32::from_le_bytes(len_bytes.try_into().expect("four bytes")) as usize;
    if rest.len() < len {
        return Err(truncated("bytes"));
    }
    let (bytes, rest) = rest.split_at(len);
    *cursor = rest;
    Ok(bytes.to_vec())
}

fn take_string(cursor: &mut &[u8]) -> Result<String> {
    String::from_utf8(take_bytes(cursor)?).map_err(|_| truncated("utf8 string"))
}

/// The grammar the ordered tags must follow:
/// `READY PROCEED PRE-START-READY (START | ABORT)`.
///
/// The parent feeds every ordered tag it sends or receives through one
/// tracker; a tag out of place is a protocol violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Protocol {
    position: u8,
}

impl Protocol {
    /// Observe the next ordered tag.
    pub fn advance(&mut self, msg: &SyncMsg) -> Result<()> {
        let expected_position = match msg {
            SyncMsg::Ready => 0,
            SyncMsg::Proceed => 1,
            SyncMsg::PreStartReady => 2,
            SyncMsg::Start => 3,
            // Abort is legal at any point before Start.
            SyncMsg::Abort if self.position <= 3 => {
                self.position = 4;
                return Ok(());
            }
            other => {
                return Err(Error::ProtocolViolation {
                    stage: "sync-channel".to_string(),
                    detail: format!("{other:?} is not an ordered tag"),
                })
            }
        };

        if self.position != expected_position {
            return Err(Error::ProtocolViolation {
                stage: "sync-channel".to_string(),
                detail: format!(
                    "unexpected tag {msg:?} at protocol position {}",
                    self.position
                ),
            });
        }
        self.position += 1;
        Ok(())
    }
}

// Bootstrap record tags.
const REC_END: u8 = 0;
const REC_CLONEFLAGS: u8 = 0x40;
const REC_SETNS_PATHS: u8 = 0x41;
const REC_UIDMAP: u8 = 0x42;
const REC_GIDMAP: u8 = 0x43;
const REC_OOM_SCORE: u8 = 0x44;
const REC_ROOTLESS: u8 = 0x45;

/// The bootstrap blob sent parent to shim before any sync message: what to
/// clone, what to join, the id maps, the oom score, the rootless flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bootstrap {
    /// Raw clone-flag bits for the namespaces to create (including user
    /// and pid, which the shim handles out of band).
    pub clone_flags: u64,
    /// Namespaces to join by path, already in kernel order.
    pub setns_paths: Vec<(NamespaceKind, PathBuf)>,
    /// Uid mappings for a created user namespace.
    pub uid_maps: Vec<IdMapping>,
    /// Gid mappings for a created user namespace.
    pub gid_maps: Vec<IdMapping>,
    /// oom_score_adj for the init process.
    pub oom_score_adj: Option<i32>,
    /// Whether the invoker is unprivileged.
    pub rootless: bool,
}

fn kind_byte(kind: NamespaceKind) -> u8 {
    match kind {
        NamespaceKind::Mount => 1,
        NamespaceKind::Uts => 2,
        NamespaceKind::Ipc => 3,
        NamespaceKind::User => 4,
        NamespaceKind::Pid => 5,
        NamespaceKind::Network => 6,
        NamespaceKind::Cgroup => 7,
        NamespaceKind::Time => 8,
    }
}

fn byte_kind(byte: u8) -> Result<NamespaceKind> {
    Ok(match byte {
        1 => NamespaceKind::Mount,
        2 => NamespaceKind::Uts,
        3 => NamespaceKind::Ipc,
        4 => NamespaceKind::User,
        5 => NamespaceKind::Pid,
        6 => NamespaceKind::Network,
        7 => NamespaceKind::Cgroup,
        8 => NamespaceKind::Time,
        other => {
            return Err(Error::ProtocolViolation {
                stage: "bootstrap".to_string(),
                detail: format!("unknown namespace kind {other}"),
            })
        }
    })
}

fn put_record(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

fn encode_maps(maps: &[IdMapping]) -> Vec<u8> {
    let mut p = Vec::with_capacity(maps.len() * 12);
    for m in maps {
        p.extend_from_slice(&m.container_id.to_le_bytes());
        p.extend_from_slice(&m.host_id.to_le_bytes());
        p.extend_from_slice(&m.size.to_le_bytes());
    }
    p
}

fn decode_maps(payload: &[u8]) -> Result<Vec<IdMapping>> {
    if payload.len() % 12 != 0 {
        return Err(truncated("id map"));
    }
    Ok(payload
        .chunks_exact(12)
        .map(|c| IdMapping {
            container_id: u32::from_le_bytes(c[0..4].try_into().expect("four bytes")),
            host_id: u32::from_le_bytes(c[4..8].try_into().expect("four bytes")),
            size: u32::from_le_bytes(c[8..12].try_into().expect("four bytes")),
        })
        .collect())
}

impl Bootstrap {
    /// Encode as a sequence of length-prefixed typed records, terminated by
    /// the end record. Records are emitted in a fixed tag order, each at
    /// most once.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        put_record(&mut out, REC_CLONEFLAGS, &self.clone_flags.to_le_bytes());

        if !self.setns_paths.is_empty() {
            let mut p = Vec::new();
            for (kind, path) in &self.setns_paths {
                p.push(kind_byte(*kind));
                put_bytes(&mut p, path.to_string_lossy().as_bytes());
            }
            put_record(&mut out, REC_SETNS_PATHS, &p);
        }

        if !self.uid_maps.is_empty() {
            put_record(&mut out, REC_UIDMAP, &encode_maps(&self.uid_maps));
        }
        if !self.gid_maps.is_empty() {
            put_record(&mut out, REC_GIDMAP, &encode_maps(&self.gid_maps));
        }
        if let Some(score) = self.oom_score_adj {
            put_record(&mut out, REC_OOM_SCORE, &score.to_le_bytes());
        }
        if self.rootless {
            put_record(&mut out, REC_ROOTLESS, &[1]);
        }

        put_record(&mut out, REC_END, &[]);
        out
    }

    /// Decode a record sequence. Duplicate and unknown tags are fatal.
    pub fn decode(mut cursor: &[u8]) -> Result<Self> {
        let mut out = Self::default();
        let mut seen: Vec<u8> = Vec::new();

        loop {
            if cursor.is_empty() {
                return Err(truncated("bootstrap record stream"));
            }
            let tag = cursor[0];
            cursor = &cursor[1..];
            let payload = take_bytes(&mut cursor)?;

            if tag == REC_END {
                return Ok(out);
            }
            if seen.contains(&tag) {
                return Err(Error::ProtocolViolation {
                    stage: "bootstrap".to_string(),
                    detail: format!("duplicate record tag 0x{tag:02x}"),
                });
            }
            seen.push(tag);

            match tag {
                REC_CLONEFLAGS => {
                    let bytes: [u8; 8] =
                        payload.as_slice().try_into().map_err(|_| truncated("cloneflags"))?;
                    out.clone_flags = u64::from_le_bytes(bytes);
                }
                REC_SETNS_PATHS => {
                    let mut p = payload.as_slice();
                    while !p.is_empty() {
                        let kind = byte_kind(p[0])?;
                        p = &p[1..];
                        let path = take_bytes(&mut p)?;
                        out.setns_paths
                            .push((kind, PathBuf::from(String::from_utf8_lossy(&path).as_ref())));
                    }
                }
                REC_UIDMAP => out.uid_maps = decode_maps(&payload)?,
                REC_GIDMAP => out.gid_maps = decode_maps(&payload)?,
                REC_OOM_SCORE => {
                    let bytes: [u8; 4] =
                        payload.as_slice().try_into().map_err(|_| truncated("oom-score"))?;
                    out.oom_score_adj = Some(i32::from_le_bytes(bytes));
                }
                REC_ROOTLESS => out.rootless = payload.first() == Some(&1),
                other => {
                    return Err(Error::ProtocolViolation {
                        stage: "bootstrap".to_string(),
                        detail: format!("unknown record tag 0x{other:02x}"),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_messages_round_trip() {
        let messages = vec![
            SyncMsg::Ready,
            SyncMsg::Proceed,
            SyncMsg::PreStartReady,
            SyncMsg::Start,
            SyncMsg::Abort,
            SyncMsg::Err {
                stage: "child-finalize".to_string(),
                message: "mount failed: ENOENT".to_string(),
            },
            SyncMsg::Fd,
            SyncMsg::IdmapRequest,
            SyncMsg::IdmapDone,
            SyncMsg::InitPid(12345),
        ];
        for msg in messages {
            let bytes = msg.encode();
            let tag = bytes[0];
            let len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
            assert_eq!(bytes.len(), 5 + len);
            assert_eq!(SyncMsg::decode(tag, &bytes[5..]).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_tag_is_fatal() {
        assert!(SyncMsg::decode(0x7f, &[]).is_err());
    }

    #[test]
    fn err_payload_preserves_text_verbatim() {
        let msg = SyncMsg::Err {
            stage: "namespace-create".to_string(),
            message: "setns /run/netns/blue: EPERM (Operation not permitted)".to_string(),
        };
        let bytes = msg.encode();
        let decoded = SyncMsg::decode(bytes[0], &bytes[5..]).unwrap();
        match decoded {
            SyncMsg::Err { stage, message } => {
                assert_eq!(stage, "namespace-create");
                assert!(message.ends_with("(Operation not permitted)"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn protocol_accepts_the_happy_sequence() {
        let mut proto = Protocol::default();
        proto.advance(&SyncMsg::Ready).unwrap();
        proto.advance(&SyncMsg::Proceed).unwrap();
        proto.advance(&SyncMsg::PreStartReady).unwrap();
        proto.advance(&SyncMsg::Start).unwrap();
    }

    #[test]
    fn protocol_accepts_abort_anywhere() {
        let mut proto = Protocol::default();
        proto.advance(&SyncMsg::Ready).unwrap();
        proto.advance(&SyncMsg::Abort).unwrap();
    }

    #[test]
    fn protocol_rejects_out_of_order_tags() {
        let mut proto = Protocol::default();
        let err = proto.advance(&SyncMsg::PreStartReady).unwrap_err();
        assert!(matches!(
            err,
            corral_common::Error::ProtocolViolation { .. }
        ));
    }

    #[test]
    fn bootstrap_round_trips() {
        let blob = Bootstrap {
            clone_flags: 0x2802_0000,
            setns_paths: vec![(NamespaceKind::Network, PathBuf::from("/run/netns/blue"))],
            uid_maps: vec![IdMapping {
                container_id: 0,
                host_id: 100_000,
                size: 65536,
            }],
            gid_maps: vec![],
            oom_score_adj: Some(-500),
            rootless: true,
        };
        let decoded = Bootstrap::decode(&blob.encode()).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn bootstrap_rejects_duplicates_and_unknown_tags() {
        let mut bytes = Vec::new();
        put_record(&mut bytes, REC_ROOTLESS, &[1]);
        put_record(&mut bytes, REC_ROOTLESS, &[1]);
        put_record(&mut bytes, REC_END, &[]);
        assert!(Bootstrap::decode(&bytes).is_err());

        let mut bytes = Vec::new();
        put_record(&mut bytes, 0x7e, &[]);
        put_record(&mut bytes, REC_END, &[]);
        assert!(Bootstrap::decode(&bytes).is_err());
    }

    #[test]
    fn bootstrap_truncation_is_fatal() {
        let blob = Bootstrap::default().encode();
        assert!(Bootstrap::decode(&blob[..blob.len() - 1]).is_err());
    }
}
