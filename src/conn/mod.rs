//! Checkpointable connections.
//!
//! A [`Connection`] is one kernel resource reachable through one or more
//! descriptors. The generic part (identifier, descriptor flags) lives here;
//! everything kind-specific sits in the [`Payload`] variant and is reached by
//! dispatch. Connections never drive themselves: the table calls each phase.

pub mod fcntl;
pub mod file;
pub mod handshake;
pub mod pts;
pub mod stdio;
pub mod tcp;

use std::fmt;
use std::os::unix::io::RawFd;

use prost::Message;

pub use fcntl::DescriptorFlags;
pub use file::{FileConnection, FileMeta, FileStatus};
pub use pts::{PtsConnection, PtsSubtype};
pub use stdio::{StdioConnection, StdioStream};
pub use tcp::{PeerRecord, TcpConnection, TcpState};

use crate::drain::KernelBufferDrainer;
use crate::error::{ConnError, Result};
use crate::identity::{ConnectionIdentifier, ProcessIdentity};
use crate::proto::{connection_entry, ConnKindEntry, ConnectionEntry};
use crate::rewire::ConnectionRewirer;

/// Descriptor the kind logic acts on when it needs exactly one.
pub(crate) fn first_fd(fds: &[RawFd]) -> Result<RawFd> {
    fds.first()
        .copied()
        .ok_or_else(|| ConnError::contract("connection operation without descriptors"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnKind {
    Tcp,
    /// Reserved; pipes have no checkpointable payload.
    Pipe,
    Pts,
    File,
    Stdio,
}

impl fmt::Display for ConnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnKind::Tcp => "TCP",
            ConnKind::Pipe => "PIPE",
            ConnKind::Pts => "PTS",
            ConnKind::File => "FILE",
            ConnKind::Stdio => "STDIO",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Tcp(TcpConnection),
    Pts(PtsConnection),
    File(FileConnection),
    Stdio(StdioConnection),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    id: ConnectionIdentifier,
    flags: DescriptorFlags,
    payload: Payload,
}

impl Connection {
    pub fn new(id: ConnectionIdentifier, payload: Payload) -> Self {
        Self {
            id,
            flags: DescriptorFlags::default(),
            payload,
        }
    }

    pub fn id(&self) -> &ConnectionIdentifier {
        &self.id
    }

    pub fn kind(&self) -> ConnKind {
        match self.payload {
            Payload::Tcp(_) => ConnKind::Tcp,
            Payload::Pts(_) => ConnKind::Pts,
            Payload::File(_) => ConnKind::File,
            Payload::Stdio(_) => ConnKind::Stdio,
        }
    }

    pub fn flags(&self) -> &DescriptorFlags {
        &self.flags
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn as_tcp(&self) -> Option<&TcpConnection> {
        match &self.payload {
            Payload::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpConnection> {
        match &mut self.payload {
            Payload::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    /// Snapshots the descriptor flags of the first descriptor.
    pub fn save_options(&mut self, fds: &[RawFd]) -> Result<()> {
        let fd = first_fd(fds)?;
        self.flags = DescriptorFlags::capture(fd)?;
        Ok(())
    }

    pub fn pre_checkpoint(
        &mut self,
        fds: &[RawFd],
        drainer: &mut dyn KernelBufferDrainer,
    ) -> Result<()> {
        log::debug!("{} {}: pre-checkpoint on fds {:?}", self.kind(), self.id, fds);
        match &mut self.payload {
            Payload::Tcp(tcp) => tcp.pre_checkpoint(fds, drainer),
            Payload::Pts(pts) => pts.pre_checkpoint(fds),
            Payload::File(file) => file.pre_checkpoint(fds),
            Payload::Stdio(_) => Ok(()),
        }
    }

    pub fn post_checkpoint(&mut self, fds: &[RawFd]) -> Result<()> {
        match &mut self.payload {
            Payload::Tcp(tcp) => {
                tcp.post_checkpoint(fds);
                Ok(())
            }
            Payload::Pts(pts) => {
                pts.post_checkpoint(fds);
                Ok(())
            }
            Payload::File(file) => file.post_checkpoint(fds),
            Payload::Stdio(_) => Ok(()),
        }
    }

    pub fn do_locking(&mut self, fds: &[RawFd]) -> Result<()> {
        match &mut self.payload {
            Payload::Tcp(tcp) => tcp.do_locking(fds),
            _ => Ok(()),
        }
    }

    /// Whether this process leads checkpointing of the connection. Only
    /// sockets hold an election; everything else is always led locally.
    pub fn check_locking(&self, fds: &[RawFd]) -> Result<bool> {
        match &self.payload {
            Payload::Tcp(tcp) => tcp.check_locking(fds),
            _ => Ok(true),
        }
    }

    pub fn restore(&mut self, fds: &[RawFd], rewirer: &mut dyn ConnectionRewirer) -> Result<()> {
        log::debug!("{} {}: restore on fds {:?}", self.kind(), self.id, fds);
        match &mut self.payload {
            Payload::Tcp(tcp) => tcp.restore(&self.id, fds, rewirer),
            Payload::Pts(pts) => pts.restore(fds),
            Payload::File(file) => file.restore(fds, self.flags.status_flags),
            Payload::Stdio(stdio) => stdio.restore(fds),
        }
    }

    /// Reapplies descriptor flags, then the kind's own options.
    pub fn restore_options(&mut self, fds: &[RawFd]) -> Result<()> {
        let skip_flags = matches!(
            &self.payload,
            Payload::Tcp(tcp) if matches!(tcp.state(), TcpState::Error | TcpState::Invalid)
        ) || matches!(&self.payload, Payload::Pts(pts) if pts.subtype() == PtsSubtype::Invalid);

        if !skip_flags {
            for &fd in fds {
                if let Err(e) = self.flags.apply(fd) {
                    log::warn!("{}: fd {}: cannot restore descriptor flags: {}", self.id, fd, e);
                }
            }
        }

        match &self.payload {
            Payload::Tcp(tcp) => tcp.restore_options(fds),
            Payload::Pts(pts) => pts.restore_options(fds),
            Payload::File(_) | Payload::Stdio(_) => Ok(()),
        }
    }

    pub fn send_handshakes(
        &self,
        fds: &[RawFd],
        me: &ProcessIdentity,
        coordinator: &ProcessIdentity,
    ) -> Result<()> {
        match &self.payload {
            Payload::Tcp(tcp) => tcp.send_handshakes(fds, &self.id, me, coordinator),
            _ => Ok(()),
        }
    }

    pub fn recv_handshakes(&mut self, fds: &[RawFd], coordinator: &ProcessIdentity) -> Result<()> {
        match &mut self.payload {
            Payload::Tcp(tcp) => tcp.recv_handshakes(fds, coordinator),
            _ => Ok(()),
        }
    }

    /// Folds a second discovery of the same connection into this one.
    pub fn merge_with(&mut self, other: &Connection) -> Result<()> {
        if self.id != other.id {
            return Err(ConnError::contract(format!(
                "merging distinct connections {} and {}",
                self.id, other.id
            )));
        }
        let (mine, theirs) = (self.kind(), other.kind());
        match (&mut self.payload, &other.payload) {
            (Payload::Tcp(a), Payload::Tcp(b)) => a.merge_with(b),
            (Payload::Pts(a), Payload::Pts(b)) => a.merge_with(b),
            (Payload::File(a), Payload::File(b)) => a.merge_with(b),
            (Payload::Stdio(a), Payload::Stdio(b)) => a.merge_with(b),
            _ => Err(ConnError::contract(format!(
                "{}: merging {} with {}",
                other.id, mine, theirs
            ))),
        }
    }

    pub fn restart_dup2(&mut self, old_fd: RawFd, new_fd: RawFd) {
        if let Payload::Stdio(stdio) = &mut self.payload {
            stdio.restart_dup2(old_fd, new_fd);
        }
    }

    pub fn to_entry(&self) -> ConnectionEntry {
        let (kind, payload) = match &self.payload {
            Payload::Tcp(tcp) => (
                ConnKindEntry::Tcp,
                connection_entry::Payload::Tcp(tcp.to_entry()),
            ),
            Payload::Pts(pts) => (
                ConnKindEntry::Pts,
                connection_entry::Payload::Pts(pts.to_entry()),
            ),
            Payload::File(file) => (
                ConnKindEntry::File,
                connection_entry::Payload::File(file.to_entry()),
            ),
            Payload::Stdio(stdio) => (
                ConnKindEntry::Stdio,
                connection_entry::Payload::Stdio(stdio.to_entry()),
            ),
        };
        ConnectionEntry {
            id: Some(self.id.to_entry()),
            kind: kind as i32,
            flags: Some(self.flags.to_entry()),
            payload: Some(payload),
        }
    }

    pub fn from_entry(entry: &ConnectionEntry) -> Result<Self> {
        let kind = ConnKindEntry::try_from(entry.kind).map_err(|_| ConnError::InvalidImage {
            reason: format!("unknown connection kind {}", entry.kind),
        })?;
        let id = entry
            .id
            .as_ref()
            .map(ConnectionIdentifier::from_entry)
            .ok_or_else(|| ConnError::InvalidImage {
                reason: "connection without identifier".into(),
            })?;

        let payload = match (kind, &entry.payload) {
            (ConnKindEntry::Pipe, _) => {
                return Err(ConnError::Unsupported(format!("{}: pipe connection", id)));
            }
            (ConnKindEntry::Tcp, Some(connection_entry::Payload::Tcp(tcp))) => {
                Payload::Tcp(TcpConnection::from_entry(tcp))
            }
            (ConnKindEntry::Pts, Some(connection_entry::Payload::Pts(pts))) => {
                Payload::Pts(PtsConnection::from_entry(pts))
            }
            (ConnKindEntry::File, Some(connection_entry::Payload::File(file))) => {
                Payload::File(FileConnection::from_entry(file))
            }
            (ConnKindEntry::Stdio, Some(connection_entry::Payload::Stdio(stdio))) => {
                Payload::Stdio(StdioConnection::from_entry(stdio))
            }
            (kind, _) => {
                return Err(ConnError::InvalidImage {
                    reason: format!("{}: payload does not match kind {:?}", id, kind),
                });
            }
        };

        Ok(Self {
            id,
            flags: entry
                .flags
                .as_ref()
                .map(DescriptorFlags::from_entry)
                .unwrap_or_default(),
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_entry().encode_to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let entry = ConnectionEntry::decode(buf)?;
        Self::from_entry(&entry)
    }
}
