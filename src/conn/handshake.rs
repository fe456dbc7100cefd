//! In-band identity exchange on a freshly rewired stream socket.
//!
//! Frame: 4-byte magic, 4-byte little-endian body length, protobuf
//! `HandshakeEntry` body. Both ends send first and read second.

use std::os::unix::io::RawFd;

use prost::Message;

use crate::error::{ConnError, Result};
use crate::identity::{ConnectionIdentifier, ProcessIdentity};
use crate::proto::HandshakeEntry;
use crate::sys;

pub const HANDSHAKE_MAGIC: u32 = 0x4b43_4853;
const MAX_BODY_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub coordinator: ProcessIdentity,
    pub sender: ProcessIdentity,
    pub conn_id: ConnectionIdentifier,
}

impl Handshake {
    fn to_entry(&self) -> HandshakeEntry {
        HandshakeEntry {
            coordinator: Some(self.coordinator.to_entry()),
            sender: Some(self.sender.to_entry()),
            conn_id: Some(self.conn_id.to_entry()),
        }
    }

    fn from_entry(entry: &HandshakeEntry) -> Result<Self> {
        let missing = |what: &str| ConnError::Handshake(format!("handshake without {}", what));
        Ok(Self {
            coordinator: entry
                .coordinator
                .as_ref()
                .map(ProcessIdentity::from_entry)
                .ok_or_else(|| missing("coordinator"))?,
            sender: entry
                .sender
                .as_ref()
                .map(ProcessIdentity::from_entry)
                .ok_or_else(|| missing("sender"))?,
            conn_id: entry
                .conn_id
                .as_ref()
                .map(ConnectionIdentifier::from_entry)
                .ok_or_else(|| missing("connection id"))?,
        })
    }
}

pub fn send_handshake(fd: RawFd, hello: &Handshake) -> Result<()> {
    let body = hello.to_entry().encode_to_vec();
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    sys::write_all(fd, &frame)?;
    log::debug!("fd {}: sent handshake for {}", fd, hello.conn_id);
    Ok(())
}

/// Reads the peer's handshake. A null `coordinator` accepts any coordinator.
pub fn recv_handshake(fd: RawFd, coordinator: &ProcessIdentity) -> Result<Handshake> {
    let mut header = [0u8; 8];
    let n = sys::read_all(fd, &mut header)?;
    if n < header.len() {
        return Err(ConnError::Handshake(format!(
            "fd {}: peer sent {} of {} header bytes",
            fd,
            n,
            header.len()
        )));
    }

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != HANDSHAKE_MAGIC {
        return Err(ConnError::Handshake(format!("fd {}: bad magic {:#x}", fd, magic)));
    }

    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_BODY_LEN {
        return Err(ConnError::Handshake(format!("fd {}: oversized body ({} bytes)", fd, len)));
    }

    let mut body = vec![0u8; len];
    if sys::read_all(fd, &mut body)? < len {
        return Err(ConnError::Handshake(format!("fd {}: truncated body", fd)));
    }

    let entry = HandshakeEntry::decode(&body[..])
        .map_err(|e| ConnError::Handshake(format!("fd {}: undecodable body: {}", fd, e)))?;
    let hello = Handshake::from_entry(&entry)?;

    if !coordinator.is_null() && hello.coordinator != *coordinator {
        return Err(ConnError::Handshake(format!(
            "fd {}: peer belongs to coordinator {}, expected {}",
            fd, hello.coordinator, coordinator
        )));
    }

    log::debug!("fd {}: received handshake from {} ({})", fd, hello.sender, hello.conn_id);
    Ok(hello)
}
