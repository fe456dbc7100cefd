//! Standard stream connections.

use std::os::unix::io::RawFd;

use crate::error::{ConnError, Result};
use crate::proto::{StdioEntry, StdioStreamEntry};
use crate::sys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdioStream {
    In,
    Out,
    Err,
    Invalid,
}

impl StdioStream {
    pub fn fd(self) -> Option<RawFd> {
        match self {
            StdioStream::In => Some(libc::STDIN_FILENO),
            StdioStream::Out => Some(libc::STDOUT_FILENO),
            StdioStream::Err => Some(libc::STDERR_FILENO),
            StdioStream::Invalid => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioConnection {
    stream: StdioStream,
}

impl StdioConnection {
    pub fn new(fd: RawFd) -> Result<Self> {
        let stream = match fd {
            libc::STDIN_FILENO => StdioStream::In,
            libc::STDOUT_FILENO => StdioStream::Out,
            libc::STDERR_FILENO => StdioStream::Err,
            _ => {
                return Err(ConnError::contract(format!(
                    "invalid fd {} for a stdio connection",
                    fd
                )))
            }
        };
        log::trace!("Creating stdio connection for fd {}", fd);
        Ok(Self { stream })
    }

    pub fn invalid() -> Self {
        Self {
            stream: StdioStream::Invalid,
        }
    }

    pub fn stream(&self) -> StdioStream {
        self.stream
    }

    /// The standard streams always exist; descriptors that alias one are
    /// pointed back at it.
    pub fn restore(&mut self, fds: &[RawFd]) -> Result<()> {
        let Some(std_fd) = self.stream.fd() else {
            return Ok(());
        };
        for &fd in fds.iter().filter(|&&fd| fd != std_fd) {
            sys::dup2(std_fd, fd)?;
        }
        Ok(())
    }

    /// The stream role does not depend on the descriptor number, so a dup2
    /// leaves it unchanged.
    pub fn restart_dup2(&mut self, old_fd: RawFd, new_fd: RawFd) {
        log::debug!("{:?}: restart dup2 {} -> {}", self.stream, old_fd, new_fd);
    }

    pub fn merge_with(&mut self, other: &StdioConnection) -> Result<()> {
        if self.stream != other.stream {
            return Err(ConnError::contract(format!(
                "merging stdio {:?} with {:?}",
                self.stream, other.stream
            )));
        }
        Ok(())
    }

    pub fn to_entry(&self) -> StdioEntry {
        let stream = match self.stream {
            StdioStream::In => StdioStreamEntry::In,
            StdioStream::Out => StdioStreamEntry::Out,
            StdioStream::Err => StdioStreamEntry::Err,
            StdioStream::Invalid => StdioStreamEntry::Invalid,
        };
        StdioEntry {
            stream: stream as i32,
        }
    }

    pub fn from_entry(entry: &StdioEntry) -> Self {
        let stream = match StdioStreamEntry::try_from(entry.stream) {
            Ok(StdioStreamEntry::In) => StdioStream::In,
            Ok(StdioStreamEntry::Out) => StdioStream::Out,
            Ok(StdioStreamEntry::Err) => StdioStream::Err,
            _ => StdioStream::Invalid,
        };
        Self { stream }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_maps_fds() {
        assert_eq!(StdioConnection::new(0).unwrap().stream(), StdioStream::In);
        assert_eq!(StdioConnection::new(1).unwrap().stream(), StdioStream::Out);
        assert_eq!(StdioConnection::new(2).unwrap().stream(), StdioStream::Err);
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        for fd in [-1, 3, 42] {
            let err = StdioConnection::new(fd).unwrap_err();
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_restart_dup2_keeps_stream() {
        let mut conn = StdioConnection::new(1).unwrap();
        conn.restart_dup2(1, 7);
        assert_eq!(conn.stream(), StdioStream::Out);
    }

    #[test]
    fn test_merge() {
        let mut out = StdioConnection::new(1).unwrap();
        out.merge_with(&StdioConnection::new(1).unwrap()).unwrap();
        assert!(out.merge_with(&StdioConnection::new(2).unwrap()).is_err());
    }

    #[test]
    fn test_entry_round_trip() {
        for conn in [
            StdioConnection::new(0).unwrap(),
            StdioConnection::new(2).unwrap(),
            StdioConnection::invalid(),
        ] {
            assert_eq!(StdioConnection::from_entry(&conn.to_entry()), conn);
        }
    }
}
