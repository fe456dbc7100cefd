//! Descriptor-level flags shared by every connection kind.

use std::io;
use std::os::unix::io::RawFd;

use crate::proto::DescriptorFlagsEntry;
use crate::sys;

// Linux-only fcntl commands for the async I/O signal.
const F_SETSIG: libc::c_int = 10;
const F_GETSIG: libc::c_int = 11;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorFlags {
    /// File status flags as returned by F_GETFL.
    pub status_flags: i32,
    pub close_on_exec: bool,
    /// Async I/O owner (F_GETOWN); 0 when unset.
    pub owner: i32,
    /// Async I/O signal (F_GETSIG); 0 means SIGIO.
    pub signal: i32,
}

impl DescriptorFlags {
    pub fn capture(fd: RawFd) -> io::Result<Self> {
        let status_flags = sys::fcntl_get(fd, libc::F_GETFL)?;
        let fd_flags = sys::fcntl_get(fd, libc::F_GETFD)?;
        let owner = sys::fcntl_get(fd, libc::F_GETOWN)?;
        let signal = sys::fcntl_get(fd, F_GETSIG)?;

        Ok(Self {
            status_flags,
            close_on_exec: fd_flags & libc::FD_CLOEXEC != 0,
            owner,
            signal,
        })
    }

    pub fn apply(&self, fd: RawFd) -> io::Result<()> {
        sys::fcntl_set(fd, libc::F_SETFL, self.status_flags)?;
        let fd_flags = if self.close_on_exec { libc::FD_CLOEXEC } else { 0 };
        sys::fcntl_set(fd, libc::F_SETFD, fd_flags)?;

        if self.owner != 0 {
            // The old owner may not exist in this incarnation.
            if let Err(e) = sys::fcntl_set(fd, libc::F_SETOWN, self.owner) {
                log::warn!("fd {}: cannot restore owner {}: {}", fd, self.owner, e);
            }
        }
        sys::fcntl_set(fd, F_SETSIG, self.signal)
    }

    pub fn to_entry(&self) -> DescriptorFlagsEntry {
        DescriptorFlagsEntry {
            status_flags: self.status_flags,
            close_on_exec: self.close_on_exec,
            owner: self.owner,
            signal: self.signal,
        }
    }

    pub fn from_entry(entry: &DescriptorFlagsEntry) -> Self {
        Self {
            status_flags: entry.status_flags,
            close_on_exec: entry.close_on_exec,
            owner: entry.owner,
            signal: entry.signal,
        }
    }
}
