//! Pseudoterminal connections.

use std::fs;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::{ConnError, Result};
use crate::proto::{PtsEntry, PtsSubtypeEntry};
use crate::sys;

/// Placeholder path for a terminal whose name could not be resolved.
pub const UNKNOWN_PATH: &str = "?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtsSubtype {
    Master,
    Slave,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtsConnection {
    subtype: PtsSubtype,
    device: String,
    symlink: String,
    termios: Vec<u8>,
}

impl PtsConnection {
    /// A `symlink` of `"?"` marks the terminal unrecoverable whatever the
    /// device says.
    pub fn new(device: impl Into<String>, symlink: impl Into<String>, subtype: PtsSubtype) -> Self {
        let device = device.into();
        let symlink = symlink.into();
        let subtype = if symlink == UNKNOWN_PATH {
            PtsSubtype::Invalid
        } else {
            subtype
        };
        log::trace!("Creating pts connection {} -> {} ({:?})", symlink, device, subtype);
        Self {
            subtype,
            device,
            symlink,
            termios: Vec::new(),
        }
    }

    pub fn invalid() -> Self {
        Self::new(UNKNOWN_PATH, UNKNOWN_PATH, PtsSubtype::Invalid)
    }

    pub fn subtype(&self) -> PtsSubtype {
        self.subtype
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn symlink(&self) -> &str {
        &self.symlink
    }

    fn invalidate(&mut self, why: &str) {
        log::warn!("pts {}: {}; terminal will not be restored", self.symlink, why);
        self.subtype = PtsSubtype::Invalid;
    }

    fn resolve_symlink(&self) -> Option<String> {
        fs::canonicalize(Path::new(&self.symlink))
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    /// Nothing to drain; re-resolves the terminal name and snapshots its
    /// attributes.
    pub fn pre_checkpoint(&mut self, fds: &[RawFd]) -> Result<()> {
        if self.subtype == PtsSubtype::Invalid {
            return Ok(());
        }
        match self.resolve_symlink() {
            Some(device) => self.device = device,
            None => {
                self.invalidate("cannot resolve symlink");
                return Ok(());
            }
        }
        let fd = super::first_fd(fds)?;
        self.termios = sys::tcgetattr(fd).unwrap_or_default();
        Ok(())
    }

    pub fn post_checkpoint(&mut self, _fds: &[RawFd]) {}

    /// Reattaches the terminal. An unresolvable terminal leaves the
    /// connection invalid and the descriptors untouched.
    pub fn restore(&mut self, fds: &[RawFd]) -> Result<()> {
        match self.subtype {
            PtsSubtype::Invalid => Ok(()),
            PtsSubtype::Master => match sys::open_ptmx() {
                Ok((fd, slave)) => {
                    self.device = slave.to_string_lossy().into_owned();
                    log::debug!("pts master {} now drives {}", self.symlink, self.device);
                    sys::install_on(fd, fds)?;
                    Ok(())
                }
                Err(e) => {
                    self.invalidate(&format!("cannot open /dev/ptmx: {}", e));
                    Ok(())
                }
            },
            PtsSubtype::Slave => {
                let Some(device) = self.resolve_symlink() else {
                    self.invalidate("cannot resolve symlink");
                    return Ok(());
                };
                match sys::open_path(Path::new(&device), libc::O_RDWR | libc::O_NOCTTY) {
                    Ok(fd) => {
                        self.device = device;
                        sys::install_on(fd, fds)?;
                        Ok(())
                    }
                    Err(e) => {
                        self.invalidate(&format!("cannot open {}: {}", device, e));
                        Ok(())
                    }
                }
            }
        }
    }

    pub fn restore_options(&self, fds: &[RawFd]) -> Result<()> {
        if self.subtype == PtsSubtype::Invalid || self.termios.is_empty() {
            return Ok(());
        }
        let fd = super::first_fd(fds)?;
        if let Err(e) = sys::tcsetattr(fd, &self.termios) {
            log::warn!("pts {}: cannot restore terminal attributes: {}", self.symlink, e);
        }
        Ok(())
    }

    pub fn merge_with(&mut self, other: &PtsConnection) -> Result<()> {
        if self.subtype != other.subtype || self.device != other.device {
            return Err(ConnError::contract(format!(
                "merging pts {} ({:?}) with {} ({:?})",
                self.device, self.subtype, other.device, other.subtype
            )));
        }
        Ok(())
    }

    pub fn to_entry(&self) -> PtsEntry {
        let subtype = match self.subtype {
            PtsSubtype::Master => PtsSubtypeEntry::Master,
            PtsSubtype::Slave => PtsSubtypeEntry::Slave,
            PtsSubtype::Invalid => PtsSubtypeEntry::Invalid,
        };
        PtsEntry {
            subtype: subtype as i32,
            device: self.device.clone(),
            symlink: self.symlink.clone(),
            termios: self.termios.clone(),
        }
    }

    pub fn from_entry(entry: &PtsEntry) -> Self {
        let subtype = match PtsSubtypeEntry::try_from(entry.subtype) {
            Ok(PtsSubtypeEntry::Master) => PtsSubtype::Master,
            Ok(PtsSubtypeEntry::Slave) => PtsSubtype::Slave,
            _ => PtsSubtype::Invalid,
        };
        let mut pts = Self::new(entry.device.clone(), entry.symlink.clone(), subtype);
        pts.termios = entry.termios.clone();
        pts
    }
}

impl Default for PtsConnection {
    fn default() -> Self {
        Self::invalid()
    }
}
