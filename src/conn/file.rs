//! Regular file connections.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::error::{ConnError, Result};
use crate::proto::{FileConnEntry, FileMetaEntry};
use crate::sys;

/// Size/mode/mtime snapshot used to spot files changed behind our back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: i64,
    pub mode: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

impl FileMeta {
    pub fn of(md: &fs::Metadata) -> Self {
        Self {
            size: md.size() as i64,
            mode: md.mode(),
            mtime_sec: md.mtime(),
            mtime_nsec: md.mtime_nsec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Unchecked,
    Fresh,
    Stale,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConnection {
    path: PathBuf,
    offset: i64,
    meta: Option<FileMeta>,
    status: FileStatus,
}

impl FileConnection {
    /// `offset` of -1 means the position is not worth restoring.
    pub fn new(path: impl Into<PathBuf>, offset: i64) -> Self {
        Self {
            path: path.into(),
            offset,
            meta: None,
            status: FileStatus::Unchecked,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn meta(&self) -> Option<&FileMeta> {
        self.meta.as_ref()
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn is_stale(&self) -> bool {
        self.status == FileStatus::Stale
    }

    pub fn pre_checkpoint(&mut self, fds: &[RawFd]) -> Result<()> {
        let fd = super::first_fd(fds)?;

        match sys::fd_path(fd) {
            Ok(path) => self.path = path,
            Err(e) => log::warn!("fd {}: keeping path {}: {}", fd, self.path.display(), e),
        }

        self.offset = sys::seek(fd, 0, libc::SEEK_CUR).unwrap_or(-1);
        let md = fs::metadata(format!("/proc/self/fd/{}", fd))?;
        self.meta = Some(FileMeta::of(&md));

        log::debug!(
            "fd {}: file {} at offset {}",
            fd,
            self.path.display(),
            self.offset
        );
        Ok(())
    }

    pub fn post_checkpoint(&mut self, fds: &[RawFd]) -> Result<()> {
        if self.offset < 0 {
            return Ok(());
        }
        let fd = super::first_fd(fds)?;
        sys::seek(fd, self.offset, libc::SEEK_SET)?;
        Ok(())
    }

    /// Compares the saved snapshot with what is on disk now. Files without a
    /// snapshot are never stale.
    pub fn check_stale(&mut self) -> bool {
        let Some(saved) = self.meta else {
            return false;
        };
        self.status = match fs::metadata(&self.path) {
            Ok(md) if FileMeta::of(&md) == saved => FileStatus::Fresh,
            Ok(_) => FileStatus::Stale,
            Err(_) => FileStatus::Unavailable,
        };
        self.status == FileStatus::Stale
    }

    /// Reopens the file with the saved access mode and installs it on every
    /// descriptor. Staleness is only reported; acting on it is the caller's
    /// call.
    pub fn restore(&mut self, fds: &[RawFd], status_flags: i32) -> Result<()> {
        if self.check_stale() {
            log::warn!("{} changed since checkpoint", self.path.display());
        }

        let flags = status_flags & !(libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL);
        let fd = match sys::open_path(&self.path, flags) {
            Ok(fd) => fd,
            Err(source) => {
                self.status = FileStatus::Unavailable;
                return Err(ConnError::Reopen {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if self.offset >= 0 {
            if let Err(e) = sys::seek(fd, self.offset, libc::SEEK_SET) {
                sys::close(fd);
                return Err(e.into());
            }
        }
        sys::install_on(fd, fds)?;
        Ok(())
    }

    pub fn merge_with(&mut self, other: &FileConnection) -> Result<()> {
        if self.path != other.path {
            return Err(ConnError::contract(format!(
                "merging files {} and {}",
                self.path.display(),
                other.path.display()
            )));
        }
        Ok(())
    }

    pub fn to_entry(&self) -> FileConnEntry {
        FileConnEntry {
            path: self.path.to_string_lossy().into_owned(),
            offset: self.offset,
            meta: self.meta.map(|m| FileMetaEntry {
                size: m.size,
                mode: m.mode,
                mtime_sec: m.mtime_sec,
                mtime_nsec: m.mtime_nsec,
            }),
        }
    }

    pub fn from_entry(entry: &FileConnEntry) -> Self {
        let mut file = Self::new(&entry.path, entry.offset);
        file.meta = entry.meta.as_ref().map(|m| FileMeta {
            size: m.size,
            mode: m.mode,
            mtime_sec: m.mtime_sec,
            mtime_nsec: m.mtime_nsec,
        });
        file
    }
}
