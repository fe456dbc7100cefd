//! Per-process identity and the checkpoint names derived from it.
//!
//! A single [`ProcessContext`] is built at startup and passed by reference to
//! whatever needs "this process", "the parent process" or a checkpoint path.
//! Restart and fork substitute identities through explicit methods here.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{host_id_from_name, ConnectionIdentifier, ProcessIdentity};
use crate::error::{ConnError, Result};
use crate::options::Options;
use crate::sys;

pub const CKPT_FILE_PREFIX: &str = "ckpt_";
pub const CKPT_FILE_SUFFIX: &str = ".img";
pub const CKPT_FILES_SUBDIR_SUFFIX: &str = "_files";
pub const CONN_TABLE_PREFIX: &str = "connTable.";

#[derive(Debug)]
pub struct ProcessContext {
    this: ProcessIdentity,
    parent: ProcessIdentity,
    program: String,
    prefix: String,
    ckpt_dir: Option<PathBuf>,
    tmp_dir: Option<PathBuf>,
    next_sequence: u64,
    table_count: u32,
}

impl ProcessContext {
    /// Identity of the calling process, named after the current host, pid and
    /// wall clock.
    pub fn current(options: &Options, program: impl Into<String>) -> Result<Self> {
        let host = sys::hostname()?;
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut this = ProcessIdentity::new(host_id_from_name(&host), sys::getpid(), created);
        this.prefix = options.prefix.clone();
        log::debug!("Calculated process identity {}", this);

        Ok(Self::with_identity(this, options, program))
    }

    pub fn with_identity(
        this: ProcessIdentity,
        options: &Options,
        program: impl Into<String>,
    ) -> Self {
        Self {
            prefix: options.prefix.clone(),
            this,
            parent: ProcessIdentity::null(),
            program: program.into(),
            ckpt_dir: options.checkpoint_dir.clone(),
            tmp_dir: options.tmp_dir.clone(),
            next_sequence: 0,
            table_count: 0,
        }
    }

    pub fn this_process(&self) -> &ProcessIdentity {
        &self.this
    }

    pub fn parent_process(&self) -> &ProcessIdentity {
        &self.parent
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hands out the next connection identifier owned by this process.
    pub fn next_connection_id(&mut self) -> ConnectionIdentifier {
        self.next_sequence += 1;
        ConnectionIdentifier::new(self.this.clone(), self.next_sequence)
    }

    /// A forked child takes `new_id`; the old identity becomes its parent.
    pub fn reset_on_fork(&mut self, new_id: ProcessIdentity) {
        log::debug!("Explicitly setting process identity {} (was {})", new_id, self.this);
        self.parent = std::mem::replace(&mut self.this, new_id);
        self.next_sequence = 0;
    }

    /// Adopts identities read back from a checkpoint image.
    pub fn adopt(&mut self, this: ProcessIdentity, parent: ProcessIdentity) {
        self.this = this;
        self.parent = parent;
    }

    /// Marks one restart of this logical process.
    pub fn restart(&mut self) {
        self.this.increment_generation();
        log::info!(
            "Restarted as {} generation {}",
            self.this,
            self.this.generation
        );
    }

    pub fn set_ckpt_dir(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        check_access(&dir)?;
        self.ckpt_dir = Some(dir);
        Ok(())
    }

    /// Explicit checkpoint directory, or `.` when none was configured.
    pub fn ckpt_dir(&self) -> PathBuf {
        self.ckpt_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Creates the checkpoint directory if needed and checks it is usable.
    pub fn create_ckpt_dir(&self) -> Result<PathBuf> {
        let dir = self.ckpt_dir();
        make_private_dir(&dir)?;
        Ok(dir)
    }

    fn identity_stem(&self) -> String {
        format!(
            "{}{}_{}{}",
            CKPT_FILE_PREFIX, self.program, self.prefix, self.this
        )
    }

    pub fn ckpt_filename(&self) -> PathBuf {
        self.ckpt_dir()
            .join(format!("{}{}", self.identity_stem(), CKPT_FILE_SUFFIX))
    }

    pub fn ckpt_files_subdir(&self) -> PathBuf {
        self.ckpt_dir()
            .join(format!("{}{}", self.identity_stem(), CKPT_FILES_SUBDIR_SUFFIX))
    }

    /// Scratch directory: the override if set, else
    /// `$TMPDIR/ckptconn-<user>@<host>` or `/tmp/ckptconn-<user>@<host>`.
    pub fn tmp_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.tmp_dir {
            return Ok(dir.clone());
        }
        let base = std::env::var_os("TMPDIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Ok(base.join(format!("ckptconn-{}@{}", sys::username(), sys::hostname()?)))
    }

    pub fn create_tmp_dir(&self) -> Result<PathBuf> {
        let dir = self.tmp_dir()?;
        make_private_dir(&dir)?;
        Ok(dir)
    }

    /// A fresh connection-table file name in the scratch directory.
    pub fn conn_table_filename(&mut self) -> Result<PathBuf> {
        let name = format!(
            "{}{}{}_{}",
            CONN_TABLE_PREFIX, self.prefix, self.this, self.table_count
        );
        self.table_count += 1;
        Ok(self.tmp_dir()?.join(name))
    }
}

fn make_private_dir(dir: &Path) -> Result<()> {
    match fs::DirBuilder::new().mode(0o700).create(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            log::error!("Error creating directory {}: {}", dir.display(), e);
            return Err(ConnError::DirAccess {
                path: dir.to_path_buf(),
            });
        }
    }
    check_access(dir)
}

fn check_access(dir: &Path) -> Result<()> {
    if !sys::can_write_and_search(dir) {
        log::error!("Missing execute- or write-access to {}", dir.display());
        return Err(ConnError::DirAccess {
            path: dir.to_path_buf(),
        });
    }
    Ok(())
}
