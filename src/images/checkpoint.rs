// Connection-table checkpoint data
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::conn::{Connection, FileStatus, Payload};
use crate::error::Result;
use crate::identity::{ProcessContext, ProcessIdentity};
use crate::table::ConnectionTable;

/// One connection together with the descriptor numbers it was reachable on.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub conn: Connection,
    pub fds: Vec<RawFd>,
}

/// Everything `conntable.img` holds for one process.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnTableImage {
    pub run_id: String,
    pub this_process: ProcessIdentity,
    pub parent_process: ProcessIdentity,
    pub entries: Vec<ImageEntry>,
}

impl ConnTableImage {
    /// Snapshot of `table` under a fresh run id.
    pub fn capture(ctx: &ProcessContext, table: &ConnectionTable) -> Self {
        let entries = table
            .iter()
            .map(|conn| ImageEntry {
                fds: table.fds_of(conn.id()),
                conn: conn.clone(),
            })
            .collect();

        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            this_process: ctx.this_process().clone(),
            parent_process: ctx.parent_process().clone(),
            entries,
        }
    }

    /// Rebuilds the descriptor table the image was taken from.
    pub fn into_table(self) -> Result<ConnectionTable> {
        let mut table = ConnectionTable::new();
        for entry in self.entries {
            table.insert(entry.conn, &entry.fds)?;
        }
        Ok(table)
    }

    /// Re-checks every regular file against its saved metadata.
    pub fn check_files(&mut self) -> Vec<(PathBuf, FileStatus)> {
        let mut result = Vec::new();
        for entry in &mut self.entries {
            if let Payload::File(file) = entry.conn.payload_mut() {
                file.check_stale();
                result.push((file.path().to_path_buf(), file.status()));
            }
        }
        result
    }

    /// Display checkpoint information for debugging
    pub fn display(&self) -> Result<()> {
        log::debug!("Connection table (run {})", self.run_id);
        log::debug!("  This process: {} gen {}", self.this_process, self.this_process.generation);
        if !self.parent_process.is_null() {
            log::debug!("  Parent process: {}", self.parent_process);
        }
        log::debug!("  Connections: {}", self.entries.len());

        for (i, entry) in self.entries.iter().enumerate() {
            self.display_entry(i, entry);
        }
        Ok(())
    }

    fn display_entry(&self, index: usize, entry: &ImageEntry) {
        let conn = &entry.conn;
        let detail = match conn.payload() {
            Payload::Tcp(tcp) => {
                let addr = tcp
                    .bound_addr()
                    .and_then(crate::sys::sockaddr_to_std)
                    .map(|a| format!(" {}", a))
                    .unwrap_or_default();
                let peer = tcp
                    .peer()
                    .map(|p| format!(" peer={}", p.conn))
                    .unwrap_or_default();
                format!("state={}{}{}", tcp.state(), addr, peer)
            }
            Payload::Pts(pts) => {
                format!("{:?} {} -> {}", pts.subtype(), pts.symlink(), pts.device())
            }
            Payload::File(file) => format!("{} @ {}", file.path().display(), file.offset()),
            Payload::Stdio(stdio) => format!("{:?}", stdio.stream()),
        };
        log::debug!(
            "  [{:2}] {:5} {} fds={:?} flags=0x{:x}{} {}",
            index,
            conn.kind(),
            conn.id(),
            entry.fds,
            conn.flags().status_flags,
            if conn.flags().close_on_exec { " cloexec" } else { "" },
            detail
        );
    }
}
