//! Process-wide connection bookkeeping and the checkpoint/restart phase drivers.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

use crate::conn::Connection;
use crate::drain::KernelBufferDrainer;
use crate::error::{ConnError, Result};
use crate::identity::{ConnectionIdentifier, ProcessIdentity};
use crate::rewire::ConnectionRewirer;

/// Outcome of [`ConnectionTable::restore`]. Non-fatal per-connection
/// failures are collected instead of aborting the restart.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: Vec<(ConnectionIdentifier, ConnError)>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`ConnectionTable::handshake`]. A connection listed in
/// `failed` keeps no peer record; its remote identity stays unknown.
#[derive(Debug, Default)]
pub struct HandshakeReport {
    pub completed: usize,
    pub failed: Vec<(ConnectionIdentifier, ConnError)>,
}

impl HandshakeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Checkpoint phases run in the order save options, lock, pre-checkpoint,
/// post-checkpoint. `locked` is set between locking and post-checkpoint.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: BTreeMap<ConnectionIdentifier, Connection>,
    fds: BTreeMap<RawFd, ConnectionIdentifier>,
    locked: bool,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn get(&self, id: &ConnectionIdentifier) -> Option<&Connection> {
        self.conns.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionIdentifier) -> Option<&mut Connection> {
        self.conns.get_mut(id)
    }

    pub fn by_fd(&self, fd: RawFd) -> Option<&Connection> {
        self.fds.get(&fd).and_then(|id| self.conns.get(id))
    }

    pub fn by_fd_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        let id = self.fds.get(&fd)?;
        self.conns.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// Descriptors backing `id`, ascending.
    pub fn fds_of(&self, id: &ConnectionIdentifier) -> Vec<RawFd> {
        self.fds
            .iter()
            .filter(|(_, owner)| *owner == id)
            .map(|(&fd, _)| fd)
            .collect()
    }

    fn fd_groups(&self) -> BTreeMap<ConnectionIdentifier, Vec<RawFd>> {
        let mut groups: BTreeMap<ConnectionIdentifier, Vec<RawFd>> = BTreeMap::new();
        for (&fd, id) in &self.fds {
            groups.entry(id.clone()).or_default().push(fd);
        }
        groups
    }

    /// Registers `conn` on `fds`. A connection already known under the same
    /// identifier absorbs the new one through `merge_with`.
    pub fn insert(&mut self, conn: Connection, fds: &[RawFd]) -> Result<()> {
        let id = conn.id().clone();
        match self.conns.get_mut(&id) {
            Some(existing) => {
                log::debug!("{}: merging duplicate discovery", id);
                existing.merge_with(&conn)?;
            }
            None => {
                self.conns.insert(id.clone(), conn);
            }
        }
        for &fd in fds {
            self.attach_fd(fd, &id)?;
        }
        Ok(())
    }

    /// Points `fd` at an existing connection, dropping whatever it backed.
    pub fn attach_fd(&mut self, fd: RawFd, id: &ConnectionIdentifier) -> Result<()> {
        if !self.conns.contains_key(id) {
            return Err(ConnError::contract(format!(
                "fd {} attached to unknown connection {}",
                fd, id
            )));
        }
        if self.fds.get(&fd).is_some_and(|cur| cur != id) {
            self.on_close(fd);
        }
        self.fds.insert(fd, id.clone());
        Ok(())
    }

    /// Forgets `fd`. Returns the connection when that was its last descriptor.
    pub fn on_close(&mut self, fd: RawFd) -> Option<Connection> {
        let id = self.fds.remove(&fd)?;
        if self.fds.values().any(|other| *other == id) {
            return None;
        }
        log::debug!("{}: last descriptor {} closed", id, fd);
        self.conns.remove(&id)
    }

    /// Mirrors `dup2(old_fd, new_fd)` in the bookkeeping.
    pub fn on_dup2(&mut self, old_fd: RawFd, new_fd: RawFd) -> Result<()> {
        if old_fd == new_fd {
            return Ok(());
        }
        let id = self
            .fds
            .get(&old_fd)
            .cloned()
            .ok_or_else(|| ConnError::contract(format!("dup2 from untracked fd {}", old_fd)))?;
        self.attach_fd(new_fd, &id)
    }

    /// A dup2 replayed during restart: bookkeeping plus the connection's own
    /// hook.
    pub fn restart_dup2(&mut self, old_fd: RawFd, new_fd: RawFd) -> Result<()> {
        self.on_dup2(old_fd, new_fd)?;
        if let Some(conn) = self.by_fd_mut(new_fd) {
            conn.restart_dup2(old_fd, new_fd);
        }
        Ok(())
    }

    pub fn save_options(&mut self) -> Result<()> {
        for (id, fds) in self.fd_groups() {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.save_options(&fds)?;
            }
        }
        Ok(())
    }

    /// Saves descriptor options, then claims F_SETOWN on every shared
    /// socket. Options must be captured first or the saved owner would be
    /// our own pid.
    pub fn do_locking(&mut self) -> Result<()> {
        self.save_options()?;
        for (id, fds) in self.fd_groups() {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.do_locking(&fds)?;
            }
        }
        self.locked = true;
        Ok(())
    }

    /// Connections whose election this process won.
    pub fn led_connections(&self) -> Result<Vec<ConnectionIdentifier>> {
        let mut led = Vec::new();
        for (id, fds) in self.fd_groups() {
            if let Some(conn) = self.conns.get(&id) {
                if conn.check_locking(&fds)? {
                    led.push(id);
                }
            }
        }
        Ok(led)
    }

    /// Locks first when that has not happened yet, then runs the
    /// pre-checkpoint step only for connections this process leads. A
    /// socket whose election went to another process is left to it.
    pub fn pre_checkpoint(&mut self, drainer: &mut dyn KernelBufferDrainer) -> Result<()> {
        if !self.locked {
            self.do_locking()?;
        }
        log::info!("Pre-checkpoint of {} connections", self.conns.len());
        for (id, fds) in self.fd_groups() {
            let Some(conn) = self.conns.get_mut(&id) else {
                continue;
            };
            if !conn.check_locking(&fds)? {
                log::debug!("{}: drained by another process", id);
                continue;
            }
            conn.pre_checkpoint(&fds, drainer)?;
        }
        Ok(())
    }

    pub fn post_checkpoint(&mut self) -> Result<()> {
        self.locked = false;
        for (id, fds) in self.fd_groups() {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.post_checkpoint(&fds)?;
            }
        }
        log::info!("Post-checkpoint done");
        Ok(())
    }

    /// Rebuilds every connection. Contract violations abort; anything else
    /// is recorded and the remaining connections still get restored.
    pub fn restore(&mut self, rewirer: &mut dyn ConnectionRewirer) -> Result<RestoreReport> {
        log::info!("Restoring {} connections", self.conns.len());
        let mut report = RestoreReport::default();

        for (id, fds) in self.fd_groups() {
            let Some(conn) = self.conns.get_mut(&id) else {
                continue;
            };
            match conn.restore(&fds, rewirer) {
                Ok(()) => report.restored += 1,
                Err(e) if e.is_fatal() => {
                    log::error!("{}: {}", id, e);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("{}: restore failed: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }
        Ok(report)
    }

    pub fn restore_options(&mut self) -> Result<()> {
        for (id, fds) in self.fd_groups() {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.restore_options(&fds)?;
            }
        }
        Ok(())
    }

    /// Runs the restart handshake in two phases: every connection sends
    /// before any connection receives, so two processes handshaking over
    /// several sockets cannot block on each other. A connection whose
    /// exchange fails is reported and skipped; only fatal errors abort.
    pub fn handshake(
        &mut self,
        me: &ProcessIdentity,
        coordinator: &ProcessIdentity,
    ) -> Result<HandshakeReport> {
        let mut report = HandshakeReport::default();
        let mut pending = Vec::new();

        for (id, fds) in self.fd_groups() {
            let Some(conn) = self.conns.get(&id) else {
                continue;
            };
            match conn.send_handshakes(&fds, me, coordinator) {
                Ok(()) => pending.push((id, fds)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("{}: handshake send failed: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }
        for (id, fds) in pending {
            let Some(conn) = self.conns.get_mut(&id) else {
                continue;
            };
            match conn.recv_handshakes(&fds, coordinator) {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("{}: remote identity unknown: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }
        log::info!(
            "Handshake complete for {} connections, {} failed",
            report.completed,
            report.failed.len()
        );
        Ok(report)
    }
}
