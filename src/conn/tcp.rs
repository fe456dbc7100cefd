//! TCP (and other stream/datagram socket) connections.
//!
//! State is tracked from the intercepted socket calls:
//!
//! ```text
//! Created --bind--> Bound --listen--> Listening --accept--> (child) Accepted
//! Created --connect--> Connected
//! any --error/disconnect--> Error
//! inherited --> PreExisting (checkpointed like Connected)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::io::RawFd;

use super::handshake::{recv_handshake, send_handshake, Handshake};
use crate::drain::KernelBufferDrainer;
use crate::error::{ConnError, Result};
use crate::identity::{ConnectionIdentifier, ProcessIdentity};
use crate::proto::{SockOptEntry, TcpEntry, TcpStateEntry};
use crate::rewire::{ConnectionRewirer, RewireRequest, RewireRole};
use crate::sys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Invalid,
    Error,
    Created,
    Bound,
    Listening,
    Accepted,
    Connected,
    PreExisting,
}

impl TcpState {
    /// States that carry an open duplex byte stream.
    pub fn is_stream(self) -> bool {
        matches!(self, TcpState::Connected | TcpState::Accepted | TcpState::PreExisting)
    }

    fn is_default(self) -> bool {
        matches!(self, TcpState::Invalid | TcpState::Created)
    }

    fn to_entry(self) -> TcpStateEntry {
        match self {
            TcpState::Invalid => TcpStateEntry::Invalid,
            TcpState::Error => TcpStateEntry::Error,
            TcpState::Created => TcpStateEntry::Created,
            TcpState::Bound => TcpStateEntry::Bound,
            TcpState::Listening => TcpStateEntry::Listening,
            TcpState::Accepted => TcpStateEntry::Accepted,
            TcpState::Connected => TcpStateEntry::Connected,
            TcpState::PreExisting => TcpStateEntry::Preexisting,
        }
    }

    fn from_entry(entry: TcpStateEntry) -> Self {
        match entry {
            TcpStateEntry::Invalid => TcpState::Invalid,
            TcpStateEntry::Error => TcpState::Error,
            TcpStateEntry::Created => TcpState::Created,
            TcpStateEntry::Bound => TcpState::Bound,
            TcpStateEntry::Listening => TcpState::Listening,
            TcpStateEntry::Accepted => TcpState::Accepted,
            TcpStateEntry::Connected => TcpState::Connected,
            TcpStateEntry::Preexisting => TcpState::PreExisting,
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity of the other end, learned from the restart handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub process: ProcessIdentity,
    pub conn: ConnectionIdentifier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpConnection {
    state: TcpState,
    domain: i32,
    sock_type: i32,
    protocol: i32,
    listen_backlog: i32,
    bound_addr: Vec<u8>,
    remote_id: Option<ConnectionIdentifier>,
    // (level, option) -> raw value
    sock_options: BTreeMap<(i32, i32), Vec<u8>>,
    peer: Option<PeerRecord>,
}

impl TcpConnection {
    /// State after an intercepted `socket()`.
    pub fn new(domain: i32, sock_type: i32, protocol: i32) -> Self {
        Self {
            state: TcpState::Created,
            domain,
            sock_type,
            protocol,
            listen_backlog: 0,
            bound_addr: Vec::new(),
            remote_id: None,
            sock_options: BTreeMap::new(),
            peer: None,
        }
    }

    /// Child produced by `accept()` on a listening socket. `remote` is the
    /// connecting side's identifier.
    pub fn accepted(parent: &TcpConnection, remote: ConnectionIdentifier) -> Result<Self> {
        if parent.state != TcpState::Listening {
            return Err(ConnError::contract(format!(
                "accept on a socket in state {}",
                parent.state
            )));
        }
        Ok(Self {
            state: TcpState::Accepted,
            listen_backlog: 0,
            remote_id: Some(remote),
            peer: None,
            ..parent.clone()
        })
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn domain(&self) -> i32 {
        self.domain
    }

    pub fn sock_type(&self) -> i32 {
        self.sock_type
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn listen_backlog(&self) -> i32 {
        self.listen_backlog
    }

    /// Raw `sockaddr` given to `bind()`; meaningful once bound.
    pub fn bound_addr(&self) -> Option<&[u8]> {
        if self.bound_addr.is_empty() {
            None
        } else {
            Some(&self.bound_addr)
        }
    }

    /// Identifier of the connecting peer; only accepted sockets carry one.
    pub fn remote_id(&self) -> Option<&ConnectionIdentifier> {
        self.remote_id.as_ref()
    }

    pub fn peer(&self) -> Option<&PeerRecord> {
        self.peer.as_ref()
    }

    pub fn sock_options(&self) -> &BTreeMap<(i32, i32), Vec<u8>> {
        &self.sock_options
    }

    fn expect_state(&self, wanted: TcpState, op: &str) -> Result<()> {
        if self.state != wanted {
            return Err(ConnError::contract(format!(
                "{} requires state {}, socket is {}",
                op, wanted, self.state
            )));
        }
        Ok(())
    }

    pub fn on_bind(&mut self, addr: &[u8]) -> Result<()> {
        self.expect_state(TcpState::Created, "bind")?;
        self.bound_addr = addr.to_vec();
        self.state = TcpState::Bound;
        Ok(())
    }

    pub fn on_listen(&mut self, backlog: i32) -> Result<()> {
        self.expect_state(TcpState::Bound, "listen")?;
        self.listen_backlog = backlog;
        self.state = TcpState::Listening;
        Ok(())
    }

    /// The remote identity is unknown here; the handshake fills it in.
    pub fn on_connect(&mut self) -> Result<()> {
        self.expect_state(TcpState::Created, "connect")?;
        self.state = TcpState::Connected;
        Ok(())
    }

    pub fn on_error(&mut self) {
        self.state = TcpState::Error;
    }

    /// The kernel reported the peer gone; the socket cannot be rewired.
    pub fn on_disconnect(&mut self, fds: &[RawFd]) {
        log::debug!("fds {:?}: peer disconnected in state {}", fds, self.state);
        self.state = TcpState::Error;
    }

    pub fn mark_preexisting(&mut self) {
        self.state = TcpState::PreExisting;
    }

    pub fn add_setsockopt(&mut self, level: i32, option: i32, value: &[u8]) {
        self.sock_options.insert((level, option), value.to_vec());
    }

    pub fn pre_checkpoint(
        &mut self,
        fds: &[RawFd],
        drainer: &mut dyn KernelBufferDrainer,
    ) -> Result<()> {
        if !self.state.is_stream() {
            return Ok(());
        }
        let fd = super::first_fd(fds)?;
        log::debug!("fd {}: draining {} socket", fd, self.state);
        drainer.register_for_drain(fd)
    }

    pub fn post_checkpoint(&mut self, fds: &[RawFd]) {
        if self.state.is_stream() {
            log::debug!("fds {:?}: stream resumes after checkpoint", fds);
        }
    }

    /// Claims async ownership of the shared socket so exactly one process
    /// ends up draining it.
    pub fn do_locking(&mut self, fds: &[RawFd]) -> Result<()> {
        let fd = super::first_fd(fds)?;
        sys::fcntl_set(fd, libc::F_SETOWN, sys::getpid())?;
        Ok(())
    }

    /// True when this process won the ownership election from `do_locking`.
    pub fn check_locking(&self, fds: &[RawFd]) -> Result<bool> {
        let fd = super::first_fd(fds)?;
        Ok(sys::fcntl_get(fd, libc::F_GETOWN)? == sys::getpid())
    }

    pub fn restore(
        &mut self,
        id: &ConnectionIdentifier,
        fds: &[RawFd],
        rewirer: &mut dyn ConnectionRewirer,
    ) -> Result<()> {
        match self.state {
            TcpState::Created | TcpState::Bound | TcpState::Listening => {
                if let Err(e) = self.recreate_local(fds) {
                    log::error!("{}: cannot recreate {} socket: {}", id, self.state, e);
                    self.state = TcpState::Error;
                    return Err(e);
                }
                Ok(())
            }
            TcpState::Connected | TcpState::PreExisting => {
                let request = RewireRequest {
                    local: id.clone(),
                    remote: self.peer.as_ref().map(|p| p.conn.clone()),
                    role: RewireRole::Connector,
                };
                rewirer.register_for_restore(request, fds)
            }
            TcpState::Accepted => {
                let request = RewireRequest {
                    local: id.clone(),
                    remote: self.remote_id.clone(),
                    role: RewireRole::AcceptedChild,
                };
                rewirer.register_for_restore(request, fds)
            }
            TcpState::Error | TcpState::Invalid => {
                log::warn!("{}: skipping restore of socket in state {}", id, self.state);
                Ok(())
            }
        }
    }

    fn recreate_local(&self, fds: &[RawFd]) -> Result<()> {
        let sk = sys::socket(self.domain, self.sock_type, self.protocol)?;

        let setup = || -> Result<()> {
            if matches!(self.state, TcpState::Bound | TcpState::Listening) {
                let one: i32 = 1;
                sys::restore_opt(sk, libc::SOL_SOCKET, libc::SO_REUSEADDR, &one)?;
                sys::bind_raw(sk, &self.bound_addr)?;
            }
            if self.state == TcpState::Listening {
                sys::listen(sk, self.listen_backlog)?;
            }
            Ok(())
        };

        if let Err(e) = setup() {
            sys::close(sk);
            return Err(e);
        }
        sys::install_on(sk, fds)?;
        Ok(())
    }

    /// Replays recorded `setsockopt()` calls. Sockets in error state are
    /// not replayed.
    pub fn restore_options(&self, fds: &[RawFd]) -> Result<()> {
        if matches!(self.state, TcpState::Error | TcpState::Invalid) {
            return Ok(());
        }
        let fd = super::first_fd(fds)?;
        for (&(level, option), value) in &self.sock_options {
            if let Err(e) = sys::set_sockopt_raw(fd, level, option, value) {
                log::warn!("fd {}: dropping sockopt {}:{}: {}", fd, level, option, e);
            }
        }
        Ok(())
    }

    pub fn send_handshakes(
        &self,
        fds: &[RawFd],
        id: &ConnectionIdentifier,
        me: &ProcessIdentity,
        coordinator: &ProcessIdentity,
    ) -> Result<()> {
        if !self.state.is_stream() {
            return Ok(());
        }
        let hello = Handshake {
            coordinator: coordinator.clone(),
            sender: me.clone(),
            conn_id: id.clone(),
        };
        send_handshake(super::first_fd(fds)?, &hello)
    }

    pub fn recv_handshakes(&mut self, fds: &[RawFd], coordinator: &ProcessIdentity) -> Result<()> {
        if !self.state.is_stream() {
            return Ok(());
        }
        let hello = recv_handshake(super::first_fd(fds)?, coordinator)?;
        if self.state == TcpState::Accepted {
            self.remote_id = Some(hello.conn_id.clone());
        }
        self.peer = Some(PeerRecord {
            process: hello.sender,
            conn: hello.conn_id,
        });
        Ok(())
    }

    pub fn merge_with(&mut self, other: &TcpConnection) -> Result<()> {
        if (self.domain, self.sock_type, self.protocol)
            != (other.domain, other.sock_type, other.protocol)
        {
            return Err(ConnError::contract(format!(
                "merging sockets ({}, {}, {}) and ({}, {}, {})",
                self.domain,
                self.sock_type,
                self.protocol,
                other.domain,
                other.sock_type,
                other.protocol
            )));
        }

        for (key, value) in &other.sock_options {
            self.sock_options.entry(*key).or_insert_with(|| value.clone());
        }

        if self.state.is_default() && !other.state.is_default() {
            self.state = other.state;
            self.bound_addr = other.bound_addr.clone();
            self.listen_backlog = other.listen_backlog;
            self.remote_id = other.remote_id.clone();
        } else if !other.state.is_default() && other.state != self.state {
            log::warn!("merge keeps state {} over {}", self.state, other.state);
        }

        if self.peer.is_none() {
            self.peer = other.peer.clone();
        }
        Ok(())
    }

    pub fn to_entry(&self) -> TcpEntry {
        TcpEntry {
            state: self.state.to_entry() as i32,
            domain: self.domain,
            sock_type: self.sock_type,
            protocol: self.protocol,
            listen_backlog: self.listen_backlog,
            bound_addr: self.bound_addr.clone(),
            remote_id: self.remote_id.as_ref().map(ConnectionIdentifier::to_entry),
            sock_opts: self
                .sock_options
                .iter()
                .map(|(&(level, option), value)| SockOptEntry {
                    level,
                    option,
                    value: value.clone(),
                })
                .collect(),
            peer_process: self.peer.as_ref().map(|p| p.process.to_entry()),
            peer_conn: self.peer.as_ref().map(|p| p.conn.to_entry()),
        }
    }

    pub fn from_entry(entry: &TcpEntry) -> Self {
        let state = TcpStateEntry::try_from(entry.state)
            .map(TcpState::from_entry)
            .unwrap_or(TcpState::Invalid);
        Self {
            state,
            domain: entry.domain,
            sock_type: entry.sock_type,
            protocol: entry.protocol,
            listen_backlog: entry.listen_backlog,
            bound_addr: entry.bound_addr.clone(),
            remote_id: entry.remote_id.as_ref().map(ConnectionIdentifier::from_entry),
            sock_options: entry
                .sock_opts
                .iter()
                .map(|o| ((o.level, o.option), o.value.clone()))
                .collect(),
            peer: match (&entry.peer_process, &entry.peer_conn) {
                (Some(process), Some(conn)) => Some(PeerRecord {
                    process: ProcessIdentity::from_entry(process),
                    conn: ConnectionIdentifier::from_entry(conn),
                }),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn tcp() -> TcpConnection {
        TcpConnection::new(libc::AF_INET, libc::SOCK_STREAM, 0)
    }

    fn addr() -> Vec<u8> {
        sys::sockaddr_bytes(&"127.0.0.1:0".parse::<SocketAddr>().unwrap())
    }

    struct CountingDrainer(Vec<RawFd>);

    impl KernelBufferDrainer for CountingDrainer {
        fn register_for_drain(&mut self, fd: RawFd) -> Result<()> {
            self.0.push(fd);
            Ok(())
        }
    }

    #[test]
    fn test_bind_only_from_created() {
        let mut sk = tcp();
        sk.on_bind(&addr()).unwrap();
        assert_eq!(sk.state(), TcpState::Bound);

        let err = sk.on_bind(&addr()).unwrap_err();
        assert!(err.is_fatal());

        sk.on_listen(5).unwrap();
        assert!(sk.on_bind(&addr()).is_err());
    }

    #[test]
    fn test_listen_only_from_bound() {
        let mut sk = tcp();
        assert!(sk.on_listen(5).is_err());
        assert_eq!(sk.state(), TcpState::Created);

        sk.on_bind(&addr()).unwrap();
        sk.on_listen(5).unwrap();
        assert_eq!(sk.state(), TcpState::Listening);
        assert_eq!(sk.listen_backlog(), 5);
        assert!(sk.on_listen(6).is_err());

        let mut connected = tcp();
        connected.on_connect().unwrap();
        assert!(connected.on_listen(1).is_err());
        assert!(connected.on_bind(&addr()).is_err());
    }

    #[test]
    fn test_accepted_child() {
        let remote = ConnectionIdentifier::new(ProcessIdentity::new(1, 2, 3), 4);

        let mut listener = tcp();
        assert!(TcpConnection::accepted(&listener, remote.clone()).is_err());

        listener.on_bind(&addr()).unwrap();
        listener.on_listen(8).unwrap();
        listener.add_setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, &1i32.to_ne_bytes());

        let child = TcpConnection::accepted(&listener, remote.clone()).unwrap();
        assert_eq!(child.state(), TcpState::Accepted);
        assert_eq!(child.remote_id(), Some(&remote));
        assert_eq!(child.sock_options().len(), 1);
        assert!(listener.remote_id().is_none());
    }

    #[test]
    fn test_drain_only_streams() {
        let mut drainer = CountingDrainer(Vec::new());

        let mut listener = tcp();
        listener.on_bind(&addr()).unwrap();
        listener.on_listen(1).unwrap();
        listener.pre_checkpoint(&[7], &mut drainer).unwrap();
        assert!(drainer.0.is_empty());

        let mut client = tcp();
        client.on_connect().unwrap();
        client.pre_checkpoint(&[9, 10], &mut drainer).unwrap();

        let mut inherited = tcp();
        inherited.mark_preexisting();
        inherited.pre_checkpoint(&[11], &mut drainer).unwrap();

        assert_eq!(drainer.0, vec![9, 11]);
    }

    #[test]
    fn test_disconnect_is_error() {
        let mut client = tcp();
        client.on_connect().unwrap();
        client.add_setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, &1i32.to_ne_bytes());
        client.on_disconnect(&[4]);
        assert_eq!(client.state(), TcpState::Error);
        // no replay on a dead socket, even with a bogus fd
        client.restore_options(&[-1]).unwrap();
    }

    #[test]
    fn test_setsockopt_overwrites() {
        let mut sk = tcp();
        sk.add_setsockopt(libc::SOL_SOCKET, libc::SO_RCVBUF, &1024i32.to_ne_bytes());
        sk.add_setsockopt(libc::SOL_SOCKET, libc::SO_RCVBUF, &4096i32.to_ne_bytes());
        assert_eq!(sk.sock_options().len(), 1);
        assert_eq!(
            sk.sock_options()[&(libc::SOL_SOCKET, libc::SO_RCVBUF)],
            4096i32.to_ne_bytes().to_vec()
        );
    }

    #[test]
    fn test_merge_rejects_mismatch() {
        let mut a = tcp();
        let b = TcpConnection::new(libc::AF_INET6, libc::SOCK_STREAM, 0);
        assert!(a.merge_with(&b).unwrap_err().is_fatal());

        let c = TcpConnection::new(libc::AF_INET, libc::SOCK_DGRAM, 0);
        assert!(a.merge_with(&c).is_err());
    }

    #[test]
    fn test_merge_unions_options_and_state() {
        let mut a = tcp();
        a.add_setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, &1i32.to_ne_bytes());

        let mut b = tcp();
        b.on_bind(&addr()).unwrap();
        b.on_listen(3).unwrap();
        b.add_setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, &1i32.to_ne_bytes());
        b.add_setsockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, &0i32.to_ne_bytes());

        a.merge_with(&b).unwrap();
        assert_eq!(a.sock_options().len(), 2);
        assert_eq!(
            a.sock_options()[&(libc::SOL_SOCKET, libc::SO_KEEPALIVE)],
            1i32.to_ne_bytes().to_vec()
        );
        assert_eq!(a.state(), TcpState::Listening);
        assert_eq!(a.listen_backlog(), 3);
        assert_eq!(a.bound_addr(), b.bound_addr());
    }

    #[test]
    fn test_entry_round_trip() {
        let mut sk = tcp();
        sk.on_bind(&addr()).unwrap();
        sk.on_listen(5).unwrap();
        sk.add_setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &1i32.to_ne_bytes());

        let remote = ConnectionIdentifier::new(ProcessIdentity::new(4, 5, 6), 7);
        let child = TcpConnection::accepted(&sk, remote).unwrap();

        for conn in [sk, child] {
            assert_eq!(TcpConnection::from_entry(&conn.to_entry()), conn);
        }
    }

    #[test]
    fn test_entry_round_trip_stream_states() {
        let mut connected = TcpConnection::new(libc::AF_INET6, libc::SOCK_STREAM, 0);
        connected.on_connect().unwrap();
        connected.add_setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, &1i32.to_ne_bytes());

        let mut inherited = TcpConnection::new(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        inherited.mark_preexisting();

        let mut broken = tcp();
        broken.on_connect().unwrap();
        broken.on_disconnect(&[12]);

        let mut handshaken = tcp();
        handshaken.on_connect().unwrap();
        let peer_process = ProcessIdentity::new(0xab, 31, 0x77);
        handshaken.peer = Some(PeerRecord {
            conn: ConnectionIdentifier::new(peer_process.clone(), 3),
            process: peer_process,
        });

        let cases = [
            (connected, TcpState::Connected),
            (inherited, TcpState::PreExisting),
            (broken, TcpState::Error),
            (handshaken, TcpState::Connected),
        ];
        for (conn, state) in cases {
            let back = TcpConnection::from_entry(&conn.to_entry());
            assert_eq!(back.state(), state);
            assert_eq!(back.peer(), conn.peer());
            assert_eq!(back, conn);
        }
    }
}
