//! Integration tests for TCP restore and the restart handshake
//!
//! Listening sockets must come back bound and listening without any peer
//! involvement; stream sockets exchange identities over a live socketpair.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::thread;

use ckptconn::conn::{PeerRecord, TcpConnection, TcpState};
use ckptconn::rewire::{ConnectionRewirer, RewireRequest, RewireRole};
use ckptconn::{
    sys, ConnError, Connection, ConnectionIdentifier, ConnectionTable, Payload, ProcessIdentity,
};

/// Rewirer that fails the test if anything asks for a peer.
struct NoPeers;

impl ConnectionRewirer for NoPeers {
    fn register_for_restore(
        &mut self,
        request: RewireRequest,
        _fds: &[RawFd],
    ) -> ckptconn::Result<()> {
        panic!("listener restore asked for a peer: {:?}", request);
    }
}

#[derive(Default)]
struct Recorder(Vec<(RewireRequest, Vec<RawFd>)>);

impl ConnectionRewirer for Recorder {
    fn register_for_restore(
        &mut self,
        request: RewireRequest,
        fds: &[RawFd],
    ) -> ckptconn::Result<()> {
        self.0.push((request, fds.to_vec()));
        Ok(())
    }
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn restarted(host: u64, pid: i32) -> ProcessIdentity {
    let mut id = ProcessIdentity::new(host, pid, 0x6000);
    id.increment_generation();
    id
}

#[test]
fn test_listener_restored_without_peer() {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let mut tcp = TcpConnection::new(libc::AF_INET, libc::SOCK_STREAM, 0);
    tcp.on_bind(&sys::sockaddr_bytes(&addr)).unwrap();
    tcp.on_listen(5).unwrap();

    let owner = ProcessIdentity::new(0x1234, 321, 0x99);
    let conn = Connection::new(ConnectionIdentifier::new(owner, 1), Payload::Tcp(tcp));

    // what the restarted process reads back from its image
    let mut restored = Connection::decode(&conn.encode()).unwrap();
    assert_eq!(restored, conn);

    let placeholder = sys::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
    restored.restore(&[placeholder], &mut NoPeers).unwrap();
    restored.restore_options(&[placeholder]).unwrap();

    let bound = sys::sockaddr_to_std(&sys::sock_name(placeholder).unwrap()).unwrap();
    assert_eq!(bound.port(), port);
    assert_eq!(
        sys::get_sockopt_int(placeholder, libc::SOL_SOCKET, libc::SO_ACCEPTCONN).unwrap(),
        1
    );
    assert_eq!(restored.as_tcp().unwrap().state(), TcpState::Listening);

    // and it really accepts
    TcpStream::connect(addr).unwrap();
    sys::close(placeholder);
}

#[test]
fn test_stream_sockets_register_with_rewirer() {
    let owner = ProcessIdentity::new(0x1, 10, 0x2);
    let remote = ConnectionIdentifier::new(ProcessIdentity::new(0x3, 20, 0x4), 9);

    let mut listener = TcpConnection::new(libc::AF_INET, libc::SOCK_STREAM, 0);
    listener.on_bind(&sys::sockaddr_bytes(&"127.0.0.1:0".parse().unwrap())).unwrap();
    listener.on_listen(1).unwrap();
    let child = TcpConnection::accepted(&listener, remote.clone()).unwrap();

    let mut client = TcpConnection::new(libc::AF_INET, libc::SOCK_STREAM, 0);
    client.on_connect().unwrap();

    let mut table = ConnectionTable::new();
    let child_id = ConnectionIdentifier::new(owner.clone(), 2);
    let client_id = ConnectionIdentifier::new(owner, 3);
    table.insert(Connection::new(child_id.clone(), Payload::Tcp(child)), &[100]).unwrap();
    table.insert(Connection::new(client_id.clone(), Payload::Tcp(client)), &[101, 102]).unwrap();

    let mut rewirer = Recorder::default();
    let report = table.restore(&mut rewirer).unwrap();
    assert_eq!(report.restored, 2);

    assert_eq!(rewirer.0.len(), 2);
    let (accepted, fds) = &rewirer.0[0];
    assert_eq!(accepted.local, child_id);
    assert_eq!(accepted.remote, Some(remote));
    assert_eq!(accepted.role, RewireRole::AcceptedChild);
    assert_eq!(fds, &vec![100]);

    let (connector, fds) = &rewirer.0[1];
    assert_eq!(connector.local, client_id);
    assert_eq!(connector.remote, None);
    assert_eq!(connector.role, RewireRole::Connector);
    assert_eq!(fds, &vec![101, 102]);
}

#[test]
fn test_error_socket_is_skipped() {
    let mut tcp = TcpConnection::new(libc::AF_INET, libc::SOCK_STREAM, 0);
    tcp.on_connect().unwrap();
    tcp.on_disconnect(&[7]);

    let id = ConnectionIdentifier::new(ProcessIdentity::new(5, 5, 5), 1);
    let mut conn = Connection::new(id, Payload::Tcp(tcp));
    conn.restore(&[-1], &mut NoPeers).unwrap();
    conn.restore_options(&[-1]).unwrap();
    assert_eq!(conn.as_tcp().unwrap().state(), TcpState::Error);
}

#[test]
fn test_handshake_between_two_processes() {
    let (a_fd, b_fd) = socketpair();
    let coordinator = ProcessIdentity::new(0xc0, 1, 0xc0);

    let a_proc = restarted(0xa, 100);
    let b_proc = restarted(0xb, 200);
    let a_id = ConnectionIdentifier::new(a_proc.clone(), 1);
    let b_id = ConnectionIdentifier::new(b_proc.clone(), 4);

    let mut client = TcpConnection::new(libc::AF_INET, libc::SOCK_STREAM, 0);
    client.on_connect().unwrap();
    let mut a_table = ConnectionTable::new();
    a_table.insert(Connection::new(a_id.clone(), Payload::Tcp(client)), &[a_fd]).unwrap();

    let mut listener = TcpConnection::new(libc::AF_INET, libc::SOCK_STREAM, 0);
    listener.on_bind(&sys::sockaddr_bytes(&"127.0.0.1:0".parse().unwrap())).unwrap();
    listener.on_listen(1).unwrap();
    // stale remote id from before the restart
    let stale = ConnectionIdentifier::new(ProcessIdentity::new(0xa, 100, 0x6000), 1);
    let child = TcpConnection::accepted(&listener, stale).unwrap();
    let mut b_table = ConnectionTable::new();
    b_table.insert(Connection::new(b_id.clone(), Payload::Tcp(child)), &[b_fd]).unwrap();

    let b_coord = coordinator.clone();
    let b_me = b_proc.clone();
    let other = thread::spawn(move || {
        assert!(b_table.handshake(&b_me, &b_coord).unwrap().is_clean());
        b_table
    });
    assert!(a_table.handshake(&a_proc, &coordinator).unwrap().is_clean());
    let b_table = other.join().unwrap();

    let a_tcp = a_table.get(&a_id).unwrap().as_tcp().unwrap();
    let b_tcp = b_table.get(&b_id).unwrap().as_tcp().unwrap();

    assert_eq!(
        a_tcp.peer(),
        Some(&PeerRecord {
            process: b_proc.clone(),
            conn: b_id.clone()
        })
    );
    assert_eq!(a_tcp.peer().unwrap().process.generation, 1);
    assert_eq!(
        b_tcp.peer(),
        Some(&PeerRecord {
            process: a_proc.clone(),
            conn: a_id.clone()
        })
    );
    assert_eq!(b_tcp.remote_id(), Some(&a_id));

    sys::close(a_fd);
    sys::close(b_fd);
}

#[test]
fn test_two_phase_handshake_in_one_table() {
    // Both ends live in one process: every send must happen before any
    // receive or the first receive would block forever.
    let (a_fd, b_fd) = socketpair();
    let me = restarted(0xd, 300);
    let coordinator = ProcessIdentity::null();

    let mut table = ConnectionTable::new();
    for (seq, fd) in [(1, a_fd), (2, b_fd)] {
        let mut tcp = TcpConnection::new(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        tcp.mark_preexisting();
        let id = ConnectionIdentifier::new(me.clone(), seq);
        table.insert(Connection::new(id, Payload::Tcp(tcp)), &[fd]).unwrap();
    }

    let report = table.handshake(&me, &coordinator).unwrap();
    assert_eq!(report.completed, 2);
    assert!(report.is_clean());

    let first = ConnectionIdentifier::new(me.clone(), 1);
    let second = ConnectionIdentifier::new(me.clone(), 2);
    let peer_of_first = table.get(&first).unwrap().as_tcp().unwrap().peer().unwrap();
    assert_eq!(peer_of_first.conn, second);
    let peer_of_second = table.get(&second).unwrap().as_tcp().unwrap().peer().unwrap();
    assert_eq!(peer_of_second.conn, first);

    sys::close(a_fd);
    sys::close(b_fd);
}

#[test]
fn test_handshake_with_wrong_coordinator_fails() {
    let (a_fd, b_fd) = socketpair();
    let me = restarted(0xe, 400);

    let mut sender = TcpConnection::new(libc::AF_UNIX, libc::SOCK_STREAM, 0);
    sender.on_connect().unwrap();
    let sender = Connection::new(ConnectionIdentifier::new(me.clone(), 1), Payload::Tcp(sender));
    sender
        .send_handshakes(&[a_fd], &me, &ProcessIdentity::new(1, 1, 1))
        .unwrap();

    let mut receiver = TcpConnection::new(libc::AF_UNIX, libc::SOCK_STREAM, 0);
    receiver.on_connect().unwrap();
    let mut receiver = Connection::new(ConnectionIdentifier::new(me, 2), Payload::Tcp(receiver));
    let err = receiver
        .recv_handshakes(&[b_fd], &ProcessIdentity::new(2, 2, 2))
        .unwrap_err();

    assert!(matches!(err, ConnError::Handshake(_)));
    assert!(receiver.as_tcp().unwrap().peer().is_none());

    sys::close(a_fd);
    sys::close(b_fd);
}

#[test]
fn test_malformed_peer_does_not_stop_other_handshakes() {
    let (bad_local, bad_remote) = socketpair();
    let (good_local, good_remote) = socketpair();
    let me = restarted(0xf, 500);
    let peer = restarted(0x10, 600);
    let coordinator = ProcessIdentity::null();

    let mut table = ConnectionTable::new();
    let bad_id = ConnectionIdentifier::new(me.clone(), 1);
    let good_id = ConnectionIdentifier::new(me.clone(), 2);
    for (id, fd) in [(&bad_id, bad_local), (&good_id, good_local)] {
        let mut tcp = TcpConnection::new(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        tcp.on_connect().unwrap();
        table.insert(Connection::new(id.clone(), Payload::Tcp(tcp)), &[fd]).unwrap();
    }

    // one peer speaks something else entirely, the other is well behaved
    sys::write_all(bad_remote, b"garbage!garbage!").unwrap();
    let peer_id = ConnectionIdentifier::new(peer.clone(), 7);
    let mut peer_tcp = TcpConnection::new(libc::AF_UNIX, libc::SOCK_STREAM, 0);
    peer_tcp.on_connect().unwrap();
    Connection::new(peer_id.clone(), Payload::Tcp(peer_tcp))
        .send_handshakes(&[good_remote], &peer, &coordinator)
        .unwrap();

    let report = table.handshake(&me, &coordinator).unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad_id);
    assert!(matches!(report.failed[0].1, ConnError::Handshake(_)));

    assert!(table.get(&bad_id).unwrap().as_tcp().unwrap().peer().is_none());
    assert_eq!(
        table.get(&good_id).unwrap().as_tcp().unwrap().peer(),
        Some(&PeerRecord {
            process: peer,
            conn: peer_id
        })
    );

    for fd in [bad_local, bad_remote, good_local, good_remote] {
        sys::close(fd);
    }
}
