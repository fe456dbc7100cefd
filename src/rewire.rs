//! Socket rewiring on restart, as seen from the connection core.

use std::fmt;
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::identity::ConnectionIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewireRole {
    Listener,
    Connector,
    AcceptedChild,
}

impl fmt::Display for RewireRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RewireRole::Listener => "listener",
            RewireRole::Connector => "connector",
            RewireRole::AcceptedChild => "accepted-child",
        };
        f.write_str(name)
    }
}

/// What a stream socket asks the rewirer for on restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewireRequest {
    /// The restoring connection's own identifier.
    pub local: ConnectionIdentifier,
    /// Last known identifier of the other end, when this side knows it.
    pub remote: Option<ConnectionIdentifier>,
    pub role: RewireRole,
}

/// Re-establishes peer sockets out of band and installs the live socket on
/// the registered descriptors once the peer is matched.
pub trait ConnectionRewirer {
    fn register_for_restore(&mut self, request: RewireRequest, fds: &[RawFd]) -> Result<()>;
}
