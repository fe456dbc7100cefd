//! Kernel buffer draining, as seen from the connection core.

use std::os::unix::io::RawFd;

use crate::error::Result;

/// Empties in-flight socket data into the checkpoint image before the
/// descriptor is frozen. The drainer owns its own blocking and timeout
/// policy; registration only queues the descriptor.
pub trait KernelBufferDrainer {
    fn register_for_drain(&mut self, fd: RawFd) -> Result<()>;
}
