//! Identity model: who owns a connection, and which incarnation.

pub mod conn_id;
pub mod context;
pub mod process;

pub use conn_id::ConnectionIdentifier;
pub use context::ProcessContext;
pub use process::{host_id_from_name, ProcessIdentity};
