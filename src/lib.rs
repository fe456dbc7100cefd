// Core modules
pub mod conn;
pub mod drain;
pub mod error;
pub mod identity;
pub mod images;
pub mod options;
pub mod proto;
pub mod rewire;
pub mod sys;
pub mod table;

pub use conn::{ConnKind, Connection, Payload};
pub use error::{ConnError, Result};
pub use identity::{ConnectionIdentifier, ProcessContext, ProcessIdentity};
pub use table::ConnectionTable;
