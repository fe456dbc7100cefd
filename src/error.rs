use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnError {
    /// The caller drove a connection through an operation its state or kind
    /// does not allow. Never recoverable.
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cannot reopen {path}: {source}")]
    Reopen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Missing execute- or write-access to {path}")]
    DirAccess { path: PathBuf },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    #[error("Image file not found: {path}")]
    ImageNotFound { path: String },

    #[error("Invalid image format: {reason}")]
    InvalidImage { reason: String },

    #[error("Unsupported connection kind: {0}")]
    Unsupported(String),
}

impl ConnError {
    pub fn contract(msg: impl Into<String>) -> Self {
        ConnError::Contract(msg.into())
    }

    /// Errors after which neither checkpoint nor restart can go on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnError::Contract(_) | ConnError::DirAccess { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConnError>;
