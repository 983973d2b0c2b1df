//! Error taxonomy for the TCP convergence layer, matching the per-crate
//! `thiserror` enum convention (§7).

use dtn_core::DtnError;

#[derive(Debug, thiserror::Error)]
pub enum ClError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
    #[error("link {0} has no open connection")]
    NoConnection(u32),
    #[error("link {0} already has an open connection")]
    AlreadyConnected(u32),
    #[error("contact {0} is not a currently open connection")]
    NoSuchContact(u64),
}

impl From<ClError> for DtnError {
    fn from(err: ClError) -> Self {
        match err {
            ClError::Io(e) => DtnError::NetIo(e.to_string()),
            ClError::Protocol(msg) => DtnError::Protocol(msg),
            ClError::Closed => DtnError::NetIo("connection closed".into()),
            ClError::NoConnection(id) => DtnError::NotFound(format!("link {id}")),
            ClError::AlreadyConnected(id) => DtnError::AlreadyExists(format!("link {id}")),
            ClError::NoSuchContact(id) => DtnError::NotFound(format!("contact {id}")),
        }
    }
}
