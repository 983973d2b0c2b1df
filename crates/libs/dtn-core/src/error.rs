/// Error kinds shared across the router core, per the error-handling design.
///
/// Crate-local error enums (`StoreError`, `ClError`, `ApiError`) convert into
/// this one at their boundary instead of every crate reinventing the same
/// taxonomy.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DtnError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("store error: {0}")]
    Store(String),

    #[error("network I/O error: {0}")]
    NetIo(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("policy reject: {0}")]
    PolicyReject(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

/// Bundle codec failures, matching the decoder contract in §4.1.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("fewer bytes than declared by a length field")]
    Short,

    #[error("reserved or contradictory flag bits")]
    BadFlags,

    #[error("dictionary offset out of range")]
    BadDict,

    #[error("unknown primary block version")]
    BadVersion,

    #[error("sdnv value overflowed 64 bits")]
    SdnvOverflow,

    #[error("reassembly interval overlaps an already-received range")]
    OverlappingFragment,
}

pub type DtnResult<T> = Result<T, DtnError>;
