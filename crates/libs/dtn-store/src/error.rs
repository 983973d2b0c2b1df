#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema version mismatch: on-disk {on_disk}, code expects {expected}")]
    SchemaMismatch { on_disk: u32, expected: u32 },

    #[error("payload file for bundle {bundle_id} missing or wrong length (expected {expected}, found {found:?})")]
    PayloadMismatch { bundle_id: u64, expected: u64, found: Option<u64> },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<StoreError> for dtn_core::DtnError {
    fn from(err: StoreError) -> Self {
        dtn_core::DtnError::Store(err.to_string())
    }
}
