//! Durable store abstraction (§4.2): three opaque key/value tables
//! (`Bundles`, `Registrations`, `Globals`) plus a dedicated payload-file
//! directory, neither of which is transmitted over the wire.

pub mod error;
pub mod payload;
pub mod store;

pub use error::StoreError;
pub use payload::PayloadStore;
pub use store::{SqliteStore, StoreConfig, Table, Tx, SCHEMA_VERSION};
