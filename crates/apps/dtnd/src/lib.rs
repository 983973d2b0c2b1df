//! Shared pieces of the `dtnd` binary: configuration loading is split out of
//! `src/bin/dtnd.rs` so it can be unit-tested without pulling in the
//! runtime bootstrap.

pub mod config;

pub use config::DaemonConfig;
