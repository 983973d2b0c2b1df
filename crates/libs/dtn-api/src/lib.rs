//! API adapter (§4.9): a framed msgpack request/response protocol over a
//! loopback TCP socket translating client calls (`open`, `register`,
//! `send`, `recv`, `begin_poll`, ...) into the daemon's own event queue, so
//! application clients never touch `DaemonContext` directly.

pub mod client;
pub mod error;
pub mod protocol;
pub mod session;
mod wire;

pub use client::ApiClient;
pub use error::{ApiError, StatusCode};
pub use protocol::{BundleSpec, RegInfo, Request, Response, WireBundle, WireFailureAction, WirePriority};
pub use session::ApiServer;
