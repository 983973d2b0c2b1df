//! Connection-oriented convergence layer framework realized over TCP
//! (§4.5): contact header negotiation, block framing with cumulative acks,
//! and reactive fragmentation on a broken connection.

pub mod cl;
pub mod connection;
pub mod error;
pub mod framing;
pub mod header;

pub use cl::TcpConvergenceLayer;
pub use connection::{Command, ConnectionParams};
pub use error::ClError;
pub use framing::{Frame, MessageType};
pub use header::{ContactHeader, ContactHeaderFlags};
