//! RUDP - Reliable UDP
//!
//! High-level API: a threaded [`Endpoint`] running one reliable-UDP
//! connection over a socket, plus re-exports of the engine and I/O crates.

pub use rudp_io as io;
pub use rudp_protocol as protocol;

pub mod endpoint;

pub use endpoint::{Endpoint, EndpointError, Message};

// Re-export commonly used types
pub use io::RudpSocket;
pub use protocol::{
    ConnectionEvent, ConnectionState, ConnectionStats, MessageRegistry, Reliability, Seq,
    TransportConfig, MAX_PAYLOAD,
};
