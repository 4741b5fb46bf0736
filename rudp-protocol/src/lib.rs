//! Reliable UDP Protocol Core
//!
//! Sans-IO engine for a lightweight reliable transport over datagrams:
//! 1-byte ack header codec, 64-wide wrapping sequence window, sharded receive
//! reorder buffer, and send/retransmission engine with RTT backoff. Time is
//! passed in as milliseconds and raw I/O goes through [`DatagramSink`].

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod event;
pub mod header;
pub mod loss;
pub mod receive;
pub mod rtt;
pub mod send;
pub mod sequence;
pub mod transport;

pub use config::{ConfigError, TransportConfig};
pub use connection::{
    Connection, ConnectionError, ConnectionState, ConnectionStats, Delivery, Inbound,
    InboundShard, Reliability, SendReceipt,
};
pub use dispatch::{decode_frame, encode_frame, DispatchError, MessageKind, MessageRegistry};
pub use event::{ConnectionEvent, EventHandler, EventQueue, NoopHandler};
pub use header::{AckHeader, Datagram, HeaderError, HEADER_SIZE, MAX_DATAGRAM, MAX_PAYLOAD};
pub use loss::{LossMarks, LossRange};
pub use receive::{reorder_buffer, Delivered, Drain, ReceiveError, ReorderConsumer, ShardWriter};
pub use rtt::{LinkHealth, RTT_TIMED_OUT};
pub use send::{Resend, ResendReport, SendEngine, SendError};
pub use sequence::{Seq, HALF_WINDOW, WINDOW};
pub use transport::{Clock, DatagramSink};
