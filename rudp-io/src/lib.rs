//! Reliable UDP I/O and Platform Abstraction
//!
//! UDP socket wrapper implementing the raw datagram seam, and the clocks and
//! timers the engines are driven by.

pub mod socket;
pub mod time;

pub use socket::{RudpSocket, SocketError};
pub use time::{ManualClock, MonotonicClock, Timer};
