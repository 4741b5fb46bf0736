//! Collaborator seams
//!
//! The engines never touch a socket or a system clock directly. Raw I/O and
//! time come in through these two traits so the same connection logic runs
//! over UDP in production and over in-memory channels in tests.

use std::sync::Arc;

/// Raw datagram output
pub trait DatagramSink: Send + Sync {
    /// Hand one complete datagram to the network.
    ///
    /// Returns false if the datagram could not be sent. Failures are not
    /// retried here; acked datagrams are picked up by the retransmission
    /// scan.
    fn send_datagram(&self, datagram: &[u8]) -> bool;
}

impl<T: DatagramSink + ?Sized> DatagramSink for Arc<T> {
    fn send_datagram(&self, datagram: &[u8]) -> bool {
        (**self).send_datagram(datagram)
    }
}

/// Monotonic millisecond clock
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin. Never goes backwards.
    fn now_ms(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}
