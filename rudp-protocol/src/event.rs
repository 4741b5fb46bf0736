//! Connection notifications

use crate::sequence::Seq;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};

/// Something the application may want to know about a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer acknowledged an ordered send
    Acknowledged(Seq),
    /// Retransmission backoff exceeded the ceiling; the connection is dead
    TimedOut { rtt_ms: u64 },
    /// The connection was closed locally
    Closed,
    /// The receive window was reset after an overrun
    WindowReset,
}

/// Callbacks fired by a connection
///
/// All methods default to doing nothing. They are called from whichever
/// thread triggered the event (an I/O shard, the retransmission tick or the
/// delivery loop), so implementations must not block.
pub trait EventHandler: Send + Sync {
    fn on_acknowledged(&self, _seq: Seq) {}

    /// Terminal: fired once when the connection times out
    fn on_timeout(&self, _final_rtt_ms: u64) {}

    /// Terminal: fired once when the connection is closed
    fn on_closed(&self) {}

    fn on_window_reset(&self) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

/// Forward events into a channel. Events are dropped if the channel is full
/// or disconnected.
impl EventHandler for Sender<ConnectionEvent> {
    fn on_acknowledged(&self, seq: Seq) {
        let _ = self.try_send(ConnectionEvent::Acknowledged(seq));
    }

    fn on_timeout(&self, final_rtt_ms: u64) {
        let _ = self.try_send(ConnectionEvent::TimedOut {
            rtt_ms: final_rtt_ms,
        });
    }

    fn on_closed(&self) {
        let _ = self.try_send(ConnectionEvent::Closed);
    }

    fn on_window_reset(&self) {
        let _ = self.try_send(ConnectionEvent::WindowReset);
    }
}

/// Bounded event queue that never loses a terminal event
///
/// Acks and window resets are dropped while the queue is full. `TimedOut`
/// and `Closed` evict the oldest queued event instead, so a reader that
/// falls behind still learns how the connection ended.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<ConnectionEvent>,
    // receiving end kept for eviction
    rx: Receiver<ConnectionEvent>,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events, and its reader
    pub fn bounded(capacity: usize) -> (Self, Receiver<ConnectionEvent>) {
        let (tx, rx) = channel::bounded(capacity);
        (EventQueue { tx, rx: rx.clone() }, rx)
    }

    fn offer(&self, event: ConnectionEvent) {
        let _ = self.tx.try_send(event);
    }

    fn force(&self, mut event: ConnectionEvent) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.rx.try_recv();
                    event = rejected;
                }
            }
        }
    }
}

impl EventHandler for EventQueue {
    fn on_acknowledged(&self, seq: Seq) {
        self.offer(ConnectionEvent::Acknowledged(seq));
    }

    fn on_timeout(&self, final_rtt_ms: u64) {
        self.force(ConnectionEvent::TimedOut {
            rtt_ms: final_rtt_ms,
        });
    }

    fn on_closed(&self) {
        self.force(ConnectionEvent::Closed);
    }

    fn on_window_reset(&self) {
        self.offer(ConnectionEvent::WindowReset);
    }
}
