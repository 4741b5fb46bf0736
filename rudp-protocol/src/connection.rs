//! Connection glue
//!
//! Ties the send engine, the reorder buffer and the collaborator seams into
//! one logical connection. The pieces are handed out separately so each can
//! live on the thread that drives it:
//!
//! * [`Connection`]: application sends and the retransmission tick
//! * [`InboundShard`]: one per I/O thread, fed every received datagram
//! * [`Delivery`]: the single consumer draining in-order payloads

use crate::config::{ConfigError, TransportConfig};
use crate::event::EventHandler;
use crate::header::{Datagram, HeaderError};
use crate::loss::LossRange;
use crate::receive::{reorder_buffer, Drain, ReceiveError, ReorderConsumer, ShardWriter};
use crate::rtt::LinkHealth;
use crate::send::{SendEngine, SendError};
use crate::sequence::Seq;
use crate::transport::{Clock, DatagramSink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sending and receiving
    Open,
    /// Retransmission backoff exceeded the ceiling
    TimedOut,
    /// Closed locally
    Closed,
}

/// Connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Receive error: {0}")]
    Receive(#[from] ReceiveError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<HeaderError> for ConnectionError {
    fn from(err: HeaderError) -> Self {
        ConnectionError::Receive(err.into())
    }
}

/// How a payload travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    /// Sequenced, acknowledged, retransmitted, delivered in order
    #[default]
    Ordered,
    /// Fire and forget, delivered as it arrives
    Unordered,
}

/// Outcome of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Sequence number assigned (ordered sends only)
    pub seq: Option<Seq>,
    /// Whether the raw sink accepted the first transmission
    pub transmitted: bool,
}

/// What happened to one inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Pure ack completed a pending send
    Acked(Seq),
    /// Pure ack for a sequence that was not pending
    StaleAck(Seq),
    /// Payload buffered in the given receive slot
    Buffered(usize),
    /// Ordered payload already buffered; dropped, acked once delivered
    Duplicate(Seq),
    /// Ordered payload already delivered; re-acked and dropped
    Late(Seq),
    /// Unordered payload dropped for lack of a free slot
    Dropped,
}

/// Connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Data datagrams sent for the first time
    pub packets_sent: u64,
    /// Data datagrams received (before duplicate filtering)
    pub packets_received: u64,
    /// Retransmitted datagrams
    pub retransmitted: u64,
    /// Acks that completed a pending send
    pub acks_received: u64,
    /// Acks emitted for delivered or late ordered data
    pub acks_sent: u64,
    /// Ordered datagrams dropped as duplicates
    pub duplicates: u64,
    /// Unordered datagrams dropped for lack of a slot
    pub backpressure_drops: u64,
    /// Acks for sequences that were not pending
    pub stale_acks: u64,
    /// Payload bytes accepted for sending
    pub bytes_sent: u64,
    /// Payload bytes delivered to the application
    pub bytes_received: u64,
    /// Ordered sends awaiting an ack
    pub in_flight: usize,
    /// Current RTT estimate (sentinel once timed out)
    pub rtt_ms: u64,
    pub state: ConnectionState,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    retransmitted: AtomicU64,
    acks_received: AtomicU64,
    acks_sent: AtomicU64,
    duplicates: AtomicU64,
    backpressure_drops: AtomicU64,
    stale_acks: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

struct SendState {
    engine: SendEngine,
    next_seq: Seq,
}

struct Core {
    config: TransportConfig,
    sink: Arc<dyn DatagramSink>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventHandler>,
    health: Arc<LinkHealth>,
    send: Mutex<SendState>,
    closed: AtomicBool,
    timeout_reported: AtomicBool,
    counters: Counters,
}

impl Core {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else if self.health.is_timed_out() {
            ConnectionState::TimedOut
        } else {
            ConnectionState::Open
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    /// Ack an ordered datagram unless the link is already dead
    fn send_ack(&self, seq: Seq) {
        if self.health.is_timed_out() {
            return;
        }
        if self.sink.send_datagram(&SendEngine::ack_datagram(seq)) {
            Counters::bump(&self.counters.acks_sent, 1);
        }
    }

    fn report_timeout(&self, rtt_ms: u64) {
        if !self.timeout_reported.swap(true, Ordering::AcqRel) {
            tracing::warn!(rtt_ms, "connection timed out");
            self.events.on_timeout(rtt_ms);
        }
    }
}

/// Sending half of a connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    core: Arc<Core>,
}

impl Connection {
    /// Create a connection and its receive handles
    ///
    /// Returns one [`InboundShard`] per configured shard and the single
    /// [`Delivery`] consumer.
    ///
    /// Sequence numbering starts at 0 on both sides, so a new connection only
    /// pairs with a peer connection that is also new.
    pub fn new(
        config: TransportConfig,
        sink: Arc<dyn DatagramSink>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventHandler>,
    ) -> Result<(Connection, Vec<InboundShard>, Delivery), ConfigError> {
        config.validate()?;

        let health = Arc::new(LinkHealth::new(config.initial_rtt_ms));
        let engine = SendEngine::with_rtt(
            Arc::clone(&health),
            config.initial_rtt_ms,
            config.min_rtt_ms,
        );
        let (writers, consumer) = reorder_buffer(config.shard_count);

        let core = Arc::new(Core {
            config,
            sink,
            clock,
            events,
            health,
            send: Mutex::new(SendState {
                engine,
                next_seq: Seq::default(),
            }),
            closed: AtomicBool::new(false),
            timeout_reported: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let shards = writers
            .into_iter()
            .map(|writer| InboundShard {
                core: Arc::clone(&core),
                writer,
            })
            .collect();
        let delivery = Delivery {
            core: Arc::clone(&core),
            consumer,
        };

        Ok((Connection { core }, shards, delivery))
    }

    /// Transport configuration this connection runs with
    pub fn config(&self) -> &TransportConfig {
        &self.core.config
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Current RTT estimate
    pub fn rtt_ms(&self) -> u64 {
        self.core.health.rtt_ms()
    }

    /// Next sequence number an ordered send will use
    pub fn next_seq(&self) -> Seq {
        self.core.send.lock().next_seq
    }

    /// Send one payload
    ///
    /// Ordered sends take the next sequence number, which only advances on
    /// success. `WindowFull` means the caller has to wait for acks.
    pub fn send(&self, payload: &[u8], reliability: Reliability) -> Result<SendReceipt, ConnectionError> {
        let core = &*self.core;
        core.ensure_open()?;

        let now = core.now_ms();
        let mut state = core.send.lock();

        let (slot, seq) = match reliability {
            Reliability::Ordered => {
                let seq = state.next_seq;
                let slot = state.engine.stage(payload, true, seq, now)?;
                state.next_seq = seq.next();
                (slot, Some(seq))
            }
            Reliability::Unordered => (state.engine.stage(payload, false, Seq::default(), now)?, None),
        };

        let transmitted = core.sink.send_datagram(state.engine.datagram(slot));
        drop(state);

        Counters::bump(&core.counters.packets_sent, 1);
        Counters::bump(&core.counters.bytes_sent, payload.len() as u64);

        Ok(SendReceipt { seq, transmitted })
    }

    /// Run one retransmission scan and resend whatever is due
    ///
    /// On timeout every pending send is discarded, `on_timeout` fires once
    /// and the error is returned. A timed-out connection stays dead: sends and
    /// scans keep failing, and both ends have to be replaced by new
    /// connections.
    pub fn poll_retransmit(&self) -> Result<usize, ConnectionError> {
        let core = &*self.core;
        core.ensure_open()?;

        let now = core.now_ms();
        let mut state = core.send.lock();

        match state.engine.scan_for_resend(core.config.timeout_ceiling_ms, now) {
            Ok(report) => {
                for entry in &report.entries {
                    core.sink.send_datagram(&entry.datagram);
                }
                Counters::bump(&core.counters.retransmitted, report.len() as u64);
                Ok(report.len())
            }
            Err(SendError::TimedOut { rtt_ms }) => {
                let dropped = state.engine.discard_all();
                drop(state);
                if dropped > 0 {
                    tracing::debug!(dropped, "discarded pending sends after timeout");
                }
                core.report_timeout(rtt_ms);
                Err(SendError::TimedOut { rtt_ms }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of ordered sends awaiting an ack
    pub fn in_flight(&self) -> usize {
        self.core.send.lock().engine.pending()
    }

    /// Close the connection, discarding pending sends
    ///
    /// Fires `on_closed` on the first call only.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.core.send.lock().engine.discard_all();
        tracing::info!(dropped, "connection closed");
        self.core.events.on_closed();
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let core = &*self.core;
        let c = &core.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        ConnectionStats {
            packets_sent: load(&c.packets_sent),
            packets_received: load(&c.packets_received),
            retransmitted: load(&c.retransmitted),
            acks_received: load(&c.acks_received),
            acks_sent: load(&c.acks_sent),
            duplicates: load(&c.duplicates),
            backpressure_drops: load(&c.backpressure_drops),
            stale_acks: load(&c.stale_acks),
            bytes_sent: load(&c.bytes_sent),
            bytes_received: load(&c.bytes_received),
            in_flight: self.in_flight(),
            rtt_ms: core.health.rtt_ms(),
            state: core.state(),
        }
    }
}

/// Receive path of one I/O thread
pub struct InboundShard {
    core: Arc<Core>,
    writer: ShardWriter,
}

impl InboundShard {
    pub fn shard_id(&self) -> usize {
        self.writer.shard_id()
    }

    /// Handle one datagram read from the network
    ///
    /// Pure acks complete pending sends. Ordered data is buffered and acked
    /// by [`Delivery::poll`] once it reaches the application, so an ack always
    /// means delivered. A late copy of something already delivered is acked
    /// again right away since the peer evidently lost the first ack.
    /// Unordered data is buffered without an ack.
    pub fn on_datagram(&mut self, datagram: &[u8]) -> Result<Inbound, ConnectionError> {
        let core = &*self.core;
        core.ensure_open()?;

        match Datagram::parse(datagram)? {
            Datagram::Ack(seq) => {
                let now = core.now_ms();
                let completed = core.send.lock().engine.complete(seq, now);
                match completed {
                    Ok(()) => {
                        Counters::bump(&core.counters.acks_received, 1);
                        core.events.on_acknowledged(seq);
                        Ok(Inbound::Acked(seq))
                    }
                    Err(SendError::NotPending(_)) => {
                        tracing::debug!(seq = %seq, "stale or duplicate ack");
                        Counters::bump(&core.counters.stale_acks, 1);
                        Ok(Inbound::StaleAck(seq))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Datagram::Ordered { seq, payload } => {
                Counters::bump(&core.counters.packets_received, 1);
                match self.writer.push_ordered(seq, payload) {
                    Ok(slot) => Ok(Inbound::Buffered(slot)),
                    Err(ReceiveError::DuplicateOrSlotBusy(_)) => {
                        Counters::bump(&core.counters.duplicates, 1);
                        Ok(Inbound::Duplicate(seq))
                    }
                    Err(ReceiveError::AlreadyDelivered(_)) => {
                        Counters::bump(&core.counters.duplicates, 1);
                        core.send_ack(seq);
                        Ok(Inbound::Late(seq))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Datagram::Unordered { payload } => {
                Counters::bump(&core.counters.packets_received, 1);
                match self.writer.push_unordered(payload) {
                    Ok(slot) => Ok(Inbound::Buffered(slot)),
                    Err(ReceiveError::Backpressure(_)) => {
                        Counters::bump(&core.counters.backpressure_drops, 1);
                        Ok(Inbound::Dropped)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Single consumer of received payloads
pub struct Delivery {
    core: Arc<Core>,
    consumer: ReorderConsumer,
}

impl Delivery {
    /// Collect the next in-order run and every unordered arrival
    ///
    /// Every ordered payload handed out is acked to the peer. A window
    /// overrun resets the receive window at the current cursor, fires
    /// `on_window_reset` and is returned as an error.
    pub fn poll(&mut self) -> Result<Drain, ConnectionError> {
        let core = &*self.core;

        match self.consumer.drain() {
            Ok(drain) => {
                for delivered in &drain.ordered {
                    core.send_ack(delivered.seq);
                }
                let bytes: usize = drain
                    .ordered
                    .iter()
                    .map(|d| d.payload.len())
                    .chain(drain.unordered.iter().map(|p| p.len()))
                    .sum();
                Counters::bump(&core.counters.bytes_received, bytes as u64);
                Counters::bump(&core.counters.duplicates, drain.duplicates as u64);
                Ok(drain)
            }
            Err(ReceiveError::WindowOverrun) => {
                let cursor = self.consumer.cursor();
                let dropped = self.consumer.reset(cursor);
                tracing::warn!(cursor = %cursor, dropped, "receive window overrun, window reset");
                core.events.on_window_reset();
                Err(ReceiveError::WindowOverrun.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lowest sequence number not yet delivered
    pub fn cursor(&self) -> Seq {
        self.consumer.cursor()
    }

    /// Sequences known to be missing ahead of the cursor
    pub fn missing(&self) -> Vec<LossRange> {
        self.consumer.missing()
    }
}
