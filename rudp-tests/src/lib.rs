//! Fixtures shared by the integration tests
//!
//! [`Wire`] is an in-memory one-way link that can drop datagrams on a fixed
//! schedule; [`Peer`] bundles a connection with its receive handles so two
//! peers can be stepped against each other under a [`ManualClock`].

use bytes::Bytes;
use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use rudp_io::ManualClock;
use rudp_protocol::{
    Connection, ConnectionError, ConnectionEvent, DatagramSink, Delivery, InboundShard,
    TransportConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One direction of an in-memory link
///
/// With a loss period of `n`, every `n`th datagram handed to the wire is
/// silently discarded (0 disables loss, 1 drops everything).
#[derive(Default)]
pub struct Wire {
    queue: Mutex<Vec<Vec<u8>>>,
    offered: AtomicUsize,
    dropped: AtomicUsize,
    loss_every: AtomicUsize,
}

impl Wire {
    pub fn lossless() -> Arc<Self> {
        Arc::new(Wire::default())
    }

    pub fn lossy(every: usize) -> Arc<Self> {
        let wire = Wire::default();
        wire.set_loss(every);
        Arc::new(wire)
    }

    pub fn set_loss(&self, every: usize) {
        self.loss_every.store(every, Ordering::SeqCst);
    }

    /// Datagrams in flight, oldest first
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl DatagramSink for Wire {
    fn send_datagram(&self, datagram: &[u8]) -> bool {
        let n = self.offered.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.loss_every.load(Ordering::SeqCst);
        if every > 0 && n % every == 0 {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        } else {
            self.queue.lock().push(datagram.to_vec());
        }
        // a lossy network still accepts the send
        true
    }
}

/// Swap neighbouring datagrams so no two consecutive ones arrive in order
pub fn shuffle_pairs(mut datagrams: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    for pair in datagrams.chunks_mut(2) {
        pair.reverse();
    }
    datagrams
}

/// A connection with every handle needed to drive it by hand
pub struct Peer {
    pub conn: Connection,
    pub shards: Vec<InboundShard>,
    pub delivery: Delivery,
    /// Outbound link
    pub wire: Arc<Wire>,
    pub events: Receiver<ConnectionEvent>,
    /// Ordered payloads delivered so far
    pub delivered: Vec<Bytes>,
    /// Unordered payloads delivered so far
    pub unordered: Vec<Bytes>,
}

impl Peer {
    pub fn new(config: TransportConfig, clock: Arc<ManualClock>, wire: Arc<Wire>) -> Self {
        let (tx, events) = channel::unbounded();
        let (conn, shards, delivery) = Connection::new(config, wire.clone(), clock, Arc::new(tx))
            .expect("test config is valid");
        Peer {
            conn,
            shards,
            delivery,
            wire,
            events,
            delivered: Vec::new(),
            unordered: Vec::new(),
        }
    }

    /// Hand datagrams to the shards round-robin
    pub fn receive(&mut self, datagrams: Vec<Vec<u8>>) {
        let shard_count = self.shards.len();
        for (i, datagram) in datagrams.iter().enumerate() {
            match self.shards[i % shard_count].on_datagram(datagram) {
                Ok(_) | Err(ConnectionError::Closed) => {}
                Err(e) => panic!("unexpected inbound error: {e}"),
            }
        }
    }

    /// Drain the reorder buffer into `delivered` / `unordered`
    pub fn deliver(&mut self) -> usize {
        let drain = self.delivery.poll().expect("drain succeeds");
        let count = drain.ordered.len() + drain.unordered.len();
        self.delivered
            .extend(drain.ordered.into_iter().map(|d| d.payload));
        self.unordered.extend(drain.unordered);
        count
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.try_iter().collect()
    }
}

/// Move everything `from` has sent into `to`, then let `to` deliver
pub fn carry(from: &Peer, to: &mut Peer, reorder: bool) {
    let mut datagrams = from.wire.take();
    if reorder {
        datagrams = shuffle_pairs(datagrams);
    }
    to.receive(datagrams);
    to.deliver();
}

/// Payload for message number `n`
pub fn numbered(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Decode a payload built by [`numbered`]
pub fn number_of(payload: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[..4]);
    u32::from_be_bytes(raw)
}
