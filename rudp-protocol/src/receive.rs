//! Receive Reorder Engine
//!
//! Arriving payloads are buffered per shard: each I/O thread owns one shard
//! and writes only there, while a single consumer drains all shards and
//! hands out the contiguous in-order prefix plus every unordered arrival.
//!
//! Each shard holds `WINDOW` ordered slots (addressed by sequence number) and
//! `WINDOW` unordered slots (first fit). Ownership of a slot passes between
//! the shard's producer and the consumer through its `used` flag:
//!
//! * `used == false`: the producer may write the slot, then publishes it with
//!   a release store of `true`.
//! * `used == true`: the consumer may read the slot, then hands it back with
//!   a release store of `false`.
//!
//! A drain publishes the advanced cursor before it hands the delivered slots
//! back, and producers check slot occupancy before reading the cursor. A
//! producer that finds a just-delivered slot free therefore also sees that its
//! sequence number is behind the cursor.
//!
//! [`ShardWriter`] and [`ReorderConsumer`] are the only handles that touch
//! slot memory. Neither is `Clone` and both take `&mut self`, which keeps one
//! producer per shard and one consumer overall.

use crate::header::{Datagram, HeaderError, HEADER_SIZE, MAX_DATAGRAM, MAX_PAYLOAD};
use crate::loss::{LossMarks, LossRange};
use crate::sequence::{Seq, HALF_WINDOW, WINDOW};
use bytes::Bytes;
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

const SLOTS: usize = WINDOW as usize;

/// Receive slots per shard (ordered + unordered halves)
pub const SLOTS_PER_SHARD: usize = 2 * SLOTS;

/// Receive engine errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("No free unordered slot in shard {0}")]
    Backpressure(usize),

    #[error("Sequence {0} is already buffered")]
    DuplicateOrSlotBusy(Seq),

    #[error("Sequence {0} was already delivered")]
    AlreadyDelivered(Seq),

    #[error("Buffered run covers the whole window")]
    WindowOverrun,

    #[error("Pure ack for sequence {0} on the data path")]
    UnexpectedAck(Seq),

    #[error("Malformed datagram: {0}")]
    Malformed(#[from] HeaderError),
}

struct SlotBuf {
    data: Box<[u8]>,
    len: usize,
}

struct Slot {
    used: AtomicBool,
    buf: UnsafeCell<SlotBuf>,
}

// SAFETY: `buf` is only accessed by the side that currently owns the slot
// according to `used` (see module docs); the acquire/release pair on `used`
// orders the producer's writes before the consumer's reads and vice versa.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Slot {
            used: AtomicBool::new(false),
            buf: UnsafeCell::new(SlotBuf {
                data: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
                len: 0,
            }),
        }
    }

    #[inline]
    fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    /// Producer side. Copies `payload` in and publishes the slot; returns
    /// false if the slot still belongs to the consumer.
    fn publish(&self, payload: &[u8]) -> bool {
        if self.is_used() {
            return false;
        }
        // SAFETY: the slot is free, so it belongs to this shard's producer,
        // and the caller holds that shard's unique `&mut ShardWriter`.
        let buf = unsafe { &mut *self.buf.get() };
        buf.data[..payload.len()].copy_from_slice(payload);
        buf.len = payload.len();
        self.used.store(true, Ordering::Release);
        true
    }

    /// Consumer side. Copies the payload out, leaving the slot published.
    fn read(&self) -> Option<Bytes> {
        if !self.is_used() {
            return None;
        }
        // SAFETY: the slot is published, so it belongs to the consumer, and
        // the caller holds the unique `&mut ReorderConsumer`.
        let buf = unsafe { &*self.buf.get() };
        Some(Bytes::copy_from_slice(&buf.data[..buf.len]))
    }

    /// Consumer side. Copies the payload out and frees the slot.
    fn take(&self) -> Option<Bytes> {
        let payload = self.read()?;
        self.used.store(false, Ordering::Release);
        Some(payload)
    }

    /// Consumer side. Frees a published slot without reading it.
    fn discard(&self) -> bool {
        if !self.is_used() {
            return false;
        }
        self.used.store(false, Ordering::Release);
        true
    }
}

struct Shard {
    ordered: Box<[Slot]>,
    unordered: Box<[Slot]>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            ordered: (0..SLOTS).map(|_| Slot::new()).collect(),
            unordered: (0..SLOTS).map(|_| Slot::new()).collect(),
        }
    }
}

struct Shared {
    shards: Box<[Shard]>,
    loss: LossMarks,
    /// Consumer's cursor, published for producers' stale checks
    cursor: AtomicU8,
}

impl Shared {
    fn any_holds(&self, seq: Seq) -> bool {
        self.shards
            .iter()
            .any(|shard| shard.ordered[seq.index()].is_used())
    }
}

/// Create a reorder buffer with `shard_count` producer handles and one
/// consumer handle.
///
/// # Panics
/// Panics if `shard_count` is zero
pub fn reorder_buffer(shard_count: usize) -> (Vec<ShardWriter>, ReorderConsumer) {
    assert!(shard_count > 0, "reorder buffer needs at least one shard");

    let shared = Arc::new(Shared {
        shards: (0..shard_count).map(|_| Shard::new()).collect(),
        loss: LossMarks::new(),
        cursor: AtomicU8::new(0),
    });

    let writers = (0..shard_count)
        .map(|id| ShardWriter {
            id,
            shared: Arc::clone(&shared),
        })
        .collect();

    let consumer = ReorderConsumer {
        shared,
        cursor: Seq::default(),
    };

    (writers, consumer)
}

/// Producer handle for one shard
pub struct ShardWriter {
    id: usize,
    shared: Arc<Shared>,
}

impl ShardWriter {
    /// Shard this writer owns
    pub fn shard_id(&self) -> usize {
        self.id
    }

    /// Buffer an inbound data datagram (header byte included)
    ///
    /// Returns the receive slot index the payload landed in:
    /// `shard_id * SLOTS_PER_SHARD + seq` for ordered datagrams and
    /// `shard_id * SLOTS_PER_SHARD + WINDOW + i` for unordered ones.
    pub fn push(&mut self, datagram: &[u8]) -> Result<usize, ReceiveError> {
        match Datagram::parse(datagram)? {
            Datagram::Ordered { seq, payload } => self.push_ordered(seq, payload),
            Datagram::Unordered { payload } => self.push_unordered(payload),
            Datagram::Ack(seq) => Err(ReceiveError::UnexpectedAck(seq)),
        }
    }

    /// Buffer an ordered payload for `seq`
    pub fn push_ordered(&mut self, seq: Seq, payload: &[u8]) -> Result<usize, ReceiveError> {
        check_len(payload)?;
        let shared = &*self.shared;

        // occupancy first, then the cursor (see module docs)
        if shared.any_holds(seq) {
            tracing::debug!(shard = self.id, seq = %seq, "duplicate ordered datagram");
            return Err(ReceiveError::DuplicateOrSlotBusy(seq));
        }

        let cursor = Seq::from(shared.cursor.load(Ordering::Acquire));
        let ahead = seq.offset_from(cursor);

        // Anything half a window or more "ahead" is really behind the cursor:
        // it was delivered already and this is a late retransmission.
        if ahead >= HALF_WINDOW {
            tracing::debug!(shard = self.id, seq = %seq, cursor = %cursor, "late retransmission");
            return Err(ReceiveError::AlreadyDelivered(seq));
        }

        if !shared.shards[self.id].ordered[seq.index()].publish(payload) {
            return Err(ReceiveError::DuplicateOrSlotBusy(seq));
        }
        fence(Ordering::SeqCst);
        shared.loss.clear(seq);

        let mut gap = cursor;
        let mut marked = false;
        for _ in 0..ahead {
            if !shared.any_holds(gap) {
                shared.loss.mark(gap);
                marked = true;
            }
            gap = gap.next();
        }

        // A gap may have been filled or delivered while we walked; whoever did
        // that cleared its mark after a fence, so either it saw our mark or we
        // see its update here.
        if marked {
            fence(Ordering::SeqCst);
            let now = Seq::from(shared.cursor.load(Ordering::Acquire));
            let mut gap = cursor;
            for _ in 0..ahead {
                if shared.loss.is_marked(gap)
                    && (shared.any_holds(gap) || gap.offset_from(now) >= HALF_WINDOW)
                {
                    shared.loss.clear(gap);
                }
                gap = gap.next();
            }
        }

        tracing::trace!(shard = self.id, seq = %seq, len = payload.len(), "buffered ordered");
        Ok(self.id * SLOTS_PER_SHARD + seq.index())
    }

    /// Buffer an unordered payload in the first free unordered slot
    pub fn push_unordered(&mut self, payload: &[u8]) -> Result<usize, ReceiveError> {
        check_len(payload)?;
        let shard = &self.shared.shards[self.id];
        match shard.unordered.iter().position(|slot| slot.publish(payload)) {
            Some(i) => {
                tracing::trace!(shard = self.id, slot = i, len = payload.len(), "buffered unordered");
                Ok(self.id * SLOTS_PER_SHARD + SLOTS + i)
            }
            None => {
                tracing::debug!(shard = self.id, "unordered region full, dropping datagram");
                Err(ReceiveError::Backpressure(self.id))
            }
        }
    }
}

fn check_len(payload: &[u8]) -> Result<(), ReceiveError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(HeaderError::Oversized(payload.len() + HEADER_SIZE).into());
    }
    Ok(())
}

/// Ordered payload handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub seq: Seq,
    pub payload: Bytes,
}

/// Output of one drain pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drain {
    /// First sequence number scanned
    pub start: Seq,
    /// Contiguous in-order run beginning at `start`
    pub ordered: Vec<Delivered>,
    /// Every unordered arrival, shard by shard in slot order
    pub unordered: Vec<Bytes>,
    /// Extra copies of delivered sequences found on other shards
    pub duplicates: usize,
}

impl Drain {
    /// Sequence numbers delivered in order
    pub fn delivered_seqs(&self) -> Vec<Seq> {
        self.ordered.iter().map(|d| d.seq).collect()
    }

    /// First sequence number not delivered by this pass
    pub fn next_seq(&self) -> Seq {
        self.start + self.ordered.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty() && self.unordered.is_empty()
    }
}

/// Single consumer handle
pub struct ReorderConsumer {
    shared: Arc<Shared>,
    cursor: Seq,
}

impl ReorderConsumer {
    /// Lowest sequence number not yet delivered
    pub fn cursor(&self) -> Seq {
        self.cursor
    }

    /// Number of producer shards
    pub fn shard_count(&self) -> usize {
        self.shared.shards.len()
    }

    /// Drain from the current cursor
    pub fn drain(&mut self) -> Result<Drain, ReceiveError> {
        self.drain_from(self.cursor)
    }

    /// Deliver the contiguous run starting at `start` and every unordered
    /// arrival. A gap stops ordered delivery; later sequences stay buffered.
    ///
    /// Fails with `WindowOverrun` if the run fills the whole window, which a
    /// conforming peer cannot produce; the caller must [`reset`](Self::reset).
    pub fn drain_from(&mut self, start: Seq) -> Result<Drain, ReceiveError> {
        let shared = Arc::clone(&self.shared);

        let mut run = 0usize;
        let mut seq = start;
        while run < SLOTS && shared.any_holds(seq) {
            run += 1;
            seq = seq.next();
        }
        if run == SLOTS {
            tracing::warn!(start = %start, "ordered run covers the whole window");
            return Err(ReceiveError::WindowOverrun);
        }

        let mut drain = Drain {
            start,
            ..Default::default()
        };

        seq = start;
        for _ in 0..run {
            for shard in shared.shards.iter() {
                let slot = &shard.ordered[seq.index()];
                if drain.next_seq() == seq {
                    if let Some(payload) = slot.read() {
                        drain.ordered.push(Delivered { seq, payload });
                    }
                } else if slot.is_used() {
                    drain.duplicates += 1;
                }
            }
            seq = seq.next();
        }

        self.set_cursor(seq);
        fence(Ordering::SeqCst);

        let mut freed = start;
        for _ in 0..run {
            for shard in shared.shards.iter() {
                shard.ordered[freed.index()].discard();
            }
            shared.loss.clear(freed);
            freed = freed.next();
        }
        drain.duplicates += self.purge_stale();

        for shard in shared.shards.iter() {
            drain
                .unordered
                .extend(shard.unordered.iter().filter_map(Slot::take));
        }

        if !drain.is_empty() {
            tracing::trace!(
                start = %start,
                ordered = drain.ordered.len(),
                unordered = drain.unordered.len(),
                "drained"
            );
        }
        Ok(drain)
    }

    fn set_cursor(&mut self, cursor: Seq) {
        self.cursor = cursor;
        self.shared.cursor.store(cursor.as_raw(), Ordering::Release);
    }

    /// Drop loss marks and ordered copies left behind the cursor. Producers
    /// mark gaps from their own view of the cursor, which can trail ours.
    fn purge_stale(&mut self) -> usize {
        let mut purged = 0;
        for i in 0..SLOTS {
            let seq = Seq::normalize(i);
            if seq.offset_from(self.cursor) < HALF_WINDOW {
                continue;
            }
            self.shared.loss.clear(seq);
            for shard in self.shared.shards.iter() {
                if shard.ordered[i].discard() {
                    purged += 1;
                }
            }
        }
        purged
    }

    /// Check whether any shard holds an undelivered payload for `seq`
    pub fn is_buffered(&self, seq: Seq) -> bool {
        self.shared.any_holds(seq)
    }

    /// Sequences marked missing ahead of the cursor
    pub fn missing(&self) -> Vec<LossRange> {
        self.shared.loss.ranges_within(self.cursor, HALF_WINDOW)
    }

    /// Discard everything buffered and restart the window at `cursor`
    pub fn reset(&mut self, cursor: Seq) -> usize {
        let mut dropped = 0;
        for shard in self.shared.shards.iter() {
            for slot in shard.ordered.iter().chain(shard.unordered.iter()) {
                if slot.discard() {
                    dropped += 1;
                }
            }
        }
        self.shared.loss.clear_all();
        self.set_cursor(cursor);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{encode, AckHeader};

    fn ordered(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![AckHeader::data(Seq::new(seq)).encode()];
        bytes.extend_from_slice(payload);
        bytes
    }

    fn unordered(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![encode(false, false, 0)];
        bytes.extend_from_slice(payload);
        bytes
    }

    fn seqs(values: &[u8]) -> Vec<Seq> {
        values.iter().map(|&v| Seq::new(v)).collect()
    }

    #[test]
    fn test_in_order() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        for s in 0..3 {
            writers[0].push(&ordered(s, &[s])).unwrap();
        }

        let drain = consumer.drain_from(Seq::new(0)).unwrap();
        assert_eq!(drain.delivered_seqs(), seqs(&[0, 1, 2]));
        assert_eq!(drain.ordered[2].payload, Bytes::from_static(&[2]));
        assert_eq!(consumer.cursor(), Seq::new(3));
    }

    #[test]
    fn test_out_of_order() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        for s in [0, 2, 1] {
            writers[0].push(&ordered(s, b"x")).unwrap();
        }

        let drain = consumer.drain().unwrap();
        assert_eq!(drain.delivered_seqs(), seqs(&[0, 1, 2]));
    }

    #[test]
    fn test_gap_stalls_delivery() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        writers[0].push(&ordered(0, b"zero")).unwrap();
        writers[0].push(&ordered(2, b"two")).unwrap();

        let drain = consumer.drain().unwrap();
        assert_eq!(drain.delivered_seqs(), seqs(&[0]));
        assert!(consumer.is_buffered(Seq::new(2)));
        assert_eq!(consumer.missing(), vec![LossRange::single(Seq::new(1))]);

        assert!(consumer.drain().unwrap().ordered.is_empty());

        writers[0].push(&ordered(1, b"one")).unwrap();
        assert!(consumer.missing().is_empty());

        let drain = consumer.drain().unwrap();
        assert_eq!(drain.delivered_seqs(), seqs(&[1, 2]));
        assert_eq!(drain.ordered[1].payload, Bytes::from_static(b"two"));
    }

    #[test]
    fn test_duplicate_keeps_original() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        writers[0].push(&ordered(0, b"first")).unwrap();

        assert_eq!(
            writers[0].push(&ordered(0, b"second")),
            Err(ReceiveError::DuplicateOrSlotBusy(Seq::new(0)))
        );

        let drain = consumer.drain().unwrap();
        assert_eq!(drain.ordered[0].payload, Bytes::from_static(b"first"));
    }

    #[test]
    fn test_duplicate_across_shards() {
        let (mut writers, _consumer) = reorder_buffer(2);
        writers[0].push(&ordered(4, b"a")).unwrap();
        assert_eq!(
            writers[1].push(&ordered(4, b"b")),
            Err(ReceiveError::DuplicateOrSlotBusy(Seq::new(4)))
        );
    }

    #[test]
    fn test_stale_after_delivery() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        writers[0].push(&ordered(0, b"x")).unwrap();
        consumer.drain().unwrap();

        assert_eq!(
            writers[0].push(&ordered(0, b"x")),
            Err(ReceiveError::AlreadyDelivered(Seq::new(0)))
        );
        assert!(!consumer.is_buffered(Seq::new(0)));

        // 31 behind the cursor is still recognised as late
        consumer.reset(Seq::new(31));
        assert_eq!(
            writers[0].push(&ordered(0, b"x")),
            Err(ReceiveError::AlreadyDelivered(Seq::new(0)))
        );
        assert!(writers[0].push(&ordered(62, b"x")).is_ok());
    }

    #[test]
    fn test_shards_interleave() {
        let (mut writers, mut consumer) = reorder_buffer(3);
        writers[2].push(&ordered(1, b"b")).unwrap();
        writers[0].push(&ordered(2, b"c")).unwrap();
        writers[1].push(&ordered(0, b"a")).unwrap();

        let drain = consumer.drain().unwrap();
        let payloads: Vec<_> = drain.ordered.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[test]
    fn test_slot_index_layout() {
        let (mut writers, _consumer) = reorder_buffer(2);
        assert_eq!(writers[1].push(&ordered(5, b"x")).unwrap(), SLOTS_PER_SHARD + 5);
        assert_eq!(writers[1].push(&unordered(b"y")).unwrap(), SLOTS_PER_SHARD + SLOTS);
        assert_eq!(writers[1].push(&unordered(b"z")).unwrap(), SLOTS_PER_SHARD + SLOTS + 1);
    }

    #[test]
    fn test_unordered_bypasses_gap() {
        let (mut writers, mut consumer) = reorder_buffer(2);
        writers[0].push(&ordered(1, b"late")).unwrap();
        writers[1].push(&unordered(b"u1")).unwrap();
        writers[0].push(&unordered(b"u0")).unwrap();

        let drain = consumer.drain().unwrap();
        assert!(drain.ordered.is_empty());
        assert_eq!(drain.unordered, vec![Bytes::from("u0"), Bytes::from("u1")]);
        assert!(consumer.drain().unwrap().unordered.is_empty());
    }

    #[test]
    fn test_unordered_backpressure() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        for i in 0..SLOTS {
            writers[0].push(&unordered(&[i as u8])).unwrap();
        }
        assert_eq!(
            writers[0].push(&unordered(b"overflow")),
            Err(ReceiveError::Backpressure(0))
        );

        assert_eq!(consumer.drain().unwrap().unordered.len(), SLOTS);
        assert!(writers[0].push(&unordered(b"again")).is_ok());
    }

    #[test]
    fn test_rejects_ack_and_empty() {
        let (mut writers, _consumer) = reorder_buffer(1);
        let ack = [AckHeader::ack(Seq::new(3)).encode()];
        assert_eq!(
            writers[0].push(&ack),
            Err(ReceiveError::UnexpectedAck(Seq::new(3)))
        );
        assert_eq!(
            writers[0].push(&[]),
            Err(ReceiveError::Malformed(HeaderError::Empty))
        );
    }

    #[test]
    fn test_wraparound_delivery() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        consumer.reset(Seq::new(62));

        for s in [0, 63, 62, 1] {
            writers[0].push(&ordered(s, b"w")).unwrap();
        }
        let drain = consumer.drain().unwrap();
        assert_eq!(drain.delivered_seqs(), seqs(&[62, 63, 0, 1]));
        assert_eq!(consumer.cursor(), Seq::new(2));
    }

    #[test]
    fn test_window_overrun() {
        let (mut writers, mut consumer) = reorder_buffer(1);
        for s in 0..HALF_WINDOW {
            writers[0].push(&ordered(s, b"f")).unwrap();
        }
        // second half is only reachable once the cursor has moved up
        consumer.set_cursor(Seq::new(HALF_WINDOW));
        for s in HALF_WINDOW..WINDOW {
            writers[0].push(&ordered(s, b"f")).unwrap();
        }

        assert_eq!(consumer.drain_from(Seq::new(0)), Err(ReceiveError::WindowOverrun));
        assert_eq!(consumer.reset(Seq::new(0)), SLOTS);
        assert!(consumer.drain().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let (writers, mut consumer) = reorder_buffer(4);

        let handles: Vec<_> = writers
            .into_iter()
            .map(|mut writer| {
                std::thread::spawn(move || {
                    let id = writer.shard_id() as u8;
                    for s in (0..24u8).filter(|s| s % 4 == id) {
                        writer.push(&ordered(s, &[s])).unwrap();
                    }
                    for _ in 0..8 {
                        writer.push(&unordered(&[id])).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drain = consumer.drain().unwrap();
        assert_eq!(drain.delivered_seqs(), (0..24).map(Seq::new).collect::<Vec<_>>());
        for d in &drain.ordered {
            assert_eq!(d.payload[0], d.seq.as_raw());
        }
        assert_eq!(drain.unordered.len(), 32);
    }
}
