//! Send/Retransmission Engine
//!
//! Outgoing datagrams are staged in one slot per sequence number (plus one
//! reserved slot for unacked sends). Acked slots stay occupied until the
//! matching pure ack arrives; a periodic scan reports slots older than the
//! current RTT estimate for retransmission and backs the estimate off.
//!
//! The engine is a plain `&mut self` state machine. Time is passed in as
//! milliseconds from a monotonic clock, and the owner serializes the
//! submission, completion and scan paths (see `Connection`).

use crate::header::{AckHeader, HEADER_SIZE, MAX_DATAGRAM, MAX_PAYLOAD};
use crate::rtt::{scale_rtt, LinkHealth, DEFAULT_RTT_MS, MIN_RTT_MS};
use crate::sequence::{Seq, HALF_WINDOW, WINDOW};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Index of the reserved slot used for unacked sends
pub const NO_ACK_SLOT: usize = WINDOW as usize;

/// Largest forward distance allowed between the oldest pending sequence and
/// a newly staged one. Keeps every sequence the peer can see within half a
/// window of its receive cursor.
pub const MAX_IN_FLIGHT_SPAN: u8 = HALF_WINDOW - 1;

/// Send engine errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Send window full at sequence {0}")]
    WindowFull(Seq),

    #[error("Stale or duplicate ack for sequence {0}")]
    NotPending(Seq),

    #[error("Payload too large: {0} bytes")]
    Oversized(usize),

    #[error("Connection timed out (rtt {rtt_ms}ms)")]
    TimedOut { rtt_ms: u64 },
}

/// One staged datagram
struct SendSlot {
    /// Header byte followed by payload
    data: Box<[u8]>,
    len: usize,
    used: bool,
    /// Submission or last retransmission time (ms)
    timestamp_ms: u64,
    /// Set once the slot has been retransmitted
    is_resend: bool,
}

impl SendSlot {
    fn new() -> Self {
        SendSlot {
            data: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
            len: 0,
            used: false,
            timestamp_ms: 0,
            is_resend: false,
        }
    }

    fn fill(&mut self, header: AckHeader, payload: &[u8]) {
        self.data[0] = header.encode();
        self.data[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
        self.len = HEADER_SIZE + payload.len();
    }

    fn datagram(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Datagram due for retransmission
#[derive(Debug, Clone, PartialEq)]
pub struct Resend {
    pub seq: Seq,
    pub datagram: Bytes,
}

/// Result of one retransmission scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResendReport {
    pub entries: Vec<Resend>,
}

impl ResendReport {
    /// Sequence numbers due for retransmission, in slot order
    pub fn seqs(&self) -> Vec<Seq> {
        self.entries.iter().map(|e| e.seq).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Send-side slot array and RTT backoff state
pub struct SendEngine {
    slots: Vec<SendSlot>,
    health: Arc<LinkHealth>,
    min_rtt_ms: u64,
}

impl SendEngine {
    /// Create an engine with default RTT settings
    pub fn new(health: Arc<LinkHealth>) -> Self {
        Self::with_rtt(health, DEFAULT_RTT_MS, MIN_RTT_MS)
    }

    /// Create an engine with explicit initial and minimum RTT
    pub fn with_rtt(health: Arc<LinkHealth>, initial_rtt_ms: u64, min_rtt_ms: u64) -> Self {
        health.revive(initial_rtt_ms);
        SendEngine {
            slots: (0..=NO_ACK_SLOT).map(|_| SendSlot::new()).collect(),
            health,
            min_rtt_ms,
        }
    }

    /// Shared RTT / timeout state
    pub fn health(&self) -> &Arc<LinkHealth> {
        &self.health
    }

    /// Current RTT estimate
    pub fn rtt_ms(&self) -> u64 {
        self.health.rtt_ms()
    }

    fn timed_out_error(&self) -> SendError {
        SendError::TimedOut {
            rtt_ms: self.health.final_rtt_ms(),
        }
    }

    /// Stage a payload for sending
    ///
    /// Acked sends occupy slot `seq` until completed; unacked sends reuse the
    /// reserved slot and `seq` is ignored. Returns the slot index whose
    /// datagram should be handed to raw I/O now.
    pub fn stage(
        &mut self,
        payload: &[u8],
        use_ack: bool,
        seq: Seq,
        now_ms: u64,
    ) -> Result<usize, SendError> {
        if self.health.is_timed_out() {
            return Err(self.timed_out_error());
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(SendError::Oversized(payload.len()));
        }

        if !use_ack {
            self.slots[NO_ACK_SLOT].fill(AckHeader::unordered(), payload);
            return Ok(NO_ACK_SLOT);
        }

        if !self.fits_window(seq) {
            return Err(SendError::WindowFull(seq));
        }

        let slot = &mut self.slots[seq.index()];
        slot.fill(AckHeader::data(seq), payload);
        slot.used = true;
        slot.timestamp_ms = now_ms;
        slot.is_resend = false;

        tracing::trace!(seq = %seq, len = payload.len(), "staged");
        Ok(seq.index())
    }

    /// Whether `seq` is free and close enough to every pending sequence
    fn fits_window(&self, seq: Seq) -> bool {
        if self.slots[seq.index()].used {
            return false;
        }
        self.slots[..NO_ACK_SLOT]
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.used)
            .all(|(i, _)| seq.offset_from(Seq::normalize(i)) < MAX_IN_FLIGHT_SPAN)
    }

    /// Wire bytes of a staged slot
    pub fn datagram(&self, slot: usize) -> &[u8] {
        self.slots[slot].datagram()
    }

    /// Wire bytes of a pure ack for `seq`
    pub fn ack_datagram(seq: Seq) -> [u8; 1] {
        [AckHeader::ack(seq).encode()]
    }

    /// Handle a pure ack for `seq`
    ///
    /// Frees the slot. The RTT estimate is refreshed only from slots that were
    /// never retransmitted, since an ack for a resent datagram cannot be
    /// matched to a particular transmission.
    pub fn complete(&mut self, seq: Seq, now_ms: u64) -> Result<(), SendError> {
        let slot = &mut self.slots[seq.index()];
        if !slot.used {
            return Err(SendError::NotPending(seq));
        }
        slot.used = false;

        if !slot.is_resend && !self.health.is_timed_out() {
            let sample = now_ms.saturating_sub(slot.timestamp_ms);
            let rtt = scale_rtt(sample, self.min_rtt_ms);
            self.health.set_rtt_ms(rtt);
            tracing::trace!(seq = %seq, sample_ms = sample, rtt_ms = rtt, "rtt sample");
        }
        Ok(())
    }

    /// Report slots older than the RTT estimate for retransmission
    ///
    /// Every reported slot grows the estimate by 1.5x. If it grows past
    /// `timeout_ceiling_ms` the connection is declared dead: the offending
    /// slot is freed, the RTT is set to the timed-out sentinel and
    /// `TimedOut` carries the final estimate. The caller must then discard
    /// the remaining slots and notify the application.
    pub fn scan_for_resend(
        &mut self,
        timeout_ceiling_ms: u64,
        now_ms: u64,
    ) -> Result<ResendReport, SendError> {
        if self.health.is_timed_out() {
            return Err(self.timed_out_error());
        }

        let mut report = ResendReport::default();
        let mut rtt = self.health.rtt_ms();

        for (i, slot) in self.slots[..NO_ACK_SLOT].iter_mut().enumerate() {
            if !slot.used || now_ms.saturating_sub(slot.timestamp_ms) < rtt {
                continue;
            }

            slot.is_resend = true;
            slot.timestamp_ms = now_ms;
            rtt = scale_rtt(rtt, self.min_rtt_ms);

            if rtt > timeout_ceiling_ms {
                slot.used = false;
                self.health.mark_timed_out(rtt);
                tracing::warn!(seq = i, rtt_ms = rtt, "retransmission backoff exceeded ceiling");
                return Err(SendError::TimedOut { rtt_ms: rtt });
            }

            self.health.set_rtt_ms(rtt);
            report.entries.push(Resend {
                seq: Seq::normalize(i),
                datagram: Bytes::copy_from_slice(slot.datagram()),
            });
        }

        if !report.is_empty() {
            tracing::debug!(count = report.len(), rtt_ms = rtt, "retransmitting");
        }
        Ok(report)
    }

    /// Check whether `seq` is awaiting its ack
    pub fn is_pending(&self, seq: Seq) -> bool {
        self.slots[seq.index()].used
    }

    /// Number of acked slots awaiting their ack
    pub fn pending(&self) -> usize {
        self.slots[..NO_ACK_SLOT].iter().filter(|s| s.used).count()
    }

    /// Free every pending slot, returning how many were dropped
    pub fn discard_all(&mut self) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            if slot.used {
                slot.used = false;
                count += 1;
            }
        }
        count
    }
}
