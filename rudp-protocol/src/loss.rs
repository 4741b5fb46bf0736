//! Loss marks for the receive window
//!
//! One flag per sequence number, set for sequences known to be missing
//! between the receive cursor and the highest sequence seen so far. Producers
//! on different shards set and clear marks concurrently, so each flag is an
//! atomic.

use crate::sequence::{Seq, WINDOW};
use std::sync::atomic::{AtomicBool, Ordering};

/// Inclusive range of missing sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossRange {
    /// First missing sequence number
    pub start: Seq,
    /// Last missing sequence number (inclusive)
    pub end: Seq,
}

impl LossRange {
    /// Create a new loss range
    pub fn new(start: Seq, end: Seq) -> Self {
        LossRange { start, end }
    }

    /// Create a single-sequence loss range
    pub fn single(seq: Seq) -> Self {
        LossRange { start: seq, end: seq }
    }

    /// Number of sequence numbers in the range
    pub fn len(&self) -> usize {
        self.end.offset_from(self.start) as usize + 1
    }

    /// Check if this is a single sequence
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Check if the range covers `seq`
    pub fn contains(&self, seq: Seq) -> bool {
        seq.offset_from(self.start) <= self.end.offset_from(self.start)
    }
}

/// Per-sequence lost flags
pub struct LossMarks {
    marks: Vec<AtomicBool>,
}

impl LossMarks {
    /// Create an all-clear set of marks
    pub fn new() -> Self {
        LossMarks {
            marks: (0..WINDOW).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Mark a sequence number as missing
    #[inline]
    pub fn mark(&self, seq: Seq) {
        self.marks[seq.index()].store(true, Ordering::Relaxed);
    }

    /// Clear the mark for a sequence number that has arrived
    #[inline]
    pub fn clear(&self, seq: Seq) {
        self.marks[seq.index()].store(false, Ordering::Relaxed);
    }

    /// Check if a sequence number is marked missing
    #[inline]
    pub fn is_marked(&self, seq: Seq) -> bool {
        self.marks[seq.index()].load(Ordering::Relaxed)
    }

    /// Check if any sequence number is marked missing
    pub fn any(&self) -> bool {
        self.marks.iter().any(|m| m.load(Ordering::Relaxed))
    }

    /// Clear every mark
    pub fn clear_all(&self) {
        for mark in &self.marks {
            mark.store(false, Ordering::Relaxed);
        }
    }

    /// Marked sequences walking forward from `from`, coalesced into ranges
    pub fn ranges_from(&self, from: Seq) -> Vec<LossRange> {
        self.ranges_within(from, WINDOW)
    }

    /// Like [`ranges_from`](Self::ranges_from) but only the first `span`
    /// sequence numbers
    pub fn ranges_within(&self, from: Seq, span: u8) -> Vec<LossRange> {
        let mut ranges: Vec<LossRange> = Vec::new();
        let mut open: Option<LossRange> = None;
        let mut seq = from;

        for _ in 0..span.min(WINDOW) {
            if self.is_marked(seq) {
                open = Some(match open {
                    Some(range) => LossRange::new(range.start, seq),
                    None => LossRange::single(seq),
                });
            } else if let Some(range) = open.take() {
                ranges.push(range);
            }
            seq = seq.next();
        }
        ranges.extend(open);
        ranges
    }
}

impl Default for LossMarks {
    fn default() -> Self {
        Self::new()
    }
}
