//! Sequence Window Arithmetic
//!
//! Acked datagrams carry a 6-bit counter, so the sequence space is a ring of
//! `WINDOW` values. This module provides a wrapped sequence number type with
//! modular stepping and the half-window ordering test used by both engines.

use std::fmt;
use std::ops::{Add, Sub};

/// Number of distinct sequence numbers (6-bit counter: 2^6)
pub const WINDOW: u8 = 64;

/// Half of the sequence ring. Ordering is only meaningful between sequence
/// numbers whose circular distance is below this value.
pub const HALF_WINDOW: u8 = WINDOW / 2;

/// Mask for the counter bits
const SEQ_MASK: u8 = WINDOW - 1;

/// Sequence number with 6-bit wraparound semantics
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Seq(u8);

impl Seq {
    /// Create a new sequence number
    ///
    /// # Panics
    /// Panics if value is not below `WINDOW`
    pub fn new(value: u8) -> Self {
        assert!(
            value < WINDOW,
            "Sequence number {} exceeds maximum {}",
            value,
            WINDOW - 1
        );
        Seq(value)
    }

    /// Create a sequence number from any integer, reduced modulo `WINDOW`
    #[inline]
    pub fn normalize(value: usize) -> Self {
        Seq((value % WINDOW as usize) as u8)
    }

    /// Get the raw counter value
    #[inline]
    pub fn as_raw(self) -> u8 {
        self.0
    }

    /// Get the counter as a slot index
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        Seq((self.0 + 1) & SEQ_MASK)
    }

    /// Steps needed to walk forward from `earlier` to `self` (0..WINDOW)
    #[inline]
    pub fn offset_from(self, earlier: Seq) -> u8 {
        self.0.wrapping_sub(earlier.0) & SEQ_MASK
    }

    /// Check whether `self` denotes a later point in the stream than `other`.
    ///
    /// Operands below `HALF_WINDOW` are lifted by `WINDOW` before an ordinary
    /// comparison. This linearizes the `63 -> 0` wrap, so the answer is
    /// correct for operands less than half a window apart as long as the walk
    /// between them does not step from `HALF_WINDOW - 1` to `HALF_WINDOW`
    /// (e.g. `33` vs `31` compares the wrong way). Engine code orders sequence
    /// numbers with [`Seq::offset_from`] or [`Seq::checked_is_later`].
    #[inline]
    pub fn is_later(self, other: Seq) -> bool {
        lift(self.0) > lift(other.0)
    }

    /// Ordering by circular distance. Returns `None` when the two sequence
    /// numbers are exactly half a window apart and cannot be ordered.
    pub fn checked_is_later(self, other: Seq) -> Option<bool> {
        match self.offset_from(other) {
            0 => Some(false),
            d if d < HALF_WINDOW => Some(true),
            HALF_WINDOW => None,
            _ => Some(false),
        }
    }
}

#[inline]
fn lift(value: u8) -> u16 {
    let value = value as u16;
    if value < HALF_WINDOW as u16 {
        value + WINDOW as u16
    } else {
        value
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for Seq {
    fn from(value: u8) -> Self {
        Seq(value & SEQ_MASK)
    }
}

impl From<Seq> for u8 {
    fn from(seq: Seq) -> u8 {
        seq.0
    }
}

impl Add<u8> for Seq {
    type Output = Seq;

    fn add(self, rhs: u8) -> Seq {
        Seq(self.0.wrapping_add(rhs) & SEQ_MASK)
    }
}

impl Sub<u8> for Seq {
    type Output = Seq;

    fn sub(self, rhs: u8) -> Seq {
        Seq(self.0.wrapping_sub(rhs) & SEQ_MASK)
    }
}
