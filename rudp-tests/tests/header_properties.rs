//! Property-based tests for the ack header codec and window arithmetic
//!
//! Every byte value is a valid header, so the codec is checked exhaustively
//! through generated triples and raw bytes; sequence comparisons are checked
//! against plain modular distance.

use proptest::prelude::*;
use rudp_protocol::header::encode;
use rudp_protocol::{
    AckHeader, Datagram, HeaderError, LossMarks, LossRange, Seq, HALF_WINDOW, MAX_DATAGRAM,
    WINDOW,
};

// Property test strategies

fn seq_strategy() -> impl Strategy<Value = Seq> {
    (0..WINDOW).prop_map(Seq::new)
}

fn header_strategy() -> impl Strategy<Value = AckHeader> {
    (any::<bool>(), any::<bool>(), seq_strategy()).prop_map(|(use_ack, is_ack_packet, counter)| {
        AckHeader {
            use_ack,
            is_ack_packet,
            counter,
        }
    })
}

/// Two sequence numbers with the second `1..HALF_WINDOW` steps after the first
fn close_pair_strategy() -> impl Strategy<Value = (Seq, Seq, u8)> {
    (seq_strategy(), 1..HALF_WINDOW).prop_map(|(earlier, gap)| (earlier, earlier + gap, gap))
}

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

proptest! {
    #[test]
    fn prop_header_roundtrip(header in header_strategy()) {
        prop_assert_eq!(AckHeader::decode(header.encode()), header);
    }

    #[test]
    fn prop_byte_roundtrip(byte in any::<u8>()) {
        prop_assert_eq!(AckHeader::decode(byte).encode(), byte);
    }

    #[test]
    fn prop_encode_masks_counter(use_ack in any::<bool>(), is_ack in any::<bool>(), counter in any::<u8>()) {
        let decoded = AckHeader::decode(encode(use_ack, is_ack, counter));
        prop_assert_eq!(decoded.counter.as_raw(), counter % WINDOW);
        prop_assert_eq!(decoded.use_ack, use_ack);
        prop_assert_eq!(decoded.is_ack_packet, is_ack);
    }

    #[test]
    fn prop_parse_classifies(header in header_strategy(), payload in payload_strategy()) {
        let mut bytes = vec![header.encode()];
        bytes.extend_from_slice(&payload);

        match Datagram::parse(&bytes).unwrap() {
            Datagram::Ack(seq) => {
                prop_assert!(header.use_ack && header.is_ack_packet);
                prop_assert_eq!(seq, header.counter);
            }
            Datagram::Ordered { seq, payload: body } => {
                prop_assert!(header.use_ack && !header.is_ack_packet);
                prop_assert_eq!(seq, header.counter);
                prop_assert_eq!(body, &payload[..]);
            }
            Datagram::Unordered { payload: body } => {
                prop_assert!(!header.use_ack);
                prop_assert_eq!(body, &payload[..]);
            }
        }
    }

    #[test]
    fn prop_parse_rejects_oversized(extra in 1usize..64) {
        let bytes = vec![AckHeader::data(Seq::new(0)).encode(); MAX_DATAGRAM + extra];
        prop_assert_eq!(
            Datagram::parse(&bytes),
            Err(HeaderError::Oversized(MAX_DATAGRAM + extra))
        );
    }

    #[test]
    fn prop_is_later_irreflexive(s in seq_strategy()) {
        prop_assert!(!s.is_later(s));
        prop_assert_eq!(s.checked_is_later(s), Some(false));
    }

    #[test]
    fn prop_checked_is_later_orders_close_pairs((earlier, later, _gap) in close_pair_strategy()) {
        prop_assert_eq!(later.checked_is_later(earlier), Some(true));
        prop_assert_eq!(earlier.checked_is_later(later), Some(false));
    }

    #[test]
    fn prop_half_window_apart_is_unordered(s in seq_strategy()) {
        prop_assert_eq!(s.checked_is_later(s + HALF_WINDOW), None);
        prop_assert_eq!((s + HALF_WINDOW).checked_is_later(s), None);
    }

    /// The lifted comparison agrees with circular distance for close pairs
    /// whose walk does not step from `HALF_WINDOW - 1` to `HALF_WINDOW`
    #[test]
    fn prop_is_later_agrees_away_from_midpoint((earlier, later, gap) in close_pair_strategy()) {
        let steps_to_midpoint = (HALF_WINDOW - 1).wrapping_sub(earlier.as_raw()) % WINDOW;
        prop_assume!(steps_to_midpoint >= gap);

        prop_assert!(later.is_later(earlier));
        prop_assert!(!earlier.is_later(later));
    }

    #[test]
    fn prop_offset_inverts_add(s in seq_strategy(), k in 0..WINDOW) {
        prop_assert_eq!((s + k).offset_from(s), k);
        prop_assert_eq!((s + k) - k, s);
    }

    #[test]
    fn prop_next_walks_the_window(s in seq_strategy()) {
        let mut seq = s;
        for _ in 0..WINDOW {
            seq = seq.next();
        }
        prop_assert_eq!(seq, s);
        prop_assert_eq!(s.next().offset_from(s), 1);
    }

    #[test]
    fn prop_loss_ranges_cover_marks(start in seq_strategy(), marks in prop::collection::btree_set(0..WINDOW, 0..20)) {
        let loss = LossMarks::new();
        for &m in &marks {
            loss.mark(Seq::new(m));
        }

        let ranges = loss.ranges_from(start);
        let covered: usize = ranges.iter().map(LossRange::len).sum();
        prop_assert_eq!(covered, marks.len());

        for s in 0..WINDOW {
            let seq = Seq::new(s);
            let in_range = ranges.iter().any(|r| r.contains(seq));
            prop_assert_eq!(in_range, marks.contains(&s));
        }

        // ranges never touch, otherwise they would have been merged
        for pair in ranges.windows(2) {
            prop_assert!(pair[1].start.offset_from(pair[0].end) > 1);
        }
    }
}

#[test]
fn test_documented_lift_examples() {
    assert!(Seq::new(5).is_later(Seq::new(3)));
    assert!(!Seq::new(3).is_later(Seq::new(5)));
    assert!(Seq::new(0).is_later(Seq::new(63)));
    assert!(!Seq::new(63).is_later(Seq::new(0)));

    // walk crosses the midpoint: the lifted comparison gets it backwards
    assert!(!Seq::new(33).is_later(Seq::new(31)));
    assert_eq!(Seq::new(33).checked_is_later(Seq::new(31)), Some(true));
}
