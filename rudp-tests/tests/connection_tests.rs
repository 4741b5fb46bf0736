//! End-to-end connection tests
//!
//! Two connections exchange datagrams over an in-memory link under a manual
//! clock, so loss, reordering and retransmission timing are deterministic.

use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;
use rudp_io::ManualClock;
use rudp_protocol::{
    encode_frame, Clock, ConnectionError, ConnectionEvent, ConnectionState, MessageRegistry,
    Reliability, SendError, TransportConfig,
};
use rudp_tests::{carry, number_of, numbered, Peer, Wire};
use std::sync::Arc;

const TICK_MS: u64 = 10;
const MAX_TICKS: usize = 100_000;

struct Link {
    clock: Arc<ManualClock>,
    a: Peer,
    b: Peer,
}

fn link(config: TransportConfig, a_to_b: Arc<Wire>, b_to_a: Arc<Wire>) -> Link {
    let clock = Arc::new(ManualClock::new(0));
    Link {
        a: Peer::new(config.clone(), clock.clone(), a_to_b),
        b: Peer::new(config, clock.clone(), b_to_a),
        clock,
    }
}

/// Backoff ceiling high enough that a lossy link never times out
fn patient(shard_count: usize) -> TransportConfig {
    TransportConfig {
        shard_count,
        timeout_ceiling_ms: 1 << 40,
        ..Default::default()
    }
}

fn numbered_payloads(count: u32) -> Vec<Vec<u8>> {
    (0..count).map(|n| numbered(n).to_vec()).collect()
}

fn numbers(payloads: &[Bytes]) -> Vec<u32> {
    payloads.iter().map(|p| number_of(p)).collect()
}

/// Send every payload from `a` to `b` in order, stepping the clock until all
/// of them are acknowledged. Returns the number of ticks taken.
fn transfer(link: &mut Link, payloads: &[Vec<u8>], reorder: bool) -> usize {
    let mut next = 0;

    for tick in 0..MAX_TICKS {
        // once everything is queued, jump straight to the next resend
        let step = if next < payloads.len() {
            TICK_MS
        } else {
            link.a.conn.rtt_ms().max(TICK_MS)
        };
        link.clock.advance(step);
        link.a.conn.poll_retransmit().expect("link stays alive");

        while next < payloads.len() {
            match link.a.conn.send(&payloads[next], Reliability::Ordered) {
                Ok(_) => next += 1,
                Err(ConnectionError::Send(SendError::WindowFull(_))) => break,
                Err(e) => panic!("send failed: {e}"),
            }
        }

        carry(&link.a, &mut link.b, reorder);
        carry(&link.b, &mut link.a, reorder);

        if next == payloads.len() && link.a.conn.in_flight() == 0 {
            return tick;
        }
    }
    panic!(
        "transfer stalled: {} of {} delivered",
        link.b.delivered.len(),
        payloads.len()
    );
}

#[test]
fn test_lossless_transfer_wraps_window() {
    let mut link = link(TransportConfig::default(), Wire::lossless(), Wire::lossless());

    transfer(&mut link, &numbered_payloads(200), false);

    assert_eq!(numbers(&link.b.delivered), (0..200).collect::<Vec<_>>());

    let sender = link.a.conn.stats();
    assert_eq!(sender.packets_sent, 200);
    assert_eq!(sender.acks_received, 200);
    assert_eq!(sender.retransmitted, 0);
    assert_eq!(sender.rtt_ms, 10);

    let receiver = link.b.conn.stats();
    assert_eq!(receiver.packets_received, 200);
    assert_eq!(receiver.acks_sent, 200);
    assert_eq!(receiver.bytes_received, 800);
    assert_eq!(receiver.duplicates, 0);
}

#[test]
fn test_lossy_reordered_transfer() {
    let mut link = link(patient(3), Wire::lossy(5), Wire::lossy(7));

    transfer(&mut link, &numbered_payloads(400), true);

    assert_eq!(numbers(&link.b.delivered), (0..400).collect::<Vec<_>>());
    assert!(link.a.wire.dropped() > 0);
    assert!(link.b.wire.dropped() > 0);

    let sender = link.a.conn.stats();
    assert!(sender.retransmitted > 0);
    assert_eq!(sender.acks_received, 400);
    assert_eq!(sender.state, ConnectionState::Open);

    let acked: Vec<_> = link
        .a
        .events()
        .into_iter()
        .filter(|e| matches!(e, ConnectionEvent::Acknowledged(_)))
        .collect();
    assert_eq!(acked.len(), 400);
}

#[test]
fn test_late_retransmission_is_reacked() {
    let mut link = link(TransportConfig::default(), Wire::lossless(), Wire::lossy(1));

    link.a.conn.send(b"once", Reliability::Ordered).unwrap();
    carry(&link.a, &mut link.b, false);
    assert_eq!(link.b.delivered, vec![Bytes::from_static(b"once")]);

    // acks keep getting lost, so the sender keeps retransmitting
    for _ in 0..2 {
        link.clock.advance(link.a.conn.rtt_ms());
        assert_eq!(link.a.conn.poll_retransmit().unwrap(), 1);
        carry(&link.a, &mut link.b, false);
        carry(&link.b, &mut link.a, false);
        assert_eq!(link.a.conn.in_flight(), 1);
    }

    link.b.wire.set_loss(0);
    link.clock.advance(link.a.conn.rtt_ms());
    assert_eq!(link.a.conn.poll_retransmit().unwrap(), 1);
    carry(&link.a, &mut link.b, false);
    carry(&link.b, &mut link.a, false);

    assert_eq!(link.a.conn.in_flight(), 0);
    assert_eq!(link.b.delivered.len(), 1);

    let receiver = link.b.conn.stats();
    assert_eq!(receiver.duplicates, 3);
    // one on delivery, one per late copy
    assert_eq!(receiver.acks_sent, 4);
    assert_eq!(link.b.wire.dropped(), 3);
}

#[test]
fn test_dead_link_times_out_for_good() {
    let mut link = link(TransportConfig::default(), Wire::lossless(), Wire::lossless());

    transfer(&mut link, &numbered_payloads(5), false);
    assert_eq!(link.b.delivered.len(), 5);
    assert_eq!(link.b.conn.stats().acks_sent, 5);

    link.a.wire.set_loss(1);
    for n in 100..103 {
        link.a.conn.send(&numbered(n), Reliability::Ordered).unwrap();
    }

    let err = loop {
        link.clock.advance(TICK_MS);
        if let Err(e) = link.a.conn.poll_retransmit() {
            break e;
        }
        assert!(link.clock.now_ms() < 10_000, "never timed out");
    };

    let ConnectionError::Send(SendError::TimedOut { rtt_ms }) = err else {
        panic!("expected a timeout, got {err}");
    };
    assert!(rtt_ms > 1000);
    assert_eq!(link.a.conn.state(), ConnectionState::TimedOut);
    assert_eq!(link.a.conn.in_flight(), 0);

    let events = link.a.events();
    assert_eq!(events.len(), 6);
    assert_eq!(events.last(), Some(&ConnectionEvent::TimedOut { rtt_ms }));

    // the link comes back, but the timed-out connection stays dead and
    // nothing it gave up is ever reported acknowledged
    link.a.wire.set_loss(0);
    for _ in 0..10 {
        link.clock.advance(1_000);
        assert!(link.a.conn.poll_retransmit().is_err());
        assert!(matches!(
            link.a.conn.send(b"x", Reliability::Ordered),
            Err(ConnectionError::Send(SendError::TimedOut { .. }))
        ));
        carry(&link.a, &mut link.b, false);
        carry(&link.b, &mut link.a, false);
    }
    assert!(link.a.events().is_empty());
    assert_eq!(link.a.conn.stats().acks_received, 5);
    assert_eq!(link.b.delivered.len(), 5);

    // recovery means a new pair of connections
    let mut fresh = self::link(TransportConfig::default(), Wire::lossless(), Wire::lossless());
    transfer(&mut fresh, &numbered_payloads(10), false);
    assert_eq!(numbers(&fresh.b.delivered), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_unordered_is_best_effort() {
    let mut link = link(TransportConfig::with_shards(2), Wire::lossy(4), Wire::lossless());

    for n in 0..40 {
        let receipt = link.a.conn.send(&numbered(n), Reliability::Unordered).unwrap();
        assert_eq!(receipt.seq, None);
    }
    assert_eq!(link.a.conn.in_flight(), 0);

    carry(&link.a, &mut link.b, false);
    assert_eq!(link.b.unordered.len(), 30);
    assert!(link.b.delivered.is_empty());
    assert_eq!(link.b.conn.stats().acks_sent, 0);
    assert!(link.b.wire.take().is_empty());

    link.clock.advance(1_000);
    assert_eq!(link.a.conn.poll_retransmit().unwrap(), 0);
}

#[test]
fn test_framed_messages_dispatch_in_order() {
    let mut link = link(patient(2), Wire::lossy(6), Wire::lossy(9));

    let payloads: Vec<Vec<u8>> = (0..120u32)
        .map(|n| {
            let kind = if n % 3 == 0 { 2 } else { 1 };
            encode_frame(kind, &numbered(n)).unwrap().to_vec()
        })
        .collect();
    transfer(&mut link, &payloads, true);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = MessageRegistry::new();
    for kind in [1, 2] {
        let seen = Arc::clone(&seen);
        registry.bind(kind, move |body, _| seen.lock().push((kind, number_of(body))));
    }

    for payload in &link.b.delivered {
        assert_eq!(registry.dispatch_all(payload, 0), Ok(1));
    }

    let expected: Vec<_> = (0..120u32)
        .map(|n| (if n % 3 == 0 { 2u8 } else { 1u8 }, n))
        .collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_close_stops_both_directions() {
    let mut link = link(TransportConfig::default(), Wire::lossless(), Wire::lossless());
    link.a.conn.send(b"before", Reliability::Ordered).unwrap();

    link.b.conn.close();
    carry(&link.a, &mut link.b, false);

    assert!(link.b.delivered.is_empty());
    assert_eq!(link.b.conn.state(), ConnectionState::Closed);
    assert_eq!(link.b.events(), vec![ConnectionEvent::Closed]);
    assert_eq!(
        link.b.conn.send(b"after", Reliability::Ordered),
        Err(ConnectionError::Closed)
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any mix of periodic loss, reordering and shard count still delivers
    /// every message exactly once and in order
    #[test]
    fn prop_ordered_delivery_survives_loss(
        forward_loss in 4usize..12,
        ack_loss in 4usize..12,
        shards in 1usize..5,
        reorder in any::<bool>(),
        count in 1u32..160,
    ) {
        let mut link = link(patient(shards), Wire::lossy(forward_loss), Wire::lossy(ack_loss));
        transfer(&mut link, &numbered_payloads(count), reorder);

        prop_assert_eq!(numbers(&link.b.delivered), (0..count).collect::<Vec<_>>());
        prop_assert_eq!(link.a.conn.stats().acks_received, count as u64);
    }
}
