#[allow(dead_code)]
mod common;

use common::util::{self, Pair};

use packtun::config::ChannelConfig;
use packtun::frame::serial;
use packtun::frame::CloseReason;

#[test]
fn close_with_packs_in_flight() {
    let mut config = ChannelConfig::default();
    config.inflight_limit = 8;

    let mut pair = Pair::new(config);

    let stream_id = pair.open_stream();
    let sent = util::pattern(100_000, 9);

    pair.send(stream_id, &sent);

    // Most packs are still waiting for window room
    assert!(pair.near.outbox_len() > 0);

    let now_ms = pair.now_ms;
    pair.near
        .shutdown_stream(stream_id, CloseReason::Eof, now_ms, &mut pair.near_host);

    pair.deliver();

    assert_eq!(pair.received_by_far(stream_id), &sent[..]);
    assert_eq!(pair.far_host.peer_fins, vec![(stream_id, CloseReason::Eof)]);
    assert!(pair.far_host.closed.is_empty());
    assert!(pair.near_host.closed.is_empty());

    // Far side answers and closes its own half
    pair.far.send(stream_id, b"bye", now_ms, &mut pair.far_host);
    pair.far
        .shutdown_stream(stream_id, CloseReason::Eof, now_ms, &mut pair.far_host);

    pair.deliver();

    assert_eq!(pair.near_host.received[&stream_id], b"bye");
    assert_eq!(pair.near_host.peer_fins, vec![(stream_id, CloseReason::Eof)]);
    assert_eq!(pair.near_host.closed, vec![(stream_id, false)]);
    assert_eq!(pair.far_host.closed, vec![(stream_id, false)]);
    assert_eq!(pair.near.stream_count(), 0);
    assert_eq!(pair.far.stream_count(), 0);
    assert_eq!(pair.near.inflight(), 0);
}

#[test]
fn late_pack_does_not_reopen() {
    let mut pair = Pair::new(ChannelConfig::default());

    let stream_id = pair.open_stream();
    pair.send(stream_id, b"first");

    let now_ms = pair.now_ms;
    pair.near
        .shutdown_stream(stream_id, CloseReason::Eof, now_ms, &mut pair.near_host);
    pair.deliver();

    pair.far
        .shutdown_stream(stream_id, CloseReason::Eof, now_ms, &mut pair.far_host);
    pair.deliver();

    assert_eq!(pair.far.stream_count(), 0);

    let mut late = Vec::new();
    serial::write_data(&mut late, 7, stream_id, b"late");

    pair.far
        .handle_datagram(util::near_addr(), &late, now_ms, &mut pair.far_host);

    assert_eq!(pair.far_host.opened, vec![stream_id]);
    assert_eq!(pair.far.stream_count(), 0);
    assert_eq!(pair.received_by_far(stream_id), b"first");
}

#[test]
fn reset_reaches_peer() {
    let mut pair = Pair::new(ChannelConfig::default());

    let stream_id = pair.open_stream();
    pair.send(stream_id, &util::pattern(3000, 4));

    let now_ms = pair.now_ms;
    pair.near
        .shutdown_stream(stream_id, CloseReason::Rst, now_ms, &mut pair.near_host);
    pair.deliver();

    assert_eq!(pair.far_host.peer_fins, vec![(stream_id, CloseReason::Rst)]);
    assert_eq!(pair.received_by_far(stream_id).len(), 3000);
}

#[test]
fn lost_fin_is_resent() {
    let mut pair = Pair::with_drop_rule(ChannelConfig::default(), Box::new(|n| n <= 2));

    let stream_id = pair.open_stream();

    let now_ms = pair.now_ms;
    pair.near
        .shutdown_stream(stream_id, CloseReason::Eof, now_ms, &mut pair.near_host);
    pair.deliver();

    assert!(pair.far_host.peer_fins.is_empty());

    pair.advance(1000);

    assert_eq!(pair.far_host.peer_fins, vec![(stream_id, CloseReason::Eof)]);
}

#[test]
fn slow_backlog_does_not_exhaust_fin() {
    let mut config = ChannelConfig::default();
    config.inflight_limit = 4;
    config.resend_limit = 3;
    config.resend_interval_ms = 25;

    let mut pair = Pair::new(config);

    let stream_id = pair.open_stream();
    let sent = util::pattern(40 * serial::PAYLOAD_SIZE_MAX, 21);

    pair.send(stream_id, &sent);

    let now_ms = pair.now_ms;
    pair.near
        .shutdown_stream(stream_id, CloseReason::Eof, now_ms, &mut pair.near_host);

    // Four packs per 20 ms round trip, far slower than the FIN resend ceiling
    for _ in 0..100 {
        if !pair.far_host.peer_fins.is_empty() {
            break;
        }

        pair.step(10);
    }

    assert!(!pair.terminated);
    assert_eq!(pair.received_by_far(stream_id), &sent[..]);
    assert_eq!(pair.far_host.peer_fins, vec![(stream_id, CloseReason::Eof)]);
    assert!(pair.near_host.closed.is_empty());

    pair.step(10);

    assert_eq!(pair.near.inflight(), 0);
    assert_eq!(pair.near.outbox_len(), 0);
    assert!(pair.near_host.closed.is_empty());
}
