#[allow(dead_code)]
mod common;

use common::util::{self, far_addr, Pair};

use packtun::config::ChannelConfig;

const PACK_COUNT: usize = 10_000;
const PACK_SIZE: usize = 1000;

#[test]
fn lossy_transfer() {
    let mut pair = Pair::with_drop_rule(ChannelConfig::default(), Box::new(|n| n % 7 == 0));

    let stream_id = pair.open_stream();

    let mut sent = Vec::with_capacity(PACK_COUNT * PACK_SIZE);

    for i in 0..PACK_COUNT {
        let data = util::pattern(PACK_SIZE, i as u8);
        sent.extend_from_slice(&data);

        pair.send(stream_id, &data);
    }

    pair.deliver();

    for _ in 0..300 {
        if pair.near.inflight() == 0 && pair.near.outbox_len() == 0 {
            break;
        }

        pair.advance(1000);
    }

    assert!(!pair.terminated);
    assert_eq!(pair.near.inflight(), 0);
    assert_eq!(pair.near.outbox_len(), 0);

    let received = pair.received_by_far(stream_id);

    assert_eq!(received.len(), sent.len());
    assert_eq!(md5::compute(received), md5::compute(&sent));

    // Nothing is left to resend
    let data_sent = pair.near_host.data_sent;

    for _ in 0..3 {
        pair.advance(1000);
    }

    assert!(!pair.terminated);
    assert_eq!(pair.near_host.data_sent, data_sent);
}

#[test]
fn reordered_and_duplicated_delivery() {
    let mut config = ChannelConfig::default();
    config.inflight_limit = 64;

    let mut pair = Pair::new(config);

    let stream_id = pair.open_stream();
    let sent = util::pattern(40 * PACK_SIZE, 3);

    pair.send(stream_id, &sent);

    // Hand the packs over backwards, each one twice
    let mut datagrams = std::mem::take(&mut pair.near_host.outgoing);
    datagrams.reverse();

    for datagram in datagrams.iter() {
        for _ in 0..2 {
            pair.far.handle_datagram(
                util::near_addr(),
                datagram,
                pair.now_ms,
                &mut pair.far_host,
            );
        }
    }

    pair.deliver();

    assert_eq!(pair.far_host.opened, vec![stream_id]);
    assert_eq!(pair.received_by_far(stream_id), &sent[..]);
    assert_eq!(pair.near.inflight(), 0);
}

#[test]
fn streams_are_independent() {
    let mut pair = Pair::new(ChannelConfig::default());

    let first = pair.open_stream();
    let second = pair.open_stream();

    let first_data = util::pattern(5000, 1);
    let second_data = util::pattern(7000, 2);

    pair.send(second, &second_data);
    pair.send(first, &first_data);
    pair.deliver();

    assert_eq!(pair.received_by_far(first), &first_data[..]);
    assert_eq!(pair.received_by_far(second), &second_data[..]);
}

#[test]
fn silent_peer_terminates_channel() {
    let mut config = ChannelConfig::default();
    config.resend_limit = 5;

    let mut pair = Pair::with_drop_rule(config, Box::new(|_| true));

    let stream_id = pair.open_stream();
    pair.send(stream_id, b"hello");
    pair.deliver();

    for _ in 0..10 {
        pair.advance(1000);
    }

    assert!(pair.terminated);
    // The first send and exactly `resend_limit` resends
    assert_eq!(pair.near_host.data_sent, 6);
    assert_eq!(pair.near.peer_addr(), Some(far_addr()));
    assert!(pair.far_host.received.is_empty());
}
