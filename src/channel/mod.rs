//! Reliable datagram channel.
//!
//! A channel carries any number of byte streams between two UDP endpoints. Each stream numbers its
//! packs from 1; the receiver confirms every pack individually and delivers payloads strictly in
//! pack order. Sent packs are kept until confirmed and resent on a fixed interval. Periodic status
//! messages let the receiver report gaps early as miss ranges.
//!
//! The channel performs no I/O of its own. Datagrams and stream events go through a
//! [`HostContext`], and the current time is passed to every call.

pub mod stream;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;

use crate::config::ChannelConfig;
use crate::frame::serial;
use crate::frame::{CloseReason, Control, DataPack, Datagram, PackId, StreamId};
use crate::obfs::Obfuscator;
use crate::spill::ChunkBuffer;

use stream::{InboundHalf, OutboundHalf, Stream, Wmem};

const OUTBOX_LEN_SIZE: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    // Opens streams, learns its peer from a port announcement
    Near,
    // Accepts streams, latches onto the first sender
    Far,
}

#[derive(Debug, Eq, PartialEq)]
pub enum TimeoutAction {
    Continue,
    Terminate,
}

pub trait HostContext {
    // Called to send a datagram to the peer.
    fn send_datagram(&mut self, datagram: &[u8], addr: &SocketAddr);

    // Called when the peer opened a new stream
    fn on_open(&mut self, stream_id: StreamId);

    // Called with stream data, in order
    fn on_receive(&mut self, stream_id: StreamId, data: &[u8]);

    // Called once the peer closed its sending half and everything before the cutoff was delivered
    fn on_peer_fin(&mut self, stream_id: StreamId, reason: CloseReason);

    // Called when a stream is removed from the channel
    fn on_closed(&mut self, stream_id: StreamId, forced: bool);

    // Called when a stream idled out; its sending half is closed right after
    fn on_expired(&mut self, stream_id: StreamId);

    // Called when the peer announced it is shutting down
    fn on_peer_gone(&mut self);
}

struct Link {
    peer_addr: Option<SocketAddr>,
    obfs: Box<dyn Obfuscator>,
    last_send_ms: u64,
    last_receive_ms: u64,
}

impl Link {
    fn send<C>(&mut self, datagram: &[u8], now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if let Some(ref addr) = self.peer_addr {
            ctx.send_datagram(datagram, addr);
            self.last_send_ms = now_ms;
        }
    }

    fn send_control<C>(&mut self, ctl: &Control, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        let datagram = serial::write_control(ctl, &*self.obfs);
        self.send(&datagram, now_ms, ctx);
    }
}

fn fin_message(side: Side, stream_id: StreamId, reason: CloseReason, last_pack_id: PackId) -> Control {
    match side {
        Side::Near => Control::Fin1 {
            stream_id,
            reason,
            last_pack_id,
        },
        Side::Far => Control::Fin2 {
            stream_id,
            reason,
            last_pack_id,
        },
    }
}

// Acknowledges a FIN sent by the other side
fn peer_fin_ack(side: Side, stream_id: StreamId) -> Control {
    match side {
        Side::Near => Control::GotFin2 { stream_id },
        Side::Far => Control::GotFin1 { stream_id },
    }
}

pub struct Channel {
    side: Side,
    config: ChannelConfig,
    link: Link,
    streams: HashMap<StreamId, Stream>,
    // Recently removed streams
    tombstones: LruCache<StreamId, ()>,
    // Length-prefixed data datagrams not yet sent
    outbox: ChunkBuffer,
    // Number of packs sent but not confirmed
    inflight: usize,
    last_status_ms: u64,
}

impl Channel {
    pub fn new<P: AsRef<Path>>(
        side: Side,
        config: ChannelConfig,
        spill_dir: P,
        channel_id: u64,
        obfs: Box<dyn Obfuscator>,
        now_ms: u64,
    ) -> Self {
        let tombstones_max = NonZeroUsize::new(config.tombstones_max).unwrap_or(NonZeroUsize::MIN);
        let outbox = ChunkBuffer::for_socket(spill_dir, channel_id, config.chunk_size.max(1));

        Self {
            side,
            config,
            link: Link {
                peer_addr: None,
                obfs,
                last_send_ms: now_ms,
                last_receive_ms: now_ms,
            },
            streams: HashMap::new(),
            tombstones: LruCache::new(tombstones_max),
            outbox,
            inflight: 0,
            last_status_ms: now_ms,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer_addr
    }

    /// Fixes the peer address (near side, once the far port is announced) and starts sending.
    pub fn set_peer<C>(&mut self, addr: SocketAddr, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.link.peer_addr != Some(addr) {
            log::info!("channel peer is {}", addr);
        }

        self.link.peer_addr = Some(addr);
        self.flush(now_ms, ctx);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }

    /// Bytes waiting in the outbox, including length prefixes.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Creates a stream toward the peer and announces it.
    pub fn open_stream<C>(&mut self, now_ms: u64, ctx: &mut C) -> StreamId
    where
        C: HostContext,
    {
        debug_assert!(self.side == Side::Near);

        let stream_id = loop {
            let id = rand::random::<u64>() >> 1;

            if id != 0 && !self.streams.contains_key(&id) && !self.tombstones.contains(&id) {
                break id;
            }
        };

        self.streams.insert(stream_id, Stream::new(stream_id, now_ms));

        log::debug!("stream {:016x} opened", stream_id);

        self.link
            .send_control(&Control::NewSource { stream_id }, now_ms, ctx);

        return stream_id;
    }

    /// Queues `data` on a stream and sends as much as the in-flight window allows.
    pub fn send<C>(&mut self, stream_id: StreamId, data: &[u8], now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.outbound == OutboundHalf::Open => stream,
            _ => {
                log::warn!(
                    "dropping {} bytes for closed stream {:016x}",
                    data.len(),
                    stream_id
                );
                return;
            }
        };

        if data.is_empty() {
            return;
        }

        stream.last_traffic_ms = now_ms;
        stream.established = true;

        let mut entry = Vec::with_capacity(OUTBOX_LEN_SIZE + serial::DATAGRAM_SIZE_MAX);
        let mut exhausted = false;

        for payload in data.chunks(serial::PAYLOAD_SIZE_MAX) {
            let pack_id = match stream.next_pack_id() {
                Some(pack_id) => pack_id,
                None => {
                    exhausted = true;
                    break;
                }
            };

            entry.clear();
            entry.extend_from_slice(&[0; OUTBOX_LEN_SIZE]);

            if pack_id == 1 {
                let mut first = payload.to_vec();
                self.link.obfs.encode(&mut first);
                serial::write_data(&mut entry, pack_id, stream_id, &first);
            } else {
                serial::write_data(&mut entry, pack_id, stream_id, payload);
            }

            let datagram_len = (entry.len() - OUTBOX_LEN_SIZE) as u16;
            entry[..OUTBOX_LEN_SIZE].copy_from_slice(&datagram_len.to_be_bytes());

            self.outbox.append(&entry);
        }

        if exhausted {
            log::warn!("stream {:016x} ran out of pack ids", stream_id);
            self.remove_stream(stream_id, true, ctx);
        }

        self.flush(now_ms, ctx);
    }

    /// Moves packs from the outbox onto the wire while the in-flight window has room.
    pub fn flush<C>(&mut self, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.link.peer_addr.is_none() {
            return;
        }

        while self.inflight < self.config.inflight_limit {
            let block = self.outbox.take_next_block();

            if block.is_empty() {
                return;
            }

            let mut pos = 0;

            while pos < block.len() {
                if self.inflight >= self.config.inflight_limit {
                    self.outbox.restore(block[pos..].to_vec());
                    return;
                }

                let datagram_len = match block.get(pos..pos + OUTBOX_LEN_SIZE) {
                    Some(len_bytes) => u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize,
                    None => break,
                };

                let datagram_begin = pos + OUTBOX_LEN_SIZE;
                pos = datagram_begin + datagram_len;

                let datagram = match block.get(datagram_begin..pos) {
                    Some(datagram) => datagram,
                    None => break,
                };

                let (pack_id, stream_id) =
                    match serial::read_datagram(datagram, &*self.link.obfs) {
                        Some(Datagram::Data(pack)) => (pack.pack_id, pack.stream_id),
                        _ => {
                            log::error!("discarding corrupt outbox entry");
                            continue;
                        }
                    };

                let stream = match self.streams.get_mut(&stream_id) {
                    Some(stream) if stream.outbound != OutboundHalf::Closed => stream,
                    _ => continue,
                };

                self.link.send(datagram, now_ms, ctx);

                stream.biggest_sent = stream.biggest_sent.max(pack_id);

                let wmem = Wmem {
                    datagram: datagram.to_vec(),
                    sent_at_ms: now_ms,
                    resends: 0,
                };

                if stream.wmems.insert(pack_id, wmem).is_none() {
                    self.inflight += 1;
                }
            }
        }
    }

    /// Processes a datagram received from `from`.
    pub fn handle_datagram<C>(&mut self, from: SocketAddr, bytes: &[u8], now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        match self.link.peer_addr {
            Some(addr) if addr != from => {
                log::warn!("dropping datagram from {}, channel peer is {}", from, addr);
                return;
            }
            Some(_) => (),
            None => match self.side {
                Side::Far => {
                    log::info!("channel peer is {}", from);
                    self.link.peer_addr = Some(from);
                }
                Side::Near => {
                    log::debug!("dropping datagram from {}, no peer yet", from);
                    return;
                }
            },
        }

        self.link.last_receive_ms = now_ms;

        match serial::read_datagram(bytes, &*self.link.obfs) {
            Some(Datagram::Data(pack)) => self.handle_data(pack, now_ms, ctx),
            Some(Datagram::Control(ctl)) => self.handle_control(ctl, now_ms, ctx),
            None => {
                log::warn!("malformed datagram from {} ({} bytes)", from, bytes.len());
            }
        }
    }

    // Creates a stream announced by the peer, if this side accepts streams
    fn accept_stream<C>(&mut self, stream_id: StreamId, now_ms: u64, ctx: &mut C) -> bool
    where
        C: HostContext,
    {
        if self.tombstones.contains(&stream_id) {
            return false;
        }

        match self.side {
            Side::Near => {
                log::debug!("ignoring unknown stream {:016x}", stream_id);
                false
            }
            Side::Far => {
                log::debug!("stream {:016x} opened by peer", stream_id);
                self.streams.insert(stream_id, Stream::new(stream_id, now_ms));
                ctx.on_open(stream_id);
                true
            }
        }
    }

    fn handle_data<C>(&mut self, pack: DataPack, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        let DataPack {
            pack_id,
            stream_id,
            payload,
        } = pack;

        // Confirm everything, duplicates included: the first confirm may have been lost
        self.link
            .send_control(&Control::Confirm { stream_id, pack_id }, now_ms, ctx);

        if !self.streams.contains_key(&stream_id) && !self.accept_stream(stream_id, now_ms, ctx) {
            return;
        }

        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        stream.last_traffic_ms = now_ms;

        if stream.inbound == InboundHalf::Closed {
            return;
        }

        stream.receive(pack_id, payload, &*self.link.obfs, |data| {
            ctx.on_receive(stream_id, data)
        });

        self.finish_inbound(stream_id, now_ms, ctx);
    }

    fn handle_control<C>(&mut self, ctl: Control, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        match ctl {
            Control::Hello => (),
            Control::Confirm { stream_id, pack_id } => {
                self.handle_confirm(stream_id, pack_id, now_ms, ctx);
            }
            Control::NewSource { stream_id } => {
                if !self.streams.contains_key(&stream_id) {
                    self.accept_stream(stream_id, now_ms, ctx);
                }
            }
            Control::SourceStatus {
                stream_id,
                biggest_sent,
                ..
            } => {
                self.handle_status(stream_id, biggest_sent, now_ms, ctx);
            }
            Control::MissRange {
                stream_id,
                begin,
                end,
            } => {
                self.handle_miss_range(stream_id, begin, end, now_ms, ctx);
            }
            Control::Fin1 {
                stream_id,
                reason,
                last_pack_id,
            } if self.side == Side::Far => {
                self.handle_peer_fin(stream_id, reason, last_pack_id, now_ms, ctx);
            }
            Control::Fin2 {
                stream_id,
                reason,
                last_pack_id,
            } if self.side == Side::Near => {
                self.handle_peer_fin(stream_id, reason, last_pack_id, now_ms, ctx);
            }
            Control::GotFin1 { stream_id } if self.side == Side::Near => {
                self.handle_got_fin(stream_id, ctx);
            }
            Control::GotFin2 { stream_id } if self.side == Side::Far => {
                self.handle_got_fin(stream_id, ctx);
            }
            fault @ (Control::Fin1 { .. }
            | Control::Fin2 { .. }
            | Control::GotFin1 { .. }
            | Control::GotFin2 { .. }) => {
                log::warn!("protocol fault: {:?} received by {:?} side", fault, self.side);
            }
            Control::ChannelFin => {
                log::info!("peer {:?} closed the channel", self.link.peer_addr);
                ctx.on_peer_gone();
            }
            other => {
                log::debug!("ignoring {:?} on channel", other);
            }
        }
    }

    fn handle_confirm<C>(&mut self, stream_id: StreamId, pack_id: PackId, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.wmems.remove(&pack_id).is_some() {
                self.inflight -= 1;
                stream.last_traffic_ms = now_ms;
            }

            stream.biggest_confirmed = stream.biggest_confirmed.max(pack_id);
        }

        self.flush(now_ms, ctx);
    }

    fn handle_status<C>(&mut self, stream_id: StreamId, biggest_sent: PackId, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        if !self.streams.contains_key(&stream_id) && !self.accept_stream(stream_id, now_ms, ctx) {
            return;
        }

        let stream = match self.streams.get(&stream_id) {
            Some(stream) if stream.inbound != InboundHalf::Closed => stream,
            _ => return,
        };

        for (begin, end) in stream.missing_ranges(biggest_sent, self.config.miss_ranges_max) {
            let ctl = Control::MissRange {
                stream_id,
                begin,
                end,
            };

            self.link.send_control(&ctl, now_ms, ctx);
        }
    }

    fn handle_miss_range<C>(
        &mut self,
        stream_id: StreamId,
        begin: PackId,
        end: PackId,
        now_ms: u64,
        ctx: &mut C,
    ) where
        C: HostContext,
    {
        if begin > end {
            return;
        }

        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        for (_, wmem) in stream.wmems.range_mut(begin..=end) {
            if now_ms.saturating_sub(wmem.sent_at_ms) >= self.config.status_interval_ms {
                self.link.send(&wmem.datagram, now_ms, ctx);
                wmem.sent_at_ms = now_ms;
            }
        }
    }

    fn handle_peer_fin<C>(
        &mut self,
        stream_id: StreamId,
        reason: CloseReason,
        last_pack_id: PackId,
        now_ms: u64,
        ctx: &mut C,
    ) where
        C: HostContext,
    {
        if !self.streams.contains_key(&stream_id) {
            if self.tombstones.contains(&stream_id) || self.side == Side::Near {
                // Gone already; the peer missed the acknowledgement
                self.link
                    .send_control(&peer_fin_ack(self.side, stream_id), now_ms, ctx);
                return;
            }

            self.accept_stream(stream_id, now_ms, ctx);
        }

        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        stream.last_traffic_ms = now_ms;

        match stream.inbound {
            InboundHalf::Open => {
                log::debug!(
                    "stream {:016x} peer closed after pack {} ({:?})",
                    stream_id,
                    last_pack_id,
                    reason
                );

                stream.inbound = InboundHalf::FinReceived {
                    reason,
                    last_pack_id,
                };
            }
            InboundHalf::FinReceived { .. } => (),
            InboundHalf::Closed => {
                self.link
                    .send_control(&peer_fin_ack(self.side, stream_id), now_ms, ctx);
                return;
            }
        }

        self.finish_inbound(stream_id, now_ms, ctx);
    }

    fn finish_inbound<C>(&mut self, stream_id: StreamId, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        if let Some(reason) = stream.try_finish_inbound() {
            ctx.on_peer_fin(stream_id, reason);

            self.link
                .send_control(&peer_fin_ack(self.side, stream_id), now_ms, ctx);

            self.remove_if_closed(stream_id, ctx);
        }
    }

    fn handle_got_fin<C>(&mut self, stream_id: StreamId, ctx: &mut C)
    where
        C: HostContext,
    {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        if let OutboundHalf::FinSent { .. } = stream.outbound {
            stream.outbound = OutboundHalf::Closed;

            // Everything up to the cutoff was delivered
            self.inflight -= stream.wmems.len();
            stream.wmems.clear();

            self.remove_if_closed(stream_id, ctx);
        }
    }

    fn remove_if_closed<C>(&mut self, stream_id: StreamId, ctx: &mut C)
    where
        C: HostContext,
    {
        if self.streams.get(&stream_id).map_or(false, Stream::is_closed) {
            self.remove_stream(stream_id, false, ctx);
        }
    }

    fn remove_stream<C>(&mut self, stream_id: StreamId, forced: bool, ctx: &mut C)
    where
        C: HostContext,
    {
        if let Some(stream) = self.streams.remove(&stream_id) {
            self.inflight -= stream.wmems.len();
            self.tombstones.put(stream_id, ());

            if forced {
                log::warn!("stream {:016x} force-closed", stream_id);
            } else {
                log::debug!("stream {:016x} closed", stream_id);
            }

            ctx.on_closed(stream_id, forced);
        }
    }

    /// Closes the sending half of a stream after every pack queued so far.
    pub fn shutdown_stream<C>(&mut self, stream_id: StreamId, reason: CloseReason, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) if stream.outbound == OutboundHalf::Open => stream,
            _ => return,
        };

        let last_pack_id = stream.pcur;

        stream.outbound = OutboundHalf::FinSent {
            reason,
            last_pack_id,
            sent_at_ms: now_ms,
            resends: 0,
        };

        log::debug!(
            "stream {:016x} local close after pack {} ({:?})",
            stream_id,
            last_pack_id,
            reason
        );

        let fin = fin_message(self.side, stream_id, reason, last_pack_id);
        self.link.send_control(&fin, now_ms, ctx);
    }

    /// Tells the peer this end is going away.
    pub fn shutdown<C>(&mut self, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        self.link.send_control(&Control::ChannelFin, now_ms, ctx);
    }

    pub fn handle_tick<C>(&mut self, now_ms: u64, ctx: &mut C) -> TimeoutAction
    where
        C: HostContext,
    {
        if now_ms.saturating_sub(self.link.last_receive_ms) >= self.config.channel_timeout_ms {
            log::warn!("channel to {:?} timed out", self.link.peer_addr);
            return TimeoutAction::Terminate;
        }

        let interval = self.config.resend_interval_ms;
        let limit = self.config.resend_limit;

        // Unconfirmed packs
        for stream in self.streams.values_mut() {
            for (pack_id, wmem) in stream.wmems.iter_mut() {
                if now_ms.saturating_sub(wmem.sent_at_ms) < interval {
                    continue;
                }

                if wmem.resends >= limit {
                    log::warn!(
                        "pack {} of stream {:016x} unconfirmed after {} resends",
                        pack_id,
                        stream.id,
                        wmem.resends
                    );
                    return TimeoutAction::Terminate;
                }

                self.link.send(&wmem.datagram, now_ms, ctx);

                wmem.sent_at_ms = now_ms;
                wmem.resends += 1;
            }
        }

        // Unacknowledged FINs
        let mut exhausted = Vec::new();

        for stream in self.streams.values_mut() {
            if let OutboundHalf::FinSent {
                reason,
                last_pack_id,
                sent_at_ms,
                resends,
            } = &mut stream.outbound
            {
                // No FIN resends until every pack up to the cutoff is confirmed
                if stream.biggest_sent < *last_pack_id || !stream.wmems.is_empty() {
                    *sent_at_ms = now_ms;
                    *resends = 0;
                    continue;
                }

                if now_ms.saturating_sub(*sent_at_ms) < interval {
                    continue;
                }

                if *resends >= limit {
                    exhausted.push(stream.id);
                    continue;
                }

                *sent_at_ms = now_ms;
                *resends += 1;

                let fin = fin_message(self.side, stream.id, *reason, *last_pack_id);
                self.link.send_control(&fin, now_ms, ctx);
            }
        }

        for stream_id in exhausted {
            self.remove_stream(stream_id, true, ctx);
        }

        if now_ms.saturating_sub(self.last_status_ms) >= self.config.status_interval_ms {
            self.last_status_ms = now_ms;

            for stream in self.streams.values() {
                if stream.outbound == OutboundHalf::Closed {
                    continue;
                }

                let ctl = Control::SourceStatus {
                    stream_id: stream.id,
                    biggest_sent: stream.biggest_sent,
                    biggest_confirmed: stream.biggest_confirmed,
                };

                self.link.send_control(&ctl, now_ms, ctx);
            }
        }

        if now_ms.saturating_sub(self.link.last_send_ms) >= self.config.status_interval_ms {
            self.link.send_control(&Control::Hello, now_ms, ctx);
        }

        self.expire_streams(now_ms, ctx);

        self.flush(now_ms, ctx);

        return TimeoutAction::Continue;
    }

    fn expire_streams<C>(&mut self, now_ms: u64, ctx: &mut C)
    where
        C: HostContext,
    {
        let mut expired = Vec::new();
        let mut abandoned = Vec::new();

        for stream in self.streams.values() {
            let timeout_ms = if stream.established {
                self.config.idle_timeout_ms
            } else {
                self.config.connecting_timeout_ms
            };

            if now_ms.saturating_sub(stream.last_traffic_ms) < timeout_ms {
                continue;
            }

            match stream.outbound {
                OutboundHalf::Open => expired.push(stream.id),
                // Peer never finished its half
                OutboundHalf::Closed => abandoned.push(stream.id),
                OutboundHalf::FinSent { .. } => (),
            }
        }

        for stream_id in expired {
            log::info!("stream {:016x} idle, closing", stream_id);

            ctx.on_expired(stream_id);
            self.shutdown_stream(stream_id, CloseReason::Eof, now_ms, ctx);
        }

        for stream_id in abandoned {
            self.remove_stream(stream_id, true, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::obfs::{Identity, Swap};

    #[derive(Default)]
    struct MockHost {
        sent: Vec<(Vec<u8>, SocketAddr)>,
        opened: Vec<StreamId>,
        received: HashMap<StreamId, Vec<u8>>,
        peer_fins: Vec<(StreamId, CloseReason)>,
        closed: Vec<(StreamId, bool)>,
        expired: Vec<StreamId>,
        peer_gone: bool,
    }

    impl HostContext for MockHost {
        fn send_datagram(&mut self, datagram: &[u8], addr: &SocketAddr) {
            self.sent.push((datagram.to_vec(), *addr));
        }

        fn on_open(&mut self, stream_id: StreamId) {
            self.opened.push(stream_id);
        }

        fn on_receive(&mut self, stream_id: StreamId, data: &[u8]) {
            self.received
                .entry(stream_id)
                .or_default()
                .extend_from_slice(data);
        }

        fn on_peer_fin(&mut self, stream_id: StreamId, reason: CloseReason) {
            self.peer_fins.push((stream_id, reason));
        }

        fn on_closed(&mut self, stream_id: StreamId, forced: bool) {
            self.closed.push((stream_id, forced));
        }

        fn on_expired(&mut self, stream_id: StreamId) {
            self.expired.push(stream_id);
        }

        fn on_peer_gone(&mut self) {
            self.peer_gone = true;
        }
    }

    impl MockHost {
        fn take_controls(&mut self) -> Vec<Control> {
            self.sent
                .drain(..)
                .filter_map(|(bytes, _)| match serial::read_datagram(&bytes, &Identity) {
                    Some(Datagram::Control(ctl)) => Some(ctl),
                    _ => None,
                })
                .collect()
        }

        fn take_data(&mut self) -> Vec<Vec<u8>> {
            self.sent
                .drain(..)
                .map(|(bytes, _)| bytes)
                .filter(|bytes| bytes[..4] != [0, 0, 0, 0])
                .collect()
        }
    }

    fn near_addr() -> SocketAddr {
        "10.0.0.1:40000".parse().unwrap()
    }

    fn far_addr() -> SocketAddr {
        "10.0.0.2:41000".parse().unwrap()
    }

    fn new_channel(side: Side, config: ChannelConfig, dir: &Path) -> Channel {
        Channel::new(side, config, dir, rand::random(), Box::new(Identity), 0)
    }

    fn data_datagram(pack_id: PackId, stream_id: StreamId, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        serial::write_data(&mut bytes, pack_id, stream_id, payload);
        bytes
    }

    #[test]
    fn far_latches_first_sender() {
        let dir = tempfile::tempdir().unwrap();
        let mut far = new_channel(Side::Far, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        far.handle_datagram(near_addr(), &data_datagram(1, 77, b"hi"), 5, host);

        assert_eq!(far.peer_addr(), Some(near_addr()));
        assert_eq!(host.opened, vec![77]);
        assert_eq!(host.received[&77], b"hi");
        assert_eq!(host.take_controls(), vec![Control::Confirm { stream_id: 77, pack_id: 1 }]);

        // Another source is dropped without reply
        far.handle_datagram(far_addr(), &data_datagram(2, 77, b"!!"), 6, host);

        assert!(host.sent.is_empty());
        assert_eq!(host.received[&77], b"hi");
    }

    #[test]
    fn near_waits_for_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut near = new_channel(Side::Near, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        let stream_id = near.open_stream(0, host);
        near.send(stream_id, &[1; 3000], 0, host);

        assert!(host.sent.is_empty());
        assert_eq!(near.inflight(), 0);
        assert!(near.outbox_len() > 3000);

        near.handle_datagram(far_addr(), &data_datagram(1, stream_id, b"x"), 1, host);
        assert!(host.sent.is_empty());

        near.set_peer(far_addr(), 2, host);

        let data = host.take_data();
        assert_eq!(data.len(), 3);
        assert_eq!(near.inflight(), 3);
        assert_eq!(near.outbox_len(), 0);
    }

    #[test]
    fn duplicates_are_confirmed_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut far = new_channel(Side::Far, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        for _ in 0..3 {
            far.handle_datagram(near_addr(), &data_datagram(1, 9, b"abc"), 0, host);
        }

        assert_eq!(host.received[&9], b"abc");
        assert_eq!(host.take_controls().len(), 3);
    }

    #[test]
    fn first_pack_is_obfuscated() {
        let dir = tempfile::tempdir().unwrap();
        let mut near = Channel::new(Side::Near, Default::default(), dir.path(), 1, Box::new(Swap), 0);
        let ref mut host = MockHost::default();

        near.set_peer(far_addr(), 0, host);

        let stream_id = near.open_stream(0, host);
        near.send(stream_id, b"GET /", 0, host);
        near.send(stream_id, b"GET /", 0, host);

        let data = host.take_data();
        assert_eq!(data.len(), 2);
        assert_ne!(&data[0][12..], b"GET /");
        assert_eq!(&data[1][12..], b"GET /");
    }

    #[test]
    fn pack_id_overflow_closes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut near = new_channel(Side::Near, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        near.set_peer(far_addr(), 0, host);
        let stream_id = near.open_stream(0, host);
        host.sent.clear();

        if let Some(stream) = near.streams.get_mut(&stream_id) {
            stream.pcur = PackId::MAX - 1;
        }

        near.send(stream_id, &vec![3; serial::PAYLOAD_SIZE_MAX * 3], 0, host);

        assert_eq!(host.closed, vec![(stream_id, true)]);
        assert_eq!(near.stream_count(), 0);
        assert_eq!(near.inflight(), 0);
        assert!(host.take_data().is_empty());

        // The stream stays gone
        near.send(stream_id, b"more", 1, host);
        assert!(host.take_data().is_empty());
    }

    #[test]
    fn inflight_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig {
            inflight_limit: 4,
            ..Default::default()
        };
        let mut near = new_channel(Side::Near, config, dir.path());
        let ref mut host = MockHost::default();

        near.set_peer(far_addr(), 0, host);
        let stream_id = near.open_stream(0, host);
        host.sent.clear();

        near.send(stream_id, &vec![7; serial::PAYLOAD_SIZE_MAX * 10], 0, host);

        assert_eq!(host.take_data().len(), 4);
        assert_eq!(near.inflight(), 4);

        let confirm = serial::write_control(&Control::Confirm { stream_id, pack_id: 2 }, &Identity);
        near.handle_datagram(far_addr(), &confirm, 1, host);

        let data = host.take_data();
        assert_eq!(data.len(), 1);
        assert_eq!(&data[0][..4], &[0, 0, 0, 5]);
        assert_eq!(near.inflight(), 4);

        // Confirming again changes nothing
        near.handle_datagram(far_addr(), &confirm, 2, host);
        assert!(host.take_data().is_empty());
        assert_eq!(near.inflight(), 4);
    }

    #[test]
    fn exact_resend_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig {
            resend_limit: 5,
            resend_interval_ms: 100,
            channel_timeout_ms: 1_000_000,
            status_interval_ms: 1_000_000,
            ..Default::default()
        };
        let mut near = new_channel(Side::Near, config, dir.path());
        let ref mut host = MockHost::default();

        near.set_peer(far_addr(), 0, host);
        let stream_id = near.open_stream(0, host);
        near.send(stream_id, b"lost", 0, host);
        host.sent.clear();

        let mut resends = 0;
        let mut now_ms = 0;

        loop {
            now_ms += 50;

            let action = near.handle_tick(now_ms, host);
            resends += host.take_data().len();

            if action == TimeoutAction::Terminate {
                break;
            }

            assert!(now_ms < 10_000);
        }

        assert_eq!(resends, 5);
        assert_eq!(now_ms, 600);
    }

    #[test]
    fn status_yields_miss_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let mut far = new_channel(Side::Far, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        for pack_id in [1, 2, 5, 6, 9] {
            far.handle_datagram(near_addr(), &data_datagram(pack_id, 3, b"z"), 0, host);
        }

        host.sent.clear();

        let status = Control::SourceStatus {
            stream_id: 3,
            biggest_sent: 12,
            biggest_confirmed: 2,
        };
        far.handle_datagram(near_addr(), &serial::write_control(&status, &Identity), 1, host);

        assert_eq!(
            host.take_controls(),
            vec![
                Control::MissRange { stream_id: 3, begin: 3, end: 4 },
                Control::MissRange { stream_id: 3, begin: 7, end: 8 },
                Control::MissRange { stream_id: 3, begin: 10, end: 12 },
            ]
        );
    }

    #[test]
    fn miss_range_respects_recent_sends() {
        let dir = tempfile::tempdir().unwrap();
        let mut near = new_channel(Side::Near, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        near.set_peer(far_addr(), 0, host);
        let stream_id = near.open_stream(0, host);
        near.send(stream_id, &vec![1; serial::PAYLOAD_SIZE_MAX * 4], 0, host);
        host.sent.clear();

        let miss = serial::write_control(&Control::MissRange { stream_id, begin: 2, end: 3 }, &Identity);

        near.handle_datagram(far_addr(), &miss, 500, host);
        assert!(host.take_data().is_empty());

        near.handle_datagram(far_addr(), &miss, 1000, host);
        let data = host.take_data();
        assert_eq!(data.len(), 2);
        assert_eq!(&data[0][..4], &[0, 0, 0, 2]);
        assert_eq!(&data[1][..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn wrong_side_fin_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut far = new_channel(Side::Far, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        far.handle_datagram(near_addr(), &data_datagram(1, 4, b"a"), 0, host);
        host.sent.clear();

        let fin2 = Control::Fin2 {
            stream_id: 4,
            reason: CloseReason::Eof,
            last_pack_id: 1,
        };
        far.handle_datagram(near_addr(), &serial::write_control(&fin2, &Identity), 1, host);

        assert!(host.sent.is_empty());
        assert!(host.peer_fins.is_empty());
        assert!(far.has_stream(4));
    }

    #[test]
    fn fin_waits_for_missing_packs() {
        let dir = tempfile::tempdir().unwrap();
        let mut far = new_channel(Side::Far, Default::default(), dir.path());
        let ref mut host = MockHost::default();

        far.handle_datagram(near_addr(), &data_datagram(1, 4, b"a"), 0, host);

        let fin1 = Control::Fin1 {
            stream_id: 4,
            reason: CloseReason::Eof,
            last_pack_id: 2,
        };
        far.handle_datagram(near_addr(), &serial::write_control(&fin1, &Identity), 1, host);
        assert!(host.peer_fins.is_empty());

        host.sent.clear();
        far.handle_datagram(near_addr(), &data_datagram(2, 4, b"b"), 2, host);

        assert_eq!(host.peer_fins, vec![(4, CloseReason::Eof)]);
        assert_eq!(host.received[&4], b"ab");
        assert_eq!(
            host.take_controls(),
            vec![
                Control::Confirm { stream_id: 4, pack_id: 2 },
                Control::GotFin1 { stream_id: 4 },
            ]
        );

        // A repeated FIN is acknowledged again, but not reported twice
        far.handle_datagram(near_addr(), &serial::write_control(&fin1, &Identity), 3, host);
        assert_eq!(host.take_controls(), vec![Control::GotFin1 { stream_id: 4 }]);
        assert_eq!(host.peer_fins.len(), 1);

        // Far closes its own half; the stream goes away once acknowledged
        far.shutdown_stream(4, CloseReason::Eof, 4, host);
        assert_eq!(
            host.take_controls(),
            vec![Control::Fin2 { stream_id: 4, reason: CloseReason::Eof, last_pack_id: 0 }]
        );

        let got_fin2 = serial::write_control(&Control::GotFin2 { stream_id: 4 }, &Identity);
        far.handle_datagram(near_addr(), &got_fin2, 5, host);

        assert_eq!(host.closed, vec![(4, false)]);
        assert!(!far.has_stream(4));

        // Tombstoned: late packs are confirmed but do not reopen the stream
        far.handle_datagram(near_addr(), &data_datagram(2, 4, b"b"), 6, host);
        assert_eq!(host.opened, vec![4]);
        assert_eq!(host.take_controls(), vec![Control::Confirm { stream_id: 4, pack_id: 2 }]);
    }

    #[test]
    fn fin_resend_exhaustion_forces_close() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig {
            resend_limit: 2,
            resend_interval_ms: 10,
            channel_timeout_ms: 1_000_000,
            ..Default::default()
        };
        let mut near = new_channel(Side::Near, config, dir.path());
        let ref mut host = MockHost::default();

        near.set_peer(far_addr(), 0, host);
        let stream_id = near.open_stream(0, host);
        near.shutdown_stream(stream_id, CloseReason::Rst, 0, host);

        for now_ms in [10, 20, 30] {
            assert_eq!(near.handle_tick(now_ms, host), TimeoutAction::Continue);
        }

        let fins = host
            .take_controls()
            .into_iter()
            .filter(|ctl| matches!(ctl, Control::Fin1 { .. }))
            .count();

        assert_eq!(fins, 3);
        assert_eq!(host.closed, vec![(stream_id, true)]);
        assert!(!near.has_stream(stream_id));
    }

    #[test]
    fn idle_streams_expire() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig {
            connecting_timeout_ms: 100,
            idle_timeout_ms: 1000,
            channel_timeout_ms: 1_000_000,
            ..Default::default()
        };
        let mut near = new_channel(Side::Near, config, dir.path());
        let ref mut host = MockHost::default();

        near.set_peer(far_addr(), 0, host);
        let quiet = near.open_stream(0, host);
        let busy = near.open_stream(0, host);
        near.send(busy, b"data", 0, host);

        near.handle_tick(100, host);
        assert_eq!(host.expired, vec![quiet]);

        near.handle_tick(1000, host);
        assert_eq!(host.expired, vec![quiet, busy]);
    }

    #[test]
    fn channel_timeout_and_fin() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig {
            channel_timeout_ms: 500,
            ..Default::default()
        };
        let mut far = new_channel(Side::Far, config, dir.path());
        let ref mut host = MockHost::default();

        far.handle_datagram(near_addr(), &serial::write_control(&Control::Hello, &Identity), 100, host);
        assert_eq!(far.handle_tick(599, host), TimeoutAction::Continue);
        assert_eq!(far.handle_tick(600, host), TimeoutAction::Terminate);

        far.handle_datagram(near_addr(), &serial::write_control(&Control::ChannelFin, &Identity), 601, host);
        assert!(host.peer_gone);
    }
}
