use std::collections::BTreeMap;

use crate::frame::{CloseReason, PackId, StreamId};
use crate::obfs::Obfuscator;

/// A sent pack awaiting confirmation.
pub struct Wmem {
    pub datagram: Vec<u8>,
    pub sent_at_ms: u64,
    pub resends: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutboundHalf {
    Open,
    FinSent {
        reason: CloseReason,
        last_pack_id: PackId,
        sent_at_ms: u64,
        resends: u32,
    },
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InboundHalf {
    Open,
    FinReceived {
        reason: CloseReason,
        last_pack_id: PackId,
    },
    Closed,
}

pub struct Stream {
    pub id: StreamId,

    // Sender state
    pub pcur: PackId,
    pub biggest_sent: PackId,
    pub biggest_confirmed: PackId,
    pub wmems: BTreeMap<PackId, Wmem>,
    pub outbound: OutboundHalf,

    // Receiver state
    pub continue_pack_id: PackId,
    pub pieces: BTreeMap<PackId, Vec<u8>>,
    pub inbound: InboundHalf,

    pub last_traffic_ms: u64,
    // Whether any payload has moved in either direction
    pub established: bool,
}

impl Stream {
    pub fn new(id: StreamId, now_ms: u64) -> Self {
        Self {
            id,
            pcur: 0,
            biggest_sent: 0,
            biggest_confirmed: 0,
            wmems: BTreeMap::new(),
            outbound: OutboundHalf::Open,
            continue_pack_id: 0,
            pieces: BTreeMap::new(),
            inbound: InboundHalf::Open,
            last_traffic_ms: now_ms,
            established: false,
        }
    }

    /// Numbers the next outgoing pack. `None` once the pack id space is used up.
    pub fn next_pack_id(&mut self) -> Option<PackId> {
        self.pcur = self.pcur.checked_add(1)?;
        Some(self.pcur)
    }

    /// Accepts one received pack. Payloads that complete the contiguous prefix are passed to
    /// `deliver` in pack order; the first pack of the stream is decoded with `obfs` first.
    /// Returns the number of packs delivered.
    pub fn receive<F>(
        &mut self,
        pack_id: PackId,
        payload: &[u8],
        obfs: &dyn Obfuscator,
        mut deliver: F,
    ) -> usize
    where
        F: FnMut(&[u8]),
    {
        if pack_id <= self.continue_pack_id {
            // Duplicate
            return 0;
        }

        if pack_id > self.continue_pack_id + 1 {
            self.pieces
                .entry(pack_id)
                .or_insert_with(|| payload.to_vec());
            return 0;
        }

        if pack_id == 1 {
            let mut first = payload.to_vec();
            obfs.decode(&mut first);
            deliver(&first);
        } else {
            deliver(payload);
        }

        self.continue_pack_id = pack_id;

        let mut delivered = 1;

        while let Some(next) = self.continue_pack_id.checked_add(1) {
            let piece = match self.pieces.remove(&next) {
                Some(piece) => piece,
                None => break,
            };

            deliver(&piece);
            self.continue_pack_id = next;
            delivered += 1;
        }

        self.established = true;

        return delivered;
    }

    /// Gaps in `(continue_pack_id, biggest_sent]` not covered by held pieces, as inclusive
    /// ranges, at most `max` of them.
    pub fn missing_ranges(&self, biggest_sent: PackId, max: usize) -> Vec<(PackId, PackId)> {
        let mut ranges = Vec::new();

        let mut next = self.continue_pack_id as u64 + 1;
        let end = biggest_sent as u64;

        for &held in self.pieces.keys() {
            if ranges.len() >= max || next > end {
                return ranges;
            }

            let held = held as u64;

            if held > next {
                ranges.push((next as PackId, (held - 1).min(end) as PackId));
            }

            next = next.max(held + 1);
        }

        if ranges.len() < max && next <= end {
            ranges.push((next as PackId, end as PackId));
        }

        ranges
    }

    /// Completes the inbound half if every pack up to the peer's cutoff has been delivered.
    /// Returns the reason exactly once, at the transition.
    pub fn try_finish_inbound(&mut self) -> Option<CloseReason> {
        match self.inbound {
            InboundHalf::FinReceived {
                reason,
                last_pack_id,
            } if self.continue_pack_id >= last_pack_id => {
                self.inbound = InboundHalf::Closed;
                self.pieces.clear();
                Some(reason)
            }
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound == OutboundHalf::Closed && self.inbound == InboundHalf::Closed
    }
}
