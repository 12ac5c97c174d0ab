//! Routing table for one far-side relay binding.
//!
//! A binding is the far UDP socket shared by every flow of one origin source. Each destination the
//! near side applies for gets a room pairing that destination with the near relay that carries its
//! traffic. Datagrams from addresses that have no room yet (peers that learned the binding from a
//! third party) wait in a bounded per-peer buffer until the near side claims them.
//!
//! Every room of a binding shares its socket, so the first datagram relayed toward a destination
//! already opens the NAT mapping for it. The room role therefore only records which end spoke
//! first. It is reported in logs and never changes routing.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;

/// Which end of a room spoke first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoomRole {
    // The destination was applied for before it ever sent anything
    Sender,
    // The peer reached the binding first
    Receiver,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Room {
    pub near: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub role: RoomRole,
    pub last_traffic_ms: u64,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Route {
    ToDst(SocketAddrV4),
    ToNear(SocketAddrV4),
    Buffered,
    Dropped,
}

struct Pending {
    first_seen_ms: u64,
    datagrams: VecDeque<Vec<u8>>,
}

pub struct Rooms {
    pending_max: usize,
    // Destination to room
    rooms: HashMap<SocketAddrV4, Room>,
    // Near relay to destination
    near_index: HashMap<SocketAddrV4, SocketAddrV4>,
    pending: HashMap<SocketAddrV4, Pending>,
}

impl Rooms {
    pub fn new(pending_max: usize) -> Self {
        Self {
            pending_max,
            rooms: HashMap::new(),
            near_index: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Registers (or refreshes) the room for `dst`, carried by the near relay `near`. Returns the
    /// room's role and any datagrams `dst` sent before the room existed, oldest first; those are
    /// owed to `near`.
    pub fn apply(&mut self, near: SocketAddrV4, dst: SocketAddrV4, now_ms: u64) -> (RoomRole, Vec<Vec<u8>>) {
        if let Some(room) = self.rooms.get_mut(&dst) {
            if room.near != near {
                log::info!("room {} moved from {} to {}", dst, room.near, near);
                self.near_index.remove(&room.near);
                self.near_index.insert(near, dst);
                room.near = near;
            }

            room.last_traffic_ms = now_ms;

            return (room.role, Vec::new());
        }

        let (role, flushed) = match self.pending.remove(&dst) {
            Some(pending) => (RoomRole::Receiver, pending.datagrams.into_iter().collect()),
            None => (RoomRole::Sender, Vec::new()),
        };

        log::debug!("room {} <-> {} ({:?})", dst, near, role);

        if let Some(old_dst) = self.near_index.insert(near, dst) {
            // A near relay carries exactly one destination
            self.rooms.remove(&old_dst);
        }

        self.rooms.insert(
            dst,
            Room {
                near,
                dst,
                role,
                last_traffic_ms: now_ms,
            },
        );

        (role, flushed)
    }

    /// Decides where a datagram received on the binding goes.
    pub fn route(&mut self, from: SocketAddrV4, data: &[u8], now_ms: u64) -> Route {
        if let Some(dst) = self.near_index.get(&from) {
            if let Some(room) = self.rooms.get_mut(dst) {
                room.last_traffic_ms = now_ms;
                return Route::ToDst(room.dst);
            }
        }

        if let Some(room) = self.rooms.get_mut(&from) {
            room.last_traffic_ms = now_ms;
            return Route::ToNear(room.near);
        }

        if !self.pending.contains_key(&from) && self.pending.len() >= self.pending_max {
            log::debug!("dropping datagram from {}, too many unknown peers", from);
            return Route::Dropped;
        }

        let pending = self.pending.entry(from).or_insert_with(|| Pending {
            first_seen_ms: now_ms,
            datagrams: VecDeque::new(),
        });

        if pending.datagrams.len() >= self.pending_max {
            log::debug!("dropping datagram from {}, buffer full", from);
            return Route::Dropped;
        }

        pending.datagrams.push_back(data.to_vec());

        Route::Buffered
    }

    /// Removes rooms and pending buffers idle for at least `timeout_ms`, returning the rooms.
    pub fn expire(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<Room> {
        let idle = self
            .rooms
            .values()
            .filter(|room| now_ms.saturating_sub(room.last_traffic_ms) >= timeout_ms)
            .map(|room| room.dst)
            .collect::<Vec<_>>();

        let mut removed = Vec::new();

        for dst in idle {
            if let Some(room) = self.rooms.remove(&dst) {
                self.near_index.remove(&room.near);
                removed.push(room);
            }
        }

        self.pending
            .retain(|_, pending| now_ms.saturating_sub(pending.first_seen_ms) < timeout_ms);

        removed
    }

    pub fn room(&self, dst: &SocketAddrV4) -> Option<&Room> {
        self.rooms.get(dst)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn routes_both_ways() {
        let mut rooms = Rooms::new(4);
        let near = addr("10.0.0.1:50000");
        let dst = addr("8.8.8.8:53");

        assert_eq!(rooms.apply(near, dst, 0), (RoomRole::Sender, Vec::new()));

        assert_eq!(rooms.route(near, b"q", 1), Route::ToDst(dst));
        assert_eq!(rooms.route(dst, b"a", 2), Route::ToNear(near));
    }

    #[test]
    fn early_peer_becomes_receiver() {
        let mut rooms = Rooms::new(2);
        let near = addr("10.0.0.1:50001");
        let peer = addr("203.0.113.9:7000");

        assert_eq!(rooms.route(peer, b"one", 0), Route::Buffered);
        assert_eq!(rooms.route(peer, b"two", 1), Route::Buffered);
        assert_eq!(rooms.route(peer, b"three", 2), Route::Dropped);

        let (role, flushed) = rooms.apply(near, peer, 3);

        assert_eq!(role, RoomRole::Receiver);
        assert_eq!(flushed, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(rooms.route(peer, b"four", 4), Route::ToNear(near));

        // Reapplying keeps the role and flushes nothing
        assert_eq!(rooms.apply(near, peer, 5), (RoomRole::Receiver, Vec::new()));
    }

    #[test]
    fn role_does_not_change_routing() {
        let mut rooms = Rooms::new(4);
        let sender_near = addr("10.0.0.1:50010");
        let receiver_near = addr("10.0.0.1:50011");
        let sender_dst = addr("8.8.8.8:53");
        let receiver_dst = addr("203.0.113.9:7000");

        assert_eq!(rooms.route(receiver_dst, b"early", 0), Route::Buffered);

        assert_eq!(rooms.apply(sender_near, sender_dst, 1).0, RoomRole::Sender);
        assert_eq!(rooms.apply(receiver_near, receiver_dst, 1).0, RoomRole::Receiver);

        assert_eq!(rooms.route(sender_near, b"q", 2), Route::ToDst(sender_dst));
        assert_eq!(rooms.route(receiver_near, b"q", 2), Route::ToDst(receiver_dst));
        assert_eq!(rooms.route(sender_dst, b"a", 3), Route::ToNear(sender_near));
        assert_eq!(rooms.route(receiver_dst, b"a", 3), Route::ToNear(receiver_near));
    }

    #[test]
    fn bounded_unknown_peers() {
        let mut rooms = Rooms::new(2);

        assert_eq!(rooms.route(addr("1.1.1.1:1"), b"x", 0), Route::Buffered);
        assert_eq!(rooms.route(addr("1.1.1.2:1"), b"x", 0), Route::Buffered);
        assert_eq!(rooms.route(addr("1.1.1.3:1"), b"x", 0), Route::Dropped);
    }

    #[test]
    fn near_relay_remap() {
        let mut rooms = Rooms::new(4);
        let dst = addr("8.8.4.4:53");

        rooms.apply(addr("10.0.0.1:50000"), dst, 0);
        rooms.apply(addr("10.0.0.1:50002"), dst, 1);

        assert_eq!(rooms.route(dst, b"a", 2), Route::ToNear(addr("10.0.0.1:50002")));
        assert_eq!(rooms.route(addr("10.0.0.1:50000"), b"q", 3), Route::Buffered);
    }

    #[test]
    fn expiry() {
        let mut rooms = Rooms::new(4);
        let dst = addr("8.8.8.8:53");

        rooms.apply(addr("10.0.0.1:50000"), dst, 0);
        rooms.route(addr("9.9.9.9:9"), b"x", 0);

        assert!(rooms.expire(50, 100).is_empty());

        let removed = rooms.expire(100, 100);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].dst, dst);
        assert!(rooms.is_empty());
    }
}
