//! Socket plumbing shared by `tun` and `tund`.
//!
//! A [`Tunnel`] is one channel bound to its own UDP socket and carrying traffic for a single
//! destination. Channel callbacks are collected as [`ChannelEvent`]s and applied to the local TCP
//! sockets after the channel call returns, so the channel never sees the socket tables.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;

use crate::channel::{Channel, HostContext, TimeoutAction};
use crate::conn::{AfterDrain, Conn, Flush};
use crate::frame::serial::DATAGRAM_SIZE_MAX;
use crate::frame::{CloseReason, StreamId};
use crate::reactor::{Key, Reactor, Ready};
use crate::registry::Registry;
use crate::socket;

// Bytes read from one local socket per readiness event
const READ_BUDGET: usize = 256 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    Open(StreamId),
    Receive(StreamId, Vec<u8>),
    PeerFin(StreamId, CloseReason),
    Closed(StreamId, bool),
    Expired(StreamId),
    PeerGone,
}

/// Host context sending through a tunnel socket and queueing everything else.
pub struct EventQueue<'a> {
    socket: &'a UdpSocket,
    events: &'a mut VecDeque<ChannelEvent>,
}

impl HostContext for EventQueue<'_> {
    fn send_datagram(&mut self, datagram: &[u8], addr: &SocketAddr) {
        socket::send_to(self.socket, datagram, addr);
    }

    fn on_open(&mut self, stream_id: StreamId) {
        self.events.push_back(ChannelEvent::Open(stream_id));
    }

    fn on_receive(&mut self, stream_id: StreamId, data: &[u8]) {
        self.events
            .push_back(ChannelEvent::Receive(stream_id, data.to_vec()));
    }

    fn on_peer_fin(&mut self, stream_id: StreamId, reason: CloseReason) {
        self.events.push_back(ChannelEvent::PeerFin(stream_id, reason));
    }

    fn on_closed(&mut self, stream_id: StreamId, forced: bool) {
        self.events.push_back(ChannelEvent::Closed(stream_id, forced));
    }

    fn on_expired(&mut self, stream_id: StreamId) {
        self.events.push_back(ChannelEvent::Expired(stream_id));
    }

    fn on_peer_gone(&mut self) {
        self.events.push_back(ChannelEvent::PeerGone);
    }
}

pub struct Tunnel {
    pub socket: UdpSocket,
    pub channel: Channel,
    pub dst: SocketAddrV4,
    // Stream to the key of the local socket carrying it
    pub streams: HashMap<StreamId, Key>,
    empty_since_ms: Option<u64>,
    events: VecDeque<ChannelEvent>,
}

impl Tunnel {
    pub fn new(socket: UdpSocket, channel: Channel, dst: SocketAddrV4) -> Self {
        Self {
            socket,
            channel,
            dst,
            streams: HashMap::new(),
            empty_since_ms: None,
            events: VecDeque::new(),
        }
    }

    /// Calls into the channel with a host context bound to this tunnel's socket.
    pub fn with_channel<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Channel, &mut EventQueue) -> R,
    {
        let mut host = EventQueue {
            socket: &self.socket,
            events: &mut self.events,
        };

        f(&mut self.channel, &mut host)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|addr| addr.port())
    }
}

pub struct Local {
    pub conn: Conn,
    pub tunnel: Key,
    pub stream_id: StreamId,
    // Whether the local socket is still read
    pub reading: bool,
}

/// Tunnels and local sockets of one daemon, registered with its reactor.
pub struct TunnelTable {
    pub reactor: Reactor,
    pub tunnels: HashMap<Key, Tunnel>,
    pub locals: HashMap<Key, Local>,
    registry: Registry<Key>,
    spill_dir: PathBuf,
    next_id: u64,
    buffer: Box<[u8]>,
}

impl TunnelTable {
    pub fn new(reactor: Reactor, spill_dir: PathBuf, session_limit: Option<usize>) -> Self {
        let registry = match session_limit {
            Some(limit) => Registry::new(limit),
            None => Registry::with_descriptor_limit(),
        };

        Self {
            reactor,
            tunnels: HashMap::new(),
            locals: HashMap::new(),
            registry,
            spill_dir,
            next_id: 0,
            buffer: vec![0; READ_BUFFER_SIZE.max(DATAGRAM_SIZE_MAX)].into_boxed_slice(),
        }
    }

    /// Identifier for a new spill buffer.
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn spill_dir(&self) -> &PathBuf {
        &self.spill_dir
    }

    pub fn add_tunnel(&mut self, socket: UdpSocket, channel: Channel, dst: SocketAddrV4) -> std::io::Result<Key> {
        let key = self.reactor.add(&socket, true, false)?;

        self.tunnels.insert(key, Tunnel::new(socket, channel, dst));

        Ok(key)
    }

    /// Attaches a local socket to a stream of a tunnel. Sessions evicted to make room are torn
    /// down with a reset.
    pub fn add_local(&mut self, tunnel_key: Key, stream_id: StreamId, conn: Conn, now_ms: u64) -> Option<Key> {
        let reading = !conn.connecting;

        let key = match self.reactor.add(&conn.stream, reading, conn.wants_write()) {
            Ok(key) => key,
            Err(err) => {
                log::warn!("failed to register stream {:016x}: {}", stream_id, err);
                conn.abort();
                self.shutdown_stream(tunnel_key, stream_id, CloseReason::Rst, now_ms);
                return None;
            }
        };

        for evicted in self.registry.insert(key, now_ms) {
            log::info!("evicting session {}", evicted);
            self.abort_local(evicted, now_ms);
        }

        if let Some(tunnel) = self.tunnels.get_mut(&tunnel_key) {
            tunnel.streams.insert(stream_id, key);
        }

        self.locals.insert(
            key,
            Local {
                conn,
                tunnel: tunnel_key,
                stream_id,
                reading,
            },
        );

        Some(key)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn shutdown_stream(&mut self, tunnel_key: Key, stream_id: StreamId, reason: CloseReason, now_ms: u64) {
        if let Some(tunnel) = self.tunnels.get_mut(&tunnel_key) {
            tunnel.with_channel(|channel, host| channel.shutdown_stream(stream_id, reason, now_ms, host));
        }
    }

    fn rearm_local(&self, key: Key) {
        if let Some(local) = self.locals.get(&key) {
            let readable = local.reading && !local.conn.connecting;

            if let Err(err) = self
                .reactor
                .rearm(&local.conn.stream, key, readable, local.conn.wants_write())
            {
                log::warn!("failed to rearm session {}: {}", key, err);
            }
        }
    }

    fn remove_local(&mut self, key: Key) -> Option<Local> {
        let local = self.locals.remove(&key)?;

        self.reactor.remove(&local.conn.stream);
        self.registry.remove(&key);

        if let Some(tunnel) = self.tunnels.get_mut(&local.tunnel) {
            if tunnel.streams.get(&local.stream_id) == Some(&key) {
                tunnel.streams.remove(&local.stream_id);
            }
        }

        Some(local)
    }

    /// Resets a local socket and its stream.
    pub fn abort_local(&mut self, key: Key, now_ms: u64) {
        if let Some(local) = self.remove_local(key) {
            local.conn.abort();

            self.shutdown_stream(local.tunnel, local.stream_id, CloseReason::Rst, now_ms);
            self.process_events(local.tunnel, now_ms);
        }
    }

    pub fn local_ready(&mut self, ready: Ready, now_ms: u64) {
        if ready.writable {
            self.local_writable(ready.key, now_ms);
        }

        if ready.readable {
            self.local_readable(ready.key, now_ms);
        }

        self.rearm_local(ready.key);
    }

    fn local_readable(&mut self, key: Key, now_ms: u64) {
        let mut budget = READ_BUDGET;

        loop {
            let local = match self.locals.get_mut(&key) {
                Some(local) if local.reading => local,
                _ => return,
            };

            let tunnel_key = local.tunnel;
            let stream_id = local.stream_id;

            match socket::read(&mut local.conn.stream, &mut self.buffer) {
                Ok(socket::Io::Done(n)) => {
                    self.registry.touch(&key, now_ms);

                    if let Some(tunnel) = self.tunnels.get_mut(&tunnel_key) {
                        let data = &self.buffer[..n];
                        tunnel.with_channel(|channel, host| channel.send(stream_id, data, now_ms, host));
                    }

                    budget = budget.saturating_sub(n);

                    if budget == 0 {
                        return;
                    }
                }
                Ok(socket::Io::WouldBlock) => return,
                Ok(socket::Io::Closed) => {
                    local.reading = false;

                    self.shutdown_stream(tunnel_key, stream_id, CloseReason::Eof, now_ms);
                    self.process_events(tunnel_key, now_ms);

                    return;
                }
                Err(err) => {
                    log::info!("stream {:016x} local read failed: {}", stream_id, err);
                    self.abort_local(key, now_ms);
                    return;
                }
            }
        }
    }

    fn local_writable(&mut self, key: Key, now_ms: u64) {
        let local = match self.locals.get_mut(&key) {
            Some(local) => local,
            None => return,
        };

        if local.conn.connecting {
            if let Some(err) = socket::take_connect_error(&local.conn.stream) {
                log::info!("stream {:016x} connect failed: {}", local.stream_id, err);
                self.abort_local(key, now_ms);
                return;
            }

            log::debug!("stream {:016x} connected", local.stream_id);

            local.conn.connecting = false;
            local.reading = !local.conn.aborting();
        }

        self.flush_local(key, now_ms);
    }

    fn flush_local(&mut self, key: Key, now_ms: u64) {
        let local = match self.locals.get_mut(&key) {
            Some(local) => local,
            None => return,
        };

        match local.conn.flush() {
            Ok(Flush::Done) => {
                log::debug!("stream {:016x} local socket closed", local.stream_id);
                self.remove_local(key);
                return;
            }
            Ok(_) => (),
            Err(err) => {
                log::info!("stream {:016x} local write failed: {}", local.stream_id, err);
                self.abort_local(key, now_ms);
                return;
            }
        }

        self.registry.touch(&key, now_ms);
        self.rearm_local(key);
    }

    fn local_for(&self, tunnel_key: Key, stream_id: StreamId) -> Option<Key> {
        self.tunnels.get(&tunnel_key)?.streams.get(&stream_id).copied()
    }

    /// Reads every pending datagram of a tunnel socket. `intercept` sees each datagram first and
    /// returns true when it consumed it.
    pub fn tunnel_readable<F>(&mut self, key: Key, now_ms: u64, mut intercept: F)
    where
        F: FnMut(&mut Tunnel, SocketAddr, &[u8]) -> bool,
    {
        loop {
            let tunnel = match self.tunnels.get_mut(&key) {
                Some(tunnel) => tunnel,
                None => return,
            };

            let (len, from) = match socket::try_recv_from(&tunnel.socket, &mut self.buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("tunnel {} receive failed: {}", tunnel.dst, err);
                    break;
                }
            };

            let bytes = &self.buffer[..len];

            if !intercept(tunnel, from, bytes) {
                tunnel.with_channel(|channel, host| channel.handle_datagram(from, bytes, now_ms, host));
            }

            self.process_events(key, now_ms);
        }

        if let Some(tunnel) = self.tunnels.get(&key) {
            if let Err(err) = self.reactor.rearm(&tunnel.socket, key, true, false) {
                log::warn!("failed to rearm tunnel {}: {}", tunnel.dst, err);
            }
        }
    }

    /// Applies queued channel events of a tunnel to its local sockets.
    pub fn process_events(&mut self, tunnel_key: Key, now_ms: u64) {
        loop {
            let event = match self.tunnels.get_mut(&tunnel_key) {
                Some(tunnel) => match tunnel.events.pop_front() {
                    Some(event) => event,
                    None => return,
                },
                None => return,
            };

            match event {
                ChannelEvent::Open(stream_id) => self.connect_destination(tunnel_key, stream_id, now_ms),
                ChannelEvent::Receive(stream_id, data) => {
                    if let Some(key) = self.local_for(tunnel_key, stream_id) {
                        if let Some(local) = self.locals.get_mut(&key) {
                            local.conn.queue(&data);
                        }

                        self.flush_local(key, now_ms);
                    }
                }
                ChannelEvent::PeerFin(stream_id, CloseReason::Eof) => {
                    if let Some(key) = self.local_for(tunnel_key, stream_id) {
                        if let Some(local) = self.locals.get_mut(&key) {
                            local.conn.set_after_drain(AfterDrain::ShutdownWrite);
                        }

                        self.flush_local(key, now_ms);
                    }
                }
                ChannelEvent::PeerFin(stream_id, CloseReason::Rst) => {
                    // Bytes already delivered still reach the local peer before the reset
                    if let Some(key) = self.local_for(tunnel_key, stream_id) {
                        if let Some(local) = self.locals.get_mut(&key) {
                            local.reading = false;
                            local.conn.set_after_drain(AfterDrain::Abort);
                        }

                        self.flush_local(key, now_ms);
                    }

                    self.shutdown_stream(tunnel_key, stream_id, CloseReason::Rst, now_ms);
                }
                ChannelEvent::Closed(stream_id, forced) => {
                    let key = match self.tunnels.get_mut(&tunnel_key) {
                        Some(tunnel) => tunnel.streams.remove(&stream_id),
                        None => None,
                    };

                    if let Some(key) = key {
                        if forced {
                            if let Some(local) = self.remove_local(key) {
                                local.conn.abort();
                            }
                        } else {
                            if let Some(local) = self.locals.get_mut(&key) {
                                local.conn.set_after_drain(AfterDrain::Close);
                            }

                            self.flush_local(key, now_ms);
                        }
                    }
                }
                ChannelEvent::Expired(stream_id) => {
                    if let Some(key) = self.local_for(tunnel_key, stream_id) {
                        if let Some(local) = self.locals.get_mut(&key) {
                            local.reading = false;
                        }

                        self.rearm_local(key);
                    }
                }
                ChannelEvent::PeerGone => {
                    log::info!("tunnel {} closed by peer", tunnel_key);
                    self.close_tunnel(tunnel_key, false, now_ms);
                    return;
                }
            }
        }
    }

    // The peer opened a stream: connect its destination
    fn connect_destination(&mut self, tunnel_key: Key, stream_id: StreamId, now_ms: u64) {
        let dst = match self.tunnels.get(&tunnel_key) {
            Some(tunnel) => tunnel.dst,
            None => return,
        };

        match socket::connect_nonblocking(SocketAddr::V4(dst)) {
            Ok(stream) => {
                let id = self.next_id();
                let conn = Conn::connecting(stream, &self.spill_dir, id);

                log::debug!("stream {:016x} connecting to {}", stream_id, dst);

                self.add_local(tunnel_key, stream_id, conn, now_ms);
            }
            Err(err) => {
                log::info!("stream {:016x} connect to {} failed: {}", stream_id, dst, err);
                self.shutdown_stream(tunnel_key, stream_id, CloseReason::Rst, now_ms);
            }
        }
    }

    /// Removes a tunnel and resets its local sockets. With `notify_peer`, the peer is told first.
    pub fn close_tunnel(&mut self, tunnel_key: Key, notify_peer: bool, now_ms: u64) {
        let mut tunnel = match self.tunnels.remove(&tunnel_key) {
            Some(tunnel) => tunnel,
            None => return,
        };

        if notify_peer {
            tunnel.with_channel(|channel, host| channel.shutdown(now_ms, host));
        }

        self.reactor.remove(&tunnel.socket);

        for (_, key) in tunnel.streams.drain() {
            if let Some(local) = self.remove_local(key) {
                local.conn.abort();
            }
        }

        log::info!("tunnel {} to {} closed", tunnel_key, tunnel.dst);
    }

    /// Runs the channel timers of every tunnel. With `idle_close_ms`, tunnels without streams for
    /// that long are closed.
    pub fn tick(&mut self, now_ms: u64, idle_close_ms: Option<u64>) {
        let keys = self.tunnels.keys().copied().collect::<Vec<_>>();

        for key in keys {
            let action = match self.tunnels.get_mut(&key) {
                Some(tunnel) => tunnel.with_channel(|channel, host| channel.handle_tick(now_ms, host)),
                None => continue,
            };

            self.process_events(key, now_ms);

            if action == TimeoutAction::Terminate {
                self.close_tunnel(key, false, now_ms);
                continue;
            }

            let idle = match self.tunnels.get_mut(&key) {
                Some(tunnel) => {
                    if tunnel.channel.stream_count() > 0 {
                        tunnel.empty_since_ms = None;
                        false
                    } else {
                        let since = *tunnel.empty_since_ms.get_or_insert(now_ms);

                        match idle_close_ms {
                            Some(idle_ms) => now_ms.saturating_sub(since) >= idle_ms,
                            None => false,
                        }
                    }
                }
                None => false,
            };

            if idle {
                self.close_tunnel(key, true, now_ms);
            }
        }
    }

    pub fn close_all(&mut self, now_ms: u64) {
        let keys = self.tunnels.keys().copied().collect::<Vec<_>>();

        for key in keys {
            self.close_tunnel(key, true, now_ms);
        }
    }
}
