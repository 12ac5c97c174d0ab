//! Far side of the multiplexed TCP relay.
//!
//! Accepts relay links from `proxy`, checks their identity hello, and connects a destination for
//! every new source. Name lookups run on a resolver thread whose answers are handed back to the
//! loop through a channel and a poller wakeup.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener, ToSocketAddrs};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time;

use crate::channel::Side;
use crate::config::ProxydConfig;
use crate::conn::Conn;
use crate::epoch::Epoch;
use crate::error::Result;
use crate::frame::relay::{self, Message, SourceId};
use crate::mux::{LinkInput, Mux};
use crate::reactor::{Daemon, Key, Reactor, Ready};
use crate::socket;

const SHUTDOWN_FLUSH_TIMEOUT: time::Duration = time::Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lookup {
    Source { src_id: SourceId },
    Query { near_id: u64, dns_type: u8 },
}

struct ResolveRequest {
    link: Key,
    lookup: Lookup,
    host: String,
    port: u16,
}

struct ResolveResult {
    link: Key,
    lookup: Lookup,
    addr: Option<SocketAddrV4>,
}

// A source whose destination is still being resolved
#[derive(Default)]
struct PendingSource {
    early: Vec<u8>,
    close_received: bool,
}

enum Role {
    Listener,
    Link,
    Source,
}

/// Splits `host:port`.
fn split_destination(destination: &str) -> Option<(&str, u16)> {
    let (host, port) = destination.rsplit_once(':')?;

    if host.is_empty() {
        return None;
    }

    Some((host, port.parse().ok()?))
}

fn resolve(host: &str, port: u16) -> Option<SocketAddrV4> {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(err) => {
            log::info!("failed to resolve {}: {}", host, err);
            return None;
        }
    };

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
}

fn spawn_resolver(
    waker: Arc<polling::Poller>,
) -> io::Result<(mpsc::Sender<ResolveRequest>, mpsc::Receiver<ResolveResult>)> {
    let (request_tx, request_rx) = mpsc::channel::<ResolveRequest>();
    let (result_tx, result_rx) = mpsc::channel();

    thread::Builder::new()
        .name("resolver".into())
        .spawn(move || {
            for request in request_rx {
                let result = ResolveResult {
                    link: request.link,
                    lookup: request.lookup,
                    addr: resolve(&request.host, request.port),
                };

                if result_tx.send(result).is_err() {
                    break;
                }

                if let Err(err) = waker.notify() {
                    log::error!("failed to wake poller: {}", err);
                }
            }
        })?;

    Ok((request_tx, result_rx))
}

pub struct Proxyd {
    config: ProxydConfig,
    epoch: Epoch,
    mux: Mux,
    listener: TcpListener,
    listener_key: Key,
    pending: HashMap<(Key, SourceId), PendingSource>,
    requests: mpsc::Sender<ResolveRequest>,
    results: mpsc::Receiver<ResolveResult>,
}

impl Proxyd {
    pub fn new(config: ProxydConfig) -> Result<Self> {
        config.validate()?;

        let mut reactor = Reactor::new()?;

        let listener = socket::listen_tcp(SocketAddr::from(([0, 0, 0, 0], config.bind_port)))?;
        let listener_key = reactor.add(&listener, true, false)?;

        log::info!("accepting relay links on {}", listener.local_addr()?);

        let (requests, results) = spawn_resolver(reactor.waker())?;

        let mux = Mux::new(
            reactor,
            Side::Far,
            config.spill_dir.clone(),
            config.session_limit,
            config.overflow_bytes,
        );

        Ok(Self {
            config,
            epoch: Epoch::new(),
            mux,
            listener,
            listener_key,
            pending: HashMap::new(),
            requests,
            results,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn link_count(&self) -> usize {
        self.mux.links.len()
    }

    pub fn source_count(&self) -> usize {
        self.mux.source_count()
    }

    fn role(&self, key: Key) -> Option<Role> {
        if key == self.listener_key {
            Some(Role::Listener)
        } else if self.mux.links.contains_key(&key) {
            Some(Role::Link)
        } else if self.mux.sources.contains_key(&key) {
            Some(Role::Source)
        } else {
            None
        }
    }

    fn accept(&mut self, now_ms: u64) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    break;
                }
            };

            if let Err(err) = stream.set_nonblocking(true) {
                log::warn!("failed to set up link from {}: {}", peer, err);
                continue;
            }

            let id = self.mux.next_id();
            let conn = Conn::new(stream, self.mux.spill_dir(), id);

            match self.mux.add_link(conn, now_ms) {
                Ok(key) => log::info!("link {} from {}", key, peer),
                Err(err) => log::warn!("failed to register link from {}: {}", peer, err),
            }
        }

        if let Err(err) = self.mux.reactor.rearm(&self.listener, self.listener_key, true, false) {
            log::error!("failed to rearm listener: {}", err);
        }
    }

    fn close_link(&mut self, key: Key) {
        self.mux.close_link(key);
        self.pending.retain(|(link, _), _| *link != key);
    }

    fn link_ready(&mut self, ready: Ready, now_ms: u64) {
        let key = ready.key;

        if ready.writable && !self.mux.link_writable(key) {
            self.close_link(key);
            return;
        }

        if ready.readable {
            let input = self.mux.fill_link(key, now_ms);

            if !self.link_greeted(key) {
                self.close_link(key);
                return;
            }

            loop {
                let frame = match self.mux.next_frame(key) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(()) => {
                        log::warn!("link {} sent an empty frame", key);
                        self.close_link(key);
                        return;
                    }
                };

                match relay::read_message(&frame) {
                    Some(msg) => self.handle_message(key, msg, now_ms),
                    None => {
                        log::warn!("link {} sent a malformed message", key);
                        self.close_link(key);
                        return;
                    }
                }
            }

            match input {
                LinkInput::Open => (),
                LinkInput::Closed => {
                    log::info!("link {} closed by proxy", key);
                    self.close_link(key);
                    return;
                }
                LinkInput::Failed(err) => {
                    log::warn!("link {} read failed: {}", key, err);
                    self.close_link(key);
                    return;
                }
            }
        }

        self.mux.rearm_link(key);
    }

    // Checks the identity hello. Returns false if the link must be dropped.
    fn link_greeted(&mut self, key: Key) -> bool {
        match self.mux.links.get(&key) {
            Some(link) if link.greeted => return true,
            Some(_) => (),
            None => return false,
        }

        match self.mux.read_hello(key) {
            Some(im) if im == self.config.im.as_bytes() => {
                if let Some(link) = self.mux.links.get_mut(&key) {
                    link.greeted = true;
                }

                true
            }
            Some(_) => {
                log::warn!("link {} has the wrong identity", key);
                false
            }
            // Hello still incomplete
            None => true,
        }
    }

    fn handle_message(&mut self, link_key: Key, msg: Message, now_ms: u64) {
        match msg {
            Message::NewSource { src_id, destination } => {
                let (host, port) = match split_destination(destination) {
                    Some(split) => split,
                    None => {
                        log::warn!("source {} has a bad destination {:?}", src_id, destination);
                        self.mux.send(link_key, &Message::DstClose { src_id }, now_ms);
                        return;
                    }
                };

                log::debug!("source {} to {}", src_id, destination);

                self.pending.insert((link_key, src_id), PendingSource::default());

                self.request(ResolveRequest {
                    link: link_key,
                    lookup: Lookup::Source { src_id },
                    host: host.into(),
                    port,
                });
            }
            Message::Query {
                near_id,
                dns_type,
                domain,
            } => {
                self.request(ResolveRequest {
                    link: link_key,
                    lookup: Lookup::Query { near_id, dns_type },
                    host: domain.into(),
                    port: 0,
                });
            }
            Message::Traffic { src_id, data } if self.pending.contains_key(&(link_key, src_id)) => {
                if let Some(pending) = self.pending.get_mut(&(link_key, src_id)) {
                    pending.early.extend_from_slice(data);
                }
            }
            Message::SrcClose { src_id } if self.pending.contains_key(&(link_key, src_id)) => {
                if let Some(pending) = self.pending.get_mut(&(link_key, src_id)) {
                    pending.close_received = true;
                }
            }
            msg => {
                if let Some(other) = self.mux.dispatch(link_key, msg, now_ms) {
                    log::warn!("link {} sent unexpected {:?}", link_key, other);
                }
            }
        }
    }

    fn request(&mut self, request: ResolveRequest) {
        if self.requests.send(request).is_err() {
            log::error!("resolver thread is gone");
        }
    }

    fn handle_result(&mut self, result: ResolveResult, now_ms: u64) {
        if !self.mux.links.contains_key(&result.link) {
            return;
        }

        match result.lookup {
            Lookup::Query { near_id, dns_type } => {
                let msg = Message::Response {
                    near_id,
                    dns_type,
                    ip: result.addr.map(|addr| *addr.ip()),
                };
                self.mux.send(result.link, &msg, now_ms);
            }
            Lookup::Source { src_id } => {
                let pending = match self.pending.remove(&(result.link, src_id)) {
                    Some(pending) => pending,
                    None => return,
                };

                let dst = match result.addr {
                    Some(dst) => dst,
                    None => {
                        self.mux.send(result.link, &Message::DstClose { src_id }, now_ms);
                        return;
                    }
                };

                let stream = match socket::connect_nonblocking(SocketAddr::V4(dst)) {
                    Ok(stream) => stream,
                    Err(err) => {
                        log::info!("source {} connect to {} failed: {}", src_id, dst, err);
                        self.mux.send(result.link, &Message::DstClose { src_id }, now_ms);
                        return;
                    }
                };

                let id = self.mux.next_id();
                let mut conn = Conn::connecting(stream, self.mux.spill_dir(), id);

                conn.queue(&pending.early);

                if let Some(key) = self.mux.add_source(result.link, src_id, conn, now_ms) {
                    if pending.close_received {
                        self.mux.peer_closed(key, now_ms);
                    }
                }
            }
        }
    }
}

impl Daemon for Proxyd {
    fn reactor(&mut self) -> &mut Reactor {
        &mut self.mux.reactor
    }

    fn now_ms(&self) -> u64 {
        self.epoch.time_now_ms()
    }

    fn tick_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.config.tick_interval_ms)
    }

    fn handle_ready(&mut self, ready: Ready, now_ms: u64) {
        match self.role(ready.key) {
            Some(Role::Listener) => self.accept(now_ms),
            Some(Role::Link) => self.link_ready(ready, now_ms),
            Some(Role::Source) => self.mux.source_ready(ready, now_ms),
            None => log::debug!("event for stale key {}", ready.key),
        }
    }

    fn handle_wakeup(&mut self, now_ms: u64) {
        while let Ok(result) = self.results.try_recv() {
            self.handle_result(result, now_ms);
        }
    }

    fn handle_tick(&mut self, now_ms: u64) {
        let silent = self
            .mux
            .links
            .iter()
            .filter(|(_, link)| now_ms.saturating_sub(link.last_receive_ms) >= self.config.link_timeout_ms)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        for key in silent {
            log::info!("link {} silent, closing", key);
            self.close_link(key);
        }
    }

    fn shutdown(&mut self, _now_ms: u64) {
        self.mux.flush_links_blocking(SHUTDOWN_FLUSH_TIMEOUT);
        self.pending.clear();
    }
}
