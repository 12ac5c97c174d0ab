//! Near side of the multiplexed TCP relay.
//!
//! Every accepted connection becomes a source on the single link to `proxyd`. The link is
//! reconnected when lost; sources of a lost link are reset.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time;

use crate::channel::Side;
use crate::config::{self, ProxyConfig};
use crate::conn::Conn;
use crate::epoch::Epoch;
use crate::error::Result;
use crate::frame::relay::{self, Message, SourceId};
use crate::mux::{LinkInput, Mux};
use crate::reactor::{Daemon, Key, Reactor, Ready};
use crate::socket;

const SHUTDOWN_FLUSH_TIMEOUT: time::Duration = time::Duration::from_secs(2);

enum Target {
    Redirect,
    Fixed(String),
}

struct Listener {
    listener: TcpListener,
    target: Target,
}

enum Role {
    Listener,
    Link,
    Source,
}

pub struct Proxy {
    config: ProxyConfig,
    epoch: Epoch,
    mux: Mux,
    proxyd_addr: SocketAddr,
    listeners: HashMap<Key, Listener>,
    link: Option<Key>,
    next_src_id: SourceId,
    next_query_id: u64,
    answers: HashMap<u64, Option<Ipv4Addr>>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let proxyd_addr = SocketAddr::V4(config::parse_v4(&config.proxyd_addr)?);
        let mut reactor = Reactor::new()?;
        let mut listeners = HashMap::new();

        if let Some(port) = config.redir_port {
            let listener = socket::listen_tcp(SocketAddr::from(([0, 0, 0, 0], port)))?;
            let key = reactor.add(&listener, true, false)?;

            log::info!("accepting redirected connections on {}", listener.local_addr()?);

            listeners.insert(
                key,
                Listener {
                    listener,
                    target: Target::Redirect,
                },
            );
        }

        for forward in config.forwards.iter() {
            let listener = socket::listen_tcp(SocketAddr::from(([0, 0, 0, 0], forward.listen_port)))?;
            let key = reactor.add(&listener, true, false)?;

            log::info!("forwarding {} to {}", listener.local_addr()?, forward.dst);

            listeners.insert(
                key,
                Listener {
                    listener,
                    target: Target::Fixed(forward.dst.clone()),
                },
            );
        }

        let mux = Mux::new(
            reactor,
            Side::Near,
            config.spill_dir.clone(),
            config.session_limit,
            config.overflow_bytes,
        );

        Ok(Self {
            config,
            epoch: Epoch::new(),
            mux,
            proxyd_addr,
            listeners,
            link: None,
            next_src_id: 1,
            next_query_id: 1,
            answers: HashMap::new(),
        })
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|listener| listener.listener.local_addr().ok())
            .collect()
    }

    pub fn source_count(&self) -> usize {
        self.mux.source_count()
    }

    pub fn is_linked(&self) -> bool {
        self.link.map_or(false, |key| self.mux.links.contains_key(&key))
    }

    /// Asks `proxyd` to resolve `domain`. The answer shows up in [`Proxy::take_answer`].
    pub fn query(&mut self, domain: &str, dns_type: u8, now_ms: u64) -> Option<u64> {
        let link_key = self.ensure_link(now_ms)?;

        let near_id = self.next_query_id;
        self.next_query_id += 1;

        let msg = Message::Query {
            near_id,
            dns_type,
            domain,
        };
        self.mux.send(link_key, &msg, now_ms);

        Some(near_id)
    }

    pub fn take_answer(&mut self, near_id: u64) -> Option<Option<Ipv4Addr>> {
        self.answers.remove(&near_id)
    }

    fn role(&self, key: Key) -> Option<Role> {
        if self.listeners.contains_key(&key) {
            Some(Role::Listener)
        } else if self.mux.links.contains_key(&key) {
            Some(Role::Link)
        } else if self.mux.sources.contains_key(&key) {
            Some(Role::Source)
        } else {
            None
        }
    }

    // Returns the live link, connecting a new one if needed
    fn ensure_link(&mut self, now_ms: u64) -> Option<Key> {
        if let Some(key) = self.link {
            if self.mux.links.contains_key(&key) {
                return Some(key);
            }
        }

        self.link = None;

        let stream = match socket::connect_nonblocking(self.proxyd_addr) {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("failed to connect to {}: {}", self.proxyd_addr, err);
                return None;
            }
        };

        let id = self.mux.next_id();
        let mut conn = Conn::connecting(stream, self.mux.spill_dir(), id);

        let mut hello = Vec::new();
        relay::write_hello(&mut hello, &self.config.im);
        conn.queue(&hello);

        let key = match self.mux.add_link(conn, now_ms) {
            Ok(key) => key,
            Err(err) => {
                log::warn!("failed to register link: {}", err);
                return None;
            }
        };

        if let Some(link) = self.mux.links.get_mut(&key) {
            link.greeted = true;
        }

        log::info!("link {} connecting to {}", key, self.proxyd_addr);

        self.link = Some(key);

        Some(key)
    }

    fn accept(&mut self, key: Key, now_ms: u64) {
        loop {
            let listener = match self.listeners.get(&key) {
                Some(listener) => listener,
                None => return,
            };

            let (stream, peer) = match listener.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    break;
                }
            };

            let destination = match listener.target {
                Target::Redirect => match socket::original_dst(&stream) {
                    Ok(dst) => dst.to_string(),
                    Err(err) => {
                        log::warn!("no original destination for {}: {}", peer, err);
                        continue;
                    }
                },
                Target::Fixed(ref dst) => dst.clone(),
            };

            if let Err(err) = self.open_source(stream, &destination, now_ms) {
                log::warn!("failed to relay {} to {}: {}", peer, destination, err);
            }
        }

        if let Some(listener) = self.listeners.get(&key) {
            if let Err(err) = self.mux.reactor.rearm(&listener.listener, key, true, false) {
                log::error!("failed to rearm listener: {}", err);
            }
        }
    }

    fn open_source(&mut self, stream: TcpStream, destination: &str, now_ms: u64) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let link_key = match self.ensure_link(now_ms) {
            Some(key) => key,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "no relay link")),
        };

        let src_id = self.next_src_id;
        self.next_src_id += 1;

        log::debug!("source {} to {}", src_id, destination);

        let msg = Message::NewSource {
            src_id,
            destination,
        };
        self.mux.send(link_key, &msg, now_ms);

        let id = self.mux.next_id();
        let conn = Conn::new(stream, self.mux.spill_dir(), id);

        self.mux.add_source(link_key, src_id, conn, now_ms);

        Ok(())
    }

    fn link_ready(&mut self, ready: Ready, now_ms: u64) {
        if ready.writable && !self.mux.link_writable(ready.key) {
            return;
        }

        if ready.readable {
            let input = self.mux.fill_link(ready.key, now_ms);

            loop {
                let frame = match self.mux.next_frame(ready.key) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(()) => {
                        log::warn!("link {} sent an empty frame", ready.key);
                        self.mux.close_link(ready.key);
                        return;
                    }
                };

                let msg = match relay::read_message(&frame) {
                    Some(msg) => msg,
                    None => {
                        log::warn!("link {} sent a malformed message", ready.key);
                        self.mux.close_link(ready.key);
                        return;
                    }
                };

                match self.mux.dispatch(ready.key, msg, now_ms) {
                    Some(Message::Response { near_id, ip, .. }) => {
                        self.answers.insert(near_id, ip);
                    }
                    Some(other) => log::warn!("unexpected message {:?}", other),
                    None => (),
                }
            }

            match input {
                LinkInput::Open => (),
                LinkInput::Closed => {
                    log::warn!("link {} closed by proxyd", ready.key);
                    self.mux.close_link(ready.key);
                    return;
                }
                LinkInput::Failed(err) => {
                    log::warn!("link {} read failed: {}", ready.key, err);
                    self.mux.close_link(ready.key);
                    return;
                }
            }
        }

        self.mux.rearm_link(ready.key);
    }
}

impl Daemon for Proxy {
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
            Some(Role::Listener) => self.accept(ready.key, now_ms),
            Some(Role::Link) => self.link_ready(ready, now_ms),
            Some(Role::Source) => self.mux.source_ready(ready, now_ms),
            None => log::debug!("event for stale key {}", ready.key),
        }
    }

    fn handle_tick(&mut self, now_ms: u64) {
        let link_key = match self.ensure_link(now_ms) {
            Some(key) => key,
            None => return,
        };

        let idle = match self.mux.links.get(&link_key) {
            Some(link) => now_ms.saturating_sub(link.last_send_ms) >= self.config.heartbeat_interval_ms,
            None => false,
        };

        if idle {
            self.mux.send(link_key, &Message::Heartbeat, now_ms);
        }
    }

    fn shutdown(&mut self, _now_ms: u64) {
        self.mux.flush_links_blocking(SHUTDOWN_FLUSH_TIMEOUT);
    }
}
