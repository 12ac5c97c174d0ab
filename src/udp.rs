//! Near side of the UDP relay.
//!
//! Redirected datagrams arrive on one socket; their original flow is recovered from the connection
//! tracking table. Each flow gets a relay socket that applies to `udpd` for a far port and then
//! exchanges raw datagrams with it. Replies are written back to the flow's source through the
//! redirect socket, which the kernel translates back to the original destination.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time;

use crate::config::{self, UdpConfig};
use crate::epoch::Epoch;
use crate::error::Result;
use crate::frame::serial::{self, DATAGRAM_SIZE_MAX};
use crate::frame::{Control, Datagram};
use crate::mac::RequestMacHasher;
use crate::nat::{ConntrackSource, Origin, OriginResolver, ProcConntrack};
use crate::obfs::{self, Obfuscator};
use crate::reactor::{Daemon, Key, Reactor, Ready};
use crate::socket;

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

struct Relay {
    socket: UdpSocket,
    origin: Origin,
    // Far binding, once announced
    far_addr: Option<SocketAddr>,
    // Datagrams waiting for the far binding
    pending: VecDeque<Vec<u8>>,
    attempts: u32,
    last_traffic_ms: u64,
}

enum Role {
    Redirect,
    Relay,
}

pub struct Udp<S: ConntrackSource = ProcConntrack> {
    config: UdpConfig,
    epoch: Epoch,
    reactor: Reactor,
    redirect: UdpSocket,
    redirect_key: Key,
    resolver: OriginResolver<S>,
    udpd_addr: SocketAddrV4,
    mac: RequestMacHasher,
    obfs: Box<dyn Obfuscator>,
    relays: HashMap<Key, Relay>,
    by_origin: HashMap<Origin, Key>,
    buffer: Box<[u8]>,
}

impl Udp<ProcConntrack> {
    pub fn new(config: UdpConfig) -> Result<Self> {
        let source = ProcConntrack::new(&config.conntrack_path);
        Self::with_source(config, source)
    }
}

impl<S: ConntrackSource> Udp<S> {
    pub fn with_source(config: UdpConfig, source: S) -> Result<Self> {
        config.validate()?;

        let mut reactor = Reactor::new()?;

        let redirect = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], config.redir_port)))?;
        let redirect_key = reactor.add(&redirect, true, false)?;

        let redir_port = redirect.local_addr()?.port();

        log::info!("accepting redirected datagrams on port {}", redir_port);

        Ok(Self {
            resolver: OriginResolver::new(source, redir_port, config.snapshot_path.clone()),
            udpd_addr: config::parse_v4(&config.udpd_addr)?,
            mac: RequestMacHasher::new(&config.im),
            obfs: obfs::from_name(&config.obfuscation)?,
            config,
            epoch: Epoch::new(),
            reactor,
            redirect,
            redirect_key,
            relays: HashMap::new(),
            by_origin: HashMap::new(),
            buffer: vec![0; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    pub fn redirect_addr(&self) -> std::io::Result<SocketAddr> {
        self.redirect.local_addr()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    fn role(&self, key: Key) -> Option<Role> {
        if key == self.redirect_key {
            Some(Role::Redirect)
        } else if self.relays.contains_key(&key) {
            Some(Role::Relay)
        } else {
            None
        }
    }

    fn redirect_readable(&mut self, now_ms: u64) {
        loop {
            let (len, from) = match socket::try_recv_from(&self.redirect, &mut self.buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("redirect receive failed: {}", err);
                    break;
                }
            };

            let observed = match from {
                SocketAddr::V4(addr) => addr,
                SocketAddr::V6(addr) => {
                    log::debug!("dropping datagram from {}", addr);
                    continue;
                }
            };

            let origin = match self.resolver.resolve(observed) {
                Some(origin) => origin,
                None => continue,
            };

            let key = match self.relay_for(origin, now_ms) {
                Ok(key) => key,
                Err(err) => {
                    log::warn!("failed to open relay for {:?}: {}", origin, err);
                    continue;
                }
            };

            let datagram = self.buffer[..len].to_vec();

            if let Some(relay) = self.relays.get_mut(&key) {
                relay.last_traffic_ms = now_ms;

                match relay.far_addr {
                    Some(ref far_addr) => socket::send_to(&relay.socket, &datagram, far_addr),
                    None if relay.pending.len() < self.config.pending_max => relay.pending.push_back(datagram),
                    None => log::debug!("relay {} buffer full, dropping datagram", key),
                }
            }
        }

        if let Err(err) = self.reactor.rearm(&self.redirect, self.redirect_key, true, false) {
            log::error!("failed to rearm redirect socket: {}", err);
        }
    }

    fn relay_for(&mut self, origin: Origin, now_ms: u64) -> Result<Key> {
        if let Some(&key) = self.by_origin.get(&origin) {
            if self.relays.contains_key(&key) {
                return Ok(key);
            }
        }

        let socket = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let key = self.reactor.add(&socket, true, false)?;

        log::info!("new relay {} for {} -> {}", key, origin.src, origin.dst);

        self.relays.insert(
            key,
            Relay {
                socket,
                origin,
                far_addr: None,
                pending: VecDeque::new(),
                attempts: 0,
                last_traffic_ms: now_ms,
            },
        );
        self.by_origin.insert(origin, key);

        self.send_application(key);

        Ok(key)
    }

    fn send_application(&self, key: Key) {
        if let Some(relay) = self.relays.get(&key) {
            let ctl = Control::ApplyForRelay {
                src: relay.origin.src,
                dst: relay.origin.dst,
                mac: self.mac.compute_relay(&relay.origin.src, &relay.origin.dst),
            };

            let datagram = serial::write_control(&ctl, &*self.obfs);
            socket::send_to(&relay.socket, &datagram, &SocketAddr::V4(self.udpd_addr));
        }
    }

    fn relay_readable(&mut self, key: Key, now_ms: u64) {
        let control_addr = SocketAddr::V4(self.udpd_addr);

        loop {
            let relay = match self.relays.get_mut(&key) {
                Some(relay) => relay,
                None => return,
            };

            let (len, from) = match socket::try_recv_from(&relay.socket, &mut self.buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("relay {} receive failed: {}", key, err);
                    break;
                }
            };

            if Some(from) == relay.far_addr {
                relay.last_traffic_ms = now_ms;

                let src = SocketAddr::V4(relay.origin.src);
                socket::send_to(&self.redirect, &self.buffer[..len], &src);

                continue;
            }

            if from != control_addr || len > DATAGRAM_SIZE_MAX {
                log::debug!("relay {} dropping datagram from {}", key, from);
                continue;
            }

            match serial::read_datagram(&self.buffer[..len], &*self.obfs) {
                Some(Datagram::Control(Control::TunnelPortAnnounce { port })) => {
                    let far_addr = SocketAddr::new(control_addr.ip(), port);

                    if relay.far_addr != Some(far_addr) {
                        log::info!("relay {} uses far port {}", key, port);
                    }

                    relay.far_addr = Some(far_addr);

                    for datagram in relay.pending.drain(..) {
                        socket::send_to(&relay.socket, &datagram, &far_addr);
                    }
                }
                _ => log::warn!("relay {} got unexpected datagram from {}", key, from),
            }
        }

        if let Some(relay) = self.relays.get(&key) {
            if let Err(err) = self.reactor.rearm(&relay.socket, key, true, false) {
                log::error!("failed to rearm relay {}: {}", key, err);
            }
        }
    }

    fn close_relay(&mut self, key: Key) {
        if let Some(relay) = self.relays.remove(&key) {
            self.reactor.remove(&relay.socket);

            if self.by_origin.get(&relay.origin) == Some(&key) {
                self.by_origin.remove(&relay.origin);
            }
        }
    }
}

impl<S: ConntrackSource> Daemon for Udp<S> {
    fn reactor(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    fn now_ms(&self) -> u64 {
        self.epoch.time_now_ms()
    }

    fn tick_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.config.tick_interval_ms)
    }

    fn handle_ready(&mut self, ready: Ready, now_ms: u64) {
        match self.role(ready.key) {
            Some(Role::Redirect) => self.redirect_readable(now_ms),
            Some(Role::Relay) => self.relay_readable(ready.key, now_ms),
            None => log::debug!("event for stale key {}", ready.key),
        }
    }

    fn handle_tick(&mut self, now_ms: u64) {
        let mut due = Vec::new();
        let mut closed = Vec::new();

        for (key, relay) in self.relays.iter_mut() {
            if now_ms.saturating_sub(relay.last_traffic_ms) >= self.config.relay_timeout_ms {
                log::debug!("relay {} idle", key);
                closed.push(*key);
                continue;
            }

            if relay.far_addr.is_some() {
                continue;
            }

            if relay.attempts >= self.config.resend_limit {
                log::warn!("relay {} got no far port, giving up", key);
                closed.push(*key);
                continue;
            }

            relay.attempts += 1;

            due.push(*key);
        }

        for key in due {
            self.send_application(key);
        }

        for key in closed {
            self.close_relay(key);
        }
    }

    fn shutdown(&mut self, _now_ms: u64) {
        let keys = self.relays.keys().copied().collect::<Vec<_>>();

        for key in keys {
            self.close_relay(key);
        }
    }
}
