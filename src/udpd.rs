//! Far side of the UDP relay.
//!
//! Relay requests arrive on the control socket. Every origin source gets one far binding socket,
//! shared by all destinations it talks to, so peers that learned the binding's address from a
//! third party can reach the source through it. Routing on a binding is decided by its
//! [`Rooms`] table.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time;

use crate::config::UdpdConfig;
use crate::epoch::Epoch;
use crate::error::Result;
use crate::frame::serial::{self, DATAGRAM_SIZE_MAX};
use crate::frame::{Control, Datagram};
use crate::mac::RequestMacHasher;
use crate::nat::{Rooms, Route};
use crate::obfs::{self, Obfuscator};
use crate::reactor::{Daemon, Key, Reactor, Ready};
use crate::socket;

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

// Near host and origin source served by a binding
type BindingId = (Ipv4Addr, SocketAddrV4);

struct Binding {
    id: BindingId,
    socket: UdpSocket,
    rooms: Rooms,
}

enum Role {
    Control,
    Binding,
}

pub struct Udpd {
    config: UdpdConfig,
    epoch: Epoch,
    reactor: Reactor,
    control: UdpSocket,
    control_key: Key,
    mac: RequestMacHasher,
    obfs: Box<dyn Obfuscator>,
    bindings: HashMap<Key, Binding>,
    by_id: HashMap<BindingId, Key>,
    buffer: Box<[u8]>,
}

impl Udpd {
    pub fn new(config: UdpdConfig) -> Result<Self> {
        config.validate()?;

        let mut reactor = Reactor::new()?;

        let control = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], config.bind_port)))?;
        let control_key = reactor.add(&control, true, false)?;

        log::info!("accepting relay requests on {}", control.local_addr()?);

        Ok(Self {
            mac: RequestMacHasher::new(&config.im),
            obfs: obfs::from_name(&config.obfuscation)?,
            config,
            epoch: Epoch::new(),
            reactor,
            control,
            control_key,
            bindings: HashMap::new(),
            by_id: HashMap::new(),
            buffer: vec![0; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn role(&self, key: Key) -> Option<Role> {
        if key == self.control_key {
            Some(Role::Control)
        } else if self.bindings.contains_key(&key) {
            Some(Role::Binding)
        } else {
            None
        }
    }

    fn control_readable(&mut self, now_ms: u64) {
        loop {
            let (len, from) = match socket::try_recv_from(&self.control, &mut self.buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("control receive failed: {}", err);
                    break;
                }
            };

            let near = match from {
                SocketAddr::V4(addr) if len <= DATAGRAM_SIZE_MAX => addr,
                _ => {
                    log::debug!("dropping datagram from {}", from);
                    continue;
                }
            };

            let (src, dst) = match serial::read_datagram(&self.buffer[..len], &*self.obfs) {
                Some(Datagram::Control(Control::ApplyForRelay { src, dst, mac })) => {
                    if mac != self.mac.compute_relay(&src, &dst) {
                        log::warn!("dropping request from {} with bad mac", from);
                        continue;
                    }

                    (src, dst)
                }
                _ => {
                    log::warn!("dropping malformed request from {}", from);
                    continue;
                }
            };

            let key = match self.binding_for((*near.ip(), src)) {
                Ok(key) => key,
                Err(err) => {
                    log::warn!("failed to bind for {}: {}", src, err);
                    continue;
                }
            };

            if let Some(binding) = self.bindings.get_mut(&key) {
                let (role, flushed) = binding.rooms.apply(near, dst, now_ms);

                // Diagnostic only, the shared binding socket serves both roles
                log::debug!("binding {} room {} ({:?})", key, dst, role);

                for datagram in flushed {
                    socket::send_to(&binding.socket, &datagram, &from);
                }

                let port = match binding.socket.local_addr() {
                    Ok(addr) => addr.port(),
                    Err(err) => {
                        log::warn!("binding {} has no address: {}", key, err);
                        continue;
                    }
                };

                let datagram = serial::write_control(&Control::TunnelPortAnnounce { port }, &*self.obfs);
                socket::send_to(&self.control, &datagram, &from);
            }
        }

        if let Err(err) = self.reactor.rearm(&self.control, self.control_key, true, false) {
            log::error!("failed to rearm control socket: {}", err);
        }
    }

    fn binding_for(&mut self, id: BindingId) -> Result<Key> {
        if let Some(&key) = self.by_id.get(&id) {
            if self.bindings.contains_key(&key) {
                return Ok(key);
            }
        }

        let socket = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let key = self.reactor.add(&socket, true, false)?;

        log::info!("new binding {} for {} from {} on {}", key, id.1, id.0, socket.local_addr()?);

        self.bindings.insert(
            key,
            Binding {
                id,
                socket,
                rooms: Rooms::new(self.config.pending_max),
            },
        );
        self.by_id.insert(id, key);

        Ok(key)
    }

    fn binding_readable(&mut self, key: Key, now_ms: u64) {
        loop {
            let binding = match self.bindings.get_mut(&key) {
                Some(binding) => binding,
                None => return,
            };

            let (len, from) = match socket::try_recv_from(&binding.socket, &mut self.buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("binding {} receive failed: {}", key, err);
                    break;
                }
            };

            let from = match from {
                SocketAddr::V4(addr) => addr,
                SocketAddr::V6(_) => continue,
            };

            let data = &self.buffer[..len];

            match binding.rooms.route(from, data, now_ms) {
                Route::ToDst(dst) => socket::send_to(&binding.socket, data, &SocketAddr::V4(dst)),
                Route::ToNear(near) => socket::send_to(&binding.socket, data, &SocketAddr::V4(near)),
                Route::Buffered => log::debug!("binding {} holding datagram from {}", key, from),
                Route::Dropped => (),
            }
        }

        if let Some(binding) = self.bindings.get(&key) {
            if let Err(err) = self.reactor.rearm(&binding.socket, key, true, false) {
                log::error!("failed to rearm binding {}: {}", key, err);
            }
        }
    }

    fn close_binding(&mut self, key: Key) {
        if let Some(binding) = self.bindings.remove(&key) {
            self.reactor.remove(&binding.socket);

            if self.by_id.get(&binding.id) == Some(&key) {
                self.by_id.remove(&binding.id);
            }

            log::info!("binding {} for {} closed", key, binding.id.1);
        }
    }
}

impl Daemon for Udpd {
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
            Some(Role::Control) => self.control_readable(now_ms),
            Some(Role::Binding) => self.binding_readable(ready.key, now_ms),
            None => log::debug!("event for stale key {}", ready.key),
        }
    }

    fn handle_tick(&mut self, now_ms: u64) {
        let mut empty = Vec::new();

        for (key, binding) in self.bindings.iter_mut() {
            for room in binding.rooms.expire(now_ms, self.config.relay_timeout_ms) {
                log::debug!("binding {} room {} idle", key, room.dst);
            }

            if binding.rooms.is_empty() {
                empty.push(*key);
            }
        }

        for key in empty {
            self.close_binding(key);
        }
    }

    fn shutdown(&mut self, _now_ms: u64) {
        let keys = self.bindings.keys().copied().collect::<Vec<_>>();

        for key in keys {
            self.close_binding(key);
        }
    }
}
