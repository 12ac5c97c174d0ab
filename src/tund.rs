//! Far side of the TCP-over-UDP tunnel.
//!
//! Tunnel requests arrive on the control socket. Each accepted request gets a dedicated UDP socket
//! and channel whose port is announced back to the requester; streams opened on that channel are
//! connected to the requested destination.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time;

use crate::channel::{Channel, Side};
use crate::config::TundConfig;
use crate::epoch::Epoch;
use crate::error::Result;
use crate::frame::serial::{self, DATAGRAM_SIZE_MAX};
use crate::frame::{Control, Datagram};
use crate::mac::RequestMacHasher;
use crate::obfs::{self, Obfuscator};
use crate::reactor::{Daemon, Key, Reactor, Ready};
use crate::socket;
use crate::tunnel::TunnelTable;

enum Role {
    Control,
    Tunnel,
    Local,
}

pub struct Tund {
    config: TundConfig,
    epoch: Epoch,
    table: TunnelTable,
    control: UdpSocket,
    control_key: Key,
    mac: RequestMacHasher,
    obfs: Box<dyn Obfuscator>,
    // (requester, destination) to tunnel
    by_request: HashMap<(SocketAddr, SocketAddrV4), Key>,
    buffer: Box<[u8]>,
}

impl Tund {
    pub fn new(config: TundConfig) -> Result<Self> {
        config.validate()?;

        let mut reactor = Reactor::new()?;

        let control = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], config.bind_port)))?;
        let control_key = reactor.add(&control, true, false)?;

        log::info!("accepting tunnel requests on {}", control.local_addr()?);

        let table = TunnelTable::new(reactor, config.spill_dir.clone(), config.session_limit);

        Ok(Self {
            mac: RequestMacHasher::new(&config.im),
            obfs: obfs::from_name(&config.obfuscation)?,
            config,
            epoch: Epoch::new(),
            table,
            control,
            control_key,
            by_request: HashMap::new(),
            buffer: vec![0; DATAGRAM_SIZE_MAX + 1].into_boxed_slice(),
        })
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn tunnel_count(&self) -> usize {
        self.table.tunnels.len()
    }

    fn role(&self, key: Key) -> Option<Role> {
        if key == self.control_key {
            Some(Role::Control)
        } else if self.table.tunnels.contains_key(&key) {
            Some(Role::Tunnel)
        } else if self.table.locals.contains_key(&key) {
            Some(Role::Local)
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

            let request = match serial::read_datagram(&self.buffer[..len], &*self.obfs) {
                Some(Datagram::Control(Control::ApplyForTunnel { dst, mac })) => (dst, mac),
                _ => {
                    log::warn!("dropping malformed request from {}", from);
                    continue;
                }
            };

            let (dst, mac) = request;

            if mac != self.mac.compute_tunnel(&dst) {
                log::warn!("dropping request from {} with bad mac", from);
                continue;
            }

            match self.tunnel_for(from, dst, now_ms) {
                Ok(port) => {
                    let datagram = serial::write_control(&Control::TunnelPortAnnounce { port }, &*self.obfs);
                    socket::send_to(&self.control, &datagram, &from);
                }
                Err(err) => log::warn!("failed to open tunnel for {} to {}: {}", from, dst, err),
            }
        }

        if let Err(err) = self.table.reactor.rearm(&self.control, self.control_key, true, false) {
            log::error!("failed to rearm control socket: {}", err);
        }
    }

    // Returns the port of the tunnel serving a request, creating the tunnel if needed
    fn tunnel_for(&mut self, from: SocketAddr, dst: SocketAddrV4, now_ms: u64) -> Result<u16> {
        if let Some(key) = self.by_request.get(&(from, dst)) {
            if let Some(port) = self.table.tunnels.get(key).and_then(|tunnel| tunnel.local_port()) {
                return Ok(port);
            }
        }

        let socket = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let port = socket.local_addr()?.port();
        let id = self.table.next_id();

        let channel = Channel::new(
            Side::Far,
            self.config.channel.clone(),
            self.table.spill_dir(),
            id,
            obfs::from_name(&self.config.obfuscation)?,
            now_ms,
        );

        let key = self.table.add_tunnel(socket, channel, dst)?;

        log::info!("new tunnel {} for {} to {} on port {}", key, from, dst, port);

        self.by_request.insert((from, dst), key);

        Ok(port)
    }
}

impl Daemon for Tund {
    fn reactor(&mut self) -> &mut Reactor {
        &mut self.table.reactor
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
            Some(Role::Tunnel) => self.table.tunnel_readable(ready.key, now_ms, |_, _, _| false),
            Some(Role::Local) => self.table.local_ready(ready, now_ms),
            None => log::debug!("event for stale key {}", ready.key),
        }
    }

    fn handle_tick(&mut self, now_ms: u64) {
        self.table.tick(now_ms, None);

        let ref tunnels = self.table.tunnels;
        self.by_request.retain(|_, key| tunnels.contains_key(key));
    }

    fn shutdown(&mut self, now_ms: u64) {
        log::info!("closing {} tunnels", self.table.tunnels.len());

        self.table.close_all(now_ms);
    }
}
