//! Near side of the TCP-over-UDP tunnel.
//!
//! Accepted connections are grouped by destination. Each destination gets its own channel and UDP
//! socket; the channel asks `tund` for a far port with an apply-for-tunnel request and starts
//! sending once the port is announced.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time;

use crate::channel::{Channel, Side};
use crate::config::{self, TunConfig};
use crate::conn::Conn;
use crate::epoch::Epoch;
use crate::error::Result;
use crate::frame::serial;
use crate::frame::{Control, Datagram};
use crate::mac::RequestMacHasher;
use crate::obfs::{self, Obfuscator};
use crate::reactor::{Daemon, Key, Reactor, Ready};
use crate::socket;
use crate::tunnel::TunnelTable;

enum Target {
    // Destination read from the redirected socket
    Redirect,
    Fixed(SocketAddrV4),
}

struct Listener {
    listener: TcpListener,
    target: Target,
}

// A tunnel still waiting for its far port
struct Application {
    attempts: u32,
    last_sent_ms: u64,
}

enum Role {
    Listener,
    Tunnel,
    Local,
}

pub struct Tun {
    config: TunConfig,
    epoch: Epoch,
    table: TunnelTable,
    tund_addr: SocketAddrV4,
    mac: RequestMacHasher,
    obfs: Box<dyn Obfuscator>,
    listeners: HashMap<Key, Listener>,
    by_dst: HashMap<SocketAddrV4, Key>,
    applications: HashMap<Key, Application>,
}

impl Tun {
    pub fn new(config: TunConfig) -> Result<Self> {
        config.validate()?;

        let tund_addr = config::parse_v4(&config.tund_addr)?;
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
            let dst = forward.dst_addr()?;
            let listener = socket::listen_tcp(SocketAddr::from(([0, 0, 0, 0], forward.listen_port)))?;
            let key = reactor.add(&listener, true, false)?;

            log::info!("forwarding {} to {}", listener.local_addr()?, dst);

            listeners.insert(
                key,
                Listener {
                    listener,
                    target: Target::Fixed(dst),
                },
            );
        }

        let table = TunnelTable::new(reactor, config.spill_dir.clone(), config.session_limit);

        Ok(Self {
            mac: RequestMacHasher::new(&config.im),
            obfs: obfs::from_name(&config.obfuscation)?,
            config,
            epoch: Epoch::new(),
            table,
            tund_addr,
            listeners,
            by_dst: HashMap::new(),
            applications: HashMap::new(),
        })
    }

    /// Local addresses of every listening socket.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|listener| listener.listener.local_addr().ok())
            .collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.table.tunnels.len()
    }

    fn role(&self, key: Key) -> Option<Role> {
        if self.listeners.contains_key(&key) {
            Some(Role::Listener)
        } else if self.table.tunnels.contains_key(&key) {
            Some(Role::Tunnel)
        } else if self.table.locals.contains_key(&key) {
            Some(Role::Local)
        } else {
            None
        }
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

            let dst = match listener.target {
                Target::Redirect => match socket::original_dst(&stream) {
                    Ok(dst) => dst,
                    Err(err) => {
                        log::warn!("no original destination for {}: {}", peer, err);
                        continue;
                    }
                },
                Target::Fixed(dst) => dst,
            };

            if let Err(err) = self.open_local(stream, dst, now_ms) {
                log::warn!("failed to tunnel {} to {}: {}", peer, dst, err);
            }
        }

        if let Some(listener) = self.listeners.get(&key) {
            if let Err(err) = self.table.reactor.rearm(&listener.listener, key, true, false) {
                log::error!("failed to rearm listener: {}", err);
            }
        }
    }

    fn open_local(&mut self, stream: TcpStream, dst: SocketAddrV4, now_ms: u64) -> Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let tunnel_key = self.tunnel_for(dst, now_ms)?;

        let stream_id = match self.table.tunnels.get_mut(&tunnel_key) {
            Some(tunnel) => tunnel.with_channel(|channel, host| channel.open_stream(now_ms, host)),
            None => return Ok(()),
        };

        let id = self.table.next_id();
        let conn = Conn::new(stream, self.table.spill_dir(), id);

        self.table.add_local(tunnel_key, stream_id, conn, now_ms);

        Ok(())
    }

    // Returns the tunnel carrying `dst`, creating it if needed
    fn tunnel_for(&mut self, dst: SocketAddrV4, now_ms: u64) -> Result<Key> {
        if let Some(&key) = self.by_dst.get(&dst) {
            if self.table.tunnels.contains_key(&key) {
                return Ok(key);
            }
        }

        let socket = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let id = self.table.next_id();

        let channel = Channel::new(
            Side::Near,
            self.config.channel.clone(),
            self.table.spill_dir(),
            id,
            obfs::from_name(&self.config.obfuscation)?,
            now_ms,
        );

        let key = self.table.add_tunnel(socket, channel, dst)?;

        log::info!("new tunnel {} to {}", key, dst);

        self.by_dst.insert(dst, key);
        self.applications.insert(
            key,
            Application {
                attempts: 0,
                last_sent_ms: now_ms,
            },
        );

        self.send_application(key);

        Ok(key)
    }

    fn send_application(&self, key: Key) {
        if let Some(tunnel) = self.table.tunnels.get(&key) {
            let ctl = Control::ApplyForTunnel {
                dst: tunnel.dst,
                mac: self.mac.compute_tunnel(&tunnel.dst),
            };

            let datagram = serial::write_control(&ctl, &*self.obfs);
            socket::send_to(&tunnel.socket, &datagram, &SocketAddr::V4(self.tund_addr));
        }
    }

    fn tunnel_readable(&mut self, key: Key, now_ms: u64) {
        let control_addr = SocketAddr::V4(self.tund_addr);
        let ref mut applications = self.applications;
        let obfs = &*self.obfs;

        self.table.tunnel_readable(key, now_ms, |tunnel, from, bytes| {
            // Channel traffic comes from the announced port, never from the control port
            if from != control_addr {
                return false;
            }

            match serial::read_datagram(bytes, obfs) {
                Some(Datagram::Control(Control::TunnelPortAnnounce { port })) => {
                    let peer = SocketAddr::new(control_addr.ip(), port);

                    if applications.remove(&key).is_some() {
                        log::info!("tunnel {} to {} uses far port {}", key, tunnel.dst, port);
                    }

                    tunnel.with_channel(|channel, host| channel.set_peer(peer, now_ms, host));
                }
                _ => log::warn!("unexpected datagram from {}", from),
            }

            true
        });
    }

    fn resend_applications(&mut self, now_ms: u64) {
        let interval = self.config.channel.resend_interval_ms;
        let limit = self.config.channel.resend_limit;

        let mut due = Vec::new();
        let mut abandoned = Vec::new();

        for (key, application) in self.applications.iter_mut() {
            if now_ms.saturating_sub(application.last_sent_ms) < interval {
                continue;
            }

            if application.attempts >= limit {
                abandoned.push(*key);
                continue;
            }

            application.attempts += 1;
            application.last_sent_ms = now_ms;

            due.push(*key);
        }

        for key in due {
            self.send_application(key);
        }

        for key in abandoned {
            log::warn!("tunnel {} got no far port, giving up", key);

            self.applications.remove(&key);
            self.table.close_tunnel(key, false, now_ms);
        }
    }
}

impl Daemon for Tun {
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
            Some(Role::Listener) => self.accept(ready.key, now_ms),
            Some(Role::Tunnel) => self.tunnel_readable(ready.key, now_ms),
            Some(Role::Local) => self.table.local_ready(ready, now_ms),
            None => log::debug!("event for stale key {}", ready.key),
        }
    }

    fn handle_tick(&mut self, now_ms: u64) {
        self.resend_applications(now_ms);

        self.table
            .tick(now_ms, Some(self.config.channel.connecting_timeout_ms));

        let ref tunnels = self.table.tunnels;
        self.applications.retain(|key, _| tunnels.contains_key(key));
        self.by_dst.retain(|_, key| tunnels.contains_key(key));
    }

    fn shutdown(&mut self, now_ms: u64) {
        log::info!("closing {} tunnels", self.table.tunnels.len());

        self.table.close_all(now_ms);
    }
}
