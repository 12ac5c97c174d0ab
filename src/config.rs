//! JSON configuration for the daemons. Every field has a default, so an empty object (or no file
//! at all) is a valid configuration.

use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::obfs;

const IM_LEN_MAX: usize = u8::MAX as usize;

/// Tuning for a reliable datagram channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Age after which an unconfirmed pack (or FIN) is sent again, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub resend_interval_ms: u64,

    /// Number of resends after which an unconfirmed pack terminates the channel.
    ///
    /// Minimum value: 1 \
    /// Default value: 20
    pub resend_limit: u32,

    /// Interval between stream status broadcasts and keepalives, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub status_interval_ms: u64,

    /// Maximum number of packs sent but not yet confirmed.
    ///
    /// Minimum value: 1 \
    /// Default value: 2,000
    pub inflight_limit: usize,

    /// Maximum number of miss ranges sent in reply to a single status.
    ///
    /// Minimum value: 1 \
    /// Default value: 32
    pub miss_ranges_max: usize,

    /// Idle timeout for a stream that has not carried any data yet, in milliseconds.
    ///
    /// Default value: 10,000
    pub connecting_timeout_ms: u64,

    /// Idle timeout for an established stream, in milliseconds.
    ///
    /// Default value: 600,000
    pub idle_timeout_ms: u64,

    /// Time without any datagram from the peer after which the channel is torn down, in
    /// milliseconds.
    ///
    /// Default value: 120,000
    pub channel_timeout_ms: u64,

    /// Size of an outbox spill chunk, in bytes.
    ///
    /// Default value: 1,460,000
    pub chunk_size: usize,

    /// Number of closed stream ids remembered so that late packs cannot reopen them.
    ///
    /// Default value: 4,096
    pub tombstones_max: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            resend_interval_ms: 1000,
            resend_limit: 20,
            status_interval_ms: 1000,
            inflight_limit: 2000,
            miss_ranges_max: 32,
            connecting_timeout_ms: 10_000,
            idle_timeout_ms: 600_000,
            channel_timeout_ms: 120_000,
            chunk_size: crate::spill::CHANNEL_CHUNK_SIZE,
            tombstones_max: 4096,
        }
    }
}

fn nonzero(value: u64, name: &str) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{} must be greater than zero", name)));
    }

    Ok(())
}

fn validate_im(im: &str) -> Result<()> {
    if im.is_empty() {
        return Err(Error::Config("im must not be empty".into()));
    }

    if im.len() > IM_LEN_MAX {
        return Err(Error::Config(format!("im is longer than {} bytes", IM_LEN_MAX)));
    }

    Ok(())
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        nonzero(self.resend_interval_ms, "resend_interval_ms")?;
        nonzero(self.resend_limit as u64, "resend_limit")?;
        nonzero(self.status_interval_ms, "status_interval_ms")?;
        nonzero(self.inflight_limit as u64, "inflight_limit")?;
        nonzero(self.miss_ranges_max as u64, "miss_ranges_max")?;
        nonzero(self.connecting_timeout_ms, "connecting_timeout_ms")?;
        nonzero(self.idle_timeout_ms, "idle_timeout_ms")?;
        nonzero(self.channel_timeout_ms, "channel_timeout_ms")?;
        nonzero(self.chunk_size as u64, "chunk_size")?;
        nonzero(self.tombstones_max as u64, "tombstones_max")?;

        Ok(())
    }
}

/// A listening port whose connections all go to one fixed destination.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Forward {
    pub listen_port: u16,
    pub dst: String,
}

impl Forward {
    pub fn dst_addr(&self) -> Result<SocketAddrV4> {
        parse_v4(&self.dst)
    }
}

/// Resolves `addr` to its first IPv4 address.
pub fn parse_v4(addr: &str) -> Result<SocketAddrV4> {
    let resolved = addr
        .to_socket_addrs()
        .map_err(|err| Error::Addr(format!("{}: {}", addr, err)))?;

    for candidate in resolved {
        if let SocketAddr::V4(v4) = candidate {
            return Ok(v4);
        }
    }

    Err(Error::Addr(format!("{}: no IPv4 address", addr)))
}

fn default_im() -> String {
    "packtun".into()
}

fn default_spill_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_obfuscation() -> String {
    "swap".into()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TunConfig {
    /// Control address of `tund`.
    pub tund_addr: String,

    /// Port receiving redirected connections, whose destination is read with SO_ORIGINAL_DST.
    pub redir_port: Option<u16>,

    /// Static port forwards.
    pub forwards: Vec<Forward>,

    pub spill_dir: PathBuf,
    pub im: String,
    pub obfuscation: String,

    /// Default value: 100
    pub tick_interval_ms: u64,

    /// Maximum number of local sockets. Defaults to the descriptor ceiling.
    pub session_limit: Option<usize>,

    pub channel: ChannelConfig,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            tund_addr: "127.0.0.1:4000".into(),
            redir_port: None,
            forwards: Vec::new(),
            spill_dir: default_spill_dir(),
            im: default_im(),
            obfuscation: default_obfuscation(),
            tick_interval_ms: 100,
            session_limit: None,
            channel: Default::default(),
        }
    }
}

impl TunConfig {
    pub fn validate(&self) -> Result<()> {
        parse_v4(&self.tund_addr)?;

        if self.redir_port.is_none() && self.forwards.is_empty() {
            return Err(Error::Config("neither redir_port nor forwards are set".into()));
        }

        for forward in self.forwards.iter() {
            forward.dst_addr()?;
        }

        validate_im(&self.im)?;
        obfs::from_name(&self.obfuscation)?;
        nonzero(self.tick_interval_ms, "tick_interval_ms")?;
        validate_session_limit(self.session_limit)?;

        self.channel.validate()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TundConfig {
    /// Port receiving tunnel requests.
    pub bind_port: u16,

    pub spill_dir: PathBuf,
    pub im: String,
    pub obfuscation: String,

    /// Default value: 100
    pub tick_interval_ms: u64,

    pub session_limit: Option<usize>,

    pub channel: ChannelConfig,
}

impl Default for TundConfig {
    fn default() -> Self {
        Self {
            bind_port: 4000,
            spill_dir: default_spill_dir(),
            im: default_im(),
            obfuscation: default_obfuscation(),
            tick_interval_ms: 100,
            session_limit: None,
            channel: Default::default(),
        }
    }
}

impl TundConfig {
    pub fn validate(&self) -> Result<()> {
        validate_im(&self.im)?;
        obfs::from_name(&self.obfuscation)?;
        nonzero(self.tick_interval_ms, "tick_interval_ms")?;
        validate_session_limit(self.session_limit)?;

        self.channel.validate()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Port receiving redirected datagrams.
    pub redir_port: u16,

    /// Control address of `udpd`.
    pub udpd_addr: String,

    pub im: String,
    pub obfuscation: String,

    /// Connection tracking table used to recover original destinations.
    pub conntrack_path: PathBuf,

    /// Where to dump the conntrack table when a lookup misses.
    pub snapshot_path: Option<PathBuf>,

    /// Idle time after which a relay is closed, in milliseconds.
    ///
    /// Default value: 60,000
    pub relay_timeout_ms: u64,

    /// Datagrams buffered per relay while its far port is unknown.
    ///
    /// Default value: 64
    pub pending_max: usize,

    /// Number of unanswered relay requests after which a relay is abandoned.
    ///
    /// Default value: 20
    pub resend_limit: u32,

    /// Default value: 1,000
    pub tick_interval_ms: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            redir_port: 5300,
            udpd_addr: "127.0.0.1:5000".into(),
            im: default_im(),
            obfuscation: default_obfuscation(),
            conntrack_path: "/proc/net/nf_conntrack".into(),
            snapshot_path: None,
            relay_timeout_ms: 60_000,
            pending_max: 64,
            resend_limit: 20,
            tick_interval_ms: 1000,
        }
    }
}

impl UdpConfig {
    pub fn validate(&self) -> Result<()> {
        parse_v4(&self.udpd_addr)?;
        validate_im(&self.im)?;
        obfs::from_name(&self.obfuscation)?;
        nonzero(self.relay_timeout_ms, "relay_timeout_ms")?;
        nonzero(self.pending_max as u64, "pending_max")?;
        nonzero(self.resend_limit as u64, "resend_limit")?;
        nonzero(self.tick_interval_ms, "tick_interval_ms")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpdConfig {
    pub bind_port: u16,
    pub im: String,
    pub obfuscation: String,

    /// Default value: 60,000
    pub relay_timeout_ms: u64,

    /// Datagrams buffered per unknown peer until a room claims them.
    ///
    /// Default value: 64
    pub pending_max: usize,

    /// Default value: 1,000
    pub tick_interval_ms: u64,
}

impl Default for UdpdConfig {
    fn default() -> Self {
        Self {
            bind_port: 5000,
            im: default_im(),
            obfuscation: default_obfuscation(),
            relay_timeout_ms: 60_000,
            pending_max: 64,
            tick_interval_ms: 1000,
        }
    }
}

impl UdpdConfig {
    pub fn validate(&self) -> Result<()> {
        validate_im(&self.im)?;
        obfs::from_name(&self.obfuscation)?;
        nonzero(self.relay_timeout_ms, "relay_timeout_ms")?;
        nonzero(self.pending_max as u64, "pending_max")?;
        nonzero(self.tick_interval_ms, "tick_interval_ms")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address of `proxyd`.
    pub proxyd_addr: String,

    pub redir_port: Option<u16>,
    pub forwards: Vec<Forward>,
    pub im: String,
    pub spill_dir: PathBuf,

    /// Default value: 10,000
    pub heartbeat_interval_ms: u64,

    /// Write queue size above which the peer is asked to stop reading, in bytes.
    ///
    /// Default value: 4,194,304
    pub overflow_bytes: usize,

    pub session_limit: Option<usize>,

    /// Default value: 500
    pub tick_interval_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxyd_addr: "127.0.0.1:6000".into(),
            redir_port: None,
            forwards: Vec::new(),
            im: default_im(),
            spill_dir: default_spill_dir(),
            heartbeat_interval_ms: 10_000,
            overflow_bytes: 4 * 1024 * 1024,
            session_limit: None,
            tick_interval_ms: 500,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        parse_v4(&self.proxyd_addr)?;

        if self.redir_port.is_none() && self.forwards.is_empty() {
            return Err(Error::Config("neither redir_port nor forwards are set".into()));
        }

        validate_im(&self.im)?;
        nonzero(self.heartbeat_interval_ms, "heartbeat_interval_ms")?;
        nonzero(self.overflow_bytes as u64, "overflow_bytes")?;
        validate_session_limit(self.session_limit)?;
        nonzero(self.tick_interval_ms, "tick_interval_ms")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxydConfig {
    pub bind_port: u16,
    pub im: String,
    pub spill_dir: PathBuf,

    /// Silence after which a relay link is closed, in milliseconds.
    ///
    /// Default value: 60,000
    pub link_timeout_ms: u64,

    /// Default value: 4,194,304
    pub overflow_bytes: usize,

    pub session_limit: Option<usize>,

    /// Default value: 500
    pub tick_interval_ms: u64,
}

impl Default for ProxydConfig {
    fn default() -> Self {
        Self {
            bind_port: 6000,
            im: default_im(),
            spill_dir: default_spill_dir(),
            link_timeout_ms: 60_000,
            overflow_bytes: 4 * 1024 * 1024,
            session_limit: None,
            tick_interval_ms: 500,
        }
    }
}

impl ProxydConfig {
    pub fn validate(&self) -> Result<()> {
        validate_im(&self.im)?;
        nonzero(self.link_timeout_ms, "link_timeout_ms")?;
        nonzero(self.overflow_bytes as u64, "overflow_bytes")?;
        validate_session_limit(self.session_limit)?;
        nonzero(self.tick_interval_ms, "tick_interval_ms")
    }
}

fn validate_session_limit(limit: Option<usize>) -> Result<()> {
    match limit {
        Some(limit) if limit < 2 => Err(Error::Config("session_limit must be at least 2".into())),
        _ => Ok(()),
    }
}

/// Loads a configuration file. No path, or a path that does not exist, yields the defaults.
pub fn load<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = match path {
        Some(path) => path,
        None => return Ok(T::default()),
    };

    match std::fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("{} not found, using defaults", path.display());
            Ok(T::default())
        }
        Err(err) => Err(err.into()),
    }
}
