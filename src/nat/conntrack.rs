//! Recovery of the original destination of redirected UDP datagrams from the kernel's connection
//! tracking table.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tuple {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub protocol: String,
    // Seconds until the entry expires
    pub timeout: u64,
    pub forward: Tuple,
    pub reply: Tuple,
    pub unreplied: bool,
    pub assured: bool,
}

/// Where a redirected datagram was originally headed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Origin {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

#[derive(Default)]
struct TupleBuilder {
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
    sport: Option<u16>,
    dport: Option<u16>,
}

impl TupleBuilder {
    fn is_complete(&self) -> bool {
        self.src.is_some() && self.dst.is_some() && self.sport.is_some() && self.dport.is_some()
    }

    fn build(&self) -> Option<Tuple> {
        Some(Tuple {
            src: SocketAddrV4::new(self.src?, self.sport?),
            dst: SocketAddrV4::new(self.dst?, self.dport?),
        })
    }
}

fn parse_record(line: &str) -> Option<Record> {
    let mut tokens = line.split_whitespace().peekable();

    // nf_conntrack prefixes the layer 3 protocol, ip_conntrack does not
    if let Some(&"ipv4") | Some(&"ipv6") = tokens.peek() {
        tokens.next();
        tokens.next();
    }

    let protocol = tokens.next()?.to_string();
    let _protocol_number: u8 = tokens.next()?.parse().ok()?;
    let timeout: u64 = tokens.next()?.parse().ok()?;

    let mut tuples = [TupleBuilder::default(), TupleBuilder::default()];
    let mut current = 0;
    let mut unreplied = false;
    let mut assured = false;

    for token in tokens {
        match token {
            "[UNREPLIED]" => unreplied = true,
            "[ASSURED]" => assured = true,
            _ => (),
        }

        let (key, value) = match token.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };

        if current < 2 && tuples[current].is_complete() {
            current += 1;
        }

        if current >= 2 {
            continue;
        }

        let tuple = &mut tuples[current];

        match key {
            "src" => tuple.src = value.parse().ok(),
            "dst" => tuple.dst = value.parse().ok(),
            "sport" => tuple.sport = value.parse().ok(),
            "dport" => tuple.dport = value.parse().ok(),
            _ => (),
        }
    }

    Some(Record {
        protocol,
        timeout,
        forward: tuples[0].build()?,
        reply: tuples[1].build()?,
        unreplied,
        assured,
    })
}

/// Parsed snapshot of the connection tracking table.
#[derive(Default)]
pub struct Table {
    records: Vec<Record>,
}

impl Table {
    /// Parses the table text; lines that are not IPv4 tuples are skipped.
    pub fn parse(text: &str) -> Self {
        Self {
            records: text.lines().filter_map(parse_record).collect(),
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Finds the flow that was redirected to `redir_port` and arrived from `observed_src`.
    ///
    /// New flows are searched first (unreplied records whose reply tuple comes back from
    /// `redir_port` to `observed_src`), then established ones (assured records with the same
    /// forward source). Within a pass the most recently refreshed record wins.
    pub fn lookup(&self, observed_src: SocketAddrV4, redir_port: u16) -> Option<Origin> {
        let udp = self.records.iter().filter(|record| record.protocol == "udp");

        let unreplied = udp
            .clone()
            .filter(|record| record.unreplied)
            .filter(|record| record.reply.dst == observed_src && record.reply.src.port() == redir_port)
            .max_by_key(|record| record.timeout);

        let record = match unreplied {
            Some(record) => Some(record),
            None => udp
                .filter(|record| record.assured)
                .filter(|record| record.forward.src == observed_src && record.reply.src.port() == redir_port)
                .max_by_key(|record| record.timeout),
        };

        record.map(|record| Origin {
            src: record.forward.src,
            dst: record.forward.dst,
        })
    }
}

pub trait ConntrackSource {
    fn snapshot(&self) -> io::Result<String>;
}

/// Reads the table from procfs.
pub struct ProcConntrack {
    path: PathBuf,
}

impl ProcConntrack {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConntrackSource for ProcConntrack {
    fn snapshot(&self) -> io::Result<String> {
        std::fs::read_to_string(&self.path)
    }
}

/// Looks up origins from a source, dumping the snapshot whenever a lookup misses.
pub struct OriginResolver<S: ConntrackSource> {
    source: S,
    redir_port: u16,
    snapshot_path: Option<PathBuf>,
}

impl<S: ConntrackSource> OriginResolver<S> {
    pub fn new(source: S, redir_port: u16, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            source,
            redir_port,
            snapshot_path,
        }
    }

    pub fn resolve(&self, observed_src: SocketAddrV4) -> Option<Origin> {
        let text = match self.source.snapshot() {
            Ok(text) => text,
            Err(err) => {
                log::error!("failed to read conntrack table: {}", err);
                return None;
            }
        };

        let origin = Table::parse(&text).lookup(observed_src, self.redir_port);

        if origin.is_none() {
            log::warn!("no conntrack entry for {}", observed_src);

            if let Some(ref path) = self.snapshot_path {
                if let Err(err) = std::fs::write(path, &text) {
                    log::warn!("failed to write snapshot {}: {}", path.display(), err);
                }
            }
        }

        return origin;
    }
}
