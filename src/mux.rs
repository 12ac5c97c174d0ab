//! Sources multiplexed over relay links, shared by `proxy` and `proxyd`.
//!
//! A source is one local TCP socket whose bytes travel as traffic messages tagged with its source
//! id. Each direction is closed by a close message queued after the last traffic message, and an id
//! is freed once both directions are closed and the local write queue has drained.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use crate::channel::Side;
use crate::conn::{AfterDrain, Conn, Flush};
use crate::frame::relay::{self, Decoder, Message, SourceId, TRAFFIC_CHUNK_MAX};
use crate::reactor::{Key, Reactor, Ready};
use crate::registry::Registry;
use crate::socket;

// Bytes read from one socket per readiness event
const READ_BUDGET: usize = 1024 * 1024;

/// One relay link between `proxy` and `proxyd`.
pub struct Link {
    pub conn: Conn,
    decoder: Decoder,
    // Hello received (far side) or sent (near side)
    pub greeted: bool,
    pub last_receive_ms: u64,
    pub last_send_ms: u64,
    congested: bool,
    scratch: Vec<u8>,
}

impl Link {
    pub fn new(conn: Conn, now_ms: u64) -> Self {
        Self {
            conn,
            decoder: Decoder::new(),
            greeted: false,
            last_receive_ms: now_ms,
            last_send_ms: now_ms,
            congested: false,
            scratch: Vec::new(),
        }
    }

    fn queue(&mut self, msg: &Message, now_ms: u64) {
        self.scratch.clear();
        relay::write_message(&mut self.scratch, msg);

        self.conn.queue(&self.scratch);
        self.last_send_ms = now_ms;
    }

    pub fn is_congested(&self) -> bool {
        self.congested
    }
}

pub struct Source {
    pub conn: Conn,
    pub link: Key,
    pub src_id: SourceId,
    // Local read side still open
    reading: bool,
    // Peer asked us to stop reading
    paused: bool,
    close_sent: bool,
    close_received: bool,
    overflow_sent: bool,
}

#[derive(Debug)]
pub enum LinkInput {
    Open,
    Closed,
    Failed(io::Error),
}

pub struct Mux {
    pub reactor: Reactor,
    side: Side,
    pub links: HashMap<Key, Link>,
    pub sources: HashMap<Key, Source>,
    by_id: HashMap<(Key, SourceId), Key>,
    registry: Registry<Key>,
    spill_dir: PathBuf,
    overflow_bytes: usize,
    next_id: u64,
    buffer: Box<[u8]>,
}

impl Mux {
    pub fn new(
        reactor: Reactor,
        side: Side,
        spill_dir: PathBuf,
        session_limit: Option<usize>,
        overflow_bytes: usize,
    ) -> Self {
        let registry = match session_limit {
            Some(limit) => Registry::new(limit),
            None => Registry::with_descriptor_limit(),
        };

        Self {
            reactor,
            side,
            links: HashMap::new(),
            sources: HashMap::new(),
            by_id: HashMap::new(),
            registry,
            spill_dir,
            overflow_bytes,
            next_id: 0,
            buffer: vec![0; TRAFFIC_CHUNK_MAX].into_boxed_slice(),
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

    fn close_message(&self, src_id: SourceId) -> Message<'static> {
        match self.side {
            Side::Near => Message::SrcClose { src_id },
            Side::Far => Message::DstClose { src_id },
        }
    }

    pub fn add_link(&mut self, conn: Conn, now_ms: u64) -> io::Result<Key> {
        let key = self
            .reactor
            .add(&conn.stream, !conn.connecting, conn.wants_write())?;

        self.links.insert(key, Link::new(conn, now_ms));

        Ok(key)
    }

    /// Closes a link and resets every source riding it.
    pub fn close_link(&mut self, key: Key) {
        let link = match self.links.remove(&key) {
            Some(link) => link,
            None => return,
        };

        self.reactor.remove(&link.conn.stream);

        let orphans = self
            .sources
            .iter()
            .filter(|(_, source)| source.link == key)
            .map(|(source_key, _)| *source_key)
            .collect::<Vec<_>>();

        log::info!("link {} closed with {} sources", key, orphans.len());

        for source_key in orphans {
            if let Some(source) = self.remove_source(source_key) {
                source.conn.abort();
            }
        }
    }

    /// Queues a message on a link and writes what the socket takes.
    pub fn send(&mut self, link_key: Key, msg: &Message, now_ms: u64) {
        if let Some(link) = self.links.get_mut(&link_key) {
            link.queue(msg, now_ms);
            self.flush_link(link_key);
        }
    }

    fn flush_link(&mut self, key: Key) {
        let link = match self.links.get_mut(&key) {
            Some(link) => link,
            None => return,
        };

        match link.conn.flush() {
            Ok(Flush::Done) => {
                self.close_link(key);
                return;
            }
            Ok(_) => (),
            Err(err) => {
                log::warn!("link {} write failed: {}", key, err);
                self.close_link(key);
                return;
            }
        }

        let queued = link.conn.queued_len();
        let was_congested = link.congested;

        link.congested = if was_congested {
            queued >= self.overflow_bytes / 2
        } else {
            queued > self.overflow_bytes
        };

        if link.congested != was_congested {
            log::info!(
                "link {} {} with {} bytes queued",
                key,
                if link.congested { "congested" } else { "drained" },
                queued
            );

            let riders = self
                .sources
                .iter()
                .filter(|(_, source)| source.link == key)
                .map(|(source_key, _)| *source_key)
                .collect::<Vec<_>>();

            for source_key in riders {
                self.rearm_source(source_key);
            }
        }

        self.rearm_link(key);
    }

    pub fn rearm_link(&self, key: Key) {
        if let Some(link) = self.links.get(&key) {
            if let Err(err) = self.reactor.rearm(
                &link.conn.stream,
                key,
                !link.conn.connecting,
                link.conn.wants_write(),
            ) {
                log::warn!("failed to rearm link {}: {}", key, err);
            }
        }
    }

    /// Reads whatever the link socket has into its decoder.
    pub fn fill_link(&mut self, key: Key, now_ms: u64) -> LinkInput {
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut budget = READ_BUDGET;

        let input = loop {
            let link = match self.links.get_mut(&key) {
                Some(link) => link,
                None => break LinkInput::Closed,
            };

            match socket::read(&mut link.conn.stream, &mut buffer) {
                Ok(socket::Io::Done(n)) => {
                    link.decoder.feed(&buffer[..n]);
                    link.last_receive_ms = now_ms;

                    budget = budget.saturating_sub(n);

                    if budget == 0 {
                        break LinkInput::Open;
                    }
                }
                Ok(socket::Io::WouldBlock) => break LinkInput::Open,
                Ok(socket::Io::Closed) => break LinkInput::Closed,
                Err(err) => break LinkInput::Failed(err),
            }
        };

        self.buffer = buffer;

        return input;
    }

    pub fn read_hello(&mut self, key: Key) -> Option<Vec<u8>> {
        self.links.get_mut(&key)?.decoder.read_hello()
    }

    /// Next whole frame received on a link. `Err` means the link is corrupt.
    pub fn next_frame(&mut self, key: Key) -> Result<Option<Vec<u8>>, ()> {
        match self.links.get_mut(&key) {
            Some(link) => link.decoder.next_frame(),
            None => Ok(None),
        }
    }

    /// Handles writability of a link. Returns false if the link is gone.
    pub fn link_writable(&mut self, key: Key) -> bool {
        let link = match self.links.get_mut(&key) {
            Some(link) => link,
            None => return false,
        };

        if link.conn.connecting {
            if let Some(err) = socket::take_connect_error(&link.conn.stream) {
                log::warn!("link {} connect failed: {}", key, err);
                self.close_link(key);
                return false;
            }

            log::info!("link {} connected", key);

            link.conn.connecting = false;
        }

        self.flush_link(key);

        self.links.contains_key(&key)
    }

    pub fn source_for(&self, link_key: Key, src_id: SourceId) -> Option<Key> {
        self.by_id.get(&(link_key, src_id)).copied()
    }

    /// Registers a local socket as a source of a link. Sessions evicted to make room are reset.
    pub fn add_source(&mut self, link_key: Key, src_id: SourceId, conn: Conn, now_ms: u64) -> Option<Key> {
        let key = match self
            .reactor
            .add(&conn.stream, !conn.connecting, conn.wants_write())
        {
            Ok(key) => key,
            Err(err) => {
                log::warn!("failed to register source {}: {}", src_id, err);
                conn.abort();

                let msg = self.close_message(src_id);
                self.send(link_key, &msg, now_ms);

                return None;
            }
        };

        for evicted in self.registry.insert(key, now_ms) {
            log::info!("evicting session {}", evicted);
            self.abort_source(evicted, now_ms);
        }

        self.sources.insert(
            key,
            Source {
                conn,
                link: link_key,
                src_id,
                reading: true,
                paused: false,
                close_sent: false,
                close_received: false,
                overflow_sent: false,
            },
        );
        self.by_id.insert((link_key, src_id), key);

        self.rearm_source(key);

        Some(key)
    }

    fn remove_source(&mut self, key: Key) -> Option<Source> {
        let source = self.sources.remove(&key)?;

        self.reactor.remove(&source.conn.stream);
        self.registry.remove(&key);

        if self.by_id.get(&(source.link, source.src_id)) == Some(&key) {
            self.by_id.remove(&(source.link, source.src_id));
        }

        Some(source)
    }

    /// Resets a local socket, telling the peer its direction is closed.
    pub fn abort_source(&mut self, key: Key, now_ms: u64) {
        if let Some(source) = self.remove_source(key) {
            source.conn.abort();

            if !source.close_sent {
                let msg = self.close_message(source.src_id);
                self.send(source.link, &msg, now_ms);
            }
        }
    }

    fn rearm_source(&self, key: Key) {
        if let Some(source) = self.sources.get(&key) {
            let congested = self
                .links
                .get(&source.link)
                .map_or(false, |link| link.congested);

            let readable = source.reading && !source.paused && !congested && !source.conn.connecting;

            if let Err(err) = self
                .reactor
                .rearm(&source.conn.stream, key, readable, source.conn.wants_write())
            {
                log::warn!("failed to rearm source {}: {}", key, err);
            }
        }
    }

    pub fn source_ready(&mut self, ready: Ready, now_ms: u64) {
        if ready.writable {
            self.source_writable(ready.key, now_ms);
        }

        if ready.readable {
            self.source_readable(ready.key, now_ms);
        }

        self.rearm_source(ready.key);
    }

    fn source_writable(&mut self, key: Key, now_ms: u64) {
        let source = match self.sources.get_mut(&key) {
            Some(source) => source,
            None => return,
        };

        if source.conn.connecting {
            if let Some(err) = socket::take_connect_error(&source.conn.stream) {
                log::info!("source {} connect failed: {}", source.src_id, err);
                self.abort_source(key, now_ms);
                return;
            }

            source.conn.connecting = false;
        }

        self.flush_source(key, now_ms);
    }

    fn source_readable(&mut self, key: Key, now_ms: u64) {
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut budget = READ_BUDGET;

        loop {
            let source = match self.sources.get_mut(&key) {
                Some(source) => source,
                None => break,
            };

            let congested = self
                .links
                .get(&source.link)
                .map_or(true, |link| link.congested);

            if !source.reading || source.paused || congested || budget == 0 {
                break;
            }

            let link_key = source.link;
            let src_id = source.src_id;

            match socket::read(&mut source.conn.stream, &mut buffer) {
                Ok(socket::Io::Done(n)) => {
                    self.registry.touch(&key, now_ms);

                    let msg = Message::Traffic {
                        src_id,
                        data: &buffer[..n],
                    };
                    self.send(link_key, &msg, now_ms);

                    budget = budget.saturating_sub(n);
                }
                Ok(socket::Io::WouldBlock) => break,
                Ok(socket::Io::Closed) => {
                    source.reading = false;
                    source.close_sent = true;

                    let msg = self.close_message(src_id);
                    self.send(link_key, &msg, now_ms);

                    self.finish_if_done(key);
                    self.flush_source(key, now_ms);

                    break;
                }
                Err(err) => {
                    log::info!("source {} read failed: {}", src_id, err);
                    self.abort_source(key, now_ms);
                    break;
                }
            }
        }

        self.buffer = buffer;
    }

    fn finish_if_done(&mut self, key: Key) {
        if let Some(source) = self.sources.get_mut(&key) {
            if source.close_sent && source.close_received {
                source.conn.set_after_drain(AfterDrain::Close);
            }
        }
    }

    fn flush_source(&mut self, key: Key, now_ms: u64) {
        let source = match self.sources.get_mut(&key) {
            Some(source) => source,
            None => return,
        };

        match source.conn.flush() {
            Ok(Flush::Done) => {
                log::debug!("source {} finished", source.src_id);
                self.remove_source(key);
                return;
            }
            Ok(_) => (),
            Err(err) => {
                log::info!("source {} write failed: {}", source.src_id, err);
                self.abort_source(key, now_ms);
                return;
            }
        }

        let queued = source.conn.queued_len();

        let notice = if !source.overflow_sent && queued > self.overflow_bytes {
            source.overflow_sent = true;
            Some(Message::Overflow {
                src_id: source.src_id,
            })
        } else if source.overflow_sent && queued < self.overflow_bytes / 2 {
            source.overflow_sent = false;
            Some(Message::Underhalf {
                src_id: source.src_id,
            })
        } else {
            None
        };

        let link_key = source.link;

        if let Some(msg) = notice {
            self.send(link_key, &msg, now_ms);
        }

        self.registry.touch(&key, now_ms);
        self.rearm_source(key);
    }

    /// Queues bytes toward a local socket.
    pub fn deliver(&mut self, key: Key, data: &[u8], now_ms: u64) {
        if let Some(source) = self.sources.get_mut(&key) {
            source.conn.queue(data);
        }

        self.flush_source(key, now_ms);
    }

    /// The peer closed its direction of a source.
    pub fn peer_closed(&mut self, key: Key, now_ms: u64) {
        if let Some(source) = self.sources.get_mut(&key) {
            source.close_received = true;
            source.conn.set_after_drain(AfterDrain::ShutdownWrite);
        }

        self.finish_if_done(key);
        self.flush_source(key, now_ms);
    }

    /// Handles the messages both sides understand. Anything else is reported back.
    pub fn dispatch<'a>(&mut self, link_key: Key, msg: Message<'a>, now_ms: u64) -> Option<Message<'a>> {
        match msg {
            Message::Traffic { src_id, data } => match self.source_for(link_key, src_id) {
                Some(key) => self.deliver(key, data, now_ms),
                None => log::debug!("dropping {} bytes for unknown source {}", data.len(), src_id),
            },
            Message::SrcClose { src_id } if self.side == Side::Far => {
                if let Some(key) = self.source_for(link_key, src_id) {
                    self.peer_closed(key, now_ms);
                }
            }
            Message::DstClose { src_id } if self.side == Side::Near => {
                if let Some(key) = self.source_for(link_key, src_id) {
                    self.peer_closed(key, now_ms);
                }
            }
            Message::Overflow { src_id } | Message::Underhalf { src_id } => {
                if let Some(key) = self.source_for(link_key, src_id) {
                    if let Some(source) = self.sources.get_mut(&key) {
                        source.paused = matches!(msg, Message::Overflow { .. });
                    }

                    self.rearm_source(key);
                }
            }
            Message::Heartbeat => (),
            other => return Some(other),
        }

        None
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Writes out every link queue, blocking up to `timeout` per write, then drops all links.
    pub fn flush_links_blocking(&mut self, timeout: std::time::Duration) {
        let keys = self.links.keys().copied().collect::<Vec<_>>();

        for key in keys {
            if let Some(link) = self.links.get_mut(&key) {
                if !link.conn.connecting && link.conn.queued_len() > 0 {
                    let prepared = link
                        .conn
                        .stream
                        .set_nonblocking(false)
                        .and_then(|_| link.conn.stream.set_write_timeout(Some(timeout)));

                    match prepared.and_then(|_| link.conn.flush()) {
                        Ok(Flush::Pending) => log::warn!("link {} not drained before exit", key),
                        Ok(_) => (),
                        Err(err) => log::warn!("link {} flush failed: {}", key, err),
                    }
                }
            }

            self.close_link(key);
        }
    }
}
