use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use packtun::channel::{Channel, HostContext, Side, TimeoutAction};
use packtun::config::ChannelConfig;
use packtun::frame::{CloseReason, StreamId};
use packtun::obfs::Swap;
use packtun::reactor::{self, Daemon};

pub fn near_addr() -> SocketAddr {
    "10.0.0.1:40000".parse().unwrap()
}

pub fn far_addr() -> SocketAddr {
    "10.0.0.2:40001".parse().unwrap()
}

#[derive(Default)]
pub struct Host {
    pub outgoing: Vec<Vec<u8>>,
    pub data_sent: usize,
    pub opened: Vec<StreamId>,
    pub received: HashMap<StreamId, Vec<u8>>,
    pub peer_fins: Vec<(StreamId, CloseReason)>,
    pub closed: Vec<(StreamId, bool)>,
    pub expired: Vec<StreamId>,
    pub peer_gone: bool,
}

impl HostContext for Host {
    fn send_datagram(&mut self, datagram: &[u8], _addr: &SocketAddr) {
        if datagram[..4] != [0; 4] {
            self.data_sent += 1;
        }

        self.outgoing.push(datagram.to_vec());
    }

    fn on_open(&mut self, stream_id: StreamId) {
        self.opened.push(stream_id);
    }

    fn on_receive(&mut self, stream_id: StreamId, data: &[u8]) {
        self.received
            .entry(stream_id)
            .or_default()
            .extend_from_slice(data);
    }

    fn on_peer_fin(&mut self, stream_id: StreamId, reason: CloseReason) {
        self.peer_fins.push((stream_id, reason));
    }

    fn on_closed(&mut self, stream_id: StreamId, forced: bool) {
        self.closed.push((stream_id, forced));
    }

    fn on_expired(&mut self, stream_id: StreamId) {
        self.expired.push(stream_id);
    }

    fn on_peer_gone(&mut self) {
        self.peer_gone = true;
    }
}

/// Decides whether the n-th datagram on the simulated link (counted from 1, both directions)
/// is lost.
pub type DropRule = Box<dyn FnMut(u64) -> bool>;

/// A near and a far channel joined by a simulated link with a virtual clock.
pub struct Pair {
    pub near: Channel,
    pub far: Channel,
    pub near_host: Host,
    pub far_host: Host,
    pub now_ms: u64,
    pub datagram_count: u64,
    pub terminated: bool,
    drop_rule: DropRule,
    _spill_dir: tempfile::TempDir,
}

impl Pair {
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_drop_rule(config, Box::new(|_| false))
    }

    pub fn with_drop_rule(config: ChannelConfig, drop_rule: DropRule) -> Self {
        let spill_dir = tempfile::tempdir().unwrap();

        let mut near = Channel::new(Side::Near, config.clone(), spill_dir.path(), 1, Box::new(Swap), 0);
        let far = Channel::new(Side::Far, config, spill_dir.path(), 2, Box::new(Swap), 0);

        let mut near_host = Host::default();
        near.set_peer(far_addr(), 0, &mut near_host);

        Self {
            near,
            far,
            near_host,
            far_host: Host::default(),
            now_ms: 0,
            datagram_count: 0,
            terminated: false,
            drop_rule,
            _spill_dir: spill_dir,
        }
    }

    pub fn open_stream(&mut self) -> StreamId {
        self.near.open_stream(self.now_ms, &mut self.near_host)
    }

    pub fn send(&mut self, stream_id: StreamId, data: &[u8]) {
        self.near
            .send(stream_id, data, self.now_ms, &mut self.near_host);
    }

    /// Carries datagrams both ways until the link is quiet.
    pub fn deliver(&mut self) {
        loop {
            let to_far = std::mem::take(&mut self.near_host.outgoing);
            let to_near = std::mem::take(&mut self.far_host.outgoing);

            if to_far.is_empty() && to_near.is_empty() {
                break;
            }

            for datagram in to_far {
                self.datagram_count += 1;

                if !(self.drop_rule)(self.datagram_count) {
                    self.far
                        .handle_datagram(near_addr(), &datagram, self.now_ms, &mut self.far_host);
                }
            }

            for datagram in to_near {
                self.datagram_count += 1;

                if !(self.drop_rule)(self.datagram_count) {
                    self.near
                        .handle_datagram(far_addr(), &datagram, self.now_ms, &mut self.near_host);
                }
            }
        }
    }

    /// Moves the clock forward, ticks both channels and delivers.
    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;

        let near = self.near.handle_tick(self.now_ms, &mut self.near_host);
        let far = self.far.handle_tick(self.now_ms, &mut self.far_host);

        if near == TimeoutAction::Terminate || far == TimeoutAction::Terminate {
            self.terminated = true;
        }

        self.deliver();
    }

    /// Moves the clock forward, ticks both channels and carries one batch each way. Replies wait
    /// for the next step, so every round trip costs two steps.
    pub fn step(&mut self, ms: u64) {
        self.now_ms += ms;

        let near = self.near.handle_tick(self.now_ms, &mut self.near_host);
        let far = self.far.handle_tick(self.now_ms, &mut self.far_host);

        if near == TimeoutAction::Terminate || far == TimeoutAction::Terminate {
            self.terminated = true;
        }

        let to_far = std::mem::take(&mut self.near_host.outgoing);
        let to_near = std::mem::take(&mut self.far_host.outgoing);

        for datagram in to_far {
            self.datagram_count += 1;

            if !(self.drop_rule)(self.datagram_count) {
                self.far
                    .handle_datagram(near_addr(), &datagram, self.now_ms, &mut self.far_host);
            }
        }

        for datagram in to_near {
            self.datagram_count += 1;

            if !(self.drop_rule)(self.datagram_count) {
                self.near
                    .handle_datagram(far_addr(), &datagram, self.now_ms, &mut self.near_host);
            }
        }
    }

    pub fn received_by_far(&self, stream_id: StreamId) -> &[u8] {
        self.far_host
            .received
            .get(&stream_id)
            .map(|data| data.as_slice())
            .unwrap_or(&[])
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// A daemon running on its own thread until dropped.
pub struct Running {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

/// Builds a daemon on a new thread and runs it. `build` also returns whatever the test needs to
/// know about the daemon, such as its bound addresses.
pub fn spawn<D, T, F>(build: F) -> (Running, T)
where
    D: Daemon,
    T: Send + 'static,
    F: FnOnce() -> (D, T) + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let thread_stop = Arc::clone(&stop);

    let handle = thread::spawn(move || {
        let (mut daemon, info) = build();

        tx.send(info).unwrap();

        reactor::run(&mut daemon, &thread_stop).unwrap();
    });

    let info = rx.recv_timeout(Duration::from_secs(10)).unwrap();

    (
        Running {
            stop,
            handle: Some(handle),
        },
        info,
    )
}

/// Echoes every TCP connection accepted on a loopback port until the client half-closes.
pub fn tcp_echo_server() -> SocketAddr {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };

            thread::spawn(move || {
                let mut buffer = [0; 16 * 1024];

                loop {
                    match stream.read(&mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buffer[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Writes `payload` on a new connection to `addr`, half-closes, and returns everything read back
/// until the peer closes.
pub fn tcp_round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    use std::io::{Read, Write};

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();

    let mut reader = stream.try_clone().unwrap();

    let reader = thread::spawn(move || {
        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        received
    });

    stream.write_all(payload).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    reader.join().unwrap()
}
