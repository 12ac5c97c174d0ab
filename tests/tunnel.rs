#[allow(dead_code)]
mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::util;

use packtun::config::{Forward, TunConfig, TundConfig};
use packtun::tun::Tun;
use packtun::tund::Tund;

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

// Starts tund and a tun forwarding one port to `dst` through it
fn start(dst: SocketAddr, spill_dir: PathBuf) -> (util::Running, util::Running, SocketAddr) {
    start_limited(dst, spill_dir, None)
}

fn start_limited(
    dst: SocketAddr,
    spill_dir: PathBuf,
    session_limit: Option<usize>,
) -> (util::Running, util::Running, SocketAddr) {
    let tund_config = TundConfig {
        bind_port: 0,
        spill_dir: spill_dir.clone(),
        ..Default::default()
    };

    let (tund, control_addr) = util::spawn(move || {
        let tund = Tund::new(tund_config).unwrap();
        let addr = tund.control_addr().unwrap();
        (tund, addr)
    });

    let tun_config = TunConfig {
        tund_addr: loopback(control_addr).to_string(),
        forwards: vec![Forward {
            listen_port: 0,
            dst: dst.to_string(),
        }],
        spill_dir,
        session_limit,
        ..Default::default()
    };

    let (tun, listen_addr) = util::spawn(move || {
        let tun = Tun::new(tun_config).unwrap();
        let addr = tun.listen_addrs()[0];
        (tun, addr)
    });

    (tund, tun, loopback(listen_addr))
}

#[test]
fn echo_through_tunnel() {
    let spill_dir = tempfile::tempdir().unwrap();
    let echo_addr = util::tcp_echo_server();

    let (_tund, _tun, listen_addr) = start(echo_addr, spill_dir.path().to_path_buf());

    let payload = util::pattern(1024 * 1024, 11);
    let received = util::tcp_round_trip(listen_addr, &payload);

    assert_eq!(received.len(), payload.len());
    assert_eq!(md5::compute(&received), md5::compute(&payload));
}

#[test]
fn concurrent_connections_share_tunnel() {
    let spill_dir = tempfile::tempdir().unwrap();
    let echo_addr = util::tcp_echo_server();

    let (_tund, _tun, listen_addr) = start(echo_addr, spill_dir.path().to_path_buf());

    let clients = (0..4u8)
        .map(|seed| {
            thread::spawn(move || {
                let payload = util::pattern(200_000, seed);
                let received = util::tcp_round_trip(listen_addr, &payload);
                assert_eq!(received, payload);
            })
        })
        .collect::<Vec<_>>();

    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn empty_connection_closes() {
    let spill_dir = tempfile::tempdir().unwrap();
    let echo_addr = util::tcp_echo_server();

    let (_tund, _tun, listen_addr) = start(echo_addr, spill_dir.path().to_path_buf());

    let received = util::tcp_round_trip(listen_addr, &[]);

    assert!(received.is_empty());
}

const BLOB_LEN: usize = 24 * 1024 * 1024;

// Destination that sends BLOB_LEN bytes to connections opening with b'b' and echoes the others.
// The opening byte of every connection is reported once the connection ends.
fn blob_server() -> (SocketAddr, mpsc::Receiver<u8>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };

            let tx = tx.clone();

            thread::spawn(move || {
                let mut tag = [0; 1];

                if stream.read_exact(&mut tag).is_err() {
                    return;
                }

                let mut buffer = [0; 16 * 1024];

                if tag[0] == b'b' {
                    let _ = stream.write_all(&util::pattern(BLOB_LEN, 5));

                    while let Ok(n) = stream.read(&mut buffer) {
                        if n == 0 {
                            break;
                        }
                    }
                } else {
                    let _ = stream.write_all(&tag);

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
                }

                let _ = tx.send(tag[0]);
            });
        }
    });

    (addr, rx)
}

fn spill_files(dir: &Path) -> Vec<String> {
    let prefix = format!("{}-", std::process::id());

    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(&prefix))
        .collect()
}

fn ping(stream: &mut TcpStream, byte: u8) {
    stream.write_all(&[byte]).unwrap();

    let mut echoed = [0; 1];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed[0], byte);
}

#[test]
fn eviction_tears_down_session() {
    let spill_dir = tempfile::tempdir().unwrap();
    let (dst, ended) = blob_server();

    // At most two local sessions at a time
    let (_tund, _tun, listen_addr) = start_limited(dst, spill_dir.path().to_path_buf(), Some(3));

    let mut echo = TcpStream::connect(listen_addr).unwrap();
    echo.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    ping(&mut echo, b'e');

    // A client that never reads, so the tunnel queues its data on disk
    let mut stalled = TcpStream::connect(listen_addr).unwrap();
    stalled.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stalled.write_all(b"b").unwrap();

    // Wait for the transfer to settle
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut last = Vec::new();

    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(500));

        let mut files = spill_files(spill_dir.path());
        files.sort();

        if !files.is_empty() && files == last {
            break;
        }

        last = files;
    }

    // The echo session becomes the most recently used one
    ping(&mut echo, b'x');

    let mut newest = TcpStream::connect(listen_addr).unwrap();
    newest.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    ping(&mut newest, b'n');

    // The stalled client is evicted: its socket ends without a timeout
    let mut buffer = vec![0; 64 * 1024];

    loop {
        match stalled.read(&mut buffer) {
            Ok(0) => break,
            Ok(_) => (),
            Err(err) => {
                assert_ne!(err.kind(), std::io::ErrorKind::WouldBlock);
                assert_ne!(err.kind(), std::io::ErrorKind::TimedOut);
                break;
            }
        }
    }

    // The far side closes its destination connection
    assert_eq!(ended.recv_timeout(Duration::from_secs(10)).unwrap(), b'b');

    // The surviving sessions still work
    ping(&mut echo, b'y');
    ping(&mut newest, b'z');

    drop(echo);
    drop(newest);

    let mut ended_tags = vec![
        ended.recv_timeout(Duration::from_secs(10)).unwrap(),
        ended.recv_timeout(Duration::from_secs(10)).unwrap(),
    ];
    ended_tags.sort();
    assert_eq!(ended_tags, vec![b'e', b'n']);

    // Nothing the evicted session queued is left on disk
    let deadline = Instant::now() + Duration::from_secs(10);

    while !spill_files(spill_dir.path()).is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }

    assert!(spill_files(spill_dir.path()).is_empty());
}
