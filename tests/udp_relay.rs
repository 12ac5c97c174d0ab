#[allow(dead_code)]
mod common;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::util;

use packtun::config::{UdpConfig, UdpdConfig};
use packtun::nat::ConntrackSource;
use packtun::udp::Udp;
use packtun::udpd::Udpd;

// Conntrack table filled in by the test
#[derive(Clone, Default)]
struct SharedTable(Arc<Mutex<String>>);

impl ConntrackSource for SharedTable {
    fn snapshot(&self) -> io::Result<String> {
        Ok(self.0.lock().unwrap().clone())
    }
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    thread::spawn(move || {
        let mut buffer = [0; 2048];

        while let Ok((len, from)) = socket.recv_from(&mut buffer) {
            let _ = socket.send_to(&buffer[..len], from);
        }
    });

    addr
}

#[test]
fn datagrams_reach_original_destination() {
    let echo_addr = udp_echo_server();

    let (_udpd, udpd_addr) = util::spawn(|| {
        let config = UdpdConfig {
            bind_port: 0,
            ..Default::default()
        };

        let udpd = Udpd::new(config).unwrap();
        let addr = udpd.control_addr().unwrap();
        (udpd, addr)
    });

    let table = SharedTable::default();
    let source = table.clone();

    let config = UdpConfig {
        redir_port: 0,
        udpd_addr: loopback(udpd_addr).to_string(),
        ..Default::default()
    };

    let (_udp, redirect_addr) = util::spawn(move || {
        let udp = Udp::with_source(config, source).unwrap();
        let addr = udp.redirect_addr().unwrap();
        (udp, addr)
    });

    let redirect_addr = loopback(redirect_addr);

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let client_addr = client.local_addr().unwrap();

    *table.0.lock().unwrap() = format!(
        "ipv4     2 udp      17 29 src={} dst={} sport={} dport={} [UNREPLIED] src=127.0.0.1 dst={} sport={} dport={} mark=0 zone=0 use=2\n",
        client_addr.ip(),
        echo_addr.ip(),
        client_addr.port(),
        echo_addr.port(),
        client_addr.ip(),
        redirect_addr.port(),
        client_addr.port(),
    );

    let mut buffer = [0; 2048];

    for i in 0..5u8 {
        let payload = util::pattern(100 + i as usize, i);
        client.send_to(&payload, redirect_addr).unwrap();

        let (len, from) = client.recv_from(&mut buffer).unwrap();

        assert_eq!(from, redirect_addr);
        assert_eq!(&buffer[..len], &payload[..]);
    }
}

#[test]
fn unknown_flow_is_dropped() {
    let (_udp, redirect_addr) = util::spawn(|| {
        let config = UdpConfig {
            redir_port: 0,
            ..Default::default()
        };

        let udp = Udp::with_source(config, SharedTable::default()).unwrap();
        let addr = udp.redirect_addr().unwrap();
        (udp, addr)
    });

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    client.send_to(b"lost", loopback(redirect_addr)).unwrap();

    let mut buffer = [0; 64];
    assert!(client.recv_from(&mut buffer).is_err());
}
