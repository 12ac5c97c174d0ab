use std::io;
use std::io::{Read, Write};
use std::net;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

const LISTEN_BACKLOG: i32 = 1024;

/// Outcome of a non-blocking read or write.
#[derive(Debug, Eq, PartialEq)]
pub enum Io {
    Done(usize),
    WouldBlock,
    // Orderly end of stream (reads only)
    Closed,
}

fn classify(result: io::Result<usize>, zero_is_closed: bool) -> io::Result<Io> {
    match result {
        Ok(0) if zero_is_closed => Ok(Io::Closed),
        Ok(n) => Ok(Io::Done(n)),
        Err(err) => match err.kind() {
            // Nothing to do now, try again on the next readiness event
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(Io::WouldBlock),
            _ => Err(err),
        },
    }
}

pub fn read(stream: &mut net::TcpStream, buffer: &mut [u8]) -> io::Result<Io> {
    classify(stream.read(buffer), true)
}

pub fn write(stream: &mut net::TcpStream, bytes: &[u8]) -> io::Result<Io> {
    classify(stream.write(bytes), false)
}

/// If a datagram can be read from the socket, returns its length and sender. Returns Ok(None)
/// otherwise.
pub fn try_recv_from(
    socket: &net::UdpSocket,
    buffer: &mut [u8],
) -> io::Result<Option<(usize, net::SocketAddr)>> {
    match socket.recv_from(buffer) {
        Ok(received) => Ok(Some(received)),
        Err(err) => match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            // A previous send bounced; not fatal for an unconnected socket
            io::ErrorKind::ConnectionRefused => Ok(None),
            _ => Err(err),
        },
    }
}

/// Best-effort datagram send. UDP loss is handled by the protocols above.
pub fn send_to(socket: &net::UdpSocket, datagram: &[u8], addr: &net::SocketAddr) {
    if let Err(err) = socket.send_to(datagram, addr) {
        log::debug!("send to {} failed: {}", addr, err);
    }
}

pub fn bind_udp(addr: net::SocketAddr) -> io::Result<net::UdpSocket> {
    let socket = net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;

    Ok(socket)
}

pub fn listen_tcp(addr: net::SocketAddr) -> io::Result<net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Starts a TCP connection without waiting for it. Completion is signalled by writability;
/// call [`take_connect_error`] then.
pub fn connect_nonblocking(addr: net::SocketAddr) -> io::Result<net::TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => (),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => (),
        Err(err) => return Err(err),
    }

    Ok(socket.into())
}

/// Returns the error of a finished non-blocking connect, if it failed.
pub fn take_connect_error(stream: &net::TcpStream) -> Option<io::Error> {
    match stream.take_error() {
        Ok(Some(err)) => Some(err),
        Ok(None) => match stream.peer_addr() {
            Ok(_) => None,
            Err(err) => Some(err),
        },
        Err(err) => Some(err),
    }
}

/// Destination of a connection redirected by the local firewall.
pub fn original_dst(stream: &net::TcpStream) -> io::Result<net::SocketAddrV4> {
    let addr = SockRef::from(stream).original_dst()?;

    match addr.as_socket() {
        Some(net::SocketAddr::V4(v4)) => Ok(v4),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "original destination is not IPv4",
        )),
    }
}

/// Makes the next close of `stream` send a reset instead of a FIN.
pub fn set_abortive(stream: &net::TcpStream) {
    if let Err(err) = SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
        log::debug!("failed to set linger: {}", err);
    }
}
