pub mod relay;
pub mod serial;

use std::net::SocketAddrV4;

pub type StreamId = u64;
pub type PackId = u32;

/// Why the sending side of a stream stopped reading its local socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    // Clean end of stream
    Eof,
    // Reset or socket fault, propagated as an abortive close
    Rst,
}

#[derive(Debug, Eq, PartialEq)]
pub struct DataPack<'a> {
    pub pack_id: PackId,
    pub stream_id: StreamId,
    pub payload: &'a [u8],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Control {
    ApplyForTunnel {
        dst: SocketAddrV4,
        mac: u64,
    },
    TunnelPortAnnounce {
        port: u16,
    },
    Hello,
    Confirm {
        stream_id: StreamId,
        pack_id: PackId,
    },
    Fin1 {
        stream_id: StreamId,
        reason: CloseReason,
        last_pack_id: PackId,
    },
    GotFin1 {
        stream_id: StreamId,
    },
    Fin2 {
        stream_id: StreamId,
        reason: CloseReason,
        last_pack_id: PackId,
    },
    GotFin2 {
        stream_id: StreamId,
    },
    NewSource {
        stream_id: StreamId,
    },
    SourceStatus {
        stream_id: StreamId,
        biggest_sent: PackId,
        biggest_confirmed: PackId,
    },
    MissRange {
        stream_id: StreamId,
        begin: PackId,
        end: PackId,
    },
    ChannelFin,
    ApplyForRelay {
        src: SocketAddrV4,
        dst: SocketAddrV4,
        mac: u64,
    },
}

#[derive(Debug, Eq, PartialEq)]
pub enum Datagram<'a> {
    Data(DataPack<'a>),
    Control(Control),
}
