use super::*;

use crate::obfs::Obfuscator;

use std::net::{Ipv4Addr, SocketAddrV4};

/// Largest datagram either side will emit.
pub const DATAGRAM_SIZE_MAX: usize = 1460;

pub const DATA_HEADER_SIZE: usize = 4 + 8;
pub const PAYLOAD_SIZE_MAX: usize = DATAGRAM_SIZE_MAX - DATA_HEADER_SIZE;

pub const CONTROL_HEADER_SIZE: usize = 4 + 1;

const ADDR_FAMILY_INET: u16 = 2;
const ADDR_SIZE: usize = 2 + 4;

const CONTROL_APPLY_FOR_TUNNEL: u8 = 1;
const CONTROL_TUNNEL_PORT_ANNOUNCE: u8 = 2;
const CONTROL_HELLO: u8 = 3;
const CONTROL_CONFIRM: u8 = 4;
const CONTROL_FIN1: u8 = 5;
const CONTROL_GOT_FIN1: u8 = 6;
const CONTROL_FIN2: u8 = 7;
const CONTROL_GOT_FIN2: u8 = 8;
const CONTROL_NEW_SOURCE: u8 = 9;
const CONTROL_SOURCE_STATUS: u8 = 10;
const CONTROL_MISS_RANGE: u8 = 11;
const CONTROL_CHANNEL_FIN: u8 = 12;
const CONTROL_APPLY_FOR_RELAY: u8 = 13;

const ERRNO_EOF: u8 = 1;
const ERRNO_RST: u8 = 2;

/// Bounds-checked big-endian reader. Every read returns `None` once the buffer runs out.
pub struct Reader<'a> {
    buffer: &'a [u8],
    bytes_read: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buffer[self.bytes_read..]
    }

    pub fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.bytes_read.checked_add(len)?;
        let bytes = self.buffer.get(self.bytes_read..end)?;
        self.bytes_read = end;
        Some(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_slice(N)?.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        Some(u8::from_be_bytes(self.read_array()?))
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        Some(u64::from_be_bytes(self.read_array()?))
    }
}

/// Big-endian writer appending to a vector.
pub struct Writer<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
}

fn addr_bytes(addr: &SocketAddrV4) -> [u8; ADDR_SIZE] {
    let mut bytes = [0; ADDR_SIZE];
    bytes[..2].copy_from_slice(&addr.port().to_be_bytes());
    bytes[2..].copy_from_slice(&addr.ip().octets());
    bytes
}

fn read_addr(rd: &mut Reader, obfs: &dyn Obfuscator) -> Option<SocketAddrV4> {
    let mut bytes: [u8; ADDR_SIZE] = rd.read_array()?;
    obfs.decode(&mut bytes);

    let port = u16::from_be_bytes([bytes[0], bytes[1]]);
    let ip = Ipv4Addr::new(bytes[2], bytes[3], bytes[4], bytes[5]);

    Some(SocketAddrV4::new(ip, port))
}

fn write_addr(wr: &mut Writer, addr: &SocketAddrV4, obfs: &dyn Obfuscator) {
    let mut bytes = addr_bytes(addr);
    obfs.encode(&mut bytes);
    wr.write_slice(&bytes);
}

fn read_reason(rd: &mut Reader) -> Option<CloseReason> {
    match rd.read_u8()? {
        ERRNO_EOF => Some(CloseReason::Eof),
        ERRNO_RST => Some(CloseReason::Rst),
        _ => None,
    }
}

fn reason_errno(reason: CloseReason) -> u8 {
    match reason {
        CloseReason::Eof => ERRNO_EOF,
        CloseReason::Rst => ERRNO_RST,
    }
}

/// Appends a data datagram to `buffer`.
pub fn write_data(buffer: &mut Vec<u8>, pack_id: PackId, stream_id: StreamId, payload: &[u8]) {
    debug_assert!(pack_id != 0);
    debug_assert!(payload.len() <= PAYLOAD_SIZE_MAX);

    let mut wr = Writer::new(buffer);
    wr.write_u32(pack_id);
    wr.write_u64(stream_id);
    wr.write_slice(payload);
}

/// Serializes a control message. Address fields of tunnel and relay requests pass through
/// `obfs`.
pub fn write_control(ctl: &Control, obfs: &dyn Obfuscator) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(CONTROL_HEADER_SIZE + 24);
    let ref mut wr = Writer::new(&mut buffer);

    wr.write_u32(0);

    match ctl {
        Control::ApplyForTunnel { dst, mac } => {
            wr.write_u8(CONTROL_APPLY_FOR_TUNNEL);
            wr.write_u16(ADDR_FAMILY_INET);
            write_addr(wr, dst, obfs);
            wr.write_u64(*mac);
        }
        Control::TunnelPortAnnounce { port } => {
            wr.write_u8(CONTROL_TUNNEL_PORT_ANNOUNCE);
            wr.write_u16(*port);
        }
        Control::Hello => {
            wr.write_u8(CONTROL_HELLO);
        }
        Control::Confirm { stream_id, pack_id } => {
            wr.write_u8(CONTROL_CONFIRM);
            wr.write_u64(*stream_id);
            wr.write_u32(*pack_id);
        }
        Control::Fin1 {
            stream_id,
            reason,
            last_pack_id,
        } => {
            wr.write_u8(CONTROL_FIN1);
            wr.write_u64(*stream_id);
            wr.write_u8(reason_errno(*reason));
            wr.write_u32(*last_pack_id);
        }
        Control::GotFin1 { stream_id } => {
            wr.write_u8(CONTROL_GOT_FIN1);
            wr.write_u64(*stream_id);
        }
        Control::Fin2 {
            stream_id,
            reason,
            last_pack_id,
        } => {
            wr.write_u8(CONTROL_FIN2);
            wr.write_u64(*stream_id);
            wr.write_u8(reason_errno(*reason));
            wr.write_u32(*last_pack_id);
        }
        Control::GotFin2 { stream_id } => {
            wr.write_u8(CONTROL_GOT_FIN2);
            wr.write_u64(*stream_id);
        }
        Control::NewSource { stream_id } => {
            wr.write_u8(CONTROL_NEW_SOURCE);
            wr.write_u64(*stream_id);
        }
        Control::SourceStatus {
            stream_id,
            biggest_sent,
            biggest_confirmed,
        } => {
            wr.write_u8(CONTROL_SOURCE_STATUS);
            wr.write_u64(*stream_id);
            wr.write_u32(*biggest_sent);
            wr.write_u32(*biggest_confirmed);
        }
        Control::MissRange {
            stream_id,
            begin,
            end,
        } => {
            wr.write_u8(CONTROL_MISS_RANGE);
            wr.write_u64(*stream_id);
            wr.write_u32(*begin);
            wr.write_u32(*end);
        }
        Control::ChannelFin => {
            wr.write_u8(CONTROL_CHANNEL_FIN);
        }
        Control::ApplyForRelay { src, dst, mac } => {
            wr.write_u8(CONTROL_APPLY_FOR_RELAY);
            write_addr(wr, src, obfs);
            write_addr(wr, dst, obfs);
            wr.write_u64(*mac);
        }
    }

    buffer
}

fn read_control(rd: &mut Reader, obfs: &dyn Obfuscator) -> Option<Control> {
    let ctl = match rd.read_u8()? {
        CONTROL_APPLY_FOR_TUNNEL => {
            if rd.read_u16()? != ADDR_FAMILY_INET {
                return None;
            }

            let dst = read_addr(rd, obfs)?;
            let mac = rd.read_u64()?;

            Control::ApplyForTunnel { dst, mac }
        }
        CONTROL_TUNNEL_PORT_ANNOUNCE => Control::TunnelPortAnnounce {
            port: rd.read_u16()?,
        },
        CONTROL_HELLO => Control::Hello,
        CONTROL_CONFIRM => Control::Confirm {
            stream_id: rd.read_u64()?,
            pack_id: rd.read_u32()?,
        },
        CONTROL_FIN1 => Control::Fin1 {
            stream_id: rd.read_u64()?,
            reason: read_reason(rd)?,
            last_pack_id: rd.read_u32()?,
        },
        CONTROL_GOT_FIN1 => Control::GotFin1 {
            stream_id: rd.read_u64()?,
        },
        CONTROL_FIN2 => Control::Fin2 {
            stream_id: rd.read_u64()?,
            reason: read_reason(rd)?,
            last_pack_id: rd.read_u32()?,
        },
        CONTROL_GOT_FIN2 => Control::GotFin2 {
            stream_id: rd.read_u64()?,
        },
        CONTROL_NEW_SOURCE => Control::NewSource {
            stream_id: rd.read_u64()?,
        },
        CONTROL_SOURCE_STATUS => Control::SourceStatus {
            stream_id: rd.read_u64()?,
            biggest_sent: rd.read_u32()?,
            biggest_confirmed: rd.read_u32()?,
        },
        CONTROL_MISS_RANGE => Control::MissRange {
            stream_id: rd.read_u64()?,
            begin: rd.read_u32()?,
            end: rd.read_u32()?,
        },
        CONTROL_CHANNEL_FIN => Control::ChannelFin,
        CONTROL_APPLY_FOR_RELAY => {
            let src = read_addr(rd, obfs)?;
            let dst = read_addr(rd, obfs)?;
            let mac = rd.read_u64()?;

            Control::ApplyForRelay { src, dst, mac }
        }
        _ => return None,
    };

    Some(ctl)
}

/// Parses a received datagram. Returns `None` for truncated, oversized, or unknown datagrams.
pub fn read_datagram<'a>(bytes: &'a [u8], obfs: &dyn Obfuscator) -> Option<Datagram<'a>> {
    if bytes.len() > DATAGRAM_SIZE_MAX {
        return None;
    }

    let ref mut rd = Reader::new(bytes);

    let pack_id = rd.read_u32()?;

    if pack_id == 0 {
        return Some(Datagram::Control(read_control(rd, obfs)?));
    }

    let stream_id = rd.read_u64()?;
    let payload = rd.remaining();

    return Some(Datagram::Data(DataPack {
        pack_id,
        stream_id,
        payload,
    }));
}
