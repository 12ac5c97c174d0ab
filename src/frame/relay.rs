//! Framing for the multiplexed TCP relay between `proxy` and `proxyd`.
//!
//! A link opens with [`HELLO_PADDING_SIZE`] random bytes followed by `im_len:u8 | im`. After that
//! the stream is a sequence of messages `length:u16 | type:u8 | body`, where `length` counts the
//! type byte and the body.

use super::serial::{Reader, Writer};

use std::net::Ipv4Addr;

pub const HELLO_PADDING_SIZE: usize = 32;

pub const MESSAGE_HEADER_SIZE: usize = 2 + 1;
pub const MESSAGE_BODY_SIZE_MAX: usize = u16::MAX as usize - 1;

/// Largest traffic payload carried by a single message.
pub const TRAFFIC_CHUNK_MAX: usize = 65000;

const TYPE_NEW_SOURCE: u8 = b'A';
const TYPE_TRAFFIC: u8 = b'B';
const TYPE_SRC_CLOSE: u8 = b'C';
const TYPE_DST_CLOSE: u8 = b'D';
const TYPE_OVERFLOW: u8 = b'E';
const TYPE_UNDERHALF: u8 = b'F';
const TYPE_QUERY: u8 = b'G';
const TYPE_RESPONSE: u8 = b'H';
const TYPE_HEARTBEAT: u8 = b'I';

pub type SourceId = u64;

#[derive(Debug, Eq, PartialEq)]
pub enum Message<'a> {
    NewSource {
        src_id: SourceId,
        destination: &'a str,
    },
    Traffic {
        src_id: SourceId,
        data: &'a [u8],
    },
    SrcClose {
        src_id: SourceId,
    },
    DstClose {
        src_id: SourceId,
    },
    Overflow {
        src_id: SourceId,
    },
    Underhalf {
        src_id: SourceId,
    },
    Query {
        near_id: u64,
        dns_type: u8,
        domain: &'a str,
    },
    Response {
        near_id: u64,
        dns_type: u8,
        ip: Option<Ipv4Addr>,
    },
    Heartbeat,
}

pub fn write_hello(out: &mut Vec<u8>, im: &str) {
    debug_assert!(im.len() <= u8::MAX as usize);

    out.extend((0..HELLO_PADDING_SIZE).map(|_| rand::random::<u8>()));
    out.push(im.len() as u8);
    out.extend_from_slice(im.as_bytes());
}

/// Appends one framed message to `out`.
pub fn write_message(out: &mut Vec<u8>, msg: &Message) {
    let header_pos = out.len();

    let ref mut wr = Writer::new(out);

    // Length is patched in once the body is known
    wr.write_u16(0);

    match msg {
        Message::NewSource {
            src_id,
            destination,
        } => {
            wr.write_u8(TYPE_NEW_SOURCE);
            wr.write_u64(*src_id);
            wr.write_slice(destination.as_bytes());
        }
        Message::Traffic { src_id, data } => {
            debug_assert!(data.len() <= TRAFFIC_CHUNK_MAX);

            wr.write_u8(TYPE_TRAFFIC);
            wr.write_u64(*src_id);
            wr.write_slice(data);
        }
        Message::SrcClose { src_id } => {
            wr.write_u8(TYPE_SRC_CLOSE);
            wr.write_u64(*src_id);
        }
        Message::DstClose { src_id } => {
            wr.write_u8(TYPE_DST_CLOSE);
            wr.write_u64(*src_id);
        }
        Message::Overflow { src_id } => {
            wr.write_u8(TYPE_OVERFLOW);
            wr.write_u64(*src_id);
        }
        Message::Underhalf { src_id } => {
            wr.write_u8(TYPE_UNDERHALF);
            wr.write_u64(*src_id);
        }
        Message::Query {
            near_id,
            dns_type,
            domain,
        } => {
            wr.write_u8(TYPE_QUERY);
            wr.write_u64(*near_id);
            wr.write_u8(*dns_type);
            wr.write_slice(domain.as_bytes());
        }
        Message::Response {
            near_id,
            dns_type,
            ip,
        } => {
            wr.write_u8(TYPE_RESPONSE);
            wr.write_u64(*near_id);
            wr.write_u8(*dns_type);
            wr.write_u32(ip.map(u32::from).unwrap_or(0));
        }
        Message::Heartbeat => {
            wr.write_u8(TYPE_HEARTBEAT);
        }
    }

    let len = out.len() - header_pos - 2;
    debug_assert!(len <= u16::MAX as usize);

    out[header_pos..header_pos + 2].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Parses the type byte and body of one message, as returned by [`Decoder::next_frame`].
pub fn read_message(frame: &[u8]) -> Option<Message> {
    let ref mut rd = Reader::new(frame);

    let msg = match rd.read_u8()? {
        TYPE_NEW_SOURCE => Message::NewSource {
            src_id: rd.read_u64()?,
            destination: std::str::from_utf8(rd.remaining()).ok()?,
        },
        TYPE_TRAFFIC => Message::Traffic {
            src_id: rd.read_u64()?,
            data: rd.remaining(),
        },
        TYPE_SRC_CLOSE => Message::SrcClose {
            src_id: rd.read_u64()?,
        },
        TYPE_DST_CLOSE => Message::DstClose {
            src_id: rd.read_u64()?,
        },
        TYPE_OVERFLOW => Message::Overflow {
            src_id: rd.read_u64()?,
        },
        TYPE_UNDERHALF => Message::Underhalf {
            src_id: rd.read_u64()?,
        },
        TYPE_QUERY => Message::Query {
            near_id: rd.read_u64()?,
            dns_type: rd.read_u8()?,
            domain: std::str::from_utf8(rd.remaining()).ok()?,
        },
        TYPE_RESPONSE => {
            let near_id = rd.read_u64()?;
            let dns_type = rd.read_u8()?;
            let ip = match rd.read_u32()? {
                0 => None,
                raw => Some(Ipv4Addr::from(raw)),
            };

            if !rd.remaining().is_empty() {
                return None;
            }

            Message::Response {
                near_id,
                dns_type,
                ip,
            }
        }
        TYPE_HEARTBEAT => Message::Heartbeat,
        _ => return None,
    };

    Some(msg)
}

/// Reassembles the relay byte stream into the hello and then whole message frames.
#[derive(Default)]
pub struct Decoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        if self.read_pos > 0 && self.read_pos == self.buffer.len() {
            self.buffer.clear();
            self.read_pos = 0;
        }

        self.buffer.extend_from_slice(bytes);
    }

    fn compact(&mut self) {
        if self.read_pos > 0 {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    /// Returns the identity from the link hello, or `None` while it is still incomplete.
    pub fn read_hello(&mut self) -> Option<Vec<u8>> {
        let pending = &self.buffer[self.read_pos..];

        let im_len = *pending.get(HELLO_PADDING_SIZE)? as usize;
        let im = pending.get(HELLO_PADDING_SIZE + 1..HELLO_PADDING_SIZE + 1 + im_len)?.to_vec();

        self.read_pos += HELLO_PADDING_SIZE + 1 + im_len;

        Some(im)
    }

    /// Returns the next complete frame (type byte and body), or `None` if more bytes are needed.
    /// Zero-length frames are rejected with `Err`.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ()> {
        let pending = &self.buffer[self.read_pos..];

        if pending.len() < 2 {
            self.compact();
            return Ok(None);
        }

        let len = u16::from_be_bytes([pending[0], pending[1]]) as usize;

        if len == 0 {
            return Err(());
        }

        if pending.len() < 2 + len {
            self.compact();
            return Ok(None);
        }

        let frame = pending[2..2 + len].to_vec();
        self.read_pos += 2 + len;

        Ok(Some(frame))
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.read_pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages(payload: &[u8]) -> Vec<Message> {
        vec![
            Message::NewSource {
                src_id: 1,
                destination: "example.com:443",
            },
            Message::Traffic {
                src_id: 1,
                data: payload,
            },
            Message::SrcClose { src_id: 1 },
            Message::DstClose { src_id: 2 },
            Message::Overflow { src_id: 3 },
            Message::Underhalf { src_id: 3 },
            Message::Query {
                near_id: 9,
                dns_type: 1,
                domain: "example.org",
            },
            Message::Response {
                near_id: 9,
                dns_type: 1,
                ip: Some(Ipv4Addr::new(10, 1, 2, 3)),
            },
            Message::Response {
                near_id: 10,
                dns_type: 1,
                ip: None,
            },
            Message::Heartbeat,
        ]
    }

    #[test]
    fn stream_of_messages() {
        let payload = (0..TRAFFIC_CHUNK_MAX).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let messages = sample_messages(&payload);

        let mut wire = Vec::new();
        write_hello(&mut wire, "deployment-7");

        for msg in messages.iter() {
            write_message(&mut wire, msg);
        }

        assert_eq!(wire[HELLO_PADDING_SIZE], 12);

        // Feed in awkward slices
        let mut decoder = Decoder::new();
        let mut hello = None;
        let mut frames = Vec::new();

        for piece in wire.chunks(977) {
            decoder.feed(piece);

            if hello.is_none() {
                hello = decoder.read_hello();

                if hello.is_none() {
                    continue;
                }
            }

            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(hello.unwrap(), b"deployment-7");
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(frames.len(), messages.len());

        for (frame, msg) in frames.iter().zip(messages.iter()) {
            assert_eq!(read_message(frame).as_ref(), Some(msg));
        }
    }

    #[test]
    fn length_counts_type_and_body() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::SrcClose { src_id: 0x0102 });

        assert_eq!(wire.len(), MESSAGE_HEADER_SIZE + 8);
        assert_eq!(&wire[..3], &[0, 9, b'C']);

        wire.clear();
        write_message(&mut wire, &Message::Heartbeat);
        assert_eq!(wire, vec![0, 1, b'I']);
    }

    #[test]
    fn malformed_frames() {
        assert_eq!(read_message(&[]), None);
        assert_eq!(read_message(b"Z"), None);
        assert_eq!(read_message(&[b'C', 0, 0, 0]), None);
        assert_eq!(read_message(&[b'A', 0, 0, 0, 0, 0, 0, 0, 1, 0xFF]), None);

        let mut decoder = Decoder::new();
        decoder.feed(&[0, 0]);
        assert!(decoder.next_frame().is_err());
    }
}
