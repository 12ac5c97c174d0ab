//! Local TCP socket with a spillable write queue.

use std::io;
use std::net;
use std::path::Path;

use crate::socket;
use crate::spill::{ChunkBuffer, SOCKET_CHUNK_SIZE};

/// What happens once the write queue runs dry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AfterDrain {
    Nothing,
    // Send FIN to the local peer
    ShutdownWrite,
    // Drop the socket
    Close,
    // Drop the socket with a reset
    Abort,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Flush {
    // Queue empty
    Drained,
    // Socket full, wait for writability
    Pending,
    // Queue empty and the socket should now be closed
    Done,
}

pub struct Conn {
    pub stream: net::TcpStream,
    queue: ChunkBuffer,
    after_drain: AfterDrain,
    write_shut: bool,
    pub connecting: bool,
}

impl Conn {
    pub fn new<P: AsRef<Path>>(stream: net::TcpStream, spill_dir: P, id: u64) -> Self {
        Self {
            stream,
            queue: ChunkBuffer::for_socket(spill_dir, id, SOCKET_CHUNK_SIZE),
            after_drain: AfterDrain::Nothing,
            write_shut: false,
            connecting: false,
        }
    }

    pub fn connecting<P: AsRef<Path>>(stream: net::TcpStream, spill_dir: P, id: u64) -> Self {
        let mut conn = Self::new(stream, spill_dir, id);
        conn.connecting = true;
        conn
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        if self.write_shut {
            log::debug!("dropping {} bytes after local shutdown", bytes.len());
            return;
        }

        self.queue.append(bytes);
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Requests an action for when every queued byte has been written. A close request is never
    /// downgraded, and an abort is final.
    pub fn set_after_drain(&mut self, action: AfterDrain) {
        let keep = match self.after_drain {
            AfterDrain::Abort => true,
            AfterDrain::Close => action != AfterDrain::Abort,
            _ => false,
        };

        if !keep {
            self.after_drain = action;
        }
    }

    pub fn aborting(&self) -> bool {
        self.after_drain == AfterDrain::Abort
    }

    pub fn wants_write(&self) -> bool {
        self.connecting || !self.queue.is_empty()
    }

    /// Writes queued bytes until the socket would block.
    pub fn flush(&mut self) -> io::Result<Flush> {
        if self.connecting {
            return Ok(Flush::Pending);
        }

        loop {
            let mut block = self.queue.take_next_block();

            if block.is_empty() {
                break;
            }

            let mut written = 0;

            while written < block.len() {
                match socket::write(&mut self.stream, &block[written..]) {
                    Ok(socket::Io::Done(n)) => written += n,
                    Ok(socket::Io::WouldBlock) | Ok(socket::Io::Closed) => {
                        self.queue.restore(block.split_off(written));
                        return Ok(Flush::Pending);
                    }
                    Err(err) => {
                        self.queue.restore(block.split_off(written));
                        return Err(err);
                    }
                }
            }
        }

        match self.after_drain {
            AfterDrain::Nothing => Ok(Flush::Drained),
            AfterDrain::ShutdownWrite => {
                if !self.write_shut {
                    self.write_shut = true;

                    if let Err(err) = self.stream.shutdown(net::Shutdown::Write) {
                        log::debug!("shutdown failed: {}", err);
                    }
                }

                Ok(Flush::Drained)
            }
            AfterDrain::Close => Ok(Flush::Done),
            AfterDrain::Abort => {
                self.abort();
                Ok(Flush::Done)
            }
        }
    }

    /// Prepares the socket to be dropped with a reset.
    pub fn abort(&self) {
        socket::set_abortive(&self.stream);
    }
}
