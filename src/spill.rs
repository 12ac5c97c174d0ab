//! Ordered byte queue that spills to disk.
//!
//! Appended bytes accumulate in a live tail buffer. Once the tail reaches the chunk size it is
//! written to `{dir}/{pid}-{socket_id}.{sequence}` and cleared, so a slow consumer costs disk
//! space rather than memory. Consumers take whole blocks: the cached block handed back by a
//! previous partial consumer first, then the oldest chunk, then the tail.
//!
//! Appends are never split across chunks, so a block always holds whole appends.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Chunk size used for channel outboxes (one thousand full-size packs).
pub const CHANNEL_CHUNK_SIZE: usize = 1460 * 1000;

/// Chunk size used for socket write queues.
pub const SOCKET_CHUNK_SIZE: usize = 65535;

enum Chunk {
    // Sequence number and length of a chunk file
    File(u64, usize),
    // A chunk that could not be written to disk
    Memory(Vec<u8>),
}

pub struct ChunkBuffer {
    dir: PathBuf,
    name: String,
    chunk_size: usize,
    // Remainder handed back by a consumer
    cache: Vec<u8>,
    // Spilled chunks, oldest first
    chunks: VecDeque<Chunk>,
    chunk_bytes: usize,
    next_seq: u64,
    // Live tail
    tail: Vec<u8>,
}

impl ChunkBuffer {
    pub fn new<P: AsRef<Path>>(dir: P, name: String, chunk_size: usize) -> Self {
        assert!(chunk_size > 0);

        Self {
            dir: dir.as_ref().to_path_buf(),
            name,
            chunk_size,
            cache: Vec::new(),
            chunks: VecDeque::new(),
            chunk_bytes: 0,
            next_seq: 0,
            tail: Vec::new(),
        }
    }

    /// Creates a buffer whose spill files are named after this process and `socket_id`.
    pub fn for_socket<P: AsRef<Path>>(dir: P, socket_id: u64, chunk_size: usize) -> Self {
        let name = format!("{}-{}", std::process::id(), socket_id);

        Self::new(dir, name, chunk_size)
    }

    fn chunk_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, seq))
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        self.tail.extend_from_slice(bytes);

        if self.tail.len() >= self.chunk_size {
            self.spill_tail();
        }
    }

    fn spill_tail(&mut self) {
        let data = std::mem::take(&mut self.tail);
        let len = data.len();

        let seq = self.next_seq;
        self.next_seq += 1;

        let path = self.chunk_path(seq);

        match fs::write(&path, &data) {
            Ok(()) => {
                log::debug!("spilled {} bytes to {}", len, path.display());
                self.chunks.push_back(Chunk::File(seq, len));
            }
            Err(err) => {
                // Keep the bytes, just not on disk
                log::error!("failed to spill {} bytes to {}: {}", len, path.display(), err);
                self.chunks.push_back(Chunk::Memory(data));
            }
        }

        self.chunk_bytes += len;
    }

    fn read_chunk_file(&self, seq: u64) -> io::Result<Vec<u8>> {
        let path = self.chunk_path(seq);

        let data = fs::read(&path)?;

        if let Err(err) = fs::remove_file(&path) {
            log::warn!("failed to remove {}: {}", path.display(), err);
        }

        Ok(data)
    }

    /// Returns the next contiguous run of pending bytes, or an empty vector.
    pub fn take_next_block(&mut self) -> Vec<u8> {
        if !self.cache.is_empty() {
            return std::mem::take(&mut self.cache);
        }

        while let Some(chunk) = self.chunks.pop_front() {
            match chunk {
                Chunk::File(seq, len) => {
                    self.chunk_bytes -= len;

                    match self.read_chunk_file(seq) {
                        Ok(data) => return data,
                        Err(err) => {
                            log::error!(
                                "lost {} bytes, failed to read {}: {}",
                                len,
                                self.chunk_path(seq).display(),
                                err
                            );
                        }
                    }
                }
                Chunk::Memory(data) => {
                    self.chunk_bytes -= data.len();
                    return data;
                }
            }
        }

        return std::mem::take(&mut self.tail);
    }

    /// Hands back the unconsumed end of a block; it will be returned first by the next take.
    pub fn restore(&mut self, remainder: Vec<u8>) {
        if remainder.is_empty() {
            return;
        }

        if self.cache.is_empty() {
            self.cache = remainder;
        } else {
            let mut joined = remainder;
            joined.extend_from_slice(&self.cache);
            self.cache = joined;
        }
    }

    /// Total pending bytes.
    pub fn len(&self) -> usize {
        self.cache.len() + self.chunk_bytes + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks currently held outside the tail.
    pub fn spilled_chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        for chunk in self.chunks.iter() {
            if let Chunk::File(seq, _) = chunk {
                let path = self.chunk_path(*seq);

                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("failed to remove {}: {}", path.display(), err);
                }
            }
        }
    }
}
