//! Byte obfuscation hook.
//!
//! An obfuscator is any bijection over a byte slice. It is applied to the first data pack of every
//! stream and to the address fields of tunnel requests, so the opening bytes of a connection do
//! not show a recognizable pattern. It is not encryption.

use crate::error::{Error, Result};

pub trait Obfuscator: Send {
    fn encode(&self, bytes: &mut [u8]);

    fn decode(&self, bytes: &mut [u8]);
}

/// Swaps every pair of adjacent bytes, then inverts the low nibble of each. Self-inverse.
pub struct Swap;

/// Leaves bytes untouched.
pub struct Identity;

impl Obfuscator for Swap {
    fn encode(&self, bytes: &mut [u8]) {
        for pair in bytes.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }

        for byte in bytes.iter_mut() {
            *byte ^= 0x0F;
        }
    }

    fn decode(&self, bytes: &mut [u8]) {
        self.encode(bytes);
    }
}

impl Obfuscator for Identity {
    fn encode(&self, _bytes: &mut [u8]) {}

    fn decode(&self, _bytes: &mut [u8]) {}
}

/// Looks up an obfuscator by its configuration name.
pub fn from_name(name: &str) -> Result<Box<dyn Obfuscator>> {
    match name {
        "swap" => Ok(Box::new(Swap)),
        "none" => Ok(Box::new(Identity)),
        other => Err(Error::Config(format!("unknown obfuscation {:?}", other))),
    }
}
