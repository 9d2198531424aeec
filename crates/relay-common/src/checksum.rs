//! Checksum utilities for relayed objects
//!
//! Uploads are hashed while their bytes stream through, so the receipt for an
//! object carries a digest of exactly what was sent.

use sha2::{Digest, Sha256};

/// Incremental SHA-256 hasher
#[derive(Clone, Default)]
pub struct Checksum {
    hasher: Sha256,
    bytes: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checksum").field("bytes", &self.bytes).finish()
    }
}

/// SHA-256 of an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    let mut checksum = Checksum::new();
    checksum.update(data);
    checksum.finalize_hex()
}
