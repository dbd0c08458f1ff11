//! Payload checksums.
//!
//! Frames carry a CRC-32 (IEEE) of their payload, widened to `u64` on the
//! wire.

use crc32fast::Hasher;

/// Compute the checksum of a contiguous byte span
pub fn checksum(bytes: &[u8]) -> u64 {
    let mut builder = ChecksumBuilder::new();
    builder.update(bytes);
    builder.finish()
}

/// Incremental checksum over a payload split across several buffers
#[derive(Clone, Default)]
pub struct ChecksumBuilder {
    hasher: Hasher,
}

impl ChecksumBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> u64 {
        u64::from(self.hasher.finalize())
    }
}
