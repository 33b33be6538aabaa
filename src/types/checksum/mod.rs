#![forbid(unsafe_code)]

/// Incremental checksum computation.
pub trait Checksum {
    /// Clears all accumulated input.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC-32 backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum stored in a generation-safe pointer slot.
pub fn slot_checksum(generation: u64, pointer: u64) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&generation.to_be_bytes());
    hasher.update(&pointer.to_be_bytes());
    hasher.finalize()
}

/// Checksum over a tree state record followed by the caller header.
pub fn state_checksum(record: &[u8], header: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(record);
    hasher.update(header);
    hasher.finalize()
}
