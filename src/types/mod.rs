//! Shared aliases, limits and the crate error type.
#![forbid(unsafe_code)]

/// Page checksums.
pub mod checksum;

pub use checksum::page_crc32;

/// Byte offset into the backing store. Offset 0 doubles as the null pointer.
pub type Off = u64;
/// Write generation counter.
pub type Ver = u64;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 64;
/// Largest supported page size. Page offsets are stored as u16.
pub const MAX_PAGE_SIZE: usize = 1 << 16;
/// Largest node run in bytes; in-page index offsets must fit in a u16.
pub const MAX_RUN_BYTES: usize = 1 << 16;
/// Highest buddy size class representable in a free-block key.
pub const MAX_CLASS: u8 = 48;

/// Every failure the engine reports.
#[derive(thiserror::Error, Debug)]
pub enum KvError {
    /// The backing store failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes break a structural rule.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller asked for something the current state does not allow.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A leaf record cannot fit in the widest node run.
    #[error("record of {len} bytes exceeds limit of {max} bytes")]
    RecordTooLarge {
        /// Bytes the record needs.
        len: usize,
        /// Largest record the tree accepts.
        max: usize,
    },
    /// The backing store refused to grow. The open generation must be rolled back.
    #[error("store cannot grow to {wanted} bytes (limit {limit})")]
    StoreFull {
        /// Length that was requested.
        wanted: u64,
        /// Length the store is capped at.
        limit: u64,
    },
    /// Options could not be parsed or written.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, KvError>;

/// Decodes a big-endian u64 from an exactly eight byte slice.
pub fn be_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| KvError::Corruption("expected 8 byte integer"))?;
    Ok(u64::from_be_bytes(arr))
}
