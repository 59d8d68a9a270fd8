//! Typed view over one node's bytes.
//!
//! Header layout (big-endian):
//!
//! | bytes  | field                                         |
//! |--------|-----------------------------------------------|
//! | 0..2   | leaf bit (0x8000) combined with a 15-bit count |
//! | 2..4   | overflow pages beyond the first                |
//! | 4..12  | generation stamp                               |
//! | 12..16 | CRC32 of every other byte (checksummed stores) |

use std::fmt;
use std::ops::Range;

use crate::types::{page_crc32, KvError, Off, Result, Ver};

const COUNT: Range<usize> = 0..2;
const OVERFLOW: Range<usize> = 2..4;
const VERSION: Range<usize> = 4..12;
const CRC: Range<usize> = 12..16;

/// Header length without a checksum.
pub const HDR_LEN: usize = 12;
/// Header length with a checksum.
pub const HDR_LEN_CRC: usize = 16;
/// Largest record count the header can express.
pub const MAX_COUNT: usize = 0x7FFF;

const LEAF_BIT: u16 = 0x8000;

/// One node held in memory, tied to the offset it was read from or will be written to.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    off: Off,
    hdr: usize,
    buf: Vec<u8>,
}

impl Page {
    /// Creates a zeroed node of `len` bytes with a fresh header.
    pub fn blank(off: Off, hdr: usize, len: usize, page_size: usize, leaf: bool, ver: Ver) -> Self {
        let mut page = Self {
            off,
            hdr,
            buf: vec![0u8; len],
        };
        page.set_leaf(leaf);
        page.set_pages(len / page_size);
        page.set_ver(ver);
        page
    }

    /// Wraps bytes read from the store.
    pub fn from_bytes(off: Off, hdr: usize, buf: Vec<u8>) -> Result<Self> {
        if hdr != HDR_LEN && hdr != HDR_LEN_CRC {
            return Err(KvError::Invalid("unsupported header length"));
        }
        if buf.len() < hdr {
            return Err(KvError::Corruption("page shorter than header"));
        }
        Ok(Self { off, hdr, buf })
    }

    /// Store offset of the node.
    pub fn off(&self) -> Off {
        self.off
    }

    /// Header length in bytes.
    pub fn hdr(&self) -> usize {
        self.hdr
    }

    /// Total length of the node in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when the buffer holds nothing past the header.
    pub fn is_empty(&self) -> bool {
        self.buf.len() <= self.hdr
    }

    /// Raw node bytes, header included.
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable raw node bytes.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Gives up the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn word(&self) -> u16 {
        u16::from_be_bytes([self.buf[COUNT.start], self.buf[COUNT.start + 1]])
    }

    fn set_word(&mut self, word: u16) {
        self.buf[COUNT].copy_from_slice(&word.to_be_bytes());
    }

    /// True for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        self.word() & LEAF_BIT != 0
    }

    /// Sets the leaf bit, keeping the count.
    pub fn set_leaf(&mut self, leaf: bool) {
        let count = self.word() & !LEAF_BIT;
        self.set_word(if leaf { count | LEAF_BIT } else { count });
    }

    /// Number of records in the node.
    pub fn count(&self) -> usize {
        (self.word() & !LEAF_BIT) as usize
    }

    /// Sets the record count, keeping the leaf bit.
    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count <= MAX_COUNT);
        let leaf = self.word() & LEAF_BIT;
        self.set_word(leaf | (count as u16 & !LEAF_BIT));
    }

    /// Pages the node spans, the first page included.
    pub fn pages(&self) -> usize {
        u16::from_be_bytes([self.buf[OVERFLOW.start], self.buf[OVERFLOW.start + 1]]) as usize + 1
    }

    /// Records the run length in pages.
    pub fn set_pages(&mut self, pages: usize) {
        let overflow = pages.saturating_sub(1) as u16;
        self.buf[OVERFLOW].copy_from_slice(&overflow.to_be_bytes());
    }

    /// Generation that wrote the node.
    pub fn ver(&self) -> Ver {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&self.buf[VERSION]);
        u64::from_be_bytes(arr)
    }

    /// Restamps the node.
    pub fn set_ver(&mut self, ver: Ver) {
        self.buf[VERSION].copy_from_slice(&ver.to_be_bytes());
    }

    /// Copies the node to a new location under a new generation stamp.
    pub fn relocate(&self, off: Off, ver: Ver) -> Self {
        let mut copy = self.clone();
        copy.off = off;
        copy.set_ver(ver);
        copy
    }

    fn crc(&self) -> u32 {
        page_crc32(self.off, &[&self.buf[..CRC.start], &self.buf[CRC.end..]])
    }

    /// Stores the checksum, if the header has room for one.
    pub fn seal(&mut self) {
        if self.hdr == HDR_LEN_CRC {
            let crc = self.crc();
            self.buf[CRC].copy_from_slice(&crc.to_be_bytes());
        }
    }

    /// Checks the stored checksum, if the header carries one.
    pub fn verify(&self) -> Result<()> {
        if self.hdr != HDR_LEN_CRC {
            return Ok(());
        }
        let stored = u32::from_be_bytes([
            self.buf[CRC.start],
            self.buf[CRC.start + 1],
            self.buf[CRC.start + 2],
            self.buf[CRC.start + 3],
        ]);
        if stored != self.crc() {
            return Err(KvError::Corruption("page checksum mismatch"));
        }
        Ok(())
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("off", &self.off)
            .field("leaf", &self.is_leaf())
            .field("count", &self.count())
            .field("pages", &self.pages())
            .field("ver", &self.ver())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_bit_exact() {
        let mut page = Page::blank(4096, HDR_LEN, 8192, 4096, true, 0x0102_0304_0506_0708);
        page.set_count(3);
        assert_eq!(&page.buf()[0..2], &[0x80, 0x03]);
        assert_eq!(&page.buf()[2..4], &[0x00, 0x01]);
        assert_eq!(&page.buf()[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(page.is_leaf());
        assert_eq!(page.pages(), 2);

        page.set_leaf(false);
        assert_eq!(page.count(), 3);
        assert_eq!(&page.buf()[0..2], &[0x00, 0x03]);
        page.set_count(MAX_COUNT);
        assert!(!page.is_leaf());
        assert_eq!(page.count(), MAX_COUNT);
    }

    #[test]
    fn checksum_detects_damage() -> Result<()> {
        let mut page = Page::blank(256, HDR_LEN_CRC, 64, 64, true, 3);
        page.buf_mut()[40] = 0xAA;
        page.seal();
        page.verify()?;

        let moved = Page::from_bytes(512, HDR_LEN_CRC, page.buf().to_vec())?;
        assert!(moved.verify().is_err());

        page.buf_mut()[41] = 0x55;
        assert!(matches!(page.verify(), Err(KvError::Corruption(_))));
        page.seal();
        page.set_ver(4);
        assert!(page.verify().is_err());
        Ok(())
    }

    #[test]
    fn relocate_restamps() {
        let page = Page::blank(64, HDR_LEN, 64, 64, false, 1);
        let copy = page.relocate(128, 2);
        assert_eq!(copy.off(), 128);
        assert_eq!(copy.ver(), 2);
        assert!(!copy.is_leaf());
        assert_eq!(page.ver(), 1);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(Page::from_bytes(0, HDR_LEN, vec![0u8; 4]).is_err());
        assert!(Page::from_bytes(0, 13, vec![0u8; 64]).is_err());
    }
}
