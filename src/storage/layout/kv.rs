//! Variable-length node format.
//!
//! After the header sits an index of u16 big-endian record offsets, one per
//! record, in key order. Records are packed from the end of the node
//! backwards in the same order: record 0 ends at the end of the node and
//! record `i` ends where record `i - 1` starts. Each record is
//! `flags (1) | key length (1) | key | value`; the value runs to the end of
//! the record. Free space is the gap between the end of the index and the
//! start of the last record.

use super::{Format, Record};
use crate::storage::page::Page;
use crate::types::{KvError, Off, Result, MAX_RUN_BYTES};

const INDEX_ENTRY: usize = 2;
const RECORD_HDR: usize = 2;
const CHILD_LEN: usize = 8;

/// Variable-length keys (up to 255 bytes) and values.
#[derive(Clone, Copy, Debug, Default)]
pub struct KvFormat;

impl KvFormat {
    /// Longest key a node of this geometry accepts. Keeps at least three
    /// internal records per page so splits always make progress.
    pub fn max_key(page_size: usize, hdr: usize) -> usize {
        let per_record = (page_size - hdr) / 3;
        per_record
            .saturating_sub(INDEX_ENTRY + RECORD_HDR + CHILD_LEN)
            .min(u8::MAX as usize)
    }

    fn slot(page: &Page, i: usize) -> usize {
        let at = page.hdr() + i * INDEX_ENTRY;
        u16::from_be_bytes([page.buf()[at], page.buf()[at + 1]]) as usize
    }

    fn set_slot(page: &mut Page, i: usize, value: usize) {
        let at = page.hdr() + i * INDEX_ENTRY;
        page.buf_mut()[at..at + INDEX_ENTRY].copy_from_slice(&(value as u16).to_be_bytes());
    }

    /// End of record `i`, exclusive.
    fn end(page: &Page, i: usize) -> usize {
        if i == 0 {
            page.len()
        } else {
            Self::slot(page, i - 1)
        }
    }

    /// Start of the packed record area.
    fn data_start(page: &Page) -> usize {
        Self::end(page, page.count())
    }

    fn index_end(page: &Page) -> usize {
        page.hdr() + page.count() * INDEX_ENTRY
    }
}

impl Format for KvFormat {
    fn need(&self, _leaf: bool, key_len: usize, val_len: usize) -> usize {
        INDEX_ENTRY + RECORD_HDR + key_len + val_len
    }

    fn capacity(&self, hdr: usize, len: usize) -> usize {
        len.saturating_sub(hdr)
    }

    fn max_pages(&self, page_size: usize) -> usize {
        (MAX_RUN_BYTES / page_size).max(1)
    }

    fn fit(&self, page_size: usize, hdr: usize) -> Result<()> {
        if Self::max_key(page_size, hdr) == 0 {
            return Err(KvError::Invalid("page too small for variable-length records"));
        }
        Ok(())
    }

    fn admit(&self, key: &[u8], _val: &[u8], page_size: usize, hdr: usize) -> Result<()> {
        let max = Self::max_key(page_size, hdr);
        if key.len() > max {
            return Err(KvError::RecordTooLarge {
                len: key.len(),
                max,
            });
        }
        Ok(())
    }

    fn key<'a>(&self, page: &'a Page, i: usize) -> &'a [u8] {
        let start = Self::slot(page, i);
        let klen = page.buf()[start + 1] as usize;
        &page.buf()[start + RECORD_HDR..start + RECORD_HDR + klen]
    }

    fn val<'a>(&self, page: &'a Page, i: usize) -> &'a [u8] {
        let start = Self::slot(page, i);
        let klen = page.buf()[start + 1] as usize;
        &page.buf()[start + RECORD_HDR + klen..Self::end(page, i)]
    }

    fn flags(&self, page: &Page, i: usize) -> u8 {
        page.buf()[Self::slot(page, i)]
    }

    fn set_child(&self, page: &mut Page, i: usize, child: Off) {
        let end = Self::end(page, i);
        page.buf_mut()[end - CHILD_LEN..end].copy_from_slice(&child.to_be_bytes());
    }

    fn used(&self, page: &Page) -> usize {
        page.len() - Self::data_start(page) + page.count() * INDEX_ENTRY
    }

    fn insert(&self, page: &mut Page, i: usize, rec: &Record) -> bool {
        let count = page.count();
        let size = RECORD_HDR + rec.key.len() + rec.val.len();
        if i > count || rec.key.len() > u8::MAX as usize {
            return false;
        }
        let data = Self::data_start(page);
        if data < Self::index_end(page) + INDEX_ENTRY + size {
            return false;
        }
        let end = Self::end(page, i);
        let hdr = page.hdr();

        // Records i.. slide down to make room below record i - 1.
        page.buf_mut().copy_within(data..end, data - size);
        for j in i..count {
            let moved = Self::slot(page, j) - size;
            Self::set_slot(page, j, moved);
        }
        let at = hdr + i * INDEX_ENTRY;
        let index_end = hdr + count * INDEX_ENTRY;
        page.buf_mut().copy_within(at..index_end, at + INDEX_ENTRY);
        let start = end - size;
        Self::set_slot(page, i, start);

        let buf = page.buf_mut();
        buf[start] = rec.flags;
        buf[start + 1] = rec.key.len() as u8;
        buf[start + RECORD_HDR..start + RECORD_HDR + rec.key.len()].copy_from_slice(&rec.key);
        buf[start + RECORD_HDR + rec.key.len()..end].copy_from_slice(&rec.val);
        page.set_count(count + 1);
        true
    }

    fn remove(&self, page: &mut Page, i: usize) {
        let count = page.count();
        debug_assert!(i < count);
        let data = Self::data_start(page);
        let start = Self::slot(page, i);
        let size = Self::end(page, i) - start;
        let hdr = page.hdr();

        page.buf_mut().copy_within(data..start, data + size);
        page.buf_mut()[data..data + size].fill(0);
        for j in i + 1..count {
            let moved = Self::slot(page, j) + size;
            Self::set_slot(page, j, moved);
        }
        let at = hdr + i * INDEX_ENTRY;
        let index_end = hdr + count * INDEX_ENTRY;
        page.buf_mut()
            .copy_within(at + INDEX_ENTRY..index_end, at);
        page.buf_mut()[index_end - INDEX_ENTRY..index_end].fill(0);
        page.set_count(count - 1);
    }

    fn check(&self, page: &Page) -> Result<()> {
        let count = page.count();
        let index_end = Self::index_end(page);
        if index_end > page.len() {
            return Err(KvError::Corruption("record index overruns node"));
        }
        let mut end = page.len();
        for i in 0..count {
            let start = Self::slot(page, i);
            if start < index_end || start >= end {
                return Err(KvError::Corruption("record offset out of order"));
            }
            let size = end - start;
            if size < RECORD_HDR {
                return Err(KvError::Corruption("record shorter than its header"));
            }
            let klen = page.buf()[start + 1] as usize;
            if size < RECORD_HDR + klen {
                return Err(KvError::Corruption("record shorter than its key"));
            }
            if !page.is_leaf() && size != RECORD_HDR + klen + CHILD_LEN {
                return Err(KvError::Corruption("internal record without child pointer"));
            }
            end = start;
        }
        for i in 1..count {
            if self.key(page, i - 1) >= self.key(page, i) {
                return Err(KvError::Corruption("keys out of order"));
            }
        }
        Ok(())
    }
}
