//! Fixed-length node format: records are fixed-stride slots laid out in key
//! order right after the header. Leaf slots hold `key | value`, internal
//! slots `key | child offset`. Flags are not stored.

use super::{Format, Record};
use crate::storage::page::Page;
use crate::types::{KvError, Off, Result};

const CHILD_LEN: usize = 8;
/// Fewest records a node must hold for splits to make progress.
const MIN_FANOUT: usize = 3;

/// Keys of exactly `key_len` bytes and leaf values of exactly `val_len` bytes.
#[derive(Clone, Copy, Debug)]
pub struct FixedFormat {
    key_len: usize,
    val_len: usize,
}

impl FixedFormat {
    /// Format for keys of exactly `key_len` bytes and values of `val_len` bytes.
    pub fn new(key_len: usize, val_len: usize) -> Self {
        Self { key_len, val_len }
    }

    /// Key width.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Leaf value width.
    pub fn val_len(&self) -> usize {
        self.val_len
    }

    fn stride(&self, leaf: bool) -> usize {
        self.key_len + if leaf { self.val_len } else { CHILD_LEN }
    }

    fn at(&self, page: &Page, i: usize) -> usize {
        page.hdr() + i * self.stride(page.is_leaf())
    }
}

impl Format for FixedFormat {
    fn need(&self, leaf: bool, _key_len: usize, _val_len: usize) -> usize {
        self.stride(leaf)
    }

    fn capacity(&self, hdr: usize, len: usize) -> usize {
        len.saturating_sub(hdr)
    }

    fn max_pages(&self, _page_size: usize) -> usize {
        1
    }

    fn fit(&self, page_size: usize, hdr: usize) -> Result<()> {
        let room = page_size.saturating_sub(hdr);
        if self.key_len == 0 {
            return Err(KvError::Invalid("fixed layout needs a non-empty key"));
        }
        if room / self.stride(true) < MIN_FANOUT || room / self.stride(false) < MIN_FANOUT {
            return Err(KvError::Invalid("page too small for fixed-length records"));
        }
        Ok(())
    }

    fn admit(&self, key: &[u8], val: &[u8], _page_size: usize, _hdr: usize) -> Result<()> {
        if key.len() != self.key_len || val.len() != self.val_len {
            return Err(KvError::Invalid("record size does not match fixed layout"));
        }
        Ok(())
    }

    fn key<'a>(&self, page: &'a Page, i: usize) -> &'a [u8] {
        let at = self.at(page, i);
        &page.buf()[at..at + self.key_len]
    }

    fn val<'a>(&self, page: &'a Page, i: usize) -> &'a [u8] {
        let at = self.at(page, i) + self.key_len;
        let len = self.stride(page.is_leaf()) - self.key_len;
        &page.buf()[at..at + len]
    }

    fn flags(&self, _page: &Page, _i: usize) -> u8 {
        0
    }

    fn set_child(&self, page: &mut Page, i: usize, child: Off) {
        let at = self.at(page, i) + self.key_len;
        page.buf_mut()[at..at + CHILD_LEN].copy_from_slice(&child.to_be_bytes());
    }

    fn used(&self, page: &Page) -> usize {
        page.count() * self.stride(page.is_leaf())
    }

    fn insert(&self, page: &mut Page, i: usize, rec: &Record) -> bool {
        let leaf = page.is_leaf();
        let stride = self.stride(leaf);
        let count = page.count();
        if i > count
            || rec.key.len() != self.key_len
            || rec.val.len() != stride - self.key_len
            || (count + 1) * stride > self.capacity(page.hdr(), page.len())
        {
            return false;
        }
        let at = self.at(page, i);
        let tail = self.at(page, count);
        let buf = page.buf_mut();
        buf.copy_within(at..tail, at + stride);
        buf[at..at + self.key_len].copy_from_slice(&rec.key);
        buf[at + self.key_len..at + stride].copy_from_slice(&rec.val);
        page.set_count(count + 1);
        true
    }

    fn remove(&self, page: &mut Page, i: usize) {
        let count = page.count();
        debug_assert!(i < count);
        let stride = self.stride(page.is_leaf());
        let at = self.at(page, i);
        let tail = self.at(page, count);
        let buf = page.buf_mut();
        buf.copy_within(at + stride..tail, at);
        buf[tail - stride..tail].fill(0);
        page.set_count(count - 1);
    }

    fn check(&self, page: &Page) -> Result<()> {
        if page.pages() != 1 {
            return Err(KvError::Corruption("fixed layout node spans several pages"));
        }
        if self.used(page) > self.capacity(page.hdr(), page.len()) {
            return Err(KvError::Corruption("slot area overruns node"));
        }
        for i in 1..page.count() {
            if self.key(page, i - 1) >= self.key(page, i) {
                return Err(KvError::Corruption("keys out of order"));
            }
        }
        Ok(())
    }
}
