#![forbid(unsafe_code)]

//! Locked byte-range views over a [`Store`].
//!
//! Views own a copy of their range. A shared view is released by dropping it;
//! an exclusive view is written back by [`Pager::release`] and discarded if it
//! is dropped instead. Every live view holds a lease so callers can verify
//! that no error path leaks one.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::primitives::io::Store;
use crate::types::{KvError, Result};

/// Page cache-free front end over a backing store.
pub struct Pager {
    store: Arc<dyn Store>,
    size: AtomicU64,
    leases: AtomicUsize,
}

/// Read-only view of a byte range.
pub struct PageRef<'a> {
    pager: &'a Pager,
    off: u64,
    buf: Vec<u8>,
}

/// Writable view of a byte range.
pub struct PageMut<'a> {
    pager: &'a Pager,
    off: u64,
    buf: Vec<u8>,
}

impl Pager {
    /// Wraps a store, caching its current length.
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let size = store.len()?;
        Ok(Self {
            store,
            size: AtomicU64::new(size),
            leases: AtomicUsize::new(0),
        })
    }

    /// Current length of the backing store.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Number of views currently held.
    pub fn outstanding(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    fn bounds(&self, off: u64, len: usize) -> Result<()> {
        let end = off
            .checked_add(len as u64)
            .ok_or(KvError::Invalid("view range overflows"))?;
        if end > self.size() {
            return Err(KvError::Corruption("view beyond end of store"));
        }
        Ok(())
    }

    fn lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    fn unlease(&self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }

    /// Acquires a shared view of `len` bytes at `off`.
    pub fn shared(&self, off: u64, len: usize) -> Result<PageRef<'_>> {
        self.bounds(off, len)?;
        let mut buf = vec![0u8; len];
        self.store.read_at(off, &mut buf)?;
        self.lease();
        Ok(PageRef {
            pager: self,
            off,
            buf,
        })
    }

    /// Acquires an exclusive view that starts zeroed; for ranges about to be fully overwritten.
    pub fn exclusive_blank(&self, off: u64, len: usize) -> Result<PageMut<'_>> {
        self.bounds(off, len)?;
        self.lease();
        Ok(PageMut {
            pager: self,
            off,
            buf: vec![0u8; len],
        })
    }

    /// Writes an exclusive view back and releases it.
    pub fn release(&self, view: PageMut<'_>) -> Result<()> {
        if !std::ptr::eq(view.pager, self) {
            return Err(KvError::Invalid("view released to a foreign pager"));
        }
        self.store.write_at(view.off, &view.buf)
    }

    /// Acquires two shared views together; either both are returned or neither is held.
    pub fn shared2(
        &self,
        a: (u64, usize),
        b: (u64, usize),
    ) -> Result<(PageRef<'_>, PageRef<'_>)> {
        let first = self.shared(a.0, a.1)?;
        let second = self.shared(b.0, b.1)?;
        Ok((first, second))
    }

    /// Acquires two disjoint zeroed exclusive views together, for ranges
    /// about to be fully overwritten.
    pub fn exclusive_blank2(
        &self,
        a: (u64, usize),
        b: (u64, usize),
    ) -> Result<(PageMut<'_>, PageMut<'_>)> {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        if lo.0 + lo.1 as u64 > hi.0 {
            return Err(KvError::Invalid("exclusive views overlap"));
        }
        let first = self.exclusive_blank(a.0, a.1)?;
        let second = self.exclusive_blank(b.0, b.1)?;
        Ok((first, second))
    }

    /// Writes back and releases a pair of exclusive views.
    pub fn release2(&self, a: PageMut<'_>, b: PageMut<'_>) -> Result<()> {
        let first = self.release(a);
        let second = self.release(b);
        first.and(second)
    }

    /// Resizes the backing store.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let before = self.size();
        self.store.truncate(len)?;
        self.size.store(len, Ordering::Release);
        debug!(target: "cowkv::pager", before, after = len, "store resized");
        Ok(())
    }

    /// Flushes the backing store.
    pub fn sync(&self) -> Result<()> {
        self.store.sync_all()
    }
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pager")
            .field("size", &self.size())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl PageRef<'_> {
    /// Offset of the view.
    pub fn off(&self) -> u64 {
        self.off
    }

    /// Detaches the bytes, releasing the view.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl PageMut<'_> {
    /// Offset of the view.
    pub fn off(&self) -> u64 {
        self.off
    }
}

impl Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Deref for PageMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PageMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.pager.unlease();
    }
}

impl Drop for PageMut<'_> {
    fn drop(&mut self) {
        self.pager.unlease();
    }
}
