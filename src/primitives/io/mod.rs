#![forbid(unsafe_code)]

//! Backing stores: a flat, resizable byte space addressed by offset.
//!
//! The engine only ever asks a store for whole ranges. Short reads are an
//! error, since every range it reads was written or zero-filled earlier.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::types::{KvError, Result};

/// Resizable, durable linear byte space backing the engine.
pub trait Store: Send + Sync + 'static {
    /// Fills `dst` with the bytes at `off`; fails on a short read.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, inside the current length.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Makes every completed write durable.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// True when the store holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Shrinks or zero-extends the store to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
fn read_some(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, off)
}

#[cfg(unix)]
fn write_some(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, off)
}

#[cfg(windows)]
fn read_some(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, off)
}

#[cfg(windows)]
fn write_some(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, off)
}

/// Store kept in one file, using positioned reads and writes so views never
/// share a cursor.
#[derive(Clone)]
pub struct FileStore {
    file: Arc<File>,
    path: Arc<PathBuf>,
}

impl FileStore {
    /// Opens `path` for reading and writing, creating it empty if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        debug!(target: "cowkv::io", path = %path.display(), "opened file store");
        Ok(Self {
            file: Arc::new(file),
            path: Arc::new(path),
        })
    }

    /// Path the store was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for FileStore {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        trace!(target: "cowkv::io", off, len = dst.len(), "read");
        while !dst.is_empty() {
            match read_some(&self.file, dst, off) {
                Ok(0) => {
                    return Err(KvError::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "read past end of file store",
                    )))
                }
                Ok(n) => {
                    dst = &mut dst[n..];
                    off += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        trace!(target: "cowkv::io", off, len = src.len(), "write");
        while !src.is_empty() {
            match write_some(&self.file, src, off) {
                Ok(0) => {
                    return Err(KvError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "file store accepted no bytes",
                    )))
                }
                Ok(n) => {
                    src = &src[n..];
                    off += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        trace!(target: "cowkv::io", path = %self.path.display(), "sync");
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        trace!(target: "cowkv::io", len, "set length");
        Ok(self.file.set_len(len)?)
    }
}

/// Heap-backed store, mostly for tests.
///
/// A size limit can be set to make growth fail on demand.
#[derive(Clone)]
pub struct MemStore {
    bytes: Arc<RwLock<Vec<u8>>>,
    limit: Arc<AtomicU64>,
}

impl MemStore {
    /// Creates an empty store with no size limit.
    pub fn new() -> Self {
        Self {
            bytes: Arc::new(RwLock::new(Vec::new())),
            limit: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }

    /// Caps the length the store may be extended to.
    pub fn set_limit(&self, limit: Option<u64>) {
        self.limit
            .store(limit.unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Copies the full contents, for comparing snapshots in tests.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let start = usize::try_from(off).map_err(|_| KvError::Invalid("offset overflow"))?;
        let end = start
            .checked_add(dst.len())
            .ok_or(KvError::Invalid("offset overflow"))?;
        if end > bytes.len() {
            return Err(KvError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of memory store",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let start = usize::try_from(off).map_err(|_| KvError::Invalid("offset overflow"))?;
        let end = start
            .checked_add(src.len())
            .ok_or(KvError::Invalid("offset overflow"))?;
        if end > bytes.len() {
            return Err(KvError::Io(io::Error::new(
                ErrorKind::WriteZero,
                "write past end of memory store",
            )));
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let limit = self.limit.load(Ordering::Relaxed);
        if len > limit {
            return Err(KvError::StoreFull { wanted: len, limit });
        }
        let len = usize::try_from(len).map_err(|_| KvError::Invalid("length overflow"))?;
        self.bytes.write().resize(len, 0);
        Ok(())
    }
}
