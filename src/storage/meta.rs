//! Catalog of store-wide settings and named tree roots.
//!
//! The catalog lives in two fixed slots at the start of the store, each
//! `max(page size, 4096)` bytes. A commit writes the slot of its generation's
//! parity, so the other slot always holds the previous commit intact. Each
//! slot is a single variable-length leaf with a checksummed header; open
//! picks the valid slot with the highest generation.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::primitives::pager::Pager;
use crate::storage::layout::{Format, KvFormat, Record};
use crate::storage::page::{Page, HDR_LEN_CRC};
use crate::types::{be_u64, KvError, Off, Result, Ver};

/// Smallest catalog slot, regardless of page size.
pub const MIN_META_SIZE: usize = 4096;

pub(crate) const MAGIC_KEY: &[u8] = b"magic";
pub(crate) const MAGIC: &[u8] = b"cowkv\x00\x00\x01";
pub(crate) const PAGE_KEY: &[u8] = b"page";
pub(crate) const CRC_KEY: &[u8] = b"crc";
pub(crate) const VER_KEY: &[u8] = b"ver";
pub(crate) const END_KEY: &[u8] = b"end";
pub(crate) const FREE_KEY: &[u8] = b"free";
pub(crate) const ROOT_PREFIX: &[u8] = b"root:";

/// Record overhead inside the slot: index entry plus record header.
const ENTRY_OVERHEAD: usize = 4;
const MAX_KEY: usize = u8::MAX as usize;

/// Catalog slot size for a page size.
pub fn meta_size(page_size: usize) -> usize {
    page_size.max(MIN_META_SIZE)
}

/// In-memory copy of the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    size: usize,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Meta {
    /// Empty catalog for slots of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            entries: BTreeMap::new(),
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Stores `val` under `key`, failing if the catalog would no longer fit its slot.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY {
            return Err(KvError::RecordTooLarge {
                len: key.len(),
                max: MAX_KEY,
            });
        }
        let old = self.get(key).map_or(0, |v| ENTRY_OVERHEAD + key.len() + v.len());
        let used = self.used() - old + ENTRY_OVERHEAD + key.len() + val.len();
        if used > self.size {
            return Err(KvError::Invalid("catalog page full"));
        }
        self.entries.insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    /// First entry whose key is at or after `key`.
    pub fn seek(&self, key: &[u8]) -> Option<(&[u8], &[u8])> {
        self.entries
            .range(key.to_vec()..)
            .next()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn prefixed<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Big-endian integer stored under `key`.
    pub fn get_u64(&self, key: &[u8]) -> Result<Option<u64>> {
        self.get(key).map(be_u64).transpose()
    }

    /// Stores `val` big-endian under `key`.
    pub fn set_u64(&mut self, key: &[u8], val: u64) -> Result<()> {
        self.set(key, &val.to_be_bytes())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the catalog holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes the encoded slot occupies.
    pub fn used(&self) -> usize {
        HDR_LEN_CRC
            + self
                .entries
                .iter()
                .map(|(k, v)| ENTRY_OVERHEAD + k.len() + v.len())
                .sum::<usize>()
    }

    /// Renders the catalog as the slot image for offset `off`.
    pub(crate) fn encode(&self, off: Off, ver: Ver, page_size: usize) -> Result<Page> {
        let mut page = Page::blank(off, HDR_LEN_CRC, self.size, page_size, true, ver);
        let recs: Vec<Record> = self
            .entries
            .iter()
            .map(|(k, v)| Record::new(0, k.as_slice(), v.as_slice()))
            .collect();
        KvFormat.build(&mut page, &recs)?;
        page.seal();
        Ok(page)
    }

    /// Parses a slot image, verifying its checksum and structure.
    pub(crate) fn decode(page: &Page) -> Result<Self> {
        page.verify()?;
        if !page.is_leaf() {
            return Err(KvError::Corruption("catalog slot is not a leaf"));
        }
        KvFormat.check(page)?;
        let mut meta = Self::new(page.len());
        for i in 0..page.count() {
            meta.entries
                .insert(KvFormat.key(page, i).to_vec(), KvFormat.val(page, i).to_vec());
        }
        Ok(meta)
    }

    /// Reads both slots and returns the catalog of the newest valid one with its generation.
    pub(crate) fn load(pager: &Pager, page_size: usize) -> Result<(Self, Ver)> {
        let size = meta_size(page_size);
        let mut best: Option<(Self, Ver)> = None;
        for slot in 0..2u64 {
            let off = slot * size as u64;
            let bytes = pager.shared(off, size)?.into_vec();
            let page = Page::from_bytes(off, HDR_LEN_CRC, bytes)?;
            let meta = match Self::decode(&page) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(target: "cowkv::meta", slot, %err, "ignoring unreadable catalog slot");
                    continue;
                }
            };
            if meta.get(MAGIC_KEY) != Some(MAGIC) {
                warn!(target: "cowkv::meta", slot, "ignoring catalog slot without magic");
                continue;
            }
            let ver = match meta.get_u64(VER_KEY) {
                Ok(Some(ver)) if ver == page.ver() => ver,
                _ => {
                    warn!(
                        target: "cowkv::meta",
                        slot,
                        stamp = page.ver(),
                        "ignoring catalog slot whose generation disagrees with its header"
                    );
                    continue;
                }
            };
            if best.as_ref().map_or(true, |(_, have)| ver > *have) {
                best = Some((meta, ver));
            }
        }
        let (meta, ver) = best.ok_or(KvError::Corruption("no valid catalog slot"))?;
        debug!(target: "cowkv::meta", ver, entries = meta.len(), "loaded catalog");
        Ok((meta, ver))
    }
}

/// Catalog key for a named root.
pub(crate) fn root_key(name: &[u8]) -> Vec<u8> {
    let mut key = ROOT_PREFIX.to_vec();
    key.extend_from_slice(name);
    key
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::primitives::io::{MemStore, Store};

    #[test]
    fn slot_roundtrip() -> Result<()> {
        let mut meta = Meta::new(4096);
        meta.set(MAGIC_KEY, MAGIC)?;
        meta.set_u64(VER_KEY, 9)?;
        meta.set(&root_key(b"users"), &[0, 0, 0, 0, 0, 0, 0x40, 0])?;
        let page = meta.encode(4096, 9, 512)?;
        assert_eq!(page.pages(), 8);
        assert_eq!(Meta::decode(&page)?, meta);
        assert_eq!(meta.get_u64(VER_KEY)?, Some(9));
        assert_eq!(meta.prefixed(ROOT_PREFIX).count(), 1);
        assert_eq!(meta.seek(b"s").map(|(k, _)| k), Some(VER_KEY));
        Ok(())
    }

    #[test]
    fn full_catalog_rejects_growth() -> Result<()> {
        let mut meta = Meta::new(4096);
        let big = vec![7u8; 4000];
        meta.set(b"a", &big)?;
        assert!(matches!(meta.set(b"b", &big), Err(KvError::Invalid(_))));
        meta.set(b"a", &[1])?;
        meta.set(b"b", &big)?;
        assert!(meta.used() <= 4096);
        Ok(())
    }

    #[test]
    fn load_prefers_newest_valid_slot() -> Result<()> {
        let store = MemStore::new();
        store.truncate(8192)?;
        let pager = Pager::new(Arc::new(store.clone()))?;
        for ver in [4u64, 5] {
            let mut meta = Meta::new(4096);
            meta.set(MAGIC_KEY, MAGIC)?;
            meta.set_u64(VER_KEY, ver)?;
            let off = (ver % 2) * 4096;
            let page = meta.encode(off, ver, 4096)?;
            store.write_at(off, page.buf())?;
        }
        assert_eq!(Meta::load(&pager, 4096)?.1, 5);

        store.write_at(4096 + 100, &[0xFF])?;
        assert_eq!(Meta::load(&pager, 4096)?.1, 4);

        store.write_at(100, &[0xFF])?;
        assert!(matches!(Meta::load(&pager, 4096), Err(KvError::Corruption(_))));
        assert_eq!(pager.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn slot_with_mismatched_stamp_is_skipped() -> Result<()> {
        let store = MemStore::new();
        store.truncate(8192)?;
        let pager = Pager::new(Arc::new(store.clone()))?;
        for (ver, stamp) in [(2u64, 2u64), (3, 7)] {
            let mut meta = Meta::new(4096);
            meta.set(MAGIC_KEY, MAGIC)?;
            meta.set_u64(VER_KEY, ver)?;
            let off = (ver % 2) * 4096;
            let page = meta.encode(off, stamp, 4096)?;
            store.write_at(off, page.buf())?;
        }
        assert_eq!(Meta::load(&pager, 4096)?.1, 2);
        assert_eq!(pager.outstanding(), 0);
        Ok(())
    }
}
