//! Versioned buddy allocator over the store's page space.
//!
//! Free space is a set of aligned power-of-two blocks. Each block remembers
//! the generation that released it: 0 when the space was never visible to a
//! committed reader, otherwise the generation whose writes superseded it.
//! A block may be handed out again only when no retained snapshot can still
//! read it, i.e. its version is 0 or older than the oldest kept generation.
//!
//! Two copies of the free set are kept: an in-memory index used for every
//! decision, and a persisted tree of `(offset | class) -> version` entries.
//! Changes to the persisted tree go through [`Deferred`] because editing it
//! allocates and frees pages itself.

pub(crate) mod deferred;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::primitives::pager::Pager;
use crate::storage::tree::Tree;
use crate::storage::layout::FixedFormat;
use crate::types::{KvError, Off, Result, Ver, MAX_CLASS};

use self::deferred::Deferred;

/// Key and value width of the persisted free-block tree.
pub(crate) const FREE_KEY_LEN: usize = 8;
pub(crate) const FREE_VAL_LEN: usize = 8;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// Largest single truncation step when returning space to the store.
const MAX_SHRINK_STEP: u64 = GIB;

/// Counters kept by the allocator.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Blocks handed out
    pub allocs: u64,
    /// Blocks returned
    pub frees: u64,
    /// Blocks halved to satisfy a smaller request
    pub splits: u64,
    /// Buddy pairs joined on free
    pub merges: u64,
    /// Times the managed range was extended
    pub grows: u64,
    /// Times the store was truncated
    pub shrinks: u64,
}

/// One free block as seen by inspection tools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock {
    /// First byte of the block.
    pub off: Off,
    /// Log2 of the block length in pages.
    pub class: u8,
    /// Generation that released it, 0 if never visible.
    pub ver: Ver,
}

/// Free-space bookkeeping for one store.
pub struct Allocator {
    page_size: u64,
    /// Start of the allocatable range; everything below belongs to the catalog.
    base: Off,
    end: Off,
    blocks: BTreeMap<Off, (u8, Ver)>,
    by_class: BTreeSet<(u8, Off)>,
    pub(crate) queue: Deferred,
    pub(crate) tree: Option<Tree<FixedFormat>>,
    pub(crate) draining: bool,
    stats: AllocStats,
}

/// Packs a block into its persisted key.
pub(crate) fn pack(off: Off, class: u8) -> u64 {
    off | class as u64
}

/// Splits a persisted key into offset and class.
pub(crate) fn unpack(key: u64, page_size: u64) -> (Off, u8) {
    let mask = page_size - 1;
    (key & !mask, (key & mask) as u8)
}

/// Smallest class whose block holds `pages` pages.
fn class_for(pages: usize) -> Result<u8> {
    if pages == 0 {
        return Err(KvError::Invalid("zero-page allocation"));
    }
    let class = pages.next_power_of_two().trailing_zeros() as u8;
    if class > MAX_CLASS {
        return Err(KvError::Invalid("allocation larger than the largest block class"));
    }
    Ok(class)
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Store length to extend to so that at least `needed` bytes exist. Grows
/// geometrically from the current length to keep the number of resizes low.
pub(crate) fn grow_target(len: u64, needed: u64, page_size: u64) -> u64 {
    let mut size = len.max(page_size);
    while size < needed {
        size = if size < 64 * KIB {
            size * 4
        } else if size < 100 * MIB {
            size + size / 4
        } else if size < GIB {
            size + size / 16
        } else {
            size + 64 * MIB
        };
    }
    align_up(size, page_size)
}

/// Whether releasing `reclaim` bytes from a store of `len` bytes is worth a truncate.
pub(crate) fn worth_truncating(len: u64, reclaim: u64, page_size: u64) -> bool {
    if reclaim == 0 {
        return false;
    }
    if len <= 8 * page_size {
        true
    } else if len <= 100 * MIB {
        reclaim * 2 >= len
    } else if len <= GIB {
        reclaim * 4 >= len
    } else {
        reclaim * 16 >= len
    }
}

impl Allocator {
    /// Allocator over `[base, end)` with every block taken, until `restore` fills it in.
    pub(crate) fn new(page_size: usize, base: Off, end: Off, tree: Tree<FixedFormat>) -> Self {
        Self {
            page_size: page_size as u64,
            base,
            end: end.max(base),
            blocks: BTreeMap::new(),
            by_class: BTreeSet::new(),
            queue: Deferred::default(),
            tree: Some(tree),
            draining: false,
            stats: AllocStats::default(),
        }
    }

    /// Loads persisted free blocks into the in-memory index without queueing tree edits.
    pub(crate) fn restore(&mut self, blocks: impl IntoIterator<Item = FreeBlock>) -> Result<()> {
        for block in blocks {
            let size = self.block_size(block.class);
            if block.off % size != 0 || block.off < self.base || block.off + size > self.end {
                return Err(KvError::Corruption("persisted free block outside managed range"));
            }
            if self.blocks.insert(block.off, (block.class, block.ver)).is_some() {
                return Err(KvError::Corruption("persisted free block listed twice"));
            }
            self.by_class.insert((block.class, block.off));
        }
        Ok(())
    }

    /// End of managed space.
    pub fn end(&self) -> Off {
        self.end
    }

    /// Start of managed space, just past the catalog slots.
    pub fn base(&self) -> Off {
        self.base
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AllocStats {
        self.stats
    }

    /// Free blocks in offset order.
    pub fn free_blocks(&self) -> Vec<FreeBlock> {
        self.blocks
            .iter()
            .map(|(&off, &(class, ver))| FreeBlock { off, class, ver })
            .collect()
    }

    /// Total bytes in free blocks.
    pub fn free_bytes(&self) -> u64 {
        self.blocks
            .values()
            .map(|&(class, _)| self.block_size(class))
            .sum()
    }

    fn block_size(&self, class: u8) -> u64 {
        self.page_size << class
    }

    fn reusable(ver: Ver, keep: Ver) -> bool {
        ver == 0 || ver < keep
    }

    fn insert_block(&mut self, off: Off, class: u8, ver: Ver) {
        self.blocks.insert(off, (class, ver));
        self.by_class.insert((class, off));
        self.queue.put(pack(off, class), ver);
    }

    fn remove_block(&mut self, off: Off) -> Option<(u8, Ver)> {
        let (class, ver) = self.blocks.remove(&off)?;
        self.by_class.remove(&(class, off));
        self.queue.del(pack(off, class));
        Some((class, ver))
    }

    /// Hands out a block of at least `pages` pages that no snapshot at or
    /// after `keep` can read, growing the store when none is free.
    pub(crate) fn alloc(&mut self, pager: &Pager, keep: Ver, pages: usize) -> Result<Off> {
        let class = class_for(pages)?;
        let found = self
            .by_class
            .range((class, 0)..)
            .find(|&&(_, off)| {
                self.blocks
                    .get(&off)
                    .is_some_and(|&(_, ver)| Self::reusable(ver, keep))
            })
            .copied();
        let off = match found {
            Some((mut have, off)) => {
                let (_, ver) = self
                    .remove_block(off)
                    .ok_or(KvError::Corruption("free index out of sync"))?;
                while have > class {
                    have -= 1;
                    self.insert_block(off + self.block_size(have), have, ver);
                    self.stats.splits += 1;
                }
                off
            }
            None => self.grow(pager, class)?,
        };
        self.stats.allocs += 1;
        trace!(target: "cowkv::alloc", off, class, keep, "allocated block");
        Ok(off)
    }

    /// Extends the managed range by one aligned block of `class`, which is
    /// returned taken. Space skipped for alignment becomes free blocks that
    /// were never visible to a reader.
    fn grow(&mut self, pager: &Pager, class: u8) -> Result<Off> {
        let size = self.block_size(class);
        let start = align_up(self.end, size);
        let new_end = start
            .checked_add(size)
            .ok_or(KvError::Invalid("allocation beyond addressable range"))?;
        let len = pager.size();
        if len < new_end {
            pager.truncate(grow_target(len, new_end, self.page_size))?;
        }
        let old_end = self.end;
        self.end = new_end;
        let mut cur = old_end;
        while cur < start {
            let mut chunk = 0u8;
            while cur % self.block_size(chunk + 1) == 0 && cur + self.block_size(chunk + 1) <= start {
                chunk += 1;
            }
            self.release(cur, chunk, 0)?;
            cur += self.block_size(chunk);
        }
        self.stats.grows += 1;
        debug!(
            target: "cowkv::alloc",
            from = old_end,
            to = new_end,
            store = pager.size(),
            "grew managed range"
        );
        Ok(start)
    }

    /// Returns `pages` pages at `off`, recorded under version `ver`.
    pub(crate) fn free(&mut self, off: Off, pages: usize, ver: Ver) -> Result<()> {
        let class = class_for(pages)?;
        if pages != 1 << class {
            return Err(KvError::Corruption("freed run is not a power of two"));
        }
        self.release(off, class, ver)?;
        self.stats.frees += 1;
        trace!(target: "cowkv::alloc", off, class, ver, "freed block");
        Ok(())
    }

    fn release(&mut self, mut off: Off, mut class: u8, mut ver: Ver) -> Result<()> {
        let size = self.block_size(class);
        if off % size != 0 || off < self.base || off + size > self.end {
            return Err(KvError::Corruption("freed block misaligned or out of range"));
        }
        if let Some((&prev, &(pclass, _))) = self.blocks.range(..=off).next_back() {
            if prev + self.block_size(pclass) > off {
                return Err(KvError::Corruption("block freed twice"));
            }
        }
        if self.blocks.range(off..off + size).next().is_some() {
            return Err(KvError::Corruption("block freed twice"));
        }
        while class < MAX_CLASS {
            let size = self.block_size(class);
            let buddy = off ^ size;
            match self.blocks.get(&buddy) {
                Some(&(bclass, bver)) if bclass == class => {
                    self.remove_block(buddy);
                    ver = ver.max(bver);
                    off = off.min(buddy);
                    class += 1;
                    self.stats.merges += 1;
                }
                _ => break,
            }
        }
        self.insert_block(off, class, ver);
        Ok(())
    }

    /// Gives reusable free space at the top of the range back to the store.
    /// The store itself is truncated only after the range actually shrank, so
    /// slack left by geometric growth survives until then. Returns true when
    /// the free index changed.
    pub(crate) fn shrink(&mut self, pager: &Pager, keep: Ver) -> Result<bool> {
        let mut absorbed = false;
        while let Some((&off, &(class, ver))) = self.blocks.last_key_value() {
            if off + self.block_size(class) != self.end || !Self::reusable(ver, keep) {
                break;
            }
            self.remove_block(off);
            self.end = off;
            absorbed = true;
        }
        let len = pager.size();
        if absorbed && len > self.end && worth_truncating(len, len - self.end, self.page_size) {
            let target = self.end.max(len - (len - self.end).min(MAX_SHRINK_STEP));
            pager.truncate(target)?;
            self.stats.shrinks += 1;
            debug!(target: "cowkv::alloc", from = len, to = target, end = self.end, "shrank store");
        }
        Ok(absorbed)
    }
}
