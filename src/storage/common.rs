//! Shared context for every tree in one store: the pager, the allocator,
//! the catalog and the current write generation.
//!
//! A store moves through numbered generations. [`Common::begin`] opens the
//! next generation for writing, [`Common::commit`] makes it durable by
//! writing the catalog slot of its parity, and [`Common::rollback`] throws it
//! away by reloading the last committed catalog. Nodes written by an older
//! generation are never modified in place, so any committed root remains a
//! readable snapshot for as long as its generation is kept.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::primitives::io::Store;
use crate::primitives::pager::Pager;
use crate::storage::alloc::deferred::Op;
use crate::storage::alloc::{
    unpack, AllocStats, Allocator, FreeBlock, FREE_KEY_LEN, FREE_VAL_LEN,
};
use crate::storage::layout::FixedFormat;
use crate::storage::meta::{
    meta_size, root_key, Meta, CRC_KEY, END_KEY, FREE_KEY, MAGIC, MAGIC_KEY, PAGE_KEY,
    ROOT_PREFIX, VER_KEY,
};
use crate::storage::options::Options;
use crate::storage::page::{Page, HDR_LEN, HDR_LEN_CRC, MAX_COUNT};
use crate::storage::tree::Tree;
use crate::types::{be_u64, KvError, Off, Result, Ver, MAX_RUN_BYTES};

/// Upper bound on queued free-block edits applied by one drain.
const DRAIN_LIMIT: usize = 1 << 20;

/// One open store: everything a tree needs to read and write nodes.
pub struct Common {
    pager: Pager,
    opts: Options,
    page_size: usize,
    hdr: usize,
    meta_size: u64,
    ver: Ver,
    keep: Ver,
    committed: Ver,
    active: bool,
    poisoned: bool,
    pub(crate) alloc: Allocator,
    meta: Meta,
}

fn free_tree(root: Off, opts: &Options) -> Tree<FixedFormat> {
    Tree::detached(
        FixedFormat::new(FREE_KEY_LEN, FREE_VAL_LEN),
        root,
        opts.rebalance_percent,
    )
}

impl Common {
    /// Formats an empty store and commits generation 0.
    pub fn create(store: Arc<dyn Store>, opts: Options) -> Result<Self> {
        opts.validate()?;
        let pager = Pager::new(store)?;
        if pager.size() != 0 {
            return Err(KvError::Invalid("store is not empty"));
        }
        let page_size = opts.page_size;
        let meta_size = meta_size(page_size) as u64;
        let base = 2 * meta_size;
        pager.truncate(base)?;

        let mut meta = Meta::new(meta_size as usize);
        meta.set(MAGIC_KEY, MAGIC)?;
        meta.set_u64(PAGE_KEY, page_size as u64)?;
        meta.set_u64(CRC_KEY, opts.checksums as u64)?;
        let alloc = Allocator::new(page_size, base, base, free_tree(0, &opts));
        let mut cx = Self {
            pager,
            hdr: if opts.checksums { HDR_LEN_CRC } else { HDR_LEN },
            opts,
            page_size,
            meta_size,
            ver: 0,
            keep: 0,
            committed: 0,
            active: true,
            poisoned: false,
            alloc,
            meta,
        };
        cx.commit()?;
        info!(target: "cowkv::meta", page_size, checksums = cx.opts.checksums, "created store");
        Ok(cx)
    }

    /// Opens a store formatted by [`Common::create`]. The page size must
    /// match the one the store was created with; the checksum setting is
    /// taken from the store.
    pub fn open(store: Arc<dyn Store>, mut opts: Options) -> Result<Self> {
        opts.validate()?;
        let pager = Pager::new(store)?;
        let page_size = opts.page_size;
        let meta_size = meta_size(page_size) as u64;
        let base = 2 * meta_size;
        if pager.size() < base {
            return Err(KvError::Corruption("store too short for its catalog"));
        }
        let (meta, ver) = Meta::load(&pager, page_size)?;
        if meta.get_u64(PAGE_KEY)? != Some(page_size as u64) {
            return Err(KvError::Invalid("page size differs from the store's"));
        }
        opts.checksums = meta.get_u64(CRC_KEY)? == Some(1);
        let alloc = Allocator::new(page_size, base, base, free_tree(0, &opts));
        let mut cx = Self {
            pager,
            hdr: if opts.checksums { HDR_LEN_CRC } else { HDR_LEN },
            opts,
            page_size,
            meta_size,
            ver,
            keep: ver,
            committed: ver,
            active: false,
            poisoned: false,
            alloc,
            meta: Meta::new(meta_size as usize),
        };
        cx.restore(meta)?;
        info!(target: "cowkv::meta", ver, end = cx.alloc.end(), "opened store");
        Ok(cx)
    }

    /// Replaces the in-memory state with a committed catalog, rebuilding the
    /// free index from the persisted free-block tree.
    fn restore(&mut self, meta: Meta) -> Result<()> {
        let end = meta
            .get_u64(END_KEY)?
            .ok_or(KvError::Corruption("catalog without end offset"))?;
        let free_root = meta.get_u64(FREE_KEY)?.unwrap_or(0);
        let base = 2 * self.meta_size;
        if end < base || end % self.page_size as u64 != 0 {
            return Err(KvError::Corruption("catalog end offset out of range"));
        }
        let tree = free_tree(free_root, &self.opts);
        let blocks = self.free_entries(&tree)?;
        let mut alloc = Allocator::new(self.page_size, base, end, tree);
        alloc.restore(blocks)?;
        if self.pager.size() < end {
            self.pager.truncate(end)?;
        }
        self.alloc = alloc;
        self.meta = meta;
        Ok(())
    }

    /// Page size the store was created with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Header length of tree nodes.
    pub fn hdr(&self) -> usize {
        self.hdr
    }

    /// Generation being written, or the last committed one between writes.
    pub fn ver(&self) -> Ver {
        self.ver
    }

    /// Oldest generation whose snapshot must stay readable.
    pub fn keep(&self) -> Ver {
        self.keep
    }

    /// Last durable generation.
    pub fn committed(&self) -> Ver {
        self.committed
    }

    /// True between [`Common::begin`] and the matching commit or rollback.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True once a write in the open generation has failed. Only
    /// [`Common::rollback`] clears it.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Marks the open generation as failed when `result` is an error, so a
    /// half-applied change can never be committed.
    pub(crate) fn poison_on_err<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if self.active && !self.poisoned {
                warn!(target: "cowkv::meta", ver = self.ver, error = %err, "write generation failed");
                self.poisoned = true;
            }
        }
        result
    }

    fn writable(&self) -> Result<()> {
        if !self.active {
            return Err(KvError::Invalid("no write generation in progress"));
        }
        if self.poisoned {
            return Err(KvError::Invalid("write generation failed and must be rolled back"));
        }
        Ok(())
    }

    /// Options in effect, with the checksum flag taken from the store.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Pager over the backing store.
    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// In-memory catalog, including uncommitted changes.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Catalog entries live in memory until the next commit.
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    /// End of the space managed by the allocator.
    pub fn end(&self) -> Off {
        self.alloc.end()
    }

    /// Bytes reserved for the two catalog slots.
    pub fn meta_bytes(&self) -> u64 {
        2 * self.meta_size
    }

    /// Allocator counters.
    pub fn alloc_stats(&self) -> AllocStats {
        self.alloc.stats()
    }

    /// Free blocks in offset order.
    pub fn free_blocks(&self) -> Vec<FreeBlock> {
        self.alloc.free_blocks()
    }

    /// Root of the persisted free-block tree.
    pub fn free_root(&self) -> Off {
        self.alloc.tree.as_ref().map_or(0, |tree| tree.root())
    }

    /// Opens generation `committed + 1` for writing. Blocks released by
    /// generation `keep` or later stay untouched while it is open.
    pub fn begin(&mut self, keep: Ver) -> Result<()> {
        if self.active {
            return Err(KvError::Invalid("write generation already in progress"));
        }
        self.ver = self.committed + 1;
        self.keep = keep.min(self.ver);
        self.active = true;
        debug!(target: "cowkv::meta", ver = self.ver, keep = self.keep, "began generation");
        Ok(())
    }

    /// Makes the current generation durable. Node pages reach the store
    /// before the catalog slot that points at them.
    pub fn commit(&mut self) -> Result<()> {
        self.writable()?;
        let result = self.publish();
        self.poison_on_err(result)?;
        self.committed = self.ver;
        self.active = false;
        debug!(
            target: "cowkv::meta",
            ver = self.ver,
            end = self.alloc.end(),
            free_root = self.free_root(),
            folded = self.alloc.queue.folded(),
            "committed generation"
        );
        Ok(())
    }

    fn publish(&mut self) -> Result<()> {
        self.drain()?;
        let free_root = self.free_root();
        self.meta.set_u64(FREE_KEY, free_root)?;
        self.meta.set_u64(END_KEY, self.alloc.end())?;
        self.meta.set_u64(VER_KEY, self.ver)?;
        let off = (self.ver % 2) * self.meta_size;
        let page = self.meta.encode(off, self.ver, self.page_size)?;
        self.pager.sync()?;
        let mut view = self.pager.exclusive_blank(off, page.len())?;
        view.copy_from_slice(page.buf());
        self.pager.release(view)?;
        self.pager.sync()
    }

    /// Discards everything written since the last commit.
    pub fn rollback(&mut self) -> Result<()> {
        let (meta, ver) = Meta::load(&self.pager, self.page_size)?;
        if ver != self.committed {
            warn!(
                target: "cowkv::meta",
                expected = self.committed,
                found = ver,
                "catalog generation changed underneath"
            );
        }
        self.restore(meta)?;
        self.ver = ver;
        self.committed = ver;
        self.keep = self.keep.min(ver);
        self.active = false;
        self.poisoned = false;
        debug!(target: "cowkv::meta", ver, "rolled back generation");
        Ok(())
    }

    fn check_node_range(&self, off: Off, pages: usize) -> Result<()> {
        let ps = self.page_size as u64;
        if off % ps != 0 || off < 2 * self.meta_size {
            return Err(KvError::Corruption("node offset outside tree space"));
        }
        if !pages.is_power_of_two() || pages * self.page_size > MAX_RUN_BYTES.max(self.page_size) {
            return Err(KvError::Corruption("node spans an invalid page run"));
        }
        Ok(())
    }

    /// Reads the node at `off`, verifying its checksum when the store has them.
    pub fn read_page(&self, off: Off) -> Result<Page> {
        self.check_node_range(off, 1)?;
        let head = self.pager.shared(off, self.page_size)?.into_vec();
        let head = Page::from_bytes(off, self.hdr, head)?;
        let pages = head.pages();
        let page = if pages == 1 {
            head
        } else {
            self.check_node_range(off, pages)?;
            let bytes = self
                .pager
                .shared(off, pages * self.page_size)?
                .into_vec();
            Page::from_bytes(off, self.hdr, bytes)?
        };
        page.verify()?;
        Ok(page)
    }

    /// Reads two nodes, such as siblings about to be rebalanced, acquiring
    /// both regions together. Head pages come first; runs are then re-read
    /// at their full length.
    pub fn read_pair(&self, a: Off, b: Off) -> Result<(Page, Page)> {
        if a == b {
            return Err(KvError::Corruption("sibling pointers alias"));
        }
        self.check_node_range(a, 1)?;
        self.check_node_range(b, 1)?;
        let ps = self.page_size;
        let (head_a, head_b) = self.pager.shared2((a, ps), (b, ps))?;
        let first = Page::from_bytes(a, self.hdr, head_a.into_vec())?;
        let second = Page::from_bytes(b, self.hdr, head_b.into_vec())?;
        let (pa, pb) = (first.pages(), second.pages());
        let (first, second) = if pa == 1 && pb == 1 {
            (first, second)
        } else {
            self.check_node_range(a, pa)?;
            self.check_node_range(b, pb)?;
            let (run_a, run_b) = self.pager.shared2((a, pa * ps), (b, pb * ps))?;
            let first = Page::from_bytes(a, self.hdr, run_a.into_vec())?;
            (first, Page::from_bytes(b, self.hdr, run_b.into_vec())?)
        };
        let (lo, hi) = if a < b { (&first, &second) } else { (&second, &first) };
        if lo.off() + lo.len() as u64 > hi.off() {
            return Err(KvError::Corruption("sibling nodes overlap"));
        }
        first.verify()?;
        second.verify()?;
        Ok((first, second))
    }

    /// Seals and writes a node stamped with the current generation.
    pub fn write_page(&mut self, page: &mut Page) -> Result<()> {
        self.writable()?;
        let result = self.store_page(page);
        self.poison_on_err(result)
    }

    fn store_page(&mut self, page: &mut Page) -> Result<()> {
        self.check_write(page)?;
        page.seal();
        let mut view = self.pager.exclusive_blank(page.off(), page.len())?;
        view.copy_from_slice(page.buf());
        self.pager.release(view)
    }

    /// Seals and writes two nodes, such as redistributed siblings, through
    /// one paired acquire and release.
    pub fn write_pair(&mut self, a: &mut Page, b: &mut Page) -> Result<()> {
        self.writable()?;
        let result = self.store_pair(a, b);
        self.poison_on_err(result)
    }

    fn store_pair(&mut self, a: &mut Page, b: &mut Page) -> Result<()> {
        self.check_write(a)?;
        self.check_write(b)?;
        a.seal();
        b.seal();
        let (mut view_a, mut view_b) = self
            .pager
            .exclusive_blank2((a.off(), a.len()), (b.off(), b.len()))?;
        view_a.copy_from_slice(a.buf());
        view_b.copy_from_slice(b.buf());
        self.pager.release2(view_a, view_b)
    }

    fn check_write(&self, page: &Page) -> Result<()> {
        if page.ver() != self.ver {
            return Err(KvError::Corruption("writing node stamped by another generation"));
        }
        if page.len() != page.pages() * self.page_size || page.count() > MAX_COUNT {
            return Err(KvError::Corruption("node length disagrees with its header"));
        }
        self.check_node_range(page.off(), page.pages())
    }

    /// Fresh node of `pages` pages at `off` for the current generation.
    pub fn blank(&self, off: Off, pages: usize, leaf: bool) -> Page {
        Page::blank(
            off,
            self.hdr,
            pages * self.page_size,
            self.page_size,
            leaf,
            self.ver,
        )
    }

    /// Allocates a run of `pages` pages for the current generation.
    pub fn alloc(&mut self, pages: usize) -> Result<Off> {
        self.writable()?;
        let result = self
            .alloc
            .alloc(&self.pager, self.keep, pages)
            .and_then(|off| self.drain().map(|()| off));
        self.poison_on_err(result)
    }

    /// Releases a run of `pages` pages last written by generation `stamp`.
    /// Space the current generation wrote was never visible to a reader and
    /// is immediately reusable.
    pub fn free(&mut self, off: Off, stamp: Ver, pages: usize) -> Result<()> {
        self.writable()?;
        let ver = if stamp == self.ver { 0 } else { self.ver };
        let result = self.alloc.free(off, pages, ver).and_then(|()| self.drain());
        self.poison_on_err(result)
    }

    /// Applies queued free-block edits to the persisted tree. Nested calls
    /// from inside the tree's own allocations return at once; the outermost
    /// call keeps going until the queue is empty and nothing more shrinks.
    fn drain(&mut self) -> Result<()> {
        if self.alloc.draining {
            return Ok(());
        }
        let mut tree = self
            .alloc
            .tree
            .take()
            .ok_or(KvError::Corruption("free-block tree missing"))?;
        self.alloc.draining = true;
        trace!(target: "cowkv::alloc", pending = self.alloc.queue.len(), "draining free-block edits");
        let result = self.drain_into(&mut tree);
        self.alloc.draining = false;
        self.alloc.tree = Some(tree);
        result
    }

    fn drain_into(&mut self, tree: &mut Tree<FixedFormat>) -> Result<()> {
        let mut applied = 0usize;
        loop {
            while let Some(op) = self.alloc.queue.pop() {
                applied += 1;
                if applied > DRAIN_LIMIT {
                    return Err(KvError::Corruption("free-block edits do not converge"));
                }
                match op {
                    Op::Put { key, ver, .. } => {
                        tree.put(self, &key.to_be_bytes(), &ver.to_be_bytes())?;
                    }
                    Op::Del { key } => {
                        if !tree.delete(self, &key.to_be_bytes())? {
                            warn!(target: "cowkv::alloc", key, "free block missing from tree");
                        }
                    }
                }
            }
            if !self.alloc.shrink(&self.pager, self.keep)? && self.alloc.queue.is_empty() {
                return Ok(());
            }
        }
    }

    /// Root recorded in the catalog for `name`, or 0.
    pub fn root(&self, name: &[u8]) -> Result<Off> {
        Ok(self.meta.get_u64(&root_key(name))?.unwrap_or(0))
    }

    /// Records the root of `name`; a zero root removes the entry.
    pub fn set_root(&mut self, name: &[u8], root: Off) -> Result<()> {
        let key = root_key(name);
        if root == 0 {
            self.meta.remove(&key);
            Ok(())
        } else {
            self.meta.set_u64(&key, root)
        }
    }

    /// Names of every tree with a recorded root.
    pub fn names(&self) -> Vec<Vec<u8>> {
        self.meta
            .prefixed(ROOT_PREFIX)
            .map(|(k, _)| k[ROOT_PREFIX.len()..].to_vec())
            .collect()
    }

    /// Persisted free-block entries, in key order.
    pub(crate) fn persisted_free(&self) -> Result<Vec<FreeBlock>> {
        let tree = self
            .alloc
            .tree
            .as_ref()
            .ok_or(KvError::Corruption("free-block tree missing"))?;
        self.free_entries(tree)
    }

    fn free_entries(&self, tree: &Tree<FixedFormat>) -> Result<Vec<FreeBlock>> {
        let mut out = Vec::new();
        let mut cursor = tree.cursor(self)?;
        while let Some((key, val)) = cursor.next()? {
            let (off, class) = unpack(be_u64(&key)?, self.page_size as u64);
            out.push(FreeBlock {
                off,
                class,
                ver: be_u64(&val)?,
            });
        }
        Ok(out)
    }
}
