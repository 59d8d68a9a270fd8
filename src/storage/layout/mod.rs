//! Node layouts and the structural algorithms shared by every layout.
//!
//! A [`Format`] knows how records sit inside one node. [`Layout`] drives
//! search, iteration, copy-on-write, splits and rebalancing on top of any
//! format, using a [`Stack`] to carry changes back to the root.
//!
//! Internal nodes hold one record per child. The key of record 0 is a low
//! fence that search ignores; for `i > 0` the key of record `i` is no greater
//! than any key under child `i` and greater than every key under child `i - 1`.

mod fixed;
mod kv;

pub use fixed::FixedFormat;
pub use kv::KvFormat;

use std::fmt;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::storage::common::Common;
use crate::storage::page::{Page, MAX_COUNT};
use crate::storage::stack::Stack;
use crate::storage::stats::TreeStats;
use crate::types::{be_u64, KvError, Off, Result, MAX_RUN_BYTES};

/// Deepest tree the engine will walk before assuming a cycle.
const MAX_DEPTH: usize = 48;

/// One decoded record. Internal records carry the child offset as an
/// eight byte big-endian value.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    /// Caller-defined flag byte; zero in internal nodes.
    pub flags: u8,
    /// Record key.
    pub key: Vec<u8>,
    /// Leaf value, or the child offset in an internal node.
    pub val: Vec<u8>,
}

impl Record {
    /// Leaf record.
    pub fn new(flags: u8, key: impl Into<Vec<u8>>, val: impl Into<Vec<u8>>) -> Self {
        Self {
            flags,
            key: key.into(),
            val: val.into(),
        }
    }

    /// Internal record pointing at `child`.
    pub fn child(key: Vec<u8>, child: Off) -> Self {
        Self {
            flags: 0,
            key,
            val: child.to_be_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("flags", &self.flags)
            .field("key", &hex::encode(&self.key))
            .field("val", &hex::encode(&self.val))
            .finish()
    }
}

/// Byte-level encoding of records inside a node.
///
/// Slot accessors assume `i < page.count()` and a page that passed
/// [`Format::check`].
pub trait Format {
    /// Bytes one record consumes, index entry included.
    fn need(&self, leaf: bool, key_len: usize, val_len: usize) -> usize;
    /// Bytes available to records in a node of `len` bytes.
    fn capacity(&self, hdr: usize, len: usize) -> usize;
    /// Widest run of pages one node may span.
    fn max_pages(&self, page_size: usize) -> usize;
    /// Rejects page geometries the format cannot work with.
    fn fit(&self, page_size: usize, hdr: usize) -> Result<()>;
    /// Rejects leaf records the format can never store.
    fn admit(&self, key: &[u8], val: &[u8], page_size: usize, hdr: usize) -> Result<()>;

    /// Key of record `i`.
    fn key<'a>(&self, page: &'a Page, i: usize) -> &'a [u8];
    /// Value of record `i`.
    fn val<'a>(&self, page: &'a Page, i: usize) -> &'a [u8];
    /// Flag byte of record `i`.
    fn flags(&self, page: &Page, i: usize) -> u8;
    /// Overwrites the child pointer of internal record `i`.
    fn set_child(&self, page: &mut Page, i: usize, child: Off);
    /// Bytes taken by records, index entries included.
    fn used(&self, page: &Page) -> usize;
    /// Inserts at slot `i`, or returns false without touching the page if it does not fit.
    fn insert(&self, page: &mut Page, i: usize, rec: &Record) -> bool;
    /// Removes record `i`, closing the gap.
    fn remove(&self, page: &mut Page, i: usize);
    /// Validates the node structure so that slot accessors cannot go out of bounds.
    fn check(&self, page: &Page) -> Result<()>;

    /// Child offset of internal record `i`.
    fn child(&self, page: &Page, i: usize) -> Result<Off> {
        be_u64(self.val(page, i))
    }

    /// Decodes record `i`.
    fn record(&self, page: &Page, i: usize) -> Record {
        Record::new(
            self.flags(page, i),
            self.key(page, i),
            self.val(page, i),
        )
    }

    /// Decodes every record in slot order.
    fn records(&self, page: &Page) -> Vec<Record> {
        (0..page.count()).map(|i| self.record(page, i)).collect()
    }

    /// Replaces the node body with `recs`.
    fn build(&self, page: &mut Page, recs: &[Record]) -> Result<()> {
        let hdr = page.hdr();
        page.buf_mut()[hdr..].fill(0);
        page.set_count(0);
        for (i, rec) in recs.iter().enumerate() {
            if !self.insert(page, i, rec) {
                return Err(KvError::Corruption("records overflow node"));
            }
        }
        Ok(())
    }
}

/// Search, iteration and structural edits for one format.
pub struct Layout<F> {
    fmt: F,
    rebalance_percent: usize,
    retain_root: bool,
    stats: TreeStats,
}

impl<F: Format> Layout<F> {
    /// Layout over `fmt`. Nodes below `rebalance_percent` of a page are rebalanced after deletes.
    pub fn new(fmt: F, rebalance_percent: u8) -> Self {
        Self {
            fmt,
            rebalance_percent: rebalance_percent as usize,
            retain_root: false,
            stats: TreeStats::default(),
        }
    }

    /// Keeps an emptied root leaf allocated instead of freeing it.
    pub fn retain_root(mut self, retain: bool) -> Self {
        self.retain_root = retain;
        self
    }

    /// Record format.
    pub fn format(&self) -> &F {
        &self.fmt
    }

    /// Live counters.
    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    fn max_count(&self, cx: &Common) -> usize {
        (cx.page_size() - 1).min(MAX_COUNT)
    }

    /// Reads and structurally checks one node.
    pub fn load(&self, cx: &Common, off: Off) -> Result<Page> {
        let page = cx.read_page(off)?;
        self.fmt.check(&page)?;
        Ok(page)
    }

    fn bytes(&self, leaf: bool, recs: &[Record]) -> usize {
        recs.iter()
            .map(|rec| self.fmt.need(leaf, rec.key.len(), rec.val.len()))
            .sum()
    }

    /// Smallest power-of-two run that holds `bytes` of records.
    fn pages_for(&self, cx: &Common, bytes: usize) -> Option<usize> {
        let ps = cx.page_size();
        let max = self.fmt.max_pages(ps);
        let mut pages = 1;
        while pages <= max {
            if self.fmt.capacity(cx.hdr(), pages * ps) >= bytes {
                return Some(pages);
            }
            pages *= 2;
        }
        None
    }

    /// Largest leaf record, in bytes, the format can place in a node run.
    pub fn max_record(&self, cx: &Common) -> usize {
        let ps = cx.page_size();
        let run = (self.fmt.max_pages(ps) * ps).min(MAX_RUN_BYTES);
        self.fmt.capacity(cx.hdr(), run)
    }

    /// Fails unless `key`/`val` can be stored as a leaf record.
    pub fn admit(&self, cx: &Common, key: &[u8], val: &[u8]) -> Result<()> {
        self.fmt.admit(key, val, cx.page_size(), cx.hdr())?;
        let need = self.fmt.need(true, key.len(), val.len());
        let max = self.max_record(cx);
        if need > max {
            return Err(KvError::RecordTooLarge {
                len: key.len() + val.len(),
                max,
            });
        }
        Ok(())
    }

    fn lower_bound(&self, page: &Page, key: &[u8]) -> (usize, bool) {
        let (mut lo, mut hi) = (0, page.count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.fmt.key(page, mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let exact = lo < page.count() && self.fmt.key(page, lo) == key;
        (lo, exact)
    }

    fn child_slot(&self, page: &Page, key: &[u8]) -> Result<usize> {
        let count = page.count();
        if count == 0 {
            return Err(KvError::Corruption("internal node without children"));
        }
        let (mut lo, mut hi) = (1, count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.fmt.key(page, mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo - 1)
    }

    /// Descends from `root` towards `key`. The leaf entry holds the exact or insertion slot.
    pub fn seek(&self, cx: &Common, root: Off, key: &[u8]) -> Result<(Stack, bool)> {
        self.stats.inc_seeks();
        let mut stack = Stack::new(cx.page_size());
        if root == 0 {
            return Ok((stack, false));
        }
        let mut off = root;
        loop {
            if stack.len() >= MAX_DEPTH {
                return Err(KvError::Corruption("tree deeper than supported"));
            }
            let page = self.load(cx, off)?;
            if page.is_leaf() {
                let (idx, exact) = self.lower_bound(&page, key);
                stack.push(off, idx);
                return Ok((stack, exact));
            }
            let idx = self.child_slot(&page, key)?;
            stack.push(off, idx);
            off = self.fmt.child(&page, idx)?;
        }
    }

    /// Completes a path whose deepest entry is an internal slot, taking the
    /// first (forward) or last (backward) slot of every node below. Returns
    /// the record count of the reached leaf.
    fn descend(&self, cx: &Common, stack: &mut Stack, forward: bool) -> Result<usize> {
        let (off, mut idx) = stack
            .leaf()
            .ok_or(KvError::Invalid("descend from an empty path"))?;
        let mut page = self.load(cx, off)?;
        while !page.is_leaf() {
            if stack.len() >= MAX_DEPTH {
                return Err(KvError::Corruption("tree deeper than supported"));
            }
            let child = self.fmt.child(&page, idx)?;
            page = self.load(cx, child)?;
            idx = if forward {
                0
            } else {
                page.count().saturating_sub(1)
            };
            stack.push(child, idx);
        }
        Ok(page.count())
    }

    /// Path to the smallest record, or an empty path for an empty tree.
    pub fn first(&self, cx: &Common, root: Off) -> Result<Stack> {
        self.edge(cx, root, true)
    }

    /// Path to the largest record, or an empty path for an empty tree.
    pub fn last(&self, cx: &Common, root: Off) -> Result<Stack> {
        self.edge(cx, root, false)
    }

    fn edge(&self, cx: &Common, root: Off, forward: bool) -> Result<Stack> {
        let mut stack = Stack::new(cx.page_size());
        if root == 0 {
            return Ok(stack);
        }
        let slot = if forward {
            0
        } else {
            self.load(cx, root)?.count().saturating_sub(1)
        };
        stack.push(root, slot);
        if self.descend(cx, &mut stack, forward)? == 0 {
            self.step(cx, &mut stack, forward)?;
        }
        Ok(stack)
    }

    /// Moves the path to the neighbouring record. The path is emptied when
    /// it runs off either end.
    pub fn step(&self, cx: &Common, stack: &mut Stack, forward: bool) -> Result<()> {
        while !stack.is_empty() {
            let mut level = stack.len() - 1;
            loop {
                let (off, idx) = stack.get(level);
                let count = self.load(cx, off)?.count();
                let next = if forward {
                    Some(idx + 1).filter(|&n| n < count)
                } else {
                    idx.checked_sub(1).filter(|&p| p < count)
                };
                match next {
                    Some(slot) => {
                        stack.set(level, off, slot);
                        break;
                    }
                    None if level == 0 => {
                        stack.clear();
                        return Ok(());
                    }
                    None => level -= 1,
                }
            }
            stack.truncate(level + 1);
            if self.descend(cx, stack, forward)? > 0 {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Record under the deepest path entry, if the slot holds one.
    pub fn current(&self, cx: &Common, stack: &Stack) -> Result<Option<Record>> {
        let Some((off, idx)) = stack.leaf() else {
            return Ok(None);
        };
        let page = self.load(cx, off)?;
        if idx >= page.count() {
            return Ok(None);
        }
        Ok(Some(self.fmt.record(&page, idx)))
    }

    /// Copies every node on the path up to `upto` that an older generation
    /// wrote, re-pointing each parent at the copy. Works top-down so parents
    /// are already writable when their child moves.
    fn cow_path(&self, cx: &mut Common, stack: &mut Stack, upto: usize) -> Result<()> {
        let mut parent: Option<Page> = None;
        for level in 0..=upto {
            let (off, idx) = stack.get(level);
            let mut page = self.load(cx, off)?;
            if page.ver() > cx.ver() {
                return Err(KvError::Corruption("node stamped by a future generation"));
            }
            if page.ver() != cx.ver() {
                let pages = page.pages();
                let fresh = cx.alloc(pages)?;
                let mut copy = page.relocate(fresh, cx.ver());
                cx.write_page(&mut copy)?;
                cx.free(off, page.ver(), pages)?;
                stack.set(level, fresh, idx);
                if let Some(parent) = parent.as_mut() {
                    self.fmt.set_child(parent, stack.idx(level - 1), fresh);
                    cx.write_page(parent)?;
                }
                self.stats.inc_copies();
                trace!(
                    target: "cowkv::cow",
                    from = off,
                    to = fresh,
                    stamp = page.ver(),
                    "copied node"
                );
                page = copy;
            }
            parent = Some(page);
        }
        Ok(())
    }

    /// Writes `recs` as the node replacing `old`. The run is reused when its
    /// size fits and the current generation owns it; otherwise a new run is
    /// allocated and `old` is freed.
    fn emit(&self, cx: &mut Common, old: &Page, leaf: bool, recs: &[Record]) -> Result<Off> {
        let mut page = self.stage(cx, old, leaf, recs)?;
        cx.write_page(&mut page)?;
        self.retire(cx, old, &page)?;
        Ok(page.off())
    }

    /// Builds the unwritten node that will replace `old`.
    fn stage(&self, cx: &mut Common, old: &Page, leaf: bool, recs: &[Record]) -> Result<Page> {
        let bytes = self.bytes(leaf, recs);
        let pages = self
            .pages_for(cx, bytes)
            .ok_or(KvError::RecordTooLarge {
                len: bytes,
                max: self.max_record(cx),
            })?;
        let reuse = pages == old.pages() && old.ver() == cx.ver();
        let off = if reuse { old.off() } else { cx.alloc(pages)? };
        let mut page = cx.blank(off, pages, leaf);
        self.fmt.build(&mut page, recs)?;
        Ok(page)
    }

    /// Frees `old` once `new` has replaced it elsewhere.
    fn retire(&self, cx: &mut Common, old: &Page, new: &Page) -> Result<()> {
        if new.off() != old.off() {
            cx.free(old.off(), old.ver(), old.pages())?;
            self.stats.inc_resizes();
        }
        Ok(())
    }

    fn emit_new(&self, cx: &mut Common, leaf: bool, recs: &[Record]) -> Result<Off> {
        let bytes = self.bytes(leaf, recs);
        let pages = self
            .pages_for(cx, bytes)
            .ok_or(KvError::RecordTooLarge {
                len: bytes,
                max: self.max_record(cx),
            })?;
        let off = cx.alloc(pages)?;
        let mut page = cx.blank(off, pages, leaf);
        self.fmt.build(&mut page, recs)?;
        cx.write_page(&mut page)?;
        Ok(off)
    }

    /// Points the path entry at `level` to `off`, fixing the parent's child pointer if the node moved.
    fn repoint(&self, cx: &mut Common, stack: &mut Stack, level: usize, off: Off, slot: usize) -> Result<()> {
        let before = stack.off(level);
        stack.set(level, off, slot);
        if off == before || level == 0 {
            return Ok(());
        }
        let (poff, pidx) = stack.get(level - 1);
        let mut parent = self.load(cx, poff)?;
        self.fmt.set_child(&mut parent, pidx, off);
        cx.write_page(&mut parent)
    }

    /// Inserts a new leaf record at the path's slot.
    pub fn insert(&self, cx: &mut Common, stack: &mut Stack, rec: Record) -> Result<()> {
        if stack.is_empty() {
            let off = self.emit_new(cx, true, std::slice::from_ref(&rec))?;
            stack.push(off, 0);
            return Ok(());
        }
        let level = stack.len() - 1;
        self.cow_path(cx, stack, level)?;
        let idx = stack.idx(level);
        self.place(cx, stack, level, idx, rec, false, idx)
    }

    /// Replaces the leaf record at the path's slot.
    pub fn update(&self, cx: &mut Common, stack: &mut Stack, rec: Record) -> Result<()> {
        let level = stack
            .len()
            .checked_sub(1)
            .ok_or(KvError::Invalid("update through an empty path"))?;
        self.cow_path(cx, stack, level)?;
        let idx = stack.idx(level);
        self.place(cx, stack, level, idx, rec, true, idx)
    }

    /// Puts `rec` at slot `at` of the node at `level` (replacing the record
    /// there when `replace` is set), splitting as needed. Afterwards the path
    /// entry at `level` points at post-insert slot `follow`, wherever that
    /// record ended up.
    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        cx: &mut Common,
        stack: &mut Stack,
        level: usize,
        at: usize,
        rec: Record,
        replace: bool,
        follow: usize,
    ) -> Result<()> {
        let off = stack.off(level);
        let mut page = self.load(cx, off)?;
        if replace {
            self.fmt.remove(&mut page, at);
        }
        if page.count() < self.max_count(cx) && self.fmt.insert(&mut page, at, &rec) {
            cx.write_page(&mut page)?;
            stack.set(level, off, follow);
            self.stats.inc_in_place();
            return Ok(());
        }
        let mut recs = self.fmt.records(&page);
        recs.insert(at, rec);
        self.restructure(cx, stack, level, &page, recs, follow)
    }

    fn restructure(
        &self,
        cx: &mut Common,
        stack: &mut Stack,
        level: usize,
        old: &Page,
        mut recs: Vec<Record>,
        follow: usize,
    ) -> Result<()> {
        let leaf = old.is_leaf();
        if recs.len() <= self.max_count(cx) {
            let pages = self.pages_for(cx, self.bytes(leaf, &recs));
            if recs.len() == 1 || pages == Some(1) {
                let off = self.emit(cx, old, leaf, &recs)?;
                return self.repoint(cx, stack, level, off, follow);
            }
        }

        let k = self.split_point(cx, leaf, &recs)?;
        let right_recs = recs.split_off(k);
        let left_recs = recs;
        let went_right = follow >= k;
        let left = self.emit(cx, old, leaf, &left_recs)?;
        let right = self.emit_new(cx, leaf, &right_recs)?;
        let sep = right_recs[0].key.clone();
        if leaf {
            self.stats.inc_leaf_splits();
        } else {
            self.stats.inc_internal_splits();
        }
        trace!(
            target: "cowkv::split",
            level,
            left,
            right,
            sep = %hex::encode(&sep),
            "split node"
        );

        if level == 0 {
            let root = cx.alloc(1)?;
            let mut page = cx.blank(root, 1, false);
            let fence = left_recs[0].key.clone();
            self.fmt.build(
                &mut page,
                &[Record::child(fence, left), Record::child(sep, right)],
            )?;
            cx.write_page(&mut page)?;
            if went_right {
                stack.set(0, right, follow - k);
            } else {
                stack.set(0, left, follow);
            }
            stack.push_front(root, went_right as usize);
            self.stats.inc_root_splits();
            return Ok(());
        }

        self.repoint(cx, stack, level, left, follow.min(k))?;
        if went_right {
            stack.set(level, right, follow - k);
        }
        let pidx = stack.idx(level - 1);
        let pfollow = if went_right { pidx + 1 } else { pidx };
        self.place(
            cx,
            stack,
            level - 1,
            pidx + 1,
            Record::child(sep, right),
            false,
            pfollow,
        )
    }

    /// Split position balancing bytes, preferring the fewest total pages.
    fn split_point(&self, cx: &Common, leaf: bool, recs: &[Record]) -> Result<usize> {
        let max_count = self.max_count(cx);
        let sizes: Vec<usize> = recs
            .iter()
            .map(|rec| self.fmt.need(leaf, rec.key.len(), rec.val.len()))
            .collect();
        let total: usize = sizes.iter().sum();
        let mut best: Option<((usize, usize), usize)> = None;
        let mut left = 0;
        for k in 1..recs.len() {
            left += sizes[k - 1];
            if k > max_count || recs.len() - k > max_count {
                continue;
            }
            let right = total - left;
            let (Some(lp), Some(rp)) = (self.pages_for(cx, left), self.pages_for(cx, right)) else {
                continue;
            };
            let cost = (lp + rp, left.max(right));
            if best.map_or(true, |(c, _)| cost < c) {
                best = Some((cost, k));
            }
        }
        best.map(|(_, k)| k)
            .ok_or(KvError::Corruption("no valid split point"))
    }

    /// Removes the leaf record at the path's slot. The path keeps pointing at
    /// the slot that now holds the following record.
    pub fn delete(&self, cx: &mut Common, stack: &mut Stack) -> Result<()> {
        let level = stack
            .len()
            .checked_sub(1)
            .ok_or(KvError::Invalid("delete through an empty path"))?;
        self.cow_path(cx, stack, level)?;
        let (off, idx) = stack.get(level);
        let mut page = self.load(cx, off)?;
        if idx >= page.count() {
            return Err(KvError::Invalid("path does not point at a record"));
        }
        self.fmt.remove(&mut page, idx);
        let needed = self.pages_for(cx, self.fmt.used(&page));
        match needed {
            Some(pages) if pages < page.pages() => {
                let recs = self.fmt.records(&page);
                let moved = self.emit(cx, &page, page.is_leaf(), &recs)?;
                self.repoint(cx, stack, level, moved, idx)
            }
            _ => cx.write_page(&mut page),
        }
    }

    fn underfull(&self, cx: &Common, page: &Page) -> bool {
        let capacity = self.fmt.capacity(cx.hdr(), cx.page_size());
        page.count() == 0 || self.fmt.used(page) * 100 < self.rebalance_percent * capacity
    }

    /// Restores occupancy along a path after a delete: merges or
    /// redistributes underfull nodes with a sibling, then drops redundant
    /// root levels. Even slots pair with the next sibling, odd slots with
    /// the previous one.
    pub fn rebalance(&self, cx: &mut Common, stack: &mut Stack) -> Result<()> {
        if stack.is_empty() {
            return Ok(());
        }
        let mut level = stack.len() - 1;
        while level > 0 {
            let node = self.load(cx, stack.off(level))?;
            if !self.underfull(cx, &node) {
                break;
            }
            let (poff, pidx) = stack.get(level - 1);
            let mut parent = self.load(cx, poff)?;
            let siblings = parent.count();
            if siblings < 2 {
                level -= 1;
                continue;
            }
            let sib = if pidx % 2 == 0 && pidx + 1 < siblings {
                pidx + 1
            } else {
                pidx - 1
            };
            let (li, ri) = (pidx.min(sib), pidx.max(sib));
            if !self.pair(cx, stack, level, &mut parent, li, ri)? {
                break;
            }
            level -= 1;
        }
        self.collapse(cx, stack)
    }

    /// Rebalances children `li` and `ri` of `parent`. Returns true when they
    /// merged, which may leave the parent underfull in turn. A lone record
    /// always merges, whatever run it needs, since there is nothing to split.
    fn pair(
        &self,
        cx: &mut Common,
        stack: &mut Stack,
        level: usize,
        parent: &mut Page,
        li: usize,
        ri: usize,
    ) -> Result<bool> {
        let on_left = stack.idx(level - 1) == li;
        let slot = stack.idx(level);
        let (left, right) =
            cx.read_pair(self.fmt.child(parent, li)?, self.fmt.child(parent, ri)?)?;
        self.fmt.check(&left)?;
        self.fmt.check(&right)?;
        let leaf = left.is_leaf();
        if leaf != right.is_leaf() {
            return Err(KvError::Corruption("siblings at different depths"));
        }
        let mut all = self.fmt.records(&left);
        let mut rrecs = self.fmt.records(&right);
        if !leaf {
            if let Some(first) = rrecs.first_mut() {
                first.key = self.fmt.key(parent, ri).to_vec();
            }
        }
        let split = all.len();
        all.append(&mut rrecs);
        let pos = if on_left { slot } else { split + slot };
        let poff = parent.off();

        let fits_one = self.pages_for(cx, self.bytes(leaf, &all)) == Some(1);
        if all.len() <= 1 || (all.len() <= self.max_count(cx) && fits_one) {
            let off = self.emit(cx, &left, leaf, &all)?;
            cx.free(right.off(), right.ver(), right.pages())?;
            self.fmt.set_child(parent, li, off);
            self.fmt.remove(parent, ri);
            cx.write_page(parent)?;
            stack.set(level - 1, poff, li);
            stack.set(level, off, pos);
            self.stats.inc_merges();
            trace!(
                target: "cowkv::merge",
                survivor = off,
                removed = right.off(),
                records = all.len(),
                "merged siblings"
            );
            return Ok(true);
        }

        let k = self.split_point(cx, leaf, &all)?;
        if k == split {
            return Ok(false);
        }
        let rnew = all.split_off(k);
        let mut lpage = self.stage(cx, &left, leaf, &all)?;
        let mut rpage = self.stage(cx, &right, leaf, &rnew)?;
        cx.write_pair(&mut lpage, &mut rpage)?;
        self.retire(cx, &left, &lpage)?;
        self.retire(cx, &right, &rpage)?;
        let (loff, roff) = (lpage.off(), rpage.off());
        self.fmt.set_child(parent, li, loff);
        self.fmt.set_child(parent, ri, roff);
        cx.write_page(parent)?;
        let pslot = if pos < k {
            stack.set(level, loff, pos);
            li
        } else {
            stack.set(level, roff, pos - k);
            ri
        };
        self.stats.inc_redistributions();
        trace!(
            target: "cowkv::merge",
            left = loff,
            right = roff,
            moved = split.abs_diff(k),
            "redistributed siblings"
        );
        let sep = rnew[0].key.clone();
        self.place(cx, stack, level - 1, ri, Record::child(sep, roff), true, pslot)?;
        Ok(false)
    }

    /// Frees an empty root leaf, unless the layout retains it, and replaces
    /// single-child internal roots by their child.
    fn collapse(&self, cx: &mut Common, stack: &mut Stack) -> Result<()> {
        while let Some(root) = stack.root() {
            let page = self.load(cx, root)?;
            if page.is_leaf() {
                if page.count() == 0 && !self.retain_root {
                    cx.free(root, page.ver(), page.pages())?;
                    stack.clear();
                }
                return Ok(());
            }
            match page.count() {
                0 => return Err(KvError::Corruption("internal node without children")),
                1 => {
                    cx.free(root, page.ver(), page.pages())?;
                    stack.pop_front();
                    self.stats.inc_root_collapses();
                }
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Every node reachable from `root` as (offset, bytes).
    pub fn extents(&self, cx: &Common, root: Off) -> Result<Vec<(Off, u64)>> {
        let mut out = Vec::new();
        if root == 0 {
            return Ok(out);
        }
        let mut seen = FxHashSet::default();
        let mut todo = vec![root];
        while let Some(off) = todo.pop() {
            if !seen.insert(off) {
                return Err(KvError::Corruption("node reachable twice"));
            }
            let page = self.load(cx, off)?;
            out.push((off, (page.pages() * cx.page_size()) as u64));
            if !page.is_leaf() {
                for i in 0..page.count() {
                    todo.push(self.fmt.child(&page, i)?);
                }
            }
        }
        Ok(out)
    }

    /// Frees every node reachable from `root`.
    pub fn destroy(&self, cx: &mut Common, root: Off) -> Result<()> {
        let mut stamps = Vec::new();
        for (off, _) in self.extents(cx, root)? {
            let page = cx.read_page(off)?;
            stamps.push((off, page.ver(), page.pages()));
        }
        for (off, ver, pages) in stamps {
            cx.free(off, ver, pages)?;
        }
        Ok(())
    }

    /// Verifies key order and separator bounds across the whole tree.
    /// Returns the number of leaf records.
    pub fn audit(&self, cx: &Common, root: Off) -> Result<usize> {
        if root == 0 {
            return Ok(0);
        }
        let mut depth = None;
        self.audit_node(cx, root, None, None, 0, &mut depth)
    }

    fn audit_node(
        &self,
        cx: &Common,
        off: Off,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        level: usize,
        depth: &mut Option<usize>,
    ) -> Result<usize> {
        if level >= MAX_DEPTH {
            return Err(KvError::Corruption("tree deeper than supported"));
        }
        let page = self.load(cx, off)?;
        if self.fmt.used(&page) > self.fmt.capacity(cx.hdr(), page.len()) {
            return Err(KvError::Corruption("node over capacity"));
        }
        let count = page.count();
        let first = if page.is_leaf() { 0 } else { 1 };
        for i in first..count {
            let key = self.fmt.key(&page, i);
            if lo.is_some_and(|lo| key < lo) || hi.is_some_and(|hi| key >= hi) {
                return Err(KvError::Corruption("key outside separator bounds"));
            }
        }
        if page.is_leaf() {
            match *depth {
                Some(d) if d != level => {
                    return Err(KvError::Corruption("leaves at uneven depth"))
                }
                _ => *depth = Some(level),
            }
            return Ok(count);
        }
        let mut total = 0;
        for i in 0..count {
            let child_lo = if i == 0 { lo } else { Some(self.fmt.key(&page, i)) };
            let child_hi = if i + 1 < count {
                Some(self.fmt.key(&page, i + 1))
            } else {
                hi
            };
            let child = self.fmt.child(&page, i)?;
            total += self.audit_node(cx, child, child_lo, child_hi, level + 1, depth)?;
        }
        Ok(total)
    }
}
