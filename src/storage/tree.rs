//! Ordered key-value trees over a [`Common`] context.
//!
//! A [`Tree`] is a root offset plus a [`Layout`]. Named trees mirror their
//! root into the catalog after every change so a commit captures it; the
//! free-block tree is detached and its root is stored by the context itself.

use std::ops::Bound;

use crate::storage::common::Common;
use crate::storage::layout::{Format, Layout, Record};
use crate::storage::stack::Stack;
use crate::storage::stats::TreeStatsSnapshot;
use crate::types::{Off, Result};

/// Owned key and value.
pub type Entry = (Vec<u8>, Vec<u8>);

/// An ordered map stored as a copy-on-write B+tree.
pub struct Tree<F> {
    layout: Layout<F>,
    root: Off,
    name: Option<Vec<u8>>,
}

impl<F: Format> Tree<F> {
    /// Empty anonymous tree.
    pub fn new(cx: &Common, fmt: F) -> Result<Self> {
        Self::with_root(cx, fmt, 0)
    }

    /// Anonymous tree rooted at `root`, e.g. a snapshot kept by the caller.
    pub fn with_root(cx: &Common, fmt: F, root: Off) -> Result<Self> {
        fmt.fit(cx.page_size(), cx.hdr())?;
        Ok(Self {
            layout: Layout::new(fmt, cx.options().rebalance_percent),
            root,
            name: None,
        })
    }

    /// Tree whose root is recorded in the catalog under `name`.
    pub fn open(cx: &Common, name: &[u8], fmt: F) -> Result<Self> {
        let mut tree = Self::with_root(cx, fmt, cx.root(name)?)?;
        tree.name = Some(name.to_vec());
        Ok(tree)
    }

    /// Tree that keeps its root leaf even when empty, with no geometry check.
    pub(crate) fn detached(fmt: F, root: Off, rebalance_percent: u8) -> Self {
        Self {
            layout: Layout::new(fmt, rebalance_percent).retain_root(true),
            root,
            name: None,
        }
    }

    /// Current root offset, 0 when empty.
    pub fn root(&self) -> Off {
        self.root
    }

    /// Catalog name, for named trees.
    pub fn name(&self) -> Option<&[u8]> {
        self.name.as_deref()
    }

    /// Underlying layout.
    pub fn layout(&self) -> &Layout<F> {
        &self.layout
    }

    /// Counters since the tree was opened.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.layout.stats().snapshot()
    }

    /// Re-reads the root from the catalog, e.g. after a rollback.
    pub fn reload(&mut self, cx: &Common) -> Result<()> {
        if let Some(name) = &self.name {
            self.root = cx.root(name)?;
        }
        Ok(())
    }

    fn set_root(&mut self, cx: &mut Common, stack: &Stack) -> Result<()> {
        self.root = stack.root().unwrap_or(0);
        match &self.name {
            Some(name) => cx.set_root(name, self.root),
            None => Ok(()),
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, cx: &Common, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (stack, exact) = self.layout.seek(cx, self.root, key)?;
        if !exact {
            return Ok(None);
        }
        Ok(self.layout.current(cx, &stack)?.map(|rec| rec.val))
    }

    /// Like [`Tree::get`], also returning the record flags.
    pub fn get_with_flags(&self, cx: &Common, key: &[u8]) -> Result<Option<(u8, Vec<u8>)>> {
        let (stack, exact) = self.layout.seek(cx, self.root, key)?;
        if !exact {
            return Ok(None);
        }
        Ok(self
            .layout
            .current(cx, &stack)?
            .map(|rec| (rec.flags, rec.val)))
    }

    /// True when `key` is present.
    pub fn contains(&self, cx: &Common, key: &[u8]) -> Result<bool> {
        Ok(self.layout.seek(cx, self.root, key)?.1)
    }

    /// Inserts or replaces. Returns true when the key already existed.
    pub fn put(&mut self, cx: &mut Common, key: &[u8], val: &[u8]) -> Result<bool> {
        self.put_with_flags(cx, 0, key, val)
    }

    /// Like [`Tree::put`], storing `flags` with the record.
    pub fn put_with_flags(&mut self, cx: &mut Common, flags: u8, key: &[u8], val: &[u8]) -> Result<bool> {
        self.layout.admit(cx, key, val)?;
        let result = self.store(cx, flags, key, val);
        cx.poison_on_err(result)
    }

    fn store(&mut self, cx: &mut Common, flags: u8, key: &[u8], val: &[u8]) -> Result<bool> {
        let (mut stack, exact) = self.layout.seek(cx, self.root, key)?;
        let rec = Record::new(flags, key, val);
        if exact {
            self.layout.update(cx, &mut stack, rec)?;
        } else {
            self.layout.insert(cx, &mut stack, rec)?;
        }
        self.set_root(cx, &stack)?;
        Ok(exact)
    }

    /// Removes `key`. Returns false when it was absent.
    pub fn delete(&mut self, cx: &mut Common, key: &[u8]) -> Result<bool> {
        let result = self.remove(cx, key);
        cx.poison_on_err(result)
    }

    fn remove(&mut self, cx: &mut Common, key: &[u8]) -> Result<bool> {
        let (mut stack, exact) = self.layout.seek(cx, self.root, key)?;
        if !exact {
            return Ok(false);
        }
        self.layout.delete(cx, &mut stack)?;
        self.layout.rebalance(cx, &mut stack)?;
        self.set_root(cx, &stack)?;
        Ok(true)
    }

    /// Entry with the smallest key.
    pub fn first(&self, cx: &Common) -> Result<Option<Entry>> {
        let stack = self.layout.first(cx, self.root)?;
        Ok(self.layout.current(cx, &stack)?.map(|rec| (rec.key, rec.val)))
    }

    /// Entry with the largest key.
    pub fn last(&self, cx: &Common) -> Result<Option<Entry>> {
        let stack = self.layout.last(cx, self.root)?;
        Ok(self.layout.current(cx, &stack)?.map(|rec| (rec.key, rec.val)))
    }

    /// Smallest entry with a key greater than `key`.
    pub fn next(&self, cx: &Common, key: &[u8]) -> Result<Option<Entry>> {
        self.range(cx, Bound::Excluded(key), Bound::Unbounded)?.next()
    }

    /// Largest entry with a key smaller than `key`.
    pub fn prev(&self, cx: &Common, key: &[u8]) -> Result<Option<Entry>> {
        self.range(cx, Bound::Unbounded, Bound::Excluded(key))?
            .rev()
            .next()
    }

    /// Cursor over every entry in key order.
    pub fn cursor<'a>(&'a self, cx: &'a Common) -> Result<Cursor<'a, F>> {
        self.range(cx, Bound::Unbounded, Bound::Unbounded)
    }

    /// Cursor over the entries between `lo` and `hi`.
    pub fn range<'a>(&'a self, cx: &'a Common, lo: Bound<&[u8]>, hi: Bound<&[u8]>) -> Result<Cursor<'a, F>> {
        Cursor::new(self, cx, lo, hi)
    }

    /// Number of entries, found by walking the whole tree.
    pub fn len(&self, cx: &Common) -> Result<usize> {
        self.layout.audit(cx, self.root)
    }

    /// True when the tree has no root.
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Every node of the tree as (offset, bytes).
    pub fn extents(&self, cx: &Common) -> Result<Vec<(Off, u64)>> {
        self.layout.extents(cx, self.root)
    }

    /// Verifies ordering and balance; returns the number of entries.
    pub fn audit(&self, cx: &Common) -> Result<usize> {
        self.layout.audit(cx, self.root)
    }

    /// Frees every node and leaves the tree empty.
    pub fn destroy(&mut self, cx: &mut Common) -> Result<()> {
        let result = self.layout.destroy(cx, self.root);
        cx.poison_on_err(result)?;
        self.root = 0;
        if let Some(name) = &self.name {
            cx.set_root(name, 0)?;
        }
        Ok(())
    }
}

fn owned(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.to_vec()),
        Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Walks a key range in either direction.
pub struct Cursor<'a, F> {
    tree: &'a Tree<F>,
    cx: &'a Common,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    stack: Option<Stack>,
    forward: bool,
    done: bool,
}

impl<'a, F: Format> Cursor<'a, F> {
    fn new(tree: &'a Tree<F>, cx: &'a Common, lo: Bound<&[u8]>, hi: Bound<&[u8]>) -> Result<Self> {
        Ok(Self {
            tree,
            cx,
            lower: owned(lo),
            upper: owned(hi),
            stack: None,
            forward: true,
            done: false,
        })
    }

    /// Walks from the upper end downwards instead. Must be called before the first step.
    pub fn rev(mut self) -> Self {
        self.forward = false;
        self
    }

    fn start(&self) -> Result<Stack> {
        let layout = &self.tree.layout;
        let root = self.tree.root;
        let bound = if self.forward { &self.lower } else { &self.upper };
        match bound {
            Bound::Unbounded if self.forward => layout.first(self.cx, root),
            Bound::Unbounded => layout.last(self.cx, root),
            Bound::Included(key) | Bound::Excluded(key) => {
                let (mut stack, exact) = layout.seek(self.cx, root, key)?;
                if stack.is_empty() {
                    return Ok(stack);
                }
                let skip_exact = exact && matches!(bound, Bound::Excluded(_));
                if self.forward {
                    let past_leaf = layout.current(self.cx, &stack)?.is_none();
                    if skip_exact || past_leaf {
                        layout.step(self.cx, &mut stack, true)?;
                    }
                } else if !exact || skip_exact {
                    // The seek slot holds the first key above the bound.
                    let (off, idx) = stack.leaf().unwrap_or_default();
                    if idx == 0 {
                        layout.step(self.cx, &mut stack, false)?;
                    } else {
                        let level = stack.len() - 1;
                        stack.set(level, off, idx - 1);
                    }
                }
                Ok(stack)
            }
        }
    }

    fn in_range(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => key >= lo.as_slice(),
            Bound::Excluded(lo) => key > lo.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => key <= hi.as_slice(),
            Bound::Excluded(hi) => key < hi.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Returns the next entry, or `None` once the range is exhausted.
    pub fn next(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        match self.advance() {
            Ok(entry) => {
                if entry.is_none() {
                    self.done = true;
                }
                Ok(entry)
            }
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Entry>> {
        let mut stack = match self.stack.take() {
            Some(stack) => stack,
            None => self.start()?,
        };
        let layout = &self.tree.layout;
        let Some(rec) = layout.current(self.cx, &stack)? else {
            return Ok(None);
        };
        if !self.in_range(&rec.key) {
            return Ok(None);
        }
        layout.step(self.cx, &mut stack, self.forward)?;
        self.stack = Some(stack);
        Ok(Some((rec.key, rec.val)))
    }

    /// Drains the cursor into a vector.
    pub fn collect_all(mut self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next()? {
            out.push(entry);
        }
        Ok(out)
    }
}
