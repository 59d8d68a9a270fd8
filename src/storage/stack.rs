//! Root-to-leaf path of (node offset, slot) entries.

use smallvec::SmallVec;

use crate::types::Off;

/// Path from the root (entry 0) to a leaf.
///
/// Each entry packs a page-aligned offset and a slot index into one word; the
/// slot occupies the bits cleared by the page mask, so it must stay below the
/// page size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stack {
    mask: u64,
    items: SmallVec<[u64; 8]>,
}

impl Stack {
    /// Creates an empty path for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            mask: page_size as u64 - 1,
            items: SmallVec::new(),
        }
    }

    fn pack(&self, off: Off, idx: usize) -> u64 {
        debug_assert_eq!(off & self.mask, 0, "unaligned node offset");
        debug_assert!((idx as u64) <= self.mask, "slot exceeds page mask");
        off | idx as u64
    }

    fn unpack(&self, word: u64) -> (Off, usize) {
        (word & !self.mask, (word & self.mask) as usize)
    }

    /// Depth of the path.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True for the path of an empty tree.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops every level.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Appends a deeper level.
    pub fn push(&mut self, off: Off, idx: usize) {
        let word = self.pack(off, idx);
        self.items.push(word);
    }

    /// Inserts a new root above the current one.
    pub fn push_front(&mut self, off: Off, idx: usize) {
        let word = self.pack(off, idx);
        self.items.insert(0, word);
    }

    /// Drops the root level, making its only child the new root.
    pub fn pop_front(&mut self) -> Option<(Off, usize)> {
        if self.items.is_empty() {
            return None;
        }
        let word = self.items.remove(0);
        Some(self.unpack(word))
    }

    /// Offset and slot at `level`.
    pub fn get(&self, level: usize) -> (Off, usize) {
        self.unpack(self.items[level])
    }

    /// Replaces the entry at `level`.
    pub fn set(&mut self, level: usize, off: Off, idx: usize) {
        self.items[level] = self.pack(off, idx);
    }

    /// Offset at `level`.
    pub fn off(&self, level: usize) -> Off {
        self.get(level).0
    }

    /// Slot at `level`.
    pub fn idx(&self, level: usize) -> usize {
        self.get(level).1
    }

    /// Current root, if the path is not empty.
    pub fn root(&self) -> Option<Off> {
        self.items.first().map(|&word| self.unpack(word).0)
    }

    /// Deepest entry.
    pub fn leaf(&self) -> Option<(Off, usize)> {
        self.items.last().map(|&word| self.unpack(word))
    }

    /// Keeps the top `len` levels.
    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }
}
