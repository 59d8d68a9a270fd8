//! Whole-store space accounting.
//!
//! Every byte below the allocator's end must belong to exactly one of: the
//! catalog slots, a node of some tree, a node of the free-block tree, or a
//! free block. [`Common::check_space`] verifies that tiling and that the
//! persisted free-block tree matches the in-memory free index.

use tracing::debug;

use crate::storage::common::Common;
use crate::types::{KvError, Off, Result};

/// Byte totals found by a successful space check.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceReport {
    /// End of the managed range.
    pub end: u64,
    /// Both catalog slots.
    pub meta_bytes: u64,
    /// Nodes of the trees passed in.
    pub tree_bytes: u64,
    /// Nodes of the free-block tree.
    pub index_bytes: u64,
    /// Bytes held by free blocks.
    pub free_bytes: u64,
    /// Number of free blocks.
    pub free_blocks: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Owner {
    Meta,
    Tree,
    Index,
    Free,
}

impl Common {
    /// Checks that `extents` (the nodes of every live tree, as returned by
    /// [`crate::storage::tree::Tree::extents`]) together with the catalog,
    /// the free-block tree and the free blocks tile `[0, end)` exactly.
    pub fn check_space(&self, extents: &[(Off, u64)]) -> Result<SpaceReport> {
        if !self.alloc.queue.is_empty() {
            return Err(KvError::Invalid("free-block edits still pending"));
        }
        let index = self
            .alloc
            .tree
            .as_ref()
            .ok_or(KvError::Corruption("free-block tree missing"))?
            .extents(self)?;
        let free = self.free_blocks();
        if self.persisted_free()? != free {
            return Err(KvError::Corruption("free-block tree disagrees with free index"));
        }

        let ps = self.page_size() as u64;
        let mut spans: Vec<(Off, u64, Owner)> = Vec::with_capacity(extents.len() + index.len() + free.len() + 1);
        spans.push((0, self.meta_bytes(), Owner::Meta));
        spans.extend(extents.iter().map(|&(off, len)| (off, len, Owner::Tree)));
        spans.extend(index.iter().map(|&(off, len)| (off, len, Owner::Index)));
        spans.extend(free.iter().map(|blk| (blk.off, ps << blk.class, Owner::Free)));
        spans.sort_unstable();

        let mut report = SpaceReport {
            end: self.end(),
            free_blocks: free.len(),
            ..SpaceReport::default()
        };
        let mut cursor = 0u64;
        for &(off, len, owner) in &spans {
            if off < cursor {
                return Err(KvError::Corruption("space claimed twice"));
            }
            if off > cursor {
                return Err(KvError::Corruption("space owned by nothing"));
            }
            cursor = off + len;
            match owner {
                Owner::Meta => report.meta_bytes += len,
                Owner::Tree => report.tree_bytes += len,
                Owner::Index => report.index_bytes += len,
                Owner::Free => report.free_bytes += len,
            }
        }
        if cursor != self.end() {
            return Err(KvError::Corruption("owned space does not end at the managed end"));
        }
        if self.pager().size() < self.end() {
            return Err(KvError::Corruption("store shorter than the managed range"));
        }
        debug!(
            target: "cowkv::check",
            end = report.end,
            tree = report.tree_bytes,
            index = report.index_bytes,
            free = report.free_bytes,
            "space check passed"
        );
        Ok(report)
    }
}
