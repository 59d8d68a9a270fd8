use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tracing::info;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStatsSnapshot {
    /// Root-to-leaf descents
    pub seeks: u64,
    /// Records written into a node without restructuring it
    pub in_place: u64,
    /// Leaf splits
    pub leaf_splits: u64,
    /// Internal node splits
    pub internal_splits: u64,
    /// Splits that added a level on top of the tree
    pub root_splits: u64,
    /// Sibling pairs merged into one node
    pub merges: u64,
    /// Sibling pairs whose records were redistributed
    pub redistributions: u64,
    /// Nodes copied because an older generation wrote them
    pub copies: u64,
    /// Nodes moved to a run of a different size
    pub resizes: u64,
    /// Root levels removed because the root had a single child
    pub root_collapses: u64,
}

/// Thread-safe counters for tree operations.
#[derive(Default)]
pub struct TreeStats {
    seeks: AtomicU64,
    in_place: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    root_splits: AtomicU64,
    merges: AtomicU64,
    redistributions: AtomicU64,
    copies: AtomicU64,
    resizes: AtomicU64,
    root_collapses: AtomicU64,
}

impl TreeStats {
    pub(crate) fn inc_seeks(&self) {
        self.seeks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_in_place(&self) {
        self.in_place.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_redistributions(&self) {
        self.redistributions
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_copies(&self) {
        self.copies.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_resizes(&self) {
        self.resizes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            seeks: self.seeks.load(AtomicOrdering::Relaxed),
            in_place: self.in_place.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            internal_splits: self.internal_splits.load(AtomicOrdering::Relaxed),
            root_splits: self.root_splits.load(AtomicOrdering::Relaxed),
            merges: self.merges.load(AtomicOrdering::Relaxed),
            redistributions: self.redistributions.load(AtomicOrdering::Relaxed),
            copies: self.copies.load(AtomicOrdering::Relaxed),
            resizes: self.resizes.load(AtomicOrdering::Relaxed),
            root_collapses: self.root_collapses.load(AtomicOrdering::Relaxed),
        }
    }

    /// Logs the current counters under the `cowkv::stats` target.
    pub fn emit_tracing(&self, tree: &str) {
        let snap = self.snapshot();
        info!(
            target: "cowkv::stats",
            tree,
            seeks = snap.seeks,
            in_place = snap.in_place,
            leaf_splits = snap.leaf_splits,
            internal_splits = snap.internal_splits,
            root_splits = snap.root_splits,
            merges = snap.merges,
            redistributions = snap.redistributions,
            copies = snap.copies,
            resizes = snap.resizes,
            root_collapses = snap.root_collapses,
            "tree stats"
        );
    }
}
