//! Copy-on-write B+tree storage engine.
//!
//! Trees of variable- or fixed-length records live in page runs handed out
//! by a versioned buddy allocator. Every change copies the nodes it touches
//! unless the current write generation already owns them, so committed roots
//! stay readable as snapshots.

/// Versioned buddy allocator and its deferred free-block edits.
pub mod alloc;

/// Whole-store space accounting.
pub mod check;

/// Shared context: pager, allocator, catalog and write generations.
pub mod common;

/// Node formats and structural tree algorithms.
pub mod layout;

/// Double-slot catalog of settings and named roots.
pub mod meta;

/// Store configuration.
pub mod options;

/// In-memory node image and header codec.
pub mod page;

/// Root-to-leaf paths.
pub mod stack;

/// Tree counters.
pub mod stats;

/// Tree façade and cursors.
pub mod tree;

pub use alloc::{AllocStats, FreeBlock};
pub use check::SpaceReport;
pub use common::Common;
pub use layout::{FixedFormat, Format, KvFormat, Layout, Record};
pub use meta::Meta;
pub use options::Options;
pub use page::Page;
pub use stack::Stack;
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{Cursor, Entry, Tree};
