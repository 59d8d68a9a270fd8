//! Low-level primitives under the storage engine.

/// Backing stores: files and memory.
pub mod io;

/// Leased byte-range views over a store.
pub mod pager;
