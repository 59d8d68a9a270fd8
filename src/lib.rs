//! Embedded copy-on-write B+tree key-value engine.
//!
//! A store is a single file (or memory buffer) holding a double-slot
//! catalog followed by tree nodes and free space. Writers work in numbered
//! generations: [`Common::begin`] starts one, tree edits copy every node an
//! older generation wrote, and [`Common::commit`] publishes the new roots.
//! Readers holding an older root keep a consistent snapshot for as long as
//! its generation is kept.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cowkv::{Common, FileStore, KvFormat, Options, Tree};
//!
//! # fn main() -> cowkv::Result<()> {
//! let store = Arc::new(FileStore::open("data.cow")?);
//! let mut cx = Common::create(store, Options::default())?;
//! cx.begin(0)?;
//! let mut users = Tree::open(&cx, b"users", KvFormat)?;
//! users.put(&mut cx, b"alice", b"admin")?;
//! cx.commit()?;
//! assert_eq!(users.get(&cx, b"alice")?.as_deref(), Some(&b"admin"[..]));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::io::{FileStore, MemStore, Store};
pub use storage::{
    Common, Cursor, FixedFormat, KvFormat, Options, SpaceReport, Tree, TreeStatsSnapshot,
};
pub use types::{KvError, Off, Result, Ver};
