//! FIFO of pending free-block tree edits.
//!
//! The free-block tree is stored in pages that the allocator itself hands
//! out, so editing it can call back into the allocator. Edits are queued
//! instead and applied by the outermost caller only. A new edit that undoes
//! the edit at the back of the queue for the same key is folded into it.

use std::collections::VecDeque;

use crate::types::Ver;

/// One pending edit, keyed by the packed free-block key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Insert or overwrite. `upsert` is set when the key may already be
    /// present in the tree, which happens after a delete was folded away.
    Put { key: u64, ver: Ver, upsert: bool },
    Del { key: u64 },
}

impl Op {
    pub fn key(&self) -> u64 {
        match *self {
            Op::Put { key, .. } | Op::Del { key } => key,
        }
    }
}

#[derive(Debug, Default)]
pub struct Deferred {
    ops: VecDeque<Op>,
    folded: u64,
}

impl Deferred {
    /// Queues insertion of a key the tree does not hold yet.
    pub fn put(&mut self, key: u64, ver: Ver) {
        self.push(Op::Put {
            key,
            ver,
            upsert: false,
        });
    }

    pub fn del(&mut self, key: u64) {
        self.push(Op::Del { key });
    }

    fn push(&mut self, op: Op) {
        let Some(back) = self.ops.back_mut() else {
            self.ops.push_back(op);
            return;
        };
        if back.key() != op.key() {
            self.ops.push_back(op);
            return;
        }
        match (*back, op) {
            (Op::Put { upsert: false, .. }, Op::Del { .. }) => {
                self.ops.pop_back();
            }
            (Op::Put { upsert: true, .. }, Op::Del { key }) => {
                *back = Op::Del { key };
            }
            (Op::Del { .. }, Op::Put { key, ver, .. }) => {
                *back = Op::Put {
                    key,
                    ver,
                    upsert: true,
                };
            }
            _ => {
                self.ops.push_back(op);
                return;
            }
        }
        self.folded += 1;
    }

    pub fn pop(&mut self) -> Option<Op> {
        self.ops.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Edits removed by folding since creation.
    pub fn folded(&self) -> u64 {
        self.folded
    }
}
