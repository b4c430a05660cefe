use crate::sync::UnsafeCell;
use derive_more::{Deref, DerefMut, Display};
use rustc_hash::FxBuildHasher;
use std::collections::HashSet as _HashSet;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send`.
///
/// Used internally by the queue slots and graph nodes to enable interior
/// mutability across threads while correctness is ensured by the surrounding
/// protocol: a slot's sequence number or a node's scheduling state grants
/// exclusive access to exactly one thread at a time.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// Stable identifier of a node inside a [`TaskGraph`](crate::graph::TaskGraph).
///
/// This is an index into the graph's node arena. It is meaningful only for
/// the graph (and the node set) that produced it.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("N{_0}")]
#[repr(transparent)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Position of the node in the graph's arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) type HashSet<T> = _HashSet<T, FxBuildHasher>;
pub(crate) type IndexSet<T> = indexmap::IndexSet<T, FxBuildHasher>;
