//! Node allocators.
//!
//! Both engines create and destroy every node through a [`NodeAllocator`].
//! Nodes are addressed by [`NodeId`], a generational handle, so links
//! between nodes are plain `Copy` values and only the allocator owns node
//! storage. A stale id (its node was released) never resolves to a newer
//! node that happens to reuse the same slot.

use core::cell::Cell;
use core::fmt;
use std::rc::Rc;

use slotmap::{DefaultKey, SlotMap};

/// Handle to a node stored in a [`NodeAllocator`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(DefaultKey);

impl NodeId {
    pub(crate) fn new(k: DefaultKey) -> Self {
        NodeId(k)
    }
    pub(crate) fn raw(&self) -> DefaultKey {
        self.0
    }
}

/// Reasons an allocator can refuse a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A [`Bounded`] allocator is already holding `limit` live nodes.
    LimitReached { limit: usize },
    /// The underlying storage cannot address another slot.
    Exhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::LimitReached { limit } => {
                write!(f, "allocator reached its limit of {limit} live nodes")
            }
            AllocError::Exhausted => f.write_str("allocator storage exhausted"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Storage for engine nodes.
///
/// `allocate` either stores the node and returns its id or leaves the
/// allocator unchanged and returns an error (the node is dropped).
/// `deallocate` hands the node back to the caller so its value can be
/// returned or dropped outside the allocator.
pub trait NodeAllocator<N> {
    fn allocate(&mut self, node: N) -> Result<NodeId, AllocError>;

    fn deallocate(&mut self, id: NodeId) -> Option<N>;

    fn get(&self, id: NodeId) -> Option<&N>;

    fn get_mut(&mut self, id: NodeId) -> Option<&mut N>;

    /// Number of live nodes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access a node the caller knows to be live.
    ///
    /// Panics if `id` is stale or belongs to another allocator; engines only
    /// call this on ids reachable from their own structure.
    #[inline]
    fn node(&self, id: NodeId) -> &N {
        match self.get(id) {
            Some(n) => n,
            None => panic!("node {id:?} is not live in this allocator"),
        }
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut N {
        match self.get_mut(id) {
            Some(n) => n,
            None => panic!("node {id:?} is not live in this allocator"),
        }
    }
}

/// Default allocator: a `SlotMap` arena with generational keys.
pub struct SlotAllocator<N> {
    slots: SlotMap<DefaultKey, N>,
}

impl<N> SlotAllocator<N> {
    // SlotMap stores slot indices as u32 and reserves one value.
    const MAX_SLOTS: usize = (u32::MAX - 1) as usize;

    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
        }
    }
}

impl<N> Default for SlotAllocator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> fmt::Debug for SlotAllocator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("live", &self.slots.len())
            .finish()
    }
}

impl<N> NodeAllocator<N> for SlotAllocator<N> {
    fn allocate(&mut self, node: N) -> Result<NodeId, AllocError> {
        if self.slots.len() >= Self::MAX_SLOTS {
            return Err(AllocError::Exhausted);
        }
        Ok(NodeId::new(self.slots.insert(node)))
    }

    fn deallocate(&mut self, id: NodeId) -> Option<N> {
        self.slots.remove(id.raw())
    }

    #[inline]
    fn get(&self, id: NodeId) -> Option<&N> {
        self.slots.get(id.raw())
    }

    #[inline]
    fn get_mut(&mut self, id: NodeId) -> Option<&mut N> {
        self.slots.get_mut(id.raw())
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Shared view of the counters kept by a [`Counting`] allocator.
///
/// Cloning the handle shares the counters, so they stay readable after the
/// engine owning the allocator has been dropped.
#[derive(Clone, Debug, Default)]
pub struct AllocStats {
    inner: Rc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: Cell<usize>,
    deallocations: Cell<usize>,
    failures: Cell<usize>,
    peak: Cell<usize>,
}

impl AllocStats {
    pub fn allocations(&self) -> usize {
        self.inner.allocations.get()
    }
    pub fn deallocations(&self) -> usize {
        self.inner.deallocations.get()
    }
    /// Allocation attempts refused by the wrapped allocator.
    pub fn failures(&self) -> usize {
        self.inner.failures.get()
    }
    pub fn live(&self) -> usize {
        self.allocations() - self.deallocations()
    }
    pub fn peak(&self) -> usize {
        self.inner.peak.get()
    }
}

/// Forwards to `A` and records every allocation and release.
#[derive(Debug)]
pub struct Counting<A> {
    inner: A,
    stats: AllocStats,
}

impl<A> Counting<A> {
    pub fn new(inner: A) -> (Self, AllocStats) {
        let stats = AllocStats::default();
        (
            Self {
                inner,
                stats: stats.clone(),
            },
            stats,
        )
    }

    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }
}

impl<N, A: NodeAllocator<N>> NodeAllocator<N> for Counting<A> {
    fn allocate(&mut self, node: N) -> Result<NodeId, AllocError> {
        let c = &self.stats.inner;
        match self.inner.allocate(node) {
            Ok(id) => {
                c.allocations.set(c.allocations.get() + 1);
                let live = c.allocations.get() - c.deallocations.get();
                if live > c.peak.get() {
                    c.peak.set(live);
                }
                Ok(id)
            }
            Err(e) => {
                c.failures.set(c.failures.get() + 1);
                Err(e)
            }
        }
    }

    fn deallocate(&mut self, id: NodeId) -> Option<N> {
        let node = self.inner.deallocate(id)?;
        let c = &self.stats.inner;
        c.deallocations.set(c.deallocations.get() + 1);
        Some(node)
    }

    #[inline]
    fn get(&self, id: NodeId) -> Option<&N> {
        self.inner.get(id)
    }

    #[inline]
    fn get_mut(&mut self, id: NodeId) -> Option<&mut N> {
        self.inner.get_mut(id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Refuses allocations once `limit` nodes are live.
#[derive(Debug)]
pub struct Bounded<A> {
    inner: A,
    limit: usize,
}

impl<A> Bounded<A> {
    pub fn new(inner: A, limit: usize) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }
}

impl<N, A: NodeAllocator<N>> NodeAllocator<N> for Bounded<A> {
    fn allocate(&mut self, node: N) -> Result<NodeId, AllocError> {
        if self.inner.len() >= self.limit {
            return Err(AllocError::LimitReached { limit: self.limit });
        }
        self.inner.allocate(node)
    }

    fn deallocate(&mut self, id: NodeId) -> Option<N> {
        self.inner.deallocate(id)
    }

    #[inline]
    fn get(&self, id: NodeId) -> Option<&N> {
        self.inner.get(id)
    }

    #[inline]
    fn get_mut(&mut self, id: NodeId) -> Option<&mut N> {
        self.inner.get_mut(id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
