//! ChainTable: separate-chaining hash engine with prime bucket counts.
//!
//! Layout
//! - `buckets[i]` is the head of a singly linked chain of `ChainNode`s;
//!   a node sits in bucket `hash % bucket_count`, using the hash cached in
//!   the node at insertion time.
//! - `bucket_count` is 0 until the first insertion, then always a value
//!   from the prime table.
//! - Equivalent elements inserted with `emplace_multi` form one contiguous
//!   run, in insertion order.
//!
//! Rehash
//! - Allocates the new bucket array (and its scratch tail array) first.
//!   Once both exist, nodes are moved by relinking only: values are not
//!   touched and `Hash` is not called, so nothing after the allocation can
//!   fail.
//! - Rehash is the only operation that moves nodes between buckets. A
//!   `ChainPos` taken before it still names the same element but may carry
//!   an outdated bucket index; `erase` and `next` re-derive the bucket from
//!   the cached hash.

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::iter::FusedIterator;
use core::marker::PhantomData;

use hashbrown::hash_map::DefaultHashBuilder;
use tracing::{debug, trace};

use crate::alloc::{NodeAllocator, NodeId, SlotAllocator};
use crate::error::Error;
use crate::node::ChainNode;
use crate::primes;
use crate::reentrancy::DebugReentrancy;

/// Construction-time tuning for a [`ChainTable`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TableConfig {
    /// Upper bound on `len / bucket_count`, restored after every insertion.
    pub max_load_factor: f32,
    /// Buckets to allocate up front (rounded up to a tabulated prime); 0
    /// defers allocation to the first insertion.
    pub initial_bucket_count: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_load_factor: 1.0,
            initial_bucket_count: 0,
        }
    }
}

/// Position of an element: its node and the bucket it was found in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChainPos {
    bucket: usize,
    node: NodeId,
}

impl ChainPos {
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

pub struct ChainTable<T, S = DefaultHashBuilder, A = SlotAllocator<ChainNode<T>>>
where
    A: NodeAllocator<ChainNode<T>>,
{
    buckets: Vec<Option<NodeId>>,
    len: usize,
    max_load_factor: f32,
    hasher: S,
    alloc: A,
    reentrancy: DebugReentrancy,
    _marker: PhantomData<T>,
}

impl<T> ChainTable<T> {
    pub fn new() -> Self {
        Self::with_hasher_and_allocator(DefaultHashBuilder::default(), SlotAllocator::new())
    }
}

impl<T> Default for ChainTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> ChainTable<T, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_hasher_and_allocator(hasher, SlotAllocator::new())
    }
}

impl<T, S, A> ChainTable<T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    pub fn with_hasher_and_allocator(hasher: S, alloc: A) -> Self {
        Self {
            buckets: Vec::new(),
            len: 0,
            max_load_factor: TableConfig::default().max_load_factor,
            hasher,
            alloc,
            reentrancy: DebugReentrancy::new(),
            _marker: PhantomData,
        }
    }

    pub fn with_config(config: TableConfig, hasher: S, alloc: A) -> Result<Self, Error> {
        let mut t = Self::with_hasher_and_allocator(hasher, alloc);
        t.set_max_load_factor(config.max_load_factor)?;
        if config.initial_bucket_count > 0 {
            t.rehash(config.initial_bucket_count)?;
        }
        Ok(t)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of elements chained in bucket `n`; 0 if out of range.
    pub fn bucket_size(&self, n: usize) -> usize {
        self.bucket_iter(n).count()
    }

    pub fn load_factor(&self) -> f32 {
        if self.buckets.is_empty() {
            0.0
        } else {
            self.len as f32 / self.buckets.len() as f32
        }
    }

    pub fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    /// Change the load bound. Rehashes right away if the current contents
    /// no longer fit.
    pub fn set_max_load_factor(&mut self, f: f32) -> Result<(), Error> {
        if !(f.is_finite() && f > 0.0) {
            return Err(Error::InvalidLoadFactor);
        }
        let previous = core::mem::replace(&mut self.max_load_factor, f);
        if !self.buckets.is_empty() && !self.fits(self.len, self.buckets.len()) {
            if let Err(e) = self.rehash(0) {
                self.max_load_factor = previous;
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    pub fn get(&self, pos: ChainPos) -> Option<&T> {
        self.alloc.get(pos.node).map(|n| &n.value)
    }

    /// First element in bucket order.
    pub fn first(&self) -> Option<ChainPos> {
        self.first_from(0)
    }

    /// Element after `pos` in bucket order: the rest of its chain, then the
    /// following buckets.
    pub fn next(&self, pos: ChainPos) -> Option<ChainPos> {
        let n = self.alloc.get(pos.node)?;
        let bucket = self.bucket_index(n.hash);
        match n.next {
            Some(node) => Some(ChainPos { bucket, node }),
            None => self.first_from(bucket + 1),
        }
    }

    pub fn iter(&self) -> Iter<'_, T, S, A> {
        Iter {
            table: self,
            bucket: 0,
            cur: self.buckets.first().copied().flatten(),
            remaining: self.len,
        }
    }

    /// Walk the chain of bucket `n` only.
    pub fn bucket_iter(&self, n: usize) -> LocalIter<'_, T, S, A> {
        LocalIter {
            table: self,
            cur: self.buckets.get(n).copied().flatten(),
        }
    }

    /// Rebuild the bucket array with
    /// `next_prime(max(count, ceil(len / max_load_factor)))` buckets.
    ///
    /// Invalidates the bucket index of every outstanding position. On
    /// failure the table is exactly as before.
    pub fn rehash(&mut self, count: usize) -> Result<(), Error> {
        let target = count.max(self.min_buckets_for(self.len));
        let new_count = primes::next_prime(target).ok_or(Error::CapacityOverflow)?;
        if new_count == self.buckets.len() {
            return Ok(());
        }
        self.rehash_to(new_count)
    }

    /// Make room for `n` elements without further rehashing. Never shrinks.
    pub fn reserve(&mut self, n: usize) -> Result<(), Error> {
        let needed = self.min_buckets_for(n);
        if needed <= self.buckets.len() {
            return Ok(());
        }
        self.rehash(needed)
    }

    /// Remove the element at `pos`. Returns `None` if it is already gone.
    pub fn erase(&mut self, pos: ChainPos) -> Option<T> {
        let hash = self.alloc.get(pos.node)?.hash;
        let bucket = self.bucket_index(hash);
        Some(self.unlink(bucket, pos.node))
    }

    /// Remove `[first, last)` in bucket order, where `None` runs to the end,
    /// and return `last`. Stops early at an already erased position.
    pub fn erase_range(&mut self, first: ChainPos, last: Option<ChainPos>) -> Option<ChainPos> {
        let stop = last.map(|p| p.node);
        let mut cur = Some(first);
        while let Some(pos) = cur {
            if Some(pos.node) == stop {
                break;
            }
            let next = self.next(pos);
            if self.erase(pos).is_none() {
                break;
            }
            cur = next;
        }
        last
    }

    /// Drop every element; the bucket array is kept.
    pub fn clear(&mut self) {
        for b in 0..self.buckets.len() {
            let mut cur = self.buckets[b].take();
            while let Some(id) = cur {
                cur = self.alloc.deallocate(id).and_then(|n| n.next);
            }
        }
        self.len = 0;
    }

    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(self, other);
    }

    #[inline]
    fn n(&self, id: NodeId) -> &ChainNode<T> {
        self.alloc.node(id)
    }

    #[inline]
    fn n_mut(&mut self, id: NodeId) -> &mut ChainNode<T> {
        self.alloc.node_mut(id)
    }

    /// Callers guarantee the bucket array is allocated.
    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    fn fits(&self, len: usize, buckets: usize) -> bool {
        len as f64 <= f64::from(self.max_load_factor) * buckets as f64
    }

    fn min_buckets_for(&self, len: usize) -> usize {
        (len as f64 / f64::from(self.max_load_factor)).ceil() as usize
    }

    fn first_from(&self, start: usize) -> Option<ChainPos> {
        self.buckets
            .iter()
            .enumerate()
            .skip(start)
            .find_map(|(bucket, head)| head.map(|node| ChainPos { bucket, node }))
    }

    /// Ensure `len` elements fit under the load bound, growing to at least
    /// twice the current bucket count when they do not.
    fn grow_for(&mut self, len: usize) -> Result<(), Error> {
        let count = self.buckets.len();
        if count != 0 && self.fits(len, count) {
            return Ok(());
        }
        let target = count.saturating_mul(2).max(self.min_buckets_for(len));
        let new_count = primes::next_prime(target).ok_or(Error::CapacityOverflow)?;
        self.rehash_to(new_count)
    }

    fn rehash_to(&mut self, new_count: usize) -> Result<(), Error> {
        let mut fresh: Vec<Option<NodeId>> = Vec::new();
        fresh.try_reserve_exact(new_count)?;
        fresh.resize(new_count, None);
        let mut tails: Vec<Option<NodeId>> = Vec::new();
        tails.try_reserve_exact(new_count)?;
        tails.resize(new_count, None);

        trace!(
            from = self.buckets.len(),
            to = new_count,
            len = self.len,
            "chain table rehash"
        );
        let old = core::mem::replace(&mut self.buckets, fresh);
        for head in old {
            let mut cur = head;
            while let Some(id) = cur {
                let (next, hash) = {
                    let n = self.n(id);
                    (n.next, n.hash)
                };
                let b = (hash % new_count as u64) as usize;
                self.n_mut(id).next = None;
                match tails[b] {
                    Some(t) => self.n_mut(t).next = Some(id),
                    None => self.buckets[b] = Some(id),
                }
                tails[b] = Some(id);
                cur = next;
            }
        }
        Ok(())
    }

    /// Put an allocated node into `bucket`, after `after` or at the head.
    fn link(&mut self, id: NodeId, hash: u64, after: Option<NodeId>) -> ChainPos {
        let bucket = self.bucket_index(hash);
        match after {
            Some(prev) => {
                let next = self.n(prev).next;
                self.n_mut(id).next = next;
                self.n_mut(prev).next = Some(id);
            }
            None => {
                self.n_mut(id).next = self.buckets[bucket];
                self.buckets[bucket] = Some(id);
            }
        }
        self.len += 1;
        ChainPos { bucket, node: id }
    }

    fn unlink(&mut self, bucket: usize, id: NodeId) -> T {
        let next = self.n(id).next;
        if self.buckets[bucket] == Some(id) {
            self.buckets[bucket] = next;
        } else {
            let mut cur = self.buckets[bucket];
            while let Some(c) = cur {
                let after = self.n(c).next;
                if after == Some(id) {
                    self.n_mut(c).next = next;
                    break;
                }
                cur = after;
            }
        }
        let node = self
            .alloc
            .deallocate(id)
            .expect("unlinked node must be live in its allocator");
        self.len -= 1;
        node.into_value()
    }

    /// Allocate a node and make sure one more element fits. On failure
    /// nothing has been linked and the node is released again.
    fn prepare_node(&mut self, value: T, hash: u64) -> Result<NodeId, Error> {
        let id = self
            .alloc
            .allocate(ChainNode::new(value, hash))
            .map_err(|e| {
                debug!(len = self.len, error = %e, "chain node allocation refused");
                Error::from(e)
            })?;
        if let Err(e) = self.grow_for(self.len + 1) {
            debug!(error = %e, "rehash before insert failed");
            drop(self.alloc.deallocate(id));
            return Err(e);
        }
        Ok(id)
    }

    /// Check every structural invariant; used by the tests.
    #[cfg(test)]
    pub(crate) fn validate(&self) -> Result<(), String> {
        let count = self.buckets.len();
        if count != 0 && !primes::is_tabulated(count) {
            return Err(format!("bucket count {count} is not a tabulated prime"));
        }
        let mut seen = 0usize;
        for (b, head) in self.buckets.iter().enumerate() {
            let mut cur = *head;
            while let Some(id) = cur {
                let n = self.n(id);
                if (n.hash % count as u64) as usize != b {
                    return Err(format!("node {id:?} with hash {} in bucket {b}", n.hash));
                }
                seen += 1;
                if seen > self.len {
                    return Err("more chained nodes than len".into());
                }
                cur = n.next;
            }
        }
        if seen != self.len || self.alloc.len() != self.len {
            return Err(format!(
                "len {} but {} chained and {} allocated",
                self.len,
                seen,
                self.alloc.len()
            ));
        }
        if count != 0 && !self.fits(self.len, count) {
            return Err(format!("load factor {} over bound", self.load_factor()));
        }
        Ok(())
    }
}

impl<T, S, A> ChainTable<T, S, A>
where
    S: BuildHasher,
    A: NodeAllocator<ChainNode<T>>,
{
    fn make_hash<Q: ?Sized + Hash>(&self, q: &Q) -> u64 {
        self.hasher.hash_one(q)
    }

    /// Bucket that `key` maps to under the current bucket count (0 when no
    /// buckets are allocated yet).
    pub fn bucket<Q>(&self, key: &Q) -> usize
    where
        Q: ?Sized + Hash,
    {
        let _g = self.reentrancy.enter();
        if self.buckets.is_empty() {
            return 0;
        }
        self.bucket_index(self.make_hash(key))
    }

    pub fn find<Q>(&self, key: &Q) -> Option<ChainPos>
    where
        T: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        self.find_inner(self.make_hash(key), key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        self.find_inner(self.make_hash(key), key).is_some()
    }

    pub fn count_unique<Q>(&self, key: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        usize::from(self.find_inner(self.make_hash(key), key).is_some())
    }

    pub fn count_multi<Q>(&self, key: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(key);
        self.run_inner(hash, key).map_or(0, |(_, n)| n)
    }

    /// The contiguous run of elements equivalent to `key`.
    pub fn equal_range<Q>(&self, key: &Q) -> core::iter::Take<LocalIter<'_, T, S, A>>
    where
        T: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(key);
        match self.run_inner(hash, key) {
            Some((first, n)) => LocalIter {
                table: self,
                cur: Some(first),
            }
            .take(n),
            None => LocalIter {
                table: self,
                cur: None,
            }
            .take(0),
        }
    }

    pub fn erase_unique<Q>(&mut self, key: &Q) -> Option<T>
    where
        T: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let pos = self.find_inner(self.make_hash(key), key)?;
        Some(self.unlink(pos.bucket, pos.node))
    }

    /// Remove every element equivalent to `key`; returns how many.
    pub fn erase_multi<Q>(&mut self, key: &Q) -> usize
    where
        T: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(key);
        let Some((first, n)) = self.run_inner(hash, key) else {
            return 0;
        };
        let bucket = self.bucket_index(hash);
        let mut cur = Some(first);
        for _ in 0..n {
            let Some(id) = cur else { break };
            cur = self.n(id).next;
            drop(self.unlink(bucket, id));
        }
        n
    }

    fn find_inner<Q>(&self, hash: u64, key: &Q) -> Option<ChainPos>
    where
        T: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = self.bucket_index(hash);
        let mut cur = self.buckets[bucket];
        while let Some(id) = cur {
            let n = self.n(id);
            if n.hash == hash && n.value.borrow() == key {
                return Some(ChainPos { bucket, node: id });
            }
            cur = n.next;
        }
        None
    }

    /// First node of the run equivalent to `key` and the run length.
    fn run_inner<Q>(&self, hash: u64, key: &Q) -> Option<(NodeId, usize)>
    where
        T: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let first = self.find_inner(hash, key)?.node;
        let mut n = 1;
        let mut cur = self.n(first).next;
        while let Some(id) = cur {
            let node = self.n(id);
            if !(node.hash == hash && node.value.borrow() == key) {
                break;
            }
            n += 1;
            cur = node.next;
        }
        Some((first, n))
    }
}

impl<T: Hash + Eq> ChainTable<T> {
    /// Build a table from `items`, keeping the first of any equal elements.
    pub fn try_from_unique<I: IntoIterator<Item = T>>(items: I) -> Result<Self, Error> {
        Self::try_from_unique_in(items, DefaultHashBuilder::default(), SlotAllocator::new())
    }

    pub fn try_from_multi<I: IntoIterator<Item = T>>(items: I) -> Result<Self, Error> {
        Self::try_from_multi_in(items, DefaultHashBuilder::default(), SlotAllocator::new())
    }
}

impl<T, S, A> ChainTable<T, S, A>
where
    T: Hash + Eq,
    S: BuildHasher,
    A: NodeAllocator<ChainNode<T>>,
{
    pub fn try_from_unique_in<I>(items: I, hasher: S, alloc: A) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
    {
        let mut t = Self::with_hasher_and_allocator(hasher, alloc);
        t.range_insert_unique(items)?;
        Ok(t)
    }

    pub fn try_from_multi_in<I>(items: I, hasher: S, alloc: A) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
    {
        let mut t = Self::with_hasher_and_allocator(hasher, alloc);
        t.range_insert_multi(items)?;
        Ok(t)
    }

    /// Insert `value` unless an equal element exists. Returns the position
    /// of the element now present and whether `value` was inserted; on a
    /// hit `value` is dropped. May rehash, which keeps every element but
    /// invalidates the bucket index carried by older positions.
    pub fn emplace_unique(&mut self, value: T) -> Result<(ChainPos, bool), Error> {
        let _g = self.reentrancy.enter();
        self.insert_unique(value)
    }

    /// Insert `value` at the end of its run of equal elements, or at the
    /// head of its chain if there is none.
    pub fn emplace_multi(&mut self, value: T) -> Result<ChainPos, Error> {
        let _g = self.reentrancy.enter();
        self.insert_multi(value)
    }

    /// Like [`ChainTable::emplace_unique`], but if `hint` holds an element
    /// equal to `value` that element is returned without scanning the chain.
    pub fn emplace_unique_hint(
        &mut self,
        hint: Option<ChainPos>,
        value: T,
    ) -> Result<(ChainPos, bool), Error> {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(&value);
        if let Some(pos) = self.hint_matches(hint, hash, &value) {
            return Ok((pos, false));
        }
        self.insert_unique_hashed(value, hash)
    }

    /// Like [`ChainTable::emplace_multi`], but if `hint` holds an element
    /// equal to `value` the new element goes directly after it.
    pub fn emplace_multi_hint(
        &mut self,
        hint: Option<ChainPos>,
        value: T,
    ) -> Result<ChainPos, Error> {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(&value);
        match self.hint_matches(hint, hash, &value) {
            Some(pos) => {
                let id = self.prepare_node(value, hash)?;
                Ok(self.link(id, hash, Some(pos.node)))
            }
            None => self.insert_multi_hashed(value, hash),
        }
    }

    /// Insert every item that has no equal element yet; returns how many
    /// were inserted. Buckets for all items are reserved up front. If an
    /// insertion fails, the items this call inserted are removed again and
    /// the error is returned; the reserved buckets stay.
    pub fn range_insert_unique<I: IntoIterator<Item = T>>(
        &mut self,
        items: I,
    ) -> Result<usize, Error> {
        let _g = self.reentrancy.enter();
        self.range_insert(items, true)
    }

    pub fn range_insert_multi<I: IntoIterator<Item = T>>(
        &mut self,
        items: I,
    ) -> Result<usize, Error> {
        let _g = self.reentrancy.enter();
        self.range_insert(items, false)
    }

    fn insert_unique(&mut self, value: T) -> Result<(ChainPos, bool), Error> {
        let hash = self.make_hash(&value);
        self.insert_unique_hashed(value, hash)
    }

    fn insert_unique_hashed(&mut self, value: T, hash: u64) -> Result<(ChainPos, bool), Error> {
        if let Some(pos) = self.find_inner(hash, &value) {
            return Ok((pos, false));
        }
        let id = self.prepare_node(value, hash)?;
        Ok((self.link(id, hash, None), true))
    }

    fn insert_multi(&mut self, value: T) -> Result<ChainPos, Error> {
        let hash = self.make_hash(&value);
        self.insert_multi_hashed(value, hash)
    }

    fn insert_multi_hashed(&mut self, value: T, hash: u64) -> Result<ChainPos, Error> {
        let run_tail = self.run_inner(hash, &value).map(|(first, n)| {
            let mut last = first;
            for _ in 1..n {
                match self.n(last).next {
                    Some(next) => last = next,
                    None => break,
                }
            }
            last
        });
        // A rehash in prepare_node keeps the run contiguous and ordered, so
        // `run_tail` is still its last element afterwards.
        let id = self.prepare_node(value, hash)?;
        Ok(self.link(id, hash, run_tail))
    }

    fn hint_matches(&self, hint: Option<ChainPos>, hash: u64, value: &T) -> Option<ChainPos> {
        let node = hint?.node;
        let n = self.alloc.get(node)?;
        if n.hash != hash || n.value != *value {
            return None;
        }
        Some(ChainPos {
            bucket: self.bucket_index(hash),
            node,
        })
    }

    fn range_insert<I: IntoIterator<Item = T>>(
        &mut self,
        items: I,
        unique: bool,
    ) -> Result<usize, Error> {
        let items: Vec<T> = items.into_iter().collect();
        trace!(count = items.len(), unique, "table range insert");
        self.reserve(self.len.saturating_add(items.len()))?;

        let mut inserted: Vec<ChainPos> = Vec::new();
        inserted.try_reserve_exact(items.len())?;
        for value in items {
            let step = if unique {
                self.insert_unique(value)
            } else {
                self.insert_multi(value).map(|pos| (pos, true))
            };
            match step {
                Ok((pos, true)) => inserted.push(pos),
                Ok((_, false)) => {}
                Err(e) => {
                    debug!(rolled_back = inserted.len(), "table range insert failed");
                    for pos in inserted.into_iter().rev() {
                        drop(self.erase(pos));
                    }
                    return Err(e);
                }
            }
        }
        Ok(inserted.len())
    }
}

impl<T, S, A> Drop for ChainTable<T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: fmt::Debug, S, A> fmt::Debug for ChainTable<T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Iterator over every element in bucket order.
pub struct Iter<'a, T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    table: &'a ChainTable<T, S, A>,
    bucket: usize,
    cur: Option<NodeId>,
    remaining: usize,
}

impl<'a, T, S, A> Iterator for Iter<'a, T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let table = self.table;
        loop {
            if let Some(id) = self.cur {
                let n = table.n(id);
                self.cur = n.next;
                self.remaining -= 1;
                return Some(&n.value);
            }
            if self.remaining == 0 {
                return None;
            }
            self.bucket += 1;
            self.cur = *table.buckets.get(self.bucket)?;
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T, S, A> ExactSizeIterator for Iter<'a, T, S, A> where A: NodeAllocator<ChainNode<T>> {}

impl<'a, T, S, A> FusedIterator for Iter<'a, T, S, A> where A: NodeAllocator<ChainNode<T>> {}

/// Iterator over a single bucket's chain.
pub struct LocalIter<'a, T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    table: &'a ChainTable<T, S, A>,
    cur: Option<NodeId>,
}

impl<'a, T, S, A> Iterator for LocalIter<'a, T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let table = self.table;
        let n = table.n(self.cur?);
        self.cur = n.next;
        Some(&n.value)
    }
}

impl<'a, T, S, A> FusedIterator for LocalIter<'a, T, S, A> where A: NodeAllocator<ChainNode<T>> {}

impl<'a, T, S, A> IntoIterator for &'a ChainTable<T, S, A>
where
    A: NodeAllocator<ChainNode<T>>,
{
    type Item = &'a T;
    type IntoIter = Iter<'a, T, S, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AllocError, Bounded, Counting};
    use std::collections::BTreeSet;
    use std::hash::Hasher;

    #[derive(Clone, Default)]
    struct ConstBuildHasher;
    struct ConstHasher;
    impl BuildHasher for ConstBuildHasher {
        type Hasher = ConstHasher;
        fn build_hasher(&self) -> Self::Hasher {
            ConstHasher
        }
    }
    impl Hasher for ConstHasher {
        fn write(&mut self, _bytes: &[u8]) {}
        fn finish(&self) -> u64 {
            0
        } // every key lands in bucket 0
    }

    /// Invariant: duplicates are rejected and the table is unchanged.
    #[test]
    fn duplicate_insert_rejected() {
        let mut t: ChainTable<String> = ChainTable::new();
        let (pos, fresh) = t.emplace_unique("dup".to_string()).unwrap();
        assert!(fresh);
        let (again, fresh) = t.emplace_unique("dup".to_string()).unwrap();
        assert!(!fresh);
        assert_eq!(pos, again);
        assert_eq!(t.len(), 1);
        t.validate().unwrap();
    }

    /// Invariant: `find(k).is_some() == contains(k)`; borrowed lookups work.
    #[test]
    fn find_contains_parity_with_borrowed_keys() {
        let mut t: ChainTable<String> = ChainTable::new();
        for k in ["a", "b", "c"] {
            t.emplace_unique(k.to_string()).unwrap();
        }
        for k in ["a", "b", "c"] {
            assert!(t.find(k).is_some());
            assert!(t.contains(k));
            assert_eq!(t.count_unique(k), 1);
        }
        for k in ["x", "y"] {
            assert!(t.find(k).is_none());
            assert!(!t.contains(k));
        }
    }

    #[test]
    fn empty_table_has_no_buckets() {
        let t: ChainTable<u32> = ChainTable::new();
        assert_eq!(t.bucket_count(), 0);
        assert_eq!(t.load_factor(), 0.0);
        assert!(t.find(&1).is_none());
        assert_eq!(t.bucket(&1), 0);
        assert_eq!(t.bucket_size(0), 0);
        assert!(t.first().is_none());
        assert_eq!(t.iter().count(), 0);
    }

    /// First insertion allocates the smallest prime; growth keeps primes.
    #[test]
    fn growth_follows_prime_table() {
        let mut t = ChainTable::new();
        t.emplace_unique(0u32).unwrap();
        assert_eq!(t.bucket_count(), 5);
        let mut seen = vec![5];
        for v in 1..200u32 {
            t.emplace_unique(v).unwrap();
            if *seen.last().unwrap() != t.bucket_count() {
                seen.push(t.bucket_count());
            }
            assert!(t.load_factor() <= 1.0);
        }
        // Doubling 53 overshoots 97.
        assert_eq!(seen, vec![5, 11, 23, 53, 193, 389]);
        t.validate().unwrap();
    }

    /// Collisions: equality resolves the right element in a shared chain.
    #[test]
    fn collision_chain_resolution() {
        let mut t: ChainTable<String, ConstBuildHasher> = ChainTable::with_hasher(ConstBuildHasher);
        for k in ["a", "b", "c", "d"] {
            t.emplace_unique(k.to_string()).unwrap();
        }
        let a = t.find("a").unwrap();
        let d = t.find("d").unwrap();
        assert_ne!(a, d);
        assert_eq!(t.get(a).map(String::as_str), Some("a"));
        assert_eq!(t.bucket_size(0), 4);
        assert_eq!(t.erase(t.find("b").unwrap()).as_deref(), Some("b"));
        assert!(t.contains("a") && t.contains("c") && t.contains("d"));
        assert_eq!(t.bucket_size(0), 3);
        t.validate().unwrap();
    }

    /// Equal elements stay contiguous and in insertion order, also across
    /// rehashes.
    #[test]
    fn multi_runs_stay_contiguous_and_ordered() {
        #[derive(Debug, Clone)]
        struct Tagged(u32, u32);
        impl PartialEq for Tagged {
            fn eq(&self, o: &Self) -> bool {
                self.0 == o.0
            }
        }
        impl Eq for Tagged {}
        impl Hash for Tagged {
            fn hash<H: Hasher>(&self, h: &mut H) {
                self.0.hash(h)
            }
        }

        let mut t = ChainTable::new();
        for seq in 0..60u32 {
            t.emplace_multi(Tagged(seq % 4, seq)).unwrap();
            t.validate().unwrap();
        }
        t.rehash(500).unwrap();
        for key in 0..4u32 {
            let run: Vec<u32> = t.equal_range(&Tagged(key, 0)).map(|e| e.1).collect();
            let want: Vec<u32> = (0..60).filter(|s| s % 4 == key).collect();
            assert_eq!(run, want);
            assert_eq!(t.count_multi(&Tagged(key, 0)), 15);
        }
        assert_eq!(t.erase_multi(&Tagged(2, 0)), 15);
        assert_eq!(t.count_multi(&Tagged(2, 0)), 0);
        assert_eq!(t.len(), 45);
        t.validate().unwrap();
    }

    /// Rehash moves nodes by relinking: ids, values and count survive, only
    /// placement changes.
    #[test]
    fn rehash_relinks_without_rebuilding() {
        let mut t = ChainTable::new();
        let ids: Vec<(u64, NodeId)> = (0..100u64)
            .map(|v| (v, t.emplace_unique(v).unwrap().0.node()))
            .collect();
        let before: BTreeSet<u64> = t.iter().copied().collect();
        t.rehash(1000).unwrap();
        assert_eq!(t.bucket_count(), 1543);
        t.validate().unwrap();
        for (v, id) in &ids {
            let pos = t.find(v).unwrap();
            assert_eq!(pos.node(), *id);
            assert_eq!(pos.bucket(), t.bucket(v));
        }
        let after: BTreeSet<u64> = t.iter().copied().collect();
        assert_eq!(before, after);
        t.rehash(0).unwrap();
        assert_eq!(t.bucket_count(), 193, "shrinks to fit len / max_load_factor");
        t.validate().unwrap();
    }

    /// A position taken before a rehash still erases the right element.
    #[test]
    fn stale_bucket_index_tolerated_by_erase_and_next() {
        let mut t = ChainTable::new();
        for v in 0..20u32 {
            t.emplace_unique(v).unwrap();
        }
        let pos = t.find(&7).unwrap();
        t.rehash(400).unwrap();
        let mut walked = t.first();
        while let Some(p) = walked {
            if p.node() == pos.node() {
                break;
            }
            walked = t.next(p);
        }
        assert_eq!(walked.map(|p| p.bucket()), Some(t.bucket(&7)));
        assert_eq!(t.erase(pos), Some(7));
        assert_eq!(t.erase(pos), None);
        assert!(!t.contains(&7));
        t.validate().unwrap();
    }

    #[test]
    fn position_walk_matches_iter() {
        let mut t = ChainTable::new();
        for v in 0..50u32 {
            t.emplace_unique(v * 7).unwrap();
        }
        let mut walked = Vec::new();
        let mut p = t.first();
        while let Some(pos) = p {
            walked.push(*t.get(pos).unwrap());
            p = t.next(pos);
        }
        let iterated: Vec<u32> = t.iter().copied().collect();
        assert_eq!(walked, iterated);
        assert_eq!(t.iter().len(), 50);
        let per_bucket: usize = (0..t.bucket_count()).map(|b| t.bucket_size(b)).sum();
        assert_eq!(per_bucket, 50);
        for v in t.bucket_iter(t.bucket(&14)) {
            assert_eq!(t.bucket(v), t.bucket(&14));
        }
    }

    /// A refused node allocation leaves the table untouched, including when
    /// the insert would have triggered growth.
    #[test]
    fn failed_emplace_leaves_table_unchanged() {
        let alloc = Bounded::new(SlotAllocator::new(), 5);
        let mut t = ChainTable::with_hasher_and_allocator(DefaultHashBuilder::default(), alloc);
        for v in 0..5u32 {
            t.emplace_unique(v).unwrap();
        }
        assert_eq!(t.bucket_count(), 5);
        let order: Vec<u32> = t.iter().copied().collect();
        let err = t.emplace_unique(5).unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::LimitReached { limit: 5 }));
        assert!(t.emplace_multi(1).is_err());
        assert_eq!(t.bucket_count(), 5, "no rehash on a failed insert");
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), order);
        t.validate().unwrap();
    }

    #[test]
    fn rehash_overflow_is_reported_and_harmless() {
        let mut t = ChainTable::new();
        t.emplace_unique(1u8).unwrap();
        assert_eq!(t.rehash(usize::MAX), Err(Error::CapacityOverflow));
        assert_eq!(t.bucket_count(), 5);
        assert!(t.contains(&1));
        t.validate().unwrap();
    }

    #[test]
    fn max_load_factor_changes_rehash_and_validate() {
        let mut t = ChainTable::new();
        for v in 0..40u32 {
            t.emplace_unique(v).unwrap();
        }
        assert_eq!(t.set_max_load_factor(0.0), Err(Error::InvalidLoadFactor));
        assert_eq!(t.set_max_load_factor(f32::NAN), Err(Error::InvalidLoadFactor));
        t.set_max_load_factor(0.25).unwrap();
        assert!(t.load_factor() <= 0.25);
        t.validate().unwrap();

        let cfg = TableConfig {
            max_load_factor: 0.5,
            initial_bucket_count: 100,
        };
        let c: ChainTable<u32> =
            ChainTable::with_config(cfg, DefaultHashBuilder::default(), SlotAllocator::new())
                .unwrap();
        assert_eq!(c.bucket_count(), 193);
        assert_eq!(c.max_load_factor(), 0.5);
    }

    #[test]
    fn reserve_never_shrinks() {
        let mut t: ChainTable<u32> = ChainTable::new();
        t.reserve(100).unwrap();
        assert_eq!(t.bucket_count(), 193);
        for v in 0..100 {
            t.emplace_unique(v).unwrap();
        }
        assert_eq!(t.bucket_count(), 193, "reserved room avoids rehash");
        t.reserve(10).unwrap();
        assert_eq!(t.bucket_count(), 193);
    }

    #[test]
    fn clear_keeps_buckets_and_releases_nodes() {
        let (alloc, stats) = Counting::new(SlotAllocator::new());
        let mut t = ChainTable::with_hasher_and_allocator(DefaultHashBuilder::default(), alloc);
        for v in 0..30u32 {
            t.emplace_unique(v).unwrap();
        }
        let buckets = t.bucket_count();
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.bucket_count(), buckets);
        assert_eq!(stats.live(), 0);
        t.emplace_unique(1).unwrap();
        drop(t);
        assert_eq!(stats.live(), 0);
        assert_eq!(stats.allocations(), 31);
    }

    #[test]
    fn swap_exchanges_contents() {
        let mut a = ChainTable::new();
        let mut b = ChainTable::new();
        a.emplace_unique(1).unwrap();
        b.emplace_unique(2).unwrap();
        b.emplace_unique(3).unwrap();
        a.swap(&mut b);
        assert_eq!(a.len(), 2);
        assert!(b.contains(&1));
        assert_eq!(format!("{b:?}"), "{1}");
    }

    // Equality and hashing look at the key only; the tag records order.
    #[derive(Debug)]
    struct Pair(&'static str, u32);
    impl PartialEq for Pair {
        fn eq(&self, o: &Self) -> bool {
            self.0 == o.0
        }
    }
    impl Eq for Pair {}
    impl Hash for Pair {
        fn hash<H: Hasher>(&self, h: &mut H) {
            self.0.hash(h)
        }
    }

    fn tags<S: BuildHasher, A: NodeAllocator<ChainNode<Pair>>>(
        t: &ChainTable<Pair, S, A>,
        key: &'static str,
    ) -> Vec<u32> {
        t.equal_range(&Pair(key, 0)).map(|p| p.1).collect()
    }

    #[test]
    fn range_insert_unique_skips_duplicates() {
        let mut t = ChainTable::new();
        assert_eq!(t.range_insert_unique([3, 1, 3, 2, 1]).unwrap(), 3);
        assert_eq!(t.len(), 3);
        assert_eq!(t.bucket_count(), 5);
        assert_eq!(t.range_insert_unique([2, 4]).unwrap(), 1);
        assert!(t.contains(&4));
        t.validate().unwrap();
    }

    /// A bulk insert that runs out of nodes removes what it added; runs
    /// keep their order.
    #[test]
    fn range_insert_multi_rolls_back_on_failure() {
        let alloc = Bounded::new(SlotAllocator::new(), 6);
        let mut t = ChainTable::with_hasher_and_allocator(DefaultHashBuilder::default(), alloc);
        t.range_insert_multi([Pair("a", 0), Pair("a", 1), Pair("b", 2)]).unwrap();
        let err = t
            .range_insert_multi([Pair("a", 3), Pair("c", 4), Pair("d", 5), Pair("e", 6)])
            .unwrap_err();
        assert_eq!(err, Error::Alloc(AllocError::LimitReached { limit: 6 }));
        assert_eq!(t.len(), 3);
        assert_eq!(tags(&t, "a"), vec![0, 1]);
        assert_eq!(tags(&t, "b"), vec![2]);
        assert!(!t.contains(&Pair("c", 0)));
        t.validate().unwrap();
    }

    #[test]
    fn hinted_emplace_uses_matching_hint() {
        let mut t = ChainTable::new();
        let p0 = t.emplace_multi(Pair("a", 0)).unwrap();
        t.emplace_multi(Pair("a", 1)).unwrap();
        t.emplace_multi_hint(Some(p0), Pair("a", 2)).unwrap();
        assert_eq!(tags(&t, "a"), vec![0, 2, 1]);

        let other = t.emplace_multi(Pair("b", 3)).unwrap();
        t.emplace_multi_hint(Some(other), Pair("a", 4)).unwrap();
        assert_eq!(tags(&t, "a"), vec![0, 2, 1, 4], "a non-matching hint appends to the run");

        let (hit, fresh) = t.emplace_unique_hint(Some(p0), Pair("a", 9)).unwrap();
        assert!(!fresh);
        assert_eq!(hit.node(), p0.node());
        let (pos, fresh) = t.emplace_unique_hint(None, Pair("c", 5)).unwrap();
        assert!(fresh);
        assert_eq!(t.get(pos).map(|p| p.1), Some(5));
        t.validate().unwrap();
    }

    #[test]
    fn erase_range_in_bucket_order() {
        let mut t = ChainTable::try_from_unique(0..20u32).unwrap();
        let first = t.first().unwrap();
        let mut last = first;
        let mut doomed = Vec::new();
        for _ in 0..5 {
            doomed.push(*t.get(last).unwrap());
            last = t.next(last).unwrap();
        }
        let kept = *t.get(last).unwrap();
        assert_eq!(t.erase_range(first, Some(last)), Some(last));
        assert_eq!(t.len(), 15);
        assert!(doomed.iter().all(|v| !t.contains(v)));
        assert!(t.contains(&kept));
        t.validate().unwrap();

        let first = t.first().unwrap();
        assert_eq!(t.erase_range(first, None), None);
        assert!(t.is_empty());
        t.validate().unwrap();
    }

    #[test]
    fn construct_from_items() {
        let t = ChainTable::try_from_multi(["x", "y", "x"]).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.count_multi("x"), 2);

        let u = ChainTable::try_from_unique(["x", "y", "x"]).unwrap();
        assert_eq!(u.len(), 2);

        let bounded = ChainTable::try_from_unique_in(
            [1u8, 2, 3],
            DefaultHashBuilder::default(),
            Bounded::new(SlotAllocator::new(), 2),
        );
        assert!(matches!(
            bounded,
            Err(Error::Alloc(AllocError::LimitReached { limit: 2 }))
        ));
    }

    /// A refused node for a multi insert onto an existing run, at the point
    /// where the table would have grown, changes neither the run nor the
    /// bucket array.
    #[test]
    fn failed_multi_insert_onto_run_before_growth() {
        let alloc = Bounded::new(SlotAllocator::new(), 5);
        let mut t = ChainTable::with_hasher_and_allocator(DefaultHashBuilder::default(), alloc);
        for (k, tag) in [("k", 0), ("k", 1), ("k", 2), ("y", 3), ("z", 4)] {
            t.emplace_multi(Pair(k, tag)).unwrap();
        }
        assert_eq!(t.bucket_count(), 5);
        let head = t.find(&Pair("k", 0)).unwrap();

        assert_eq!(
            t.emplace_multi(Pair("k", 5)),
            Err(Error::Alloc(AllocError::LimitReached { limit: 5 }))
        );
        assert!(t.emplace_multi_hint(Some(head), Pair("k", 6)).is_err());
        assert_eq!(t.bucket_count(), 5);
        assert_eq!(tags(&t, "k"), vec![0, 1, 2]);
        assert_eq!(t.len(), 5);
        t.validate().unwrap();

        // A bulk insert reserves before allocating; only its elements are
        // rolled back.
        assert!(t.range_insert_multi([Pair("k", 7)]).is_err());
        assert_eq!(t.bucket_count(), 11);
        assert_eq!(tags(&t, "k"), vec![0, 1, 2]);
        t.validate().unwrap();
    }

    #[test]
    fn failed_multi_insert_keeps_bucket_count() {
        let alloc = Bounded::new(SlotAllocator::new(), 5);
        let mut t = ChainTable::with_hasher_and_allocator(DefaultHashBuilder::default(), alloc);
        for tag in 0..5 {
            t.emplace_multi(Pair("k", tag)).unwrap();
        }
        assert!(t.emplace_multi(Pair("k", 5)).is_err());
        assert_eq!(t.bucket_count(), 5);
        assert_eq!(tags(&t, "k"), vec![0, 1, 2, 3, 4]);
        t.validate().unwrap();
    }

    /// Invariant (debug-only): re-entering the table from `Eq` during a
    /// lookup panics because of the reentrancy guard.
    #[cfg(debug_assertions)]
    #[test]
    fn reentrancy_panics_from_eq_during_find() {
        struct ReentryKey {
            id: &'static str,
            table: *const ChainTable<ReentryKey, ConstBuildHasher>,
            trigger: bool,
        }
        impl PartialEq for ReentryKey {
            fn eq(&self, other: &Self) -> bool {
                if self.id == other.id {
                    return true;
                }
                if other.trigger || self.trigger {
                    // Attempt to re-enter the same table during probing.
                    unsafe {
                        let t = &*other.table;
                        let _ = t.contains(other);
                    }
                }
                false
            }
        }
        impl Eq for ReentryKey {}
        impl Hash for ReentryKey {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.id.hash(state);
            }
        }

        let mut t: ChainTable<ReentryKey, ConstBuildHasher> =
            ChainTable::with_hasher(ConstBuildHasher);
        let tp: *const ChainTable<ReentryKey, ConstBuildHasher> = &t;
        t.emplace_unique(ReentryKey {
            id: "a",
            table: tp,
            trigger: false,
        })
        .unwrap();

        let query = ReentryKey {
            id: "b",
            table: &t as *const _,
            trigger: true,
        };
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = t.find(&query);
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
    }
}
