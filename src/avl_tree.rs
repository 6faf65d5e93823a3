//! AvlTree: height-balanced ordered engine with a sentinel end position.
//!
//! Layout
//! - Nodes live in the allocator and point at each other with `NodeId`s.
//!   Child links own the structure; parent links are navigation only.
//! - The sentinel is `Link::Sentinel`: the root's parent, the end position,
//!   and the stop point of every upward walk. `root` plays the role of the
//!   sentinel's left link, so decrementing the end yields the maximum.
//! - `start` caches the minimum so `first()` is O(1).
//!
//! Mutation discipline
//! - Searches (the only place user code runs) finish before anything is
//!   allocated or linked. Allocation happens next; a refused allocation
//!   returns before any link has changed.
//! - Splicing, rotations and unlinking never call the comparator and
//!   cannot fail.
//!
//! Position validity
//! - A `Link::Node` stays valid until that node is erased. Rotations and
//!   erasing other nodes move nodes around but never change their ids.

use core::cmp::Ordering;
use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;

use tracing::{debug, trace};

use crate::alloc::{NodeAllocator, NodeId, SlotAllocator};
use crate::compare::{Compare, Natural};
use crate::error::Error;
use crate::node::{Link, TreeNode};
use crate::reentrancy::DebugReentrancy;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Side {
    Left,
    Right,
}

/// Empty child slot where a new leaf will hang. A `Sentinel` parent means
/// the slot is the root.
#[derive(Copy, Clone, Debug)]
struct Slot {
    parent: Link,
    side: Side,
}

const ROOT_SLOT: Slot = Slot {
    parent: Link::Sentinel,
    side: Side::Left,
};

pub struct AvlTree<T, C = Natural, A = SlotAllocator<TreeNode<T>>>
where
    A: NodeAllocator<TreeNode<T>>,
{
    root: Option<NodeId>,
    start: Link,
    len: usize,
    comp: C,
    alloc: A,
    reentrancy: DebugReentrancy,
    _marker: PhantomData<T>,
}

impl<T> AvlTree<T> {
    pub fn new() -> Self {
        Self::with_comparator_and_allocator(Natural, SlotAllocator::new())
    }
}

impl<T> Default for AvlTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> AvlTree<T> {
    /// Build a tree from `items`, keeping the first of any equivalent run.
    /// Sorted input takes the hinted fast path.
    pub fn try_from_unique<I: IntoIterator<Item = T>>(items: I) -> Result<Self, Error> {
        Self::try_from_unique_in(items, Natural, SlotAllocator::new())
    }

    pub fn try_from_multi<I: IntoIterator<Item = T>>(items: I) -> Result<Self, Error> {
        Self::try_from_multi_in(items, Natural, SlotAllocator::new())
    }
}

impl<T, C> AvlTree<T, C> {
    pub fn with_comparator(comp: C) -> Self {
        Self::with_comparator_and_allocator(comp, SlotAllocator::new())
    }
}

impl<T, C, A> AvlTree<T, C, A>
where
    A: NodeAllocator<TreeNode<T>>,
{
    pub fn with_comparator_and_allocator(comp: C, alloc: A) -> Self {
        Self {
            root: None,
            start: Link::Sentinel,
            len: 0,
            comp,
            alloc,
            reentrancy: DebugReentrancy::new(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Height of the root (0 for an empty tree).
    pub fn height(&self) -> usize {
        self.h(self.root) as usize
    }

    pub fn comparator(&self) -> &C {
        &self.comp
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Position of the minimum, or the sentinel when empty. O(1).
    pub fn first(&self) -> Link {
        self.start
    }

    /// Position of the maximum, or the sentinel when empty.
    pub fn last(&self) -> Link {
        self.pred(Link::Sentinel)
    }

    pub fn end(&self) -> Link {
        Link::Sentinel
    }

    /// In-order successor. The successor of the last element is the
    /// sentinel and the successor of the sentinel is the first element.
    ///
    /// Panics if `pos` names an erased node.
    pub fn next(&self, pos: Link) -> Link {
        self.succ(pos)
    }

    /// In-order predecessor; mirror of [`AvlTree::next`].
    pub fn prev(&self, pos: Link) -> Link {
        self.pred(pos)
    }

    /// Value at `pos`; `None` for the sentinel or an erased node.
    pub fn get(&self, pos: Link) -> Option<&T> {
        self.value(pos.node()?)
    }

    pub fn value(&self, id: NodeId) -> Option<&T> {
        self.alloc.get(id).map(|n| &n.value)
    }

    pub fn iter(&self) -> Iter<'_, T, C, A> {
        Iter {
            tree: self,
            front: self.start,
            back: Link::Sentinel,
        }
    }

    /// Iterate the half-open range `[first, last)`. `last` must not precede
    /// `first`.
    pub fn range(&self, first: Link, last: Link) -> Iter<'_, T, C, A> {
        Iter {
            tree: self,
            front: first,
            back: last,
        }
    }

    /// Remove the element at `pos` and return it. Returns `None` for the
    /// sentinel or a position whose node is already gone. Only positions of
    /// the erased node are invalidated.
    pub fn erase(&mut self, pos: Link) -> Option<T> {
        let id = pos.node()?;
        self.alloc.get(id)?;
        Some(self.erase_node(id))
    }

    /// Remove `[first, last)` and return `last`.
    pub fn erase_range(&mut self, first: Link, last: Link) -> Link {
        let mut cur = first;
        while cur != last {
            let Link::Node(id) = cur else { break };
            let next = self.succ(cur);
            drop(self.erase_node(id));
            cur = next;
        }
        last
    }

    /// Drop every element. Nodes are released by walking down from the
    /// root.
    pub fn clear(&mut self) {
        let mut pending: Vec<NodeId> = Vec::new();
        pending.extend(self.root.take());
        self.start = Link::Sentinel;
        self.len = 0;
        while let Some(id) = pending.pop() {
            if let Some(node) = self.alloc.deallocate(id) {
                pending.extend(node.left);
                pending.extend(node.right);
            }
        }
    }

    /// Exchange contents with `other`. Nodes change owner together with
    /// their allocator; positions keep pointing at the same elements, now
    /// inside the other tree.
    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(self, other);
    }

    #[inline]
    fn n(&self, id: NodeId) -> &TreeNode<T> {
        self.alloc.node(id)
    }

    #[inline]
    fn n_mut(&mut self, id: NodeId) -> &mut TreeNode<T> {
        self.alloc.node_mut(id)
    }

    #[inline]
    fn h(&self, id: Option<NodeId>) -> u32 {
        id.map_or(0, |id| self.n(id).height)
    }

    fn subtree_min(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.n(id).left {
            id = l;
        }
        id
    }

    fn subtree_max(&self, mut id: NodeId) -> NodeId {
        while let Some(r) = self.n(id).right {
            id = r;
        }
        id
    }

    fn succ(&self, pos: Link) -> Link {
        let Link::Node(mut cur) = pos else {
            return self.start;
        };
        if let Some(r) = self.n(cur).right {
            return Link::Node(self.subtree_min(r));
        }
        loop {
            match self.n(cur).parent {
                Link::Node(p) if self.n(p).right == Some(cur) => cur = p,
                up => return up,
            }
        }
    }

    fn pred(&self, pos: Link) -> Link {
        let Link::Node(mut cur) = pos else {
            return self.root.map_or(Link::Sentinel, |r| Link::Node(self.subtree_max(r)));
        };
        if let Some(l) = self.n(cur).left {
            return Link::Node(self.subtree_max(l));
        }
        loop {
            match self.n(cur).parent {
                Link::Node(p) if self.n(p).left == Some(cur) => cur = p,
                up => return up,
            }
        }
    }

    /// Empty child slot directly before `pos` in order.
    fn slot_before(&self, pos: Link) -> Slot {
        let left = match pos {
            Link::Sentinel => self.root,
            Link::Node(id) => self.n(id).left,
        };
        match left {
            Some(l) => Slot {
                parent: Link::Node(self.subtree_max(l)),
                side: Side::Right,
            },
            None if pos.is_sentinel() => ROOT_SLOT,
            None => Slot {
                parent: pos,
                side: Side::Left,
            },
        }
    }

    /// Point `parent`'s link to `old` at `new` instead. Does not touch
    /// `new`'s parent link.
    fn replace_child(&mut self, parent: Link, old: NodeId, new: Option<NodeId>) {
        match parent {
            Link::Sentinel => self.root = new,
            Link::Node(p) => {
                let pn = self.n_mut(p);
                if pn.left == Some(old) {
                    pn.left = new;
                } else {
                    debug_assert_eq!(pn.right, Some(old), "parent does not own child");
                    pn.right = new;
                }
            }
        }
    }

    /// Allocate a leaf for `value` and hang it in `slot`, then rebalance.
    fn link_at(&mut self, slot: Slot, value: T) -> Result<NodeId, Error> {
        let id = self
            .alloc
            .allocate(TreeNode::leaf(value, slot.parent))
            .map_err(|e| {
                debug!(len = self.len, error = %e, "tree node allocation refused");
                Error::from(e)
            })?;
        match (slot.parent, slot.side) {
            (Link::Sentinel, _) => self.root = Some(id),
            (Link::Node(p), Side::Left) => self.n_mut(p).left = Some(id),
            (Link::Node(p), Side::Right) => self.n_mut(p).right = Some(id),
        }
        // A new minimum can only appear as the left child of the old one
        // (or as the root of an empty tree, whose "minimum" is the sentinel).
        if slot.side == Side::Left && slot.parent == self.start {
            self.start = Link::Node(id);
        }
        self.len += 1;
        self.rebalance_from(slot.parent);
        Ok(id)
    }

    fn update_height(&mut self, id: NodeId) {
        let n = self.n(id);
        let h = 1 + self.h(n.left).max(self.h(n.right));
        self.n_mut(id).height = h;
    }

    fn balance_factor(&self, id: NodeId) -> i64 {
        let n = self.n(id);
        i64::from(self.h(n.left)) - i64::from(self.h(n.right))
    }

    /// Rotate `x` down to the left; returns the new local root. The caller
    /// re-attaches it in `x`'s former parent slot.
    fn rotate_left(&mut self, x: NodeId) -> NodeId {
        let Some(y) = self.n(x).right else { return x };
        let inner = self.n(y).left;
        let parent = self.n(x).parent;
        self.n_mut(x).right = inner;
        if let Some(b) = inner {
            self.n_mut(b).parent = Link::Node(x);
        }
        self.n_mut(y).left = Some(x);
        self.n_mut(x).parent = Link::Node(y);
        self.n_mut(y).parent = parent;
        self.update_height(x);
        self.update_height(y);
        y
    }

    fn rotate_right(&mut self, x: NodeId) -> NodeId {
        let Some(y) = self.n(x).left else { return x };
        let inner = self.n(y).right;
        let parent = self.n(x).parent;
        self.n_mut(x).left = inner;
        if let Some(b) = inner {
            self.n_mut(b).parent = Link::Node(x);
        }
        self.n_mut(y).right = Some(x);
        self.n_mut(x).parent = Link::Node(y);
        self.n_mut(y).parent = parent;
        self.update_height(x);
        self.update_height(y);
        y
    }

    /// Recompute `id`'s height and, if it is out of balance, apply the
    /// LL/LR/RR/RL rotation. Returns the root of the (possibly new) subtree,
    /// already attached to the parent.
    fn balance(&mut self, id: NodeId) -> NodeId {
        self.update_height(id);
        let bf = self.balance_factor(id);
        let parent = self.n(id).parent;
        let sub = if bf > 1 {
            if let Some(l) = self.n(id).left {
                if self.balance_factor(l) < 0 {
                    let nl = self.rotate_left(l);
                    self.n_mut(id).left = Some(nl);
                }
            }
            self.rotate_right(id)
        } else if bf < -1 {
            if let Some(r) = self.n(id).right {
                if self.balance_factor(r) > 0 {
                    let nr = self.rotate_right(r);
                    self.n_mut(id).right = Some(nr);
                }
            }
            self.rotate_left(id)
        } else {
            return id;
        };
        self.replace_child(parent, id, Some(sub));
        sub
    }

    /// Walk from `at` towards the sentinel, fixing heights and balance.
    /// Stops at the first subtree whose height did not change: nothing
    /// above it can have moved.
    fn rebalance_from(&mut self, mut at: Link) {
        while let Link::Node(id) = at {
            let before = self.n(id).height;
            let sub = self.balance(id);
            if self.n(sub).height == before {
                break;
            }
            at = self.n(sub).parent;
        }
    }

    fn erase_node(&mut self, id: NodeId) -> T {
        if self.start == Link::Node(id) {
            self.start = self.succ(self.start);
        }
        let (left, right, parent, height) = {
            let n = self.n(id);
            (n.left, n.right, n.parent, n.height)
        };
        let fix_from = match (left, right) {
            (None, None) => {
                self.replace_child(parent, id, None);
                parent
            }
            (Some(child), None) | (None, Some(child)) => {
                self.replace_child(parent, id, Some(child));
                self.n_mut(child).parent = parent;
                parent
            }
            (Some(l), Some(r)) => {
                let pred = self.subtree_max(l);
                let fix_from = if pred == l {
                    // Direct left child: it has no right subtree, so it can
                    // adopt `r` in place. Its own height is now stale.
                    Link::Node(l)
                } else {
                    // Deeper predecessor: its parent adopts its left subtree,
                    // and that parent is where heights first change.
                    let pp = self.n(pred).parent;
                    let pl = self.n(pred).left;
                    if let Link::Node(pp) = pp {
                        self.n_mut(pp).right = pl;
                    }
                    if let Some(pl) = pl {
                        self.n_mut(pl).parent = pp;
                    }
                    self.n_mut(pred).left = Some(l);
                    self.n_mut(l).parent = Link::Node(pred);
                    pp
                };
                self.n_mut(pred).right = Some(r);
                self.n_mut(r).parent = Link::Node(pred);
                // The promoted node stands in for the removed one, so the
                // upward walk compares against the removed node's height.
                let p = self.n_mut(pred);
                p.parent = parent;
                p.height = height;
                self.replace_child(parent, id, Some(pred));
                fix_from
            }
        };
        let node = self
            .alloc
            .deallocate(id)
            .expect("erased node must be live in its allocator");
        self.len -= 1;
        self.rebalance_from(fix_from);
        node.into_value()
    }
}

impl<T, C, A> AvlTree<T, C, A>
where
    C: Compare<T>,
    A: NodeAllocator<TreeNode<T>>,
{
    /// Build a tree with the given comparator and allocator from `items`.
    /// On failure every node allocated so far is released again.
    pub fn try_from_unique_in<I>(items: I, comp: C, alloc: A) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
    {
        let mut t = Self::with_comparator_and_allocator(comp, alloc);
        t.range_insert_unique(items)?;
        Ok(t)
    }

    pub fn try_from_multi_in<I>(items: I, comp: C, alloc: A) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
    {
        let mut t = Self::with_comparator_and_allocator(comp, alloc);
        t.range_insert_multi(items)?;
        Ok(t)
    }

    /// First element not less than `key`, or the sentinel.
    pub fn lower_bound<Q: ?Sized>(&self, key: &Q) -> Link
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        self.lower_bound_inner(key)
    }

    /// First element greater than `key`, or the sentinel.
    pub fn upper_bound<Q: ?Sized>(&self, key: &Q) -> Link
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        self.upper_bound_inner(key)
    }

    pub fn equal_range<Q: ?Sized>(&self, key: &Q) -> (Link, Link)
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        (self.lower_bound_inner(key), self.upper_bound_inner(key))
    }

    pub fn find<Q: ?Sized>(&self, key: &Q) -> Option<NodeId>
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        self.find_inner(key)
    }

    pub fn contains<Q: ?Sized>(&self, key: &Q) -> bool
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        self.find_inner(key).is_some()
    }

    /// 0 or 1; for trees filled with `emplace_unique`.
    pub fn count_unique<Q: ?Sized>(&self, key: &Q) -> usize
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        usize::from(self.find_inner(key).is_some())
    }

    pub fn count_multi<Q: ?Sized>(&self, key: &Q) -> usize
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        let (lo, hi) = (self.lower_bound_inner(key), self.upper_bound_inner(key));
        self.range(lo, hi).count()
    }

    /// Insert `value` unless an equivalent element exists. Returns the
    /// position holding the equivalent element and whether `value` was
    /// inserted; on a hit `value` is dropped.
    pub fn emplace_unique(&mut self, value: T) -> Result<(NodeId, bool), Error> {
        let _g = self.reentrancy.enter();
        self.insert_unique(value)
    }

    /// Insert `value` after every element equivalent to it.
    pub fn emplace_multi(&mut self, value: T) -> Result<NodeId, Error> {
        let _g = self.reentrancy.enter();
        self.insert_multi(value)
    }

    /// Like [`AvlTree::emplace_unique`], but skips the search when `value`
    /// belongs directly before `hint`.
    pub fn emplace_unique_hint(&mut self, hint: Link, value: T) -> Result<(NodeId, bool), Error> {
        let _g = self.reentrancy.enter();
        self.insert_unique_hint(hint, value)
    }

    pub fn emplace_multi_hint(&mut self, hint: Link, value: T) -> Result<NodeId, Error> {
        let _g = self.reentrancy.enter();
        self.insert_multi_hint(hint, value)
    }

    /// Insert every item, keeping the first of equivalent ones. Returns how
    /// many were inserted.
    ///
    /// Sorted input is inserted through the previous insertion point, which
    /// costs O(1) comparisons per element instead of O(height). If any
    /// insertion fails, the elements this call already inserted are removed
    /// again and the tree is back to its prior contents.
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

    pub fn erase_unique<Q: ?Sized>(&mut self, key: &Q) -> Option<T>
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        let id = self.find_inner(key)?;
        Some(self.erase_node(id))
    }

    /// Remove every element equivalent to `key`; returns how many.
    pub fn erase_multi<Q: ?Sized>(&mut self, key: &Q) -> usize
    where
        C: Compare<T, Q>,
    {
        let _g = self.reentrancy.enter();
        let (lo, hi) = (self.lower_bound_inner(key), self.upper_bound_inner(key));
        let before = self.len;
        self.erase_range(lo, hi);
        before - self.len
    }

    /// Descend from the root, turning right while `go_right` holds. Returns
    /// the empty slot reached and the last node where the walk turned left.
    fn descend<F: Fn(&T) -> bool>(&self, go_right: F) -> (Slot, Link) {
        let mut slot = ROOT_SLOT;
        let mut bound = Link::Sentinel;
        let mut cur = self.root;
        while let Some(id) = cur {
            let n = self.n(id);
            if go_right(&n.value) {
                slot = Slot {
                    parent: Link::Node(id),
                    side: Side::Right,
                };
                cur = n.right;
            } else {
                bound = Link::Node(id);
                slot = Slot {
                    parent: Link::Node(id),
                    side: Side::Left,
                };
                cur = n.left;
            }
        }
        (slot, bound)
    }

    fn lower_bound_inner<Q: ?Sized>(&self, key: &Q) -> Link
    where
        C: Compare<T, Q>,
    {
        self.descend(|v| self.comp.compare(v, key) == Ordering::Less).1
    }

    fn upper_bound_inner<Q: ?Sized>(&self, key: &Q) -> Link
    where
        C: Compare<T, Q>,
    {
        self.descend(|v| self.comp.compare(v, key) != Ordering::Greater).1
    }

    fn find_inner<Q: ?Sized>(&self, key: &Q) -> Option<NodeId>
    where
        C: Compare<T, Q>,
    {
        let id = self.lower_bound_inner(key).node()?;
        (self.comp.compare(&self.n(id).value, key) == Ordering::Equal).then_some(id)
    }

    fn insert_unique(&mut self, value: T) -> Result<(NodeId, bool), Error> {
        let (slot, bound) = self.descend(|v| self.comp.compare(v, &value) == Ordering::Less);
        if let Link::Node(b) = bound {
            if self.comp.compare(&self.n(b).value, &value) == Ordering::Equal {
                return Ok((b, false));
            }
        }
        Ok((self.link_at(slot, value)?, true))
    }

    fn insert_multi(&mut self, value: T) -> Result<NodeId, Error> {
        let (slot, _) = self.descend(|v| self.comp.compare(v, &value) != Ordering::Greater);
        self.link_at(slot, value)
    }

    /// `hint` is live, `value < *hint` (or hint is the sentinel), and the
    /// predecessor of `hint` is less than `value` (unique) or not greater
    /// than it (multi).
    fn hint_fits(&self, hint: Link, value: &T, unique: bool) -> bool {
        if let Link::Node(h) = hint {
            let Some(hn) = self.alloc.get(h) else {
                return false;
            };
            if self.comp.compare(&hn.value, value) != Ordering::Greater {
                return false;
            }
        }
        match self.pred(hint) {
            Link::Sentinel => true,
            Link::Node(p) => match self.comp.compare(&self.n(p).value, value) {
                Ordering::Less => true,
                Ordering::Equal => !unique,
                Ordering::Greater => false,
            },
        }
    }

    fn insert_unique_hint(&mut self, hint: Link, value: T) -> Result<(NodeId, bool), Error> {
        if self.hint_fits(hint, &value, true) {
            let slot = self.slot_before(hint);
            return Ok((self.link_at(slot, value)?, true));
        }
        self.insert_unique(value)
    }

    fn insert_multi_hint(&mut self, hint: Link, value: T) -> Result<NodeId, Error> {
        if self.hint_fits(hint, &value, false) {
            let slot = self.slot_before(hint);
            return self.link_at(slot, value);
        }
        self.insert_multi(value)
    }

    fn range_insert<I: IntoIterator<Item = T>>(
        &mut self,
        items: I,
        unique: bool,
    ) -> Result<usize, Error> {
        let items: Vec<T> = items.into_iter().collect();
        let sorted = items
            .windows(2)
            .all(|w| self.comp.compare(&w[0], &w[1]) != Ordering::Greater);
        trace!(count = items.len(), sorted, unique, "tree range insert");

        let mut inserted: Vec<NodeId> = Vec::new();
        inserted.try_reserve_exact(items.len())?;

        let mut hint: Option<Link> = None;
        for value in items {
            let step = match (sorted, hint, unique) {
                (true, Some(h), true) => self.insert_unique_hint(h, value),
                (true, Some(h), false) => self.insert_multi_hint(h, value).map(|id| (id, true)),
                (_, _, true) => self.insert_unique(value),
                (_, _, false) => self.insert_multi(value).map(|id| (id, true)),
            };
            match step {
                Ok((id, fresh)) => {
                    if fresh {
                        inserted.push(id);
                    }
                    if sorted {
                        hint = Some(self.succ(Link::Node(id)));
                    }
                }
                Err(e) => {
                    debug!(rolled_back = inserted.len(), "tree range insert failed");
                    for id in inserted.into_iter().rev() {
                        drop(self.erase_node(id));
                    }
                    return Err(e);
                }
            }
        }
        Ok(inserted.len())
    }

    /// Check every structural invariant; used by the tests.
    #[cfg(test)]
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self.root {
            None => {
                if self.len != 0 || self.start != Link::Sentinel {
                    return Err("empty tree with nonzero len or cached start".into());
                }
            }
            Some(r) => {
                if self.n(r).parent != Link::Sentinel {
                    return Err("root parent is not the sentinel".into());
                }
                if self.start != Link::Node(self.subtree_min(r)) {
                    return Err("cached start is not the minimum".into());
                }
            }
        }
        let mut count = 0usize;
        let mut prev: Option<NodeId> = None;
        let mut cur = self.start;
        while let Link::Node(id) = cur {
            let n = self.n(id);
            for child in [n.left, n.right].into_iter().flatten() {
                if self.n(child).parent != Link::Node(id) {
                    return Err(format!("child {child:?} has a wrong parent link"));
                }
            }
            let (hl, hr) = (self.h(n.left), self.h(n.right));
            if n.height != 1 + hl.max(hr) {
                return Err(format!("stale height at {id:?}"));
            }
            if hl.abs_diff(hr) > 1 {
                return Err(format!("unbalanced node {id:?}: {hl} vs {hr}"));
            }
            if let Some(p) = prev {
                if self.comp.compare(&self.n(p).value, &n.value) == Ordering::Greater {
                    return Err("in-order traversal decreases".into());
                }
            }
            prev = Some(id);
            count += 1;
            if count > self.len {
                return Err("more reachable nodes than len".into());
            }
            cur = self.succ(cur);
        }
        if count != self.len || self.alloc.len() != self.len {
            return Err(format!(
                "len {} but {} reachable and {} allocated",
                self.len,
                count,
                self.alloc.len()
            ));
        }
        Ok(())
    }
}

impl<T, C, A> Drop for AvlTree<T, C, A>
where
    A: NodeAllocator<TreeNode<T>>,
{
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: fmt::Debug, C, A> fmt::Debug for AvlTree<T, C, A>
where
    A: NodeAllocator<TreeNode<T>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// In-order iterator over a half-open range of positions.
pub struct Iter<'a, T, C, A>
where
    A: NodeAllocator<TreeNode<T>>,
{
    tree: &'a AvlTree<T, C, A>,
    front: Link,
    back: Link,
}

impl<'a, T, C, A> Iterator for Iter<'a, T, C, A>
where
    A: NodeAllocator<TreeNode<T>>,
{
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        let tree = self.tree;
        let id = self.front.node()?;
        self.front = tree.succ(self.front);
        Some(&tree.n(id).value)
    }
}

impl<'a, T, C, A> DoubleEndedIterator for Iter<'a, T, C, A>
where
    A: NodeAllocator<TreeNode<T>>,
{
    #[inline]
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        let tree = self.tree;
        self.back = tree.pred(self.back);
        let id = self.back.node()?;
        Some(&tree.n(id).value)
    }
}

impl<'a, T, C, A> FusedIterator for Iter<'a, T, C, A> where A: NodeAllocator<TreeNode<T>> {}

impl<'a, T, C, A> IntoIterator for &'a AvlTree<T, C, A>
where
    A: NodeAllocator<TreeNode<T>>,
{
    type Item = &'a T;
    type IntoIter = Iter<'a, T, C, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
