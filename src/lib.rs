//! assoc-engine: node-based engines for ordered and unordered associative
//! containers, with positions that survive unrelated mutations.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: the storage layer underneath set/map/multiset/multimap style
//!   containers. Two engines share one node allocation model:
//!   - AvlTree<T, C, A>: height-balanced binary search tree ordered by a
//!     pluggable [`Compare`]. Supports unique and multi insertion, hinted
//!     insertion, bulk insertion with a sorted fast path, bounds queries
//!     and bidirectional positions.
//!   - ChainTable<T, S, A>: separate-chaining hash table whose bucket
//!     count is always a tabulated prime. Supports unique and multi
//!     insertion with equal elements kept contiguous, load-factor driven
//!     growth and explicit rehash/reserve.
//! - Containers built on top decide what `T` is (a key, or a key/value
//!   pair with a comparator/hasher that only looks at the key).
//!
//! Nodes and positions
//! - Every element lives in its own node, obtained from a
//!   [`NodeAllocator`]. The default [`SlotAllocator`] hands out
//!   generational [`NodeId`]s, so a position whose element was erased
//!   resolves to `None` instead of aliasing a newer element.
//! - Tree positions are [`Link`]s: a node or the sentinel. The sentinel is
//!   the end position and the parent of the root.
//! - Table positions are [`ChainPos`]es: a node plus the bucket it was
//!   found in. Rehash keeps nodes but moves them between buckets.
//!
//! Failure model
//! - Allocation failure is an ordinary `Err` ([`Error`]). Every mutation
//!   searches first, allocates second and links last, so a refused
//!   allocation leaves the engine exactly as it was.
//! - Bulk inserts undo their own partial work on failure.
//! - A comparator or hasher that panics leaves the engine valid: user code
//!   never runs while links are half-updated.
//!
//! Reentrancy policy
//! - Comparators, `Hash` and `Eq` must not call back into the engine that
//!   is invoking them. A debug-only guard panics on such nesting; release
//!   builds pay nothing for it.
//!
//! Constraints
//! - Single-threaded: engines are `!Send`/`!Sync`.
//! - No `unsafe`; structure is expressed through ids into the allocator.
//!
//! Notes and non-goals
//! - No concurrent access, persistence or custom iterator adaptors beyond
//!   the engines' own iterators.
//! - Element values are immutable once linked; changing the key of a
//!   linked element would break ordering or bucket placement.

pub mod alloc;
pub mod avl_tree;
mod avl_tree_proptest;
pub mod chain_table;
mod chain_table_proptest;
pub mod compare;
mod error;
pub mod node;
pub mod primes;
mod reentrancy;

// Public surface
pub use alloc::{AllocError, AllocStats, Bounded, Counting, NodeAllocator, NodeId, SlotAllocator};
pub use avl_tree::AvlTree;
pub use chain_table::{ChainPos, ChainTable, TableConfig};
pub use compare::{Compare, FnCompare, Natural, Reverse};
pub use error::Error;
pub use node::Link;
