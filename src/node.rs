//! Node layouts for both engines.
//!
//! Links are [`NodeId`] handles into the owning engine's allocator. Child
//! and `next` links describe the structure the engine owns; `parent` links
//! are back-references used for navigation only and never for release.

use crate::alloc::NodeId;

/// A position in a tree: either a value node or the sentinel.
///
/// The sentinel has no storage of its own. It is the parent of the root,
/// the end position of every traversal and the point where upward walks
/// stop. Decrementing it yields the last element.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Link {
    Sentinel,
    Node(NodeId),
}

impl Link {
    #[inline]
    pub fn node(self) -> Option<NodeId> {
        match self {
            Link::Sentinel => None,
            Link::Node(id) => Some(id),
        }
    }

    #[inline]
    pub fn is_sentinel(self) -> bool {
        matches!(self, Link::Sentinel)
    }
}

impl From<NodeId> for Link {
    fn from(id: NodeId) -> Self {
        Link::Node(id)
    }
}

impl From<Option<NodeId>> for Link {
    fn from(id: Option<NodeId>) -> Self {
        id.map_or(Link::Sentinel, Link::Node)
    }
}

pub struct TreeNode<T> {
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
    pub(crate) parent: Link,
    pub(crate) height: u32,
    pub(crate) value: T,
}

impl<T> TreeNode<T> {
    pub(crate) fn leaf(value: T, parent: Link) -> Self {
        Self {
            left: None,
            right: None,
            parent,
            height: 1,
            value,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn into_value(self) -> T {
        self.value
    }
}

pub struct ChainNode<T> {
    pub(crate) next: Option<NodeId>,
    pub(crate) hash: u64,
    pub(crate) value: T,
}

impl<T> ChainNode<T> {
    pub(crate) fn new(value: T, hash: u64) -> Self {
        Self {
            next: None,
            hash,
            value,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Hash cached at insertion; rehashing reads this instead of hashing
    /// the value again.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub(crate) fn into_value(self) -> T {
        self.value
    }
}
