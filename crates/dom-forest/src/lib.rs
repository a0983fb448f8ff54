//! Arena-based mutable DOM-like tree.
//!
//! Provides the structural substrate that `dom-mutation` observes: documents,
//! elements and text nodes with parent/sibling links, an ordered attribute
//! map per element, and text payloads.
//!
//! Instead of raw pointers, all "pointers" are [`NodeId`] indices
//! (`Option<NodeId>` links) into a [`Forest`]-owned arena. Freed slots are
//! recycled through a free list, so ids stay stable while a node is alive
//! and deletes never shift the arena.
//!
//! The forest performs no change notification of its own. Callers that need
//! notifications wrap the edit primitives and dispatch around them; the
//! forest only answers structural queries (`subtree_root`, `tree_order`,
//! sibling lookups) cheaply enough to be called from hot notification paths.

mod forest;
mod node;

pub use forest::{Forest, ForestError};
pub use node::{AttrName, NodeKind};

/// Index of a node in a [`Forest`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(index: u32) -> Self {
        NodeId(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}
