//! Mutation notification engine for [`dom_forest`] trees.
//!
//! Observers subscribe to a live tree and receive batched, deduplicated
//! [`MutationRecord`]s at an explicit checkpoint instead of synchronously at
//! each change. The engine survives reentrant mutation (a delivery callback
//! that edits the tree mid-delivery), keeps watching nodes that were removed
//! from an observed subtree via transient receivers, and preserves strict
//! record and delivery ordering.
//!
//! Everything runs on one logical thread in a run-to-completion model; the
//! only concurrency-like phenomenon is reentrancy, which the mutation level
//! stack isolates level by level.
//!
//! # Module layout
//!
//! | Module | Contents |
//! |--------|----------|
//! [`record`] | [`MutationRecord`] and [`RecordKind`] |
//! [`options`] | [`ObserveOptions`] dictionary and validation |
//! [`receiver`] | per (observer, node) subscriptions and tree-hook handlers |
//! [`engine`] | slabs, level stack, scheduler, pending queues |
//! [`batch`] | child-list and animation coalescing scopes |
//! [`dom`] | [`Dom`]: public API and mutation primitives |

mod batch;
mod dom;
mod engine;
mod options;
mod receiver;
mod record;

pub use dom::{AnimationId, ContextId, Dom, ObserverId};
pub use engine::{MutationError, ObservingInfo};
pub use options::ObserveOptions;
pub use record::{MutationRecord, RecordKind};

pub use dom_forest::{AttrName, Forest, ForestError, NodeId, NodeKind};

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
