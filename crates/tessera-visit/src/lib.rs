//! Graph traversal primitives for cyclic object graphs.
//!
//! Domain object graphs returned by a remote persistence service are
//! arbitrary directed graphs: owners reference dependents, dependents point
//! back at their owners, and independent references may close longer loops.
//! This crate provides identity-aware traversals over such graphs without
//! knowing anything about the domain itself.
//!
//! # Key Types
//!
//! - [`GraphNode`] -- the node abstraction (identity, named neighbors, linking)
//! - [`Visitor`] -- explicit-worklist depth-first traversal with lineage
//!   tracking and cycle recording
//! - [`CopyVisitor`] -- builds a parallel graph from a per-node copy function
//! - [`MatchVisitor`] / [`MergeVisitor`] -- pair nodes of two graphs and fold
//!   one into the other
//!
//! # Design Rules
//!
//! 1. Navigation is always driven by a caller-supplied attribute selector.
//! 2. A node is visited at most once per traversal, keyed by [`GraphNode::node_id`].
//! 3. An edge back into the current lineage is recorded as a cycle, never followed.

pub mod copy;
pub mod matcher;
pub mod node;
pub mod visitor;

#[cfg(test)]
pub(crate) mod testing;

pub use copy::CopyVisitor;
pub use matcher::{pair_members, MatchResult, MatchVisitor, MergeVisitor};
pub use node::GraphNode;
pub use visitor::{Order, Visitor};
