use std::fmt;
use std::hash::Hash;

/// A node in a navigable object graph.
///
/// Nodes are cheap handles (typically reference-counted) so they are cloned
/// freely during traversal. Two handles denote the same node exactly when
/// their [`node_id`](GraphNode::node_id) values are equal.
pub trait GraphNode: Clone {
    /// Identity of the underlying node, independent of handle identity.
    type Id: Copy + Eq + Hash + fmt::Debug;

    /// The identity of this node.
    fn node_id(&self) -> Self::Id;

    /// The nodes referenced by the named attribute, in attribute order.
    ///
    /// A singular attribute yields zero or one node. Navigation must never
    /// trigger side effects such as deferred loading.
    fn neighbors(&self, attribute: &str) -> Vec<Self>;

    /// Replace the named attribute's references with `nodes`.
    ///
    /// Implementations of singular attributes take the first node, or clear
    /// the attribute when `nodes` is empty.
    fn attach(&self, attribute: &str, nodes: Vec<Self>);
}
