//! Parallel-graph construction.
//!
//! [`CopyVisitor`] builds a new graph with one copy per visited node. The
//! copy function decides what each copy carries; the visitor decides which
//! edges exist between copies. Edges that would close a cycle are pruned by
//! default so the copy is always acyclic.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::debug;

use crate::node::GraphNode;
use crate::visitor::Visitor;

type Mergeable<'a, N> = Rc<dyn Fn(&N, &str) -> bool + 'a>;

/// Copies a graph along navigable, mergeable attributes.
pub struct CopyVisitor<'a, N: GraphNode> {
    visitor: Visitor<'a, N>,
    mergeable: Mergeable<'a, N>,
    prune_cycles: bool,
}

impl<'a, N: GraphNode + 'a> CopyVisitor<'a, N> {
    /// Create a copy visitor.
    ///
    /// `navigator` selects the candidate attributes of a node; `mergeable`
    /// decides which of them are carried into the copy.
    pub fn new(
        navigator: impl Fn(&N) -> Vec<String> + 'a,
        mergeable: impl Fn(&N, &str) -> bool + 'a,
    ) -> Self {
        let mergeable: Mergeable<'a, N> = Rc::new(mergeable);
        let filter = Rc::clone(&mergeable);
        let visitor = Visitor::new(move |node: &N| {
            navigator(node)
                .into_iter()
                .filter(|attribute| filter(node, attribute))
                .collect()
        });
        Self {
            visitor,
            mergeable,
            prune_cycles: true,
        }
    }

    /// Only carry the member `child` of `parent.attribute` when `retain`
    /// accepts it.
    pub fn with_retain(mut self, retain: impl Fn(&N, &str, &N) -> bool + 'a) -> Self {
        self.visitor = self.visitor.with_filter(retain);
        self
    }

    /// Keep edges that close a cycle instead of pruning them.
    pub fn keep_cycles(mut self) -> Self {
        self.prune_cycles = false;
        self
    }

    /// Whether `attribute` of `node` is carried into copies.
    pub fn is_mergeable(&self, node: &N, attribute: &str) -> bool {
        (self.mergeable)(node, attribute)
    }

    /// Cycles encountered by all copies made so far.
    pub fn cycles(&self) -> &[Vec<N>] {
        self.visitor.cycles()
    }

    /// Copy the graph rooted at `root`, returning the root's copy.
    ///
    /// `copier` receives each source node and its lineage and returns the
    /// node's copy. Copies are then linked along the mergeable attributes.
    pub fn copy<F>(&mut self, root: &N, mut copier: F) -> N
    where
        F: FnMut(&N, &[N]) -> N,
    {
        let cycles_before = self.visitor.cycles().len();
        let mut copies: HashMap<N::Id, N> = HashMap::new();
        let mut sources: Vec<N> = Vec::new();

        let root_copy = self.visitor.visit(root, |node, lineage| {
            let copy = copier(node, lineage);
            copies.insert(node.node_id(), copy.clone());
            sources.push(node.clone());
            copy
        });

        let pruned: HashSet<(N::Id, N::Id)> = if self.prune_cycles {
            self.visitor.cycles()[cycles_before..]
                .iter()
                .filter(|cycle| cycle.len() >= 2)
                .map(|cycle| {
                    let parent = &cycle[cycle.len() - 2];
                    let child = &cycle[cycle.len() - 1];
                    (parent.node_id(), child.node_id())
                })
                .collect()
        } else {
            HashSet::new()
        };

        for source in &sources {
            let Some(copy) = copies.get(&source.node_id()) else {
                continue;
            };
            for attribute in self.visitor.attributes(source) {
                let mut linked = Vec::new();
                for child in source.neighbors(&attribute) {
                    if !self.visitor.accepts(source, &attribute, &child) {
                        continue;
                    }
                    if pruned.contains(&(source.node_id(), child.node_id())) {
                        continue;
                    }
                    if let Some(child_copy) = copies.get(&child.node_id()) {
                        linked.push(child_copy.clone());
                    }
                }
                copy.attach(&attribute, linked);
            }
        }

        debug!(nodes = sources.len(), pruned = pruned.len(), "graph copied");
        root_copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{all_edges, names, TestNode};

    fn prime(node: &TestNode, _: &[TestNode]) -> TestNode {
        let copy = TestNode::new(node.node_id() + 100, &format!("{}'", node.name()));
        copy.set_value(node.value());
        copy
    }

    #[test]
    fn copies_tree_structure_and_values() {
        let a = TestNode::with_value(1, "a", 10);
        let b = TestNode::with_value(2, "b", 20);
        let c = TestNode::with_value(3, "c", 30);
        a.link("kids", &b);
        a.link("kids", &c);

        let mut copier = CopyVisitor::new(all_edges, |_, _| true);
        let copy = copier.copy(&a, prime);

        assert_eq!(copy.name(), "a'");
        assert_eq!(copy.value(), Some(10));
        let kids = copy.neighbors("kids");
        assert_eq!(names(&kids), vec!["b'", "c'"]);
        assert_eq!(kids[1].value(), Some(30));
        // The source is untouched.
        assert_eq!(names(&a.neighbors("kids")), vec!["b", "c"]);
    }

    #[test]
    fn shared_node_is_copied_once() {
        let a = TestNode::new(1, "a");
        let b = TestNode::new(2, "b");
        let shared = TestNode::new(3, "s");
        a.link("x", &b);
        a.link("y", &shared);
        b.link("z", &shared);

        let mut copier = CopyVisitor::new(all_edges, |_, _| true);
        let copy = copier.copy(&a, prime);
        let via_y = &copy.neighbors("y")[0];
        let via_b = &copy.neighbors("x")[0].neighbors("z")[0];
        assert_eq!(via_y.node_id(), via_b.node_id());
    }

    #[test]
    fn mergeable_filter_drops_attributes() {
        let a = TestNode::new(1, "a");
        let keep = TestNode::new(2, "keep");
        let drop = TestNode::new(3, "drop");
        a.link("keep", &keep);
        a.link("drop", &drop);

        let mut copier = CopyVisitor::new(all_edges, |_, attribute| attribute != "drop");
        let copy = copier.copy(&a, prime);
        assert_eq!(names(&copy.neighbors("keep")), vec!["keep'"]);
        assert!(copy.neighbors("drop").is_empty());
        assert!(!copier.is_mergeable(&a, "drop"));
    }

    #[test]
    fn retain_filter_drops_members() {
        let a = TestNode::new(1, "a");
        let b = TestNode::with_value(2, "b", 1);
        let c = TestNode::new(3, "c");
        a.link("kids", &b);
        a.link("kids", &c);

        let mut copier = CopyVisitor::new(all_edges, |_, _| true)
            .with_retain(|_, _, child: &TestNode| child.value().is_some());
        let copy = copier.copy(&a, prime);
        assert_eq!(names(&copy.neighbors("kids")), vec!["b'"]);
    }

    #[test]
    fn cycle_closing_edge_is_pruned() {
        let owner = TestNode::new(1, "owner");
        let dependent = TestNode::new(2, "dep");
        owner.link("deps", &dependent);
        dependent.link("owner", &owner);

        let mut copier = CopyVisitor::new(all_edges, |_, _| true);
        let copy = copier.copy(&owner, prime);
        let dep_copy = &copy.neighbors("deps")[0];
        assert!(dep_copy.neighbors("owner").is_empty());
        assert_eq!(copier.cycles().len(), 1);
    }

    #[test]
    fn cycles_can_be_kept() {
        let owner = TestNode::new(1, "owner");
        let dependent = TestNode::new(2, "dep");
        owner.link("deps", &dependent);
        dependent.link("owner", &owner);

        let mut copier = CopyVisitor::new(all_edges, |_, _| true).keep_cycles();
        let copy = copier.copy(&owner, prime);
        let back = &copy.neighbors("deps")[0].neighbors("owner")[0];
        assert_eq!(back.node_id(), copy.node_id());
    }
}
