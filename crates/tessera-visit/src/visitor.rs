//! Depth-first traversal with explicit lineage tracking.
//!
//! [`Visitor`] walks a graph from a root along the attributes selected by a
//! caller-supplied navigator. The traversal is an explicit worklist rather
//! than recursion, so deep graphs cannot overflow the call stack and the
//! lineage (the path from the root to the current node) is always available.
//!
//! # Invariants
//!
//! - Each node is handed to the operator at most once per traversal.
//! - An edge to a node already on the lineage is recorded as a cycle and
//!   never followed.
//! - The operator receives the node and its lineage (root first, parent last).

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;

use tracing::debug;

use crate::node::GraphNode;

type Navigator<'a, N> = Box<dyn Fn(&N) -> Vec<String> + 'a>;
type EdgeFilter<'a, N> = Box<dyn Fn(&N, &str, &N) -> bool + 'a>;

/// When the operator runs relative to a node's children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    /// Operator runs on a node before any of its children.
    #[default]
    PreOrder,
    /// Operator runs on a node after all of its children.
    PostOrder,
}

/// A cycle-aware depth-first graph visitor.
pub struct Visitor<'a, N: GraphNode> {
    navigator: Navigator<'a, N>,
    filter: Option<EdgeFilter<'a, N>>,
    order: Order,
    cycles: Vec<Vec<N>>,
}

struct Frame<N> {
    node: N,
    children: Vec<N>,
    next: usize,
}

/// Per-traversal bookkeeping shared across the roots of one `visit_all`.
struct Traversal<Id, R> {
    results: HashMap<Id, R>,
    entered: HashSet<Id>,
}

impl<Id, R> Default for Traversal<Id, R> {
    fn default() -> Self {
        Self {
            results: HashMap::new(),
            entered: HashSet::new(),
        }
    }
}

impl<'a, N: GraphNode> Visitor<'a, N> {
    /// Create a pre-order visitor navigating the attributes returned by
    /// `navigator` for each node.
    pub fn new(navigator: impl Fn(&N) -> Vec<String> + 'a) -> Self {
        Self {
            navigator: Box::new(navigator),
            filter: None,
            order: Order::PreOrder,
            cycles: Vec::new(),
        }
    }

    /// Set the traversal order.
    pub fn with_order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    /// Only follow edges `(parent, attribute, child)` accepted by `filter`.
    pub fn with_filter(mut self, filter: impl Fn(&N, &str, &N) -> bool + 'a) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// The configured traversal order.
    pub fn order(&self) -> Order {
        self.order
    }

    /// Every cycle encountered so far, each as the lineage from the first
    /// occurrence of the repeated node through the repeat.
    pub fn cycles(&self) -> &[Vec<N>] {
        &self.cycles
    }

    /// Drain the recorded cycles.
    pub fn take_cycles(&mut self) -> Vec<Vec<N>> {
        std::mem::take(&mut self.cycles)
    }

    /// The navigable attributes of `node`.
    pub fn attributes(&self, node: &N) -> Vec<String> {
        (self.navigator)(node)
    }

    /// The nodes directly reachable from `node` along navigable attributes
    /// that pass the edge filter.
    pub fn children(&self, node: &N) -> Vec<N> {
        let mut children = Vec::new();
        for attribute in (self.navigator)(node) {
            for child in node.neighbors(&attribute) {
                if self.accepts(node, &attribute, &child) {
                    children.push(child);
                }
            }
        }
        children
    }

    pub(crate) fn accepts(&self, parent: &N, attribute: &str, child: &N) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter(parent, attribute, child))
    }

    /// Visit the graph rooted at `root`, returning the operator's result for
    /// the root.
    pub fn visit<R, F>(&mut self, root: &N, mut operator: F) -> R
    where
        R: Clone,
        F: FnMut(&N, &[N]) -> R,
    {
        match self.try_visit(root, |node, lineage| Ok::<R, Infallible>(operator(node, lineage))) {
            Ok(result) => result,
            Err(never) => match never {},
        }
    }

    /// Visit each root in turn, returning the results element-wise.
    ///
    /// Nodes shared between roots are visited once; a root reached earlier
    /// yields its cached result.
    pub fn visit_all<R, F>(&mut self, roots: &[N], mut operator: F) -> Vec<R>
    where
        R: Clone,
        F: FnMut(&N, &[N]) -> R,
    {
        match self.try_visit_all(roots, |node, lineage| {
            Ok::<R, Infallible>(operator(node, lineage))
        }) {
            Ok(results) => results,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`visit`](Self::visit). The first operator error
    /// aborts the traversal.
    pub fn try_visit<R, E, F>(&mut self, root: &N, mut operator: F) -> Result<R, E>
    where
        R: Clone,
        F: FnMut(&N, &[N]) -> Result<R, E>,
    {
        let mut traversal = Traversal::default();
        self.traverse(root, &mut traversal, &mut operator)
    }

    /// Fallible variant of [`visit_all`](Self::visit_all).
    pub fn try_visit_all<R, E, F>(&mut self, roots: &[N], mut operator: F) -> Result<Vec<R>, E>
    where
        R: Clone,
        F: FnMut(&N, &[N]) -> Result<R, E>,
    {
        let mut traversal = Traversal::default();
        roots
            .iter()
            .map(|root| self.traverse(root, &mut traversal, &mut operator))
            .collect()
    }

    /// Collect every reachable node in visit order.
    pub fn collect(&mut self, root: &N) -> Vec<N> {
        let mut nodes = Vec::new();
        self.visit(root, |node, _| nodes.push(node.clone()));
        nodes
    }

    /// Collect every node reachable from any of `roots` in visit order.
    pub fn collect_all(&mut self, roots: &[N]) -> Vec<N> {
        let mut nodes = Vec::new();
        self.visit_all(roots, |node, _| nodes.push(node.clone()));
        nodes
    }

    fn traverse<R, E, F>(
        &mut self,
        root: &N,
        traversal: &mut Traversal<N::Id, R>,
        operator: &mut F,
    ) -> Result<R, E>
    where
        R: Clone,
        F: FnMut(&N, &[N]) -> Result<R, E>,
    {
        let root_id = root.node_id();
        if let Some(result) = traversal.results.get(&root_id) {
            return Ok(result.clone());
        }
        traversal.entered.insert(root_id);

        let pre_result = match self.order {
            Order::PreOrder => {
                let result = operator(root, &[])?;
                traversal.results.insert(root_id, result.clone());
                Some(result)
            }
            Order::PostOrder => None,
        };

        let mut lineage: Vec<N> = vec![root.clone()];
        let mut stack: Vec<Frame<N>> = vec![Frame {
            node: root.clone(),
            children: self.children(root),
            next: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.children.len() {
                let child = frame.children[frame.next].clone();
                frame.next += 1;
                let child_id = child.node_id();

                if let Some(position) = lineage.iter().position(|n| n.node_id() == child_id) {
                    let mut cycle = lineage[position..].to_vec();
                    cycle.push(child);
                    debug!(length = cycle.len(), "cycle detected during traversal");
                    self.cycles.push(cycle);
                    continue;
                }
                if !traversal.entered.insert(child_id) {
                    continue;
                }

                if self.order == Order::PreOrder {
                    let result = operator(&child, &lineage)?;
                    traversal.results.insert(child_id, result);
                }
                let children = self.children(&child);
                stack.push(Frame {
                    node: child.clone(),
                    children,
                    next: 0,
                });
                lineage.push(child);
            } else {
                let Some(done) = stack.pop() else { break };
                lineage.pop();
                if stack.is_empty() {
                    break;
                }
                if self.order == Order::PostOrder {
                    let result = operator(&done.node, &lineage)?;
                    traversal.results.insert(done.node.node_id(), result);
                }
            }
        }

        match pre_result {
            Some(result) => Ok(result),
            None => {
                let result = operator(root, &[])?;
                traversal.results.insert(root_id, result.clone());
                Ok(result)
            }
        }
    }
}
