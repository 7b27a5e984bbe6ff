//! Pairing the nodes of two parallel graphs.
//!
//! A [`MatchVisitor`] walks a source graph and a target graph in lockstep.
//! The roots are always paired. For every navigable attribute of a paired
//! source node, each source member is offered the target members of the same
//! attribute that are still unclaimed; the matcher picks one by index or
//! declines. A [`MergeVisitor`] then folds each target node into its source.

use std::collections::HashSet;

use tracing::debug;

use crate::node::GraphNode;

type Navigator<'a, N> = Box<dyn Fn(&N) -> Vec<String> + 'a>;
type Matcher<'a, N> = Box<dyn Fn(&N, &[N]) -> Option<usize> + 'a>;

/// Outcome of matching a source graph against a target graph.
#[derive(Debug, Clone)]
pub struct MatchResult<N> {
    /// `(source, target)` pairs in source visit order, roots first.
    pub pairs: Vec<(N, N)>,
    /// Source nodes that found no counterpart.
    pub unmatched: Vec<N>,
}

impl<N: GraphNode> MatchResult<N> {
    /// The target paired with `source`, if any.
    pub fn target_of(&self, source: &N) -> Option<&N> {
        let id = source.node_id();
        self.pairs
            .iter()
            .find(|(s, _)| s.node_id() == id)
            .map(|(_, t)| t)
    }

    /// Whether `source` was left unmatched.
    pub fn is_unmatched(&self, source: &N) -> bool {
        let id = source.node_id();
        self.unmatched.iter().any(|n| n.node_id() == id)
    }
}

/// Pair each of `sources` with at most one of `targets`.
///
/// Every claimed target is removed from the candidates offered to later
/// sources, so no target is paired twice. Returns the pairs and the sources
/// left without a counterpart.
pub fn pair_members<N, M>(sources: &[N], targets: &[N], matcher: M) -> (Vec<(N, N)>, Vec<N>)
where
    N: GraphNode,
    M: Fn(&N, &[N]) -> Option<usize>,
{
    let mut candidates = targets.to_vec();
    let mut pairs = Vec::new();
    let mut unmatched = Vec::new();
    for source in sources {
        match matcher(source, &candidates) {
            Some(index) if index < candidates.len() => {
                let target = candidates.remove(index);
                pairs.push((source.clone(), target));
            }
            _ => unmatched.push(source.clone()),
        }
    }
    (pairs, unmatched)
}

/// Pairs the nodes of a source graph with those of a target graph.
pub struct MatchVisitor<'a, N: GraphNode> {
    navigator: Navigator<'a, N>,
    matcher: Matcher<'a, N>,
}

impl<'a, N: GraphNode> MatchVisitor<'a, N> {
    pub fn new(
        navigator: impl Fn(&N) -> Vec<String> + 'a,
        matcher: impl Fn(&N, &[N]) -> Option<usize> + 'a,
    ) -> Self {
        Self {
            navigator: Box::new(navigator),
            matcher: Box::new(matcher),
        }
    }

    /// Match the graph rooted at `source` against the graph rooted at `target`.
    pub fn matches(&self, source: &N, target: &N) -> MatchResult<N> {
        let mut result = MatchResult {
            pairs: vec![(source.clone(), target.clone())],
            unmatched: Vec::new(),
        };
        let mut paired: HashSet<N::Id> = HashSet::from([source.node_id()]);
        let mut claimed: HashSet<N::Id> = HashSet::from([target.node_id()]);
        let mut worklist = vec![(source.clone(), target.clone())];

        while let Some((src, tgt)) = worklist.pop() {
            for attribute in (self.navigator)(&src) {
                let members: Vec<N> = src
                    .neighbors(&attribute)
                    .into_iter()
                    .filter(|m| !paired.contains(&m.node_id()))
                    .collect();
                if members.is_empty() {
                    continue;
                }
                let candidates: Vec<N> = tgt
                    .neighbors(&attribute)
                    .into_iter()
                    .filter(|c| !claimed.contains(&c.node_id()))
                    .collect();
                let (pairs, unmatched) =
                    pair_members(&members, &candidates, |m, c| (self.matcher)(m, c));
                for (s, t) in pairs {
                    paired.insert(s.node_id());
                    claimed.insert(t.node_id());
                    worklist.push((s.clone(), t.clone()));
                    result.pairs.push((s, t));
                }
                for s in unmatched {
                    if paired.insert(s.node_id()) {
                        result.unmatched.push(s);
                    }
                }
            }
        }

        debug!(
            pairs = result.pairs.len(),
            unmatched = result.unmatched.len(),
            "graphs matched"
        );
        result
    }
}

/// Matches two graphs and folds each target node into its source.
pub struct MergeVisitor<'a, N: GraphNode> {
    matcher: MatchVisitor<'a, N>,
}

impl<'a, N: GraphNode> MergeVisitor<'a, N> {
    pub fn new(
        navigator: impl Fn(&N) -> Vec<String> + 'a,
        matcher: impl Fn(&N, &[N]) -> Option<usize> + 'a,
    ) -> Self {
        Self {
            matcher: MatchVisitor::new(navigator, matcher),
        }
    }

    /// Match `target` against `source`, then call `merger(source, target)`
    /// for every pair in visit order. Returns the match outcome.
    pub fn merge<F>(&self, source: &N, target: &N, mut merger: F) -> MatchResult<N>
    where
        F: FnMut(&N, &N),
    {
        let result = self.matcher.matches(source, target);
        for (s, t) in &result.pairs {
            merger(s, t);
        }
        result
    }

    /// Fallible variant of [`merge`](Self::merge); stops at the first error.
    pub fn try_merge<E, F>(&self, source: &N, target: &N, mut merger: F) -> Result<MatchResult<N>, E>
    where
        F: FnMut(&N, &N) -> Result<(), E>,
    {
        let result = self.matcher.matches(source, target);
        for (s, t) in &result.pairs {
            merger(s, t)?;
        }
        Ok(result)
    }
}
