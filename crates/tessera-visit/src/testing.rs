//! A minimal mutable graph used by this crate's tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::node::GraphNode;

#[derive(Clone)]
pub(crate) struct TestNode(Rc<RefCell<Inner>>);

struct Inner {
    id: u32,
    name: String,
    value: Option<i64>,
    edges: BTreeMap<String, Vec<TestNode>>,
}

impl TestNode {
    pub(crate) fn new(id: u32, name: &str) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            id,
            name: name.to_string(),
            value: None,
            edges: BTreeMap::new(),
        })))
    }

    pub(crate) fn with_value(id: u32, name: &str, value: i64) -> Self {
        let node = Self::new(id, name);
        node.set_value(Some(value));
        node
    }

    pub(crate) fn link(&self, attribute: &str, target: &TestNode) {
        self.0
            .borrow_mut()
            .edges
            .entry(attribute.to_string())
            .or_default()
            .push(target.clone());
    }

    pub(crate) fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub(crate) fn value(&self) -> Option<i64> {
        self.0.borrow().value
    }

    pub(crate) fn set_value(&self, value: Option<i64>) {
        self.0.borrow_mut().value = value;
    }

    pub(crate) fn edge_names(&self) -> Vec<String> {
        self.0.borrow().edges.keys().cloned().collect()
    }
}

impl GraphNode for TestNode {
    type Id = u32;

    fn node_id(&self) -> u32 {
        self.0.borrow().id
    }

    fn neighbors(&self, attribute: &str) -> Vec<Self> {
        self.0
            .borrow()
            .edges
            .get(attribute)
            .cloned()
            .unwrap_or_default()
    }

    fn attach(&self, attribute: &str, nodes: Vec<Self>) {
        self.0
            .borrow_mut()
            .edges
            .insert(attribute.to_string(), nodes);
    }
}

pub(crate) fn all_edges(node: &TestNode) -> Vec<String> {
    node.edge_names()
}

pub(crate) fn names(nodes: &[TestNode]) -> Vec<String> {
    nodes.iter().map(TestNode::name).collect()
}
