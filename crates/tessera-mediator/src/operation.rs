//! The stack of in-flight mediator operations.
//!
//! The stack exists for re-entrancy checks only. A create or update of an
//! entity that is already being created or updated further up the stack is
//! illegal, with one exception: a frame marked as delegated has handed its
//! work to the owner's save, and the owner's cascade may reach it again.

use std::fmt;

use tessera_types::EntityRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Find,
    Query,
    Load,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Find => "find",
            OperationKind::Query => "query",
            OperationKind::Load => "load",
        };
        f.write_str(name)
    }
}

/// What an operation works on.
#[derive(Clone, Debug)]
pub enum Subject {
    Entity(EntityRef),
    /// A declarative query string.
    Text(String),
}

impl Subject {
    pub fn is(&self, entity: &EntityRef) -> bool {
        matches!(self, Subject::Entity(subject) if subject == entity)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Entity(entity) => write!(f, "{entity}"),
            Subject::Text(text) => write!(f, "{text:?}"),
        }
    }
}

/// One in-flight operation.
#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OperationKind,
    pub subject: Subject,
    /// Attribute path of a query.
    pub path: Vec<String>,
    delegated: bool,
}

impl Operation {
    pub fn new(kind: OperationKind, subject: &EntityRef) -> Self {
        Self {
            kind,
            subject: Subject::Entity(subject.clone()),
            path: Vec::new(),
            delegated: false,
        }
    }

    /// A query given as text rather than as a template.
    pub fn query_string(query: &str) -> Self {
        Self {
            kind: OperationKind::Query,
            subject: Subject::Text(query.to_string()),
            path: Vec::new(),
            delegated: false,
        }
    }

    pub fn with_path(mut self, path: &[&str]) -> Self {
        self.path = path.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn is_delegated(&self) -> bool {
        self.delegated
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.subject)?;
        if !self.path.is_empty() {
            write!(f, " via {}", self.path.join("."))?;
        }
        if self.delegated {
            f.write_str(" (delegated)")?;
        }
        Ok(())
    }
}

/// How an attempt to enter an operation was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    /// No conflicting frame; the operation proceeds.
    Proceed,
    /// A delegated frame for the same work exists; the caller must return
    /// without doing anything.
    Delegated,
    /// The same work is already in progress.
    Recursive,
}

#[derive(Debug, Default)]
pub struct OperationStack {
    frames: Vec<Operation>,
}

impl OperationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.frames.push(operation);
    }

    pub fn pop(&mut self) -> Option<Operation> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Operation] {
        &self.frames
    }

    /// The frame for `kind` on `subject`, innermost first.
    pub fn in_progress(&self, kind: OperationKind, subject: &EntityRef) -> Option<&Operation> {
        self.frames
            .iter()
            .rev()
            .find(|op| op.kind == kind && op.subject.is(subject))
    }

    /// Whether `subject` is being created or updated anywhere on the stack.
    pub fn is_saving(&self, subject: &EntityRef) -> bool {
        self.frames.iter().any(|op| {
            matches!(op.kind, OperationKind::Create | OperationKind::Update) && op.subject.is(subject)
        })
    }

    /// Decide whether `kind` on `subject` may start.
    pub fn check(&self, kind: OperationKind, subject: &EntityRef) -> Entry {
        match self.in_progress(kind, subject) {
            None => Entry::Proceed,
            Some(op) if op.delegated => Entry::Delegated,
            Some(_) => Entry::Recursive,
        }
    }

    /// Mark the innermost frame as delegated to its owner's save.
    pub fn delegate_top(&mut self) {
        if let Some(top) = self.frames.last_mut() {
            top.delegated = true;
        }
    }

    /// The stack, outermost first.
    pub fn render(&self) -> String {
        if self.frames.is_empty() {
            return "<idle>".to_string();
        }
        self.frames
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" > ")
    }
}
