use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::entity::EntityRef;

/// Server-assigned identifier of a persisted entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(u64);

impl Identifier {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identity of one in-memory entity instance.
///
/// Two handles share an `InstanceId` exactly when they point at the same
/// object. Unlike [`Identifier`] it exists before the entity is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Allocate a fresh instance id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A non-reference attribute value in its serializable form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Int(i) => Value::Int(i),
            Scalar::Text(s) => Value::Text(s),
        }
    }
}

/// The value of one entity attribute.
///
/// References hold entity handles, so cloning a value never copies the
/// referenced entities.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Ref(EntityRef),
    Refs(Vec<EntityRef>),
}

impl Value {
    /// `Null` or an empty collection.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Refs(refs) => refs.is_empty(),
            _ => false,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Ref(_) | Value::Refs(_))
    }

    /// The scalar form of a non-reference value.
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Int(i) => Some(Scalar::Int(*i)),
            Value::Text(s) => Some(Scalar::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Value::Ref(entity) => Some(entity),
            _ => None,
        }
    }

    /// Every entity referenced by this value, in order.
    pub fn references(&self) -> Vec<EntityRef> {
        match self {
            Value::Ref(entity) => vec![entity.clone()],
            Value::Refs(refs) => refs.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether `entity` is one of the referenced entities.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match self {
            Value::Ref(e) => e == entity,
            Value::Refs(refs) => refs.contains(entity),
            _ => false,
        }
    }

    /// A short description of the value's shape, used in error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Text(_) => "text",
            Value::Ref(_) => "reference",
            Value::Refs(_) => "reference collection",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<EntityRef> for Value {
    fn from(entity: EntityRef) -> Self {
        Value::Ref(entity)
    }
}

impl From<&EntityRef> for Value {
    fn from(entity: &EntityRef) -> Self {
        Value::Ref(entity.clone())
    }
}

impl From<Vec<EntityRef>> for Value {
    fn from(refs: Vec<EntityRef>) -> Self {
        Value::Refs(refs)
    }
}

/// One component of a derived key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Scalar(Scalar),
    Identifier(Identifier),
    /// A referenced, not yet persisted entity identified by its own key.
    Key(Box<KeyValue>),
}

/// A key derived from an entity: its identifier or a tuple of attribute
/// values.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyValue(Vec<KeyPart>);

impl KeyValue {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn identifier(id: Identifier) -> Self {
        Self(vec![KeyPart::Identifier(id)])
    }

    pub fn text(value: &str) -> Self {
        Self(vec![KeyPart::Scalar(Scalar::Text(value.to_string()))])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match part {
                KeyPart::Scalar(s) => write!(f, "{s}")?,
                KeyPart::Identifier(id) => write!(f, "#{id}")?,
                KeyPart::Key(key) => write!(f, "({key})")?,
            }
        }
        Ok(())
    }
}

/// Which declared key to derive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// The server-assigned identifier.
    Primary,
    Secondary,
    Alternate,
}

impl KeyKind {
    /// Keys in finder preference order.
    pub const ALL: [KeyKind; 3] = [KeyKind::Primary, KeyKind::Secondary, KeyKind::Alternate];
}
