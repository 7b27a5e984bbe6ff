//! Entity instances and the shared handle through which they are accessed.
//!
//! An [`EntityRef`] is a reference-counted handle to one mutable entity.
//! Handle equality is instance identity: two handles are `==` exactly when
//! they point at the same object, which is what the identity cache
//! guarantees for logically equal entities.
//!
//! Deferred loading replaces per-instance method interception. A loader is
//! installed together with the set of attributes it may load; [`EntityRef::get`]
//! consults that set before returning a value, while [`EntityRef::set`]
//! removes the attribute from it so an explicit write always wins.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use tessera_visit::GraphNode;
use tracing::debug;

use crate::error::{TypeError, TypeResult};
use crate::metadata::{AttributeDescriptor, AttributeKind, Role, TypeDescriptor};
use crate::snapshot::{Snapshot, TrackedValue};
use crate::value::{Identifier, InstanceId, KeyKind, KeyPart, KeyValue, Value};

/// Nesting limit for keys that reference other unpersisted entities.
const KEY_DEPTH: usize = 4;

/// Fetches a deferred attribute on first access.
pub trait AttributeLoader {
    /// Produce the value of `attribute` for `entity`.
    ///
    /// Called at most once per installed attribute unless it fails, in
    /// which case the attribute stays loadable.
    fn load(&self, entity: &EntityRef, attribute: &str) -> TypeResult<Value>;
}

pub(crate) struct Entity {
    pub(crate) instance: InstanceId,
    pub(crate) descriptor: Rc<TypeDescriptor>,
    pub(crate) identifier: Option<Identifier>,
    pub(crate) values: BTreeMap<String, Value>,
    pub(crate) snapshot: Option<Snapshot>,
    pub(crate) pending: BTreeSet<String>,
    pub(crate) loader: Option<Rc<dyn AttributeLoader>>,
}

/// Shared handle to an entity.
#[derive(Clone)]
pub struct EntityRef(pub(crate) Rc<RefCell<Entity>>);

impl EntityRef {
    /// A fresh, unpersisted entity of the described type.
    pub fn new(descriptor: Rc<TypeDescriptor>) -> Self {
        Self(Rc::new(RefCell::new(Entity {
            instance: InstanceId::next(),
            descriptor,
            identifier: None,
            values: BTreeMap::new(),
            snapshot: None,
            pending: BTreeSet::new(),
            loader: None,
        })))
    }

    pub fn instance(&self) -> InstanceId {
        self.0.borrow().instance
    }

    pub fn descriptor(&self) -> Rc<TypeDescriptor> {
        Rc::clone(&self.0.borrow().descriptor)
    }

    pub fn type_name(&self) -> String {
        self.0.borrow().descriptor.name().to_string()
    }

    /// Whether this entity's type is `type_name` or a subtype of it.
    pub fn is_a(&self, type_name: &str) -> bool {
        self.0.borrow().descriptor.is_a(type_name)
    }

    /// Metadata of `attribute`.
    pub fn attribute(&self, attribute: &str) -> TypeResult<AttributeDescriptor> {
        let descriptor = self.descriptor();
        descriptor
            .attribute_named(attribute)
            .cloned()
            .ok_or_else(|| TypeError::UnknownAttribute {
                type_name: descriptor.name().to_string(),
                attribute: attribute.to_string(),
            })
    }

    // ---------------------------------------------------------------
    // Identifier
    // ---------------------------------------------------------------

    pub fn identifier(&self) -> Option<Identifier> {
        self.0.borrow().identifier
    }

    pub fn set_identifier(&self, identifier: Option<Identifier>) {
        self.0.borrow_mut().identifier = identifier;
    }

    /// An entity with an identifier has been fetched from or saved to the
    /// remote service.
    pub fn is_persisted(&self) -> bool {
        self.identifier().is_some()
    }

    // ---------------------------------------------------------------
    // Attribute access
    // ---------------------------------------------------------------

    /// The in-memory value, never triggering a deferred load.
    pub fn peek(&self, attribute: &str) -> Value {
        self.0
            .borrow()
            .values
            .get(attribute)
            .cloned()
            .unwrap_or_default()
    }

    /// The value of `attribute`, loading it first if a load is pending.
    pub fn get(&self, attribute: &str) -> TypeResult<Value> {
        self.attribute(attribute)?;
        let loader = {
            let mut entity = self.0.borrow_mut();
            if entity.pending.remove(attribute) {
                entity.loader.clone()
            } else {
                None
            }
        };
        if let Some(loader) = loader {
            match loader.load(self, attribute) {
                Ok(value) => self.store_loaded(attribute, value),
                Err(err) => {
                    self.0.borrow_mut().pending.insert(attribute.to_string());
                    return Err(err);
                }
            }
        }
        Ok(self.peek(attribute))
    }

    /// Assign `attribute`, cancelling any pending load of it.
    pub fn set(&self, attribute: &str, value: impl Into<Value>) -> TypeResult<()> {
        let descriptor = self.attribute(attribute)?;
        let value = self.conform(&descriptor, value.into())?;
        let mut entity = self.0.borrow_mut();
        entity.pending.remove(attribute);
        entity.values.insert(attribute.to_string(), value);
        Ok(())
    }

    /// Assign without shape checks or touching the deferred-load state.
    pub fn set_raw(&self, attribute: &str, value: Value) {
        self.0
            .borrow_mut()
            .values
            .insert(attribute.to_string(), value);
    }

    /// Reset `attribute` to its type's empty value.
    pub fn clear(&self, attribute: &str) -> TypeResult<()> {
        let descriptor = self.attribute(attribute)?;
        self.set_raw(attribute, descriptor.empty_value());
        Ok(())
    }

    /// Append `member` to a collection attribute unless already present.
    pub fn add_to(&self, attribute: &str, member: &EntityRef) -> TypeResult<()> {
        let descriptor = self.attribute(attribute)?;
        if !descriptor.is_collection() {
            return Err(self.wrong_shape(&descriptor, "reference collection", "single add"));
        }
        self.conform(&descriptor, Value::Refs(vec![member.clone()]))?;
        let mut members = self.peek(attribute).references();
        if !members.contains(member) {
            members.push(member.clone());
        }
        let mut entity = self.0.borrow_mut();
        entity.pending.remove(attribute);
        entity
            .values
            .insert(attribute.to_string(), Value::Refs(members));
        Ok(())
    }

    /// Remove `member` from a collection attribute, or clear a singular
    /// reference that points at it.
    pub fn remove_from(&self, attribute: &str, member: &EntityRef) {
        let value = match self.peek(attribute) {
            Value::Ref(current) if &current == member => Value::Null,
            Value::Refs(mut members) => {
                members.retain(|m| m != member);
                Value::Refs(members)
            }
            other => other,
        };
        self.set_raw(attribute, value);
    }

    /// Whether `attribute` holds a non-empty value.
    pub fn is_set(&self, attribute: &str) -> bool {
        !self.peek(attribute).is_empty()
    }

    /// Whether `attribute` has been assigned at all, even an empty value.
    pub fn has_value(&self, attribute: &str) -> bool {
        self.0.borrow().values.contains_key(attribute)
    }

    /// Every `(attribute, entity)` reference edge currently in memory.
    pub fn references(&self) -> Vec<(String, EntityRef)> {
        let descriptor = self.descriptor();
        let mut edges = Vec::new();
        for name in &descriptor.introspect().references {
            for member in self.peek(name).references() {
                edges.push((name.clone(), member));
            }
        }
        edges
    }

    fn conform(&self, descriptor: &AttributeDescriptor, value: Value) -> TypeResult<Value> {
        match &descriptor.kind {
            AttributeKind::Scalar(scalar_type) => {
                if scalar_type.accepts(&value) {
                    Ok(value)
                } else {
                    Err(self.wrong_shape(descriptor, &format!("{scalar_type:?}"), value.shape()))
                }
            }
            AttributeKind::Reference { target } => {
                let value = match value {
                    Value::Null if descriptor.is_collection() => Value::Refs(Vec::new()),
                    other => other,
                };
                let fits = match (&value, descriptor.is_collection()) {
                    (Value::Null, false) => true,
                    (Value::Ref(member), false) => member.is_a(target),
                    (Value::Refs(members), true) => members.iter().all(|m| m.is_a(target)),
                    _ => false,
                };
                if fits {
                    Ok(value)
                } else {
                    let expected = if descriptor.is_collection() {
                        format!("collection of {target}")
                    } else {
                        target.clone()
                    };
                    Err(self.wrong_shape(descriptor, &expected, &describe(&value)))
                }
            }
        }
    }

    fn wrong_shape(&self, descriptor: &AttributeDescriptor, expected: &str, actual: &str) -> TypeError {
        TypeError::WrongShape {
            type_name: self.type_name(),
            attribute: descriptor.name.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    // ---------------------------------------------------------------
    // Deferred loading
    // ---------------------------------------------------------------

    /// Install `loader` for `attributes`. Attributes already holding a value
    /// are skipped.
    pub fn install_loader(&self, loader: Rc<dyn AttributeLoader>, attributes: &[String]) {
        let loadable: Vec<String> = attributes
            .iter()
            .filter(|a| !self.is_set(a))
            .cloned()
            .collect();
        if loadable.is_empty() {
            return;
        }
        let mut entity = self.0.borrow_mut();
        entity.pending.extend(loadable);
        entity.loader = Some(loader);
    }

    /// Drop the loader and every pending load.
    pub fn remove_loader(&self) {
        let mut entity = self.0.borrow_mut();
        entity.pending.clear();
        entity.loader = None;
    }

    /// Whether `attribute` has no pending load.
    pub fn is_loaded(&self, attribute: &str) -> bool {
        !self.0.borrow().pending.contains(attribute)
    }

    pub fn pending_attributes(&self) -> Vec<String> {
        self.0.borrow().pending.iter().cloned().collect()
    }

    /// Record a loaded value, folding it into the snapshot so a load never
    /// reads as a change.
    pub fn store_loaded(&self, attribute: &str, value: Value) {
        let tracked = self
            .descriptor()
            .attribute_named(attribute)
            .is_some_and(|a| a.updatable);
        let digest = TrackedValue::of(&value);
        let mut entity = self.0.borrow_mut();
        entity.pending.remove(attribute);
        entity.values.insert(attribute.to_string(), value);
        if tracked {
            if let Some(snapshot) = entity.snapshot.as_mut() {
                snapshot.insert(attribute, digest);
            }
        }
    }

    // ---------------------------------------------------------------
    // Keys
    // ---------------------------------------------------------------

    /// Attributes that make up the given key. The primary key is the
    /// identifier and has none.
    pub fn key_attributes(&self, kind: KeyKind) -> Vec<String> {
        let descriptor = self.descriptor();
        match kind {
            KeyKind::Primary => Vec::new(),
            KeyKind::Secondary => descriptor.secondary_key_attributes().to_vec(),
            KeyKind::Alternate => descriptor.alternate_key_attributes().to_vec(),
        }
    }

    /// Derive the given key, or `None` if any part of it is missing.
    pub fn key(&self, kind: KeyKind) -> Option<KeyValue> {
        self.key_at_depth(kind, 0)
    }

    fn key_at_depth(&self, kind: KeyKind, depth: usize) -> Option<KeyValue> {
        if kind == KeyKind::Primary {
            return self.identifier().map(KeyValue::identifier);
        }
        let attributes = self.key_attributes(kind);
        if attributes.is_empty() {
            return None;
        }
        let mut parts = Vec::with_capacity(attributes.len());
        for attribute in &attributes {
            parts.push(key_part(&self.peek(attribute), depth)?);
        }
        Some(KeyValue::new(parts))
    }

    /// The first derivable key in primary, secondary, alternate order.
    pub fn any_key(&self) -> Option<(KeyKind, KeyValue)> {
        KeyKind::ALL
            .iter()
            .find_map(|kind| self.key(*kind).map(|key| (*kind, key)))
    }

    /// Whether `other` denotes the same logical entity.
    ///
    /// Types must be compatible. Keys are compared in primary, secondary,
    /// alternate order; the first key both sides can derive decides.
    pub fn matches(&self, other: &EntityRef) -> bool {
        if self == other {
            return true;
        }
        let compatible = self.is_a(&other.type_name()) || other.is_a(&self.type_name());
        if !compatible {
            return false;
        }
        for kind in KeyKind::ALL {
            if let (Some(a), Some(b)) = (self.key(kind), other.key(kind)) {
                return a == b;
            }
        }
        false
    }

    /// A new entity carrying only the identifier and key attributes.
    ///
    /// Referenced key parts are themselves reduced to key-only copies.
    pub fn key_only_copy(&self) -> EntityRef {
        self.key_only_copy_at(0)
    }

    fn key_only_copy_at(&self, depth: usize) -> EntityRef {
        let copy = EntityRef::new(self.descriptor());
        copy.set_identifier(self.identifier());
        let mut attributes = self.key_attributes(KeyKind::Secondary);
        attributes.extend(self.key_attributes(KeyKind::Alternate));
        for attribute in attributes {
            let value = match self.peek(&attribute) {
                Value::Ref(target) if depth < KEY_DEPTH => {
                    Value::Ref(target.key_only_copy_at(depth + 1))
                }
                Value::Ref(_) | Value::Refs(_) => continue,
                scalar => scalar,
            };
            copy.set_raw(&attribute, value);
        }
        copy
    }

    /// Copy the identifier and non-reference values of `source` into this
    /// entity. With `overwrite` false only empty values are filled.
    pub fn copy_scalars_from(&self, source: &EntityRef, overwrite: bool) {
        if self == source {
            return;
        }
        let descriptor = self.descriptor();
        if self.identifier().is_none() || overwrite {
            if let Some(id) = source.identifier() {
                self.set_identifier(Some(id));
            }
        }
        for attribute in descriptor.attributes() {
            if attribute.is_reference() || !source.descriptor().has_attribute(&attribute.name) {
                continue;
            }
            let incoming = source.peek(&attribute.name);
            if incoming.is_empty() {
                continue;
            }
            if overwrite || self.peek(&attribute.name).is_empty() {
                self.set_raw(&attribute.name, incoming);
            }
        }
    }

    // ---------------------------------------------------------------
    // Ownership
    // ---------------------------------------------------------------

    /// The owner reference that is set, if any.
    pub fn owner(&self) -> Option<(String, EntityRef)> {
        let descriptor = self.descriptor();
        descriptor
            .introspect()
            .owners
            .iter()
            .find_map(|name| self.peek(name).as_entity().map(|o| (name.clone(), o.clone())))
    }

    /// Loaded dependents with the attribute that holds each.
    pub fn dependents(&self) -> Vec<(String, EntityRef)> {
        let descriptor = self.descriptor();
        let mut result = Vec::new();
        for name in &descriptor.introspect().dependents {
            for member in self.peek(name).references() {
                result.push((name.clone(), member));
            }
        }
        result
    }

    /// Mandatory attributes without a value.
    pub fn missing_mandatory(&self) -> Vec<String> {
        let descriptor = self.descriptor();
        descriptor
            .introspect()
            .mandatory
            .iter()
            .filter(|name| !self.is_set(name))
            .cloned()
            .collect()
    }

    /// Assign declared defaults to empty attributes. Returns the attributes
    /// that received a default.
    pub fn apply_defaults(&self) -> Vec<String> {
        let descriptor = self.descriptor();
        let mut applied = Vec::new();
        for attribute in descriptor.attributes() {
            let Some(default) = &attribute.default else {
                continue;
            };
            if !self.is_set(&attribute.name) {
                self.set_raw(&attribute.name, Value::from(default.clone()));
                applied.push(attribute.name.clone());
            }
        }
        if !applied.is_empty() {
            debug!(entity = %self, attributes = ?applied, "defaults applied");
        }
        applied
    }

    /// Whether `attribute` is a reference with the given role.
    pub fn has_role(&self, attribute: &str, role: Role) -> bool {
        self.descriptor()
            .attribute_named(attribute)
            .is_some_and(|a| a.role == role)
    }
}

fn key_part(value: &Value, depth: usize) -> Option<KeyPart> {
    match value {
        Value::Null | Value::Refs(_) => None,
        Value::Ref(target) => match target.identifier() {
            Some(id) => Some(KeyPart::Identifier(id)),
            None if depth < KEY_DEPTH => target
                .key_at_depth(KeyKind::Secondary, depth + 1)
                .map(|key| KeyPart::Key(Box::new(key))),
            None => None,
        },
        scalar => scalar.as_scalar().map(KeyPart::Scalar),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Ref(entity) => entity.type_name(),
        other => other.shape().to_string(),
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance().hash(state);
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entity = self.0.borrow();
        match entity.identifier {
            Some(id) => write!(f, "{}(id={})", entity.descriptor.name(), id),
            None => write!(f, "{}(new{})", entity.descriptor.name(), entity.instance),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl GraphNode for EntityRef {
    type Id = InstanceId;

    fn node_id(&self) -> InstanceId {
        self.instance()
    }

    fn neighbors(&self, attribute: &str) -> Vec<Self> {
        self.peek(attribute).references()
    }

    fn attach(&self, attribute: &str, nodes: Vec<Self>) {
        let many = self
            .descriptor()
            .attribute_named(attribute)
            .is_some_and(AttributeDescriptor::is_collection);
        let value = if many {
            Value::Refs(nodes)
        } else {
            nodes.into_iter().next().map_or(Value::Null, Value::Ref)
        };
        self.set_raw(attribute, value);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::registry::Registry;
    use crate::testing::sample_registry;

    struct CountingLoader {
        calls: Cell<usize>,
        fail: bool,
        value: Value,
    }

    impl AttributeLoader for CountingLoader {
        fn load(&self, _: &EntityRef, attribute: &str) -> TypeResult<Value> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                Err(TypeError::LoadFailed {
                    attribute: attribute.to_string(),
                    reason: "offline".into(),
                })
            } else {
                Ok(self.value.clone())
            }
        }
    }

    fn loader(value: Value, fail: bool) -> Rc<CountingLoader> {
        Rc::new(CountingLoader {
            calls: Cell::new(0),
            fail,
            value,
        })
    }

    fn person(registry: &Registry, name: &str) -> EntityRef {
        let p = registry.instantiate("Person").unwrap();
        p.set("name", name).unwrap();
        p
    }

    // ----------------------------------------------------------
    // Access and shape checks
    // ----------------------------------------------------------

    #[test]
    fn handle_equality_is_identity() {
        let registry = sample_registry();
        let a = person(&registry, "Ann");
        let b = person(&registry, "Ann");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.matches(&b));
    }

    #[test]
    fn set_rejects_wrong_shapes() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        assert!(matches!(p.set("name", 3i64), Err(TypeError::WrongShape { .. })));
        let site = registry.instantiate("Site").unwrap();
        assert!(p.set("addresses", Value::Ref(site.clone())).is_err());
        assert!(matches!(
            p.set("nickname", "x"),
            Err(TypeError::UnknownAttribute { .. })
        ));
        p.set("site", &site).unwrap();
        assert_eq!(p.peek("site"), Value::Ref(site));
    }

    #[test]
    fn null_collection_is_normalized() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        assert!(!p.has_value("addresses"));
        p.set("addresses", Value::Null).unwrap();
        assert_eq!(p.peek("addresses"), Value::Refs(vec![]));
        assert!(p.has_value("addresses"));
        assert!(!p.is_set("addresses"));
    }

    #[test]
    fn add_to_skips_duplicates() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        let a = registry.instantiate("Address").unwrap();
        p.add_to("addresses", &a).unwrap();
        p.add_to("addresses", &a).unwrap();
        assert_eq!(p.peek("addresses").references().len(), 1);
        p.remove_from("addresses", &a);
        assert!(!p.is_set("addresses"));
    }

    // ----------------------------------------------------------
    // Deferred loading
    // ----------------------------------------------------------

    #[test]
    fn loader_runs_once() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        let site = registry.instantiate("Site").unwrap();
        let l = loader(Value::Ref(site.clone()), false);
        p.install_loader(l.clone(), &["site".to_string()]);
        assert!(!p.is_loaded("site"));

        assert_eq!(p.get("site").unwrap(), Value::Ref(site.clone()));
        assert_eq!(p.get("site").unwrap(), Value::Ref(site));
        assert_eq!(l.calls.get(), 1);
        assert!(p.is_loaded("site"));
    }

    #[test]
    fn write_suppresses_load() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        let l = loader(Value::Null, false);
        p.install_loader(l.clone(), &["site".to_string()]);
        let site = registry.instantiate("Site").unwrap();
        p.set("site", &site).unwrap();
        assert_eq!(p.get("site").unwrap(), Value::Ref(site));
        assert_eq!(l.calls.get(), 0);
    }

    #[test]
    fn failed_load_stays_pending() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        let l = loader(Value::Null, true);
        p.install_loader(l.clone(), &["site".to_string()]);
        assert!(p.get("site").is_err());
        assert!(!p.is_loaded("site"));
        assert!(p.get("site").is_err());
        assert_eq!(l.calls.get(), 2);
    }

    #[test]
    fn loader_skips_set_attributes() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        let site = registry.instantiate("Site").unwrap();
        p.set("site", &site).unwrap();
        p.install_loader(loader(Value::Null, false), &["site".to_string()]);
        assert!(p.is_loaded("site"));
    }

    #[test]
    fn loaded_value_does_not_read_as_change() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        p.set_identifier(Some(Identifier::new(1)));
        let site = registry.instantiate("Site").unwrap();
        site.set_identifier(Some(Identifier::new(9)));
        p.install_loader(loader(Value::Ref(site), false), &["site".to_string()]);
        p.take_snapshot();
        p.get("site").unwrap();
        assert!(!p.is_changed());
    }

    // ----------------------------------------------------------
    // Keys
    // ----------------------------------------------------------

    #[test]
    fn keys_by_kind() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        assert_eq!(p.key(KeyKind::Primary), None);
        assert_eq!(p.key(KeyKind::Secondary), Some(KeyValue::text("Ann")));
        p.set_identifier(Some(Identifier::new(5)));
        assert_eq!(p.any_key().map(|(k, _)| k), Some(KeyKind::Primary));
    }

    #[test]
    fn reference_key_part_uses_owner_key() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        let a = registry.instantiate("Address").unwrap();
        a.set("kind", "home").unwrap();
        a.set("person", &p).unwrap();
        let unsaved = a.key(KeyKind::Secondary).unwrap();
        p.set_identifier(Some(Identifier::new(2)));
        let saved = a.key(KeyKind::Secondary).unwrap();
        assert_ne!(unsaved, saved);
        assert_eq!(saved.parts()[1], KeyPart::Identifier(Identifier::new(2)));
    }

    #[test]
    fn key_only_copy_drops_other_attributes() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        p.set("age", 40i64).unwrap();
        p.set_identifier(Some(Identifier::new(3)));
        let copy = p.key_only_copy();
        assert_ne!(copy, p);
        assert_eq!(copy.identifier(), Some(Identifier::new(3)));
        assert_eq!(copy.peek("name"), Value::from("Ann"));
        assert_eq!(copy.peek("age"), Value::Null);
    }

    #[test]
    fn copy_scalars_fills_missing_only() {
        let registry = sample_registry();
        let target = person(&registry, "Ann");
        let source = person(&registry, "Bob");
        source.set("age", 41i64).unwrap();
        source.set_identifier(Some(Identifier::new(8)));
        target.copy_scalars_from(&source, false);
        assert_eq!(target.peek("name"), Value::from("Ann"));
        assert_eq!(target.peek("age"), Value::Int(41));
        assert_eq!(target.identifier(), Some(Identifier::new(8)));
    }

    #[test]
    fn defaults_and_mandatory() {
        let registry = sample_registry();
        let p = registry.instantiate("Person").unwrap();
        assert_eq!(p.missing_mandatory(), vec!["name"]);
        assert_eq!(p.apply_defaults(), vec!["status"]);
        assert_eq!(p.peek("status"), Value::from("active"));
        assert!(p.apply_defaults().is_empty());
    }

    #[test]
    fn owner_and_dependents() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        let a = registry.instantiate("Address").unwrap();
        a.set("person", &p).unwrap();
        p.add_to("addresses", &a).unwrap();
        assert_eq!(a.owner().map(|(_, o)| o), Some(p.clone()));
        assert_eq!(p.dependents(), vec![("addresses".to_string(), a)]);
    }

    #[test]
    fn display_shows_type_and_id() {
        let registry = sample_registry();
        let p = person(&registry, "Ann");
        assert!(p.to_string().starts_with("Person(new@"));
        p.set_identifier(Some(Identifier::new(3)));
        assert_eq!(p.to_string(), "Person(id=3)");
    }
}
