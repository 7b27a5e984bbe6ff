//! Per-type domain metadata.
//!
//! A [`TypeDescriptor`] is the explicit, registered replacement for runtime
//! reflection: it lists a type's attributes with their shape, cardinality,
//! ownership role, cascade rules, and fetch behavior. Descriptors are built
//! once through [`RegistryBuilder`](crate::RegistryBuilder) and never change
//! afterwards.

use std::cell::OnceCell;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::value::{Scalar, Value};

/// Type of a non-reference attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Bool,
    Int,
    Text,
}

impl ScalarType {
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ScalarType::Bool, Value::Bool(_))
                | (ScalarType::Int, Value::Int(_))
                | (ScalarType::Text, Value::Text(_))
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    One,
    Many,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    Scalar(ScalarType),
    Reference { target: String },
}

/// How a reference attribute relates its holder to the referenced entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Non-reference attribute.
    #[default]
    Value,
    /// References the single owner this entity's lifecycle is bound to.
    Owner,
    /// References entities owned by this one.
    Dependent,
    /// References entities with an independent lifecycle.
    Independent,
}

/// How the remote service populates an attribute in fetched graphs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Populated with usable content.
    #[default]
    Eager,
    /// Populated, but with distinct copies of entities the caller may
    /// already hold.
    Unreliable,
    /// Populated with broken stubs that must never be dereferenced.
    Toxic,
    /// Left empty; fetched on demand.
    Lazy,
}

/// Metadata of one attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub kind: AttributeKind,
    pub cardinality: Cardinality,
    pub role: Role,
    pub fetch: FetchMode,
    pub inverse: Option<String>,
    /// Saved as part of the holder's create.
    pub cascaded: bool,
    /// Saved as part of the holder's update.
    pub cascade_update: bool,
    /// Unsaved members are created by the holder's update.
    pub cascade_update_to_create: bool,
    /// The server generates the value on create, ignoring what was sent.
    pub autogenerated: bool,
    pub mandatory: bool,
    /// Tracked by snapshots and carried into update templates.
    pub updatable: bool,
    /// Safe to include in search templates.
    pub searchable: bool,
    pub default: Option<Scalar>,
}

impl AttributeDescriptor {
    /// A scalar attribute.
    pub fn scalar(name: &str, scalar_type: ScalarType) -> Self {
        Self {
            name: name.to_string(),
            kind: AttributeKind::Scalar(scalar_type),
            cardinality: Cardinality::One,
            role: Role::Value,
            fetch: FetchMode::Eager,
            inverse: None,
            cascaded: false,
            cascade_update: false,
            cascade_update_to_create: false,
            autogenerated: false,
            mandatory: false,
            updatable: true,
            searchable: true,
            default: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::scalar(name, ScalarType::Text)
    }

    pub fn int(name: &str) -> Self {
        Self::scalar(name, ScalarType::Int)
    }

    pub fn boolean(name: &str) -> Self {
        Self::scalar(name, ScalarType::Bool)
    }

    /// A reference attribute. Defaults to lazy fetching; singular
    /// references are searchable by key.
    pub fn reference(name: &str, target: &str, cardinality: Cardinality, role: Role) -> Self {
        Self {
            name: name.to_string(),
            kind: AttributeKind::Reference {
                target: target.to_string(),
            },
            cardinality,
            role,
            fetch: FetchMode::Lazy,
            inverse: None,
            cascaded: false,
            cascade_update: false,
            cascade_update_to_create: false,
            autogenerated: false,
            mandatory: false,
            updatable: true,
            searchable: cardinality == Cardinality::One,
            default: None,
        }
    }

    pub fn owner(name: &str, target: &str) -> Self {
        Self::reference(name, target, Cardinality::One, Role::Owner)
    }

    pub fn dependents(name: &str, target: &str) -> Self {
        Self::reference(name, target, Cardinality::Many, Role::Dependent)
    }

    pub fn dependent(name: &str, target: &str) -> Self {
        Self::reference(name, target, Cardinality::One, Role::Dependent)
    }

    pub fn independent(name: &str, target: &str, cardinality: Cardinality) -> Self {
        Self::reference(name, target, cardinality, Role::Independent)
    }

    pub fn with_inverse(mut self, inverse: &str) -> Self {
        self.inverse = Some(inverse.to_string());
        self
    }

    pub fn with_fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn cascaded(mut self) -> Self {
        self.cascaded = true;
        self
    }

    pub fn cascade_update(mut self) -> Self {
        self.cascade_update = true;
        self
    }

    pub fn cascade_update_to_create(mut self) -> Self {
        self.cascade_update_to_create = true;
        self
    }

    pub fn autogenerated(mut self) -> Self {
        self.autogenerated = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub fn searchable(mut self, searchable: bool) -> Self {
        self.searchable = searchable;
        self
    }

    pub fn with_default(mut self, default: Scalar) -> Self {
        self.default = Some(default);
        self
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, AttributeKind::Reference { .. })
    }

    pub fn is_collection(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    /// Referenced type name, for reference attributes.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            AttributeKind::Reference { target } => Some(target),
            AttributeKind::Scalar(_) => None,
        }
    }

    /// The value an attribute is reset to when cleared.
    pub fn empty_value(&self) -> Value {
        if self.is_reference() && self.is_collection() {
            Value::Refs(Vec::new())
        } else {
            Value::Null
        }
    }
}

/// A type that is only persisted as a side effect of saving another type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Type whose create persists this one.
    pub proxy_type: String,
    /// Attribute of the proxy that references the proxied entity.
    pub attribute: String,
}

/// Attribute groupings derived from a descriptor on first use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Introspection {
    pub references: Vec<String>,
    pub owners: Vec<String>,
    pub dependents: Vec<String>,
    pub cascaded: Vec<String>,
    pub independents: Vec<String>,
    /// Attributes tracked by snapshots.
    pub tracked: Vec<String>,
    pub unreliable: Vec<String>,
    pub toxic: Vec<String>,
    pub autogenerated: Vec<String>,
    pub mandatory: Vec<String>,
    pub defaulted: Vec<String>,
}

/// Metadata of one entity type.
#[derive(Debug)]
pub struct TypeDescriptor {
    pub(crate) name: String,
    pub(crate) parent: Option<String>,
    pub(crate) is_abstract: bool,
    /// Own and inherited attributes once registered.
    pub(crate) attributes: Vec<AttributeDescriptor>,
    pub(crate) secondary_key: Vec<String>,
    pub(crate) alternate_key: Vec<String>,
    pub(crate) proxy: Option<ProxyDescriptor>,
    /// This type followed by its ancestors.
    pub(crate) ancestry: Vec<String>,
    pub(crate) introspection: OnceCell<Introspection>,
}

impl TypeDescriptor {
    /// Start describing a type.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            is_abstract: false,
            attributes: Vec::new(),
            secondary_key: Vec::new(),
            alternate_key: Vec::new(),
            proxy: None,
            ancestry: vec![name.to_string()],
            introspection: OnceCell::new(),
        }
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn secondary_key(mut self, attributes: &[&str]) -> Self {
        self.secondary_key = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn alternate_key(mut self, attributes: &[&str]) -> Self {
        self.alternate_key = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn proxied_by(mut self, proxy_type: &str, attribute: &str) -> Self {
        self.proxy = Some(ProxyDescriptor {
            proxy_type: proxy_type.to_string(),
            attribute: attribute.to_string(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn attribute_named(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute_named(name).is_some()
    }

    pub fn secondary_key_attributes(&self) -> &[String] {
        &self.secondary_key
    }

    pub fn alternate_key_attributes(&self) -> &[String] {
        &self.alternate_key
    }

    pub fn proxy(&self) -> Option<&ProxyDescriptor> {
        self.proxy.as_ref()
    }

    /// Whether this type is `name` or one of its descendants.
    pub fn is_a(&self, name: &str) -> bool {
        self.ancestry.iter().any(|a| a == name)
    }

    pub fn ancestry(&self) -> &[String] {
        &self.ancestry
    }

    /// Attribute groupings, computed on first call.
    pub fn introspect(&self) -> &Introspection {
        self.introspection.get_or_init(|| {
            let introspection = self.compute_introspection();
            debug!(
                entity = %self.name,
                references = introspection.references.len(),
                tracked = introspection.tracked.len(),
                "type introspected"
            );
            introspection
        })
    }

    /// Whether [`introspect`](Self::introspect) has run.
    pub fn is_introspected(&self) -> bool {
        self.introspection.get().is_some()
    }

    fn compute_introspection(&self) -> Introspection {
        let mut result = Introspection::default();
        for attribute in &self.attributes {
            let name = attribute.name.clone();
            if attribute.is_reference() {
                result.references.push(name.clone());
                match attribute.role {
                    Role::Owner => result.owners.push(name.clone()),
                    Role::Dependent => result.dependents.push(name.clone()),
                    Role::Independent => result.independents.push(name.clone()),
                    Role::Value => {}
                }
                if attribute.cascaded {
                    result.cascaded.push(name.clone());
                }
                match attribute.fetch {
                    FetchMode::Unreliable => result.unreliable.push(name.clone()),
                    FetchMode::Toxic => result.toxic.push(name.clone()),
                    FetchMode::Eager | FetchMode::Lazy => {}
                }
            }
            if attribute.updatable {
                result.tracked.push(name.clone());
            }
            if attribute.autogenerated {
                result.autogenerated.push(name.clone());
            }
            if attribute.mandatory {
                result.mandatory.push(name.clone());
            }
            if attribute.default.is_some() {
                result.defaulted.push(name);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> TypeDescriptor {
        TypeDescriptor::new("Person")
            .attribute(AttributeDescriptor::text("name").mandatory())
            .attribute(AttributeDescriptor::text("ssn").read_only())
            .attribute(
                AttributeDescriptor::dependents("addresses", "Address")
                    .with_inverse("person")
                    .cascaded()
                    .with_fetch(FetchMode::Eager),
            )
            .attribute(
                AttributeDescriptor::independent("site", "Site", Cardinality::One)
                    .with_fetch(FetchMode::Toxic),
            )
    }

    #[test]
    fn introspection_groups_attributes() {
        let descriptor = person();
        assert!(!descriptor.is_introspected());
        let intro = descriptor.introspect();
        assert_eq!(intro.references, vec!["addresses", "site"]);
        assert_eq!(intro.dependents, vec!["addresses"]);
        assert_eq!(intro.cascaded, vec!["addresses"]);
        assert_eq!(intro.independents, vec!["site"]);
        assert_eq!(intro.toxic, vec!["site"]);
        assert_eq!(intro.mandatory, vec!["name"]);
        assert!(!intro.tracked.contains(&"ssn".to_string()));
        assert!(descriptor.is_introspected());
    }

    #[test]
    fn reference_defaults() {
        let many = AttributeDescriptor::dependents("addresses", "Address");
        assert!(many.is_collection());
        assert!(!many.searchable);
        assert_eq!(many.fetch, FetchMode::Lazy);
        assert_eq!(many.empty_value(), Value::Refs(vec![]));
        assert_eq!(many.target(), Some("Address"));

        let one = AttributeDescriptor::owner("person", "Person");
        assert!(one.searchable);
        assert_eq!(one.empty_value(), Value::Null);
    }

    #[test]
    fn scalar_type_checks_shape() {
        assert!(ScalarType::Text.accepts(&Value::from("x")));
        assert!(ScalarType::Int.accepts(&Value::Null));
        assert!(!ScalarType::Int.accepts(&Value::from("x")));
    }
}
