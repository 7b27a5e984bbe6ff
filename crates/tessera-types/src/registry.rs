//! The validated, immutable set of domain type descriptors.
//!
//! Building a [`Registry`] resolves inheritance (subtypes carry their
//! ancestors' attributes), checks every cross-reference, and computes the
//! owner-before-dependent processing order used to sequence batch saves.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use tracing::debug;

use crate::entity::EntityRef;
use crate::error::{MetadataError, MetadataResult, TypeError, TypeResult};
use crate::metadata::{AttributeDescriptor, Cardinality, Role, TypeDescriptor};

/// Registered domain metadata.
#[derive(Debug)]
pub struct Registry {
    types: BTreeMap<String, Rc<TypeDescriptor>>,
    order: Vec<String>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn get(&self, type_name: &str) -> Option<&Rc<TypeDescriptor>> {
        self.types.get(type_name)
    }

    pub fn descriptor(&self, type_name: &str) -> TypeResult<Rc<TypeDescriptor>> {
        self.types
            .get(type_name)
            .cloned()
            .ok_or_else(|| TypeError::UnknownType(type_name.to_string()))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// A new, empty entity of a concrete type.
    pub fn instantiate(&self, type_name: &str) -> TypeResult<EntityRef> {
        let descriptor = self.descriptor(type_name)?;
        if descriptor.is_abstract() {
            return Err(TypeError::AbstractType(type_name.to_string()));
        }
        Ok(EntityRef::new(descriptor))
    }

    pub fn is_subtype_of(&self, sub: &str, sup: &str) -> bool {
        self.types.get(sub).is_some_and(|d| d.is_a(sup))
    }

    /// `type_name` and all of its descendants.
    pub fn subtypes(&self, type_name: &str) -> Vec<String> {
        self.types
            .values()
            .filter(|d| d.is_a(type_name))
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Type names with owners before their dependents.
    pub fn dependency_order(&self) -> &[String] {
        &self.order
    }

    /// Position of `type_name` in [`dependency_order`](Self::dependency_order).
    /// Unknown types sort last.
    pub fn dependency_rank(&self, type_name: &str) -> usize {
        self.order
            .iter()
            .position(|t| t == type_name)
            .unwrap_or(usize::MAX)
    }
}

/// Collects type descriptors and validates them into a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: Vec<TypeDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, descriptor: TypeDescriptor) -> Self {
        self.types.push(descriptor);
        self
    }

    pub fn build(self) -> MetadataResult<Registry> {
        let mut declared: BTreeMap<String, TypeDescriptor> = BTreeMap::new();
        for descriptor in self.types {
            if declared.contains_key(descriptor.name()) {
                return Err(MetadataError::DuplicateType(descriptor.name().to_string()));
            }
            declared.insert(descriptor.name().to_string(), descriptor);
        }

        let mut ancestries: HashMap<String, Vec<String>> = HashMap::new();
        for name in declared.keys() {
            ancestries.insert(name.clone(), ancestry_of(name, &declared)?);
        }

        let mut resolved: BTreeMap<String, TypeDescriptor> = BTreeMap::new();
        for (name, descriptor) in &declared {
            let ancestry = &ancestries[name];
            let mut attributes: Vec<AttributeDescriptor> = Vec::new();
            for ancestor in ancestry.iter().rev() {
                for attribute in &declared[ancestor].attributes {
                    match attributes.iter_mut().find(|a| a.name == attribute.name) {
                        Some(existing) => *existing = attribute.clone(),
                        None => attributes.push(attribute.clone()),
                    }
                }
            }
            let mut full = TypeDescriptor::new(name);
            full.parent = descriptor.parent.clone();
            full.is_abstract = descriptor.is_abstract;
            full.attributes = attributes;
            full.secondary_key = inherited_key(ancestry, &declared, |d| &d.secondary_key);
            full.alternate_key = inherited_key(ancestry, &declared, |d| &d.alternate_key);
            full.proxy = descriptor.proxy.clone();
            full.ancestry = ancestry.clone();
            resolved.insert(name.clone(), full);
        }

        for descriptor in resolved.values() {
            validate(descriptor, &resolved)?;
        }
        let order = dependency_order(&resolved)?;

        debug!(types = resolved.len(), "registry built");
        Ok(Registry {
            types: resolved
                .into_iter()
                .map(|(name, descriptor)| (name, Rc::new(descriptor)))
                .collect(),
            order,
        })
    }
}

fn ancestry_of(name: &str, declared: &BTreeMap<String, TypeDescriptor>) -> MetadataResult<Vec<String>> {
    let mut ancestry = vec![name.to_string()];
    let mut current = &declared[name];
    while let Some(parent) = &current.parent {
        if ancestry.contains(parent) {
            return Err(MetadataError::InheritanceCycle(name.to_string()));
        }
        current = declared.get(parent).ok_or_else(|| MetadataError::UnknownParent {
            type_name: current.name().to_string(),
            parent: parent.clone(),
        })?;
        ancestry.push(parent.clone());
    }
    Ok(ancestry)
}

/// The nearest declared key along the ancestry.
fn inherited_key(
    ancestry: &[String],
    declared: &BTreeMap<String, TypeDescriptor>,
    key: impl Fn(&TypeDescriptor) -> &Vec<String>,
) -> Vec<String> {
    ancestry
        .iter()
        .map(|name| key(&declared[name]))
        .find(|k| !k.is_empty())
        .cloned()
        .unwrap_or_default()
}

fn validate(descriptor: &TypeDescriptor, types: &BTreeMap<String, TypeDescriptor>) -> MetadataResult<()> {
    let type_name = descriptor.name().to_string();
    for attribute in descriptor.attributes() {
        if attribute.role == Role::Owner && (!attribute.is_reference() || attribute.cardinality != Cardinality::One) {
            return Err(MetadataError::InvalidOwner {
                type_name,
                attribute: attribute.name.clone(),
            });
        }
        let Some(target) = attribute.target() else {
            continue;
        };
        let Some(target_type) = types.get(target) else {
            return Err(MetadataError::UnknownTarget {
                type_name,
                attribute: attribute.name.clone(),
                target: target.to_string(),
            });
        };
        if let Some(inverse) = &attribute.inverse {
            let points_back = target_type
                .attribute_named(inverse)
                .and_then(AttributeDescriptor::target)
                .is_some_and(|back| descriptor.is_a(back) || types.get(back).is_some_and(|b| b.is_a(&type_name)));
            if !points_back {
                return Err(MetadataError::BadInverse {
                    type_name,
                    attribute: attribute.name.clone(),
                    inverse: inverse.clone(),
                });
            }
        }
    }

    for key_attribute in descriptor.secondary_key.iter().chain(&descriptor.alternate_key) {
        if !descriptor.has_attribute(key_attribute) {
            return Err(MetadataError::UnknownKeyAttribute {
                type_name,
                attribute: key_attribute.clone(),
            });
        }
    }

    if let Some(proxy) = descriptor.proxy() {
        let Some(proxy_type) = types.get(&proxy.proxy_type) else {
            return Err(MetadataError::BadProxy {
                type_name,
                reason: format!("unknown proxy type {}", proxy.proxy_type),
            });
        };
        let references_us = proxy_type
            .attribute_named(&proxy.attribute)
            .and_then(AttributeDescriptor::target)
            .is_some_and(|target| descriptor.is_a(target));
        if !references_us {
            return Err(MetadataError::BadProxy {
                type_name,
                reason: format!("{}.{} does not reference it", proxy.proxy_type, proxy.attribute),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm over owner -> dependent edges, ties broken by name.
fn dependency_order(types: &BTreeMap<String, TypeDescriptor>) -> MetadataResult<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = types.keys().map(|n| (n.as_str(), 0)).collect();
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for (name, descriptor) in types {
        for attribute in descriptor.attributes() {
            if attribute.role != Role::Owner {
                continue;
            }
            let Some(owner) = attribute.target() else {
                continue;
            };
            if descriptor.is_a(owner) {
                continue;
            }
            // Every concrete owner type precedes this dependent.
            for (owner_name, owner_type) in types {
                if owner_type.is_a(owner) && seen.insert((owner_name.as_str(), name.as_str())) {
                    edges.entry(owner_name.as_str()).or_default().push(name.as_str());
                    if let Some(degree) = in_degree.get_mut(name.as_str()) {
                        *degree += 1;
                    }
                }
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(types.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        for &dependent in edges.get(name).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if order.len() < types.len() {
        let stuck = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(MetadataError::OwnershipCycle(stuck));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FetchMode;
    use crate::testing::sample_registry;

    fn rank(registry: &Registry, name: &str) -> usize {
        registry.dependency_rank(name)
    }

    #[test]
    fn owners_precede_dependents() {
        let registry = sample_registry();
        assert!(rank(&registry, "Person") < rank(&registry, "Address"));
        assert_eq!(registry.dependency_order().len(), registry.len());
        assert_eq!(rank(&registry, "Nope"), usize::MAX);
    }

    #[test]
    fn subtypes_inherit_attributes_and_keys() {
        let registry = Registry::builder()
            .entity(
                TypeDescriptor::new("Specimen")
                    .abstract_type()
                    .attribute(AttributeDescriptor::text("label"))
                    .secondary_key(&["label"]),
            )
            .entity(
                TypeDescriptor::new("TissueSpecimen")
                    .extends("Specimen")
                    .attribute(AttributeDescriptor::text("tissue")),
            )
            .build()
            .unwrap();
        let tissue = registry.descriptor("TissueSpecimen").unwrap();
        assert!(tissue.has_attribute("label"));
        assert_eq!(tissue.secondary_key_attributes(), ["label".to_string()]);
        assert!(registry.is_subtype_of("TissueSpecimen", "Specimen"));
        assert_eq!(registry.subtypes("Specimen"), vec!["Specimen", "TissueSpecimen"]);
        assert!(matches!(
            registry.instantiate("Specimen"),
            Err(TypeError::AbstractType(_))
        ));
        assert!(registry.instantiate("TissueSpecimen").is_ok());
    }

    #[test]
    fn dependents_of_abstract_owner_follow_every_subtype() {
        let registry = Registry::builder()
            .entity(TypeDescriptor::new("Holder").abstract_type())
            .entity(TypeDescriptor::new("Bank").extends("Holder"))
            .entity(
                TypeDescriptor::new("Slot")
                    .attribute(AttributeDescriptor::owner("holder", "Holder")),
            )
            .build()
            .unwrap();
        assert!(rank(&registry, "Bank") < rank(&registry, "Slot"));
        assert!(rank(&registry, "Holder") < rank(&registry, "Slot"));
    }

    #[test]
    fn rejects_unknown_target() {
        let err = Registry::builder()
            .entity(
                TypeDescriptor::new("A")
                    .attribute(AttributeDescriptor::independent("b", "B", Cardinality::One)),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnknownTarget { .. }));
    }

    #[test]
    fn rejects_bad_inverse() {
        let err = Registry::builder()
            .entity(
                TypeDescriptor::new("A")
                    .attribute(AttributeDescriptor::dependents("bs", "B").with_inverse("missing")),
            )
            .entity(TypeDescriptor::new("B"))
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::BadInverse { .. }));
    }

    #[test]
    fn rejects_collection_owner() {
        let err = Registry::builder()
            .entity(TypeDescriptor::new("A"))
            .entity(TypeDescriptor::new("B").attribute(AttributeDescriptor::reference(
                "owners",
                "A",
                Cardinality::Many,
                Role::Owner,
            )))
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidOwner { .. }));
    }

    #[test]
    fn rejects_unknown_key_attribute() {
        let err = Registry::builder()
            .entity(TypeDescriptor::new("A").secondary_key(&["code"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnknownKeyAttribute { .. }));
    }

    #[test]
    fn rejects_ownership_cycle() {
        let err = Registry::builder()
            .entity(TypeDescriptor::new("A").attribute(AttributeDescriptor::owner("b", "B")))
            .entity(TypeDescriptor::new("B").attribute(AttributeDescriptor::owner("a", "A")))
            .build()
            .unwrap_err();
        assert_eq!(err, MetadataError::OwnershipCycle(vec!["A".into(), "B".into()]));
    }

    #[test]
    fn self_ownership_is_allowed() {
        let registry = Registry::builder()
            .entity(
                TypeDescriptor::new("Folder")
                    .attribute(AttributeDescriptor::owner("parent", "Folder"))
                    .attribute(AttributeDescriptor::dependents("children", "Folder").with_fetch(FetchMode::Lazy)),
            )
            .build()
            .unwrap();
        assert_eq!(registry.dependency_order(), ["Folder".to_string()]);
    }

    #[test]
    fn rejects_duplicates_and_unknown_parents() {
        let dup = Registry::builder()
            .entity(TypeDescriptor::new("A"))
            .entity(TypeDescriptor::new("A"))
            .build()
            .unwrap_err();
        assert_eq!(dup, MetadataError::DuplicateType("A".into()));

        let orphan = Registry::builder()
            .entity(TypeDescriptor::new("A").extends("Z"))
            .build()
            .unwrap_err();
        assert!(matches!(orphan, MetadataError::UnknownParent { .. }));
    }

    #[test]
    fn rejects_proxy_that_does_not_reference_type() {
        let err = Registry::builder()
            .entity(TypeDescriptor::new("Consent").proxied_by("Event", "note"))
            .entity(TypeDescriptor::new("Event").attribute(AttributeDescriptor::text("note")))
            .build()
            .unwrap_err();
        assert!(matches!(err, MetadataError::BadProxy { .. }));
    }
}
