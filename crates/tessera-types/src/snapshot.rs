//! Snapshot-based change tracking.
//!
//! A [`Snapshot`] maps each tracked attribute to a [`TrackedValue`], a
//! value-hash that compares references by what they denote rather than by
//! handle identity: a persisted reference is its type and identifier, an
//! unpersisted one its instance. Collections compare as multisets.
//!
//! An entity without a snapshot always reports itself as changed.

use std::collections::BTreeMap;

use crate::entity::EntityRef;
use crate::value::{Identifier, InstanceId, Scalar, Value};

/// What a reference points at, as far as change tracking cares.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefAnchor {
    Persisted(Identifier),
    Transient(InstanceId),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefDigest {
    pub type_name: String,
    pub anchor: RefAnchor,
}

impl RefDigest {
    pub fn of(entity: &EntityRef) -> Self {
        let anchor = match entity.identifier() {
            Some(id) => RefAnchor::Persisted(id),
            None => RefAnchor::Transient(entity.instance()),
        };
        Self {
            type_name: entity.type_name(),
            anchor,
        }
    }
}

/// The comparable form of an attribute value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrackedValue {
    Null,
    Scalar(Scalar),
    Ref(RefDigest),
    /// Sorted member digests.
    Refs(Vec<RefDigest>),
}

impl TrackedValue {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Ref(entity) => TrackedValue::Ref(RefDigest::of(entity)),
            Value::Refs(members) if members.is_empty() => TrackedValue::Null,
            Value::Refs(members) => {
                let mut digests: Vec<RefDigest> = members.iter().map(RefDigest::of).collect();
                digests.sort();
                TrackedValue::Refs(digests)
            }
            other => other
                .as_scalar()
                .map_or(TrackedValue::Null, TrackedValue::Scalar),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TrackedValue::Null)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, TrackedValue::Ref(_) | TrackedValue::Refs(_))
    }
}

/// Tracked attribute values as of a sync point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    values: BTreeMap<String, TrackedValue>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, attribute: &str) -> Option<&TrackedValue> {
        self.values.get(attribute)
    }

    pub fn insert(&mut self, attribute: &str, value: TrackedValue) {
        self.values.insert(attribute.to_string(), value);
    }

    pub fn remove(&mut self, attribute: &str) {
        self.values.remove(attribute);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TrackedValue)> {
        self.values.iter()
    }

    /// Fold `other`'s non-reference values in wherever this snapshot has
    /// no value.
    pub fn merge_missing(&mut self, other: &Snapshot) {
        for (attribute, value) in &other.values {
            if value.is_reference() || value.is_null() {
                continue;
            }
            let missing = self.values.get(attribute).map_or(true, TrackedValue::is_null);
            if missing {
                self.values.insert(attribute.clone(), value.clone());
            }
        }
    }
}

/// A single difference between two snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeChange {
    Added {
        attribute: String,
        value: TrackedValue,
    },
    Removed {
        attribute: String,
        value: TrackedValue,
    },
    Modified {
        attribute: String,
        old: TrackedValue,
        new: TrackedValue,
    },
}

impl AttributeChange {
    pub fn attribute(&self) -> &str {
        match self {
            AttributeChange::Added { attribute, .. }
            | AttributeChange::Removed { attribute, .. }
            | AttributeChange::Modified { attribute, .. } => attribute,
        }
    }
}

/// Compare two snapshots. A null value counts as absent.
pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<AttributeChange> {
    let present = |snapshot: &Snapshot, attribute: &str| {
        snapshot.get(attribute).filter(|v| !v.is_null()).cloned()
    };
    let mut changes = Vec::new();

    for attribute in old.values.keys() {
        match (present(old, attribute), present(new, attribute)) {
            (Some(old_value), Some(new_value)) if old_value != new_value => {
                changes.push(AttributeChange::Modified {
                    attribute: attribute.clone(),
                    old: old_value,
                    new: new_value,
                });
            }
            (Some(value), None) => changes.push(AttributeChange::Removed {
                attribute: attribute.clone(),
                value,
            }),
            _ => {}
        }
    }

    for attribute in new.values.keys() {
        if present(old, attribute).is_some() {
            continue;
        }
        if let Some(value) = present(new, attribute) {
            changes.push(AttributeChange::Added {
                attribute: attribute.clone(),
                value,
            });
        }
    }

    changes
}

impl EntityRef {
    /// The current tracked values. Attributes with a pending load are left
    /// out.
    pub fn capture(&self) -> Snapshot {
        let descriptor = self.descriptor();
        let pending = self.pending_attributes();
        let mut snapshot = Snapshot::new();
        for attribute in &descriptor.introspect().tracked {
            if pending.contains(attribute) {
                continue;
            }
            snapshot.insert(attribute, TrackedValue::of(&self.peek(attribute)));
        }
        snapshot
    }

    /// Record the current state as the sync point.
    pub fn take_snapshot(&self) {
        let snapshot = self.capture();
        self.0.borrow_mut().snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.0.borrow().snapshot.clone()
    }

    pub fn has_snapshot(&self) -> bool {
        self.0.borrow().snapshot.is_some()
    }

    pub fn replace_snapshot(&self, snapshot: Snapshot) {
        self.0.borrow_mut().snapshot = Some(snapshot);
    }

    pub fn clear_snapshot(&self) {
        self.0.borrow_mut().snapshot = None;
    }

    /// Fold `other` into the snapshot where it lacks a value. Without a
    /// snapshot, `other` becomes it.
    pub fn merge_into_snapshot(&self, other: &Snapshot) {
        let mut entity = self.0.borrow_mut();
        if let Some(snapshot) = entity.snapshot.as_mut() {
            snapshot.merge_missing(other);
            return;
        }
        entity.snapshot = Some(other.clone());
    }

    /// Tracked attributes whose value differs from the snapshot.
    ///
    /// Without a snapshot every tracked attribute holding a value is
    /// reported.
    pub fn changed_attributes(&self) -> Vec<String> {
        let descriptor = self.descriptor();
        let snapshot = self.snapshot();
        let pending = self.pending_attributes();
        let mut changed = Vec::new();
        for attribute in &descriptor.introspect().tracked {
            if pending.contains(attribute) {
                continue;
            }
            let current = TrackedValue::of(&self.peek(attribute));
            let differs = match &snapshot {
                Some(snapshot) => {
                    let previous = snapshot.get(attribute).cloned().unwrap_or(TrackedValue::Null);
                    previous != current
                }
                None => !current.is_null(),
            };
            if differs {
                changed.push(attribute.clone());
            }
        }
        changed
    }

    /// True without a snapshot, otherwise whether any tracked attribute
    /// differs from it.
    pub fn is_changed(&self) -> bool {
        !self.has_snapshot() || !self.changed_attributes().is_empty()
    }

    pub fn is_attribute_changed(&self, attribute: &str) -> bool {
        let Some(snapshot) = self.snapshot() else {
            return true;
        };
        if !self.is_loaded(attribute) {
            return false;
        }
        let previous = snapshot.get(attribute).cloned().unwrap_or(TrackedValue::Null);
        previous != TrackedValue::of(&self.peek(attribute))
    }

    /// Differences between the snapshot and the current state.
    pub fn snapshot_diff(&self) -> Vec<AttributeChange> {
        let previous = self.snapshot().unwrap_or_default();
        diff_snapshots(&previous, &self.capture())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_registry;
    use proptest::prelude::*;

    fn fetched_person(name: &str) -> EntityRef {
        let registry = sample_registry();
        let p = registry.instantiate("Person").unwrap();
        p.set("name", name).unwrap();
        p.set_identifier(Some(Identifier::new(1)));
        p.take_snapshot();
        p
    }

    // ----------------------------------------------------------
    // Change tracking
    // ----------------------------------------------------------

    #[test]
    fn no_snapshot_means_changed() {
        let registry = sample_registry();
        let p = registry.instantiate("Person").unwrap();
        assert!(p.is_changed());
        assert!(p.is_attribute_changed("name"));
    }

    #[test]
    fn fresh_snapshot_is_unchanged() {
        let p = fetched_person("Ann");
        assert!(!p.is_changed());
        assert!(p.changed_attributes().is_empty());
    }

    #[test]
    fn mutation_is_reported_then_cleared() {
        let p = fetched_person("Ann");
        p.set("name", "Anne").unwrap();
        assert!(p.is_changed());
        assert_eq!(p.changed_attributes(), vec!["name"]);
        assert!(p.is_attribute_changed("name"));
        assert!(!p.is_attribute_changed("age"));
        p.take_snapshot();
        assert!(!p.is_changed());
    }

    #[test]
    fn distinct_but_equal_references_are_unchanged() {
        let registry = sample_registry();
        let p = fetched_person("Ann");
        let site = registry.instantiate("Site").unwrap();
        site.set_identifier(Some(Identifier::new(4)));
        p.set("site", &site).unwrap();
        p.take_snapshot();

        let other = registry.instantiate("Site").unwrap();
        other.set_identifier(Some(Identifier::new(4)));
        p.set("site", &other).unwrap();
        assert!(!p.is_changed());

        let moved = registry.instantiate("Site").unwrap();
        moved.set_identifier(Some(Identifier::new(5)));
        p.set("site", &moved).unwrap();
        assert_eq!(p.changed_attributes(), vec!["site"]);
    }

    #[test]
    fn collection_order_does_not_matter() {
        let registry = sample_registry();
        let p = fetched_person("Ann");
        let a = registry.instantiate("Address").unwrap();
        let b = registry.instantiate("Address").unwrap();
        a.set_identifier(Some(Identifier::new(10)));
        b.set_identifier(Some(Identifier::new(11)));
        p.set("addresses", vec![a.clone(), b.clone()]).unwrap();
        p.take_snapshot();
        p.set("addresses", vec![b, a]).unwrap();
        assert!(!p.is_changed());
    }

    #[test]
    fn merge_fills_only_missing_scalars() {
        let p = fetched_person("Ann");
        let mut partial = Snapshot::new();
        partial.insert("name", TrackedValue::Scalar(Scalar::Text("Other".into())));
        partial.insert("age", TrackedValue::Scalar(Scalar::Int(30)));
        p.merge_into_snapshot(&partial);
        let snapshot = p.snapshot().unwrap();
        assert_eq!(
            snapshot.get("name"),
            Some(&TrackedValue::Scalar(Scalar::Text("Ann".into())))
        );
        assert_eq!(snapshot.get("age"), Some(&TrackedValue::Scalar(Scalar::Int(30))));
        assert!(p.is_attribute_changed("age"));
    }

    #[test]
    fn diff_reports_each_kind() {
        let mut old = Snapshot::new();
        old.insert("a", TrackedValue::Scalar(Scalar::Int(1)));
        old.insert("b", TrackedValue::Scalar(Scalar::Int(2)));
        old.insert("gone", TrackedValue::Scalar(Scalar::Int(3)));
        let mut new = Snapshot::new();
        new.insert("a", TrackedValue::Scalar(Scalar::Int(1)));
        new.insert("b", TrackedValue::Scalar(Scalar::Int(20)));
        new.insert("gone", TrackedValue::Null);
        new.insert("fresh", TrackedValue::Scalar(Scalar::Bool(true)));

        let changes = diff_snapshots(&old, &new);
        let names: Vec<&str> = changes.iter().map(AttributeChange::attribute).collect();
        assert_eq!(names, vec!["b", "gone", "fresh"]);
        assert!(matches!(changes[0], AttributeChange::Modified { .. }));
        assert!(matches!(changes[1], AttributeChange::Removed { .. }));
        assert!(matches!(changes[2], AttributeChange::Added { .. }));
    }

    #[test]
    fn snapshot_diff_against_current_state() {
        let p = fetched_person("Ann");
        p.set("age", 33i64).unwrap();
        let diff = p.snapshot_diff();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].attribute(), "age");
    }

    // ----------------------------------------------------------
    // Properties
    // ----------------------------------------------------------

    proptest! {
        #[test]
        fn change_tracking_follows_value_equality(
            before in "[A-Za-z]{1,12}",
            after in "[A-Za-z]{1,12}",
        ) {
            let p = fetched_person(&before);
            p.set("name", after.as_str()).unwrap();
            prop_assert_eq!(p.is_changed(), before != after);
            p.take_snapshot();
            prop_assert!(!p.is_changed());
        }

        #[test]
        fn age_changes_are_isolated(age in any::<i64>(), other in any::<i64>()) {
            let p = fetched_person("Ann");
            p.set("age", age).unwrap();
            p.take_snapshot();
            p.set("age", other).unwrap();
            let expected: Vec<String> = if age == other { vec![] } else { vec!["age".to_string()] };
            prop_assert_eq!(p.changed_attributes(), expected);
        }
    }
}
