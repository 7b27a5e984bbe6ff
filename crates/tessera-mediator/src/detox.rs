//! Repair of graphs returned by the remote service.
//!
//! A fetched graph is made of fresh instances, some of them broken. Each
//! fetched node is resolved to its canonical instance: the cached one if
//! there is one, otherwise the node itself, which is then cached. References
//! are rewritten to canonical instances, toxic attributes are cleared (except
//! for the back-reference to the node they were reached from), and fetched
//! state is folded into canonical instances without overwriting local
//! changes.

use std::collections::HashMap;

use tessera_cache::CacheError;
use tessera_types::{AttributeDescriptor, EntityRef, InstanceId, Value};
use tessera_visit::Visitor;
use tracing::{debug, warn};

use crate::database::{sync_snapshot_entry, Database};
use crate::error::{MediatorError, MediatorResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    /// The fetched node is the canonical instance.
    Fresh,
    /// The caller's object stands in for the fetched node.
    Adopted,
    /// The fetched node is folded into a resident instance.
    Merged,
}

struct Resolved {
    raw: EntityRef,
    canonical: EntityRef,
    parent: Option<EntityRef>,
    placement: Placement,
}

/// Reference attributes of a fetched node that hold real entities.
fn navigable(entity: &EntityRef) -> Vec<String> {
    let descriptor = entity.descriptor();
    let introspection = descriptor.introspect();
    introspection
        .references
        .iter()
        .filter(|name| !introspection.toxic.contains(name))
        .cloned()
        .collect()
}

impl Database {
    /// Repair fetched graphs and return the canonical instance of each root,
    /// in order. Roots denoting the same entity come back as the same
    /// instance.
    ///
    /// With `adopt = Some((raw, caller))`, the caller's object becomes the
    /// canonical instance of `raw` unless one is already cached.
    pub(crate) fn detoxify(
        &self,
        roots: &[EntityRef],
        adopt: Option<(&EntityRef, &EntityRef)>,
    ) -> MediatorResult<Vec<EntityRef>> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }

        let mut resolved: Vec<Resolved> = Vec::new();
        let mut index: HashMap<InstanceId, usize> = HashMap::new();
        let mut visitor = Visitor::new(navigable);
        visitor.try_visit_all(roots, |raw, lineage| {
            let (canonical, placement) = self.canonical_for(raw, adopt)?;
            index.insert(raw.instance(), resolved.len());
            resolved.push(Resolved {
                raw: raw.clone(),
                canonical,
                parent: lineage.last().cloned(),
                placement,
            });
            Ok::<(), MediatorError>(())
        })?;

        let canonical_of = |entity: &EntityRef| -> EntityRef {
            index
                .get(&entity.instance())
                .map_or_else(|| entity.clone(), |i| resolved[*i].canonical.clone())
        };

        for node in &resolved {
            if node.placement != Placement::Fresh && node.canonical.identifier().is_none() {
                node.canonical.set_identifier(node.raw.identifier());
            }
            let descriptor = node.raw.descriptor();
            for attribute in descriptor.attributes() {
                if !node.raw.has_value(&attribute.name) {
                    continue;
                }
                let raw_value = node.raw.peek(&attribute.name);
                let repaired = if attribute.is_reference() {
                    self.repair_reference(node, attribute, &raw_value, &canonical_of)
                } else {
                    Some(raw_value)
                };
                match (node.placement, repaired) {
                    (Placement::Fresh, Some(value)) => node.raw.set_raw(&attribute.name, value),
                    (Placement::Fresh, None) => node.raw.set_raw(&attribute.name, attribute.empty_value()),
                    (_, Some(value)) => absorb(&node.canonical, attribute, value),
                    (_, None) => {}
                }
            }
        }

        let mut fresh = 0;
        for node in &resolved {
            match node.placement {
                Placement::Fresh => {
                    fresh += 1;
                    self.install_loaders(&node.raw);
                    node.raw.take_snapshot();
                }
                Placement::Merged => node.canonical.merge_into_snapshot(&node.raw.capture()),
                Placement::Adopted => {
                    node.canonical.merge_into_snapshot(&node.raw.capture());
                    self.core.cache.borrow_mut().add(&node.canonical)?;
                    self.install_loaders(&node.canonical);
                }
            }
        }
        debug!(
            roots = roots.len(),
            nodes = resolved.len(),
            fresh,
            cycles = visitor.cycles().len(),
            "fetched graph repaired"
        );

        Ok(roots.iter().map(|root| canonical_of(root)).collect())
    }

    fn canonical_for(
        &self,
        raw: &EntityRef,
        adopt: Option<(&EntityRef, &EntityRef)>,
    ) -> MediatorResult<(EntityRef, Placement)> {
        let mut cache = self.core.cache.borrow_mut();
        if let Some(found) = cache.lookup(raw) {
            let placement = if &found == raw {
                Placement::Fresh
            } else {
                Placement::Merged
            };
            return Ok((found, placement));
        }
        if let Some((adopted, caller)) = adopt {
            if adopted == raw {
                return Ok((caller.clone(), Placement::Adopted));
            }
        }
        match cache.add(raw) {
            Ok(canonical) if &canonical == raw => Ok((canonical, Placement::Fresh)),
            Ok(canonical) => Ok((canonical, Placement::Merged)),
            Err(CacheError::MissingKey { entity }) => {
                warn!(%entity, "fetched entity has no key; left uncached");
                Ok((raw.clone(), Placement::Fresh))
            }
        }
    }

    /// The repaired value of a fetched reference attribute, or `None` when
    /// it must be cleared.
    fn repair_reference(
        &self,
        node: &Resolved,
        attribute: &AttributeDescriptor,
        raw_value: &Value,
        canonical_of: &impl Fn(&EntityRef) -> EntityRef,
    ) -> Option<Value> {
        let descriptor = node.raw.descriptor();
        let introspection = descriptor.introspect();
        if introspection.toxic.contains(&attribute.name) {
            let parent = node.parent.as_ref()?;
            return match raw_value {
                Value::Ref(member) if member == parent => Some(Value::Ref(canonical_of(parent))),
                _ => None,
            };
        }

        let unreliable = introspection.unreliable.contains(&attribute.name);
        let mut members = Vec::new();
        for member in raw_value.references() {
            let canonical = canonical_of(&member);
            if unreliable && canonical != member && conflicts(&canonical, attribute, &node.canonical) {
                debug!(
                    holder = %node.canonical,
                    attribute = %attribute.name,
                    member = %canonical,
                    "canonical member is bound elsewhere; keeping fetched copy"
                );
                members.push(member);
            } else {
                members.push(canonical);
            }
        }
        Some(if attribute.is_collection() {
            Value::Refs(members)
        } else {
            members.into_iter().next().map_or(Value::Null, Value::Ref)
        })
    }
}

/// Whether `member`'s singular inverse already points at another holder.
fn conflicts(member: &EntityRef, attribute: &AttributeDescriptor, holder: &EntityRef) -> bool {
    let Some(inverse) = &attribute.inverse else {
        return false;
    };
    let singular = member
        .descriptor()
        .attribute_named(inverse)
        .is_some_and(|a| !a.is_collection());
    if !singular {
        return false;
    }
    match member.peek(inverse) {
        Value::Ref(current) => &current != holder,
        _ => false,
    }
}

/// Fold a fetched value into a resident entity. Pending loads are satisfied;
/// otherwise only values the caller has not changed are replaced.
fn absorb(target: &EntityRef, attribute: &AttributeDescriptor, value: Value) {
    let name = attribute.name.as_str();
    if attribute.is_reference() && !target.is_loaded(name) {
        target.store_loaded(name, value);
        return;
    }
    if value.is_empty() {
        // A fetched empty reference is still a loaded one.
        if attribute.is_reference() && !target.has_value(name) {
            target.set_raw(name, value);
        }
        return;
    }
    let current = target.peek(name);
    if current == value {
        return;
    }
    let replaceable = if target.has_snapshot() {
        !target.is_attribute_changed(name) && (!attribute.is_reference() || current.is_empty())
    } else {
        current.is_empty()
    };
    if replaceable {
        target.set_raw(name, value);
        sync_snapshot_entry(target, name);
    }
}
