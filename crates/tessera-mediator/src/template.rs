//! Save templates.
//!
//! A save submits a copy of the argument's graph rather than the graph
//! itself. The copy carries exactly what the save may write: new entities
//! the service is allowed to create through a cascade, persisted entities
//! whose changes cascade, and identifier-only stubs for everything else the
//! argument references through a changed attribute.
//!
//! Nodes carried with their values are *expanded*. After the save, expanded
//! nodes are reconciled with the service's echo; stubs are not.

use std::collections::HashSet;

use tessera_types::{AttributeDescriptor, EntityRef, InstanceId, Role, Value};
use tessera_visit::{CopyVisitor, Visitor};
use tracing::debug;

use crate::database::Database;
use crate::error::{MediatorError, MediatorResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Create,
    Update,
}

/// The expanded nodes of one save, root first.
#[derive(Debug)]
pub(crate) struct Expansion {
    pub(crate) mode: Mode,
    pub(crate) nodes: Vec<EntityRef>,
    members: HashSet<InstanceId>,
    created: HashSet<InstanceId>,
}

impl Expansion {
    pub(crate) fn of(root: &EntityRef, mode: Mode) -> Self {
        let mut visitor = Visitor::new(mergeable_attributes).with_filter(move |parent, attribute, child| {
            parent
                .descriptor()
                .attribute_named(attribute)
                .is_some_and(|a| retains(mode, parent, a, child) && expands(a, child))
        });
        let nodes = visitor.collect(root);
        let members = nodes.iter().map(EntityRef::instance).collect();
        let created = nodes
            .iter()
            .filter(|n| !n.is_persisted())
            .map(EntityRef::instance)
            .collect();
        Self {
            mode,
            nodes,
            members,
            created,
        }
    }

    pub(crate) fn contains(&self, entity: &EntityRef) -> bool {
        self.members.contains(&entity.instance())
    }

    /// Whether the save creates `entity`.
    pub(crate) fn creates(&self, entity: &EntityRef) -> bool {
        self.created.contains(&entity.instance())
    }

    /// The copy submitted to the service.
    pub(crate) fn template(&self, root: &EntityRef) -> EntityRef {
        let mode = self.mode;
        let navigator = |node: &EntityRef| -> Vec<String> {
            if self.contains(node) {
                node.descriptor().introspect().references.clone()
            } else {
                Vec::new()
            }
        };
        let mut copier = CopyVisitor::new(navigator, is_mergeable).with_retain(move |parent, attribute, child| {
            parent
                .descriptor()
                .attribute_named(attribute)
                .is_some_and(|a| retains(mode, parent, a, child))
        });
        let template = copier.copy(root, |node, _| self.copy_node(node));
        debug!(
            root = %root,
            expanded = self.nodes.len(),
            created = self.created.len(),
            "save template built"
        );
        template
    }

    fn copy_node(&self, node: &EntityRef) -> EntityRef {
        let copy = EntityRef::new(node.descriptor());
        copy.set_identifier(node.identifier());
        if !self.contains(node) {
            return copy;
        }
        let carried: Vec<String> = if node.is_persisted() && node.has_snapshot() {
            node.changed_attributes()
        } else {
            node.descriptor()
                .attributes()
                .iter()
                .map(|a| a.name.clone())
                .collect()
        };
        let descriptor = node.descriptor();
        for name in carried {
            let scalar = descriptor.attribute_named(&name).is_some_and(|a| !a.is_reference());
            let value = node.peek(&name);
            if scalar && !value.is_empty() {
                copy.set_raw(&name, value);
            }
        }
        copy
    }
}

fn mergeable_attributes(node: &EntityRef) -> Vec<String> {
    node.descriptor()
        .introspect()
        .references
        .iter()
        .filter(|a| is_mergeable(node, a))
        .cloned()
        .collect()
}

/// Whether the save carries `attribute` of `node`.
fn is_mergeable(node: &EntityRef, attribute: &str) -> bool {
    if !node.is_loaded(attribute) {
        return false;
    }
    let Some(descriptor) = node.descriptor().attribute_named(attribute).cloned() else {
        return false;
    };
    if !descriptor.is_reference() {
        return false;
    }
    if !node.is_persisted() || node.is_attribute_changed(attribute) {
        return true;
    }
    descriptor.cascade_update
        && node
            .peek(attribute)
            .references()
            .iter()
            .any(|m| !m.is_persisted() || m.is_changed())
}

/// Whether `child` may appear in the template under `parent.attribute`.
/// Unsaved children are only allowed where the service creates them.
fn retains(mode: Mode, parent: &EntityRef, attribute: &AttributeDescriptor, child: &EntityRef) -> bool {
    if child.is_persisted() {
        return true;
    }
    match mode {
        Mode::Create => attribute.cascaded,
        Mode::Update => {
            attribute.cascade_update_to_create || (attribute.cascaded && !parent.is_persisted())
        }
    }
}

fn expands(attribute: &AttributeDescriptor, child: &EntityRef) -> bool {
    !child.is_persisted() || (attribute.cascade_update && child.is_changed())
}

/// Replace `old` with `new` wherever `holder.attribute` references it.
pub(crate) fn replace_member(holder: &EntityRef, attribute: &str, old: &EntityRef, new: &EntityRef) {
    let value = match holder.peek(attribute) {
        Value::Ref(member) if &member == old => Value::Ref(new.clone()),
        Value::Refs(members) => Value::Refs(
            members
                .into_iter()
                .map(|m| if &m == old { new.clone() } else { m })
                .collect(),
        ),
        other => other,
    };
    holder.set_raw(attribute, value);
}

impl Database {
    /// Validate `root`'s graph for a save and build its template.
    pub(crate) fn prepare(&self, root: &EntityRef, mode: Mode) -> MediatorResult<(Expansion, EntityRef)> {
        let expansion = Expansion::of(root, mode);
        link_inverses(&expansion);
        for node in expansion.nodes.iter().filter(|n| expansion.creates(n)) {
            node.apply_defaults();
            let descriptor = node.descriptor();
            let autogenerated = &descriptor.introspect().autogenerated;
            let missing: Vec<String> = node
                .missing_mandatory()
                .into_iter()
                .filter(|a| !autogenerated.contains(a))
                .collect();
            if !missing.is_empty() {
                return Err(MediatorError::MissingMandatory {
                    entity: node.to_string(),
                    attributes: missing,
                });
            }
        }
        self.resolve_prerequisites(&expansion)?;
        let template = expansion.template(root);
        Ok((expansion, template))
    }

    /// Save the independent entities and owners the expanded nodes reference
    /// but the template cannot create.
    fn resolve_prerequisites(&self, expansion: &Expansion) -> MediatorResult<()> {
        for node in &expansion.nodes {
            let descriptor = node.descriptor();
            for attribute in descriptor.attributes() {
                if !matches!(attribute.role, Role::Independent | Role::Owner) || !node.is_loaded(&attribute.name) {
                    continue;
                }
                for member in node.peek(&attribute.name).references() {
                    if member.is_persisted()
                        || expansion.contains(&member)
                        || retains(expansion.mode, node, attribute, &member)
                    {
                        continue;
                    }
                    if self.is_saving(&member) && linked_both_ways(attribute, &member) {
                        debug!(
                            entity = %node,
                            attribute = %attribute.name,
                            prerequisite = %member,
                            "prerequisite is being saved; link deferred"
                        );
                        continue;
                    }
                    let canonical = self.ensure_exists(&member)?;
                    if canonical != member {
                        replace_member(node, &attribute.name, &member, &canonical);
                    }
                    if !canonical.is_persisted() && !self.is_saving(&canonical) {
                        return Err(MediatorError::UnresolvedPrerequisite {
                            entity: node.to_string(),
                            prerequisite: canonical.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Whether `attribute` and its inverse on `member` form an independent
/// association with a collection side.
fn linked_both_ways(attribute: &AttributeDescriptor, member: &EntityRef) -> bool {
    if attribute.role != Role::Independent {
        return false;
    }
    let Some(inverse) = &attribute.inverse else {
        return false;
    };
    let back = member.descriptor().attribute_named(inverse).cloned();
    back.is_some_and(|back| {
        back.role == Role::Independent && (attribute.is_collection() || back.is_collection())
    })
}

/// Point the singular inverse of each new cascaded child at its holder.
fn link_inverses(expansion: &Expansion) {
    for node in &expansion.nodes {
        let descriptor = node.descriptor();
        for attribute in descriptor.attributes().iter().filter(|a| a.cascaded) {
            let Some(inverse) = &attribute.inverse else {
                continue;
            };
            for child in node.peek(&attribute.name).references() {
                if !expansion.creates(&child) || child.is_set(inverse) {
                    continue;
                }
                let singular = child
                    .descriptor()
                    .attribute_named(inverse)
                    .is_some_and(|a| !a.is_collection());
                if singular {
                    child.set_raw(inverse, Value::Ref(node.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_remote::CallKind;

    use super::*;
    use crate::fixtures::{address, harness, person, site};

    #[test]
    fn new_graph_expands_through_cascades() {
        let h = harness();
        let p = person(&h.registry, "Ann");
        let home = address(&h.registry, "home", "Main St");
        p.add_to("addresses", &home).unwrap();
        let lab = site(&h.registry, "Lab");
        h.seed(&lab);
        p.set("site", &lab).unwrap();

        let (expansion, template) = h.db.prepare(&p, Mode::Create).unwrap();
        assert_eq!(expansion.nodes, vec![p.clone(), home.clone()]);
        assert!(expansion.creates(&home));
        assert_eq!(home.peek("person"), Value::Ref(p.clone()));
        assert_eq!(p.peek("status"), Value::from("active"));

        assert_ne!(template, p);
        assert_eq!(template.peek("name"), Value::from("Ann"));
        let addresses = template.peek("addresses").references();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].peek("street"), Value::from("Main St"));
        // The unsaved owner is not carried back.
        assert!(!addresses[0].is_set("person"));
        let site_stub = template.peek("site").references();
        assert_eq!(site_stub[0].identifier(), lab.identifier());
        assert!(!site_stub[0].is_set("name"));
    }

    #[test]
    fn update_carries_only_changes() {
        let h = harness();
        let p = person(&h.registry, "Ann");
        p.add_to("addresses", &address(&h.registry, "home", "Main St")).unwrap();
        h.seed(&p);
        let ann = h.db.find(&person(&h.registry, "Ann")).unwrap().unwrap();
        ann.set("age", 41i64).unwrap();

        let (expansion, template) = h.db.prepare(&ann, Mode::Update).unwrap();
        assert_eq!(expansion.nodes, vec![ann.clone()]);
        assert_eq!(template.identifier(), ann.identifier());
        assert_eq!(template.peek("age"), Value::from(41i64));
        assert!(!template.is_set("name"));
        assert!(!template.has_value("addresses"));
    }

    #[test]
    fn unsaved_children_are_not_created_by_updates() {
        let h = harness();
        h.seed(&person(&h.registry, "Ann"));
        let ann = h.db.find(&person(&h.registry, "Ann")).unwrap().unwrap();
        let work = address(&h.registry, "work", "Mill Rd");
        ann.add_to("addresses", &work).unwrap();

        let (expansion, template) = h.db.prepare(&ann, Mode::Update).unwrap();
        assert!(!expansion.contains(&work));
        assert_eq!(template.peek("addresses"), Value::Refs(Vec::new()));
    }

    #[test]
    fn missing_mandatory_fails_before_any_call() {
        let h = harness();
        let nameless = h.registry.instantiate("Person").unwrap();
        let err = h.db.prepare(&nameless, Mode::Create).unwrap_err();
        assert!(matches!(err, MediatorError::MissingMandatory { ref attributes, .. } if attributes == &["name"]));
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(h.service.calls().is_empty());
    }

    #[test]
    fn unsaved_independents_are_saved_first() {
        let h = harness();
        let p = person(&h.registry, "Ann");
        let lab = site(&h.registry, "Lab");
        p.set("site", &lab).unwrap();

        let (_, template) = h.db.prepare(&p, Mode::Create).unwrap();
        assert!(lab.is_persisted());
        assert_eq!(h.service.call_count(CallKind::Create), 1);
        assert_eq!(template.peek("site").references()[0].identifier(), lab.identifier());
    }

    #[test]
    fn prerequisites_resolve_to_canonical_instances() {
        let h = harness();
        h.seed(&site(&h.registry, "Lab"));
        let p = person(&h.registry, "Ann");
        p.set("site", &site(&h.registry, "Lab")).unwrap();

        h.db.prepare(&p, Mode::Create).unwrap();
        let canonical = h.db.find(&site(&h.registry, "Lab")).unwrap().unwrap();
        assert_eq!(p.peek("site"), Value::Ref(canonical));
        assert_eq!(h.service.call_count(CallKind::Create), 0);
    }
}
