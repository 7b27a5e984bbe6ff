//! Finds and queries.

use std::collections::HashSet;

use tessera_remote::SearchRequest;
use tessera_types::{EntityRef, KeyKind, KeyValue, Value};
use tracing::debug;

use crate::database::Database;
use crate::error::{MediatorError, MediatorResult};
use crate::operation::{Operation, OperationKind};

/// Options for [`Database::find_with`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Create the entity when no match exists.
    pub create: bool,
}

impl FindOptions {
    pub fn creating() -> Self {
        Self { create: true }
    }
}

enum Finder {
    /// A search template built from the first usable key.
    Template(EntityRef, KeyValue),
    /// A key references an entity that does not exist remotely.
    Unresolvable,
    /// No key can be derived.
    NoKey,
}

impl Database {
    // ---- Find ----

    /// The canonical instance of the entity `entity` denotes, if it exists.
    pub fn find(&self, entity: &EntityRef) -> MediatorResult<Option<EntityRef>> {
        self.find_with(entity, FindOptions::default())
    }

    pub fn find_with(&self, entity: &EntityRef, options: FindOptions) -> MediatorResult<Option<EntityRef>> {
        if let Some(cached) = self.lookup(entity) {
            return Ok(Some(cached));
        }
        self.with_operation(Operation::new(OperationKind::Find, entity), || {
            let found = if self.is_transient(entity) {
                None
            } else {
                self.find_remote(entity)?
            };
            if found.is_some() {
                return Ok(found);
            }
            self.mark_transient(entity);
            if !options.create {
                return Ok(None);
            }
            self.create(entity)?;
            Ok(Some(entity.clone()))
        })
    }

    /// Whether `entity` is persisted or can be found.
    pub fn exists(&self, entity: &EntityRef) -> MediatorResult<bool> {
        if entity.is_persisted() {
            return Ok(true);
        }
        Ok(self.find(entity)?.is_some())
    }

    pub fn exists_all(&self, entities: &[EntityRef]) -> MediatorResult<bool> {
        for entity in entities {
            if !self.exists(entity)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn find_remote(&self, entity: &EntityRef) -> MediatorResult<Option<EntityRef>> {
        let (template, key) = match self.finder(entity)? {
            Finder::Template(template, key) => (template, key),
            Finder::Unresolvable => return Ok(None),
            Finder::NoKey => return self.find_among_owner_dependents(entity),
        };
        let raw = self.core.service.search(&SearchRequest::new(template))?;
        match raw.as_slice() {
            [] => Ok(None),
            [single] => {
                let canonical = self.detoxify(&raw, Some((single, entity)))?;
                debug!(entity = %entity, %key, "found");
                Ok(canonical.into_iter().next())
            }
            many => Err(MediatorError::AmbiguousFind {
                type_name: entity.type_name(),
                key: key.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Build a search template from the identifier, else the secondary key,
    /// else the alternate key.
    fn finder(&self, entity: &EntityRef) -> MediatorResult<Finder> {
        let template = EntityRef::new(entity.descriptor());
        if let Some(id) = entity.identifier() {
            template.set_identifier(Some(id));
            return Ok(Finder::Template(template, KeyValue::identifier(id)));
        }
        let mut unresolvable = false;
        for kind in [KeyKind::Secondary, KeyKind::Alternate] {
            let Some(key) = entity.key(kind) else {
                continue;
            };
            let candidate = EntityRef::new(entity.descriptor());
            let mut resolved = true;
            for attribute in entity.key_attributes(kind) {
                match entity.peek(&attribute) {
                    Value::Ref(target) => match self.resolve_reference(&target)? {
                        Some(target) => candidate.set_raw(&attribute, Value::Ref(target.key_only_copy())),
                        None => {
                            resolved = false;
                            break;
                        }
                    },
                    value => candidate.set_raw(&attribute, value),
                }
            }
            if resolved {
                return Ok(Finder::Template(candidate, key));
            }
            unresolvable = true;
        }
        Ok(if unresolvable {
            Finder::Unresolvable
        } else {
            Finder::NoKey
        })
    }

    /// Look for a keyless dependent among its owner's persisted dependents.
    fn find_among_owner_dependents(&self, entity: &EntityRef) -> MediatorResult<Option<EntityRef>> {
        let Some((owner_attribute, owner)) = entity.owner() else {
            return Ok(None);
        };
        let Some(inverse) = entity.attribute(&owner_attribute)?.inverse else {
            return Ok(None);
        };
        let owner = match self.resolve_reference(&owner)? {
            Some(owner) => owner,
            None => return Ok(None),
        };
        let criteria: Vec<(String, Value)> = entity
            .descriptor()
            .attributes()
            .iter()
            .filter(|a| !a.is_reference())
            .map(|a| (a.name.clone(), entity.peek(&a.name)))
            .filter(|(_, value)| !value.is_empty())
            .collect();
        let found = self.get(&owner, &inverse)?.references().into_iter().find(|candidate| {
            candidate != entity
                && candidate.is_persisted()
                && candidate.is_a(&entity.type_name())
                && criteria.iter().all(|(name, value)| &candidate.peek(name) == value)
        });
        if let Some(found) = &found {
            debug!(entity = %entity, owner = %owner, %found, "found among owner's dependents");
        }
        Ok(found)
    }

    /// The persisted instance standing for a referenced entity.
    pub(crate) fn resolve_reference(&self, target: &EntityRef) -> MediatorResult<Option<EntityRef>> {
        if target.is_persisted() {
            return Ok(Some(target.clone()));
        }
        if let Some(cached) = self.lookup(target) {
            if cached.is_persisted() {
                return Ok(Some(cached));
            }
        }
        self.find(target)
    }

    /// A search template carrying the identifier, the set scalars, and the
    /// searchable singular references of `entity`. `None` when a referenced
    /// entity does not exist, so nothing can match.
    pub(crate) fn search_template(&self, entity: &EntityRef) -> MediatorResult<Option<EntityRef>> {
        let descriptor = entity.descriptor();
        let template = EntityRef::new(descriptor.clone());
        template.set_identifier(entity.identifier());
        for attribute in descriptor.attributes() {
            let value = entity.peek(&attribute.name);
            if value.is_empty() {
                continue;
            }
            if !attribute.is_reference() {
                template.set_raw(&attribute.name, value);
                continue;
            }
            if attribute.is_collection() || !attribute.searchable {
                continue;
            }
            let Value::Ref(target) = value else {
                continue;
            };
            match self.resolve_reference(&target)? {
                Some(target) => template.set_raw(&attribute.name, Value::Ref(target.key_only_copy())),
                None => return Ok(None),
            }
        }
        Ok(Some(template))
    }

    // ---- Queries ----

    /// Every entity resembling `template`: the same type and all of its set
    /// values.
    pub fn query(&self, template: &EntityRef) -> MediatorResult<Vec<EntityRef>> {
        self.with_operation(Operation::new(OperationKind::Query, template), || {
            let Some(search) = self.search_template(template)? else {
                return Ok(Vec::new());
            };
            let raw: Vec<EntityRef> = match self.inverted(&search) {
                Some((attribute, target, inverse)) => {
                    debug!(template = %search, %attribute, %inverse, "query inverted");
                    let stub = EntityRef::new(target.descriptor());
                    stub.set_identifier(target.identifier());
                    let hits = self.core.service.search(&SearchRequest::via(stub, &inverse))?;
                    hits.into_iter().filter(|hit| resembles(hit, &search)).collect()
                }
                None => self.core.service.search(&SearchRequest::new(search))?,
            };
            self.detoxify(&raw, None)
        })
    }

    /// The entities reached from the matches of `template` by following
    /// `path`, without duplicates.
    pub fn query_path(&self, template: &EntityRef, path: &[&str]) -> MediatorResult<Vec<EntityRef>> {
        let Some((first, rest)) = path.split_first() else {
            return self.query(template);
        };
        let operation = Operation::new(OperationKind::Query, template).with_path(path);
        self.with_operation(operation, || {
            template.attribute(first)?;
            let Some(search) = self.search_template(template)? else {
                return Ok(Vec::new());
            };
            let raw = self.core.service.search(&SearchRequest::via(search, first))?;
            let mut current = self.detoxify(&raw, None)?;
            for hop in rest {
                let mut seen = HashSet::new();
                let mut next = Vec::new();
                for entity in &current {
                    for member in self.get(entity, hop)?.references() {
                        if seen.insert(member.instance()) {
                            next.push(member);
                        }
                    }
                }
                current = next;
            }
            Ok(current)
        })
    }

    /// Entities matching a declarative query string such as
    /// `Person where name = "Ann"`.
    pub fn query_string(&self, query: &str) -> MediatorResult<Vec<EntityRef>> {
        self.with_operation(Operation::query_string(query), || {
            let raw = self.core.service.search_by_query_string(query)?;
            debug!(query, results = raw.len(), "query string answered");
            self.detoxify(&raw, None)
        })
    }

    /// The single reference criterion of `template` as `(attribute, target,
    /// inverse)`, when queries are inverted and one applies.
    fn inverted(&self, template: &EntityRef) -> Option<(String, EntityRef, String)> {
        if !self.core.config.reader.invert_queries {
            return None;
        }
        let mut references = template.references();
        if references.len() != 1 {
            return None;
        }
        let (attribute, target) = references.pop()?;
        let inverse = template.attribute(&attribute).ok()?.inverse?;
        target.is_persisted().then_some((attribute, target, inverse))
    }
}

/// Whether a fetched entity satisfies the non-reference criteria of
/// `template`.
fn resembles(entity: &EntityRef, template: &EntityRef) -> bool {
    if !entity.is_a(&template.type_name()) {
        return false;
    }
    if template.identifier().is_some() && template.identifier() != entity.identifier() {
        return false;
    }
    template
        .descriptor()
        .attributes()
        .iter()
        .filter(|a| !a.is_reference())
        .all(|a| {
            let expected = template.peek(&a.name);
            expected.is_empty() || entity.peek(&a.name) == expected
        })
}
