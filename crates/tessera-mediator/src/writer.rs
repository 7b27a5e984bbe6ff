//! Creates, updates, saves and deletes.

use tessera_remote::SearchRequest;
use tessera_types::{EntityRef, ProxyDescriptor, Value};
use tessera_visit::Visitor;
use tracing::{debug, info};

use crate::database::{sync_snapshot_entry, Database};
use crate::error::{MediatorError, MediatorResult};
use crate::operation::{Operation, OperationKind};
use crate::reader::FindOptions;
use crate::template::Mode;

/// Loaded cascaded attributes; a save or delete of a node covers what they
/// reach.
fn cascaded_attributes(node: &EntityRef) -> Vec<String> {
    node.descriptor()
        .introspect()
        .cascaded
        .iter()
        .filter(|a| node.is_loaded(a))
        .cloned()
        .collect()
}

impl Database {
    // ---- Create ----

    /// Persist a new entity together with what its cascades reach.
    pub fn create(&self, entity: &EntityRef) -> MediatorResult<()> {
        if !self.admit(OperationKind::Create, entity)? {
            return Ok(());
        }
        self.with_operation(Operation::new(OperationKind::Create, entity), || {
            if entity.is_persisted() {
                return Err(MediatorError::AlreadyPersisted {
                    entity: entity.to_string(),
                });
            }
            if !self.create_through_owner(entity)? {
                match entity.descriptor().proxy().cloned() {
                    Some(proxy) => self.create_through_proxy(entity, &proxy)?,
                    None => {
                        let (expansion, template) = self.prepare(entity, Mode::Create)?;
                        let result = self.core.service.create_object(&template)?;
                        self.reconcile(entity, &expansion, &result)?;
                    }
                }
            }
            self.unmark_transient(entity);
            info!(entity = %entity, id = ?entity.identifier(), "created");
            Ok(())
        })
    }

    /// Hand the create to an unsaved owner whose save cascades to `entity`.
    /// An owner that already exists is adopted, and any other owner is
    /// created first. Returns whether the owner's create covered `entity`.
    fn create_through_owner(&self, entity: &EntityRef) -> MediatorResult<bool> {
        let Some((attribute, owner)) = entity.owner() else {
            return Ok(false);
        };
        if owner.is_persisted() || self.is_saving(&owner) {
            return Ok(false);
        }
        if let Some(found) = self.find(&owner)? {
            if found != owner {
                entity.set_raw(&attribute, Value::Ref(found));
            }
            return Ok(false);
        }
        let inverse = entity
            .attribute(&attribute)?
            .inverse
            .and_then(|inverse| owner.descriptor().attribute_named(&inverse).cloned())
            .filter(|back| back.cascaded);
        let Some(inverse) = inverse else {
            self.create(&owner)?;
            return Ok(false);
        };

        if inverse.is_collection() {
            owner.add_to(&inverse.name, entity)?;
        } else {
            owner.set_raw(&inverse.name, Value::Ref(entity.clone()));
        }
        debug!(entity = %entity, owner = %owner, "create delegated to owner");
        self.delegate_current();
        self.create(&owner)?;
        if !entity.is_persisted() {
            return Err(MediatorError::UnresolvedPrerequisite {
                entity: entity.to_string(),
                prerequisite: owner.to_string(),
            });
        }
        Ok(true)
    }

    /// Persist a proxied entity by creating a proxy that references it, then
    /// refresh it from the service.
    fn create_through_proxy(&self, entity: &EntityRef, proxy: &ProxyDescriptor) -> MediatorResult<()> {
        let carrier = self.core.registry.instantiate(&proxy.proxy_type)?;
        carrier.set(&proxy.attribute, entity)?;
        self.create(&carrier)?;
        let Some(id) = entity.identifier() else {
            return Err(MediatorError::MissingIdentifier {
                entity: entity.to_string(),
            });
        };
        let lookalike = EntityRef::new(entity.descriptor());
        lookalike.set_identifier(Some(id));
        let raw = self.core.service.search(&SearchRequest::new(lookalike))?;
        if let Some(first) = raw.first() {
            self.detoxify(&raw[..1], Some((first, entity)))?;
        }
        debug!(entity = %entity, proxy = %carrier, "created through proxy");
        Ok(())
    }

    // ---- Update ----

    /// Write the changes of a persisted entity, and of what its cascades
    /// reach, to the service.
    pub fn update(&self, entity: &EntityRef) -> MediatorResult<()> {
        if !self.admit(OperationKind::Update, entity)? {
            return Ok(());
        }
        self.with_operation(Operation::new(OperationKind::Update, entity), || {
            if !entity.is_persisted() {
                return Err(MediatorError::MissingIdentifier {
                    entity: entity.to_string(),
                });
            }
            if self.update_through_owner(entity)? {
                return Ok(());
            }
            match entity.descriptor().proxy().cloned() {
                Some(proxy) => {
                    let carrier = self.core.registry.instantiate(&proxy.proxy_type)?;
                    carrier.set(&proxy.attribute, entity)?;
                    self.create(&carrier)?;
                }
                None => {
                    self.update_proxied_dependents(entity)?;
                    self.create_cascaded_dependents(entity)?;
                    let (expansion, template) = self.prepare(entity, Mode::Update)?;
                    let result = self.core.service.update_object(&template)?;
                    self.reconcile(entity, &expansion, &result)?;
                }
            }
            info!(entity = %entity, "updated");
            Ok(())
        })
    }

    /// Hand the update to a persisted owner whose update cascades to
    /// `entity`.
    fn update_through_owner(&self, entity: &EntityRef) -> MediatorResult<bool> {
        let Some((attribute, owner)) = entity.owner() else {
            return Ok(false);
        };
        if !owner.is_persisted() || self.is_saving(&owner) {
            return Ok(false);
        }
        let Some(inverse) = entity.attribute(&attribute)?.inverse else {
            return Ok(false);
        };
        let cascades = owner
            .descriptor()
            .attribute_named(&inverse)
            .is_some_and(|back| back.cascade_update);
        if !cascades || !owner.is_loaded(&inverse) || !owner.peek(&inverse).contains(entity) {
            return Ok(false);
        }
        debug!(entity = %entity, owner = %owner, "update delegated to owner");
        self.delegate_current();
        self.update(&owner)?;
        Ok(true)
    }

    /// Proxied dependents are never written through their owner; each
    /// changed one gets its own proxy.
    fn update_proxied_dependents(&self, entity: &EntityRef) -> MediatorResult<()> {
        for (_, dependent) in entity.dependents() {
            let proxied = dependent.descriptor().proxy().is_some();
            if proxied && dependent.is_persisted() && dependent.is_changed() && !self.is_saving(&dependent) {
                self.update(&dependent)?;
            }
        }
        Ok(())
    }

    /// Create the unsaved members of cascaded attributes the update itself
    /// cannot create.
    fn create_cascaded_dependents(&self, entity: &EntityRef) -> MediatorResult<()> {
        let descriptor = entity.descriptor();
        for attribute in descriptor.attributes() {
            if !attribute.cascaded || attribute.cascade_update_to_create || !entity.is_loaded(&attribute.name) {
                continue;
            }
            for member in entity.peek(&attribute.name).references() {
                if member.is_persisted() || self.is_saving(&member) {
                    continue;
                }
                if let Some(inverse) = &attribute.inverse {
                    let singular = member
                        .descriptor()
                        .attribute_named(inverse)
                        .is_some_and(|a| !a.is_collection());
                    if singular && !member.is_set(inverse) {
                        member.set_raw(inverse, Value::Ref(entity.clone()));
                    }
                }
                member.apply_defaults();
                self.create(&member)?;
            }
        }
        Ok(())
    }

    // ---- Save ----

    /// Create or update `entity` as needed and return its canonical
    /// instance. Nothing is sent when a persisted entity is unchanged.
    pub fn save(&self, entity: &EntityRef) -> MediatorResult<EntityRef> {
        if entity.is_persisted() {
            self.update_if_needed(entity)?;
            return Ok(entity.clone());
        }
        match self.find(entity)? {
            Some(found) => {
                if &found != entity {
                    found.copy_scalars_from(entity, true);
                }
                self.update_if_needed(&found)?;
                Ok(found)
            }
            None => {
                self.create(entity)?;
                Ok(entity.clone())
            }
        }
    }

    /// Save each entity, owners before dependents.
    pub fn save_all(&self, entities: &[EntityRef]) -> MediatorResult<Vec<EntityRef>> {
        let mut ordered: Vec<&EntityRef> = entities.iter().collect();
        ordered.sort_by_key(|e| self.core.registry.dependency_rank(&e.type_name()));
        ordered.into_iter().map(|e| self.save(e)).collect()
    }

    /// The persisted instance of `entity`, saving it first if needed.
    pub fn ensure_exists(&self, entity: &EntityRef) -> MediatorResult<EntityRef> {
        if entity.is_persisted() {
            return Ok(entity.clone());
        }
        self.find_with(entity, FindOptions::creating())?
            .ok_or_else(|| MediatorError::NotFound {
                entity: entity.to_string(),
            })
    }

    /// Whether `entity` or anything its cascades reach is new or changed.
    pub fn needs_save(&self, entity: &EntityRef) -> bool {
        let mut visitor = Visitor::new(cascaded_attributes);
        visitor
            .collect(entity)
            .iter()
            .any(|node| !node.is_persisted() || node.is_changed())
    }

    fn update_if_needed(&self, entity: &EntityRef) -> MediatorResult<()> {
        if self.needs_save(entity) {
            return self.update(entity);
        }
        debug!(entity = %entity, "unchanged; save skipped");
        Ok(())
    }

    // ---- Delete ----

    /// Delete a persisted entity and its cascaded dependents. Deleted
    /// instances leave the cache and lose their identifiers.
    pub fn delete(&self, entity: &EntityRef) -> MediatorResult<()> {
        if !self.admit(OperationKind::Delete, entity)? {
            return Ok(());
        }
        self.with_operation(Operation::new(OperationKind::Delete, entity), || {
            if !entity.is_persisted() {
                return Err(MediatorError::MissingIdentifier {
                    entity: entity.to_string(),
                });
            }
            self.core.service.remove_object(entity)?;

            for (attribute, member) in entity.references() {
                let Some(inverse) = entity.attribute(&attribute)?.inverse else {
                    continue;
                };
                if member.is_loaded(&inverse) && member.peek(&inverse).contains(entity) {
                    member.remove_from(&inverse, entity);
                    sync_snapshot_entry(&member, &inverse);
                }
            }

            let mut visitor = Visitor::new(cascaded_attributes);
            let doomed = visitor.collect(entity);
            let mut cache = self.core.cache.borrow_mut();
            for node in &doomed {
                cache.remove(node);
                node.set_identifier(None);
                node.clear_snapshot();
                node.remove_loader();
            }
            drop(cache);
            info!(entity = %entity, evicted = doomed.len(), "deleted");
            Ok(())
        })
    }
}
