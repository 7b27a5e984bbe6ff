//! On-demand association loading.
//!
//! Every fetched entity gets the session's [`AssociationLoader`] for its
//! unset reference attributes. The first read of such an attribute fetches
//! it from the remote service, repairs the fetched graph, and merges it with
//! whatever the attribute already held.

use std::rc::{Rc, Weak};

use tessera_types::{AttributeLoader, EntityRef, FetchMode, Role, TypeError, TypeResult, Value};
use tessera_visit::pair_members;
use tracing::debug;

use crate::database::{Core, Database};
use crate::error::{MediatorError, MediatorResult};
use crate::operation::{Operation, OperationKind};

pub(crate) struct AssociationLoader {
    core: Weak<Core>,
}

impl AssociationLoader {
    pub(crate) fn new(core: Weak<Core>) -> Self {
        Self { core }
    }
}

impl AttributeLoader for AssociationLoader {
    fn load(&self, entity: &EntityRef, attribute: &str) -> TypeResult<Value> {
        let failed = |reason: String| TypeError::LoadFailed {
            attribute: attribute.to_string(),
            reason,
        };
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| failed("the mediator session has ended".to_string()))?;
        Database { core }
            .load_association(entity, attribute)
            .map_err(|err| failed(err.to_string()))
    }
}

impl Database {
    /// Fetch `attribute` of `entity` and merge it with the resident value.
    pub(crate) fn load_association(&self, entity: &EntityRef, attribute: &str) -> MediatorResult<Value> {
        let operation = Operation::new(OperationKind::Load, entity).with_path(&[attribute]);
        self.with_operation(operation, || self.merge_association(entity, attribute))
    }

    fn merge_association(&self, entity: &EntityRef, attribute: &str) -> MediatorResult<Value> {
        if self.is_lazy_loading_suspended() {
            return Err(MediatorError::LoaderSuspended {
                entity: entity.to_string(),
                attribute: attribute.to_string(),
            });
        }
        let descriptor = entity.attribute(attribute)?;
        let fetched = self.core.service.fetch_association(entity, attribute)?;
        let fetched = self.detoxify(&fetched.references(), None)?;
        let resident = entity.peek(attribute).references();

        // A resident member stays in place of its fetched counterpart.
        let (pairs, unmatched) = pair_members(&fetched, &resident, |member, candidates| {
            candidates
                .iter()
                .position(|c| c == member || c.matches(member))
        });
        for (member, kept) in &pairs {
            if member == kept {
                continue;
            }
            kept.copy_scalars_from(member, false);
            kept.merge_into_snapshot(&member.capture());
            self.core.cache.borrow_mut().add_forced(kept)?;
        }

        let members: Vec<EntityRef> = if descriptor.is_collection() {
            let mut merged = resident;
            merged.extend(unmatched);
            merged
        } else {
            pairs
                .into_iter()
                .map(|(_, kept)| kept)
                .chain(unmatched)
                .take(1)
                .collect()
        };

        if let Some(inverse) = &descriptor.inverse {
            for member in &members {
                let singular = member
                    .descriptor()
                    .attribute_named(inverse)
                    .is_some_and(|a| !a.is_collection());
                if singular && !member.is_set(inverse) {
                    member.store_loaded(inverse, Value::Ref(entity.clone()));
                }
            }
        }

        debug!(
            entity = %entity,
            attribute,
            members = members.len(),
            "association loaded"
        );
        Ok(if descriptor.is_collection() {
            Value::Refs(members)
        } else {
            members.into_iter().next().map_or(Value::Null, Value::Ref)
        })
    }

    /// Make the unset reference attributes of a persisted entity load on
    /// first access.
    pub(crate) fn install_loaders(&self, entity: &EntityRef) {
        if !self.core.config.lazy_loading.enabled || !entity.is_persisted() {
            return;
        }
        let descriptor = entity.descriptor();
        // Only one owner can be set; the others are never loaded.
        let owner_known = descriptor.introspect().owners.len() > 1 && entity.owner().is_some();
        let loadable: Vec<String> = descriptor
            .attributes()
            .iter()
            .filter(|a| a.is_reference())
            .filter(|a| !(owner_known && a.role == Role::Owner))
            .filter(|a| {
                let fetched_eagerly =
                    a.is_collection() && a.fetch == FetchMode::Eager && entity.has_value(&a.name);
                !fetched_eagerly
            })
            .map(|a| a.name.clone())
            .collect();
        if loadable.is_empty() {
            return;
        }
        entity.install_loader(Rc::clone(&self.core.loader), &loadable);
    }
}
