//! Folding a save result back into the argument graph.
//!
//! The service answers a save with fresh instances. Their identifiers and
//! server-side values are copied into the expanded nodes of the argument,
//! which then become the canonical instances. The result graph itself is
//! discarded.

use tessera_cache::CacheError;
use tessera_remote::SearchRequest;
use tessera_types::{EntityRef, Value};
use tessera_visit::MatchVisitor;
use tracing::{debug, warn};

use crate::database::{pin_snapshot_entry, sync_snapshot_entry, Database};
use crate::error::MediatorResult;
use crate::template::Expansion;

/// A submitted value the service replaced, to be restored.
struct Correction {
    entity: EntityRef,
    attribute: String,
    server: Value,
}

/// Pair an argument node with a result node. Persisted nodes need the same
/// identity; new ones fall back to the key scalars, then to the type.
fn counterpart(source: &EntityRef, candidates: &[EntityRef]) -> Option<usize> {
    let same = candidates.iter().position(|c| {
        matches!((source.identifier(), c.identifier()), (Some(a), Some(b)) if a == b) || source.matches(c)
    });
    if same.is_some() || source.is_persisted() {
        return same;
    }
    let key: Vec<String> = source
        .descriptor()
        .secondary_key_attributes()
        .iter()
        .filter(|a| source.descriptor().attribute_named(a).is_some_and(|d| !d.is_reference()))
        .cloned()
        .collect();
    let by_key = (!key.is_empty())
        .then(|| {
            candidates.iter().position(|c| {
                c.is_a(&source.type_name()) && key.iter().all(|a| c.peek(a) == source.peek(a))
            })
        })
        .flatten();
    by_key.or_else(|| candidates.iter().position(|c| c.type_name() == source.type_name()))
}

impl Database {
    pub(crate) fn reconcile(&self, root: &EntityRef, expansion: &Expansion, result: &EntityRef) -> MediatorResult<()> {
        let navigator = |node: &EntityRef| -> Vec<String> {
            if expansion.contains(node) {
                node.descriptor().introspect().references.clone()
            } else {
                Vec::new()
            }
        };
        let matched = MatchVisitor::new(navigator, counterpart).matches(root, result);

        let mut corrections = Vec::new();
        for (node, echoed) in matched.pairs.iter().filter(|(n, _)| expansion.contains(n)) {
            if node.identifier().is_none() {
                node.set_identifier(echoed.identifier());
            }
            let corrective = if expansion.creates(node) {
                self.core.config.corrective_attributes(node)
            } else {
                Vec::new()
            };
            let descriptor = node.descriptor();
            for attribute in descriptor.attributes().iter().filter(|a| !a.is_reference()) {
                let server = echoed.peek(&attribute.name);
                let submitted = node.peek(&attribute.name);
                if server.is_empty() || server == submitted {
                    continue;
                }
                if corrective.contains(&attribute.name) && !submitted.is_empty() {
                    corrections.push(Correction {
                        entity: node.clone(),
                        attribute: attribute.name.clone(),
                        server,
                    });
                } else {
                    node.set_raw(&attribute.name, server);
                }
            }
        }

        for node in expansion.nodes.iter().filter(|n| !n.is_persisted()) {
            self.fetch_identifier(node)?;
        }

        for node in &expansion.nodes {
            if !node.is_persisted() {
                continue;
            }
            node.take_snapshot();
            let added = if expansion.creates(node) {
                self.unmark_transient(node);
                self.core.cache.borrow_mut().add_forced(node)
            } else {
                self.core.cache.borrow_mut().add(node)
            };
            match added {
                Ok(_) => {}
                Err(CacheError::MissingKey { entity }) => warn!(%entity, "saved entity has no key; left uncached"),
            }
        }
        for correction in &corrections {
            pin_snapshot_entry(&correction.entity, &correction.attribute, &correction.server);
        }

        self.refresh_inverses(expansion)?;

        let mut corrected: Vec<EntityRef> = Vec::new();
        for correction in &corrections {
            if !corrected.contains(&correction.entity) {
                corrected.push(correction.entity.clone());
            }
        }
        for entity in &corrected {
            debug!(entity = %entity, "restoring values the service replaced");
            self.update(entity)?;
        }

        self.save_loose_dependents(root, expansion)?;
        debug!(
            root = %root,
            pairs = matched.pairs.len(),
            unmatched = matched.unmatched.len(),
            corrections = corrections.len(),
            "save result reconciled"
        );
        Ok(())
    }

    /// Look up the identifier of a created entity the service did not
    /// report.
    fn fetch_identifier(&self, node: &EntityRef) -> MediatorResult<()> {
        let Some(template) = self.search_template(node)? else {
            warn!(entity = %node, "created entity cannot be searched for");
            return Ok(());
        };
        let found = self.core.service.search(&SearchRequest::new(template))?;
        match found.as_slice() {
            [single] => {
                node.set_identifier(single.identifier());
                debug!(entity = %node, "identifier fetched");
            }
            other => warn!(entity = %node, matches = other.len(), "created entity has no identifier"),
        }
        Ok(())
    }

    /// Bring the inverse side of the saved associations in line with the
    /// service.
    fn refresh_inverses(&self, expansion: &Expansion) -> MediatorResult<()> {
        for node in &expansion.nodes {
            for (attribute, member) in node.references() {
                if expansion.contains(&member) || !member.is_persisted() {
                    continue;
                }
                let Some(inverse) = node.attribute(&attribute)?.inverse else {
                    continue;
                };
                if !member.is_loaded(&inverse) {
                    continue;
                }
                let back = member.attribute(&inverse)?;
                if back.is_collection() {
                    if !member.peek(&inverse).contains(node) {
                        let mut members = member.peek(&inverse).references();
                        members.push(node.clone());
                        member.set_raw(&inverse, Value::Refs(members));
                    }
                } else if member.peek(&inverse).as_entity() != Some(node) {
                    member.set_raw(&inverse, Value::Ref(node.clone()));
                }
                sync_snapshot_entry(&member, &inverse);
            }
        }
        Ok(())
    }

    /// Save the root's dependents the template did not carry.
    fn save_loose_dependents(&self, root: &EntityRef, expansion: &Expansion) -> MediatorResult<()> {
        for (_, dependent) in root.dependents() {
            if expansion.contains(&dependent) || self.is_saving(&dependent) {
                continue;
            }
            if dependent.is_persisted() && !dependent.is_changed() {
                continue;
            }
            if !dependent.is_persisted() {
                dependent.apply_defaults();
            }
            self.save(&dependent)?;
        }
        Ok(())
    }
}
