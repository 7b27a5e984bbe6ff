use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use tessera_types::{EntityRef, Identifier, InstanceId, KeyKind, KeyValue};
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// Derives the cache key of an entity, or `None` when it has none.
pub type KeyExtractor = Rc<dyn Fn(&EntityRef) -> Option<KeyValue>>;

/// Identity map from `(type, key)` to the canonical entity instance.
///
/// Entries are indexed twice: under the key produced by the type's
/// extractor and under the server identifier, so an unsaved caller object
/// and a freshly fetched copy both resolve to the same canonical entry.
///
/// There is no capacity bound and no expiry. Entries leave the cache only
/// through [`remove`](Self::remove) or a clear. The cache is not
/// synchronized; it belongs to a single mediator.
#[derive(Default)]
pub struct IdentityCache {
    by_key: HashMap<(String, KeyValue), EntityRef>,
    by_identifier: HashMap<(String, Identifier), EntityRef>,
    extractors: HashMap<String, KeyExtractor>,
    sticky: HashSet<String>,
}

/// The default extractor: the secondary key when the type declares one and
/// it is derivable, otherwise the identifier.
pub fn default_key(entity: &EntityRef) -> Option<KeyValue> {
    entity
        .key(KeyKind::Secondary)
        .or_else(|| entity.key(KeyKind::Primary))
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `extractor` to key entities of `type_name` and its subtypes.
    pub fn register_extractor(
        &mut self,
        type_name: &str,
        extractor: impl Fn(&EntityRef) -> Option<KeyValue> + 'static,
    ) {
        self.extractors
            .insert(type_name.to_string(), Rc::new(extractor));
    }

    /// Keep entries of `type_name` and its subtypes across [`clear`](Self::clear).
    pub fn set_sticky(&mut self, type_name: &str) {
        self.sticky.insert(type_name.to_string());
    }

    pub fn is_sticky(&self, entity: &EntityRef) -> bool {
        entity
            .descriptor()
            .ancestry()
            .iter()
            .any(|t| self.sticky.contains(t))
    }

    /// The cache key of `entity` under its type's extractor.
    pub fn key_of(&self, entity: &EntityRef) -> Option<KeyValue> {
        let descriptor = entity.descriptor();
        let extractor = descriptor
            .ancestry()
            .iter()
            .find_map(|t| self.extractors.get(t));
        match extractor {
            Some(extractor) => extractor(entity),
            None => default_key(entity),
        }
    }

    /// The canonical instance for `entity`, if one is cached.
    pub fn lookup(&self, entity: &EntityRef) -> Option<EntityRef> {
        let type_name = entity.type_name();
        if let Some(key) = self.key_of(entity) {
            if let Some(found) = self.by_key.get(&(type_name.clone(), key.clone())) {
                // An entry whose key attributes changed no longer answers
                // to the old key.
                if self.key_of(found).as_ref() == Some(&key) {
                    return Some(found.clone());
                }
            }
        }
        let id = entity.identifier()?;
        self.by_identifier.get(&(type_name, id)).cloned()
    }

    /// The cached instance of `type_name` with identifier `id`.
    pub fn lookup_identifier(&self, type_name: &str, id: Identifier) -> Option<EntityRef> {
        self.by_identifier
            .get(&(type_name.to_string(), id))
            .cloned()
    }

    /// Whether `entity` itself is the canonical cached instance.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.lookup(entity).is_some_and(|found| &found == entity)
    }

    /// Cache `entity` unless an equal entity is already cached. Returns the
    /// canonical instance. Adding the cached instance again re-indexes it
    /// under its current key.
    pub fn add(&mut self, entity: &EntityRef) -> CacheResult<EntityRef> {
        self.require_key(entity)?;
        if let Some(existing) = self.lookup(entity) {
            if &existing == entity && !self.indexed_under_current_key(entity) {
                self.reindex(entity);
            }
            return Ok(existing);
        }
        self.insert(entity);
        debug!(entity = %entity, "cached");
        Ok(entity.clone())
    }

    /// Cache `entity`, replacing any equal entry.
    pub fn add_forced(&mut self, entity: &EntityRef) -> CacheResult<EntityRef> {
        self.require_key(entity)?;
        if let Some(previous) = self.lookup(entity) {
            if &previous != entity {
                self.remove(&previous);
                debug!(entity = %entity, replaced = %previous.instance(), "cache entry replaced");
            }
        }
        self.reindex(entity);
        Ok(entity.clone())
    }

    /// Drop every entry that points at `entity`. Returns whether any did.
    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        let before = self.by_key.len() + self.by_identifier.len();
        self.by_key.retain(|_, cached| cached != entity);
        self.by_identifier.retain(|_, cached| cached != entity);
        before != self.by_key.len() + self.by_identifier.len()
    }

    /// Drop all entries except those of sticky types.
    pub fn clear(&mut self) {
        let sticky = &self.sticky;
        let keep = |entity: &EntityRef| {
            entity
                .descriptor()
                .ancestry()
                .iter()
                .any(|t| sticky.contains(t))
        };
        self.by_key.retain(|_, cached| keep(cached));
        self.by_identifier.retain(|_, cached| keep(cached));
        debug!(remaining = self.len(), "cache cleared");
    }

    /// Drop all entries, sticky or not.
    pub fn clear_all(&mut self) {
        self.by_key.clear();
        self.by_identifier.clear();
        debug!("cache cleared including sticky types");
    }

    /// Distinct cached instances.
    pub fn entries(&self) -> Vec<EntityRef> {
        let mut seen: HashSet<InstanceId> = HashSet::new();
        self.by_key
            .values()
            .chain(self.by_identifier.values())
            .filter(|e| seen.insert(e.instance()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.by_identifier.is_empty()
    }

    fn require_key(&self, entity: &EntityRef) -> CacheResult<()> {
        if self.key_of(entity).is_none() && entity.identifier().is_none() {
            return Err(CacheError::MissingKey {
                entity: entity.to_string(),
            });
        }
        Ok(())
    }

    fn indexed_under_current_key(&self, entity: &EntityRef) -> bool {
        match self.key_of(entity) {
            Some(key) => self.by_key.get(&(entity.type_name(), key)) == Some(entity),
            None => true,
        }
    }

    /// Drop the entries of `entity` and insert it again under its current
    /// key and identifier.
    fn reindex(&mut self, entity: &EntityRef) {
        if self.remove(entity) {
            debug!(entity = %entity, "cache entry re-keyed");
        }
        self.insert(entity);
    }

    fn insert(&mut self, entity: &EntityRef) {
        let type_name = entity.type_name();
        if let Some(key) = self.key_of(entity) {
            self.by_key.insert((type_name.clone(), key), entity.clone());
        }
        if let Some(id) = entity.identifier() {
            self.by_identifier.insert((type_name, id), entity.clone());
        }
    }
}

impl fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCache")
            .field("entries", &self.len())
            .field("sticky", &self.sticky)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_types::{AttributeDescriptor, Registry, TypeDescriptor};

    fn registry() -> Registry {
        Registry::builder()
            .entity(
                TypeDescriptor::new("Account")
                    .attribute(AttributeDescriptor::text("number"))
                    .attribute(AttributeDescriptor::text("holder"))
                    .secondary_key(&["number"]),
            )
            .entity(TypeDescriptor::new("Site").attribute(AttributeDescriptor::text("name")))
            .entity(
                TypeDescriptor::new("Ledger")
                    .attribute(AttributeDescriptor::text("code"))
                    .attribute(AttributeDescriptor::text("region")),
            )
            .build()
            .unwrap()
    }

    fn account(registry: &Registry, number: &str) -> EntityRef {
        let a = registry.instantiate("Account").unwrap();
        a.set("number", number).unwrap();
        a
    }

    fn site(registry: &Registry, id: u64) -> EntityRef {
        let s = registry.instantiate("Site").unwrap();
        s.set_identifier(Some(Identifier::new(id)));
        s
    }

    // ----------------------------------------------------------
    // Add and lookup
    // ----------------------------------------------------------

    #[test]
    fn equal_keys_collapse_to_first_instance() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let first = account(&registry, "ACC-001");
        let second = account(&registry, "ACC-001");
        assert_eq!(cache.add(&first).unwrap(), first);
        assert_eq!(cache.add(&second).unwrap(), first);
        assert_eq!(cache.lookup(&second), Some(first.clone()));
        assert!(cache.contains(&first));
        assert!(!cache.contains(&second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn add_forced_replaces() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let first = account(&registry, "ACC-001");
        let second = account(&registry, "ACC-001");
        cache.add(&first).unwrap();
        cache.add_forced(&second).unwrap();
        assert_eq!(cache.lookup(&first), Some(second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_key_is_an_error() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let anonymous = registry.instantiate("Account").unwrap();
        assert!(matches!(
            cache.add(&anonymous),
            Err(CacheError::MissingKey { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn identifier_index_bridges_keys() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let fetched = account(&registry, "ACC-002");
        fetched.set_identifier(Some(Identifier::new(12)));
        cache.add(&fetched).unwrap();

        // A stub carrying only the identifier still resolves.
        let stub = registry.instantiate("Account").unwrap();
        stub.set_identifier(Some(Identifier::new(12)));
        assert_eq!(cache.lookup(&stub), Some(fetched.clone()));
        assert_eq!(cache.lookup_identifier("Account", Identifier::new(12)), Some(fetched));
    }

    #[test]
    fn types_do_not_collide() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let s = site(&registry, 1);
        let a = account(&registry, "X");
        a.set_identifier(Some(Identifier::new(1)));
        cache.add(&s).unwrap();
        assert_eq!(cache.add(&a).unwrap(), a);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn custom_extractor() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        cache.register_extractor("Ledger", |e: &EntityRef| {
            e.peek("code").as_text().map(KeyValue::text)
        });
        let a = registry.instantiate("Ledger").unwrap();
        a.set("code", "GL").unwrap();
        a.set("region", "north").unwrap();
        let b = registry.instantiate("Ledger").unwrap();
        b.set("code", "GL").unwrap();
        cache.add(&a).unwrap();
        assert_eq!(cache.lookup(&b), Some(a));
    }

    #[test]
    fn changed_keys_are_reindexed_on_add() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let a = account(&registry, "ACC-005");
        a.set_identifier(Some(Identifier::new(5)));
        cache.add(&a).unwrap();

        a.set("number", "ACC-006").unwrap();
        // The old key no longer answers, even before the entry is re-keyed.
        assert_eq!(cache.lookup(&account(&registry, "ACC-005")), None);

        assert_eq!(cache.add(&a).unwrap(), a);
        assert_eq!(cache.lookup(&account(&registry, "ACC-006")), Some(a.clone()));
        assert_eq!(cache.lookup(&account(&registry, "ACC-005")), None);

        let newcomer = account(&registry, "ACC-005");
        assert_eq!(cache.add(&newcomer).unwrap(), newcomer);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn add_forced_drops_stale_keys() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let a = account(&registry, "ACC-007");
        cache.add(&a).unwrap();
        a.set("number", "ACC-008").unwrap();
        cache.add_forced(&a).unwrap();
        assert_eq!(cache.entries(), vec![a.clone()]);
        assert_eq!(cache.lookup(&account(&registry, "ACC-008")), Some(a));
    }

    // ----------------------------------------------------------
    // Removal and clearing
    // ----------------------------------------------------------

    #[test]
    fn remove_drops_both_indexes() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        let a = account(&registry, "ACC-003");
        a.set_identifier(Some(Identifier::new(3)));
        cache.add(&a).unwrap();
        assert!(cache.remove(&a));
        assert!(cache.lookup(&a).is_none());
        assert!(!cache.remove(&a));
    }

    #[test]
    fn clear_keeps_sticky_types() {
        let registry = registry();
        let mut cache = IdentityCache::new();
        cache.set_sticky("Site");
        let s = site(&registry, 7);
        cache.add(&s).unwrap();
        cache.add(&account(&registry, "ACC-004")).unwrap();

        cache.clear();
        assert_eq!(cache.entries(), vec![s.clone()]);
        assert!(cache.is_sticky(&s));

        cache.clear_all();
        assert!(cache.is_empty());
    }

    // ----------------------------------------------------------
    // Properties
    // ----------------------------------------------------------

    proptest! {
        #[test]
        fn one_instance_per_key(numbers in proptest::collection::vec("[A-C]-[0-3]", 1..40)) {
            let registry = registry();
            let mut cache = IdentityCache::new();
            let mut canonical: HashMap<String, EntityRef> = HashMap::new();
            for number in &numbers {
                let entity = account(&registry, number);
                let cached = cache.add(&entity).unwrap();
                let expected = canonical.entry(number.clone()).or_insert_with(|| entity.clone());
                prop_assert_eq!(&cached, &*expected);
            }
            prop_assert_eq!(cache.len(), canonical.len());
        }

        #[test]
        fn renamed_entries_answer_only_to_their_current_key(
            renames in proptest::collection::vec((0usize..4, "[A-C]-[0-3]"), 1..20)
        ) {
            let registry = registry();
            let mut cache = IdentityCache::new();
            let entities: Vec<EntityRef> = (0..4u64)
                .map(|i| {
                    let e = account(&registry, &format!("Z-{i}"));
                    e.set_identifier(Some(Identifier::new(i + 1)));
                    cache.add(&e).unwrap();
                    e
                })
                .collect();
            for (index, number) in &renames {
                let entity = &entities[*index];
                let taken = entities
                    .iter()
                    .any(|e| e.peek("number") == tessera_types::Value::from(number.as_str()));
                if taken {
                    continue;
                }
                let old = entity.peek("number");
                entity.set("number", number.as_str()).unwrap();
                cache.add(entity).unwrap();
                let lookalike = account(&registry, old.as_text().unwrap_or_default());
                prop_assert_eq!(cache.lookup(&lookalike), None);
                prop_assert_eq!(cache.lookup(&account(&registry, number)), Some(entity.clone()));
            }
            prop_assert_eq!(cache.len(), entities.len());
        }
    }
}
