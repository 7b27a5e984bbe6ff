use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use tessera_cache::IdentityCache;
use tessera_remote::RemoteService;
use tessera_types::{AttributeLoader, EntityRef, InstanceId, KeyValue, Registry, Snapshot, TrackedValue, Value};
use tracing::{debug, error, info};

use crate::config::MediatorConfig;
use crate::error::{MediatorError, MediatorResult};
use crate::lazy::AssociationLoader;
use crate::operation::{Entry, Operation, OperationKind, OperationStack};

/// Identifies one mediator session in logs (UUID v7 for time-ordering).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// First 8 characters of the UUID.
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.short_id())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared mediator state. Entities hold the loader, which points back here
/// weakly.
pub(crate) struct Core {
    pub(crate) session: SessionId,
    pub(crate) registry: Rc<Registry>,
    pub(crate) service: Rc<dyn RemoteService>,
    pub(crate) config: MediatorConfig,
    pub(crate) cache: RefCell<IdentityCache>,
    pub(crate) operations: RefCell<OperationStack>,
    /// Entities a find has already failed to match during the current
    /// top-level operation.
    pub(crate) transients: RefCell<HashSet<InstanceId>>,
    pub(crate) suspended: Cell<usize>,
    /// Operation stack at the innermost failure, kept until the outermost
    /// frame logs it.
    pub(crate) failure_trace: RefCell<Option<String>>,
    pub(crate) loader: Rc<dyn AttributeLoader>,
}

/// The mediator between callers and a remote persistence service.
///
/// A `Database` owns one identity cache and one operation stack. Clones
/// share them. It is single-threaded by construction: entities are
/// `Rc`-based and the handle is neither `Send` nor `Sync`. Run one
/// `Database` per logical session.
#[derive(Clone)]
pub struct Database {
    pub(crate) core: Rc<Core>,
}

/// Keeps lazy loading suspended until dropped. Guards nest.
#[must_use = "lazy loading resumes as soon as the guard is dropped"]
pub struct LazyLoadingGuard {
    core: Rc<Core>,
}

impl Drop for LazyLoadingGuard {
    fn drop(&mut self) {
        let depth = self.core.suspended.get().saturating_sub(1);
        self.core.suspended.set(depth);
        debug!(depth, "lazy loading resumed");
    }
}

impl Database {
    /// A mediator with the default configuration.
    pub fn new(registry: Rc<Registry>, service: Rc<dyn RemoteService>) -> Self {
        Self::build(registry, service, MediatorConfig::default())
    }

    /// A mediator with `config`, checked against `registry` first.
    pub fn with_config(
        registry: Rc<Registry>,
        service: Rc<dyn RemoteService>,
        config: MediatorConfig,
    ) -> MediatorResult<Self> {
        config.validate(&registry)?;
        Ok(Self::build(registry, service, config))
    }

    fn build(registry: Rc<Registry>, service: Rc<dyn RemoteService>, config: MediatorConfig) -> Self {
        let mut cache = IdentityCache::new();
        for type_name in &config.cache.sticky {
            cache.set_sticky(type_name);
        }
        let core = Rc::new_cyclic(|weak| Core {
            session: SessionId::new(),
            registry,
            service,
            config,
            cache: RefCell::new(cache),
            operations: RefCell::new(OperationStack::new()),
            transients: RefCell::new(HashSet::new()),
            suspended: Cell::new(0),
            failure_trace: RefCell::new(None),
            loader: Rc::new(AssociationLoader::new(weak.clone())),
        });
        info!(session = %core.session, "mediator session opened");
        Self { core }
    }

    // ---- Accessors ----

    /// Identifies this mediator in logs.
    pub fn session(&self) -> SessionId {
        self.core.session
    }

    /// The domain metadata entities are described by.
    pub fn registry(&self) -> &Rc<Registry> {
        &self.core.registry
    }

    /// The validated configuration.
    pub fn config(&self) -> &MediatorConfig {
        &self.core.config
    }

    /// The in-flight operations, outermost first.
    pub fn operations(&self) -> String {
        self.core.operations.borrow().render()
    }

    // ---- Cache ----

    /// The canonical cached instance for `entity`.
    pub fn lookup(&self, entity: &EntityRef) -> Option<EntityRef> {
        self.core.cache.borrow().lookup(entity)
    }

    /// Number of cache entries.
    pub fn cached(&self) -> usize {
        self.core.cache.borrow().len()
    }

    /// Key entities of `type_name` with `extractor` instead of the default.
    pub fn register_key_extractor(
        &self,
        type_name: &str,
        extractor: impl Fn(&EntityRef) -> Option<KeyValue> + 'static,
    ) {
        self.core
            .cache
            .borrow_mut()
            .register_extractor(type_name, extractor);
    }

    /// Drop cached entities except those of sticky types.
    pub fn clear_cache(&self) {
        self.core.cache.borrow_mut().clear();
        debug!(session = %self.core.session, "cache cleared");
    }

    /// Drop every cached entity.
    pub fn clear_cache_all(&self) {
        self.core.cache.borrow_mut().clear_all();
        debug!(session = %self.core.session, "cache cleared, sticky entries included");
    }

    // ---- Lazy loading ----

    /// Make every lazy load fail until the returned guard is dropped.
    pub fn suspend_lazy_loading(&self) -> LazyLoadingGuard {
        let depth = self.core.suspended.get() + 1;
        self.core.suspended.set(depth);
        debug!(depth, "lazy loading suspended");
        LazyLoadingGuard {
            core: Rc::clone(&self.core),
        }
    }

    /// Whether any [`LazyLoadingGuard`] is alive.
    pub fn is_lazy_loading_suspended(&self) -> bool {
        self.core.suspended.get() > 0
    }

    /// Read `attribute`, fetching it first if it has not been loaded.
    pub fn get(&self, entity: &EntityRef, attribute: &str) -> MediatorResult<Value> {
        if self.is_lazy_loading_suspended() && !entity.is_loaded(attribute) {
            // Reports the suspension.
            return self.load_association(entity, attribute);
        }
        Ok(entity.get(attribute)?)
    }

    // ---- Operation bookkeeping ----

    /// Whether `kind` on `subject` may start. `Ok(false)` means a delegated
    /// frame already covers it.
    pub(crate) fn admit(&self, kind: OperationKind, subject: &EntityRef) -> MediatorResult<bool> {
        let operations = self.core.operations.borrow();
        match operations.check(kind, subject) {
            Entry::Proceed => Ok(true),
            Entry::Delegated => {
                debug!(%kind, entity = %subject, "covered by a delegated frame");
                Ok(false)
            }
            Entry::Recursive => Err(MediatorError::RecursiveOperation {
                kind,
                entity: subject.to_string(),
                stack: operations.render(),
            }),
        }
    }

    pub(crate) fn is_saving(&self, entity: &EntityRef) -> bool {
        self.core.operations.borrow().is_saving(entity)
    }

    pub(crate) fn delegate_current(&self) {
        self.core.operations.borrow_mut().delegate_top();
    }

    /// Run `body` as `operation`. Failures are logged with the operation
    /// stack once, when the outermost operation unwinds.
    pub(crate) fn with_operation<T>(
        &self,
        operation: Operation,
        body: impl FnOnce() -> MediatorResult<T>,
    ) -> MediatorResult<T> {
        let kind = operation.kind;
        self.core.operations.borrow_mut().push(operation);
        let result = body();
        if let Err(err) = &result {
            let mut trace = self.core.failure_trace.borrow_mut();
            if trace.is_none() {
                let stack = self.core.operations.borrow().render();
                debug!(%kind, error = %err, %stack, "operation failed");
                *trace = Some(stack);
            }
        }
        let depth = {
            let mut operations = self.core.operations.borrow_mut();
            operations.pop();
            operations.depth()
        };
        if depth == 0 {
            self.core.transients.borrow_mut().clear();
            let trace = self.core.failure_trace.borrow_mut().take();
            if let (Err(err), Some(stack)) = (&result, trace) {
                error!(
                    session = %self.core.session,
                    %kind,
                    error_kind = ?err.kind(),
                    error = %err,
                    %stack,
                    "operation failed"
                );
            }
        }
        result
    }

    pub(crate) fn is_transient(&self, entity: &EntityRef) -> bool {
        self.core.transients.borrow().contains(&entity.instance())
    }

    pub(crate) fn mark_transient(&self, entity: &EntityRef) {
        self.core.transients.borrow_mut().insert(entity.instance());
    }

    pub(crate) fn unmark_transient(&self, entity: &EntityRef) {
        self.core.transients.borrow_mut().remove(&entity.instance());
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("session", &self.core.session)
            .field("cached", &self.cached())
            .field("operations", &self.operations())
            .finish()
    }
}

/// Record the current value of `attribute` as its synced value.
pub(crate) fn sync_snapshot_entry(entity: &EntityRef, attribute: &str) {
    let tracked = entity
        .descriptor()
        .attribute_named(attribute)
        .is_some_and(|a| a.updatable);
    if !tracked {
        return;
    }
    if let Some(mut snapshot) = entity.snapshot() {
        snapshot.insert(attribute, TrackedValue::of(&entity.peek(attribute)));
        entity.replace_snapshot(snapshot);
    }
}

/// Record `value` as the synced value of `attribute`, whatever the entity
/// currently holds.
pub(crate) fn pin_snapshot_entry(entity: &EntityRef, attribute: &str, value: &Value) {
    let mut snapshot = entity.snapshot().unwrap_or_else(Snapshot::new);
    snapshot.insert(attribute, TrackedValue::of(value));
    entity.replace_snapshot(snapshot);
}
