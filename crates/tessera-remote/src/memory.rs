//! An in-memory [`RemoteService`].
//!
//! Records are stored flat: scalars by attribute, references as identifier
//! lists. Every response is built from fresh entity instances, so two
//! fetches of one record never share an object. The service reproduces the
//! behavior the mediator has to absorb:
//!
//! - toxic attributes come back as identifier-only stubs
//! - unreliable attributes come back as shallow copies
//! - autogenerated attributes are overwritten on create
//! - persisted members are only modified through cascade-update attributes
//! - read-only attributes are silently ignored on update
//! - save results echo the submitted structure only, optionally without the
//!   identifiers of cascade-created children
//! - unsaved references outside a cascade, cyclic templates, and nested
//!   search criteria are rejected
//!
//! Saves are atomic: a rejected template leaves the store untouched.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tessera_types::{
    AttributeDescriptor, AttributeKind, EntityRef, FetchMode, Identifier, InstanceId, Registry,
    Scalar, ScalarType, Value,
};
use tracing::{debug, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::query::parse_query;
use crate::service::{Call, CallKind, RemoteService, SearchRequest};

/// Behavior switches of an [`InMemoryService`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Reject search criteria that reference unsaved entities.
    pub reject_nested_criteria: bool,
    /// Reject every reference criterion in a template search.
    pub broken_reference_search: bool,
    /// Types whose identifiers are left out of save results when they were
    /// created through a cascade.
    pub omit_identifiers: Vec<String>,
    /// Nesting limit for eagerly fetched references.
    pub max_depth: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            reject_nested_criteria: true,
            broken_reference_search: false,
            omit_identifiers: Vec::new(),
            max_depth: 6,
        }
    }
}

#[derive(Clone, Debug)]
struct Record {
    type_name: String,
    scalars: BTreeMap<String, Scalar>,
    refs: BTreeMap<String, Vec<Identifier>>,
}

impl Record {
    fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            scalars: BTreeMap::new(),
            refs: BTreeMap::new(),
        }
    }

    fn members(&self, attribute: &str) -> &[Identifier] {
        self.refs.get(attribute).map_or(&[], Vec::as_slice)
    }
}

#[derive(Default)]
struct Store {
    next_id: u64,
    records: BTreeMap<Identifier, Record>,
    calls: Vec<Call>,
    failures: Vec<CallKind>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Create,
    Update,
}

/// Staged copy of the store for one save.
struct Txn {
    records: BTreeMap<Identifier, Record>,
    next_id: u64,
    written: HashMap<InstanceId, Identifier>,
    created: HashSet<InstanceId>,
    applied: HashSet<InstanceId>,
}

impl Txn {
    fn begin(store: &Store) -> Self {
        Self {
            records: store.records.clone(),
            next_id: store.next_id,
            written: HashMap::new(),
            created: HashSet::new(),
            applied: HashSet::new(),
        }
    }

    fn commit(self, store: &mut Store) {
        store.records = self.records;
        store.next_id = self.next_id;
    }

    fn allocate(&mut self) -> Identifier {
        self.next_id += 1;
        Identifier::new(self.next_id)
    }
}

/// The attribute through which a template node was reached.
struct Edge<'a> {
    holder_created: bool,
    attribute: &'a AttributeDescriptor,
}

enum Criterion {
    Identifier(Identifier),
    Scalar(String, Scalar),
    Reference(String, Vec<Identifier>),
}

/// A [`RemoteService`] holding its records in memory.
pub struct InMemoryService {
    registry: Rc<Registry>,
    options: ServiceOptions,
    state: RefCell<Store>,
}

impl InMemoryService {
    pub fn new(registry: Rc<Registry>) -> Self {
        Self::with_options(registry, ServiceOptions::default())
    }

    pub fn with_options(registry: Rc<Registry>, options: ServiceOptions) -> Self {
        Self {
            registry,
            options,
            state: RefCell::new(Store::default()),
        }
    }

    pub fn registry(&self) -> &Rc<Registry> {
        &self.registry
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Store `template` as a create would, without logging a call.
    ///
    /// The argument is left untouched; the root's new identifier is
    /// returned.
    pub fn seed(&self, template: &EntityRef) -> RemoteResult<Identifier> {
        let (id, _) = self.persist(template, Mode::Create)?;
        Ok(id)
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn call_count(&self, kind: CallKind) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Fail the next call of `kind` with a transport error.
    pub fn fail_next(&self, kind: CallKind) {
        self.state.borrow_mut().failures.push(kind);
    }

    pub fn record_count(&self) -> usize {
        self.state.borrow().records.len()
    }

    pub fn contains(&self, id: Identifier) -> bool {
        self.state.borrow().records.contains_key(&id)
    }

    pub fn stored_value(&self, id: Identifier, attribute: &str) -> Option<Scalar> {
        self.state
            .borrow()
            .records
            .get(&id)
            .and_then(|r| r.scalars.get(attribute).cloned())
    }

    pub fn stored_refs(&self, id: Identifier, attribute: &str) -> Vec<Identifier> {
        self.state
            .borrow()
            .records
            .get(&id)
            .map(|r| r.members(attribute).to_vec())
            .unwrap_or_default()
    }

    fn log_call(&self, kind: CallKind, type_name: &str, detail: String) -> RemoteResult<()> {
        let mut store = self.state.borrow_mut();
        debug!(call = %kind, entity = type_name, %detail, "remote call");
        store.calls.push(Call {
            kind,
            type_name: type_name.to_string(),
            detail,
        });
        if let Some(position) = store.failures.iter().position(|k| *k == kind) {
            store.failures.remove(position);
            warn!(call = %kind, entity = type_name, "injected transport failure");
            return Err(RemoteError::Transport(format!("{kind} of {type_name} failed")));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Responses
    // ---------------------------------------------------------------

    fn record<'a>(
        records: &'a BTreeMap<Identifier, Record>,
        type_name: &str,
        id: Identifier,
    ) -> RemoteResult<&'a Record> {
        records.get(&id).ok_or_else(|| RemoteError::NotFound {
            type_name: type_name.to_string(),
            id,
        })
    }

    /// A fresh entity carrying only the identifier.
    fn stub(&self, id: Identifier, record: &Record) -> RemoteResult<EntityRef> {
        let entity = EntityRef::new(self.registry.descriptor(&record.type_name)?);
        entity.set_identifier(Some(id));
        Ok(entity)
    }

    /// A fresh entity carrying the identifier and stored scalars.
    fn shallow(&self, id: Identifier, record: &Record) -> RemoteResult<EntityRef> {
        let entity = self.stub(id, record)?;
        for (attribute, scalar) in &record.scalars {
            entity.set_raw(attribute, Value::from(scalar.clone()));
        }
        Ok(entity)
    }

    /// Build the response graph for a stored record.
    ///
    /// `back` names the attribute that points at the entity this one was
    /// reached from; it receives that parent regardless of fetch mode.
    fn materialize(
        &self,
        records: &BTreeMap<Identifier, Record>,
        id: Identifier,
        type_name: &str,
        depth: usize,
        back: Option<(&str, &EntityRef)>,
    ) -> RemoteResult<EntityRef> {
        let record = Self::record(records, type_name, id)?;
        let entity = self.shallow(id, record)?;
        let descriptor = entity.descriptor();
        for attribute in descriptor.attributes().iter().filter(|a| a.is_reference()) {
            if let Some((name, parent)) = back {
                if name == attribute.name && !attribute.is_collection() {
                    entity.set_raw(&attribute.name, Value::Ref(parent.clone()));
                    continue;
                }
            }
            let target = attribute.target().unwrap_or(type_name);
            let ids = record.members(&attribute.name);
            let mut members = Vec::with_capacity(ids.len());
            match attribute.fetch {
                FetchMode::Lazy => continue,
                FetchMode::Eager if depth < self.options.max_depth => {
                    let back = attribute.inverse.as_deref().map(|inverse| (inverse, &entity));
                    for member in ids {
                        members.push(self.materialize(records, *member, target, depth + 1, back)?);
                    }
                }
                FetchMode::Eager | FetchMode::Unreliable => {
                    for member in ids {
                        members.push(self.shallow(*member, Self::record(records, target, *member)?)?);
                    }
                }
                FetchMode::Toxic => {
                    for member in ids {
                        members.push(self.stub(*member, Self::record(records, target, *member)?)?);
                    }
                }
            }
            entity.set_raw(&attribute.name, shaped(attribute, members));
        }
        Ok(entity)
    }

    // ---------------------------------------------------------------
    // Saves
    // ---------------------------------------------------------------

    fn persist(&self, template: &EntityRef, mode: Mode) -> RemoteResult<(Identifier, EntityRef)> {
        let mut store = self.state.borrow_mut();
        let mut txn = Txn::begin(&store);
        let id = self.write(&mut txn, template, &mut Vec::new(), mode, None)?;
        let response = self.echo(&txn, template, &mut HashMap::new(), true)?;
        debug!(
            entity = %template,
            id = %id,
            created = txn.created.len(),
            applied = txn.applied.len(),
            "template saved"
        );
        txn.commit(&mut store);
        Ok((id, response))
    }

    fn write(
        &self,
        txn: &mut Txn,
        node: &EntityRef,
        lineage: &mut Vec<InstanceId>,
        mode: Mode,
        edge: Option<Edge<'_>>,
    ) -> RemoteResult<Identifier> {
        let instance = node.instance();
        if lineage.contains(&instance) {
            return Err(RemoteError::Rejected(format!("cyclic template at {node}")));
        }
        if let Some(id) = txn.written.get(&instance) {
            return Ok(*id);
        }
        let descriptor = self.registry.descriptor(&node.type_name())?;

        let (id, apply) = match node.identifier() {
            Some(id) => {
                Self::record(&txn.records, descriptor.name(), id)?;
                let apply = match &edge {
                    None => mode == Mode::Update,
                    Some(e) => e.attribute.cascade_update,
                };
                (id, apply)
            }
            None => {
                let allowed = match (&edge, mode) {
                    (None, Mode::Create) => true,
                    (None, Mode::Update) => false,
                    (Some(e), Mode::Create) => e.attribute.cascaded,
                    (Some(e), Mode::Update) => {
                        e.attribute.cascade_update_to_create
                            || (e.attribute.cascaded && e.holder_created)
                    }
                };
                if !allowed {
                    return Err(RemoteError::Rejected(match &edge {
                        None => format!("{node} has no identifier"),
                        Some(e) => format!("unsaved reference {node} through {}", e.attribute.name),
                    }));
                }
                if descriptor.is_abstract() {
                    return Err(RemoteError::Rejected(format!("{} is abstract", descriptor.name())));
                }
                let id = txn.allocate();
                txn.records.insert(id, Record::new(descriptor.name()));
                txn.created.insert(instance);
                (id, true)
            }
        };
        txn.written.insert(instance, id);
        if !apply {
            return Ok(id);
        }
        txn.applied.insert(instance);
        let created = txn.created.contains(&instance);

        if let Some(record) = txn.records.get_mut(&id) {
            for attribute in descriptor.attributes().iter().filter(|a| !a.is_reference()) {
                if created && attribute.autogenerated {
                    if let Some(value) = generated(attribute, descriptor.name(), id) {
                        record.scalars.insert(attribute.name.clone(), value);
                    }
                    continue;
                }
                if !created && !attribute.updatable {
                    continue;
                }
                match node.peek(&attribute.name).as_scalar() {
                    Some(scalar) => {
                        record.scalars.insert(attribute.name.clone(), scalar);
                    }
                    None if created => {
                        if let Some(default) = &attribute.default {
                            record.scalars.insert(attribute.name.clone(), default.clone());
                        }
                    }
                    None => {}
                }
            }
            if created {
                let missing: Vec<&str> = descriptor
                    .attributes()
                    .iter()
                    .filter(|a| a.mandatory && !a.is_reference())
                    .filter(|a| !record.scalars.contains_key(&a.name))
                    .map(|a| a.name.as_str())
                    .collect();
                if !missing.is_empty() {
                    return Err(RemoteError::Rejected(format!(
                        "{} is missing mandatory {}",
                        descriptor.name(),
                        missing.join(", ")
                    )));
                }
            }
        }

        lineage.push(instance);
        for attribute in descriptor.attributes().iter().filter(|a| a.is_reference()) {
            if !created && !attribute.updatable {
                continue;
            }
            let members = node.peek(&attribute.name).references();
            if members.is_empty() {
                continue;
            }
            let mut ids = Vec::with_capacity(members.len());
            for member in &members {
                let edge = Edge {
                    holder_created: created,
                    attribute,
                };
                ids.push(self.write(txn, member, lineage, mode, Some(edge))?);
            }
            self.link(txn, id, attribute, &ids, created);
        }
        lineage.pop();
        Ok(id)
    }

    /// Point `holder.attribute` at `members` and keep the inverse in step.
    /// Updated collections gain members; everything else is replaced.
    fn link(
        &self,
        txn: &mut Txn,
        holder: Identifier,
        attribute: &AttributeDescriptor,
        members: &[Identifier],
        created: bool,
    ) {
        let Some(record) = txn.records.get_mut(&holder) else {
            return;
        };
        let current = record.refs.entry(attribute.name.clone()).or_default();
        let previous = current.clone();
        if attribute.is_collection() && !created {
            for member in members {
                if !current.contains(member) {
                    current.push(*member);
                }
            }
        } else {
            *current = members.to_vec();
        }
        let now = current.clone();

        let Some(inverse) = &attribute.inverse else {
            return;
        };
        for old in previous.iter().filter(|m| !now.contains(m)) {
            if let Some(record) = txn.records.get_mut(old) {
                if let Some(back) = record.refs.get_mut(inverse) {
                    back.retain(|h| *h != holder);
                }
            }
        }
        for member in &now {
            let Some(record) = txn.records.get_mut(member) else {
                continue;
            };
            let many = self
                .registry
                .get(&record.type_name)
                .and_then(|d| d.attribute_named(inverse))
                .is_some_and(AttributeDescriptor::is_collection);
            let back = record.refs.entry(inverse.clone()).or_default();
            if many {
                if !back.contains(&holder) {
                    back.push(holder);
                }
            } else {
                *back = vec![holder];
            }
        }
    }

    /// Mirror the submitted structure with fresh instances holding the
    /// stored state.
    fn echo(
        &self,
        txn: &Txn,
        node: &EntityRef,
        memo: &mut HashMap<InstanceId, EntityRef>,
        root: bool,
    ) -> RemoteResult<EntityRef> {
        let instance = node.instance();
        if let Some(done) = memo.get(&instance) {
            return Ok(done.clone());
        }
        let id = txn
            .written
            .get(&instance)
            .copied()
            .ok_or_else(|| RemoteError::Rejected(format!("{node} was not submitted")))?;
        let record = Self::record(&txn.records, &node.type_name(), id)?;
        let echoed = self.shallow(id, record)?;
        let omitted = !root
            && txn.created.contains(&instance)
            && self.options.omit_identifiers.contains(&record.type_name);
        if omitted {
            echoed.set_identifier(None);
        }
        memo.insert(instance, echoed.clone());

        if txn.applied.contains(&instance) {
            let descriptor = node.descriptor();
            for attribute in descriptor.attributes().iter().filter(|a| a.is_reference()) {
                let members = node.peek(&attribute.name).references();
                if members.is_empty() {
                    continue;
                }
                let mut copies = Vec::with_capacity(members.len());
                for member in &members {
                    copies.push(self.echo(txn, member, memo, false)?);
                }
                echoed.set_raw(&attribute.name, shaped(attribute, copies));
            }
        }
        Ok(echoed)
    }

    // ---------------------------------------------------------------
    // Searches
    // ---------------------------------------------------------------

    fn criteria(
        &self,
        records: &BTreeMap<Identifier, Record>,
        template: &EntityRef,
    ) -> RemoteResult<Vec<Criterion>> {
        let mut criteria = Vec::new();
        if let Some(id) = template.identifier() {
            criteria.push(Criterion::Identifier(id));
        }
        let descriptor = template.descriptor();
        for attribute in descriptor.attributes() {
            match template.peek(&attribute.name) {
                Value::Null => {}
                Value::Refs(members) if members.is_empty() => {}
                Value::Refs(_) => {
                    return Err(RemoteError::Rejected(format!(
                        "collection criterion {}.{}",
                        descriptor.name(),
                        attribute.name
                    )))
                }
                Value::Ref(target) => {
                    if self.options.broken_reference_search {
                        return Err(RemoteError::Rejected(format!(
                            "reference criterion {}.{} is unsupported",
                            descriptor.name(),
                            attribute.name
                        )));
                    }
                    let ids = match target.identifier() {
                        Some(id) => vec![id],
                        None if self.options.reject_nested_criteria => {
                            return Err(RemoteError::Rejected(format!(
                                "nested criterion {}.{} on unsaved {target}",
                                descriptor.name(),
                                attribute.name
                            )))
                        }
                        None => self.matching(records, &target)?,
                    };
                    criteria.push(Criterion::Reference(attribute.name.clone(), ids));
                }
                scalar => {
                    if let Some(scalar) = scalar.as_scalar() {
                        criteria.push(Criterion::Scalar(attribute.name.clone(), scalar));
                    }
                }
            }
        }
        Ok(criteria)
    }

    fn matching(
        &self,
        records: &BTreeMap<Identifier, Record>,
        template: &EntityRef,
    ) -> RemoteResult<Vec<Identifier>> {
        let criteria = self.criteria(records, template)?;
        let type_name = template.type_name();
        Ok(records
            .iter()
            .filter(|(_, r)| self.registry.is_subtype_of(&r.type_name, &type_name))
            .filter(|(id, r)| criteria.iter().all(|c| satisfies(**id, r, c)))
            .map(|(id, _)| *id)
            .collect())
    }
}

fn satisfies(id: Identifier, record: &Record, criterion: &Criterion) -> bool {
    match criterion {
        Criterion::Identifier(expected) => id == *expected,
        Criterion::Scalar(attribute, expected) => record.scalars.get(attribute) == Some(expected),
        Criterion::Reference(attribute, candidates) => record
            .members(attribute)
            .iter()
            .any(|m| candidates.contains(m)),
    }
}

fn shaped(attribute: &AttributeDescriptor, members: Vec<EntityRef>) -> Value {
    if attribute.is_collection() {
        Value::Refs(members)
    } else {
        members.into_iter().next().map_or(Value::Null, Value::Ref)
    }
}

/// The value the service assigns to an autogenerated attribute.
fn generated(attribute: &AttributeDescriptor, type_name: &str, id: Identifier) -> Option<Scalar> {
    if let Some(default) = &attribute.default {
        return Some(default.clone());
    }
    match attribute.kind {
        AttributeKind::Scalar(ScalarType::Text) => Some(Scalar::Text(format!("{type_name}-{id}"))),
        AttributeKind::Scalar(ScalarType::Int) => {
            Some(Scalar::Int(i64::try_from(id.get()).unwrap_or(i64::MAX)))
        }
        AttributeKind::Scalar(ScalarType::Bool) => Some(Scalar::Bool(false)),
        AttributeKind::Reference { .. } => None,
    }
}

impl RemoteService for InMemoryService {
    fn search(&self, request: &SearchRequest) -> RemoteResult<Vec<EntityRef>> {
        let template = &request.template;
        let detail = match &request.via {
            Some(via) => format!("{template} via {via}"),
            None => template.to_string(),
        };
        self.log_call(CallKind::Search, &template.type_name(), detail)?;

        let store = self.state.borrow();
        let ids = self.matching(&store.records, template)?;
        let type_name = template.type_name();
        let Some(via) = &request.via else {
            return ids
                .into_iter()
                .map(|id| self.materialize(&store.records, id, &type_name, 0, None))
                .collect();
        };

        let attribute = template.attribute(via)?;
        let target = attribute.target().unwrap_or(type_name.as_str()).to_string();
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for id in ids {
            let record = Self::record(&store.records, &type_name, id)?;
            for member in record.members(via) {
                if seen.insert(*member) {
                    result.push(self.materialize(&store.records, *member, &target, 0, None)?);
                }
            }
        }
        Ok(result)
    }

    fn search_by_query_string(&self, query: &str) -> RemoteResult<Vec<EntityRef>> {
        let parsed = parse_query(query)?;
        self.log_call(CallKind::Query, &parsed.type_name, query.to_string())?;
        let descriptor = self
            .registry
            .get(&parsed.type_name)
            .ok_or_else(|| RemoteError::UnknownType(parsed.type_name.clone()))?;

        let mut criteria = Vec::with_capacity(parsed.criteria.len());
        for (attribute, literal) in &parsed.criteria {
            let criterion = if attribute == "id" {
                match literal {
                    Scalar::Int(n) => Criterion::Identifier(Identifier::new(u64::try_from(*n).unwrap_or(0))),
                    other => {
                        return Err(RemoteError::InvalidQuery(format!("id must be an integer, not {other}")))
                    }
                }
            } else {
                let declared = descriptor.attribute_named(attribute).ok_or_else(|| {
                    RemoteError::InvalidQuery(format!("{} has no attribute {attribute}", descriptor.name()))
                })?;
                match (declared.is_reference(), literal) {
                    (true, Scalar::Int(n)) => Criterion::Reference(
                        attribute.clone(),
                        vec![Identifier::new(u64::try_from(*n).unwrap_or(0))],
                    ),
                    (true, other) => {
                        return Err(RemoteError::InvalidQuery(format!(
                            "{attribute} is a reference and needs an identifier, not {other}"
                        )))
                    }
                    (false, scalar) => Criterion::Scalar(attribute.clone(), scalar.clone()),
                }
            };
            criteria.push(criterion);
        }

        let store = self.state.borrow();
        store
            .records
            .iter()
            .filter(|(_, r)| self.registry.is_subtype_of(&r.type_name, &parsed.type_name))
            .filter(|(id, r)| criteria.iter().all(|c| satisfies(**id, r, c)))
            .map(|(id, _)| self.materialize(&store.records, *id, &parsed.type_name, 0, None))
            .collect()
    }

    fn fetch_association(&self, entity: &EntityRef, attribute: &str) -> RemoteResult<Value> {
        self.log_call(CallKind::FetchAssociation, &entity.type_name(), format!("{entity}.{attribute}"))?;
        let descriptor = entity.attribute(attribute)?;
        let Some(target) = descriptor.target() else {
            return Err(RemoteError::Rejected(format!(
                "{}.{attribute} is not an association",
                entity.type_name()
            )));
        };
        let id = entity
            .identifier()
            .ok_or_else(|| RemoteError::Rejected(format!("{entity} has no identifier")))?;
        let store = self.state.borrow();
        let record = Self::record(&store.records, &entity.type_name(), id)?;
        let mut members = Vec::new();
        for member in record.members(attribute) {
            members.push(self.materialize(&store.records, *member, target, 1, None)?);
        }
        Ok(shaped(&descriptor, members))
    }

    fn create_object(&self, template: &EntityRef) -> RemoteResult<EntityRef> {
        self.log_call(CallKind::Create, &template.type_name(), template.to_string())?;
        let (_, response) = self.persist(template, Mode::Create)?;
        Ok(response)
    }

    fn update_object(&self, template: &EntityRef) -> RemoteResult<EntityRef> {
        self.log_call(CallKind::Update, &template.type_name(), template.to_string())?;
        let (_, response) = self.persist(template, Mode::Update)?;
        Ok(response)
    }

    fn remove_object(&self, entity: &EntityRef) -> RemoteResult<()> {
        self.log_call(CallKind::Remove, &entity.type_name(), entity.to_string())?;
        let id = entity
            .identifier()
            .ok_or_else(|| RemoteError::Rejected(format!("cannot remove unsaved {entity}")))?;
        let mut store = self.state.borrow_mut();
        Self::record(&store.records, &entity.type_name(), id)?;

        let mut doomed = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !doomed.insert(next) {
                continue;
            }
            let Some(record) = store.records.get(&next) else {
                continue;
            };
            let Some(descriptor) = self.registry.get(&record.type_name) else {
                continue;
            };
            for attribute in descriptor.attributes().iter().filter(|a| a.cascaded) {
                stack.extend(record.members(&attribute.name).iter().copied());
            }
        }
        store.records.retain(|id, _| !doomed.contains(id));
        for record in store.records.values_mut() {
            for members in record.refs.values_mut() {
                members.retain(|m| !doomed.contains(m));
            }
        }
        debug!(entity = %entity, removed = doomed.len(), "records removed");
        Ok(())
    }
}
