use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_types::{EntityRef, Value};

use crate::error::RemoteResult;

/// A search for entities resembling `template`.
///
/// Without `via`, the matches themselves are returned. With `via`, the
/// search hops once: the entities referenced by the matches through the
/// `via` attribute are returned instead.
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub template: EntityRef,
    pub via: Option<String>,
}

impl SearchRequest {
    pub fn new(template: EntityRef) -> Self {
        Self {
            template,
            via: None,
        }
    }

    pub fn via(template: EntityRef, attribute: &str) -> Self {
        Self {
            template,
            via: Some(attribute.to_string()),
        }
    }
}

/// The primitives the mediator needs from a remote persistence service.
///
/// Every call is synchronous and returns freshly built entities; the
/// service never hands back an instance it was given. Implementations are
/// free to exhibit the quirks the mediator is built to absorb: distinct
/// copies of the same logical entity, broken references, server-generated
/// values, and partially echoed save results.
pub trait RemoteService {
    /// Entities matching the request's template.
    fn search(&self, request: &SearchRequest) -> RemoteResult<Vec<EntityRef>>;

    /// Entities matching a declarative query string.
    fn search_by_query_string(&self, query: &str) -> RemoteResult<Vec<EntityRef>>;

    /// The current value of a reference attribute of a persisted entity.
    fn fetch_association(&self, entity: &EntityRef, attribute: &str) -> RemoteResult<Value>;

    /// Persist a new entity graph and return the saved graph.
    fn create_object(&self, template: &EntityRef) -> RemoteResult<EntityRef>;

    /// Apply the template to a persisted entity and return the saved graph.
    fn update_object(&self, template: &EntityRef) -> RemoteResult<EntityRef>;

    /// Delete a persisted entity.
    fn remove_object(&self, entity: &EntityRef) -> RemoteResult<()>;
}

/// Kind of a recorded remote call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Search,
    Query,
    FetchAssociation,
    Create,
    Update,
    Remove,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallKind::Search => "search",
            CallKind::Query => "query",
            CallKind::FetchAssociation => "fetch_association",
            CallKind::Create => "create",
            CallKind::Update => "update",
            CallKind::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// One remote round trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub kind: CallKind,
    pub type_name: String,
    pub detail: String,
}
