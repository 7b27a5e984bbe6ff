//! The remote persistence service boundary.
//!
//! [`RemoteService`] lists the six primitives the mediator consumes.
//! [`InMemoryService`] implements them over an in-memory record store and
//! reproduces the service's inconsistencies, so the mediator can be
//! exercised end to end without a network.

pub mod error;
pub mod memory;
pub mod query;
pub mod service;

pub use error::{RemoteError, RemoteResult};
pub use memory::{InMemoryService, ServiceOptions};
pub use query::{parse_query, Query};
pub use service::{Call, CallKind, RemoteService, SearchRequest};
