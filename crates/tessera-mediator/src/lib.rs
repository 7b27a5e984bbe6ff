//! Client-side mediator between an application's object graph and a remote
//! object store.
//!
//! A [`Database`] keeps one canonical in-memory instance per persistent
//! entity, tracks what changed since each entity was last in sync with the
//! service, cleans the inconsistent graphs the service returns, loads
//! associations on first access, and writes entity graphs back with
//! cascading create and update semantics.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod operation;

mod detox;
mod lazy;
mod reader;
mod reconcile;
mod template;
mod writer;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::{CacheConfig, CorrectiveUpdate, LazyLoadingConfig, MediatorConfig, ReaderConfig};
pub use database::{Database, LazyLoadingGuard, SessionId};
pub use error::{ErrorKind, MediatorError, MediatorResult};
pub use logging::init_logging;
pub use operation::{Operation, OperationKind, Subject};
pub use reader::FindOptions;

// Re-export the model and service types callers need alongside the mediator
pub use tessera_remote::{InMemoryService, RemoteService, ServiceOptions};
pub use tessera_types::{EntityRef, Identifier, Registry, Value};
