//! Entity model for the tessera mediator.
//!
//! Every other tessera crate depends on `tessera-types`. It defines how a
//! domain object is represented in memory, how domain metadata is
//! registered, and how changes since the last sync point are tracked.
//!
//! # Key Types
//!
//! - [`EntityRef`] -- shared handle to one entity; `==` is instance identity
//! - [`Value`] -- attribute value (scalar, reference, or reference collection)
//! - [`Identifier`] -- server-assigned identifier; [`InstanceId`] -- in-memory identity
//! - [`KeyValue`] / [`KeyKind`] -- derived primary, secondary and alternate keys
//! - [`TypeDescriptor`] / [`AttributeDescriptor`] -- registered per-type metadata
//! - [`Registry`] -- validated metadata with owner-before-dependent ordering
//! - [`Snapshot`] -- tracked attribute values as of the last sync point
//! - [`AttributeLoader`] -- deferred loading hook installed per entity

pub mod entity;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod schema;
pub mod snapshot;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use entity::{AttributeLoader, EntityRef};
pub use error::{MetadataError, MetadataResult, TypeError, TypeResult};
pub use metadata::{
    AttributeDescriptor, AttributeKind, Cardinality, FetchMode, Introspection, ProxyDescriptor, Role,
    ScalarType, TypeDescriptor,
};
pub use registry::{Registry, RegistryBuilder};
pub use snapshot::{diff_snapshots, AttributeChange, RefAnchor, RefDigest, Snapshot, TrackedValue};
pub use value::{Identifier, InstanceId, KeyKind, KeyPart, KeyValue, Scalar, Value};
