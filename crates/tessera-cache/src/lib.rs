//! Identity map for the tessera mediator.
//!
//! The remote service hands out a fresh object for every fetch. The
//! [`IdentityCache`] maps `(entity type, derived key)` to one canonical
//! instance so that every caller observing the same logical entity observes
//! the same object.
//!
//! # Design Rules
//!
//! 1. At most one instance per `(type, key)` is reachable through the cache.
//! 2. Adding an entity without a derivable key is a caller error.
//! 3. Nothing is evicted implicitly; sticky types also survive `clear`.

pub mod cache;
pub mod error;

pub use cache::{default_key, IdentityCache, KeyExtractor};
pub use error::{CacheError, CacheResult};
