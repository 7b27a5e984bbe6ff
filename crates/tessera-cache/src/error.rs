/// Errors from identity cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The entity has neither an identifier nor a derivable cache key.
    #[error("cannot cache {entity}: no identifier and no derivable key")]
    MissingKey { entity: String },
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
