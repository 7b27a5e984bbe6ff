use tessera_types::{Identifier, TypeError};

/// Errors raised by a remote persistence service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("{type_name} {id} not found")]
    NotFound { type_name: String, id: Identifier },

    /// The service refused the request under one of its business rules.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unknown type {0}")]
    UnknownType(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for remote service calls.
pub type RemoteResult<T> = Result<T, RemoteError>;
