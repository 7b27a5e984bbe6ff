/// Errors produced by entity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    #[error("unknown entity type: {0}")]
    UnknownType(String),

    #[error("cannot instantiate abstract type {0}")]
    AbstractType(String),

    #[error("{type_name} has no attribute {attribute}")]
    UnknownAttribute { type_name: String, attribute: String },

    #[error("{type_name}.{attribute} expects {expected}, got {actual}")]
    WrongShape {
        type_name: String,
        attribute: String,
        expected: String,
        actual: String,
    },

    #[error("loading {attribute} failed: {reason}")]
    LoadFailed { attribute: String, reason: String },
}

/// Result alias for entity operations.
pub type TypeResult<T> = Result<T, TypeError>;

/// Malformed domain metadata, reported when a registry is built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("type {0} is declared twice")]
    DuplicateType(String),

    #[error("unknown type {0}")]
    UnknownType(String),

    #[error("{type_name} extends unknown type {parent}")]
    UnknownParent { type_name: String, parent: String },

    #[error("inheritance cycle through {0}")]
    InheritanceCycle(String),

    #[error("{type_name}.{attribute} references unknown type {target}")]
    UnknownTarget {
        type_name: String,
        attribute: String,
        target: String,
    },

    #[error("{type_name}.{attribute} declares invalid inverse {inverse}")]
    BadInverse {
        type_name: String,
        attribute: String,
        inverse: String,
    },

    #[error("{type_name} key names unknown attribute {attribute}")]
    UnknownKeyAttribute { type_name: String, attribute: String },

    #[error("{type_name}.{attribute} is an owner attribute but is not a singular reference")]
    InvalidOwner { type_name: String, attribute: String },

    #[error("invalid proxy for {type_name}: {reason}")]
    BadProxy { type_name: String, reason: String },

    #[error("ownership cycle among types: {}", .0.join(", "))]
    OwnershipCycle(Vec<String>),

    #[error("schema parse error: {0}")]
    Parse(String),
}

/// Result alias for metadata operations.
pub type MetadataResult<T> = Result<T, MetadataError>;
