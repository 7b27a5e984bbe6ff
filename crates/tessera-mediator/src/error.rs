use tessera_cache::CacheError;
use tessera_remote::RemoteError;
use tessera_types::{MetadataError, TypeError};

use crate::operation::OperationKind;

/// Broad classification of a [`MediatorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed metadata or configuration. Never retried.
    Configuration,
    /// An entity failed a check before anything was submitted.
    Validation,
    /// An illegal operation sequence or a remote failure.
    Database,
}

/// Errors raised by the mediator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediatorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("{entity} is missing mandatory {}", .attributes.join(", "))]
    MissingMandatory {
        entity: String,
        attributes: Vec<String>,
    },

    #[error("recursive {kind} of {entity} rejected; in flight: {stack}")]
    RecursiveOperation {
        kind: OperationKind,
        entity: String,
        stack: String,
    },

    #[error("{entity} has no identifier")]
    MissingIdentifier { entity: String },

    #[error("{entity} already exists")]
    AlreadyPersisted { entity: String },

    #[error("{count} {type_name} entities match {key}")]
    AmbiguousFind {
        type_name: String,
        key: String,
        count: usize,
    },

    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("prerequisite {prerequisite} of {entity} could not be saved")]
    UnresolvedPrerequisite { entity: String, prerequisite: String },

    #[error("lazy loading is suspended; refusing to load {entity}.{attribute}")]
    LoaderSuspended { entity: String, attribute: String },

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("remote service: {0}")]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl MediatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediatorError::Config(_) | MediatorError::Metadata(_) => ErrorKind::Configuration,
            MediatorError::Type(TypeError::UnknownType(_) | TypeError::AbstractType(_)) => {
                ErrorKind::Configuration
            }
            MediatorError::MissingMandatory { .. }
            | MediatorError::Type(TypeError::UnknownAttribute { .. } | TypeError::WrongShape { .. }) => {
                ErrorKind::Validation
            }
            MediatorError::Type(TypeError::LoadFailed { .. })
            | MediatorError::RecursiveOperation { .. }
            | MediatorError::MissingIdentifier { .. }
            | MediatorError::AlreadyPersisted { .. }
            | MediatorError::AmbiguousFind { .. }
            | MediatorError::NotFound { .. }
            | MediatorError::UnresolvedPrerequisite { .. }
            | MediatorError::LoaderSuspended { .. }
            | MediatorError::Remote(_)
            | MediatorError::Cache(_) => ErrorKind::Database,
        }
    }
}

/// Result alias for mediator operations.
pub type MediatorResult<T> = Result<T, MediatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_taxonomy() {
        assert_eq!(MediatorError::Config("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(
            MediatorError::from(MetadataError::UnknownType("X".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            MediatorError::MissingMandatory {
                entity: "Person(new@1)".into(),
                attributes: vec!["name".into()],
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MediatorError::from(RemoteError::Transport("down".into())).kind(),
            ErrorKind::Database
        );
        assert_eq!(
            MediatorError::from(TypeError::LoadFailed {
                attribute: "site".into(),
                reason: "offline".into(),
            })
            .kind(),
            ErrorKind::Database
        );
    }

    #[test]
    fn messages_name_the_entity() {
        let err = MediatorError::MissingMandatory {
            entity: "Person(new@4)".into(),
            attributes: vec!["name".into(), "age".into()],
        };
        assert_eq!(err.to_string(), "Person(new@4) is missing mandatory name, age");
    }
}
