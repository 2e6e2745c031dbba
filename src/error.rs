use thiserror::Error;

use crate::owner_reference::LinkError;
use crate::store::{ObjectKey, StoreError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get CharacterCounter {key}: {source}")]
    IntentGetFailed {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("Failed to reconcile {kind} {key}: {source}")]
    ConvergeFailed {
        kind: &'static str,
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("Failed to set owner reference on {kind} {key}: {source}")]
    LinkFailed {
        kind: &'static str,
        key: ObjectKey,
        #[source]
        source: LinkError,
    },
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

/// How the host should treat a failed reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; the same input may succeed next time.
    Transient,
    /// Retrying the same intent would fail the same way.
    Permanent,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Invalid(_) => ErrorClass::Permanent,
            StoreError::NotFound
            | StoreError::AlreadyExists
            | StoreError::Conflict
            | StoreError::Unavailable(_)
            | StoreError::Transport(_) => ErrorClass::Transient,
        }
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::IntentGetFailed { source, .. } | Error::ConvergeFailed { source, .. } => {
                source.class()
            }
            Error::LinkFailed { source, .. } if source.is_retryable() => ErrorClass::Transient,
            Error::LinkFailed { .. } | Error::MissingObjectKey(_) => ErrorClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_store_failures() {
        let key = ObjectKey::new("default", "srv");
        let conflict = Error::ConvergeFailed {
            kind: "Service",
            key: key.clone(),
            source: StoreError::Conflict,
        };
        assert_eq!(conflict.class(), ErrorClass::Transient);

        let invalid = Error::ConvergeFailed {
            kind: "Deployment",
            key: key.clone(),
            source: StoreError::Invalid("selector is immutable".to_string()),
        };
        assert_eq!(invalid.class(), ErrorClass::Permanent);
        assert_eq!(
            invalid.to_string(),
            "Failed to reconcile Deployment default/srv: object rejected as invalid: selector is immutable"
        );
    }

    #[test]
    fn classifies_link_failures() {
        let key = ObjectKey::new("default", "srv");
        let gone = Error::LinkFailed {
            kind: "Service",
            key: key.clone(),
            source: LinkError::OwnerNotPersisted("counter".to_string()),
        };
        assert_eq!(gone.class(), ErrorClass::Transient);

        let stolen = Error::LinkFailed {
            kind: "Service",
            key,
            source: LinkError::AlreadyControlled {
                kind: "Other".to_string(),
                name: "x".to_string(),
            },
        };
        assert_eq!(stolen.class(), ErrorClass::Permanent);
    }
}
