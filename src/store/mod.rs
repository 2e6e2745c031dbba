//! The narrow interface the reconciler uses to reach the API store.
//!
//! Everything the reconciler knows about the cluster comes through [`Store`]:
//! get-by-key, create, conditional update and list. [`KubeStore`] talks to a
//! real API server through `kube::Api`; [`MemoryStore`] is an executable model
//! of the API server used by the tests and for local runs.

pub mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;
pub use memory::{FaultPoint, MemoryStore, StoreEvent, StoreEventType};

use kube::core::NamespaceResourceScope;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::{self, Debug};
use std::future::Future;
use thiserror::Error;

/// Any namespaced, statically typed object the store can hold.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("object was modified concurrently")]
    Conflict,
    #[error("object rejected as invalid: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store transport failed: {0}")]
    Transport(#[source] kube::Error),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => match (resp.reason.as_str(), resp.code) {
                ("NotFound", _) | (_, 404) => StoreError::NotFound,
                ("AlreadyExists", _) => StoreError::AlreadyExists,
                ("Conflict", _) | (_, 409) => StoreError::Conflict,
                ("Invalid", _) | ("BadRequest", _) | (_, 400) | (_, 422) => {
                    StoreError::Invalid(resp.message.clone())
                }
                _ => StoreError::Unavailable(format!("{}: {}", resp.reason, resp.message)),
            },
            // Raised client-side before any request is sent, e.g. an empty object name.
            kube::Error::BuildRequest(request_err) => StoreError::Invalid(request_err.to_string()),
            _ => StoreError::Transport(err),
        }
    }
}

/// Namespace/name identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object from its metadata, if both fields are set.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(ObjectKey::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The last-observed version of an object, used as the update precondition.
pub fn version_of<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta().resource_version.as_deref()
}

/// Backing API store. Updates are optimistic: they only apply when the stored
/// object is still at `expected_version`, otherwise they fail with
/// [`StoreError::Conflict`].
pub trait Store: Send + Sync {
    fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<K, StoreError>> + Send;

    fn create<K: StoreObject>(&self, obj: &K) -> impl Future<Output = Result<K, StoreError>> + Send;

    fn update<K: StoreObject>(
        &self,
        obj: &K,
        expected_version: &str,
    ) -> impl Future<Output = Result<K, StoreError>> + Send;

    fn list<K: StoreObject>(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<K>, StoreError>> + Send;
}
