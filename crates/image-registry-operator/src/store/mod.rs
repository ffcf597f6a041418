//! Access to the objects the controllers read and write.
//!
//! [`Store`] is the seam between the reconcilers and the Kubernetes API.
//! [`KubeStore`] talks to a real cluster, [`InMemoryStore`] keeps everything in
//! process and is used to exercise the controllers without one.

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, Snafu};

use crate::kvp::MAX_LABEL_VALUE_LENGTH;

mod client;
mod memory;

pub use client::KubeStore;
pub use memory::InMemoryStore;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{key} already exists"))]
    AlreadyExists { key: ObjectKey },

    #[snafu(display("{key} was modified concurrently"))]
    Conflict { key: ObjectKey },

    #[snafu(display("{key} does not exist"))]
    NotFound { key: ObjectKey },

    #[snafu(display("label value {value:?} is longer than {MAX_LABEL_VALUE_LENGTH} characters"))]
    InvalidLabelValue { value: String },

    #[snafu(display("{kind} object has no {field}"))]
    MissingMetadata { kind: String, field: &'static str },

    #[snafu(display("failed to {verb} {key}"))]
    Request {
        source: kube::Error,
        verb: &'static str,
        key: ObjectKey,
    },

    #[snafu(display("failed to convert {key}"))]
    Convert {
        source: serde_json::Error,
        key: ObjectKey,
    },
}

impl Error {
    /// Another writer modified the object since it was read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Identifies one object of a namespaced kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new<K: StoredResource>(namespace: &str, name: &str) -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Builds the key of `obj`, which must have a name and a namespace.
    pub fn of<K: StoredResource>(obj: &K) -> Result<Self> {
        let kind = K::kind(&()).into_owned();
        let namespace = obj.namespace().context(MissingMetadataSnafu {
            kind: kind.clone(),
            field: "namespace",
        })?;
        let name = obj.meta().name.clone().context(MissingMetadataSnafu {
            kind: kind.clone(),
            field: "name",
        })?;
        Ok(Self {
            kind,
            namespace,
            name,
        })
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Objects that can be kept in a [`Store`].
pub trait StoredResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// Reads and writes namespaced objects.
///
/// Writes carrying a `resourceVersion` fail with [`Error::Conflict`] if the
/// stored object changed in the meantime.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Returns [`None`] if the object does not exist.
    async fn get<K: StoredResource>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Fails with [`Error::AlreadyExists`] if an object with the same name exists.
    async fn create<K: StoredResource>(&self, obj: &K) -> Result<K>;

    /// Replaces everything except the status.
    async fn update<K: StoredResource>(&self, obj: &K) -> Result<K>;

    /// Replaces only the status.
    async fn update_status<K: StoredResource>(&self, obj: &K) -> Result<K>;

    /// Deleting an object that does not exist is not an error.
    async fn delete<K: StoredResource>(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_all_matching_label<K: StoredResource>(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;
}
