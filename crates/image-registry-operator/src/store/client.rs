use async_trait::async_trait;
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use serde_json::json;
use snafu::ResultExt;

use crate::store::{
    AlreadyExistsSnafu, ConflictSnafu, ConvertSnafu, Error, NotFoundSnafu, ObjectKey,
    RequestSnafu, Result, Store, StoredResource,
};

/// A [`Store`] backed by the Kubernetes API server.
///
/// It wraps an underlying [`kube::Client`] and applies the same field manager
/// to every write.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    post_params: PostParams,
    merge_patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: field_manager.clone(),
                ..PostParams::default()
            },
            merge_patch_params: PatchParams {
                field_manager,
                ..PatchParams::default()
            },
            delete_params: DeleteParams::default(),
        }
    }

    fn api<K: StoredResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("field_manager", &self.post_params.field_manager)
            .finish_non_exhaustive()
    }
}

/// Translates API errors with well-known semantics into the matching [`Error`] variant.
fn classify(error: kube::Error, verb: &'static str, key: ObjectKey) -> Error {
    if let kube::Error::Api(response) = &error {
        match (response.code, response.reason.as_str()) {
            (404, _) => return NotFoundSnafu { key }.build(),
            (409, "AlreadyExists") => return AlreadyExistsSnafu { key }.build(),
            (409, _) => return ConflictSnafu { key }.build(),
            _ => {}
        }
    }
    Error::Request {
        source: error,
        verb,
        key,
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoredResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|error| classify(error, "get", ObjectKey::new::<K>(namespace, name)))
    }

    async fn create<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj)?;
        tracing::debug!(object = %key, "creating object");
        self.api::<K>(&key.namespace)
            .create(&self.post_params, obj)
            .await
            .map_err(|error| classify(error, "create", key))
    }

    async fn update<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj)?;
        tracing::debug!(object = %key, "updating object");
        self.api::<K>(&key.namespace)
            .replace(&key.name, &self.post_params, obj)
            .await
            .map_err(|error| classify(error, "update", key))
    }

    async fn update_status<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj)?;
        let status = serde_json::to_value(obj)
            .with_context(|_| ConvertSnafu { key: key.clone() })?
            .get("status")
            .cloned()
            .unwrap_or_default();
        // The resource version turns the merge patch into a conditional write
        let patch = json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": status,
        });
        tracing::debug!(object = %key, "updating object status");
        self.api::<K>(&key.namespace)
            .patch_status(&key.name, &self.merge_patch_params, &Patch::Merge(&patch))
            .await
            .map_err(|error| classify(error, "update status of", key))
    }

    async fn delete<K: StoredResource>(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api::<K>(namespace).delete(name, &self.delete_params).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error).context(RequestSnafu {
                verb: "delete",
                key: ObjectKey::new::<K>(namespace, name),
            }),
        }
    }

    async fn delete_all_matching_label<K: StoredResource>(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let selector = format!("{key}={value}");
        tracing::debug!(namespace, selector = selector.as_str(), "deleting matching objects");
        self.api::<K>(namespace)
            .delete_collection(
                &self.delete_params,
                &ListParams::default().labels(&selector),
            )
            .await
            .map(|_| ())
            .context(RequestSnafu {
                verb: "delete",
                key: ObjectKey::new::<K>(namespace, &selector),
            })
    }
}
