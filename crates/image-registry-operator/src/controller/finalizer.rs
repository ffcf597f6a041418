//! Finalizer bookkeeping on top of a [`Store`].

use crate::store::{self, Store, StoredResource};

/// Checks whether `finalizer` is in the list of finalizers of `resource`.
pub fn has_finalizer<K: StoredResource>(resource: &K, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}

/// Checks whether `resource` is being deleted and only waits for its finalizers.
pub fn has_deletion_stamp<K: StoredResource>(resource: &K) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

/// Adds `finalizer` to `resource` and writes it back.
///
/// The write carries the resource version that was read, so it fails with a
/// conflict instead of overwriting concurrent changes.
pub async fn add_finalizer<K, S>(store: &S, resource: &K, finalizer: &str) -> store::Result<K>
where
    K: StoredResource,
    S: Store,
{
    let mut resource = resource.clone();
    resource
        .meta_mut()
        .finalizers
        .get_or_insert_default()
        .push(finalizer.to_owned());
    store.update(&resource).await
}

/// Removes `finalizer` from `resource` and writes it back.
pub async fn remove_finalizer<K, S>(store: &S, resource: &K, finalizer: &str) -> store::Result<K>
where
    K: StoredResource,
    S: Store,
{
    let mut resource = resource.clone();
    if let Some(finalizers) = resource.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
    store.update(&resource).await
}

#[cfg(test)]
mod tests {
    use jiff::Timestamp;
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};

    use super::*;
    use crate::{store::InMemoryStore, time::ManualClock};

    const FINALIZER: &str = "registry.stackable.tech/test";

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_owned()),
                namespace: Some("default".to_owned()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn add_and_remove() {
        let store = InMemoryStore::new(ManualClock::new(Timestamp::UNIX_EPOCH));
        let created = store.create(&config_map()).await.unwrap();
        assert!(!has_finalizer(&created, FINALIZER));

        let finalized = add_finalizer(&store, &created, FINALIZER).await.unwrap();
        assert!(has_finalizer(&finalized, FINALIZER));

        store.delete::<ConfigMap>("default", "cm").await.unwrap();
        let deleting: ConfigMap = store.get("default", "cm").await.unwrap().unwrap();
        assert!(has_deletion_stamp(&deleting));

        remove_finalizer(&store, &deleting, FINALIZER).await.unwrap();
        assert!(store.get::<ConfigMap>("default", "cm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_object_conflicts() {
        let store = InMemoryStore::new(ManualClock::new(Timestamp::UNIX_EPOCH));
        let created = store.create(&config_map()).await.unwrap();
        add_finalizer(&store, &created, FINALIZER).await.unwrap();

        let error = add_finalizer(&store, &created, "other").await.unwrap_err();
        assert!(error.is_conflict());
    }
}
