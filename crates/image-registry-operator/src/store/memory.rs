use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde_json::Value;
use snafu::{ResultExt, ensure};

use crate::{
    kvp::MAX_LABEL_VALUE_LENGTH,
    store::{
        AlreadyExistsSnafu, ConflictSnafu, ConvertSnafu, InvalidLabelValueSnafu, NotFoundSnafu,
        ObjectKey, Result, Store, StoredResource,
    },
    time::Clock,
};

/// A [`Store`] that keeps objects in memory.
///
/// It mimics the API server behaviour the controllers rely on: resource
/// versions with conflict detection, separate status writes, finalizers that
/// delay deletion and garbage collection of objects whose owner is gone.
/// Unlike the API server it keeps the status passed to
/// [`create`](Store::create), which allows seeding objects in a ready state.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    last_version: u64,
    writes: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    /// Removes `key` and everything owned by it.
    fn remove(&mut self, key: &ObjectKey, now: Time) {
        let Some(removed) = self.objects.remove(key) else {
            return;
        };
        let Some(uid) = meta_of(&removed).uid else {
            return;
        };

        let dependents: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|(_, value)| {
                meta_of(value)
                    .owner_references
                    .unwrap_or_default()
                    .iter()
                    .any(|owner| owner.uid == uid)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for dependent in dependents {
            self.delete(&dependent, now.clone());
        }
    }

    /// Removes `key`, or only marks it as deleted while finalizers are present.
    fn delete(&mut self, key: &ObjectKey, now: Time) {
        let Some(value) = self.objects.get(key) else {
            return;
        };
        let meta = meta_of(value);
        if meta.finalizers.unwrap_or_default().is_empty() {
            self.remove(key, now);
        } else if meta.deletion_timestamp.is_none() {
            let version = self.next_version();
            let deleted_at = serde_json::to_value(now).unwrap_or_default();
            if let Some(value) = self.objects.get_mut(key) {
                value["metadata"]["deletionTimestamp"] = deleted_at;
                value["metadata"]["resourceVersion"] = Value::String(version);
            }
        }
    }
}

fn meta_of(value: &Value) -> ObjectMeta {
    value
        .get("metadata")
        .and_then(|meta| serde_json::from_value(meta.clone()).ok())
        .unwrap_or_default()
}

/// Rejects label values the API server would refuse.
fn check_label_value(value: &str) -> Result<()> {
    ensure!(
        value.len() <= MAX_LABEL_VALUE_LENGTH,
        InvalidLabelValueSnafu { value }
    );
    Ok(())
}

fn check_labels(meta: &ObjectMeta) -> Result<()> {
    meta.labels
        .iter()
        .flatten()
        .try_for_each(|(_, value)| check_label_value(value))
}

fn check_version(key: &ObjectKey, expected: Option<&String>, stored: &Value) -> Result<()> {
    match expected {
        Some(expected) if Some(expected) != meta_of(stored).resource_version.as_ref() => {
            ConflictSnafu { key: key.clone() }.fail()
        }
        _ => Ok(()),
    }
}

impl InMemoryStore {
    pub fn new(clock: impl Clock) -> Self {
        Self {
            state: Mutex::default(),
            clock: Arc::new(clock),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Returns all objects of kind `K` in `namespace`, ordered by name.
    pub fn list<K: StoredResource>(&self, namespace: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).into_owned();
        self.lock()
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind && key.namespace == namespace)
            .map(|(key, value)| {
                serde_json::from_value(value.clone()).context(ConvertSnafu { key: key.clone() })
            })
            .collect()
    }

    fn to_value<K: StoredResource>(key: &ObjectKey, obj: &K) -> Result<Value> {
        serde_json::to_value(obj).context(ConvertSnafu { key: key.clone() })
    }

    fn from_value<K: StoredResource>(key: &ObjectKey, value: Value) -> Result<K> {
        serde_json::from_value(value).context(ConvertSnafu { key: key.clone() })
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get<K: StoredResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let key = ObjectKey::new::<K>(namespace, name);
        let value = self.lock().objects.get(&key).cloned();
        value.map(|value| Self::from_value(&key, value)).transpose()
    }

    async fn create<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return AlreadyExistsSnafu { key }.fail();
        }
        check_labels(obj.meta())?;

        let version = state.next_version();
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = Some(format!("uid-{version}"));
        meta.resource_version = Some(version);
        meta.creation_timestamp = Some(Time(self.clock.now()));
        meta.deletion_timestamp = None;
        meta.generation = Some(1);

        state.objects.insert(key.clone(), Self::to_value(&key, &created)?);
        state.writes += 1;
        Ok(created)
    }

    async fn update<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.lock();
        let Some(stored) = state.objects.get(&key).cloned() else {
            return NotFoundSnafu { key }.fail();
        };
        check_version(&key, obj.meta().resource_version.as_ref(), &stored)?;
        check_labels(obj.meta())?;

        let stored_meta = meta_of(&stored);
        let mut updated = obj.clone();
        let meta = updated.meta_mut();
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
        meta.resource_version = Some(state.next_version());

        let mut value = Self::to_value(&key, &updated)?;
        let spec_changed = value.get("spec") != stored.get("spec");
        let generation = stored_meta.generation.unwrap_or(1) + i64::from(spec_changed);
        value["metadata"]["generation"] = Value::from(generation);
        match (value.as_object_mut(), stored.get("status")) {
            (Some(object), Some(status)) => {
                object.insert("status".to_owned(), status.clone());
            }
            (Some(object), None) => {
                object.remove("status");
            }
            _ => {}
        }

        state.objects.insert(key.clone(), value.clone());
        state.writes += 1;

        // Removing the last finalizer of a deleted object completes the deletion
        if stored_meta.deletion_timestamp.is_some()
            && updated.meta().finalizers.as_ref().is_none_or(Vec::is_empty)
        {
            state.remove(&key, Time(self.clock.now()));
        }
        Self::from_value(&key, value)
    }

    async fn update_status<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.lock();
        let Some(mut value) = state.objects.get(&key).cloned() else {
            return NotFoundSnafu { key }.fail();
        };
        check_version(&key, obj.meta().resource_version.as_ref(), &value)?;

        let status = Self::to_value(&key, obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        value["status"] = status;
        value["metadata"]["resourceVersion"] = Value::String(state.next_version());

        state.objects.insert(key.clone(), value.clone());
        state.writes += 1;
        Self::from_value(&key, value)
    }

    async fn delete<K: StoredResource>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::new::<K>(namespace, name);
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            state.delete(&key, Time(self.clock.now()));
            state.writes += 1;
        }
        Ok(())
    }

    async fn delete_all_matching_label<K: StoredResource>(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        check_label_value(value)?;
        let kind = K::kind(&()).into_owned();
        let mut state = self.lock();
        let matching: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|(object_key, _)| object_key.kind == kind && object_key.namespace == namespace)
            .filter(|(_, object)| {
                meta_of(object)
                    .labels
                    .is_some_and(|labels| labels.get(key).is_some_and(|v| v == value))
            })
            .map(|(object_key, _)| object_key.clone())
            .collect();

        for object_key in matching {
            state.delete(&object_key, Time(self.clock.now()));
            state.writes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use jiff::Timestamp;
    use k8s_openapi::{
        ByteString,
        api::core::v1::{ConfigMap, Secret},
        apimachinery::pkg::apis::meta::v1::OwnerReference,
    };

    use super::*;
    use crate::time::ManualClock;

    fn store() -> InMemoryStore {
        InMemoryStore::new(ManualClock::new(Timestamp::UNIX_EPOCH))
    }

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("app".to_owned()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_metadata() {
        let store = store();
        let created = store.create(&secret("a")).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(
            created.metadata.creation_timestamp,
            Some(Time(Timestamp::UNIX_EPOCH))
        );
        assert_eq!(
            store.get::<Secret>("app", "a").await.unwrap(),
            Some(created)
        );
        assert!(store.get::<Secret>("app", "b").await.unwrap().is_none());
        assert!(store.get::<ConfigMap>("app", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let store = store();
        store.create(&secret("a")).await.unwrap();

        let error = store.create(&secret("a")).await.unwrap_err();
        assert!(error.is_already_exists());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = store();
        let created = store.create(&secret("a")).await.unwrap();

        let mut first = created.clone();
        first.data = Some(BTreeMap::from([("k".to_owned(), ByteString(b"1".to_vec()))]));
        store.update(&first).await.unwrap();

        let mut second = created;
        second.data = Some(BTreeMap::from([("k".to_owned(), ByteString(b"2".to_vec()))]));
        assert!(store.update(&second).await.unwrap_err().is_conflict());
        assert!(store.update_status(&second).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn update_missing_object_fails() {
        let error = store().update(&secret("a")).await.unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn finalizers_delay_deletion() {
        let store = store();
        let mut with_finalizer = secret("a");
        with_finalizer.metadata.finalizers = Some(vec!["example.com/cleanup".to_owned()]);
        store.create(&with_finalizer).await.unwrap();

        store.delete::<Secret>("app", "a").await.unwrap();
        let mut marked = store.get::<Secret>("app", "a").await.unwrap().unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = None;
        store.update(&marked).await.unwrap();
        assert!(store.get::<Secret>("app", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_owner_collects_dependents() {
        let store = store();
        let owner = store.create(&secret("owner")).await.unwrap();
        let mut dependent = secret("dependent");
        dependent.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_owned(),
            kind: "Secret".to_owned(),
            name: "owner".to_owned(),
            uid: owner.metadata.uid.clone().unwrap(),
            controller: Some(true),
            ..OwnerReference::default()
        }]);
        store.create(&dependent).await.unwrap();
        store.create(&secret("unrelated")).await.unwrap();

        store.delete::<Secret>("app", "owner").await.unwrap();
        let names: Vec<_> = store
            .list::<Secret>("app")
            .unwrap()
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect();
        assert_eq!(names, ["unrelated"]);
    }

    #[tokio::test]
    async fn delete_by_label() {
        let store = store();
        for (name, owner) in [("a", "x"), ("b", "x"), ("c", "y")] {
            let mut labelled = secret(name);
            let labels = BTreeMap::from([("owner".to_owned(), owner.to_owned())]);
            labelled.metadata.labels = Some(labels);
            store.create(&labelled).await.unwrap();
        }

        store
            .delete_all_matching_label::<Secret>("app", "owner", "x")
            .await
            .unwrap();
        store
            .delete_all_matching_label::<Secret>("other", "owner", "y")
            .await
            .unwrap();

        let remaining: Vec<_> = store
            .list::<Secret>("app")
            .unwrap()
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect();
        assert_eq!(remaining, ["c"]);
    }

    #[tokio::test]
    async fn overlong_label_values_are_rejected() {
        let store = store();
        let value = "x".repeat(MAX_LABEL_VALUE_LENGTH + 1);
        let mut labelled = secret("a");
        labelled.metadata.labels = Some(BTreeMap::from([("owner".to_owned(), value.clone())]));

        let error = store.create(&labelled).await.unwrap_err();
        assert!(matches!(error, crate::store::Error::InvalidLabelValue { .. }));
        assert!(
            store
                .delete_all_matching_label::<Secret>("app", "owner", &value)
                .await
                .is_err()
        );

        labelled.metadata.labels = Some(BTreeMap::from([(
            "owner".to_owned(),
            "x".repeat(MAX_LABEL_VALUE_LENGTH),
        )]));
        store.create(&labelled).await.unwrap();
    }

    #[tokio::test]
    async fn deleting_missing_object_is_noop() {
        let store = store();
        store.delete::<Secret>("app", "a").await.unwrap();
        assert_eq!(store.writes(), 0);
    }
}
