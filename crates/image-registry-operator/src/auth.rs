//! Authenticates registry clients against [`ImageRegistryAccount`]s.
//!
//! The username is the name of the account. Accounts are looked up in a
//! single namespace and kept in a small cache, the password is checked
//! against the stored hash on every call.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use jiff::Timestamp;
use snafu::{ResultExt, Snafu};

use crate::{
    crd::{ImageRegistryAccount, account::AccountLabels},
    password,
    store::{self, Store},
    time::{self, Clock, Duration},
};

/// How long an account is served from the cache before it is read again.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_mins(10);

/// Label marking accounts that were issued from a custom resource.
pub const ORIGIN_LABEL: &str = "origin";
pub const ORIGIN_CUSTOM_RESOURCE: &str = "cr";
pub const ACCOUNT_LABEL: &str = "account";

/// Labels handed to the registry's authorization policy.
pub type AuthorizationLabels = AccountLabels;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up account {namespace}/{name}"))]
    LookupAccount {
        source: store::Error,
        namespace: String,
        name: String,
    },
}

#[derive(Debug)]
struct CacheEntry {
    password_hash: String,
    labels: AuthorizationLabels,
    inserted_at: Timestamp,
    expires_at: Option<Timestamp>,
}

pub struct Authenticator<S> {
    store: S,
    namespace: String,
    cache_ttl: Duration,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

impl<S> std::fmt::Debug for Authenticator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("namespace", &self.namespace)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Authenticator<S> {
    pub fn new(
        store: S,
        namespace: impl Into<String>,
        cache_ttl: Duration,
        clock: impl Clock,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            cache_ttl,
            clock: Arc::new(clock),
            cache: Mutex::default(),
        }
    }

    /// Returns the labels of the account if `username` and `password` match,
    /// [`None`] otherwise.
    ///
    /// Unknown accounts, wrong passwords, expired accounts and malformed
    /// hashes are indistinguishable for the caller. Only failures to talk to
    /// the store are reported as errors.
    #[tracing::instrument(skip(self, password))]
    pub async fn try_authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthorizationLabels>, Error> {
        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }

        let now = self.clock.now();
        let (entry, cached) = match self.cached(username, now) {
            Some(entry) => (entry, true),
            None => match self.lookup(username).await? {
                Some(entry) => (entry, false),
                None => {
                    tracing::debug!("account does not exist");
                    return Ok(None);
                }
            },
        };

        if entry.expires_at.is_some_and(|expires_at| now > expires_at) {
            tracing::debug!("account expired");
            return Ok(None);
        }
        if !verify(&entry.password_hash, password).await {
            tracing::debug!("password mismatch");
            return Ok(None);
        }

        if !cached {
            self.insert(username, entry.clone(), now);
        }
        Ok(Some(entry.labels.clone()))
    }

    /// Like [`Self::try_authenticate`], but store failures are logged and
    /// treated as rejected credentials.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Option<AuthorizationLabels> {
        match self.try_authenticate(username, password).await {
            Ok(labels) => labels,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "authentication failed"
                );
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Timestamp) -> bool {
        now < time::add(entry.inserted_at, self.cache_ttl)
    }

    fn cached(&self, username: &str, now: Timestamp) -> Option<Arc<CacheEntry>> {
        self.lock()
            .get(username)
            .filter(|entry| self.is_fresh(entry, now))
            .cloned()
    }

    /// Inserts `entry` and drops every entry that outlived the cache TTL.
    fn insert(&self, username: &str, entry: Arc<CacheEntry>, now: Timestamp) {
        let mut cache = self.lock();
        cache.retain(|_, cached| self.is_fresh(cached, now));
        cache.insert(username.to_owned(), entry);
    }

    async fn lookup(&self, username: &str) -> Result<Option<Arc<CacheEntry>>, Error> {
        let account: Option<ImageRegistryAccount> = self
            .store
            .get(&self.namespace, username)
            .await
            .context(LookupAccountSnafu {
                namespace: &self.namespace,
                name: username,
            })?;

        Ok(account.map(|account| {
            let mut labels = account.spec.labels.clone();
            labels.insert(
                ORIGIN_LABEL.to_owned(),
                vec![ORIGIN_CUSTOM_RESOURCE.to_owned()],
            );
            labels.insert(ACCOUNT_LABEL.to_owned(), vec![username.to_owned()]);
            Arc::new(CacheEntry {
                password_hash: account.spec.password.clone(),
                labels,
                inserted_at: self.clock.now(),
                expires_at: account.expires_at(),
            })
        }))
    }

    #[cfg(test)]
    fn cached_usernames(&self) -> Vec<String> {
        let mut usernames: Vec<_> = self.lock().keys().cloned().collect();
        usernames.sort();
        usernames
    }
}

/// Checks the password on the blocking pool, bcrypt is deliberately slow.
async fn verify(hash: &str, candidate: &str) -> bool {
    let hash = hash.to_owned();
    let candidate = candidate.to_owned();
    match tokio::task::spawn_blocking(move || password::verify_password(&hash, &candidate)).await {
        Ok(matches) => matches,
        Err(error) => {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                "password verification panicked"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        crd::ImageRegistryAccountSpec,
        store::{InMemoryStore, ObjectKey, StoredResource},
        time::ManualClock,
    };

    const USERNAME: &str = "pull.app.pull-1.1";
    const PASSWORD: &str = "1=correct-horse-battery";

    fn start() -> Timestamp {
        "2026-03-01T00:00:00Z".parse().unwrap()
    }

    async fn setup(ttl: Option<Duration>) -> (ManualClock, Authenticator<InMemoryStore>) {
        let clock = ManualClock::new(start());
        let store = InMemoryStore::new(clock.clone());
        create_account(&store, USERNAME, PASSWORD, ttl).await;
        let authenticator = Authenticator::new(store, "infra", DEFAULT_CACHE_TTL, clock.clone());
        (clock, authenticator)
    }

    async fn create_account(
        store: &InMemoryStore,
        name: &str,
        password: &str,
        ttl: Option<Duration>,
    ) {
        let mut account = ImageRegistryAccount::new(
            name,
            ImageRegistryAccountSpec {
                password: password::hash_password(password).unwrap(),
                labels: AccountLabels::from([
                    ("namespace".to_owned(), vec!["app".to_owned()]),
                    ("name".to_owned(), vec!["pull-1".to_owned()]),
                    ("accessMode".to_owned(), vec!["pull".to_owned()]),
                ]),
                ttl,
            },
        );
        account.metadata.namespace = Some("infra".to_owned());
        store.create(&account).await.unwrap();
    }

    async fn delete_account(authenticator: &Authenticator<InMemoryStore>) {
        authenticator
            .store
            .delete::<ImageRegistryAccount>("infra", USERNAME)
            .await
            .unwrap();
    }

    /// Fails every request as if the API server was unreachable.
    struct UnreachableStore;

    fn refused(verb: &'static str, key: ObjectKey) -> store::Error {
        let source = io::Error::from(io::ErrorKind::ConnectionRefused);
        store::Error::Request {
            source: kube::Error::Service(Box::new(source)),
            verb,
            key,
        }
    }

    #[async_trait]
    impl Store for UnreachableStore {
        async fn get<K: StoredResource>(
            &self,
            namespace: &str,
            name: &str,
        ) -> store::Result<Option<K>> {
            Err(refused("get", ObjectKey::new::<K>(namespace, name)))
        }

        async fn create<K: StoredResource>(&self, obj: &K) -> store::Result<K> {
            Err(refused("create", ObjectKey::of(obj)?))
        }

        async fn update<K: StoredResource>(&self, obj: &K) -> store::Result<K> {
            Err(refused("update", ObjectKey::of(obj)?))
        }

        async fn update_status<K: StoredResource>(&self, obj: &K) -> store::Result<K> {
            Err(refused("update status of", ObjectKey::of(obj)?))
        }

        async fn delete<K: StoredResource>(
            &self,
            namespace: &str,
            name: &str,
        ) -> store::Result<()> {
            Err(refused("delete", ObjectKey::new::<K>(namespace, name)))
        }

        async fn delete_all_matching_label<K: StoredResource>(
            &self,
            namespace: &str,
            _key: &str,
            _value: &str,
        ) -> store::Result<()> {
            Err(refused("delete", ObjectKey::new::<K>(namespace, "")))
        }
    }

    #[tokio::test]
    async fn correct_password_returns_labels() {
        let (_, authenticator) = setup(Some(Duration::from_hours(24))).await;

        let labels = authenticator.authenticate(USERNAME, PASSWORD).await.unwrap();

        assert_eq!(labels[ORIGIN_LABEL], ["cr"]);
        assert_eq!(labels[ACCOUNT_LABEL], [USERNAME]);
        assert_eq!(labels["namespace"], ["app"]);
        assert_eq!(labels["accessMode"], ["pull"]);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (_, authenticator) = setup(None).await;

        assert_eq!(authenticator.authenticate(USERNAME, "wrong").await, None);
        assert!(authenticator.cached_usernames().is_empty());
    }

    #[tokio::test]
    async fn empty_credentials_are_rejected() {
        let (_, authenticator) = setup(None).await;

        assert_eq!(authenticator.authenticate("", PASSWORD).await, None);
        assert_eq!(authenticator.authenticate(USERNAME, "").await, None);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let (_, authenticator) = setup(None).await;

        assert_eq!(
            authenticator
                .try_authenticate("pull.app.other.1", PASSWORD)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn expired_account_is_rejected() {
        let (clock, authenticator) = setup(Some(Duration::from_mins(5))).await;
        assert!(authenticator.authenticate(USERNAME, PASSWORD).await.is_some());

        // Still cached, but the account itself expired
        clock.advance(Duration::from_mins(6));
        assert_eq!(authenticator.authenticate(USERNAME, PASSWORD).await, None);
    }

    #[tokio::test]
    async fn cache_hit_still_checks_password() {
        let (_, authenticator) = setup(None).await;
        assert!(authenticator.authenticate(USERNAME, PASSWORD).await.is_some());
        delete_account(&authenticator).await;

        assert!(authenticator.authenticate(USERNAME, PASSWORD).await.is_some());
        assert_eq!(authenticator.authenticate(USERNAME, "wrong").await, None);
    }

    #[tokio::test]
    async fn cache_entry_expires_after_ttl() {
        let (clock, authenticator) = setup(None).await;
        assert!(authenticator.authenticate(USERNAME, PASSWORD).await.is_some());
        delete_account(&authenticator).await;

        clock.advance(Duration::from_mins(9));
        assert!(authenticator.authenticate(USERNAME, PASSWORD).await.is_some());

        clock.advance(Duration::from_mins(1));
        assert_eq!(authenticator.authenticate(USERNAME, PASSWORD).await, None);
    }

    #[tokio::test]
    async fn insert_evicts_stale_entries() {
        let (clock, authenticator) = setup(None).await;
        create_account(&authenticator.store, "pull.app.pull-2.1", PASSWORD, None).await;
        assert!(authenticator.authenticate(USERNAME, PASSWORD).await.is_some());

        clock.advance(DEFAULT_CACHE_TTL);
        assert!(
            authenticator
                .authenticate("pull.app.pull-2.1", PASSWORD)
                .await
                .is_some()
        );

        assert_eq!(authenticator.cached_usernames(), ["pull.app.pull-2.1"]);
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let clock = ManualClock::new(start());
        let authenticator = Authenticator::new(UnreachableStore, "infra", DEFAULT_CACHE_TTL, clock);

        let error = authenticator
            .try_authenticate(USERNAME, PASSWORD)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::LookupAccount { .. }));
        assert_eq!(authenticator.authenticate(USERNAME, PASSWORD).await, None);
        assert!(authenticator.cached_usernames().is_empty());
    }

    #[tokio::test]
    async fn malformed_hash_is_rejected() {
        let clock = ManualClock::new(start());
        let store = InMemoryStore::new(clock.clone());
        let mut account = ImageRegistryAccount::new(USERNAME, ImageRegistryAccountSpec {
            password: "not-a-bcrypt-hash".to_owned(),
            ..ImageRegistryAccountSpec::default()
        });
        account.metadata.namespace = Some("infra".to_owned());
        store.create(&account).await.unwrap();
        let authenticator = Authenticator::new(store, "infra", DEFAULT_CACHE_TTL, clock);

        assert_eq!(
            authenticator.try_authenticate(USERNAME, PASSWORD).await.unwrap(),
            None
        );
    }
}
