use std::collections::BTreeMap;

use jiff::Timestamp;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::time::{self, Duration};

/// Authorization labels of an account, matched by registry access policies.
pub type AccountLabels = BTreeMap<String, Vec<String>>;

/// A registry user.
///
/// Accounts are never modified after creation. Password rotation creates a
/// new account and the old one is removed once its `ttl` elapsed.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "registry.stackable.tech",
    version = "v1alpha1",
    kind = "ImageRegistryAccount",
    plural = "imageregistryaccounts",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryAccountSpec {
    /// bcrypt hash of the account password.
    pub password: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: AccountLabels,

    /// Lifetime after which the account is deleted, e.g. `24h`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl ImageRegistryAccount {
    pub fn created_at(&self) -> Option<Timestamp> {
        self.metadata.creation_timestamp.as_ref().map(|time| time.0)
    }

    /// Point in time after which the account must not be used anymore.
    ///
    /// Accounts without `ttl` or without a creation timestamp never expire.
    pub fn expires_at(&self) -> Option<Timestamp> {
        let ttl = self.spec.ttl?;
        Some(time::add(self.created_at()?, ttl))
    }

    pub fn expired(&self, now: Timestamp) -> bool {
        self.expires_at().is_some_and(|expires_at| now > expires_at)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn account(created: Option<&str>, ttl: Option<Duration>) -> ImageRegistryAccount {
        let mut account = ImageRegistryAccount::new(
            "pull.app.pull-1.1",
            ImageRegistryAccountSpec {
                password: "hash".to_owned(),
                labels: AccountLabels::new(),
                ttl,
            },
        );
        account.metadata.creation_timestamp = created.map(|created| Time(created.parse().unwrap()));
        account
    }

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    #[test]
    fn expires_after_ttl() {
        let account = account(Some("2026-01-01T00:00:00Z"), Some(Duration::from_hours(24)));

        assert_eq!(account.expires_at(), Some(ts("2026-01-02T00:00:00Z")));
        assert!(!account.expired(ts("2026-01-01T12:00:00Z")));
        assert!(!account.expired(ts("2026-01-02T00:00:00Z")));
        assert!(account.expired(ts("2026-01-02T00:00:01Z")));
    }

    #[test]
    fn never_expires_without_ttl() {
        let account = account(Some("2026-01-01T00:00:00Z"), None);
        assert!(!account.expired(ts("2100-01-01T00:00:00Z")));
    }

    #[test]
    fn never_expires_before_creation() {
        let account = account(None, Some(Duration::from_secs(1)));
        assert!(!account.expired(ts("2100-01-01T00:00:00Z")));
    }

    #[test]
    fn ttl_is_human_readable() {
        let account = account(None, Some(Duration::from_hours(36)));
        let json = serde_json::to_value(&account.spec).unwrap();
        assert_eq!(json["ttl"], "1d12h");
    }
}
