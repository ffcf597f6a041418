use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::condition::{ConditionType, is_condition_true};

/// An image registry credentials can be issued for.
///
/// Registries are deployed by a separate component; this operator only reads
/// their readiness, hostname and TLS Secret.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "registry.stackable.tech",
    version = "v1alpha1",
    kind = "ImageRegistry",
    plural = "imageregistries",
    status = "ImageRegistryStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RegistryTls>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryTls {
    /// Secret holding the registry certificate and its CA as `ca.crt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Public hostname clients use to reach the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

impl ImageRegistry {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| is_condition_true(&status.conditions, ConditionType::Ready))
    }

    /// The reported hostname, or the in-cluster service name below `dns_zone`.
    pub fn hostname(&self, dns_zone: &str) -> String {
        match self
            .status
            .as_ref()
            .and_then(|status| status.hostname.as_deref())
        {
            Some(hostname) if !hostname.is_empty() => hostname.to_owned(),
            _ => format!(
                "{}.{}.{dns_zone}",
                self.name_any(),
                self.namespace().unwrap_or_default()
            ),
        }
    }

    /// Name of the Secret holding the registry CA certificate.
    pub fn tls_secret_name(&self) -> String {
        let from_status = self
            .status
            .as_ref()
            .and_then(|status| status.tls_secret_name.clone());
        let from_spec = self.spec.tls.as_ref().and_then(|tls| tls.secret_name.clone());

        from_status
            .filter(|name| !name.is_empty())
            .or_else(|| from_spec.filter(|name| !name.is_empty()))
            .unwrap_or_else(|| format!("{}-tls", self.name_any()))
    }
}

#[cfg(test)]
mod tests {
    use jiff::Timestamp;
    use rstest::rstest;

    use super::*;
    use crate::status::condition::{ConditionReason, new_condition};

    fn registry(status: Option<ImageRegistryStatus>, spec: ImageRegistrySpec) -> ImageRegistry {
        let mut registry = ImageRegistry::new("registry", spec);
        registry.metadata.namespace = Some("infra".to_owned());
        registry.status = status;
        registry
    }

    #[rstest]
    #[case(None, false)]
    #[case(Some(false), false)]
    #[case(Some(true), true)]
    fn readiness(#[case] ready: Option<bool>, #[case] expected: bool) {
        let status = ImageRegistryStatus {
            conditions: ready
                .map(|ready| {
                    new_condition(
                        ConditionType::Ready,
                        ready,
                        ConditionReason::Success,
                        "",
                        None,
                        Timestamp::UNIX_EPOCH,
                    )
                })
                .into_iter()
                .collect(),
            ..ImageRegistryStatus::default()
        };
        assert_eq!(registry(Some(status), ImageRegistrySpec::default()).is_ready(), expected);
    }

    #[test]
    fn hostname_fallback() {
        let reported = registry(
            Some(ImageRegistryStatus {
                hostname: Some("registry.example.org".to_owned()),
                ..ImageRegistryStatus::default()
            }),
            ImageRegistrySpec::default(),
        );
        assert_eq!(reported.hostname("svc.cluster.local"), "registry.example.org");

        let derived = registry(None, ImageRegistrySpec::default());
        assert_eq!(
            derived.hostname("svc.cluster.local"),
            "registry.infra.svc.cluster.local"
        );
    }

    #[test]
    fn tls_secret_name_precedence() {
        let spec = ImageRegistrySpec {
            tls: Some(RegistryTls {
                secret_name: Some("from-spec".to_owned()),
            }),
        };
        let status = ImageRegistryStatus {
            tls_secret_name: Some("from-status".to_owned()),
            ..ImageRegistryStatus::default()
        };

        assert_eq!(
            registry(Some(status), spec.clone()).tls_secret_name(),
            "from-status"
        );
        assert_eq!(registry(None, spec).tls_secret_name(), "from-spec");
        assert_eq!(
            registry(None, ImageRegistrySpec::default()).tls_secret_name(),
            "registry-tls"
        );
    }
}
