//! Resolves the registry a credential request points at.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::{ImageRegistry, ImageRegistryRef, SECRET_KEY_CA_CERT},
    status::condition::ConditionReason,
    store::{self, Store},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("ImageRegistry {namespace}/{name} does not exist"))]
    RegistryNotFound { namespace: String, name: String },

    #[snafu(display("ImageRegistry {namespace}/{name} is not ready"))]
    RegistryNotReady { namespace: String, name: String },

    #[snafu(display("TLS Secret {namespace}/{name} of the registry does not exist"))]
    MissingTlsSecret { namespace: String, name: String },

    #[snafu(display("TLS Secret {namespace}/{name} of the registry has no \"ca.crt\" entry"))]
    MissingCaCertificate { namespace: String, name: String },

    #[snafu(display("failed to look up the registry"))]
    Store { source: store::Error },
}

impl Error {
    /// The condition reason for errors that are resolved by waiting for the
    /// registry, [`None`] for errors that should fail the reconciliation.
    pub fn unavailable_reason(&self) -> Option<ConditionReason> {
        match self {
            Self::RegistryNotFound { .. } | Self::RegistryNotReady { .. } => {
                Some(ConditionReason::RegistryUnavailable)
            }
            Self::MissingTlsSecret { .. } | Self::MissingCaCertificate { .. } => {
                Some(ConditionReason::InvalidRegistryCertificate)
            }
            Self::Store { .. } => None,
        }
    }
}

/// What the rotation needs to know about a ready registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetRegistry {
    pub namespace: String,
    pub hostname: String,
    pub ca_certificate: Vec<u8>,
}

/// Registry settings shared by all requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryDefaults {
    /// Used by requests without a `registryRef`.
    pub default_registry: ImageRegistryRef,

    /// DNS zone of in-cluster service names, e.g. `svc.cluster.local`.
    pub dns_zone: String,
}

impl RegistryDefaults {
    /// Returns `(namespace, name)` of the registry a request in
    /// `request_namespace` refers to.
    pub fn registry_key<'a>(
        &'a self,
        request_namespace: &'a str,
        reference: Option<&'a ImageRegistryRef>,
    ) -> (&'a str, &'a str) {
        match reference {
            Some(reference) => (
                reference.namespace.as_deref().unwrap_or(request_namespace),
                &reference.name,
            ),
            None => (
                self.default_registry
                    .namespace
                    .as_deref()
                    .unwrap_or(request_namespace),
                &self.default_registry.name,
            ),
        }
    }
}

/// Looks up the registry and its CA certificate.
///
/// This is done on every reconciliation so hostname and certificate changes
/// are picked up.
pub async fn resolve<S: Store>(
    store: &S,
    defaults: &RegistryDefaults,
    request_namespace: &str,
    reference: Option<&ImageRegistryRef>,
) -> Result<TargetRegistry, Error> {
    let (namespace, name) = defaults.registry_key(request_namespace, reference);

    let registry: ImageRegistry = store
        .get(namespace, name)
        .await
        .context(StoreSnafu)?
        .context(RegistryNotFoundSnafu { namespace, name })?;
    if !registry.is_ready() {
        return RegistryNotReadySnafu { namespace, name }.fail();
    }

    let tls_secret_name = registry.tls_secret_name();
    let tls_secret: Secret = store
        .get(namespace, &tls_secret_name)
        .await
        .context(StoreSnafu)?
        .context(MissingTlsSecretSnafu {
            namespace,
            name: &tls_secret_name,
        })?;
    let ca_certificate = tls_secret
        .data
        .as_ref()
        .and_then(|data| data.get(SECRET_KEY_CA_CERT))
        .filter(|ca| !ca.0.is_empty())
        .context(MissingCaCertificateSnafu {
            namespace,
            name: &tls_secret_name,
        })?;

    Ok(TargetRegistry {
        namespace: registry.namespace().unwrap_or_else(|| namespace.to_owned()),
        hostname: registry.hostname(&defaults.dns_zone),
        ca_certificate: ca_certificate.0.clone(),
    })
}
