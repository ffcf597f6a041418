use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{AccessMode, CredentialRequest, CredentialRequestStatus, ImageRegistryRef};

/// Requests a Secret with credentials to pull images from an [`ImageRegistry`].
///
/// The operator creates the Secret `image-pull-secret-{name}` in the same
/// namespace and rotates its contents regularly.
///
/// [`ImageRegistry`]: crate::crd::ImageRegistry
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "registry.stackable.tech",
    version = "v1alpha1",
    kind = "ImagePullSecret",
    plural = "imagepullsecrets",
    status = "CredentialRequestStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullSecretSpec {
    /// The registry to issue credentials for. Uses the operator wide default
    /// registry when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_ref: Option<ImageRegistryRef>,
}

/// Requests a Secret with credentials to push images to an [`ImageRegistry`].
///
/// The operator creates the Secret `image-push-secret-{name}` in the same
/// namespace. Its `config.json` key can be mounted directly into image build
/// tools.
///
/// [`ImageRegistry`]: crate::crd::ImageRegistry
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "registry.stackable.tech",
    version = "v1alpha1",
    kind = "ImagePushSecret",
    plural = "imagepushsecrets",
    status = "CredentialRequestStatus",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImagePushSecretSpec {
    /// The registry to issue credentials for. Uses the operator wide default
    /// registry when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_ref: Option<ImageRegistryRef>,
}

impl CredentialRequest for ImagePullSecret {
    const MODE: AccessMode = AccessMode::Pull;

    fn registry_ref(&self) -> Option<&ImageRegistryRef> {
        self.spec.registry_ref.as_ref()
    }

    fn request_status(&self) -> Option<&CredentialRequestStatus> {
        self.status.as_ref()
    }

    fn request_status_mut(&mut self) -> &mut CredentialRequestStatus {
        self.status.get_or_insert_default()
    }
}

impl CredentialRequest for ImagePushSecret {
    const MODE: AccessMode = AccessMode::Push;

    fn registry_ref(&self) -> Option<&ImageRegistryRef> {
        self.spec.registry_ref.as_ref()
    }

    fn request_status(&self) -> Option<&CredentialRequestStatus> {
        self.status.as_ref()
    }

    fn request_status_mut(&mut self) -> &mut CredentialRequestStatus {
        self.status.get_or_insert_default()
    }
}
