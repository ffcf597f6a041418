//! Custom resources of the `registry.stackable.tech` API group.

use std::fmt::Debug;

use k8s_openapi::{
    NamespaceResourceScope,
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{CustomResourceExt, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

use crate::kvp::{IMAGE_PULL_SECRET_LABEL_KEY, IMAGE_PUSH_SECRET_LABEL_KEY};

pub mod account;
pub mod image_secret;
pub mod registry;

pub use account::{ImageRegistryAccount, ImageRegistryAccountSpec};
pub use image_secret::{ImagePullSecret, ImagePullSecretSpec, ImagePushSecret, ImagePushSecretSpec};
pub use registry::{ImageRegistry, ImageRegistrySpec, ImageRegistryStatus};

/// Secret data key holding the account name.
pub const SECRET_KEY_USERNAME: &str = "username";
/// Secret data key holding the plaintext password.
pub const SECRET_KEY_PASSWORD: &str = "password";
/// Secret data key holding the registry hostname.
pub const SECRET_KEY_REGISTRY: &str = "registry";
/// Secret data key holding the PEM encoded registry CA certificate.
pub const SECRET_KEY_CA_CERT: &str = "ca.crt";

#[derive(Debug, Snafu)]
#[snafu(display("failed to serialize CustomResourceDefinition {name:?}"))]
pub struct SerializeCrdError {
    source: serde_yaml::Error,
    name: String,
}

/// Points at an [`ImageRegistry`].
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryRef {
    pub name: String,

    /// Defaults to the namespace of the referencing object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Whether credentials allow pulling or pushing images.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccessMode {
    Pull,
    Push,
}

/// Everything that differs between pull and push credentials.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeConfig {
    pub mode: AccessMode,
    pub secret_name_prefix: &'static str,
    pub secret_type: &'static str,
    pub config_key: &'static str,
    pub back_reference_label: &'static str,
}

impl AccessMode {
    pub const fn config(self) -> ModeConfig {
        match self {
            Self::Pull => ModeConfig {
                mode: self,
                secret_name_prefix: "image-pull-secret-",
                secret_type: "kubernetes.io/dockerconfigjson",
                config_key: ".dockerconfigjson",
                back_reference_label: IMAGE_PULL_SECRET_LABEL_KEY,
            },
            Self::Push => ModeConfig {
                mode: self,
                secret_name_prefix: "image-push-secret-",
                secret_type: "Opaque",
                config_key: "config.json",
                back_reference_label: IMAGE_PUSH_SECRET_LABEL_KEY,
            },
        }
    }
}

impl ModeConfig {
    pub fn secret_name(&self, request_name: &str) -> String {
        format!("{}{request_name}", self.secret_name_prefix)
    }

    /// Deterministic account name for one rotation of a request.
    pub fn account_name(&self, namespace: &str, name: &str, rotation: i64) -> String {
        format!("{}.{namespace}.{name}.{rotation}", self.mode)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequestStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the account and Secret currently handed out.
    #[serde(default)]
    pub rotation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_date: Option<Time>,

    #[serde(default)]
    pub registry: RegistryBinding,
}

/// The registry a request was bound to during its last rotation.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryBinding {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Shared behaviour of [`ImagePullSecret`] and [`ImagePushSecret`].
pub trait CredentialRequest:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    const MODE: AccessMode;

    fn registry_ref(&self) -> Option<&ImageRegistryRef>;

    fn request_status(&self) -> Option<&CredentialRequestStatus>;

    fn request_status_mut(&mut self) -> &mut CredentialRequestStatus;
}

pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        ImagePullSecret::crd(),
        ImagePushSecret::crd(),
        ImageRegistry::crd(),
        ImageRegistryAccount::crd(),
    ]
}

/// Renders all CustomResourceDefinitions as a multi-document YAML string.
pub fn crds_yaml() -> Result<String, SerializeCrdError> {
    let mut out = String::new();
    for crd in crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd).context(SerializeCrdSnafu { name })?);
    }
    Ok(out)
}
