//! Well-known label, annotation and finalizer keys plus the back-reference
//! encoding used to find the request an account belongs to.

use std::collections::BTreeMap;

use const_format::concatcp;
use kube::runtime::reflector::ObjectRef;

/// The API group of all custom resources managed by this operator.
pub const REGISTRY_GROUP: &str = "registry.stackable.tech";

const REGISTRY_KEY_PREFIX: &str = concatcp!(REGISTRY_GROUP, "/");

/// Annotation on a delivered Secret recording the rotation its contents belong to.
pub const ROTATION_ANNOTATION_KEY: &str = concatcp!(REGISTRY_KEY_PREFIX, "rotation");

/// Finalizer keeping a request around until its accounts are deleted.
pub const ACCOUNTS_FINALIZER: &str = concatcp!(REGISTRY_KEY_PREFIX, "accounts");

/// Back-reference label on accounts issued for an `ImagePullSecret`.
pub const IMAGE_PULL_SECRET_LABEL_KEY: &str = concatcp!(REGISTRY_KEY_PREFIX, "image-pull-secret");

/// Back-reference label on accounts issued for an `ImagePushSecret`.
pub const IMAGE_PUSH_SECRET_LABEL_KEY: &str = concatcp!(REGISTRY_KEY_PREFIX, "image-push-secret");

/// The API server rejects longer label values.
pub const MAX_LABEL_VALUE_LENGTH: usize = 63;

const BACK_REFERENCE_SEPARATOR: char = '.';

/// Encodes the owner of a cross-namespace object as `{name}.{namespace}`.
pub fn back_reference(name: &str, namespace: &str) -> String {
    format!("{name}{BACK_REFERENCE_SEPARATOR}{namespace}")
}

/// Splits a back-reference into `(name, namespace)`.
///
/// Object names may contain dots but namespaces cannot, so the value is split
/// on the last separator. Both halves must be non-empty.
pub fn parse_back_reference(value: &str) -> Option<(&str, &str)> {
    let (name, namespace) = value.rsplit_once(BACK_REFERENCE_SEPARATOR)?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }
    Some((name, namespace))
}

/// Maps the back-reference stored under `key` in `labels` to the referenced object.
pub fn back_reference_target<K>(
    labels: Option<&BTreeMap<String, String>>,
    key: &str,
) -> Option<ObjectRef<K>>
where
    K: kube::Resource<DynamicType = ()>,
{
    let value = labels?.get(key)?;
    let (name, namespace) = parse_back_reference(value)?;
    Some(ObjectRef::new(name).within(namespace))
}
