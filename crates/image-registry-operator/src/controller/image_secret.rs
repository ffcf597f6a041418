//! Issues and rotates the credentials of [`ImagePullSecret`]s and
//! [`ImagePushSecret`]s.
//!
//! There is no persisted state machine. Each reconciliation compares the
//! request status with the current account and Secret and rotates when they
//! drifted apart:
//!
//! * no registry resolves: report `Ready=False` and retry later
//! * any [`Drift`]: rotate, then report `Ready=True`
//! * otherwise: nothing is written and the next check is scheduled for when
//!   the account becomes due for rotation
//!
//! [`ImagePullSecret`]: crate::crd::ImagePullSecret
//! [`ImagePushSecret`]: crate::crd::ImagePushSecret

use std::{collections::BTreeMap, sync::Arc};

use jiff::Timestamp;
use k8s_openapi::{
    ByteString,
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::{
    ResourceExt,
    core::DynamicObject,
    runtime::{controller::Action, reflector::ObjectRef},
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    controller::{
        Ctx,
        finalizer::{add_finalizer, has_deletion_stamp, has_finalizer, remove_finalizer},
    },
    crd::{
        CredentialRequest, ImageRegistryAccount, ImageRegistryAccountSpec, ModeConfig,
        SECRET_KEY_CA_CERT, SECRET_KEY_PASSWORD, SECRET_KEY_REGISTRY, SECRET_KEY_USERNAME,
        account::AccountLabels,
    },
    docker_config,
    kvp::{ACCOUNTS_FINALIZER, MAX_LABEL_VALUE_LENGTH, ROTATION_ANNOTATION_KEY, back_reference},
    logging::{controller::ReconcilerError, full_error_message},
    password,
    registry::{self, TargetRegistry},
    status::condition::{ConditionReason, ConditionType, new_condition, set_condition},
    store::{self, Store},
    time::{self, Duration},
};

/// Added to the time until the next rotation when scheduling the next check.
const ROTATION_CHECK_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to add finalizer"))]
    AddFinalizer { source: store::Error },

    #[snafu(display("failed to remove finalizer"))]
    RemoveFinalizer { source: store::Error },

    #[snafu(display("failed to resolve registry"))]
    ResolveRegistry { source: registry::Error },

    #[snafu(display("failed to get account {namespace}/{name}"))]
    GetAccount {
        source: store::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to get Secret {namespace}/{name}"))]
    GetSecret {
        source: store::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to delete accounts in namespace {namespace:?}"))]
    DeleteAccounts {
        source: store::Error,
        namespace: String,
    },

    #[snafu(display("failed to update status"))]
    UpdateStatus { source: store::Error },

    #[snafu(display(
        "back-reference {value:?} exceeds the label value limit of {MAX_LABEL_VALUE_LENGTH} characters"
    ))]
    BackReferenceTooLong { value: String },

    #[snafu(display("failed to hash password"))]
    HashPassword { source: password::HashError },

    #[snafu(display("failed to create account {namespace}/{name}"))]
    CreateAccount {
        source: store::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to render docker config"))]
    RenderDockerConfig { source: docker_config::EncodeError },

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef,

    #[snafu(display("failed to write Secret {namespace}/{name}"))]
    WriteSecret {
        source: store::Error,
        namespace: String,
        name: String,
    },
}

impl Error {
    fn store_error(&self) -> Option<&store::Error> {
        match self {
            Self::AddFinalizer { source }
            | Self::RemoveFinalizer { source }
            | Self::GetAccount { source, .. }
            | Self::GetSecret { source, .. }
            | Self::DeleteAccounts { source, .. }
            | Self::UpdateStatus { source }
            | Self::CreateAccount { source, .. }
            | Self::WriteSecret { source, .. } => Some(source),
            Self::ResolveRegistry {
                source: registry::Error::Store { source },
            } => Some(source),
            _ => None,
        }
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::GetAccount {
                namespace, name, ..
            }
            | Self::CreateAccount {
                namespace, name, ..
            } => Some(
                ObjectRef::<ImageRegistryAccount>::new(name)
                    .within(namespace)
                    .erase(),
            ),
            Self::GetSecret {
                namespace, name, ..
            }
            | Self::WriteSecret {
                namespace, name, ..
            } => Some(ObjectRef::<Secret>::new(name).within(namespace).erase()),
            _ => None,
        }
    }

    fn is_conflict(&self) -> bool {
        self.store_error().is_some_and(store::Error::is_conflict)
    }
}

/// Why the current credentials have to be replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Drift {
    AccountMissing,
    SecretMissing,
    RotationMismatch,
    AccountDue,
    RegistryChanged,
}

/// Compares account, Secret and the resolved registry with the request status.
///
/// Returns [`None`] if the delivered credentials are current.
pub fn detect_drift(
    account: Option<&ImageRegistryAccount>,
    secret: Option<&Secret>,
    rotation: i64,
    registry: &TargetRegistry,
    rotation_interval: Duration,
    now: Timestamp,
) -> Option<Drift> {
    let Some(account) = account else {
        return Some(Drift::AccountMissing);
    };
    let Some(secret) = secret else {
        return Some(Drift::SecretMissing);
    };

    let annotated_rotation = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ROTATION_ANNOTATION_KEY));
    if annotated_rotation != Some(&rotation.to_string()) {
        return Some(Drift::RotationMismatch);
    }

    // An account from the future (clock skew) has age zero
    let due = account.created_at().is_none_or(|created_at| {
        time::elapsed(created_at, now).unwrap_or_default() > rotation_interval
    });
    if due {
        return Some(Drift::AccountDue);
    }

    let data = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|value| value.0.as_slice())
    };
    if data(SECRET_KEY_REGISTRY) != Some(registry.hostname.as_bytes())
        || data(SECRET_KEY_CA_CERT) != Some(registry.ca_certificate.as_slice())
    {
        return Some(Drift::RegistryChanged);
    }

    None
}

#[tracing::instrument(skip_all, fields(
    request.kind = %K::kind(&()),
    request.namespace = request.namespace().as_deref(),
    request.name = %request.name_any(),
))]
pub async fn reconcile<K, S>(request: Arc<K>, ctx: Arc<Ctx<S>>) -> Result<Action, Error>
where
    K: CredentialRequest,
    S: Store,
{
    tracing::info!("Starting reconcile");
    let mode = K::MODE.config();
    let mut request = (*request).clone();

    if has_deletion_stamp(&request) {
        return finalize(&ctx, &request, &mode).await;
    }

    if !has_finalizer(&request, ACCOUNTS_FINALIZER) {
        request = match add_finalizer(&ctx.store, &request, ACCOUNTS_FINALIZER).await {
            Ok(request) => request,
            Err(source) => {
                let error = Error::AddFinalizer { source };
                if !error.is_conflict() {
                    let message = full_error_message(&error);
                    report_status(&ctx, &mut request, Outcome::sync_failed(&message)).await;
                }
                return Err(error);
            }
        };
    }

    let namespace = request.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let registry = match registry::resolve(
        &ctx.store,
        &ctx.config.registry,
        &namespace,
        request.registry_ref(),
    )
    .await
    {
        Ok(registry) => registry,
        Err(error) => {
            let Some(reason) = error.unavailable_reason() else {
                return Err(error).context(ResolveRegistrySnafu);
            };
            tracing::info!(
                error = &error as &dyn std::error::Error,
                "registry is unavailable, retrying later"
            );
            let message = error.to_string();
            write_conditions(&ctx, &mut request, Outcome::failed(reason, &message)).await?;
            return Ok(Action::requeue(*ctx.config.registry_retry_delay));
        }
    };

    let name = request.name_any();
    let rotation = request.request_status().map_or(0, |status| status.rotation);
    let account_name = mode.account_name(&namespace, &name, rotation);
    let account: Option<ImageRegistryAccount> = ctx
        .store
        .get(&registry.namespace, &account_name)
        .await
        .context(GetAccountSnafu {
            namespace: &registry.namespace,
            name: &account_name,
        })?;
    let secret_name = mode.secret_name(&name);
    let secret: Option<Secret> =
        ctx.store
            .get(&namespace, &secret_name)
            .await
            .context(GetSecretSnafu {
                namespace: &namespace,
                name: &secret_name,
            })?;

    let now = ctx.clock.now();
    let drift = detect_drift(
        account.as_ref(),
        secret.as_ref(),
        rotation,
        &registry,
        ctx.config.rotation_interval,
        now,
    );
    let account = match (account, drift) {
        (Some(account), None) => account,
        (_, drift) => {
            tracing::info!(drift = ?drift, rotation, "rotating credentials");
            match rotate(&ctx, &mut request, &registry, secret, &mode).await {
                Ok(account) => account,
                Err(error) => {
                    if !error.is_conflict() {
                        let message = full_error_message(&error);
                        report_status(
                            &ctx,
                            &mut request,
                            Outcome::failed(ConditionReason::FailedSync, &message),
                        )
                        .await;
                    }
                    return Err(error);
                }
            }
        }
    };

    write_conditions(&ctx, &mut request, Outcome::SUCCESS).await?;

    Ok(Action::requeue(*next_check(
        &account,
        ctx.config.rotation_interval,
        ctx.clock.now(),
    )))
}

/// Time until `account` is due for rotation, plus some slack.
fn next_check(
    account: &ImageRegistryAccount,
    rotation_interval: Duration,
    now: Timestamp,
) -> Duration {
    let due_at = time::add(account.created_at().unwrap_or(now), rotation_interval);
    time::until(now, due_at) + ROTATION_CHECK_SLACK
}

/// Replaces account and Secret with a new generation.
///
/// Each step is safe to repeat: the rotation counter is persisted before the
/// account is created, so a retry after a crash creates the account of the
/// next generation instead of overwriting an existing one.
async fn rotate<K, S>(
    ctx: &Ctx<S>,
    request: &mut K,
    registry: &TargetRegistry,
    secret: Option<Secret>,
    mode: &ModeConfig,
) -> Result<ImageRegistryAccount, Error>
where
    K: CredentialRequest,
    S: Store,
{
    let namespace = request.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = request.name_any();
    let back_reference = back_reference(&name, &namespace);
    ensure!(
        back_reference.len() <= MAX_LABEL_VALUE_LENGTH,
        BackReferenceTooLongSnafu {
            value: &back_reference
        }
    );

    let previous_namespace = request
        .request_status()
        .map(|status| status.registry.namespace.clone())
        .unwrap_or_default();
    if !previous_namespace.is_empty() && previous_namespace != registry.namespace {
        tracing::info!(
            namespace = previous_namespace.as_str(),
            "registry moved, deleting accounts in previous namespace"
        );
        delete_accounts(ctx, &previous_namespace, mode, &back_reference).await?;
    }

    let status = request.request_status_mut();
    status.rotation += 1;
    status.rotation_date = Some(Time(ctx.clock.now()));
    status.registry.namespace.clone_from(&registry.namespace);
    *request = ctx
        .store
        .update_status(request)
        .await
        .context(UpdateStatusSnafu)?;
    let rotation = request.request_status().map_or(0, |status| status.rotation);

    let password = password::generate_password();
    let password_hash = password::hash_password(&password).context(HashPasswordSnafu)?;

    let account_name = mode.account_name(&namespace, &name, rotation);
    let mut account = ImageRegistryAccount::new(
        &account_name,
        ImageRegistryAccountSpec {
            password: password_hash,
            labels: AccountLabels::from([
                ("namespace".to_owned(), vec![namespace.clone()]),
                ("name".to_owned(), vec![name.clone()]),
                ("accessMode".to_owned(), vec![mode.mode.to_string()]),
            ]),
            ttl: Some(ctx.config.account_ttl),
        },
    );
    account.metadata.namespace = Some(registry.namespace.clone());
    account.metadata.labels = Some(BTreeMap::from([(
        mode.back_reference_label.to_owned(),
        back_reference,
    )]));
    tracing::info!(
        account.namespace = registry.namespace.as_str(),
        account.name = account_name.as_str(),
        "creating ImageRegistryAccount"
    );
    let account = ctx
        .store
        .create(&account)
        .await
        .context(CreateAccountSnafu {
            namespace: &registry.namespace,
            name: &account_name,
        })?;

    let docker_config = docker_config::render(&registry.hostname, &account_name, &password)
        .context(RenderDockerConfigSnafu)?;
    let owner_reference = request
        .controller_owner_ref(&())
        .context(ObjectMissingMetadataForOwnerRefSnafu)?;

    let secret_name = mode.secret_name(&name);
    let mut secret = secret.unwrap_or_else(|| Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.clone()),
            ..ObjectMeta::default()
        },
        ..Secret::default()
    });
    secret.type_ = Some(mode.secret_type.to_owned());
    secret
        .metadata
        .annotations
        .get_or_insert_default()
        .insert(ROTATION_ANNOTATION_KEY.to_owned(), rotation.to_string());
    let owner_references = secret.metadata.owner_references.get_or_insert_default();
    owner_references.retain(|reference| reference.controller != Some(true));
    owner_references.push(owner_reference);
    secret.string_data = None;
    secret.data = Some(BTreeMap::from([
        (SECRET_KEY_USERNAME.to_owned(), ByteString(account_name.into_bytes())),
        (SECRET_KEY_PASSWORD.to_owned(), ByteString(password.into_bytes())),
        (
            SECRET_KEY_REGISTRY.to_owned(),
            ByteString(registry.hostname.clone().into_bytes()),
        ),
        (
            SECRET_KEY_CA_CERT.to_owned(),
            ByteString(registry.ca_certificate.clone()),
        ),
        (mode.config_key.to_owned(), ByteString(docker_config)),
    ]));

    let written = if secret.metadata.uid.is_some() {
        tracing::info!(
            secret.namespace = namespace.as_str(),
            secret.name = secret_name.as_str(),
            "updating Secret"
        );
        ctx.store.update(&secret).await
    } else {
        tracing::info!(
            secret.namespace = namespace.as_str(),
            secret.name = secret_name.as_str(),
            "creating Secret"
        );
        ctx.store.create(&secret).await
    };
    written.context(WriteSecretSnafu {
        namespace: &namespace,
        name: &secret_name,
    })?;

    Ok(account)
}

/// Deletes the accounts of a request, which live in the registry namespace and
/// are therefore not garbage collected with the request.
async fn finalize<K, S>(ctx: &Ctx<S>, request: &K, mode: &ModeConfig) -> Result<Action, Error>
where
    K: CredentialRequest,
    S: Store,
{
    if !has_finalizer(request, ACCOUNTS_FINALIZER) {
        return Ok(Action::await_change());
    }

    tracing::info!("finalizing");
    let namespace = request.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let registry_namespace = request
        .request_status()
        .map(|status| status.registry.namespace.as_str())
        .unwrap_or_default();
    if !registry_namespace.is_empty() {
        let back_reference = back_reference(&request.name_any(), &namespace);
        delete_accounts(ctx, registry_namespace, mode, &back_reference).await?;
    }

    remove_finalizer(&ctx.store, request, ACCOUNTS_FINALIZER)
        .await
        .context(RemoveFinalizerSnafu)?;
    Ok(Action::await_change())
}

async fn delete_accounts<S: Store>(
    ctx: &Ctx<S>,
    namespace: &str,
    mode: &ModeConfig,
    back_reference: &str,
) -> Result<(), Error> {
    // Not a valid label value, so no account can carry it
    if back_reference.len() > MAX_LABEL_VALUE_LENGTH {
        return Ok(());
    }
    ctx.store
        .delete_all_matching_label::<ImageRegistryAccount>(
            namespace,
            mode.back_reference_label,
            back_reference,
        )
        .await
        .context(DeleteAccountsSnafu { namespace })
}

const READY_AND_SYNCED: &[ConditionType] = &[ConditionType::Ready, ConditionType::Synced];

/// The conditions reporting the outcome of a reconciliation.
#[derive(Clone, Copy, Debug)]
struct Outcome<'a> {
    types: &'static [ConditionType],
    ok: bool,
    reason: ConditionReason,
    message: &'a str,
}

impl<'a> Outcome<'a> {
    const SUCCESS: Self = Self {
        types: READY_AND_SYNCED,
        ok: true,
        reason: ConditionReason::Success,
        message: "",
    };

    fn failed(reason: ConditionReason, message: &'a str) -> Self {
        Self {
            types: READY_AND_SYNCED,
            ok: false,
            reason,
            message,
        }
    }

    /// Leaves `Ready` alone, the delivered credentials may still be valid.
    fn sync_failed(message: &'a str) -> Self {
        Self {
            types: &[ConditionType::Synced],
            ok: false,
            reason: ConditionReason::FailedSync,
            message,
        }
    }
}

/// Applies `outcome` to the request conditions and writes the status if
/// anything changed.
async fn write_conditions<K, S>(
    ctx: &Ctx<S>,
    request: &mut K,
    outcome: Outcome<'_>,
) -> Result<(), Error>
where
    K: CredentialRequest,
    S: Store,
{
    let generation = request.meta().generation;
    let now = ctx.clock.now();
    let status = request.request_status_mut();

    let mut changed = false;
    for &type_ in outcome.types {
        let condition = new_condition(
            type_,
            outcome.ok,
            outcome.reason,
            outcome.message,
            generation,
            now,
        );
        changed |= set_condition(&mut status.conditions, condition);
    }
    let observed_generation = generation.unwrap_or(status.observed_generation);
    if status.observed_generation != observed_generation {
        status.observed_generation = observed_generation;
        changed = true;
    }

    if changed {
        *request = ctx
            .store
            .update_status(request)
            .await
            .context(UpdateStatusSnafu)?;
    }
    Ok(())
}

/// Like [`write_conditions`], for use while already returning another error.
async fn report_status<K, S>(ctx: &Ctx<S>, request: &mut K, outcome: Outcome<'_>)
where
    K: CredentialRequest,
    S: Store,
{
    if let Err(error) = write_conditions(ctx, request, outcome).await {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to report failure in status"
        );
    }
}
