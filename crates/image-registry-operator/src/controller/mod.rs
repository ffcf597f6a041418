//! Wires the reconcilers into [`kube::runtime::Controller`]s.

use std::sync::Arc;

use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Client,
    runtime::{
        Controller,
        controller::Action,
        events::{Recorder, Reporter},
        watcher,
    },
};

use crate::{
    crd::{CredentialRequest, ImagePullSecret, ImagePushSecret, ImageRegistryAccount},
    kvp::{REGISTRY_GROUP, back_reference_target},
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
    registry::RegistryDefaults,
    store::{KubeStore, Store},
    time::{Clock, Duration, SystemClock},
    utils::signal::SignalWatcher,
};

pub mod account;
pub mod finalizer;
pub mod image_secret;

pub const FIELD_MANAGER: &str = "image-registry-operator";

const ACCOUNT_CONTROLLER_NAME: &str = "imageregistryaccount";

/// Requeue delay after a write conflict.
const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Requeue delay after any other reconciliation error.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Settings of the credential rotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationConfig {
    pub registry: RegistryDefaults,

    /// Lifetime of issued accounts, longer than `rotation_interval` so
    /// clients can pick up the new credentials before the old ones expire.
    pub account_ttl: Duration,

    /// Age after which an account is replaced.
    pub rotation_interval: Duration,

    /// Requeue delay while the registry is unavailable.
    pub registry_retry_delay: Duration,
}

/// Shared state of all reconcilers.
#[derive(Debug)]
pub struct Ctx<S> {
    pub store: S,
    pub config: RotationConfig,
    pub clock: Arc<dyn Clock>,
}

impl<S: Store> Ctx<S> {
    pub fn new(store: S, config: RotationConfig, clock: impl Clock) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(clock),
        }
    }
}

pub fn error_policy<K, E, C>(_obj: Arc<K>, error: &E, _ctx: Arc<C>) -> Action
where
    E: ReconcilerError,
{
    if error.is_conflict() {
        Action::requeue(*CONFLICT_RETRY_DELAY)
    } else {
        Action::requeue(*ERROR_RETRY_DELAY)
    }
}

fn full_controller_name(name: &str) -> String {
    format!("{name}.{REGISTRY_GROUP}")
}

fn recorder(client: &Client, controller_name: &str) -> Recorder {
    Recorder::new(client.clone(), Reporter {
        controller: controller_name.to_owned(),
        instance: None,
    })
}

/// Runs the controllers for both request kinds and the account expiry until
/// `shutdown` fires.
pub async fn run(
    client: Client,
    watch_namespace: &WatchNamespace,
    config: RotationConfig,
    shutdown: &SignalWatcher<()>,
) {
    let store = KubeStore::new(client.clone(), Some(FIELD_MANAGER.to_owned()));
    let ctx = Arc::new(Ctx::new(store, config, SystemClock));

    let pull = run_request_controller::<ImagePullSecret>(
        &client,
        watch_namespace,
        ctx.clone(),
        shutdown,
    );
    let push = run_request_controller::<ImagePushSecret>(
        &client,
        watch_namespace,
        ctx.clone(),
        shutdown,
    );

    let controller_name = full_controller_name(ACCOUNT_CONTROLLER_NAME);
    let account_recorder = recorder(&client, &controller_name);
    let accounts = Controller::new(
        watch_namespace.get_api::<ImageRegistryAccount>(&client),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(shutdown.handle())
    .run(account::reconcile, error_policy, ctx)
    .for_each(move |result| {
        report_controller_reconciled(&account_recorder, &controller_name, &result);
        future::ready(())
    });

    future::join3(pull, push, accounts).await;
    tracing::info!("all controllers stopped");
}

/// Reconciles requests of kind `K` whenever the request, its Secret or one of
/// its accounts changes.
///
/// Accounts live in the registry namespace, so they are mapped back to their
/// request through the back-reference label instead of an owner reference.
fn run_request_controller<K: CredentialRequest>(
    client: &Client,
    watch_namespace: &WatchNamespace,
    ctx: Arc<Ctx<KubeStore>>,
    shutdown: &SignalWatcher<()>,
) -> impl Future<Output = ()> + use<K> {
    let label = K::MODE.config().back_reference_label;
    let controller_name = full_controller_name(&K::kind(&()).to_lowercase());
    let recorder = recorder(client, &controller_name);

    Controller::new(watch_namespace.get_api::<K>(client), watcher::Config::default())
        .owns(
            watch_namespace.get_api::<Secret>(client),
            watcher::Config::default(),
        )
        .watches(
            watch_namespace.get_api::<ImageRegistryAccount>(client),
            watcher::Config::default().labels(label),
            move |account: ImageRegistryAccount| {
                back_reference_target::<K>(account.metadata.labels.as_ref(), label)
            },
        )
        .graceful_shutdown_on(shutdown.handle())
        .run(image_secret::reconcile::<K, KubeStore>, error_policy, ctx)
        .for_each(move |result| {
            report_controller_reconciled(&recorder, &controller_name, &result);
            future::ready(())
        })
}
