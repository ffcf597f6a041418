//! Facilities for reporting Kubernetes controller outcomes
//!
//! The primary entry point is [`report_controller_reconciled`].

use std::error::Error;

use kube::{
    Resource,
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        events::Recorder,
        reflector::ObjectRef,
    },
};

use crate::logging::k8s_events::publish_controller_error_as_k8s_event;

/// [`Error`] extensions that help report reconciliation errors
///
/// This should be implemented for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category
    ///
    /// This can typically be implemented by delegating to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    /// A reference to a secondary object providing additional context, if any
    ///
    /// This should be [`Some`] if the error happens while evaluating some related object
    /// (for example: when creating the account for a credential request).
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }

    /// Whether the error is an optimistic concurrency conflict.
    ///
    /// Conflicts are retried quickly and are not reported to the end user.
    fn is_conflict(&self) -> bool {
        false
    }
}

/// Reports the controller reconciliation result to all relevant targets
///
/// Currently this means that the result is reported to:
/// * The current [`tracing::Subscriber`], typically at least stdout
/// * Kubernetes [`Event`]s, if there is an error that is relevant to the end user
///
/// [`Event`]: `k8s_openapi::api::events::v1::Event`
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(controller::Error::ReconcilerFailed(err, obj)) if err.is_conflict() => {
            tracing::debug!(
                controller.name = controller_name,
                object = %obj,
                error = err as &dyn Error,
                "Object was modified concurrently, retrying"
            );
        }
        Err(err) => report_controller_error(recorder, controller_name, err),
    }
}

/// Reports an error to the operator administrator and, if relevant, the end user
fn report_controller_error<ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_name: &str,
    error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    tracing::error!(
        controller.name = controller_name,
        error = error as &dyn Error,
        "Failed to reconcile object",
    );
    publish_controller_error_as_k8s_event(recorder, error);
}
