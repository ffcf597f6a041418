//! Utilities for publishing Kubernetes events

use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType, Recorder},
};
use tracing::Instrument;

use super::{controller::ReconcilerError, full_error_message};

/// Converts an [`Error`] into a publishable Kubernetes [`Event`]
fn error_to_event<E: ReconcilerError>(err: &E) -> Event {
    // Walk the whole error chain, so that we get all the full reason for the error
    let mut full_msg = full_error_message(err);
    message::truncate_with_ellipsis(&mut full_msg, 1024);
    Event {
        type_: EventType::Warning,
        reason: err.category().to_string(),
        note: Some(full_msg),
        action: "Reconcile".to_string(),
        secondary: err.secondary_object().map(Into::into),
    }
}

/// Reports an error coming from a controller to Kubernetes
///
/// This is intended to be executed on the results returned by [`kube::runtime::Controller::run`]
#[tracing::instrument(skip(recorder))]
pub fn publish_controller_error_as_k8s_event<ReconcileErr, QueueErr>(
    recorder: &Recorder,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    let (error, obj) = match controller_error {
        controller::Error::ReconcilerFailed(err, obj) => (err, obj),
        // Other error types are intended for the operator administrator, and aren't linked to a
        // specific object
        _ => return,
    };
    let reference = ObjectReference::from(obj.clone());
    let event = error_to_event(error);
    let recorder = recorder.clone();
    // Run in the background
    tokio::spawn(
        async move {
            if let Err(err) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to report error as K8s event"
                );
            }
        }
        .in_current_span(),
    );
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        if msg.len() > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        while !s.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }

}

#[cfg(test)]
mod tests {
    use kube::runtime::reflector::ObjectRef;
    use snafu::Snafu;
    use strum::EnumDiscriminants;

    use super::{ReconcilerError, error_to_event};
    use crate::crd::ImageRegistryAccount;

    #[derive(Snafu, Debug, EnumDiscriminants)]
    #[strum_discriminants(derive(strum::IntoStaticStr))]
    enum RotateError {
        #[snafu(display("failed to rotate credentials"))]
        Rotate { source: AccountError },
    }

    #[derive(Snafu, Debug)]
    enum AccountError {
        #[snafu(display("account {namespace}/{name} already exists"))]
        Exists { namespace: String, name: String },
    }

    impl RotateError {
        fn existing_account() -> Self {
            Self::Rotate {
                source: AccountError::Exists {
                    namespace: "infra".to_owned(),
                    name: "pull.app.pull-1.1".to_owned(),
                },
            }
        }
    }

    impl ReconcilerError for RotateError {
        fn category(&self) -> &'static str {
            RotateErrorDiscriminants::from(self).into()
        }

        fn secondary_object(&self) -> Option<ObjectRef<kube::core::DynamicObject>> {
            match self {
                Self::Rotate {
                    source: AccountError::Exists { namespace, name },
                } => Some(
                    ObjectRef::<ImageRegistryAccount>::new(name)
                        .within(namespace)
                        .erase(),
                ),
            }
        }
    }

    #[test]
    fn event_should_report_full_nested_message() {
        let event = error_to_event(&RotateError::existing_account());
        assert_eq!(
            event.note.as_deref(),
            Some("failed to rotate credentials: account infra/pull.app.pull-1.1 already exists")
        );
    }

    #[test]
    fn event_should_include_secondary_object() {
        let event = error_to_event(&RotateError::existing_account());
        let secondary = event.secondary.unwrap();
        assert_eq!(secondary.name.as_deref(), Some("pull.app.pull-1.1"));
        assert_eq!(secondary.namespace.as_deref(), Some("infra"));
        assert_eq!(secondary.kind.as_deref(), Some("ImageRegistryAccount"));
    }

    #[test]
    fn event_should_include_reason_code() {
        let event = error_to_event(&RotateError::existing_account());
        assert_eq!(event.reason, "Rotate");
    }
}
