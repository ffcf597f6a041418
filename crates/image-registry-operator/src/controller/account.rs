//! Deletes [`ImageRegistryAccount`]s once their `ttl` elapsed.

use std::sync::Arc;

use kube::{ResourceExt, runtime::controller::Action};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    controller::{Ctx, finalizer::has_deletion_stamp},
    crd::ImageRegistryAccount,
    logging::controller::ReconcilerError,
    store::{self, Store},
    time::{self, Duration},
};

/// Added to the remaining lifetime so the account is expired when checked again.
const EXPIRY_CHECK_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to delete expired account"))]
    DeleteAccount { source: store::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

#[tracing::instrument(skip_all, fields(
    account.namespace = account.namespace().as_deref(),
    account.name = %account.name_any(),
))]
pub async fn reconcile<S: Store>(
    account: Arc<ImageRegistryAccount>,
    ctx: Arc<Ctx<S>>,
) -> Result<Action, Error> {
    if has_deletion_stamp(&*account) {
        return Ok(Action::await_change());
    }
    let Some(expires_at) = account.expires_at() else {
        return Ok(Action::await_change());
    };

    let now = ctx.clock.now();
    if account.expired(now) {
        tracing::info!(expires_at = %expires_at, "deleting expired account");
        let namespace = account.namespace().context(ObjectHasNoNamespaceSnafu)?;
        ctx.store
            .delete::<ImageRegistryAccount>(&namespace, &account.name_any())
            .await
            .context(DeleteAccountSnafu)?;
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(
        *(time::until(now, expires_at) + EXPIRY_CHECK_SLACK),
    ))
}
