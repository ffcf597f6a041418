//! Authenticates a single user against `ImageRegistryAccount`s.
//!
//! Exit codes: 0 on success with the account labels printed as JSON, 1 on
//! usage errors, 2 if the lookup could not be performed and 3 if the
//! credentials are invalid.

use std::{io, process::ExitCode};

use clap::Parser;
use image_registry_auth::{AuthnExit, run_authn};
use image_registry_operator::{
    auth::{Authenticator, DEFAULT_CACHE_TTL},
    store::KubeStore,
    time::SystemClock,
};

#[derive(Debug, Parser)]
#[command(
    name = "image-registry-authn",
    version,
    about = "Authenticates a user against ImageRegistryAccounts"
)]
struct Opts {
    /// Namespace containing the ImageRegistryAccounts, defaults to the
    /// namespace of the Kubernetes client configuration
    #[arg(long, env = "IMAGE_REGISTRY_AUTH_NAMESPACE")]
    namespace: Option<String>,

    /// The user name
    #[arg(long, env = "IMAGE_REGISTRY_AUTH_USER")]
    user: String,

    /// The password
    #[arg(long, env = "IMAGE_REGISTRY_AUTH_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() {
                AuthnExit::Usage.into()
            } else {
                // --help and --version
                AuthnExit::Success.into()
            };
        }
    };

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            eprintln!(
                "authn error: failed to create Kubernetes client: {}",
                snafu::Report::from_error(error)
            );
            return AuthnExit::Setup.into();
        }
    };
    let namespace = opts
        .namespace
        .unwrap_or_else(|| client.default_namespace().to_owned());
    let authenticator = Authenticator::new(
        KubeStore::new(client, None),
        namespace,
        DEFAULT_CACHE_TTL,
        SystemClock,
    );

    run_authn(
        &authenticator,
        &opts.user,
        &opts.password,
        &mut io::stdout(),
        &mut io::stderr(),
    )
    .await
    .into()
}
