//! Serves `GET /auth` with HTTP Basic credentials for image registry token
//! servers, plus `GET /health`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use image_registry_auth::{router, serve};
use image_registry_operator::{
    auth::Authenticator,
    logging,
    store::KubeStore,
    time::{Duration, SystemClock},
    utils::signal::{SignalError, SignalWatcher},
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "image-registry-authservice";
const LOG_ENV_VAR: &str = "IMAGE_REGISTRY_AUTH_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to bind to {address}"))]
    Bind {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("failed to watch for shutdown signals"))]
    WatchSignals { source: SignalError },

    #[snafu(display("auth service failed"))]
    Serve { source: image_registry_auth::Error },
}

#[derive(Debug, Parser)]
#[command(
    name = APP_NAME,
    version,
    about = "HTTP service authenticating users against ImageRegistryAccounts"
)]
struct Opts {
    /// Address the auth service is listening on
    #[arg(long, short = 'l', env = "IMAGE_REGISTRY_AUTH_LISTEN", default_value = "127.0.0.1:9090")]
    listen: SocketAddr,

    /// Namespace containing the ImageRegistryAccounts, defaults to the
    /// namespace of the Kubernetes client configuration
    #[arg(long, env = "IMAGE_REGISTRY_AUTH_NAMESPACE")]
    namespace: Option<String>,

    /// How long authenticated accounts are cached
    #[arg(long, env = "IMAGE_REGISTRY_AUTH_CACHE_TTL", default_value = "10m")]
    cache_ttl: Duration,

    /// Additionally write logs to rotated files in this directory
    #[arg(long, env = "IMAGE_REGISTRY_AUTH_LOG_DIRECTORY")]
    log_directory: Option<PathBuf>,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    logging::initialize_logging(LOG_ENV_VAR, APP_NAME, opts.log_directory.as_deref())
        .context(InitializeLoggingSnafu)?;

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let namespace = opts
        .namespace
        .unwrap_or_else(|| client.default_namespace().to_owned());
    tracing::info!(
        namespace = namespace.as_str(),
        cache_ttl = %opts.cache_ttl,
        "authenticating against ImageRegistryAccounts"
    );
    let authenticator = Authenticator::new(
        KubeStore::new(client, None),
        namespace,
        opts.cache_ttl,
        SystemClock,
    );

    let listener = tokio::net::TcpListener::bind(opts.listen)
        .await
        .context(BindSnafu {
            address: opts.listen,
        })?;
    tracing::info!(address = %opts.listen, "listening");
    let shutdown = SignalWatcher::shutdown().context(WatchSignalsSnafu)?;

    serve(listener, router(Arc::new(authenticator)), shutdown.handle())
        .await
        .context(ServeSnafu)
}
