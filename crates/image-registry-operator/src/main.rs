use clap::Parser;
use image_registry_operator::{
    cli::{self, Command, Opts},
    controller, crd, logging,
    utils::signal::{SignalError, SignalWatcher},
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "image-registry-operator";
const LOG_ENV_VAR: &str = "IMAGE_REGISTRY_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to render CRDs"))]
    RenderCrds { source: crd::SerializeCrdError },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("invalid configuration"))]
    Configuration { source: cli::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to watch for shutdown signals"))]
    WatchSignals { source: SignalError },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    match opts.command {
        Command::Crd => {
            print!("{}", crd::crds_yaml().context(RenderCrdsSnafu)?);
        }
        Command::Run(args) => {
            logging::initialize_logging(LOG_ENV_VAR, APP_NAME, args.log_directory.as_deref())
                .context(InitializeLoggingSnafu)?;
            tracing::info!(
                app.name = APP_NAME,
                app.version = env!("CARGO_PKG_VERSION"),
                "starting"
            );

            let config = args.rotation_config().context(ConfigurationSnafu)?;
            let client = kube::Client::try_default()
                .await
                .context(CreateClientSnafu)?;
            let shutdown = SignalWatcher::shutdown().context(WatchSignalsSnafu)?;

            controller::run(client, &args.watch_namespace, config, &shutdown).await;
        }
    }

    Ok(())
}
