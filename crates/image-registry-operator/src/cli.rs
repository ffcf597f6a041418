//! Command line interface of the operator binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use snafu::{Snafu, ensure};

use crate::{
    controller::RotationConfig,
    crd::ImageRegistryRef,
    namespace::WatchNamespace,
    registry::RegistryDefaults,
    time::Duration,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "the account TTL ({account_ttl}) must be longer than the rotation interval ({rotation_interval})"
    ))]
    AccountTtlTooShort {
        account_ttl: Duration,
        rotation_interval: Duration,
    },
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(
    name = "image-registry-operator",
    author,
    version,
    about = "Issues and rotates image registry credentials"
)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// The namespace the operator is running in
    #[arg(long, env)]
    pub operator_namespace: String,

    /// Name of the ImageRegistry used by requests without a registryRef
    #[arg(long, env, default_value = "registry")]
    pub default_registry_name: String,

    /// Namespace of the default ImageRegistry, defaults to the operator namespace
    #[arg(long, env)]
    pub default_registry_namespace: Option<String>,

    /// DNS zone used to derive registry hostnames
    #[arg(long, env, default_value = "svc.cluster.local")]
    pub dns_zone: String,

    /// Lifetime of issued accounts
    #[arg(long, env, default_value = "24h")]
    pub account_ttl: Duration,

    /// Age after which credentials are rotated
    #[arg(long, env, default_value = "12h")]
    pub rotation_interval: Duration,

    /// Delay before retrying requests whose registry is unavailable
    #[arg(long, env, default_value = "30s")]
    pub registry_retry_delay: Duration,

    /// Additionally write logs to rotated files in this directory
    #[arg(long, env)]
    pub log_directory: Option<PathBuf>,
}

impl RunArguments {
    /// Validates the durations and assembles the rotation settings.
    pub fn rotation_config(&self) -> Result<RotationConfig, Error> {
        ensure!(
            self.account_ttl > self.rotation_interval,
            AccountTtlTooShortSnafu {
                account_ttl: self.account_ttl,
                rotation_interval: self.rotation_interval,
            }
        );
        if self.account_ttl < self.rotation_interval.saturating_mul(2) {
            tracing::warn!(
                account_ttl = %self.account_ttl,
                rotation_interval = %self.rotation_interval,
                "account TTL is less than twice the rotation interval, clients may be left with expired credentials"
            );
        }

        Ok(RotationConfig {
            registry: RegistryDefaults {
                default_registry: ImageRegistryRef {
                    name: self.default_registry_name.clone(),
                    namespace: Some(
                        self.default_registry_namespace
                            .clone()
                            .unwrap_or_else(|| self.operator_namespace.clone()),
                    ),
                },
                dns_zone: self.dns_zone.clone(),
            },
            account_ttl: self.account_ttl,
            rotation_interval: self.rotation_interval,
            registry_retry_delay: self.registry_retry_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;

    fn parse(args: &[&str]) -> RunArguments {
        let opts = Opts::try_parse_from(
            ["image-registry-operator", "run", "--operator-namespace", "infra"]
                .iter()
                .chain(args),
        )
        .unwrap();
        match opts.command {
            Command::Run(args) => args,
            Command::Crd => panic!("expected run command"),
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.watch_namespace, WatchNamespace::All);

        let config = args.rotation_config().unwrap();
        assert_eq!(config.account_ttl, Duration::from_hours(24));
        assert_eq!(config.rotation_interval, Duration::from_hours(12));
        assert_eq!(config.registry_retry_delay, Duration::from_secs(30));
        assert_eq!(config.registry.dns_zone, "svc.cluster.local");
        assert_eq!(config.registry.default_registry, ImageRegistryRef {
            name: "registry".to_owned(),
            namespace: Some("infra".to_owned()),
        });
    }

    #[test]
    fn explicit_default_registry() {
        let args = parse(&[
            "--default-registry-name",
            "shared",
            "--default-registry-namespace",
            "registries",
            "--watch-namespace",
            "app",
        ]);
        assert_eq!(args.watch_namespace, WatchNamespace::One("app".to_owned()));

        let config = args.rotation_config().unwrap();
        assert_eq!(config.registry.default_registry, ImageRegistryRef {
            name: "shared".to_owned(),
            namespace: Some("registries".to_owned()),
        });
    }

    #[rstest]
    #[case("12h", "12h", false)]
    #[case("6h", "12h", false)]
    #[case("13h", "12h", true)]
    #[case("1d", "12h", true)]
    fn account_ttl_must_exceed_rotation_interval(
        #[case] account_ttl: &str,
        #[case] rotation_interval: &str,
        #[case] valid: bool,
    ) {
        let args = parse(&[
            "--account-ttl",
            account_ttl,
            "--rotation-interval",
            rotation_interval,
        ]);
        assert_eq!(args.rotation_config().is_ok(), valid);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let result = Opts::try_parse_from([
            "image-registry-operator",
            "run",
            "--operator-namespace",
            "infra",
            "--account-ttl",
            "forever",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn crd_command() {
        let opts = Opts::try_parse_from(["image-registry-operator", "crd"]).unwrap();
        assert_eq!(opts.command, Command::Crd);
    }
}
