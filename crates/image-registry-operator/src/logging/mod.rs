use std::{
    error::Error as StdError,
    fmt::Write as _,
    io::{Sink, sink},
    path::Path,
};

use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        MakeWriter,
        writer::{EitherWriter, MakeWriterExt as _},
    },
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

pub mod controller;
mod k8s_events;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender in {directory:?}"))]
    InitFileAppender {
        source: InitError,
        directory: std::path::PathBuf,
    },

    #[snafu(display("failed to install global tracing subscriber"))]
    InstallSubscriber { source: TryInitError },
}

/// Initializes `tracing` logging with the filter read from the environment
/// variable `env`, e.g. `IMAGE_REGISTRY_OPERATOR_LOG`.
///
/// If the variable is not set the maximum log level is INFO. When a
/// `log_directory` is given, log output is additionally written to rotated
/// files named after `app_name` in that directory.
pub fn initialize_logging(
    env: &str,
    app_name: &str,
    log_directory: Option<&Path>,
) -> Result<(), Error> {
    let filter = EnvFilter::try_from_env(env)
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    let file_appender = log_directory
        .map(|directory| {
            RollingFileAppender::builder()
                .filename_suffix(format!("{app_name}.log"))
                .max_log_files(6)
                .build(directory)
                .context(InitFileAppenderSnafu { directory })
        })
        .transpose()?;

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout.and(OptionalMakeWriter::from(file_appender)));
    Registry::default()
        .with(filter)
        .with(fmt)
        .try_init()
        .context(InstallSubscriberSnafu)?;

    // Logging is only possible once the subscriber is installed
    match log_directory {
        Some(directory) => tracing::info!(directory = %directory.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }
    Ok(())
}

/// Renders `error` followed by all of its sources, separated by `: `.
pub fn full_error_message(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        let _ = write!(message, ": {inner}");
        source = inner.source();
    }
    message
}

/// Like [`EitherWriter`] but implements [`MakeWriter`] instead of [`std::io::Write`].
enum EitherMakeWriter<A, B> {
    A(A),
    B(B),
}

impl<'a, A, B> MakeWriter<'a> for EitherMakeWriter<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = EitherWriter<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer()),
            Self::B(b) => EitherWriter::B(b.make_writer()),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        match self {
            Self::A(a) => EitherWriter::A(a.make_writer_for(meta)),
            Self::B(b) => EitherWriter::B(b.make_writer_for(meta)),
        }
    }
}

type OptionalMakeWriter<T> = EitherMakeWriter<T, fn() -> Sink>;

impl<T> From<Option<T>> for OptionalMakeWriter<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(t) => Self::A(t),
            None => Self::B(sink),
        }
    }
}

#[cfg(test)]
mod tests {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(display("failed to rotate credentials"))]
    struct RotateError {
        source: StoreError,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("account already exists"))]
    struct StoreError;

    #[test]
    fn full_error_message_includes_sources() {
        let error = RotateError { source: StoreError };
        assert_eq!(
            super::full_error_message(&error),
            "failed to rotate credentials: account already exists"
        );
        assert_eq!(
            super::full_error_message(&StoreError),
            "account already exists"
        );
    }

    // There is no way to inspect the installed global max level, so this only
    // checks that installing the subscriber works. Run with
    //      cargo test logging -- --nocapture
    // to see the output.
    #[test]
    fn default_tracing_level_is_info() {
        super::initialize_logging("IMAGE_REGISTRY_OPERATOR_TEST_LOG_NOT_SET", "test", None)
            .unwrap();

        tracing::error!("ERROR level messages should be seen.");
        tracing::info!("INFO level messages should also be seen by default.");
        tracing::debug!("DEBUG level messages should not be seen.");
    }
}
