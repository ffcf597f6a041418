use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

#[derive(Debug, Snafu)]
#[snafu(display("failed to construct signal watcher"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Watches for the incoming signal and multiplies it by sending it to all acquired handles.
pub struct SignalWatcher<T>
where
    T: Send + Sync + 'static,
{
    watch_rx: watch::Receiver<T>,
}

impl<T> SignalWatcher<T>
where
    T: Default + Send + Sync + 'static,
{
    /// Watches the provided `signal` and multiplies the signal by sending it to all acquired handles
    /// constructed through [`SignalWatcher::handle`].
    pub fn new<F>(signal: F) -> Self
    where
        F: Future<Output = T> + Send + Sync + 'static,
    {
        let (watch_tx, watch_rx) = watch::channel(T::default());

        tokio::spawn(async move {
            let value = signal.await;
            watch_tx.send(value)
        });

        Self { watch_rx }
    }

    /// Acquire a new handle which will complete once the signal is received.
    ///
    /// This handle can be cheaply cloned to be able to gracefully shutdown multiple concurrent
    /// tasks.
    pub fn handle(&self) -> impl Future<Output = ()> + use<T> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            watch_rx.changed().await.ok();
        }
    }
}

impl SignalWatcher<()> {
    /// Watches `SIGTERM` and `SIGINT`, whichever arrives first completes all handles.
    pub fn shutdown() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;
        let (watch_tx, watch_rx) = watch::channel(());

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            }
            watch_tx.send(())
        });

        Ok(Self { watch_rx })
    }
}
