use std::io;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request sent by the [`Controller`] to all services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to finish. Ideally, open
/// work is persisted or finished in an orderly manner but no new requests are accepted anymore.
///
/// After the timeout the process will shut down regardless of what the services do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a service about an upcoming shutdown.
///
/// Obtain a handle through [`Controller::shutdown_handle`] and await
/// [`notified`](Self::notified) inside the service loop.
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the current shutdown state, if a shutdown has been requested.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }

    /// Waits for the shutdown to be requested.
    ///
    /// Resolves immediately if a shutdown was requested before this handle was polled. If the
    /// [`Controller`] is dropped without requesting a shutdown, this never resolves.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            let current = *self.0.borrow_and_update();
            if let Some(shutdown) = current {
                return shutdown;
            }

            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Coordinates the graceful shutdown of all services in the process.
///
/// The controller is created once at startup and passed to the places that start services. Each
/// service obtains a [`ShutdownHandle`] and stops accepting work once notified. A shutdown is
/// triggered either explicitly through [`shutdown`](Self::shutdown), or by a process signal
/// observed in [`wait_for_signal`](Self::wait_for_signal).
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use tally_system::Controller;
///
/// let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// runtime.block_on(async {
///     let controller = Controller::new(Duration::from_secs(10));
///     let mut handle = controller.shutdown_handle();
///
///     controller.shutdown(Some(Duration::from_secs(1)));
///     assert_eq!(handle.notified().await.timeout, Some(Duration::from_secs(1)));
/// });
/// ```
#[derive(Debug)]
pub struct Controller {
    /// Configured timeout for graceful shutdowns.
    timeout: Duration,
    tx: watch::Sender<Option<Shutdown>>,
}

impl Controller {
    /// Creates a new controller with the given graceful shutdown timeout.
    pub fn new(timeout: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self { timeout, tx }
    }

    /// Returns the configured timeout for graceful shutdowns.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.tx.subscribe())
    }

    /// Notifies all services to shut down.
    ///
    /// Subsequent calls have no effect, the first shutdown request wins.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }

            *current = Some(Shutdown { timeout });
            true
        });
    }

    /// Waits for a termination signal and initiates the shutdown.
    ///
    /// `SIGINT` and `SIGQUIT` shut down immediately, while `SIGTERM` grants services the
    /// configured [timeout](Self::timeout) to finish their work. On platforms without these
    /// signals, `Ctrl-C` triggers a graceful shutdown.
    pub async fn wait_for_signal(&self) -> io::Result<Shutdown> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sig_int = signal(SignalKind::interrupt())?;
            let mut sig_quit = signal(SignalKind::quit())?;
            let mut sig_term = signal(SignalKind::terminate())?;

            tokio::select! {
                biased;

                Some(()) = sig_int.recv() => {
                    tally_log::info!("SIGINT received, exiting");
                    self.shutdown(None);
                }
                Some(()) = sig_quit.recv() => {
                    tally_log::info!("SIGQUIT received, exiting");
                    self.shutdown(None);
                }
                Some(()) = sig_term.recv() => {
                    let timeout = self.timeout;
                    tally_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
                    self.shutdown(Some(timeout));
                }
                else => self.shutdown(None),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            tally_log::info!("Ctrl-C received, stopping in {}s", self.timeout.as_secs());
            self.shutdown(Some(self.timeout));
        }

        let mut handle = self.shutdown_handle();
        Ok(handle.notified().await)
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn test_notified_after_shutdown() {
        let controller = Controller::new(Duration::from_secs(5));
        let mut handle = controller.shutdown_handle();
        assert!(handle.get().is_none());

        let waiter = tokio::spawn(async move { handle.notified().await });
        controller.shutdown(Some(Duration::from_secs(5)));

        let shutdown = waiter.await.unwrap();
        assert_eq!(shutdown.timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_late_handle_sees_shutdown() {
        let controller = Controller::new(Duration::ZERO);
        controller.shutdown(None);

        let mut handle = controller.shutdown_handle();
        assert_eq!(handle.notified().await, Shutdown { timeout: None });
    }

    #[tokio::test]
    async fn test_first_shutdown_wins() {
        let controller = Controller::new(Duration::ZERO);
        controller.shutdown(Some(Duration::from_secs(3)));
        controller.shutdown(None);

        let handle = controller.shutdown_handle();
        assert_eq!(handle.get().unwrap().timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_dropped_controller_never_notifies() {
        let controller = Controller::new(Duration::ZERO);
        let mut handle = controller.shutdown_handle();
        drop(controller);

        assert!(handle.notified().now_or_never().is_none());
    }
}
