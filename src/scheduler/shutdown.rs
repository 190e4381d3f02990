//! Termination signal handling.
//!
//! A [`ShutdownCoordinator`] owns the trigger; workers receive cloned
//! [`ShutdownSignal`] handles and check them before each claim and while a
//! job is running.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Owner of the shutdown trigger.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns a handle for a worker to observe.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        });
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Spawns a task that triggers shutdown on SIGTERM or SIGINT.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            match wait_for_termination().await {
                Ok(name) => info!(signal = name, "Received termination signal, shutting down"),
                Err(e) => {
                    warn!(error = %e, "Failed to install signal handlers");
                    return;
                }
            }
            coordinator.trigger();
        })
    }
}

#[cfg(unix)]
async fn wait_for_termination() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Observer side of the shutdown trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown is requested.
    ///
    /// Never completes if the coordinator is dropped without triggering.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_all_signals() {
        let coordinator = ShutdownCoordinator::new();
        let a = coordinator.signal();
        let mut b = coordinator.signal();
        assert!(!a.is_requested());

        coordinator.trigger();
        coordinator.trigger();

        assert!(a.is_requested());
        tokio::time::timeout(Duration::from_secs(1), b.requested())
            .await
            .expect("signal should resolve");
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_created_after_trigger_sees_it() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();
        assert!(coordinator.signal().is_requested());
    }

    #[tokio::test]
    async fn test_dropped_coordinator_never_resolves() {
        let coordinator = ShutdownCoordinator::new();
        let mut signal = coordinator.signal();
        drop(coordinator);

        let waited = tokio::time::timeout(Duration::from_millis(30), signal.requested()).await;
        assert!(waited.is_err());
    }
}
