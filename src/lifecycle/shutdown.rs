//! Shutdown coordination.

use std::future::Future;
use std::io;

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Every accept loop subscribes; triggering stops all of them at once.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Returns how many subscribers were notified.
    pub fn trigger(&self) -> usize {
        let notified = self.tx.send(()).unwrap_or(0);
        tracing::info!(subscribers = notified, "Shutdown triggered");
        notified
    }

    /// Get the number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait for Ctrl+C, then trigger.
    pub async fn trigger_on_ctrl_c(&self) {
        self.trigger_on(tokio::signal::ctrl_c()).await;
    }

    /// Trigger once `signal` resolves. A signal that fails to install never
    /// triggers.
    pub async fn trigger_on<F>(&self, signal: F) -> bool
    where
        F: Future<Output = io::Result<()>>,
    {
        match signal.await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                self.trigger();
                true
            }
            Err(error) => {
                tracing::error!(%error, "Failed to install shutdown signal handler");
                false
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_all_subscribers() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.clone().subscribe();
        assert_eq!(shutdown.receiver_count(), 2);

        assert_eq!(shutdown.trigger(), 2);
        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn signal_triggers_shutdown() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        let (fire, fired) = tokio::sync::oneshot::channel::<()>();

        let waiting = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                shutdown
                    .trigger_on(async move { fired.await.map_err(io::Error::other) })
                    .await
            }
        });

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        fire.send(()).unwrap();
        assert!(waiting.await.unwrap());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn failed_signal_does_not_trigger() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();

        let triggered = shutdown
            .trigger_on(async { Err(io::Error::new(io::ErrorKind::Unsupported, "no signals here")) })
            .await;

        assert!(!triggered);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ctrl_c_waits_for_the_signal() {
        let shutdown = Shutdown::new();
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(50), shutdown.trigger_on_ctrl_c()).await;
        assert!(waiting.is_err());
    }

    #[test]
    fn trigger_without_subscribers() {
        assert_eq!(Shutdown::new().trigger(), 0);
    }
}
