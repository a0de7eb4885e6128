//! Cancellable background loops.
//!
//! Every long-running consumer owns a [`ShutdownSignal`] and checks it between
//! iterations and while sleeping. The spawner keeps a [`WorkerHandle`] to stop
//! the loop and wait for it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Sending half: flips every linked [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half, cloned into each loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, signal) = shutdown_channel();
        signal
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was requested. Pends forever if the trigger was
    /// dropped without firing.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown arrives first.
    ///
    /// Returns `true` when the caller should stop.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let interrupted = tokio::select! {
            _ = self.triggered() => true,
            _ = tokio::time::sleep(duration) => false,
        };
        interrupted || self.is_triggered()
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Handle to control and join a background loop.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    trigger: ShutdownTrigger,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` on the tokio runtime with a fresh shutdown signal.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (trigger, signal) = shutdown_channel();
        let fut = body(signal);
        let join = tokio::spawn(async move {
            info!(worker = name, "worker started");
            fut.await;
            info!(worker = name, "worker stopped");
        });
        Self {
            name,
            trigger,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) {
        self.trigger.trigger();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = self.name, error = %err, "worker task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let (trigger, mut signal) = shutdown_channel();
        let task = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        trigger.trigger();
        let stopped = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sleep should be interrupted")
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn dropped_trigger_never_fires() {
        let mut signal = ShutdownSignal::never();
        assert!(!signal.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn handle_stops_loop() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let handle = WorkerHandle::spawn("test-loop", move |mut shutdown| async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                if shutdown.sleep(Duration::from_millis(1)).await {
                    break;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
