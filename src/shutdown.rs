//! Cooperative shutdown signalling.
//!
//! Blocking steps of the watch loop race against [`Shutdown::cancelled`] so a
//! termination signal takes effect at the next suspension point.

use std::future::Future;
use tokio::sync::watch;

/// Creates a connected trigger/listener pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Fires the shutdown. Held by the signal handler.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Cloneable listener passed into every blocking call.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when shutdown is requested.
    ///
    /// If the trigger is dropped without firing, this never completes.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Drives `future` to completion unless shutdown is requested first.
    ///
    /// Returns `None` if shutdown won; `future` is dropped unfinished.
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            output = future => Some(output),
            () = self.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_listener() {
        let (trigger, shutdown) = channel();
        assert!(!shutdown.is_triggered());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("listener woke")
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_already_triggered_completes_immediately() {
        let (trigger, shutdown) = channel();
        trigger.trigger();
        trigger.trigger();
        tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled())
            .await
            .expect("completes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let (trigger, shutdown) = channel();

        let finished = shutdown.run_until_cancelled(async { 7 }).await;
        assert_eq!(finished, Some(7));

        let sleeper = shutdown.run_until_cancelled(tokio::time::sleep(Duration::from_secs(3600)));
        let (outcome, ()) = tokio::join!(sleeper, async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });
        assert_eq!(outcome, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trigger_never_fires() {
        let (trigger, shutdown) = channel();
        drop(trigger);
        let outcome = tokio::time::timeout(Duration::from_secs(60), shutdown.cancelled()).await;
        assert!(outcome.is_err());
        assert!(!shutdown.is_triggered());
    }
}
