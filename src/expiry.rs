//! Expiry of delivered codes.
//!
//! The watch loop hands each delivered message to an [`ExpirySchedule`]; the
//! paired [`Expirer`] runs beside it and, once a code's lifetime has passed,
//! asks the notifier to mark the chat message expired. The schedule lives in
//! memory only.

use crate::notifier::Notifier;
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Creates a connected schedule/expirer pair.
pub fn channel<N: Notifier>(
    notifier: N,
    lifetime: Duration,
    check_interval: Duration,
) -> (ExpirySchedule, Expirer<N>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ExpirySchedule { tx },
        Expirer {
            notifier,
            rx,
            lifetime,
            check_interval,
            pending: Vec::new(),
        },
    )
}

#[derive(Debug)]
struct Entry {
    message_id: i64,
    received_at: DateTime<Utc>,
}

/// Sending half, held by the watch loop.
#[derive(Debug, Clone)]
pub struct ExpirySchedule {
    tx: mpsc::UnboundedSender<Entry>,
}

impl ExpirySchedule {
    /// Schedules `message_id` to expire one lifetime after `received_at`.
    pub fn schedule(&self, message_id: i64, received_at: DateTime<Utc>) {
        if self
            .tx
            .send(Entry {
                message_id,
                received_at,
            })
            .is_err()
        {
            debug!(message_id, "Expirer stopped, not scheduling");
        }
    }
}

/// Receiving half; edits due messages until shutdown.
#[derive(Debug)]
pub struct Expirer<N> {
    notifier: N,
    rx: mpsc::UnboundedReceiver<Entry>,
    lifetime: Duration,
    check_interval: Duration,
    pending: Vec<(Instant, i64)>,
}

impl<N: Notifier> Expirer<N> {
    /// Number of messages waiting to expire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Runs until shutdown, or until every schedule is dropped and nothing is pending.
    pub async fn run(mut self, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                entry = self.rx.recv(), if open => match entry {
                    Some(entry) => self.enqueue(&entry),
                    None => open = false,
                },
                _ = ticker.tick() => self.expire_due().await,
            }

            if !open && self.pending.is_empty() {
                break;
            }
        }

        if !self.pending.is_empty() {
            info!(pending = self.pending.len(), "Dropping unexpired codes on shutdown");
        }
    }

    fn enqueue(&mut self, entry: &Entry) {
        let age = (Utc::now() - entry.received_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let due = Instant::now() + self.lifetime.saturating_sub(age);
        debug!(message_id = entry.message_id, "Scheduled code expiry");
        self.pending.push((due, entry.message_id));
    }

    async fn expire_due(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|(deadline, _)| *deadline <= now);
        self.pending = waiting;

        for (_, message_id) in due {
            if let Err(e) = self.notifier.expire(message_id).await {
                warn!(message_id, error = %e, "Failed to mark code as expired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::notifier::{Delivery, DeliveryContext};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        expired: Mutex<Vec<i64>>,
    }

    impl Notifier for Recorder {
        async fn send(&self, _: &str, _: &DeliveryContext, _: &Shutdown) -> Result<Delivery> {
            Ok(Delivery {
                message_id: None,
                attempts: 1,
            })
        }

        async fn expire(&self, message_id: i64) -> Result<()> {
            self.expired.lock().unwrap().push(message_id);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_codes_expire_after_lifetime() {
        let recorder = Recorder::default();
        let (trigger, shutdown) = crate::shutdown::channel();
        let (schedule, expirer) =
            channel(&recorder, Duration::from_secs(60), Duration::from_secs(10));

        let driver = async {
            schedule.schedule(1, Utc::now());
            schedule.schedule(2, Utc::now() - chrono::Duration::seconds(30));

            tokio::time::sleep(Duration::from_secs(45)).await;
            assert_eq!(*recorder.expired.lock().unwrap(), vec![2]);

            tokio::time::sleep(Duration::from_secs(30)).await;
            assert_eq!(*recorder.expired.lock().unwrap(), vec![2, 1]);

            trigger.trigger();
        };

        tokio::join!(expirer.run(shutdown), driver);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_schedule_dropped_and_idle() {
        let recorder = Recorder::default();
        let (_trigger, shutdown) = crate::shutdown::channel();
        let (schedule, expirer) =
            channel(&recorder, Duration::from_secs(5), Duration::from_secs(1));

        schedule.schedule(9, Utc::now());
        drop(schedule);

        tokio::time::timeout(Duration::from_secs(60), expirer.run(shutdown))
            .await
            .expect("expirer finished");
        assert_eq!(*recorder.expired.lock().unwrap(), vec![9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending() {
        let recorder = Recorder::default();
        let (trigger, shutdown) = crate::shutdown::channel();
        let (schedule, expirer) =
            channel(&recorder, Duration::from_secs(600), Duration::from_secs(1));

        schedule.schedule(3, Utc::now());
        trigger.trigger();
        expirer.run(shutdown).await;

        assert!(recorder.expired.lock().unwrap().is_empty());
    }
}
