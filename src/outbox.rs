//! Delivery side of the grade-change outbox.
//!
//! Entries are deleted only after the notifier accepted them, so a crash
//! anywhere in between re-delivers on a later drain (at least once).
//! Entries of revoked users stay in place and are no longer claimed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{DeliveryError, StoreError};
use crate::models::{RevocationCause, UserId};
use crate::report;
use crate::scan;
use crate::store::{Notifier, OutboxStore, Persistence};

#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub interval: Duration,
    pub batch_size: i64,
    /// How long a pulled batch stays claimed; see [`OutboxDrainer::drain_once`].
    pub lease: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub unreachable_users: usize,
}

pub struct OutboxDrainer {
    settings: DrainSettings,
    outbox: Arc<dyn OutboxStore>,
    persistence: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
}

impl OutboxDrainer {
    pub fn new(
        settings: DrainSettings,
        outbox: Arc<dyn OutboxStore>,
        persistence: Arc<dyn Persistence>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            outbox,
            persistence,
            notifier,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.settings.interval, "Outbox drain loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {
                    match self.drain_once().await {
                        Ok(report) if report != DrainReport::default() => {
                            info!(?report, "Outbox drained");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Failed to drain outbox"),
                    }
                }
            }
        }

        info!("Outbox drain loop stopped");
    }

    /// Claims one batch and works through it until the claim is about to lapse.
    ///
    /// Each entry is deleted as soon as it is delivered. Sending stops once
    /// three quarters of the lease has passed, and an in-flight send is cut
    /// off at that point, so no entry is still being handled when another
    /// drainer can claim it. Whatever was not delivered is released.
    pub async fn drain_once(&self) -> Result<DrainReport, StoreError> {
        let claimed_at = Instant::now();
        let entries = self
            .outbox
            .pull_batch(self.settings.batch_size, self.settings.lease)
            .await?;
        let send_deadline = claimed_at + send_window(self.settings.lease);

        let mut report = DrainReport::default();
        let mut unsent = Vec::new();
        let mut unreachable: HashSet<UserId> = HashSet::new();

        let mut pending = entries.into_iter();
        while let Some(entry) = pending.next() {
            if unreachable.contains(&entry.user_id) {
                unsent.push(entry.id);
                continue;
            }

            let now = Instant::now();
            if now >= send_deadline {
                warn!(left = pending.len() + 1, "Outbox lease nearly expired, releasing the rest of the batch");
                unsent.push(entry.id);
                unsent.extend(pending.by_ref().map(|rest| rest.id));
                break;
            }

            let text = report::render_change(&entry.change);
            let sent = tokio::time::timeout(
                send_deadline - now,
                self.notifier.send(entry.user_id, &text),
            )
            .await;
            match sent {
                Ok(Ok(())) => {
                    self.outbox.delete_delivered(&[entry.id]).await?;
                    report.delivered += 1;
                }
                Ok(Err(DeliveryError::PermanentlyUnreachable(reason))) => {
                    warn!(user_id = entry.user_id, %reason, "User is unreachable");
                    unreachable.insert(entry.user_id);
                    unsent.push(entry.id);
                }
                Ok(Err(e @ DeliveryError::Transient(_))) => {
                    warn!(user_id = entry.user_id, id = %entry.id, error = %e, "Failed to deliver grade change");
                    report.failed += 1;
                    unsent.push(entry.id);
                }
                Err(_) => {
                    warn!(user_id = entry.user_id, id = %entry.id, "Delivery did not finish before the lease ran out");
                    report.failed += 1;
                    unsent.push(entry.id);
                }
            }
        }

        self.outbox.release(&unsent).await?;

        for user_id in unreachable {
            match scan::revoke_credentials(
                self.persistence.as_ref(),
                self.notifier.as_ref(),
                user_id,
                RevocationCause::Unreachable,
            )
            .await
            {
                Ok(()) => report.unreachable_users += 1,
                Err(e) => error!(user_id, error = %e, "Failed to revoke unreachable user"),
            }
        }

        Ok(report)
    }
}

/// Portion of the lease a drain may spend sending.
fn send_window(lease: Duration) -> Duration {
    lease - lease / 4
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::models::GradeChange;
    use crate::testing::{MemoryStore, RecordingNotifier, SendMode};

    fn change(user_id: UserId, event: &str) -> GradeChange {
        GradeChange {
            user_id,
            discipline: "Math".to_string(),
            control_event: event.to_string(),
            old_grade: "4".to_string(),
            new_grade: "5".to_string(),
        }
    }

    fn drainer(store: &MemoryStore, notifier: &RecordingNotifier, batch_size: i64) -> OutboxDrainer {
        OutboxDrainer::new(
            DrainSettings {
                interval: Duration::from_secs(30),
                batch_size,
                lease: Duration::from_secs(120),
            },
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(notifier.clone()),
        )
    }

    #[tokio::test]
    async fn delivers_and_deletes_in_batches() {
        let store = MemoryStore::default();
        let notifier = RecordingNotifier::default();
        for i in 0..5 {
            store.enqueue(change(1, &format!("KM-{i}")));
        }
        let drainer = drainer(&store, &notifier, 3);

        let first = drainer.drain_once().await.unwrap();
        assert_eq!(first.delivered, 3);
        assert_eq!(store.outbox().len(), 2);

        let second = drainer.drain_once().await.unwrap();
        assert_eq!(second.delivered, 2);
        assert!(store.outbox().is_empty());

        let sent = notifier.sent_to(1);
        assert_eq!(sent.len(), 5);
        assert!(sent[0].contains("KM-0"));
    }

    #[tokio::test]
    async fn failed_delivery_keeps_entry_for_next_drain() {
        let store = MemoryStore::default();
        let notifier = RecordingNotifier::default();
        store.enqueue(change(1, "Midterm"));
        notifier.set_mode(1, SendMode::Transient);
        let drainer = drainer(&store, &notifier, 10);

        for _ in 0..3 {
            let report = drainer.drain_once().await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(store.outbox().len(), 1);
        }

        notifier.set_mode(1, SendMode::Deliver);
        assert_eq!(drainer.drain_once().await.unwrap().delivered, 1);
        assert!(store.outbox().is_empty());
        assert_eq!(notifier.attempts(), 4);
    }

    #[tokio::test]
    async fn unreachable_user_is_revoked_and_entries_are_kept() {
        let store = MemoryStore::default();
        let notifier = RecordingNotifier::default();
        store.add_user(1, "blocked", "pw");
        store.add_user(2, "fine", "pw");
        store.enqueue(change(1, "A"));
        store.enqueue(change(1, "B"));
        store.enqueue(change(2, "C"));
        notifier.set_mode(1, SendMode::Unreachable);
        let drainer = drainer(&store, &notifier, 10);

        let report = drainer.drain_once().await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                delivered: 1,
                failed: 0,
                unreachable_users: 1,
            }
        );
        assert_eq!(store.revocations(), vec![(1, RevocationCause::Unreachable)]);
        assert!(!store.is_tracked(1));
        assert!(store.is_tracked(2));
        // One attempt for "A"; "B" is skipped and no notice is sent.
        assert_eq!(notifier.attempts(), 2);

        let left: Vec<String> = store
            .outbox()
            .into_iter()
            .map(|change| change.control_event)
            .collect();
        assert_eq!(left, vec!["A", "B"]);

        // Revoked users' entries are never claimed again.
        assert_eq!(drainer.drain_once().await.unwrap(), DrainReport::default());
        assert_eq!(notifier.attempts(), 2);
        assert_eq!(store.outbox().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_batch_is_released_before_its_lease_lapses() {
        let store = MemoryStore::default();
        let notifier = RecordingNotifier::with_delay(Duration::from_secs(11));
        for i in 0..50 {
            store.enqueue(change(1, &format!("KM-{i}")));
        }
        let first = drainer(&store, &notifier, 50);
        let second = drainer(&store, &notifier, 50);

        // Lease is 120s; the second drainer claims only after it has lapsed.
        let (a, b) = tokio::join!(first.drain_once(), async {
            tokio::time::sleep(Duration::from_secs(125)).await;
            second.drain_once().await
        });
        let (a, b) = (a.unwrap(), b.unwrap());

        let sent = notifier.sent();
        let distinct: HashSet<&String> = sent.iter().map(|(_, text)| text).collect();
        assert_eq!(distinct.len(), sent.len());
        assert!(a.delivered > 0);
        assert!(b.delivered > 0);
        assert_eq!(a.delivered + b.delivered, sent.len());
        assert_eq!(store.outbox().len(), 50 - sent.len());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drains_never_share_an_entry() {
        let store = MemoryStore::default();
        let notifier = RecordingNotifier::with_delay(Duration::from_millis(10));
        for i in 0..20 {
            store.enqueue(change(i % 3, &format!("KM-{i}")));
        }
        let a = drainer(&store, &notifier, 4);
        let b = drainer(&store, &notifier, 4);

        for _ in 0..5 {
            let (ra, rb) = tokio::join!(a.drain_once(), b.drain_once());
            ra.unwrap();
            rb.unwrap();
        }

        assert!(store.outbox().is_empty());
        let mut per_event: HashMap<String, usize> = HashMap::new();
        for (_, text) in notifier.sent() {
            *per_event.entry(text).or_default() += 1;
        }
        assert_eq!(per_event.len(), 20);
        assert!(per_event.values().all(|count| *count == 1));
        assert_eq!(notifier.attempts(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_drains_on_each_tick_until_cancelled() {
        let store = MemoryStore::default();
        let notifier = RecordingNotifier::default();
        store.enqueue(change(1, "Midterm"));
        let drainer = Arc::new(drainer(&store, &notifier, 10));

        let cancel = CancellationToken::new();
        let running = {
            let drainer = drainer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { drainer.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.outbox().is_empty());
        store.enqueue(change(1, "Exam"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(notifier.sent_to(1).len(), 2);

        cancel.cancel();
        running.await.unwrap();
    }
}
