//! Periodic fan-out of tracked users to a fixed pool of portal workers.
//!
//! `Idle -> Running -> Stopped`. Stopping is one-way: cancellation stops the
//! dispatch loop, closes the task channel and waits for workers to finish
//! the user they are on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PortalError;
use crate::models::Credentials;
use crate::portal::Portal;
use crate::scan::{Pipeline, ScanError};
use crate::store::CredentialSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub pool_size: usize,
    /// Politeness delay each worker sleeps between two users.
    pub pacing_delay: Duration,
    /// Per-user budget; exceeding it abandons that user for the cycle.
    pub user_deadline: Duration,
}

type TaskReceiver = Arc<Mutex<mpsc::Receiver<Credentials>>>;

pub struct Scheduler<P, F> {
    settings: SchedulerSettings,
    source: Arc<dyn CredentialSource>,
    pipeline: Arc<Pipeline>,
    new_portal: F,
    state: watch::Sender<SchedulerState>,
    _portal: std::marker::PhantomData<fn() -> P>,
}

impl<P, F> Scheduler<P, F>
where
    P: Portal + 'static,
    F: Fn() -> Result<P, PortalError>,
{
    pub fn new(
        settings: SchedulerSettings,
        source: Arc<dyn CredentialSource>,
        pipeline: Arc<Pipeline>,
        new_portal: F,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            settings,
            source,
            pipeline,
            new_portal,
            state,
            _portal: std::marker::PhantomData,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SchedulerState) {
        let previous = self.state.send_replace(next);
        debug!(?previous, ?next, "Scan scheduler state changed");
    }

    /// Runs ticks until `cancel` fires. Consumes the scheduler.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), PortalError> {
        let (tx, workers) = self.start_workers()?;
        self.set_state(SchedulerState::Running);
        info!(
            workers = self.settings.pool_size,
            interval = ?self.settings.interval,
            "Scan scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {
                    self.dispatch_cycle(&tx, &cancel).await;
                }
            }
        }

        self.shutdown(tx, workers).await;
        Ok(())
    }

    /// Dispatches a single cycle and waits for every user in it to finish.
    pub async fn run_once(self) -> Result<usize, PortalError> {
        let (tx, workers) = self.start_workers()?;
        self.set_state(SchedulerState::Running);
        let dispatched = self.dispatch_cycle(&tx, &CancellationToken::new()).await;
        self.shutdown(tx, workers).await;
        Ok(dispatched)
    }

    fn start_workers(&self) -> Result<(mpsc::Sender<Credentials>, JoinSet<()>), PortalError> {
        let (tx, rx) = mpsc::channel(1);
        let rx: TaskReceiver = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for id in 0..self.settings.pool_size.max(1) {
            let portal = (self.new_portal)()?;
            workers.spawn(worker(
                id,
                portal,
                rx.clone(),
                self.pipeline.clone(),
                self.settings.clone(),
            ));
        }
        Ok((tx, workers))
    }

    async fn shutdown(&self, tx: mpsc::Sender<Credentials>, mut workers: JoinSet<()>) {
        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Scan worker panicked");
            }
        }
        self.set_state(SchedulerState::Stopped);
        info!("Scan scheduler stopped");
    }

    /// Blocks while workers are busy, so a slow cycle delays the next tick
    /// instead of overlapping it.
    async fn dispatch_cycle(
        &self,
        tx: &mpsc::Sender<Credentials>,
        cancel: &CancellationToken,
    ) -> usize {
        let started = Instant::now();
        self.pipeline.retries().purge_expired();

        let mut users = match self.source.list_tracked_users().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Failed to list tracked users");
                return 0;
            }
        };

        users.retain(|user| user.authenticated);
        let total = users.len();
        let mut dispatched = 0usize;
        for user in users {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(dispatched, total, "Scan cycle interrupted");
                    return dispatched;
                }
                sent = tx.send(user) => {
                    if sent.is_err() {
                        error!("All scan workers exited");
                        return dispatched;
                    }
                    dispatched += 1;
                }
            }
        }

        info!(dispatched, elapsed = ?started.elapsed(), "Scan cycle dispatched");
        dispatched
    }
}

async fn worker<P: Portal>(
    id: usize,
    mut portal: P,
    tasks: TaskReceiver,
    pipeline: Arc<Pipeline>,
    settings: SchedulerSettings,
) {
    debug!(worker = id, "Scan worker started");

    loop {
        let next = tasks.lock().await.recv().await;
        let Some(credentials) = next else {
            break;
        };
        let user_id = credentials.user_id;

        let processed = tokio::time::timeout(
            settings.user_deadline,
            pipeline.process_user(&mut portal, &credentials),
        )
        .await;
        match processed {
            Ok(Ok(outcome)) => debug!(worker = id, user_id, ?outcome, "User processed"),
            Ok(Err(ScanError::Extract(e))) => {
                warn!(worker = id, user_id, error = %e, "Discarded malformed grades page")
            }
            Ok(Err(ScanError::Portal(PortalError::Http(e)))) => {
                warn!(worker = id, user_id, error = %e, "Portal unavailable, user skipped this cycle")
            }
            Ok(Err(e)) => error!(worker = id, user_id, error = %e, "Failed to process user"),
            Err(_) => warn!(worker = id, user_id, "User processing exceeded its deadline"),
        }

        portal.reset();
        tokio::time::sleep(settings.pacing_delay).await;
    }

    debug!(worker = id, "Scan worker stopped");
}
