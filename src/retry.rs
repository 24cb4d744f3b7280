//! Per-user counters of consecutive transient portal failures.
//!
//! The portal intermittently rejects valid sessions under load, so a
//! failure only escalates to logout once it repeats `threshold` times
//! without the streak expiring.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::models::UserId;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    consecutive_failures: u32,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Treat this cycle as a no-op and wait for the portal to recover.
    Suppress { attempt: u32 },
    /// Threshold reached: revoke the credentials and tell the user.
    Escalate { attempt: u32 },
}

#[derive(Clone)]
pub struct RetryClassifier {
    /// Sharded per user, so one user's update never waits on another's.
    states: Arc<DashMap<UserId, RetryState>>,
    threshold: u32,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl RetryClassifier {
    pub fn new(threshold: u32, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            threshold: threshold.max(1),
            ttl,
            clock,
        }
    }

    /// Increments the user's streak, restarting at 1 once the previous one expired.
    /// Each increment pushes the expiry out by a full TTL.
    pub fn next_retry_count(&self, user_id: UserId) -> u32 {
        let now = self.clock.now();
        let mut state = self.states.entry(user_id).or_insert(RetryState {
            consecutive_failures: 0,
            expires_at: now,
        });

        if state.expires_at <= now {
            state.consecutive_failures = 0;
        }
        state.consecutive_failures += 1;
        state.expires_at = now + self.ttl;
        state.consecutive_failures
    }

    pub fn classify(&self, user_id: UserId) -> RetryDecision {
        let attempt = self.next_retry_count(user_id);
        if attempt >= self.threshold {
            RetryDecision::Escalate { attempt }
        } else {
            RetryDecision::Suppress { attempt }
        }
    }

    /// Ends the user's streak, e.g. after a successful login.
    pub fn clear(&self, user_id: UserId) {
        self.states.remove(&user_id);
    }

    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.states.retain(|_, state| state.expires_at > now);
    }

    #[cfg(test)]
    pub(crate) fn tracked_users(&self) -> usize {
        self.states.len()
    }
}
