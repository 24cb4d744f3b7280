//! Capabilities the pipeline needs from its collaborators.
//!
//! `db::PgStore` implements the storage traits against Postgres and
//! `notify::TelegramNotifier` implements [`Notifier`].

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{DeliveryError, StoreError};
use crate::models::{Credentials, GradeChange, OutboxEntry, ProgressTable, RevocationCause, UserId};

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Every user whose credentials are currently tracked.
    async fn list_tracked_users(&self) -> Result<Vec<Credentials>, StoreError>;
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_snapshot(&self, user_id: UserId) -> Result<Option<ProgressTable>, StoreError>;

    /// Replaces the user's snapshot and enqueues `changes` in one transaction.
    async fn save_snapshot(
        &self,
        table: &ProgressTable,
        changes: &[GradeChange],
    ) -> Result<(), StoreError>;

    /// Clears the stored session and snapshot together.
    async fn revoke_user(&self, user_id: UserId, cause: RevocationCause) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `limit` undelivered entries for `lease`; claimed entries
    /// are invisible to other callers until the lease runs out.
    async fn pull_batch(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Ends the lease on entries whose delivery failed so the next drain retries them.
    async fn release(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    async fn delete_delivered(&self, ids: &[Uuid]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: UserId, text: &str) -> Result<(), DeliveryError>;
}
