//! One user's pass through login, scrape, diff and persist.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::PasswordCipher;
use crate::diff;
use crate::error::{CryptoError, ExtractError, PortalError, StoreError};
use crate::extract;
use crate::models::{Credentials, RevocationCause, UserId};
use crate::portal::Portal;
use crate::report;
use crate::retry::{RetryClassifier, RetryDecision};
use crate::store::{Notifier, Persistence};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to decrypt stored password: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Portal(#[from] PortalError),

    #[error("failed to extract progress table: {0}")]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Complete comparison, nothing changed; nothing written.
    Unchanged,
    /// No usable previous snapshot; the new one was stored as the baseline.
    Baseline,
    ChangesEnqueued(usize),
    /// Snapshot overwritten after a shape change, with any changes found before it.
    StructureChanged { changes: usize },
    /// Transient portal failure below the retry threshold.
    RetrySuppressed { attempt: u32 },
    Revoked(RevocationCause),
}

pub struct Pipeline {
    persistence: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
    retries: RetryClassifier,
    cipher: PasswordCipher,
}

impl Pipeline {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        notifier: Arc<dyn Notifier>,
        retries: RetryClassifier,
        cipher: PasswordCipher,
    ) -> Self {
        Self {
            persistence,
            notifier,
            retries,
            cipher,
        }
    }

    pub fn retries(&self) -> &RetryClassifier {
        &self.retries
    }

    pub async fn process_user<P: Portal + ?Sized>(
        &self,
        portal: &mut P,
        credentials: &Credentials,
    ) -> Result<ScanOutcome, ScanError> {
        let user_id = credentials.user_id;
        let password = self.cipher.decrypt(&credentials.password)?;

        match portal.authorize(&credentials.username, &password).await {
            Ok(()) => {}
            Err(PortalError::AuthenticationFailed) => {
                return self
                    .transient_failure(user_id, RevocationCause::CredentialsExpired)
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        let html = match portal.fetch_grades_page().await {
            Ok(html) => html,
            Err(PortalError::WrongPage) => {
                return self
                    .transient_failure(user_id, RevocationCause::WrongGradesPage)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };
        self.retries.clear(user_id);

        let mut table = extract::extract(&html)?;
        table.user_id = user_id;

        let previous = self
            .persistence
            .get_snapshot(user_id)
            .await?
            .filter(|old| !old.is_unknown());
        let Some(previous) = previous else {
            self.persistence.save_snapshot(&table, &[]).await?;
            debug!(user_id, "Stored baseline snapshot");
            return Ok(ScanOutcome::Baseline);
        };

        let result = diff::diff(&table, &previous);
        if result.is_unchanged() {
            return Ok(ScanOutcome::Unchanged);
        }

        // A shape change still replaces the snapshot: the old one can no
        // longer serve as a comparison basis.
        self.persistence
            .save_snapshot(&table, &result.changes)
            .await?;

        let changes = result.changes.len();
        if result.structure_changed {
            info!(user_id, changes, "Progress table structure changed");
            Ok(ScanOutcome::StructureChanged { changes })
        } else {
            info!(user_id, changes, "Grade changes enqueued");
            Ok(ScanOutcome::ChangesEnqueued(changes))
        }
    }

    async fn transient_failure(
        &self,
        user_id: UserId,
        cause: RevocationCause,
    ) -> Result<ScanOutcome, ScanError> {
        match self.retries.classify(user_id) {
            RetryDecision::Suppress { attempt } => {
                info!(user_id, attempt, ?cause, "Transient portal failure, will retry");
                Ok(ScanOutcome::RetrySuppressed { attempt })
            }
            RetryDecision::Escalate { attempt } => {
                warn!(user_id, attempt, ?cause, "Retry threshold reached, revoking credentials");
                revoke_credentials(self.persistence.as_ref(), self.notifier.as_ref(), user_id, cause)
                    .await?;
                self.retries.clear(user_id);
                Ok(ScanOutcome::Revoked(cause))
            }
        }
    }
}

/// Revokes stored credentials, then makes exactly one best-effort attempt
/// to tell the user why. A failed notice never undoes the revocation.
///
/// `RevocationCause::Unreachable` is the exception: the channel has just
/// reported it can never reach the user, so no notice is attempted.
pub async fn revoke_credentials(
    persistence: &dyn Persistence,
    notifier: &dyn Notifier,
    user_id: UserId,
    cause: RevocationCause,
) -> Result<(), StoreError> {
    persistence.revoke_user(user_id, cause).await?;

    if let Some(notice) = report::revocation_notice(cause) {
        if let Err(e) = notifier.send(user_id, notice).await {
            warn!(user_id, error = %e, "Failed to deliver revocation notice");
        }
    }

    Ok(())
}
