use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::crypto::PasswordCipher;
use crate::error::StoreError;
use crate::models::{Credentials, GradeChange, OutboxEntry, ProgressTable, RevocationCause, UserId};
use crate::store::{CredentialSource, OutboxStore, Persistence};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Enrols credentials from a CSV with `user_id,username,password` columns.
/// Passwords are encrypted before they reach the database.
pub async fn import_csv(
    pool: &PgPool,
    cipher: &PasswordCipher,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        user_id: i64,
        username: String,
        password: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let password = cipher.encrypt(&row.password)?;

        let result = sqlx::query(
            r#"
            INSERT INTO grades_tracker.tracked_credentials
            (user_id, username, password)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET username = EXCLUDED.username,
                password = EXCLUDED.password,
                updated_at = now(),
                revoked_at = NULL
            "#,
        )
        .bind(row.user_id)
        .bind(&row.username)
        .bind(password)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialSource for PgStore {
    async fn list_tracked_users(&self) -> Result<Vec<Credentials>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, username, password
            FROM grades_tracker.tracked_credentials
            WHERE revoked_at IS NULL
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(Credentials {
                user_id: row.try_get("user_id")?,
                username: row.try_get("username")?,
                password: row.try_get("password")?,
                authenticated: true,
            });
        }

        Ok(users)
    }
}

#[async_trait]
impl Persistence for PgStore {
    async fn get_snapshot(&self, user_id: UserId) -> Result<Option<ProgressTable>, StoreError> {
        let row = sqlx::query(
            "SELECT progress_table FROM grades_tracker.progress_tables WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(mut table): Json<ProgressTable> = row.try_get("progress_table")?;
        table.user_id = user_id;
        Ok(Some(table))
    }

    async fn save_snapshot(
        &self,
        table: &ProgressTable,
        changes: &[GradeChange],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO grades_tracker.progress_tables (user_id, progress_table)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET progress_table = EXCLUDED.progress_table, updated_at = now()
            "#,
        )
        .bind(table.user_id)
        .bind(Json(table))
        .execute(&mut *tx)
        .await?;

        for change in changes {
            sqlx::query(
                r#"
                INSERT INTO grades_tracker.grades_changes_outbox (id, user_id, payload)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(change.user_id)
            .bind(Json(change))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn revoke_user(&self, user_id: UserId, cause: RevocationCause) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE grades_tracker.tracked_credentials
            SET password = ''::bytea, revoked_at = now(), updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM grades_tracker.progress_tables WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(user_id, ?cause, "Revoked stored credentials");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn pull_batch(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE grades_tracker.grades_changes_outbox o
            SET leased_until = now() + make_interval(secs => $2)
            WHERE o.id IN (
                SELECT p.id
                FROM grades_tracker.grades_changes_outbox p
                WHERE (p.leased_until IS NULL OR p.leased_until < now())
                  AND NOT EXISTS (
                      SELECT 1
                      FROM grades_tracker.tracked_credentials c
                      WHERE c.user_id = p.user_id AND c.revoked_at IS NOT NULL
                  )
                ORDER BY p.created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING o.id, o.user_id, o.payload, o.created_at
            "#,
        )
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let user_id: UserId = row.try_get("user_id")?;
            let Json(mut change): Json<GradeChange> = row.try_get("payload")?;
            change.user_id = user_id;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            entries.push(OutboxEntry {
                id: row.try_get("id")?,
                user_id,
                change,
                created_at,
            });
        }
        entries.sort_by_key(|entry| entry.created_at);

        Ok(entries)
    }

    async fn release(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "UPDATE grades_tracker.grades_changes_outbox SET leased_until = NULL WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_delivered(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query("DELETE FROM grades_tracker.grades_changes_outbox WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
