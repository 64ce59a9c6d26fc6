use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{
    CollabStore, ExpiredLock, FieldKind, FieldRow, GroupRow, LockAttempt, LockRow, StoreError,
};
use async_trait::async_trait;

/// PostgreSQL-backed collaboration store.
///
/// Tables are provisioned externally: `forms`, `form_fields`, `form_groups`,
/// `field_locks` (unique on group_id + field_id), `form_responses` (partial
/// unique on group_id while unsubmitted), `response_fields` (cascade-deleted
/// with their response), and `field_contributions`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    ///
    /// # Returns
    /// * `Result<Self, StoreError>` - Store over a connection pool, or error
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20) // Support many concurrent room operations
            .min_connections(2) // Keep some connections alive
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CollabStore for PgStore {
    async fn group_by_code(&self, group_code: &str) -> Result<Option<GroupRow>, StoreError> {
        let query_sql = r#"
            SELECT
                g.id,
                g.group_code,
                g.group_name,
                g.is_active,
                f.id AS form_id,
                f.title AS form_title,
                f.is_active AS form_active
            FROM form_groups g
                JOIN forms f ON f.id = g.form_id
            WHERE g.group_code = $1
        "#;

        let row = sqlx::query(query_sql)
            .bind(group_code)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(GroupRow {
                id: row.try_get("id")?,
                group_code: row.try_get("group_code")?,
                group_name: row.try_get("group_name")?,
                is_active: row.try_get("is_active")?,
                form_id: row.try_get("form_id")?,
                form_title: row.try_get("form_title")?,
                form_active: row.try_get("form_active")?,
            })),
            None => Ok(None),
        }
    }

    async fn field(&self, form_id: Uuid, field_id: &str) -> Result<Option<FieldRow>, StoreError> {
        let query_sql = r#"
            SELECT form_id, field_id, label, field_type
            FROM form_fields
            WHERE form_id = $1 AND field_id = $2
        "#;

        let row = sqlx::query(query_sql)
            .bind(form_id)
            .bind(field_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let field_type: String = row.try_get("field_type")?;
                Ok(Some(FieldRow {
                    form_id: row.try_get("form_id")?,
                    field_id: row.try_get("field_id")?,
                    label: row.try_get("label")?,
                    kind: FieldKind::parse(&field_type),
                }))
            }
            None => Ok(None),
        }
    }

    /// Acquire a field lock with a single conditional upsert
    ///
    /// The (group_id, field_id) uniqueness constraint arbitrates concurrent
    /// attempts: the upsert only lands when the slot is free, expired, or
    /// already held by the same user. When it refuses, the current holder is
    /// read back; the short retry loop covers a holder vanishing between the
    /// two statements.
    async fn acquire_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        user_email: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError> {
        let upsert_sql = r#"
            INSERT INTO field_locks (group_id, field_id, user_id, user_email, locked_at, expires_at)
            VALUES ($1, $2, $3, $4, NOW(), $5)
            ON CONFLICT (group_id, field_id) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                user_email = EXCLUDED.user_email,
                locked_at = NOW(),
                expires_at = EXCLUDED.expires_at
            WHERE field_locks.user_id = EXCLUDED.user_id
               OR field_locks.expires_at <= NOW()
            RETURNING field_id
        "#;
        let holder_sql = r#"
            SELECT user_id, user_email
            FROM field_locks
            WHERE group_id = $1 AND field_id = $2 AND expires_at > NOW()
        "#;

        for _ in 0..3 {
            let row = sqlx::query(upsert_sql)
                .bind(group_id)
                .bind(field_id)
                .bind(user_id)
                .bind(user_email)
                .bind(expires_at)
                .fetch_optional(&self.pool)
                .await?;

            if row.is_some() {
                debug!("Lock acquired on field {} by {}", field_id, user_id);
                return Ok(LockAttempt::Acquired);
            }

            let holder = sqlx::query(holder_sql)
                .bind(group_id)
                .bind(field_id)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = holder {
                return Ok(LockAttempt::Held {
                    user_id: row.try_get("user_id")?,
                    user_email: row.try_get("user_email")?,
                });
            }
            // The holder released or expired between the two statements; retry.
        }

        Err(StoreError::Internal(
            "lock arbitration did not converge".to_string(),
        ))
    }

    async fn release_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let query_sql = r#"
            DELETE FROM field_locks
            WHERE group_id = $1 AND field_id = $2 AND user_id = $3
            RETURNING field_id
        "#;

        let row = sqlx::query(query_sql)
            .bind(group_id)
            .bind(field_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn refresh_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // Expired locks are left for the sweeper instead of being revived.
        let query_sql = r#"
            UPDATE field_locks
            SET expires_at = $4
            WHERE group_id = $1 AND field_id = $2 AND user_id = $3 AND expires_at > NOW()
            RETURNING field_id
        "#;

        let row = sqlx::query(query_sql)
            .bind(group_id)
            .bind(field_id)
            .bind(user_id)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn field_lock(
        &self,
        group_id: Uuid,
        field_id: &str,
    ) -> Result<Option<LockRow>, StoreError> {
        let query_sql = r#"
            SELECT field_id, user_id, user_email, expires_at
            FROM field_locks
            WHERE group_id = $1 AND field_id = $2 AND expires_at > NOW()
        "#;

        let row = sqlx::query(query_sql)
            .bind(group_id)
            .bind(field_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(LockRow {
                field_id: row.try_get("field_id")?,
                user_id: row.try_get("user_id")?,
                user_email: row.try_get("user_email")?,
                expires_at: row.try_get("expires_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn group_locks(&self, group_id: Uuid) -> Result<Vec<LockRow>, StoreError> {
        let query_sql = r#"
            SELECT field_id, user_id, user_email, expires_at
            FROM field_locks
            WHERE group_id = $1 AND expires_at > NOW()
            ORDER BY field_id
        "#;

        let rows = sqlx::query(query_sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        let mut locks = Vec::with_capacity(rows.len());
        for row in rows {
            locks.push(LockRow {
                field_id: row.try_get("field_id")?,
                user_id: row.try_get("user_id")?,
                user_email: row.try_get("user_email")?,
                expires_at: row.try_get("expires_at")?,
            });
        }
        Ok(locks)
    }

    async fn release_user_locks(
        &self,
        group_id: Uuid,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let query_sql = r#"
            DELETE FROM field_locks
            WHERE group_id = $1 AND user_id = $2
            RETURNING field_id
        "#;

        let rows = sqlx::query(query_sql)
            .bind(group_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        let mut freed = Vec::with_capacity(rows.len());
        for row in rows {
            freed.push(row.try_get("field_id")?);
        }
        Ok(freed)
    }

    /// Remove all expired locks in one statement
    ///
    /// Selection and deletion share the same filter, so a lock is returned
    /// at most once even when several instances sweep concurrently.
    async fn delete_expired_locks(&self) -> Result<Vec<ExpiredLock>, StoreError> {
        let query_sql = r#"
            DELETE FROM field_locks fl
            USING form_groups g
            WHERE fl.group_id = g.id AND fl.expires_at <= NOW()
            RETURNING g.group_code, fl.field_id
        "#;

        let rows = sqlx::query(query_sql).fetch_all(&self.pool).await?;

        let mut expired = Vec::with_capacity(rows.len());
        for row in rows {
            expired.push(ExpiredLock {
                group_code: row.try_get("group_code")?,
                field_id: row.try_get("field_id")?,
            });
        }
        Ok(expired)
    }

    async fn count_live_locks(&self) -> Result<u32, StoreError> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS n FROM field_locks WHERE expires_at > NOW()"#)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }

    async fn draft_values(&self, group_id: Uuid) -> Result<HashMap<String, String>, StoreError> {
        let query_sql = r#"
            SELECT rf.field_id, rf.value
            FROM response_fields rf
                JOIN form_responses r ON r.id = rf.response_id
            WHERE r.group_id = $1 AND r.submitted_at IS NULL
        "#;

        let rows = sqlx::query(query_sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            values.insert(row.try_get("field_id")?, row.try_get("value")?);
        }
        Ok(values)
    }

    /// Write one field value into the group's current draft
    ///
    /// # Arguments
    /// * `group_id` - Group whose draft is edited
    /// * `field_id` - Field identifier within the form
    /// * `value` - Normalized value ("" clears the field)
    /// * `user_id` - User making the edit
    ///
    /// # Returns
    /// * `Result<Uuid, StoreError>` - The draft's response id
    async fn upsert_draft_value(
        &self,
        group_id: Uuid,
        field_id: &str,
        value: &str,
        user_id: &str,
    ) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Lazily create the draft. The partial unique index on
        // (group_id) WHERE submitted_at IS NULL makes concurrent first
        // edits converge on a single row.
        sqlx::query(
            r#"
            INSERT INTO form_responses (group_id)
            VALUES ($1)
            ON CONFLICT (group_id) WHERE submitted_at IS NULL DO NOTHING
        "#,
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        let draft = sqlx::query(
            r#"SELECT id FROM form_responses WHERE group_id = $1 AND submitted_at IS NULL"#,
        )
        .bind(group_id)
        .fetch_one(&mut *tx)
        .await?;
        let response_id: Uuid = draft.try_get("id")?;

        sqlx::query(
            r#"
            INSERT INTO response_fields (response_id, field_id, value, updated_by, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (response_id, field_id) DO UPDATE
            SET value = EXCLUDED.value,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
        "#,
        )
        .bind(response_id)
        .bind(field_id)
        .bind(value)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(r#"UPDATE form_responses SET updated_at = NOW() WHERE id = $1"#)
            .bind(response_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(response_id)
    }

    async fn record_contribution(
        &self,
        group_id: Uuid,
        field_id: &str,
        user_id: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let query_sql = r#"
            INSERT INTO field_contributions (group_id, field_id, user_id, value, contributed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (group_id, field_id, user_id) DO UPDATE
            SET value = EXCLUDED.value,
                contributed_at = NOW()
        "#;

        sqlx::query(query_sql)
            .bind(group_id)
            .bind(field_id)
            .bind(user_id)
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Finalize the group's current draft as a submitted response
    ///
    /// # Arguments
    /// * `group_id` - Group being submitted
    /// * `user_id` - User who triggered the submission
    /// * `values` - Final field values, upserted over the draft
    ///
    /// # Returns
    /// * `Result<Uuid, StoreError>` - The persisted response id
    async fn finalize_draft(
        &self,
        group_id: Uuid,
        user_id: &str,
        values: &HashMap<String, String>,
    ) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO form_responses (group_id)
            VALUES ($1)
            ON CONFLICT (group_id) WHERE submitted_at IS NULL DO NOTHING
        "#,
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        let draft = sqlx::query(
            r#"SELECT id FROM form_responses WHERE group_id = $1 AND submitted_at IS NULL"#,
        )
        .bind(group_id)
        .fetch_one(&mut *tx)
        .await?;
        let response_id: Uuid = draft.try_get("id")?;

        for (field_id, value) in values {
            sqlx::query(
                r#"
                INSERT INTO response_fields (response_id, field_id, value, updated_by, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (response_id, field_id) DO UPDATE
                SET value = EXCLUDED.value,
                    updated_by = EXCLUDED.updated_by,
                    updated_at = NOW()
            "#,
            )
            .bind(response_id)
            .bind(field_id)
            .bind(value)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE form_responses
            SET submitted_at = NOW(),
                submitted_by = $2,
                updated_at = NOW()
            WHERE id = $1
        "#,
        )
        .bind(response_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!("Response {} submitted for group {}", response_id, group_id);
        Ok(response_id)
    }

    async fn discard_draft(&self, group_id: Uuid) -> Result<bool, StoreError> {
        // response_fields rows go with the draft via ON DELETE CASCADE.
        let query_sql = r#"
            DELETE FROM form_responses
            WHERE group_id = $1 AND submitted_at IS NULL
            RETURNING id
        "#;

        let row = sqlx::query(query_sql)
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;

        if row.is_some() {
            info!("Draft discarded for group {}", group_id);
        }
        Ok(row.is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
