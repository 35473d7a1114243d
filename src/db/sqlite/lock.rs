use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::common::{from_millis, parse_uuid};
use crate::{
    db::{
        error::DbResult,
        repos::{LockRepo, lock::expiry_millis},
    },
    models::LockRecord,
};

pub struct SqliteLockRepo {
    pool: SqlitePool,
}

impl SqliteLockRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepo for SqliteLockRepo {
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> DbResult<bool> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO pruner_lock (name, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = CASE
                    WHEN pruner_lock.owner = excluded.owner
                        AND pruner_lock.expires_at > excluded.acquired_at
                    THEN pruner_lock.acquired_at
                    ELSE excluded.acquired_at
                END,
                expires_at = excluded.expires_at
            WHERE pruner_lock.expires_at <= excluded.acquired_at
                OR pruner_lock.owner = excluded.owner
            "#,
        )
        .bind(name)
        .bind(owner.to_string())
        .bind(now_ms)
        .bind(expiry_millis(now, ttl))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew(
        &self,
        name: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pruner_lock
            SET expires_at = ?
            WHERE name = ? AND owner = ? AND expires_at > ?
            "#,
        )
        .bind(expiry_millis(now, ttl))
        .bind(name)
        .bind(owner.to_string())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, owner: Uuid) -> DbResult<()> {
        sqlx::query("DELETE FROM pruner_lock WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get(&self, name: &str) -> DbResult<Option<LockRecord>> {
        let result = sqlx::query(
            "SELECT name, owner, acquired_at, expires_at FROM pruner_lock WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match result {
            Some(row) => Ok(Some(LockRecord {
                name: row.get("name"),
                owner: parse_uuid(&row.get::<String, _>("owner"))?,
                acquired_at: from_millis(row.get("acquired_at"))?,
                expires_at: from_millis(row.get("expires_at"))?,
            })),
            None => Ok(None),
        }
    }
}
