use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::common::{from_millis, parse_uuid};
use crate::{
    db::{
        error::DbResult,
        repos::{LockRepo, lock::expiry_millis},
    },
    models::LockRecord,
};

pub struct PostgresLockRepo {
    pool: PgPool,
}

impl PostgresLockRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepo for PostgresLockRepo {
    async fn try_acquire(
        &self,
        name: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO pruner_lock (name, owner, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                acquired_at = CASE
                    WHEN pruner_lock.owner = EXCLUDED.owner
                        AND pruner_lock.expires_at > EXCLUDED.acquired_at
                    THEN pruner_lock.acquired_at
                    ELSE EXCLUDED.acquired_at
                END,
                expires_at = EXCLUDED.expires_at
            WHERE pruner_lock.expires_at <= EXCLUDED.acquired_at
                OR pruner_lock.owner = EXCLUDED.owner
            "#,
        )
        .bind(name)
        .bind(owner.to_string())
        .bind(now.timestamp_millis())
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
            SET expires_at = $1
            WHERE name = $2 AND owner = $3 AND expires_at > $4
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
        sqlx::query("DELETE FROM pruner_lock WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get(&self, name: &str) -> DbResult<Option<LockRecord>> {
        let result = sqlx::query(
            "SELECT name, owner, acquired_at, expires_at FROM pruner_lock WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = result else {
            return Ok(None);
        };

        let owner: String = row.get("owner");
        Ok(Some(LockRecord {
            name: row.get("name"),
            owner: parse_uuid(&owner)?,
            acquired_at: from_millis(row.get("acquired_at"))?,
            expires_at: from_millis(row.get("expires_at"))?,
        }))
    }
}
