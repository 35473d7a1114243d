use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::{
    error::DbResult,
    repos::{RetentionRepo, RetentionTable, retention::cutoff_nanos},
};

pub struct PostgresRetentionRepo {
    pool: PgPool,
    table: RetentionTable,
}

impl PostgresRetentionRepo {
    pub fn new(pool: PgPool, table: RetentionTable) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl RetentionRepo for PostgresRetentionRepo {
    fn table(&self) -> RetentionTable {
        self.table
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>, batch_size: u32) -> DbResult<u64> {
        let cutoff = cutoff_nanos(cutoff)?;
        let limit = i64::from(batch_size.max(1));
        // PostgreSQL has no DELETE ... LIMIT; select physical row ids instead.
        let statement = format!(
            "DELETE FROM {table} WHERE ctid IN (
                SELECT ctid FROM {table} WHERE {column} < $1 LIMIT $2
            )",
            table = self.table.name,
            column = self.table.timestamp_column,
        );

        let mut total_deleted: u64 = 0;

        loop {
            let result = sqlx::query(&statement)
                .bind(cutoff)
                .bind(limit)
                .execute(&self.pool)
                .await?;

            let rows_deleted = result.rows_affected();
            total_deleted += rows_deleted;

            if rows_deleted < limit as u64 {
                break;
            }
        }

        Ok(total_deleted)
    }
}
