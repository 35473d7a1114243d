use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::{
    error::DbResult,
    repos::{RetentionRepo, RetentionTable, retention::cutoff_nanos},
};

pub struct SqliteRetentionRepo {
    pool: SqlitePool,
    table: RetentionTable,
}

impl SqliteRetentionRepo {
    pub fn new(pool: SqlitePool, table: RetentionTable) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl RetentionRepo for SqliteRetentionRepo {
    fn table(&self) -> RetentionTable {
        self.table
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>, batch_size: u32) -> DbResult<u64> {
        let cutoff = cutoff_nanos(cutoff)?;
        let limit = i64::from(batch_size.max(1));
        // Table and column names come from RetentionTable constants, never from input.
        let statement = format!(
            "DELETE FROM {table} WHERE rowid IN (
                SELECT rowid FROM {table} WHERE {column} < ? LIMIT ?
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
