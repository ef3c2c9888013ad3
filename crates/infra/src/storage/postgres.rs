//! Postgres-backed storage repository (`object_head` / `object_part`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use super::error::{StorageError, StorageResult, map_sqlx_error};
use super::repository::{PartRef, StorageHead, StorageRepository};

/// Chunked blob store kept in two Postgres tables.
///
/// Each appended part is inserted and accounted to its head in one
/// transaction that locks the head row, so concurrent writers to the same key
/// serialize and the head length always matches its parts.
#[derive(Debug, Clone)]
pub struct PgStorageRepository {
    pool: PgPool,
}

impl PgStorageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_head(row: &PgRow) -> StorageResult<StorageHead> {
    let decode = || -> Result<StorageHead, sqlx::Error> {
        let length: i64 = row.try_get("length")?;
        Ok(StorageHead {
            id: row.try_get("id")?,
            key: row.try_get("code")?,
            length: length as u64,
            modify_timestamp: row.try_get("modify_timestamp")?,
        })
    };
    decode().map_err(|e| StorageError::Database(format!("failed to decode head row: {}", e)))
}

fn read_count(row: &PgRow, column: &str) -> StorageResult<u64> {
    let value: i64 = row
        .try_get(column)
        .map_err(|e| StorageError::Database(format!("failed to read {}: {}", column, e)))?;
    Ok(value as u64)
}

#[async_trait]
impl StorageRepository for PgStorageRepository {
    #[instrument(skip(self), err)]
    async fn create_head(&self, key: &str) -> StorageResult<StorageHead> {
        let row = sqlx::query(
            r#"
            INSERT INTO object_head (code, length, create_timestamp, modify_timestamp)
            VALUES ($1, 0, NOW(), NOW())
            RETURNING id, code, length, modify_timestamp
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match map_sqlx_error("create_head", e) {
            StorageError::IllegalState(_) => {
                StorageError::IllegalState(format!("storage head [{}] already exists", key))
            }
            other => other,
        })?;

        decode_head(&row)
    }

    async fn find_head(&self, key: &str) -> StorageResult<Option<StorageHead>> {
        let row = sqlx::query(
            "SELECT id, code, length, modify_timestamp FROM object_head WHERE code = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_head", e))?;

        row.as_ref().map(decode_head).transpose()
    }

    #[instrument(skip(self, data), fields(part_length = data.len()), err)]
    async fn append_part(&self, head_id: i64, data: &[u8]) -> StorageResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let head = sqlx::query("SELECT length FROM object_head WHERE id = $1 FOR UPDATE")
            .bind(head_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_head", e))?
            .ok_or_else(|| StorageError::NotFound(format!("head id {}", head_id)))?;
        let before = read_count(&head, "length")?;

        sqlx::query("INSERT INTO object_part (object_head_id, length, data) VALUES ($1, $2, $3)")
            .bind(head_id)
            .bind(data.len() as i64)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_part", e))?;

        let row = sqlx::query(
            r#"
            UPDATE object_head
            SET length = length + $2, modify_timestamp = NOW()
            WHERE id = $1
            RETURNING length
            "#,
        )
        .bind(head_id)
        .bind(data.len() as i64)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_head_length", e))?;
        let after = read_count(&row, "length")?;

        if after != before + data.len() as u64 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StorageError::Corrupt(format!(
                "head id {} length moved from {} to {} for a {} byte part",
                head_id,
                before,
                after,
                data.len()
            )));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(head_id, part_length = data.len(), head_length = after, "stored part");
        Ok(after)
    }

    async fn list_parts(&self, head_id: i64) -> StorageResult<Vec<PartRef>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ordering, length
            FROM object_part
            WHERE object_head_id = $1
            ORDER BY ordering ASC
            "#,
        )
        .bind(head_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_parts", e))?;

        rows.iter()
            .map(|row| {
                Ok(PartRef {
                    id: row
                        .try_get("id")
                        .map_err(|e| StorageError::Database(format!("failed to read part id: {}", e)))?,
                    ordering: row.try_get("ordering").map_err(|e| {
                        StorageError::Database(format!("failed to read part ordering: {}", e))
                    })?,
                    length: read_count(row, "length")?,
                })
            })
            .collect()
    }

    async fn read_part(&self, part_id: i64) -> StorageResult<Vec<u8>> {
        let row = sqlx::query("SELECT data FROM object_part WHERE id = $1")
            .bind(part_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_part", e))?
            .ok_or_else(|| StorageError::NotFound(format!("part id {}", part_id)))?;

        row.try_get("data")
            .map_err(|e| StorageError::Database(format!("failed to read part data: {}", e)))
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            DELETE FROM object_part
            WHERE object_head_id IN (SELECT id FROM object_head WHERE code = $1)
            "#,
        )
        .bind(key)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("remove_parts", e))?;

        let removed = sqlx::query("DELETE FROM object_head WHERE code = $1")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove_head", e))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(removed > 0)
    }

    #[instrument(skip(self), err)]
    async fn clear(&self) -> StorageResult<()> {
        sqlx::query("TRUNCATE object_part, object_head")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear", e))?;

        info!("cleared all stored objects");
        Ok(())
    }

    async fn keys_modified_before(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT code FROM object_head WHERE modify_timestamp < $1 ORDER BY modify_timestamp ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("keys", e))?;

        rows.iter()
            .map(|row| {
                row.try_get("code")
                    .map_err(|e| StorageError::Database(format!("failed to read head code: {}", e)))
            })
            .collect()
    }

    async fn size(&self) -> StorageResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM object_head")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("size", e))?;
        read_count(&row, "total")
    }

    async fn total_bytes(&self) -> StorageResult<u64> {
        let row = sqlx::query("SELECT COALESCE(SUM(length), 0)::BIGINT AS total FROM object_head")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("total_bytes", e))?;
        read_count(&row, "total")
    }
}
