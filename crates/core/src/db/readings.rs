//! The outbox table. Inserts are deduplicated by the
//! `(meter_id, element_id, timestamp, data_point)` unique constraint, so
//! re-persisting the same readings is a no-op rather than a duplicate row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::error::DbError;
use crate::model::{MeterReading, PendingReading, SyncStatus};

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Insert a batch in one transaction, skipping rows already present.
    /// Returns the number of rows actually inserted.
    async fn insert_batch(&self, readings: &[PendingReading]) -> Result<u64, DbError>;

    /// Atomically select up to `limit` pending rows (oldest first, retries
    /// below `max_retries`) and mark them in-flight.
    async fn claim_pending(&self, limit: i64, max_retries: i32)
        -> Result<Vec<MeterReading>, DbError>;

    /// Uploaded: terminal, never touched again.
    async fn mark_done(&self, ids: &[i64]) -> Result<(), DbError>;

    /// Rejected by the remote: kept out of automatic retry.
    async fn mark_failed(&self, ids: &[i64], error: &str) -> Result<(), DbError>;

    /// Transient failure: back to pending with the retry counted.
    async fn release_to_pending(&self, ids: &[i64], error: &str) -> Result<(), DbError>;

    /// Cancellation: back to pending without burning a retry.
    async fn release_claimed(&self, ids: &[i64]) -> Result<(), DbError>;

    async fn count_pending(&self, max_retries: i32) -> Result<i64, DbError>;

    async fn count_in_flight(&self) -> Result<i64, DbError>;
}

pub struct PgReadingStore {
    pool: Pool,
}

impl PgReadingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

const READING_COLUMNS: &str =
    "id, meter_id, element_id, timestamp, data_point, value, unit, \
     is_synchronized, sync_status, retry_count, last_error, created_at";

fn reading_from_row(row: &Row) -> Result<MeterReading, DbError> {
    let status: String = row.get("sync_status");
    let sync_status = SyncStatus::from_str(&status)
        .ok_or_else(|| DbError::Decode(format!("unknown sync_status `{status}`")))?;
    Ok(MeterReading {
        id: row.get("id"),
        meter_id: row.get("meter_id"),
        element_id: row.get("element_id"),
        timestamp: row.get::<_, DateTime<Utc>>("timestamp"),
        data_point: row.get("data_point"),
        value: row.get("value"),
        unit: row.get("unit"),
        is_synchronized: row.get("is_synchronized"),
        sync_status,
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        created_at: row.get::<_, DateTime<Utc>>("created_at"),
    })
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn insert_batch(&self, readings: &[PendingReading]) -> Result<u64, DbError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut sql = String::from(
            "INSERT INTO meter_reading \
             (meter_id, element_id, timestamp, data_point, value, unit) VALUES ",
        );
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(readings.len() * 6);
        for (i, reading) in readings.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let base = i * 6;
            sql.push_str(&format!(
                "(${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6
            ));
            params.push(&reading.meter_id);
            params.push(&reading.element_id);
            params.push(&reading.timestamp);
            params.push(&reading.data_point);
            params.push(&reading.value);
            params.push(&reading.unit);
        }
        sql.push_str(
            " ON CONFLICT (meter_id, element_id, timestamp, data_point) DO NOTHING",
        );

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let inserted = tx.execute(sql.as_str(), &params).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn claim_pending(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<MeterReading>, DbError> {
        let sql = format!(
            "UPDATE meter_reading SET sync_status = 'in_flight' \
             WHERE id IN ( \
                 SELECT id FROM meter_reading \
                 WHERE sync_status = 'pending' AND retry_count < $1 \
                 ORDER BY created_at ASC \
                 LIMIT $2 \
             ) RETURNING {READING_COLUMNS}"
        );
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx.query(sql.as_str(), &[&max_retries, &limit]).await?;
        tx.commit().await?;

        let mut readings = rows
            .iter()
            .map(reading_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING gives no ordering guarantee; the upload contract does.
        readings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(readings)
    }

    async fn mark_done(&self, ids: &[i64]) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE meter_reading \
                 SET sync_status = 'done', is_synchronized = TRUE, last_error = NULL \
                 WHERE id = ANY($1)",
                &[&ids],
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, ids: &[i64], error: &str) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE meter_reading \
                 SET sync_status = 'failed', retry_count = retry_count + 1, last_error = $2 \
                 WHERE id = ANY($1)",
                &[&ids, &error],
            )
            .await?;
        Ok(())
    }

    async fn release_to_pending(&self, ids: &[i64], error: &str) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE meter_reading \
                 SET sync_status = 'pending', retry_count = retry_count + 1, last_error = $2 \
                 WHERE id = ANY($1)",
                &[&ids, &error],
            )
            .await?;
        Ok(())
    }

    async fn release_claimed(&self, ids: &[i64]) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE meter_reading SET sync_status = 'pending' WHERE id = ANY($1)",
                &[&ids],
            )
            .await?;
        Ok(())
    }

    async fn count_pending(&self, max_retries: i32) -> Result<i64, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM meter_reading \
                 WHERE sync_status = 'pending' AND retry_count < $1",
                &[&max_retries],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn count_in_flight(&self) -> Result<i64, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM meter_reading WHERE sync_status = 'in_flight'",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }
}
