//! # PostgreSQL Durable Store
//!
//! Historical storage of readings in a PostgreSQL table, accessed through a
//! `deadpool_postgres` pool sized to the number of workers.
//!
//! ## Layout:
//! - `PostgresStore` owns the pool; it creates the table on startup and
//!   serves read-side range queries.
//! - `PostgresWriter` is the per-worker handle. It checks one connection out
//!   of the pool and keeps it, so workers never contend on a connection. A
//!   failed write drops the connection and the next attempt checks out a
//!   fresh one.

use std::fmt::Write as _;

use chrono::{DateTime, FixedOffset};
use deadpool_postgres::{
    Config as DeadpoolConfig, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::configs::DurableConfig;
use crate::connections::sink::DurableSink;
use crate::error::SinkError;
use crate::reading::Reading;

/// PostgreSQL accepts at most 65535 bind parameters per statement; three per row.
const MAX_ROWS_PER_STATEMENT: usize = 65535 / 3;

/// A wrapper around the PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
    table: String,
}

impl PostgresStore {
    /// Creates the pool. Connections are opened lazily on first checkout.
    ///
    /// # Arguments
    /// * `config` - Connection parameters and target table (validated upstream).
    /// * `max_connections` - Pool size; one per worker plus headroom for reads.
    pub fn new(config: &DurableConfig, max_connections: usize) -> Result<Self, SinkError> {
        let mut pg = DeadpoolConfig::new();
        pg.host = Some(config.host.clone());
        pg.port = Some(config.port);
        pg.user = Some(config.user.clone());
        pg.password = config.password.clone();
        pg.dbname = Some(config.dbname.clone());
        pg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pg.pool = Some(PoolConfig::new(max_connections.max(1)));

        let pool = pg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(Self {
            pool,
            table: config.table.clone(),
        })
    }

    /// Creates the readings table and its `(device_id, ts)` index if missing.
    pub async fn ensure_schema(&self) -> Result<(), SinkError> {
        let client = self.pool.get().await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id          BIGSERIAL PRIMARY KEY,
                device_id   BIGINT      NOT NULL,
                ts          TIMESTAMPTZ NOT NULL,
                temperature BIGINT      NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_device_ts_idx ON {table} (device_id, ts);",
            table = self.table
        );
        client.batch_execute(&ddl).await?;
        tracing::info!(table = %self.table, "durable store schema ready");
        Ok(())
    }

    /// A dedicated writer for one worker.
    pub fn writer(&self) -> PostgresWriter {
        PostgresWriter {
            pool: self.pool.clone(),
            table: self.table.clone(),
            client: None,
        }
    }

    /// Readings of `device_id` with `start <= ts <= end`, oldest first.
    pub async fn find_range(
        &self,
        device_id: i64,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<Reading>, SinkError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT device_id, ts, temperature FROM {} \
             WHERE device_id = $1 AND ts >= $2 AND ts <= $3 ORDER BY ts",
            self.table
        );
        let rows = client.query(sql.as_str(), &[&device_id, &start, &end]).await?;
        Ok(rows
            .iter()
            .map(|row| Reading::new(row.get(0), row.get(1), row.get(2)))
            .collect())
    }
}

pub struct PostgresWriter {
    pool: Pool,
    table: String,
    client: Option<Object>,
}

impl PostgresWriter {
    async fn write(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        if self.client.is_none() {
            self.client = Some(self.pool.get().await?);
        }
        let Some(client) = self.client.as_mut() else {
            return Err(SinkError::Unavailable("no postgres connection".to_string()));
        };

        let tx = client.transaction().await?;
        for chunk in readings.chunks(MAX_ROWS_PER_STATEMENT) {
            let sql = insert_statement(&self.table, chunk.len());
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 3);
            for reading in chunk {
                params.push(&reading.device_id);
                params.push(&reading.timestamp);
                params.push(&reading.temperature);
            }
            tx.execute(sql.as_str(), &params).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

impl DurableSink for PostgresWriter {
    async fn insert_many(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        if readings.is_empty() {
            return Ok(());
        }
        let result = self.write(readings).await;
        if result.is_err() {
            // Don't reuse a connection that may be broken.
            self.client = None;
        }
        result
    }
}

/// `INSERT INTO <table> (device_id, ts, temperature) VALUES ($1, $2, $3), ...`
fn insert_statement(table: &str, rows: usize) -> String {
    let mut sql = format!("INSERT INTO {} (device_id, ts, temperature) VALUES ", table);
    for i in 0..rows {
        if i > 0 {
            sql.push_str(", ");
        }
        let base = i * 3;
        let _ = write!(sql, "(${}, ${}, ${})", base + 1, base + 2, base + 3);
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_statement_numbers_parameters() {
        assert_eq!(
            insert_statement("readings", 2),
            "INSERT INTO readings (device_id, ts, temperature) VALUES ($1, $2, $3), ($4, $5, $6)"
        );
    }
}
