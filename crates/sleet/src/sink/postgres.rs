//! Postgres bulk sink.
//!
//! Batches are merged with a single set-based statement:
//! `INSERT ... SELECT FROM UNNEST($keys, $documents) ON CONFLICT
//! (entity_key) DO UPDATE`. Each merge runs in a transaction holding a
//! per-table advisory lock, so concurrent batches of the same dataset
//! tag serialize at the sink while different tags load in parallel.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Row};
use tracing::{debug, info};

use crate::error::SinkError;
use crate::pipeline::types::SealedBatch;

use super::BulkSink;

/// Production sink backed by a Postgres connection pool sized to the
/// loader worker count.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Connect to the sink database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| SinkError::Unavailable {
                message: e.to_string(),
            })?;

        info!(max_connections, "Connected to sink database");
        Ok(Self { pool })
    }
}

#[async_trait]
impl BulkSink for PostgresSink {
    async fn ensure_table(&self, table: &str) -> Result<(), SinkError> {
        let ident = quote_ident(table)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {ident} (
                entity_key text PRIMARY KEY,
                document jsonb NOT NULL,
                loaded_at timestamptz NOT NULL DEFAULT now()
            )"
        );
        self.pool
            .execute(ddl.as_str())
            .await
            .map_err(classify_sqlx_error)?;
        debug!(table, "Ensured sink table");
        Ok(())
    }

    async fn bulk_merge(&self, batch: &SealedBatch) -> Result<u64, SinkError> {
        let ident = quote_ident(&batch.table)?;

        // Postgres rejects a statement that updates the same row twice
        // through ON CONFLICT, so duplicate keys within a batch are
        // collapsed first (last record wins).
        let mut seen = HashSet::with_capacity(batch.records.len());
        let mut keys: Vec<String> = Vec::with_capacity(batch.records.len());
        let mut documents: Vec<Value> = Vec::with_capacity(batch.records.len());
        for record in batch.records.iter().rev() {
            if seen.insert(record.entity_key.as_str()) {
                keys.push(record.entity_key.clone());
                documents.push(record.document.clone());
            }
        }

        let statement = format!(
            "INSERT INTO {ident} (entity_key, document, loaded_at)
             SELECT key, doc, now()
             FROM UNNEST($1::text[], $2::jsonb[]) AS source(key, doc)
             ON CONFLICT (entity_key)
             DO UPDATE SET document = EXCLUDED.document,
                           loaded_at = EXCLUDED.loaded_at"
        );

        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        // Advisory lock keyed by table name: exclusive within the
        // table for the duration of this transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&batch.table)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;

        let result = sqlx::query(&statement)
            .bind(&keys)
            .bind(&documents)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;

        tx.commit().await.map_err(classify_sqlx_error)?;

        debug!(
            table = %batch.table,
            sequence = batch.sequence,
            rows = result.rows_affected(),
            "Bulk merge committed"
        );
        Ok(result.rows_affected())
    }

    async fn existing_keys(&self, table: &str) -> Result<HashSet<String>, SinkError> {
        let ident = quote_ident(table)?;
        let statement = format!("SELECT entity_key FROM {ident}");

        let rows = sqlx::query(&statement)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("entity_key"))
            .collect())
    }
}

/// Quote a table name as a Postgres identifier.
///
/// Table names come from config, not user data, but quoting keeps
/// unusual names working and rejects embedded quotes outright.
fn quote_ident(name: &str) -> Result<String, SinkError> {
    if name.contains('"') || name.contains('\0') {
        return Err(SinkError::Permanent {
            message: format!("invalid table name: {name:?}"),
        });
    }
    Ok(format!("\"{name}\""))
}

/// Map sqlx errors onto the retry taxonomy.
///
/// - Connectivity problems are `Unavailable` (fail the run once the
///   top-level budget is spent).
/// - Deadlocks, serialization failures, and timeouts are `Transient`
///   (retry the whole batch).
/// - Everything else (constraint violations, bad casts) is `Permanent`
///   (quarantine the batch, continue the run).
fn classify_sqlx_error(error: sqlx::Error) -> SinkError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            SinkError::Unavailable {
                message: error.to_string(),
            }
        }
        sqlx::Error::PoolTimedOut => SinkError::Transient {
            message: error.to_string(),
        },
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // 40001 serialization_failure, 40P01 deadlock_detected,
            // 55P03 lock_not_available, 57014 query_canceled (statement
            // timeout).
            Some("40001") | Some("40P01") | Some("55P03") | Some("57014") => {
                SinkError::Transient {
                    message: error.to_string(),
                }
            }
            // 57P01-57P03: server shutdown / crash / cannot connect now.
            Some(code) if code.starts_with("57P") => SinkError::Unavailable {
                message: error.to_string(),
            },
            // 08xxx: connection exceptions.
            Some(code) if code.starts_with("08") => SinkError::Unavailable {
                message: error.to_string(),
            },
            _ => SinkError::Permanent {
                message: error.to_string(),
            },
        },
        _ => SinkError::Permanent {
            message: error.to_string(),
        },
    }
}
