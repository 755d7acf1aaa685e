use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::engine::RunId;
use crate::record::{
    BusinessKey, ExecutionRecord, NewExecutionRecord, RecordError, RecordId, RecordStatus,
    StatusUpdate, Transition,
};
use crate::store::ExecutionRecordStore;

const COLUMNS: &str = "id, business_key, job_name, run_id, status, start_time, end_time, \
                       created_at, failure";

/// PostgreSQL-backed implementation of the record store.
///
/// Status changes are read-modify-write inside a transaction holding a row
/// lock, so the state machine in [`ExecutionRecord::apply`] is the single
/// source of truth for both backends.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the records table and its indexes if missing.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conductor_execution_records (
                id UUID PRIMARY KEY,
                business_key TEXT NOT NULL UNIQUE,
                job_name TEXT NOT NULL,
                run_id UUID UNIQUE,
                status TEXT NOT NULL,
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                failure TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS conductor_execution_records_start_idx
                ON conductor_execution_records (start_time DESC NULLS LAST)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("conductor_execution_records schema ready");
        Ok(())
    }

    fn row_to_record(row: &PgRow) -> anyhow::Result<ExecutionRecord> {
        let status: String = row.try_get("status")?;
        let run_id: Option<Uuid> = row.try_get("run_id")?;
        let business_key: String = row.try_get("business_key")?;
        Ok(ExecutionRecord {
            id: RecordId(row.try_get("id")?),
            business_key: BusinessKey::from(business_key),
            job_name: row.try_get("job_name")?,
            run_id: run_id.map(RunId),
            status: status.parse::<RecordStatus>()?,
            start_time: row.try_get::<Option<DateTime<Utc>>, _>("start_time")?,
            end_time: row.try_get::<Option<DateTime<Utc>>, _>("end_time")?,
            created_at: row.try_get("created_at")?,
            failure: row.try_get("failure")?,
        })
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => {
                db_err.code().map(|c| c.to_string()).as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ExecutionRecordStore for PostgresRecordStore {
    async fn insert(&self, new: NewExecutionRecord) -> anyhow::Result<ExecutionRecord> {
        let record = ExecutionRecord::new(new);

        let res = sqlx::query(
            r#"
            INSERT INTO conductor_execution_records (
                id, business_key, job_name, run_id, status, start_time, end_time,
                created_at, failure
            )
            VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6, NULL)
            "#,
        )
        .bind(record.id.0)
        .bind(record.business_key.as_str())
        .bind(&record.job_name)
        .bind(record.run_id.map(|r| r.0))
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => {
                debug!(record_id = %record.id, business_key = %record.business_key, "record created");
                Ok(record)
            }
            Err(err) if Self::is_unique_violation(&err) => Err(anyhow::anyhow!(
                "record insert conflict for business key {}: {}",
                record.business_key,
                err
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: RecordId) -> anyhow::Result<Option<ExecutionRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM conductor_execution_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find_by_run(&self, run_id: RunId) -> anyhow::Result<Option<ExecutionRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM conductor_execution_records WHERE run_id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn assign_run_id(
        &self,
        id: RecordId,
        run_id: RunId,
    ) -> anyhow::Result<ExecutionRecord> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {COLUMNS} FROM conductor_execution_records WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(RecordError::NotFound(id).into());
        };
        let mut record = Self::row_to_record(&row)?;
        if record.run_id == Some(run_id) {
            return Ok(record);
        }
        record.assign_run_id(run_id)?;

        sqlx::query("UPDATE conductor_execution_records SET run_id = $2 WHERE id = $1")
            .bind(id.0)
            .bind(run_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn transition(
        &self,
        id: RecordId,
        update: StatusUpdate,
    ) -> anyhow::Result<(Transition, ExecutionRecord)> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {COLUMNS} FROM conductor_execution_records WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(RecordError::NotFound(id).into());
        };
        let mut record = Self::row_to_record(&row)?;

        let outcome = record.apply(update)?;
        if outcome == Transition::Ignored {
            drop(tx);
            debug!(record_id = %id, status = %record.status, "write to terminal record ignored");
            return Ok((outcome, record));
        }

        sqlx::query(
            r#"
            UPDATE conductor_execution_records
            SET status = $2,
                start_time = $3,
                end_time = $4,
                failure = $5
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(record.status.as_str())
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.failure)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok((outcome, record))
    }

    async fn list(&self) -> anyhow::Result<Vec<ExecutionRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM conductor_execution_records \
             ORDER BY start_time DESC NULLS LAST, created_at DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_record).collect()
    }
}
