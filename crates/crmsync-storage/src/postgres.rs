//! Postgres-backed table store and run log.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmsync_core::{ErrorDetail, RunStatus, SyncMode, SyncRun, ID_COLUMN};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row as _};
use tracing::debug;
use uuid::Uuid;

use crate::table::{
    validate_identifier, ColumnValue, Row, RowOutcome, RunLog, StorageType, StoreError, TableStore,
};

const RUN_COLUMNS: &str = "id, object_api_name, mode, status, started_at, finished_at, \
     success_count, error_count, error_detail, since, watermark, checkpoint_offset";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub async fn connect(database_url: &str, schema: &str) -> anyhow::Result<Self> {
        validate_identifier(schema).context("validating warehouse schema name")?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to warehouse database")?;
        Ok(Self::new(pool, schema))
    }

    /// Apply the bundled `sync_runs` migrations and make sure the data schema exists.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running sync_runs migrations")?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)))
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating schema {}", self.schema))?;
        Ok(())
    }

    fn qualified(&self, table: &str) -> Result<String, StoreError> {
        validate_identifier(table)?;
        Ok(format!("{}.{}", quote_ident(&self.schema), quote_ident(table)))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn upsert_sql(qualified: &str, row: &Row) -> String {
    let mut columns = vec![quote_ident(ID_COLUMN)];
    columns.extend(row.values.keys().map(|c| quote_ident(c)));
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict_action = if row.values.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments = row
            .values
            .keys()
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("DO UPDATE SET {assignments}")
    };
    format!(
        "INSERT INTO {qualified} ({}) VALUES ({placeholders}) ON CONFLICT ({}) {conflict_action}",
        columns.join(", "),
        quote_ident(ID_COLUMN),
    )
}

fn run_from_row(row: &PgRow) -> Result<SyncRun, StoreError> {
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let error_detail: Option<JsonValue> = row.try_get("error_detail")?;
    let success_count: i64 = row.try_get("success_count")?;
    let error_count: i64 = row.try_get("error_count")?;
    let checkpoint_offset: Option<i64> = row.try_get("checkpoint_offset")?;

    Ok(SyncRun {
        id: row.try_get::<Uuid, _>("id")?,
        object_api_name: row.try_get("object_api_name")?,
        mode: SyncMode::parse(&mode)
            .ok_or_else(|| StoreError::Encode(format!("invalid run mode {mode}")))?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Encode(format!("invalid run status {status}")))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        success_count: success_count.max(0) as u64,
        error_count: error_count.max(0) as u64,
        error_detail: error_detail
            .map(serde_json::from_value::<ErrorDetail>)
            .transpose()
            .map_err(|e| StoreError::Encode(e.to_string()))?,
        since: row.try_get("since")?,
        watermark: row.try_get("watermark")?,
        checkpoint_offset: checkpoint_offset.map(|o| o.max(0) as u64),
    })
}

fn detail_json(run: &SyncRun) -> Result<Option<JsonValue>, StoreError> {
    run.error_detail
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Encode(e.to_string()))
}

#[async_trait]
impl TableStore for PgStore {
    async fn ensure_table(&self, table: &str) -> Result<bool, StoreError> {
        let qualified = self.qualified(table)?;
        let existed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        if existed {
            return Ok(false);
        }
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {qualified} ({} TEXT PRIMARY KEY)",
            quote_ident(ID_COLUMN)
        ))
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn list_columns(&self, table: &str) -> Result<BTreeSet<String>, StoreError> {
        validate_identifier(table)?;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        if names.is_empty() {
            return Err(StoreError::MissingTable(table.to_string()));
        }
        Ok(names.into_iter().collect())
    }

    async fn add_column(
        &self,
        table: &str,
        column: &str,
        storage_type: StorageType,
    ) -> Result<(), StoreError> {
        let qualified = self.qualified(table)?;
        validate_identifier(column)?;
        sqlx::query(&format!(
            "ALTER TABLE {qualified} ADD COLUMN IF NOT EXISTS {} {}",
            quote_ident(column),
            storage_type.sql_type()
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_rows(&self, table: &str, rows: &[Row]) -> Result<Vec<RowOutcome>, StoreError> {
        let qualified = self.qualified(table)?;
        let mut outcomes = Vec::with_capacity(rows.len());

        // One autocommitted statement per row keeps failures row-local.
        for row in rows {
            let sql = upsert_sql(&qualified, row);
            let mut query = sqlx::query(&sql).bind(&row.id);
            for value in row.values.values() {
                query = match value {
                    ColumnValue::Text(v) => query.bind(v.clone()),
                    ColumnValue::Double(v) => query.bind(*v),
                    ColumnValue::BigInt(v) => query.bind(*v),
                    ColumnValue::Boolean(v) => query.bind(*v),
                    ColumnValue::Json(v) => query.bind(v.clone()),
                };
            }
            let outcome = query.execute(&self.pool).await.map(|_| ()).map_err(|err| {
                debug!(table, id = %row.id, error = %err, "row upsert rejected");
                StoreError::from(err)
            });
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let qualified = self.qualified(table)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {qualified}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl RunLog for PgStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (id, object_api_name, mode, status, started_at, finished_at,
                 success_count, error_count, error_detail, since, watermark, checkpoint_offset)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(&run.object_api_name)
        .bind(run.mode.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.success_count as i64)
        .bind(run.error_count as i64)
        .bind(detail_json(run)?)
        .bind(run.since)
        .bind(run.watermark)
        .bind(run.checkpoint_offset.map(|o| o as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = $2,
                   finished_at = $3,
                   success_count = $4,
                   error_count = $5,
                   error_detail = $6,
                   watermark = $7,
                   checkpoint_offset = $8
             WHERE id = $1
               AND status = 'RUNNING'
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(run.success_count as i64)
        .bind(run.error_count as i64)
        .bind(detail_json(run)?)
        .bind(run.watermark)
        .bind(run.checkpoint_offset.map(|o| o as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, object: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM sync_runs
             WHERE ($1::text IS NULL OR object_api_name = $1)
             ORDER BY started_at DESC
             LIMIT $2
            "#
        ))
        .bind(object)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn latest_run(&self, object: &str, modes: &[SyncMode]) -> Result<Option<SyncRun>, StoreError> {
        let modes = modes.iter().map(|m| m.as_str().to_string()).collect::<Vec<_>>();
        let row = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM sync_runs
             WHERE object_api_name = $1
               AND mode = ANY($2)
             ORDER BY started_at DESC
             LIMIT 1
            "#
        ))
        .bind(object)
        .bind(&modes)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn last_watermark(&self, object: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let watermark: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            r#"
            SELECT watermark
              FROM sync_runs
             WHERE object_api_name = $1
               AND mode IN ('full', 'incremental')
               AND status = 'SUCCEEDED'
               AND checkpoint_offset IS NULL
             ORDER BY started_at DESC
             LIMIT 1
            "#,
        )
        .bind(object)
        .fetch_optional(&self.pool)
        .await?;
        Ok(watermark.flatten())
    }

    async fn active_run(
        &self,
        object: &str,
        started_after: DateTime<Utc>,
    ) -> Result<Option<SyncRun>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM sync_runs
             WHERE object_api_name = $1
               AND status = 'RUNNING'
               AND started_at > $2
             ORDER BY started_at DESC
             LIMIT 1
            "#
        ))
        .bind(object)
        .bind(started_after)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }
}
