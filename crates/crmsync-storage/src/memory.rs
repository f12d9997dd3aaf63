//! In-process store implementing the same contracts as [`crate::PgStore`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmsync_core::{RunStatus, SyncMode, SyncRun, ID_COLUMN};
use tokio::sync::Mutex;

use crate::table::{
    validate_identifier, ColumnValue, Row, RowOutcome, RunLog, StorageType, StoreError, TableStore,
};

#[derive(Debug, Default)]
struct MemoryTable {
    columns: BTreeMap<String, StorageType>,
    not_null: BTreeSet<String>,
    rows: BTreeMap<String, BTreeMap<String, ColumnValue>>,
}

impl MemoryTable {
    fn check_row(&self, table: &str, row: &Row) -> RowOutcome {
        for (column, value) in &row.values {
            let Some(expected) = self.columns.get(column) else {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: column.clone(),
                });
            };
            if *expected != value.storage_type() {
                return Err(StoreError::TypeMismatch {
                    column: column.clone(),
                    expected: expected.sql_type(),
                });
            }
        }

        let existing = self.rows.get(&row.id);
        for column in &self.not_null {
            let value = row
                .values
                .get(column)
                .or_else(|| existing.and_then(|r| r.get(column)));
            if value.map_or(true, ColumnValue::is_null) {
                return Err(StoreError::NotNull {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    runs: Mutex<Vec<SyncRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a NOT NULL constraint to an existing column.
    pub async fn set_not_null(&self, table: &str, column: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        if !t.columns.contains_key(column) {
            return Err(StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        t.not_null.insert(column.to_string());
        Ok(())
    }

    pub async fn row(&self, table: &str, id: &str) -> Option<BTreeMap<String, ColumnValue>> {
        let tables = self.tables.lock().await;
        tables.get(table).and_then(|t| t.rows.get(id).cloned())
    }

    pub async fn all_runs(&self) -> Vec<SyncRun> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn ensure_table(&self, table: &str) -> Result<bool, StoreError> {
        validate_identifier(table)?;
        let mut tables = self.tables.lock().await;
        if tables.contains_key(table) {
            return Ok(false);
        }
        let mut t = MemoryTable::default();
        t.columns.insert(ID_COLUMN.to_string(), StorageType::Text);
        tables.insert(table.to_string(), t);
        Ok(true)
    }

    async fn list_columns(&self, table: &str) -> Result<BTreeSet<String>, StoreError> {
        let tables = self.tables.lock().await;
        let t = tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        Ok(t.columns.keys().cloned().collect())
    }

    async fn add_column(
        &self,
        table: &str,
        column: &str,
        storage_type: StorageType,
    ) -> Result<(), StoreError> {
        validate_identifier(column)?;
        let mut tables = self.tables.lock().await;
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        t.columns.entry(column.to_string()).or_insert(storage_type);
        Ok(())
    }

    async fn upsert_rows(&self, table: &str, rows: &[Row]) -> Result<Vec<RowOutcome>, StoreError> {
        let mut tables = self.tables.lock().await;
        let t = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let outcome = t.check_row(table, row);
            if outcome.is_ok() {
                let stored = t.rows.entry(row.id.clone()).or_default();
                stored.insert(ID_COLUMN.to_string(), ColumnValue::Text(Some(row.id.clone())));
                for (column, value) in &row.values {
                    stored.insert(column.clone(), value.clone());
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        let t = tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        Ok(t.rows.len() as u64)
    }
}

#[async_trait]
impl RunLog for MemoryStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        if runs.iter().any(|r| r.id == run.id) {
            return Err(StoreError::Database(format!("duplicate run id {}", run.id)));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let stored = runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| StoreError::Database(format!("unknown run id {}", run.id)))?;
        if stored.status == RunStatus::Running {
            *stored = run.clone();
        }
        Ok(())
    }

    async fn recent_runs(&self, object: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .rev()
            .filter(|r| object.map_or(true, |o| r.object_api_name == o))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_run(&self, object: &str, modes: &[SyncMode]) -> Result<Option<SyncRun>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .rev()
            .find(|r| r.object_api_name == object && modes.contains(&r.mode))
            .cloned())
    }

    async fn last_watermark(&self, object: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .rev()
            .filter(|r| r.object_api_name == object && r.mode.advances_watermark())
            .find(|r| r.status == RunStatus::Succeeded && r.checkpoint_offset.is_none())
            .and_then(|r| r.watermark))
    }

    async fn active_run(
        &self,
        object: &str,
        started_after: DateTime<Utc>,
    ) -> Result<Option<SyncRun>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .rev()
            .find(|r| {
                r.object_api_name == object
                    && r.status == RunStatus::Running
                    && r.started_at > started_after
            })
            .cloned())
    }
}
