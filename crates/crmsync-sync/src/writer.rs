//! Idempotent, per-row upserts of normalized records keyed by CRM id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crmsync_core::{FieldDefinition, FieldValue, Record, ID_COLUMN};
use crmsync_storage::{columns_for, ColumnRole, ColumnSpec, ColumnValue, Row, StorageType, StoreError, TableStore};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// How a record's fields map onto the columns that exist locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
}

impl RowLayout {
    /// Columns not present in `existing` are left out.
    pub fn new(table: impl Into<String>, fields: &[FieldDefinition], existing: &BTreeSet<String>) -> Self {
        let mut seen = BTreeSet::new();
        let columns = fields
            .iter()
            .flat_map(columns_for)
            .filter(|c| c.name != ID_COLUMN && existing.contains(&c.name))
            .filter(|c| seen.insert(c.name.clone()))
            .collect();
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn to_row(&self, record: &Record) -> Result<Row, String> {
        let mut values = BTreeMap::new();
        for column in &self.columns {
            let value = record.field(&column.field).unwrap_or(&FieldValue::Null);
            values.insert(column.name.clone(), cell(column, value)?);
        }
        Ok(Row {
            id: record.id.clone(),
            values,
        })
    }
}

fn cell(column: &ColumnSpec, value: &FieldValue) -> Result<ColumnValue, String> {
    let mismatch = || format!("column `{}` cannot hold {value:?}", column.name);
    match (column.role, value) {
        (ColumnRole::RelationDisplay, FieldValue::Relation(rel)) => {
            Ok(ColumnValue::Text(rel.display_text.clone()))
        }
        (ColumnRole::RelationIds, FieldValue::Relation(rel)) => Ok(ColumnValue::Json(Some(
            JsonValue::from(rel.related_ids.clone()),
        ))),
        (ColumnRole::RelationDisplay, FieldValue::Null) => Ok(ColumnValue::Text(None)),
        (ColumnRole::RelationIds, FieldValue::Null) => Ok(ColumnValue::Json(Some(JsonValue::Array(Vec::new())))),
        (ColumnRole::RelationDisplay | ColumnRole::RelationIds, _) => Err(mismatch()),
        (ColumnRole::Value, FieldValue::Null) => Ok(ColumnValue::null(column.storage_type)),
        (ColumnRole::Value, value) => scalar_cell(column.storage_type, value).ok_or_else(mismatch),
    }
}

fn scalar_cell(storage_type: StorageType, value: &FieldValue) -> Option<ColumnValue> {
    let cell = match (storage_type, value) {
        (StorageType::Text, FieldValue::Text(s)) => ColumnValue::Text(Some(s.clone())),
        (StorageType::Text, FieldValue::Number(n)) => ColumnValue::Text(Some(n.to_string())),
        (StorageType::Text, FieldValue::Boolean(b)) => ColumnValue::Text(Some(b.to_string())),
        (StorageType::Text, FieldValue::Timestamp(ms)) => ColumnValue::Text(Some(ms.to_string())),
        (StorageType::Double, FieldValue::Number(n)) => ColumnValue::Double(Some(*n)),
        (StorageType::BigInt, FieldValue::Timestamp(ms)) => ColumnValue::BigInt(Some(*ms)),
        (StorageType::BigInt, FieldValue::Number(n)) if n.fract() == 0.0 => {
            ColumnValue::BigInt(Some(*n as i64))
        }
        (StorageType::Boolean, FieldValue::Boolean(b)) => ColumnValue::Boolean(Some(*b)),
        (StorageType::Json, FieldValue::List(items)) => {
            ColumnValue::Json(Some(JsonValue::from(items.clone())))
        }
        (StorageType::Json, FieldValue::Json(v)) => ColumnValue::Json(Some(v.clone())),
        (StorageType::Json, FieldValue::Text(s)) => ColumnValue::Json(Some(JsonValue::from(s.clone()))),
        (StorageType::Json, FieldValue::Number(n)) => ColumnValue::Json(Some(JsonValue::from(*n))),
        (StorageType::Json, FieldValue::Boolean(b)) => ColumnValue::Json(Some(JsonValue::from(*b))),
        _ => return None,
    };
    Some(cell)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub written: u64,
    pub failed: Vec<WriteFailure>,
}

pub struct UpsertWriter {
    tables: Arc<dyn TableStore>,
}

impl UpsertWriter {
    pub fn new(tables: Arc<dyn TableStore>) -> Self {
        Self { tables }
    }

    /// Write each record independently; one bad row never blocks the rest.
    /// The error is reserved for failures of the whole store call.
    pub async fn upsert_batch(&self, layout: &RowLayout, records: &[Record]) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            match layout.to_row(record) {
                Ok(row) => rows.push(row),
                Err(error) => outcome.failed.push(WriteFailure {
                    id: record.id.clone(),
                    error,
                }),
            }
        }
        if rows.is_empty() {
            return Ok(outcome);
        }

        let results = self.tables.upsert_rows(&layout.table, &rows).await?;
        for (row, result) in rows.iter().zip(results) {
            match result {
                Ok(()) => outcome.written += 1,
                Err(err) => outcome.failed.push(WriteFailure {
                    id: row.id.clone(),
                    error: err.to_string(),
                }),
            }
        }
        Ok(outcome)
    }
}
