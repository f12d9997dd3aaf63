//! Table-oriented storage contracts consumed by the sync engine.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmsync_core::{FieldDefinition, FieldType, SyncMode, SyncRun};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Postgres caps identifiers at 63 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("table `{0}` does not exist")]
    MissingTable(String),
    #[error("column `{column}` does not exist on `{table}`")]
    UnknownColumn { table: String, column: String },
    #[error("null value in column `{column}` of `{table}` violates not-null constraint")]
    NotNull { table: String, column: String },
    #[error("column `{column}` expects {expected}")]
    TypeMismatch { column: String, expected: &'static str },
    #[error("encoding error: {0}")]
    Encode(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    Text,
    Double,
    BigInt,
    Boolean,
    Json,
}

impl StorageType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Double => "DOUBLE PRECISION",
            Self::BigInt => "BIGINT",
            Self::Boolean => "BOOLEAN",
            Self::Json => "JSONB",
        }
    }
}

/// Storage type for a scalar CRM field type. Relation fields use [`columns_for`].
pub fn storage_type_for(field_type: FieldType) -> StorageType {
    match field_type {
        FieldType::Text
        | FieldType::LongText
        | FieldType::SingleSelect
        | FieldType::Url
        | FieldType::Email
        | FieldType::Phone
        | FieldType::LockRule
        | FieldType::Lookup => StorageType::Text,
        FieldType::Number | FieldType::Currency | FieldType::Percent => StorageType::Double,
        FieldType::Date | FieldType::DateTime => StorageType::BigInt,
        FieldType::Boolean => StorageType::Boolean,
        FieldType::MultiSelect | FieldType::Unknown => StorageType::Json,
    }
}

/// Which part of a field's value a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Value,
    RelationDisplay,
    RelationIds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub storage_type: StorageType,
    pub field: String,
    pub role: ColumnRole,
}

/// Local columns materializing one CRM field.
pub fn columns_for(field: &FieldDefinition) -> Vec<ColumnSpec> {
    if field.is_relation {
        return vec![
            ColumnSpec {
                name: field.display_column(),
                storage_type: StorageType::Text,
                field: field.api_name.clone(),
                role: ColumnRole::RelationDisplay,
            },
            ColumnSpec {
                name: field.relation_ids_column(),
                storage_type: StorageType::Json,
                field: field.api_name.clone(),
                role: ColumnRole::RelationIds,
            },
        ];
    }
    vec![ColumnSpec {
        name: field.api_name.clone(),
        storage_type: storage_type_for(field.field_type),
        field: field.api_name.clone(),
        role: ColumnRole::Value,
    }]
}

pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// A typed cell value; nulls keep their column type so they can be bound.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(Option<String>),
    Double(Option<f64>),
    BigInt(Option<i64>),
    Boolean(Option<bool>),
    Json(Option<JsonValue>),
}

impl ColumnValue {
    pub fn null(storage_type: StorageType) -> Self {
        match storage_type {
            StorageType::Text => Self::Text(None),
            StorageType::Double => Self::Double(None),
            StorageType::BigInt => Self::BigInt(None),
            StorageType::Boolean => Self::Boolean(None),
            StorageType::Json => Self::Json(None),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            Self::Text(_) => StorageType::Text,
            Self::Double(_) => StorageType::Double,
            Self::BigInt(_) => StorageType::BigInt,
            Self::Boolean(_) => StorageType::Boolean,
            Self::Json(_) => StorageType::Json,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Text(v) => v.is_none(),
            Self::Double(v) => v.is_none(),
            Self::BigInt(v) => v.is_none(),
            Self::Boolean(v) => v.is_none(),
            Self::Json(v) => v.is_none(),
        }
    }
}

/// One row keyed by CRM id; `values` excludes the id column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: String,
    pub values: BTreeMap<String, ColumnValue>,
}

/// Outcome of one row in an upsert call, in input order.
pub type RowOutcome = Result<(), StoreError>;

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create the table with only its id column when missing. Returns true if created.
    async fn ensure_table(&self, table: &str) -> Result<bool, StoreError>;

    async fn list_columns(&self, table: &str) -> Result<BTreeSet<String>, StoreError>;

    async fn add_column(
        &self,
        table: &str,
        column: &str,
        storage_type: StorageType,
    ) -> Result<(), StoreError>;

    /// Insert-or-replace every row by id. Row failures are reported per row;
    /// the outer error is reserved for failures that affect the whole call.
    async fn upsert_rows(&self, table: &str, rows: &[Row]) -> Result<Vec<RowOutcome>, StoreError>;

    async fn row_count(&self, table: &str) -> Result<u64, StoreError>;
}

/// Append-only log of [`SyncRun`] records.
#[async_trait]
pub trait RunLog: Send + Sync {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Persist counts/status of a run that is still RUNNING in the log.
    /// Terminal rows are never rewritten.
    async fn update_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn recent_runs(&self, object: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StoreError>;

    async fn latest_run(&self, object: &str, modes: &[SyncMode]) -> Result<Option<SyncRun>, StoreError>;

    /// Watermark of the latest SUCCEEDED full/incremental run that covered its window.
    async fn last_watermark(&self, object: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// A RUNNING run for `object` started after `started_after`, if any.
    async fn active_run(
        &self,
        object: &str,
        started_after: DateTime<Utc>,
    ) -> Result<Option<SyncRun>, StoreError>;
}
