//! Core domain model, run bookkeeping and error taxonomy for crmsync.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "crmsync-core";

/// Suffix of the column holding a relation field's display text.
pub const DISPLAY_SUFFIX: &str = "__r";
/// Suffix of the column holding a relation field's related ids.
pub const RELATION_IDS_SUFFIX: &str = "__relation_ids";
/// Natural key column of every synced table.
pub const ID_COLUMN: &str = "id";

/// Raw CRM record exactly as returned by a query page.
pub type RawRecord = serde_json::Map<String, JsonValue>;

fn default_true() -> bool {
    true
}

fn default_modified_field() -> String {
    "last_modified_time".to_string()
}

/// A CRM object the engine is configured to mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub api_name: String,
    pub display_name: String,
    #[serde(default)]
    pub is_standard: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_modified_field")]
    pub modified_field: String,
}

impl ObjectDescriptor {
    pub fn new(api_name: impl Into<String>, display_name: impl Into<String>, is_standard: bool) -> Self {
        Self {
            api_name: api_name.into(),
            display_name: display_name.into(),
            is_standard,
            enabled: true,
            table: None,
            modified_field: default_modified_field(),
        }
    }

    /// Local table backing this object.
    pub fn table_name(&self) -> String {
        match &self.table {
            Some(table) => table.clone(),
            None => table_name_for(&self.api_name),
        }
    }
}

/// Derive a storage-safe table name from a CRM api name.
pub fn table_name_for(api_name: &str) -> String {
    let mut name = api_name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>();
    if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }
    name
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    LongText,
    Number,
    Currency,
    Percent,
    Date,
    DateTime,
    Boolean,
    SingleSelect,
    MultiSelect,
    Lookup,
    Url,
    Email,
    Phone,
    LockRule,
    Unknown,
}

impl FieldType {
    /// Map a CRM type label onto the engine's closed set of field types.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "text" | "string" | "auto_number" | "name" => Self::Text,
            "long_text" | "textarea" | "rich_text" | "html_rich_text" => Self::LongText,
            "number" | "integer" | "double" | "count" | "formula_number" => Self::Number,
            "currency" | "money" => Self::Currency,
            "percent" | "percentile" | "percentage" => Self::Percent,
            "date" => Self::Date,
            "date_time" | "datetime" | "timestamp" | "time" => Self::DateTime,
            "boolean" | "true_or_false" | "checkbox" => Self::Boolean,
            "select_one" | "single_select" | "picklist" | "record_type" => Self::SingleSelect,
            "select_many" | "multi_select" | "multipicklist" | "tag" => Self::MultiSelect,
            "object_reference" | "object_reference_many" | "lookup" | "master_detail"
            | "reference" | "employee" | "department" => Self::Lookup,
            "url" => Self::Url,
            "email" => Self::Email,
            "phone_number" | "phone" => Self::Phone,
            "lock_rule" => Self::LockRule,
            _ => Self::Unknown,
        }
    }

    pub fn is_relation(self) -> bool {
        matches!(self, Self::Lookup)
    }
}

/// A CRM field definition, fetched fresh on every schema check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub api_name: String,
    pub display_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_relation: bool,
}

impl FieldDefinition {
    pub fn new(api_name: impl Into<String>, display_name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            api_name: api_name.into(),
            display_name: display_name.into(),
            field_type,
            is_required: false,
            is_relation: field_type.is_relation(),
        }
    }

    pub fn display_column(&self) -> String {
        format!("{}{}", self.api_name, DISPLAY_SUFFIX)
    }

    pub fn relation_ids_column(&self) -> String {
        format!("{}{}", self.api_name, RELATION_IDS_SUFFIX)
    }
}

/// Lookup value: human-readable label plus the ordered ids it points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationValue {
    pub display_text: Option<String>,
    pub related_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    List(Vec<String>),
    Relation(RelationValue),
    Json(JsonValue),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A normalized CRM record, keyed by its CRM id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub object_api_name: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn field(&self, api_name: &str) -> Option<&FieldValue> {
        self.fields.get(api_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
    Page,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Page => "page",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            "page" => Some(Self::Page),
            _ => None,
        }
    }

    /// Whether runs in this mode may advance the incremental watermark.
    pub fn advances_watermark(self) -> bool {
        !matches!(self, Self::Page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "PARTIAL" => Some(Self::Partial),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Terminal status implied by a run's counts.
    ///
    /// FAILED requires both zero successes and a fatal error; record-level
    /// errors alone never fail a run.
    pub fn settle(success_count: u64, error_count: u64, fatal: bool) -> Self {
        if fatal && success_count == 0 {
            Self::Failed
        } else if error_count == 0 {
            Self::Succeeded
        } else {
            Self::Partial
        }
    }
}

/// One sampled record-level failure kept in a run's error detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl RecordFailure {
    /// Sample entry for a record-level error; `id` is used when the error carries none.
    pub fn new(id: Option<String>, err: &SyncError) -> Self {
        match err {
            SyncError::Normalization(e) => Self {
                id,
                field: Some(e.field.clone()),
                message: e.reason.clone(),
            },
            SyncError::Write { id: record_id, message } => Self {
                id: Some(record_id.clone()),
                field: None,
                message: message.clone(),
            },
            other => Self {
                id,
                field: None,
                message: other.to_string(),
            },
        }
    }
}

/// Structured error payload stored on a [`SyncRun`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RecordFailure>,
}

impl ErrorDetail {
    pub const MAX_SAMPLED_FAILURES: usize = 20;

    pub fn from_error(err: &SyncError) -> Self {
        let offset = match err {
            SyncError::PageFetchFailed { offset, .. } => Some(*offset),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            offset,
            failures: Vec::new(),
        }
    }

    pub fn push_failure(&mut self, failure: RecordFailure) {
        if self.failures.len() < Self::MAX_SAMPLED_FAILURES {
            self.failures.push(failure);
        }
    }

    /// Single-line rendering capped at `max_chars` characters.
    pub fn summary(&self, max_chars: usize) -> String {
        let mut text = format!("{}: {}", self.kind, self.message);
        if !self.failures.is_empty() {
            text.push_str(&format!(" ({} sampled record failures)", self.failures.len()));
        }
        truncate_chars(&text, max_chars)
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out = text.chars().take(max_chars.saturating_sub(3)).collect::<String>();
    out.push_str("...");
    out
}

/// Persisted summary of one sync invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub object_api_name: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub error_detail: Option<ErrorDetail>,
    /// Lower bound applied to the modified-time filter, if any.
    pub since: Option<DateTime<Utc>>,
    /// Instant a later incremental run may filter from once this run completes.
    pub watermark: Option<DateTime<Utc>>,
    /// Offset to resume from when the run stopped before covering its window.
    pub checkpoint_offset: Option<u64>,
}

impl SyncRun {
    pub fn begin(object_api_name: impl Into<String>, mode: SyncMode, since: Option<DateTime<Utc>>) -> Self {
        let started_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            object_api_name: object_api_name.into(),
            mode,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            success_count: 0,
            error_count: 0,
            error_detail: None,
            since,
            watermark: mode.advances_watermark().then_some(started_at),
            checkpoint_offset: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Settle the run from its counts. No-op once the run is terminal.
    pub fn complete(&mut self, fatal: bool, detail: Option<ErrorDetail>) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::settle(self.success_count, self.error_count, fatal);
        self.error_detail = detail;
        self.finished_at = Some(Utc::now());
    }

    /// Force the run into FAILED regardless of its counts. No-op once terminal.
    pub fn fail(&mut self, detail: ErrorDetail) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::Failed;
        self.error_detail = Some(detail);
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("normalization error on field `{field}`: {reason}")]
pub struct NormalizationError {
    pub field: String,
    pub reason: String,
}

impl NormalizationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("unknown object `{0}`")]
    UnknownObject(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("page fetch failed at offset {offset}: {cause}")]
    PageFetchFailed { offset: u64, cause: String },
    #[error("field definitions for `{object}` unavailable: {cause}")]
    SchemaFetchFailed { object: String, cause: String },
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error("write failed for record `{id}`: {message}")]
    Write { id: String, message: String },
    #[error("a sync run for `{0}` is already in progress")]
    SyncAlreadyInProgress(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownObject(_) => "unknown_object",
            Self::Credential(_) => "credential",
            Self::PageFetchFailed { .. } => "page_fetch_failed",
            Self::SchemaFetchFailed { .. } => "schema_fetch_failed",
            Self::Normalization(_) => "normalization",
            Self::Write { .. } => "write",
            Self::SyncAlreadyInProgress(_) => "sync_already_in_progress",
            Self::Storage(_) => "storage",
        }
    }

    /// Fatal errors are the ones that may turn a run with no successes into FAILED.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Credential(_)
                | Self::PageFetchFailed { .. }
                | Self::SchemaFetchFailed { .. }
                | Self::Storage(_)
        )
    }
}
