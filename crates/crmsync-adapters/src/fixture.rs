//! Fixture-first CRM adapter: serves objects from JSON datasets with
//! optional failure injection per page.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use crmsync_core::{FieldDefinition, FieldType, RawRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{CrmError, CrmSource, FilterOperator, QueryFilter, QueryResult, QuerySpec};

/// Field entry in the same shape as the describe payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureField {
    pub api_name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub is_required: bool,
}

/// One object's schema and records as captured from the CRM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureDataset {
    pub object_api_name: String,
    #[serde(default)]
    pub captured_from: Option<String>,
    pub fields: Vec<FixtureField>,
    pub records: Vec<RawRecord>,
    #[serde(default = "default_report_total")]
    pub report_total: bool,
}

fn default_report_total() -> bool {
    true
}

impl FixtureDataset {
    pub fn field_definitions(&self) -> Vec<FieldDefinition> {
        self.fields
            .iter()
            .map(|f| {
                let mut def = FieldDefinition::new(
                    f.api_name.clone(),
                    f.label.clone().unwrap_or_else(|| f.api_name.clone()),
                    FieldType::parse(&f.field_type),
                );
                def.is_required = f.is_required;
                def
            })
            .collect()
    }
}

pub fn load_fixture_dataset(path: impl AsRef<Path>) -> Result<FixtureDataset> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Rejected,
    Credential,
}

impl FailureKind {
    fn to_error(self, what: &str) -> CrmError {
        match self {
            Self::Transient => CrmError::Transient(format!("injected timeout on {what}")),
            Self::Rejected => CrmError::Rejected(format!("injected rejection on {what}")),
            Self::Credential => CrmError::Credential(format!("injected token rejection on {what}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    kind: FailureKind,
    remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogEntry {
    pub object_api_name: String,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Default)]
struct FixtureState {
    objects: HashMap<String, FixtureDataset>,
    page_failures: HashMap<(String, u64), FailurePlan>,
    field_failures: HashMap<String, FailurePlan>,
    query_log: Vec<QueryLogEntry>,
}

#[derive(Debug, Default)]
pub struct FixtureCrmSource {
    state: Mutex<FixtureState>,
}

impl FixtureCrmSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` dataset in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut source = Self::new();
        for path in paths {
            source = source.with_dataset(load_fixture_dataset(&path)?);
        }
        Ok(source)
    }

    pub fn with_dataset(mut self, dataset: FixtureDataset) -> Self {
        self.state
            .get_mut()
            .objects
            .insert(dataset.object_api_name.clone(), dataset);
        self
    }

    /// Fail the page at `offset` of `object` the next `times` attempts.
    pub fn with_page_failure(mut self, object: &str, offset: u64, kind: FailureKind, times: usize) -> Self {
        self.state.get_mut().page_failures.insert(
            (object.to_string(), offset),
            FailurePlan {
                kind,
                remaining: times,
            },
        );
        self
    }

    pub fn with_field_failure(mut self, object: &str, kind: FailureKind, times: usize) -> Self {
        self.state.get_mut().field_failures.insert(
            object.to_string(),
            FailurePlan {
                kind,
                remaining: times,
            },
        );
        self
    }

    /// Replace an object's upstream schema, as an out-of-band CRM edit would.
    pub async fn set_fields(&self, object: &str, fields: Vec<FixtureField>) {
        let mut state = self.state.lock().await;
        if let Some(dataset) = state.objects.get_mut(object) {
            dataset.fields = fields;
        }
    }

    pub async fn upsert_record(&self, object: &str, record: RawRecord) {
        let mut state = self.state.lock().await;
        if let Some(dataset) = state.objects.get_mut(object) {
            let id = record.get("_id").cloned();
            match dataset.records.iter_mut().find(|r| id.is_some() && r.get("_id") == id.as_ref()) {
                Some(existing) => *existing = record,
                None => dataset.records.push(record),
            }
        }
    }

    pub async fn query_log(&self) -> Vec<QueryLogEntry> {
        self.state.lock().await.query_log.clone()
    }
}

fn take_failure(plan: Option<&mut FailurePlan>) -> Option<FailureKind> {
    let plan = plan?;
    if plan.remaining == 0 {
        return None;
    }
    plan.remaining -= 1;
    Some(plan.kind)
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn matches_filter(record: &RawRecord, filter: &QueryFilter) -> bool {
    let value = record.get(&filter.field).unwrap_or(&JsonValue::Null);
    match filter.operator {
        FilterOperator::Eq => filter.values.first() == Some(value),
        FilterOperator::In => filter.values.contains(value),
        FilterOperator::Gte | FilterOperator::Lte => {
            let (Some(lhs), Some(rhs)) = (as_number(value), filter.values.first().and_then(as_number))
            else {
                return false;
            };
            if filter.operator == FilterOperator::Gte {
                lhs >= rhs
            } else {
                lhs <= rhs
            }
        }
    }
}

#[async_trait]
impl CrmSource for FixtureCrmSource {
    async fn list_fields(&self, object_api_name: &str) -> Result<Vec<FieldDefinition>, CrmError> {
        let mut state = self.state.lock().await;
        if let Some(kind) = take_failure(state.field_failures.get_mut(object_api_name)) {
            return Err(kind.to_error("describe"));
        }
        state
            .objects
            .get(object_api_name)
            .map(FixtureDataset::field_definitions)
            .ok_or_else(|| CrmError::Rejected(format!("object {object_api_name} does not exist")))
    }

    async fn query_records(
        &self,
        object_api_name: &str,
        query: &QuerySpec,
    ) -> Result<QueryResult, CrmError> {
        let mut state = self.state.lock().await;
        state.query_log.push(QueryLogEntry {
            object_api_name: object_api_name.to_string(),
            offset: query.offset,
            limit: query.limit,
        });

        let key = (object_api_name.to_string(), query.offset);
        if let Some(kind) = take_failure(state.page_failures.get_mut(&key)) {
            return Err(kind.to_error(&format!("query offset {}", query.offset)));
        }

        let dataset = state
            .objects
            .get(object_api_name)
            .ok_or_else(|| CrmError::Rejected(format!("object {object_api_name} does not exist")))?;
        let matching = dataset
            .records
            .iter()
            .filter(|record| query.filters.iter().all(|f| matches_filter(record, f)))
            .collect::<Vec<_>>();
        let total = matching.len() as u64;
        let records = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();

        Ok(QueryResult {
            records,
            total: dataset.report_total.then_some(total),
        })
    }
}
