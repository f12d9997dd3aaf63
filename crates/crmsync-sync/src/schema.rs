//! Additive schema reconciliation between CRM field definitions and local tables.

use std::collections::BTreeSet;
use std::sync::Arc;

use crmsync_core::{FieldDefinition, ObjectDescriptor, SyncError, ID_COLUMN};
use crmsync_storage::{columns_for, is_valid_identifier, ColumnSpec, TableStore};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedField {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationResult {
    pub object_api_name: String,
    pub table: String,
    pub table_created: bool,
    pub fields_compared: usize,
    pub fields_added: Vec<String>,
    pub fields_skipped: Vec<SkippedField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub add: Vec<ColumnSpec>,
    pub skipped: Vec<SkippedField>,
}

/// Columns present upstream but absent locally. Never drops or renames.
pub fn plan_migration(fields: &[FieldDefinition], existing: &BTreeSet<String>) -> MigrationPlan {
    let mut plan = MigrationPlan::default();
    let mut claimed = BTreeSet::new();

    for field in fields {
        for column in columns_for(field) {
            let skip = if column.name == ID_COLUMN {
                Some("collides with the id column".to_string())
            } else if !is_valid_identifier(&column.name) {
                Some(format!("`{}` is not a valid column identifier", column.name))
            } else if !claimed.insert(column.name.clone()) {
                Some(format!("column `{}` is produced by more than one field", column.name))
            } else {
                None
            };

            match skip {
                Some(reason) => plan.skipped.push(SkippedField {
                    field: field.api_name.clone(),
                    reason,
                }),
                None if existing.contains(&column.name) => {}
                None => plan.add.push(column),
            }
        }
    }
    plan
}

pub struct SchemaReconciler {
    tables: Arc<dyn TableStore>,
}

impl SchemaReconciler {
    pub fn new(tables: Arc<dyn TableStore>) -> Self {
        Self { tables }
    }

    /// Bring the object's table up to the given field definitions.
    pub async fn apply(
        &self,
        object: &ObjectDescriptor,
        fields: &[FieldDefinition],
    ) -> Result<MigrationResult, SyncError> {
        let table = object.table_name();
        let storage = |err: crmsync_storage::StoreError| SyncError::Storage(err.to_string());

        let table_created = self.tables.ensure_table(&table).await.map_err(storage)?;
        let existing = self.tables.list_columns(&table).await.map_err(storage)?;
        let plan = plan_migration(fields, &existing);

        let mut result = MigrationResult {
            object_api_name: object.api_name.clone(),
            table: table.clone(),
            table_created,
            fields_compared: fields.len(),
            fields_added: Vec::new(),
            fields_skipped: plan.skipped,
        };
        for skipped in &result.fields_skipped {
            warn!(table = %table, field = %skipped.field, reason = %skipped.reason, "skipping field");
        }

        for column in plan.add {
            match self
                .tables
                .add_column(&table, &column.name, column.storage_type)
                .await
            {
                Ok(()) => result.fields_added.push(column.name),
                Err(err) => {
                    warn!(table = %table, column = %column.name, error = %err, "column addition failed");
                    result.fields_skipped.push(SkippedField {
                        field: column.field,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            table = %table,
            compared = result.fields_compared,
            added = result.fields_added.len(),
            skipped = result.fields_skipped.len(),
            "schema reconciled"
        );
        Ok(result)
    }
}
