//! CRM source adapter contracts, access-token providers and adapter implementations.

use async_trait::async_trait;
use crmsync_core::{FieldDefinition, RawRecord};
use crmsync_storage::RetryDisposition;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod fixture;
pub mod http;

pub use fixture::{
    load_fixture_dataset, FailureKind, FixtureCrmSource, FixtureDataset, FixtureField, QueryLogEntry,
};
pub use http::HttpCrmSource;

pub const CRATE_NAME: &str = "crmsync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Gte,
    Lte,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub values: Vec<JsonValue>,
}

impl QueryFilter {
    pub fn gte(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Gte,
            values: vec![value.into()],
        }
    }
}

/// One window of a CRM query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub filters: Vec<QueryFilter>,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub records: Vec<RawRecord>,
    /// Total matching records, when the CRM reports it.
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrmError {
    #[error("transient crm failure: {0}")]
    Transient(String),
    #[error("crm rejected the request: {0}")]
    Rejected(String),
    #[error("crm credentials rejected: {0}")]
    Credential(String),
    #[error("unexpected crm response: {0}")]
    Decode(String),
}

impl CrmError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Supplies a valid bearer token; acquisition and refresh live elsewhere.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, CrmError>;
}

#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, CrmError> {
        if self.token.trim().is_empty() {
            return Err(CrmError::Credential("no access token configured".to_string()));
        }
        Ok(self.token.clone())
    }
}

#[async_trait]
pub trait CrmSource: Send + Sync {
    async fn list_fields(&self, object_api_name: &str) -> Result<Vec<FieldDefinition>, CrmError>;

    async fn query_records(
        &self,
        object_api_name: &str,
        query: &QuerySpec,
    ) -> Result<QueryResult, CrmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blank_static_token_is_a_credential_error() {
        let provider = StaticTokenProvider::new("  ");
        assert!(matches!(
            provider.access_token().await,
            Err(CrmError::Credential(_))
        ));
        let provider = StaticTokenProvider::new("tok");
        assert_eq!(provider.access_token().await.unwrap(), "tok");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert_eq!(
            CrmError::Transient("503".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            CrmError::Credential("401".into()).disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            CrmError::Rejected("bad filter".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }
}
