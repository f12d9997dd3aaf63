//! Single-page CRM queries with bounded page size and transient-error retry.

use std::future::Future;
use std::sync::Arc;

use crmsync_adapters::{CrmError, CrmSource, QueryFilter, QuerySpec};
use crmsync_core::{FieldDefinition, RawRecord, SyncError};
use crmsync_storage::{BackoffPolicy, RetryDisposition};
use tracing::{info_span, warn, Instrument};

use crate::config::MAX_PAGE_SIZE;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub has_more: bool,
    pub total: Option<u64>,
}

pub fn clamp_limit(limit: u64) -> u64 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

/// Prefer the CRM's total; without one, a full page means there may be more.
pub fn has_more(offset: u64, limit: u64, returned: u64, total: Option<u64>) -> bool {
    match total {
        Some(total) => returned > 0 && offset + returned < total,
        None => returned == limit,
    }
}

pub struct PageFetcher {
    source: Arc<dyn CrmSource>,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(source: Arc<dyn CrmSource>, backoff: BackoffPolicy) -> Self {
        Self { source, backoff }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CrmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CrmError>>,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(what, attempt = attempt + 1, ?delay, error = %err, "retrying crm call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn fetch_page(
        &self,
        object_api_name: &str,
        filters: &[QueryFilter],
        offset: u64,
        limit: u64,
    ) -> Result<Page, SyncError> {
        let spec = QuerySpec {
            filters: filters.to_vec(),
            offset,
            limit: clamp_limit(limit),
        };
        let result = self
            .with_retry("query", || self.source.query_records(object_api_name, &spec))
            .instrument(info_span!("crm_page", object = object_api_name, offset, limit = spec.limit))
            .await
            .map_err(|err| match err {
                CrmError::Credential(msg) => SyncError::Credential(msg),
                other => SyncError::PageFetchFailed {
                    offset,
                    cause: other.to_string(),
                },
            })?;

        let returned = result.records.len() as u64;
        Ok(Page {
            has_more: has_more(offset, spec.limit, returned, result.total),
            total: result.total,
            records: result.records,
        })
    }

    pub async fn fetch_fields(&self, object_api_name: &str) -> Result<Vec<FieldDefinition>, SyncError> {
        self.with_retry("describe", || self.source.list_fields(object_api_name))
            .await
            .map_err(|err| match err {
                CrmError::Credential(msg) => SyncError::Credential(msg),
                other => SyncError::SchemaFetchFailed {
                    object: object_api_name.to_string(),
                    cause: other.to_string(),
                },
            })
    }
}
