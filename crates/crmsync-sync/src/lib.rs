//! The synchronization engine: schema reconciliation, paged pulls,
//! normalization, idempotent upserts and run bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crmsync_adapters::{HttpCrmSource, StaticTokenProvider};
use crmsync_storage::{HttpClientConfig, HttpFetcher, TokenBucketConfig};

pub mod config;
pub mod engine;
pub mod fetch;
pub mod normalize;
pub mod schema;
pub mod writer;

pub use config::{ObjectRegistry, SyncConfig, MAX_PAGE_SIZE};
pub use engine::{
    ObjectRunSummary, ReconcileOutcome, RunAllSummary, RunStatusView, SyncEngine, TableStats,
    STATUS_DETAIL_MAX_CHARS,
};
pub use fetch::{Page, PageFetcher};
pub use normalize::RecordNormalizer;
pub use schema::{plan_migration, MigrationResult, SchemaReconciler, SkippedField};
pub use writer::{BatchOutcome, RowLayout, UpsertWriter, WriteFailure};

pub const CRATE_NAME: &str = "crmsync-sync";

/// HTTP CRM adapter configured from [`SyncConfig`], sharing one token bucket.
pub fn http_source(config: &SyncConfig) -> Result<Arc<HttpCrmSource>> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config.rate_limit_per_sec.map(TokenBucketConfig::per_second),
        ..Default::default()
    })?;
    let tokens = Arc::new(StaticTokenProvider::new(config.crm_access_token.clone()));
    Ok(Arc::new(HttpCrmSource::new(config.crm_base_url.clone(), http, tokens)))
}
