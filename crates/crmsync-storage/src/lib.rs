//! Local warehouse storage (table store + sync run log) and CRM HTTP transport utilities.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod table;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, JsonResponse, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use table::{
    columns_for, is_valid_identifier, storage_type_for, validate_identifier, ColumnRole,
    ColumnSpec, ColumnValue, Row, RowOutcome, RunLog, StorageType, StoreError, TableStore,
};

pub const CRATE_NAME: &str = "crmsync-storage";
