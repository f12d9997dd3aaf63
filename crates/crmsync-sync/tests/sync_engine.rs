use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crmsync_adapters::{
    load_fixture_dataset, CrmError, CrmSource, FailureKind, FixtureCrmSource, FixtureField,
    QueryResult, QuerySpec,
};
use crmsync_core::{
    ErrorDetail, FieldDefinition, ObjectDescriptor, RunStatus, SyncError, SyncMode, SyncRun,
};
use crmsync_storage::{BackoffPolicy, ColumnValue, MemoryStore, RunLog, TableStore};
use crmsync_sync::{ObjectRegistry, RecordNormalizer, SyncConfig, SyncEngine, STATUS_DETAIL_MAX_CHARS};
use serde_json::json;
use tokio::sync::Notify;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/crm")
}

fn test_config() -> SyncConfig {
    SyncConfig {
        page_size: 10,
        batch_size: 10,
        inter_object_delay: Duration::ZERO,
        backoff: BackoffPolicy::immediate(3),
        ..SyncConfig::default()
    }
}

fn registry() -> ObjectRegistry {
    let mut opportunity = ObjectDescriptor::new("opportunity", "Opportunities", true);
    opportunity.table = Some("crm_opportunity".into());
    let mut contract = ObjectDescriptor::new("contract__c", "Contracts", false);
    contract.enabled = false;
    ObjectRegistry::new(vec![
        ObjectDescriptor::new("supplier__c", "Suppliers", false),
        ObjectDescriptor::new("site_record__c", "Site Records", false),
        opportunity,
        contract,
    ])
    .unwrap()
}

fn fixture_source() -> FixtureCrmSource {
    FixtureCrmSource::from_dir(fixtures_dir()).unwrap()
}

struct Harness {
    engine: Arc<SyncEngine>,
    store: Arc<MemoryStore>,
    source: Arc<FixtureCrmSource>,
}

fn harness_with(source: FixtureCrmSource, config: SyncConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(source);
    let engine = Arc::new(SyncEngine::new(
        config,
        registry(),
        source.clone(),
        store.clone(),
        store.clone(),
    ));
    Harness {
        engine,
        store,
        source,
    }
}

fn harness() -> Harness {
    harness_with(fixture_source(), test_config())
}

#[tokio::test]
async fn failed_middle_page_yields_partial_run_with_expected_counts() {
    let h = harness_with(
        fixture_source().with_page_failure("supplier__c", 10, FailureKind::Transient, 10),
        test_config(),
    );

    let run = h.engine.run_full("supplier__c").await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.success_count, 15);
    assert_eq!(run.error_count, 10);
    let detail = run.error_detail.clone().unwrap();
    assert_eq!(detail.kind, "page_fetch_failed");
    assert_eq!(detail.offset, Some(10));

    let persisted = h.store.all_runs().await;
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0], run);

    let offsets = h
        .source
        .query_log()
        .await
        .iter()
        .map(|q| q.offset)
        .collect::<Vec<_>>();
    assert_eq!(offsets, vec![0, 10, 10, 10, 10, 20]);
    assert_eq!(h.store.row_count("supplier__c").await.unwrap(), 15);
}

#[tokio::test]
async fn full_run_fetches_ceil_n_over_p_pages() {
    let h = harness();
    let run = h.engine.run_full("supplier__c").await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.success_count + run.error_count, 25);
    assert_eq!(h.source.query_log().await.len(), 3);
    assert_eq!(h.store.row_count("supplier__c").await.unwrap(), 25);
    assert!(run.error_detail.is_none());
}

#[tokio::test]
async fn missing_total_costs_one_extra_fetch_on_exact_final_page() {
    let mut dataset = load_fixture_dataset(fixtures_dir().join("supplier__c.json")).unwrap();
    dataset.records.truncate(20);
    dataset.report_total = false;
    let h = harness_with(FixtureCrmSource::new().with_dataset(dataset), test_config());

    let run = h.engine.run_full("supplier__c").await.unwrap();
    assert_eq!(run.success_count, 20);
    let offsets = h
        .source
        .query_log()
        .await
        .iter()
        .map(|q| q.offset)
        .collect::<Vec<_>>();
    assert_eq!(offsets, vec![0, 10, 20]);
}

#[tokio::test]
async fn active_run_row_refuses_new_run_without_second_row() {
    let h = harness();
    let active = SyncRun::begin("supplier__c", SyncMode::Full, None);
    h.store.insert_run(&active).await.unwrap();

    let err = h.engine.run_full("supplier__c").await.unwrap_err();
    assert!(matches!(err, SyncError::SyncAlreadyInProgress(_)));
    assert_eq!(h.store.all_runs().await.len(), 1);
    assert!(h.source.query_log().await.is_empty());
}

#[tokio::test]
async fn stale_running_row_does_not_block() {
    let h = harness();
    let mut abandoned = SyncRun::begin("supplier__c", SyncMode::Full, None);
    abandoned.started_at = Utc::now() - chrono::Duration::hours(1);
    h.store.insert_run(&abandoned).await.unwrap();

    let run = h.engine.run_full("supplier__c").await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let views = h.engine.status(10).await.unwrap();
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].run_id, run.id);
    assert!(!views[0].stale);
    assert!(views[1].stale);
}

/// Holds the first schema fetch until released.
struct GatedSource {
    inner: FixtureCrmSource,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl CrmSource for GatedSource {
    async fn list_fields(&self, object_api_name: &str) -> Result<Vec<FieldDefinition>, CrmError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.list_fields(object_api_name).await
    }

    async fn query_records(
        &self,
        object_api_name: &str,
        query: &QuerySpec,
    ) -> Result<QueryResult, CrmError> {
        self.inner.query_records(object_api_name, query).await
    }
}

#[tokio::test]
async fn concurrent_run_for_same_object_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(GatedSource {
        inner: fixture_source(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let engine = Arc::new(SyncEngine::new(
        test_config(),
        registry(),
        source.clone(),
        store.clone(),
        store.clone(),
    ));

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_full("supplier__c").await }
    });
    source.entered.notified().await;

    let err = engine.run_incremental("supplier__c", None).await.unwrap_err();
    assert!(matches!(err, SyncError::SyncAlreadyInProgress(_)));
    assert_eq!(store.all_runs().await.len(), 1);

    source.release.notify_one();
    let run = first.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(store.all_runs().await.len(), 1);
}

#[tokio::test]
async fn malformed_lookup_fails_only_its_record() {
    let h = harness();
    let run = h.engine.run_full("site_record__c").await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.success_count, 5);
    assert_eq!(run.error_count, 1);

    let detail = run.error_detail.unwrap();
    assert_eq!(detail.failures.len(), 1);
    assert_eq!(detail.failures[0].id.as_deref(), Some("site-5"));
    assert_eq!(detail.failures[0].field.as_deref(), Some("supplier"));
    assert!(h.store.row("site_record__c", "site-5").await.is_none());
    assert!(h.store.row("site_record__c", "site-6").await.is_some());
}

#[tokio::test]
async fn relations_round_trip_through_materialized_columns() {
    let h = harness();
    h.engine.run_full("site_record__c").await.unwrap();

    let row = h.store.row("site_record__c", "site-1").await.unwrap();
    assert_eq!(
        row["contacts__r"],
        ColumnValue::Text(Some("Ana Smit, Bo Jansen".into()))
    );
    assert_eq!(row["contacts__relation_ids"], ColumnValue::Json(Some(json!(["c-1", "c-2"]))));
    assert_eq!(row["supplier__r"], ColumnValue::Text(Some("Supplier 01".into())));
    assert!(!row.contains_key("supplier"));

    let fields = h.source.list_fields("site_record__c").await.unwrap();
    let normalizer = RecordNormalizer::new("site_record__c", fields);
    let original = normalizer
        .normalize(&json!({"_id": "site-1", "contacts": ["c-1", "c-2", "c-1"], "contacts__r": "Ana Smit, Bo Jansen"}).as_object().cloned().unwrap())
        .unwrap();
    let materialized = normalizer
        .normalize(&json!({"_id": "site-1", "contacts__r": "Ana Smit, Bo Jansen", "contacts__relation_ids": ["c-1", "c-2"]}).as_object().cloned().unwrap())
        .unwrap();
    assert_eq!(
        serde_json::to_string(&original).unwrap(),
        serde_json::to_string(&materialized).unwrap()
    );

    let unset = h.store.row("site_record__c", "site-2").await.unwrap();
    assert_eq!(unset["contacts__r"], ColumnValue::Text(None));
    assert_eq!(unset["contacts__relation_ids"], ColumnValue::Json(Some(json!([]))));
}

#[tokio::test]
async fn upstream_schema_changes_only_grow_local_columns() {
    let h = harness();
    h.engine.run_full("opportunity").await.unwrap();
    let before = h.store.list_columns("crm_opportunity").await.unwrap();

    h.source
        .set_fields(
            "opportunity",
            vec![
                FixtureField {
                    api_name: "name".into(),
                    label: None,
                    field_type: "text".into(),
                    is_required: true,
                },
                FixtureField {
                    api_name: "probability".into(),
                    label: Some("Probability".into()),
                    field_type: "percent".into(),
                    is_required: false,
                },
            ],
        )
        .await;
    let migration = h.engine.reconcile("opportunity").await.unwrap();
    assert_eq!(migration.fields_added, vec!["probability"]);

    let after = h.store.list_columns("crm_opportunity").await.unwrap();
    assert!(after.is_superset(&before));
    assert!(after.contains("account_id__relation_ids"));

    let run = h.engine.run_full("opportunity").await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn repeated_full_runs_are_idempotent() {
    let h = harness();
    h.engine.run_full("supplier__c").await.unwrap();
    let first = h.store.row("supplier__c", "sup-007").await.unwrap();
    h.engine.run_full("supplier__c").await.unwrap();
    let second = h.store.row("supplier__c", "sup-007").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first["rating"], ColumnValue::Double(Some(4.5)));
    assert_eq!(h.store.row_count("supplier__c").await.unwrap(), 25);
}

#[tokio::test]
async fn incremental_run_filters_from_previous_watermark() {
    let h = harness();
    let first = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert!(first.since.is_none());
    assert_eq!(first.success_count, 25);

    let changed = json!({
        "_id": "sup-026",
        "name": "Supplier 26",
        "owner": "u-100",
        "last_modified_time": Utc::now().timestamp_millis() + 60_000
    });
    h.source
        .upsert_record("supplier__c", changed.as_object().cloned().unwrap())
        .await;

    let second = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert_eq!(second.since, first.watermark);
    assert_eq!(second.success_count, 1);
    assert_eq!(h.store.last_watermark("supplier__c").await.unwrap(), second.watermark);
}

#[tokio::test]
async fn page_runs_never_move_the_watermark() {
    let h = harness();
    let run = h.engine.run_page("supplier__c", 10, 5).await.unwrap();
    assert_eq!(run.mode, SyncMode::Page);
    assert_eq!(run.success_count, 5);
    assert!(run.watermark.is_none());
    assert!(h.store.last_watermark("supplier__c").await.unwrap().is_none());

    let log = h.source.query_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!((log[0].offset, log[0].limit), (10, 5));
}

#[tokio::test]
async fn spent_budget_checkpoints_and_next_run_resumes() {
    let config = SyncConfig {
        run_budget: Some(Duration::ZERO),
        ..test_config()
    };
    let h = harness_with(fixture_source(), config);

    let first = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(first.checkpoint_offset, Some(10));
    assert!(h.store.last_watermark("supplier__c").await.unwrap().is_none());

    let second = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert_eq!(second.checkpoint_offset, Some(20));
    assert_eq!(second.watermark, first.watermark);

    let third = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert!(third.checkpoint_offset.is_none());
    assert_eq!(third.success_count, 5);
    assert_eq!(h.store.row_count("supplier__c").await.unwrap(), 25);
    assert_eq!(
        h.store.last_watermark("supplier__c").await.unwrap(),
        first.watermark
    );
}

#[tokio::test]
async fn failed_page_in_checkpoint_chain_keeps_watermark_back() {
    let config = SyncConfig {
        run_budget: Some(Duration::ZERO),
        ..test_config()
    };
    // Four attempts: exactly one run's worth of retries.
    let h = harness_with(
        fixture_source().with_page_failure("supplier__c", 10, FailureKind::Transient, 4),
        config,
    );

    let first = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert_eq!(first.checkpoint_offset, Some(10));

    let second = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert_eq!(second.status, RunStatus::Failed);
    assert_eq!(second.error_count, 10);
    assert_eq!(second.checkpoint_offset, Some(20));
    assert_eq!(second.watermark, first.watermark);

    let third = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert_eq!(third.status, RunStatus::Succeeded);
    assert!(third.checkpoint_offset.is_none());
    assert!(third.watermark.is_none());
    assert!(h.store.last_watermark("supplier__c").await.unwrap().is_none());
    assert_eq!(h.store.row_count("supplier__c").await.unwrap(), 15);

    // The next chain starts from the full window and picks up the skipped page.
    let mut next = h.engine.run_incremental("supplier__c", None).await.unwrap();
    assert!(next.since.is_none());
    while next.checkpoint_offset.is_some() {
        next = h.engine.run_incremental("supplier__c", None).await.unwrap();
    }
    assert_eq!(next.status, RunStatus::Succeeded);
    assert_eq!(h.store.row_count("supplier__c").await.unwrap(), 25);
    assert_eq!(
        h.store.last_watermark("supplier__c").await.unwrap(),
        next.watermark
    );
    assert!(next.watermark.is_some());
}

#[tokio::test]
async fn abort_policy_escalates_first_page_failure() {
    let config = SyncConfig {
        abort_on_first_page_failure: true,
        ..test_config()
    };
    let h = harness_with(
        fixture_source().with_page_failure("supplier__c", 10, FailureKind::Rejected, 1),
        config,
    );
    let run = h.engine.run_full("supplier__c").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.success_count, 10);
    assert_eq!(run.error_count, 10);
    assert_eq!(run.error_detail.unwrap().offset, Some(10));
}

#[tokio::test]
async fn credential_rejection_fails_the_run() {
    let h = harness_with(
        fixture_source().with_page_failure("supplier__c", 0, FailureKind::Credential, 1),
        test_config(),
    );
    let run = h.engine.run_full("supplier__c").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_detail.unwrap().kind, "credential");

    let h = harness_with(
        fixture_source().with_field_failure("supplier__c", FailureKind::Credential, 1),
        test_config(),
    );
    let run = h.engine.run_full("supplier__c").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(h.source.query_log().await.is_empty());
}

#[tokio::test]
async fn unknown_object_creates_no_run() {
    let h = harness();
    let err = h.engine.run_full("invoice__c").await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownObject(_)));
    assert!(h.store.all_runs().await.is_empty());
}

#[tokio::test]
async fn run_all_summarizes_enabled_objects() {
    let h = harness();
    let summary = h.engine.run_all_enabled().await;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.partial, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.total_changes, 25 + 5 + 4);

    let stats = h.engine.stats().await.unwrap();
    let contract = stats.iter().find(|s| s.object_api_name == "contract__c").unwrap();
    assert!(contract.row_count.is_none());
    let opportunity = stats.iter().find(|s| s.object_api_name == "opportunity").unwrap();
    assert_eq!(opportunity.table, "crm_opportunity");
    assert_eq!(opportunity.row_count, Some(4));
    assert_eq!(opportunity.last_status, Some(RunStatus::Succeeded));
    assert!(opportunity.watermark.is_some());
}

#[tokio::test]
async fn reconcile_all_continues_past_failures() {
    let h = harness_with(
        fixture_source().with_field_failure("site_record__c", FailureKind::Rejected, 1),
        test_config(),
    );
    let outcomes = h.engine.reconcile_all().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].result.is_some());
    assert!(outcomes[1].error.is_some());
    assert!(outcomes[2].result.as_ref().unwrap().table_created);
}

#[tokio::test]
async fn status_truncates_error_detail() {
    let h = harness();
    let mut run = SyncRun::begin("supplier__c", SyncMode::Full, None);
    h.store.insert_run(&run).await.unwrap();
    run.fail(ErrorDetail {
        kind: "storage".into(),
        message: "x".repeat(2_000),
        ..Default::default()
    });
    h.store.update_run(&run).await.unwrap();

    let views = h.engine.status(5).await.unwrap();
    let detail = views[0].error_detail.as_ref().unwrap();
    assert_eq!(detail.chars().count(), STATUS_DETAIL_MAX_CHARS);
    assert_eq!(views[0].status, RunStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_is_only_built_when_enabled() {
    let h = harness();
    assert!(h.engine.maybe_build_scheduler().await.unwrap().is_none());

    let config = SyncConfig {
        scheduler_enabled: true,
        ..test_config()
    };
    let h = harness_with(fixture_source(), config);
    assert!(h.engine.maybe_build_scheduler().await.unwrap().is_some());
}
