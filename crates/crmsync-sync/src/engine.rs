//! Sync orchestration: one object, one run, pages in offset order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crmsync_adapters::{CrmSource, QueryFilter};
use crmsync_core::{
    ErrorDetail, FieldDefinition, ObjectDescriptor, RawRecord, RecordFailure, RunStatus, SyncError,
    SyncMode, SyncRun,
};
use crmsync_storage::{RunLog, StoreError, TableStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ObjectRegistry, SyncConfig};
use crate::fetch::{clamp_limit, PageFetcher};
use crate::normalize::{raw_id, RecordNormalizer};
use crate::schema::{MigrationResult, SchemaReconciler};
use crate::writer::{RowLayout, UpsertWriter};

/// Longest error text returned by status queries.
pub const STATUS_DETAIL_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ObjectRunSummary {
    pub object_api_name: String,
    pub run_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub success_count: u64,
    pub error_count: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunAllSummary {
    pub total: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub total_changes: u64,
    pub objects: Vec<ObjectRunSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub object_api_name: String,
    pub result: Option<MigrationResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub object_api_name: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub error_detail: Option<String>,
    pub checkpoint_offset: Option<u64>,
    /// RUNNING for longer than the stale threshold.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub object_api_name: String,
    pub table: String,
    pub row_count: Option<u64>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub watermark: Option<DateTime<Utc>>,
}

/// Where a run starts and what it inherits from a checkpointed predecessor.
#[derive(Debug, Clone, Copy)]
struct RunWindow {
    since: Option<DateTime<Utc>>,
    start_offset: u64,
    /// Set when continuing a checkpointed run: the watermark the chain may still claim.
    resumed: Option<Option<DateTime<Utc>>>,
    single_page_limit: Option<u64>,
}

/// Error bookkeeping for one run.
#[derive(Debug, Default)]
struct RunErrors {
    fatal: bool,
    forced: Option<ErrorDetail>,
    detail: Option<ErrorDetail>,
}

impl RunErrors {
    fn note_fatal(&mut self, err: &SyncError) {
        self.fatal |= err.is_fatal();
        let detail = self.detail.get_or_insert_with(|| ErrorDetail::from_error(err));
        if detail.kind == "record_errors" {
            let failures = std::mem::take(&mut detail.failures);
            *detail = ErrorDetail::from_error(err);
            detail.failures = failures;
        }
    }

    fn force(&mut self, err: &SyncError) {
        self.note_fatal(err);
        let mut detail = ErrorDetail::from_error(err);
        if let Some(existing) = &self.detail {
            detail.failures = existing.failures.clone();
        }
        self.forced = Some(detail);
    }

    fn record_failure(&mut self, failure: RecordFailure) {
        self.detail
            .get_or_insert_with(|| ErrorDetail {
                kind: "record_errors".to_string(),
                message: "one or more records failed".to_string(),
                ..Default::default()
            })
            .push_failure(failure);
    }
}

fn storage(err: StoreError) -> SyncError {
    SyncError::Storage(err.to_string())
}

/// Releases the in-process single-flight slot on drop.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    object: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.object);
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    registry: ObjectRegistry,
    tables: Arc<dyn TableStore>,
    runs: Arc<dyn RunLog>,
    fetcher: PageFetcher,
    reconciler: SchemaReconciler,
    writer: UpsertWriter,
    in_flight: Mutex<HashSet<String>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        registry: ObjectRegistry,
        source: Arc<dyn CrmSource>,
        tables: Arc<dyn TableStore>,
        runs: Arc<dyn RunLog>,
    ) -> Self {
        Self {
            fetcher: PageFetcher::new(source, config.backoff),
            reconciler: SchemaReconciler::new(tables.clone()),
            writer: UpsertWriter::new(tables.clone()),
            config,
            registry,
            tables,
            runs,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    fn object(&self, api_name: &str) -> Result<&ObjectDescriptor, SyncError> {
        self.registry
            .get(api_name)
            .ok_or_else(|| SyncError::UnknownObject(api_name.to_string()))
    }

    fn acquire(&self, api_name: &str) -> Result<FlightGuard<'_>, SyncError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(api_name.to_string()) {
            return Err(SyncError::SyncAlreadyInProgress(api_name.to_string()));
        }
        Ok(FlightGuard {
            in_flight: &self.in_flight,
            object: api_name.to_string(),
        })
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        let Ok(stale) = ChronoDuration::from_std(self.config.stale_run_after) else {
            return DateTime::<Utc>::MIN_UTC;
        };
        Utc::now()
            .checked_sub_signed(stale)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub async fn run_full(&self, api_name: &str) -> Result<SyncRun, SyncError> {
        self.run(api_name, SyncMode::Full, None, None).await
    }

    /// `since` overrides the stored watermark and any pending checkpoint.
    pub async fn run_incremental(
        &self,
        api_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncRun, SyncError> {
        self.run(api_name, SyncMode::Incremental, since, None).await
    }

    pub async fn run_page(&self, api_name: &str, offset: u64, limit: u64) -> Result<SyncRun, SyncError> {
        self.run(api_name, SyncMode::Page, None, Some((offset, limit))).await
    }

    async fn run(
        &self,
        api_name: &str,
        mode: SyncMode,
        since_override: Option<DateTime<Utc>>,
        page: Option<(u64, u64)>,
    ) -> Result<SyncRun, SyncError> {
        let object = self.object(api_name)?.clone();
        let _guard = self.acquire(api_name)?;
        if let Some(active) = self
            .runs
            .active_run(api_name, self.stale_cutoff())
            .await
            .map_err(storage)?
        {
            warn!(object = api_name, run_id = %active.id, "refusing sync; a run is already active");
            return Err(SyncError::SyncAlreadyInProgress(api_name.to_string()));
        }

        let window = self.plan_window(&object, mode, since_override, page).await?;
        let mut run = SyncRun::begin(object.api_name.clone(), mode, window.since);
        if let Some(watermark) = window.resumed {
            run.watermark = watermark;
        }
        self.runs.insert_run(&run).await.map_err(storage)?;

        let span = info_span!("sync_run", run_id = %run.id, object = api_name, mode = mode.as_str());
        let errors = self.drive(&object, &mut run, window).instrument(span.clone()).await;

        match errors.forced {
            Some(detail) => run.fail(detail),
            None => {
                let detail = errors.detail.filter(|_| errors.fatal || run.error_count > 0);
                run.complete(errors.fatal, detail);
            }
        }
        self.runs.update_run(&run).await.map_err(storage)?;

        span.in_scope(|| {
            info!(
                status = run.status.as_str(),
                success = run.success_count,
                errors = run.error_count,
                checkpoint = ?run.checkpoint_offset,
                "sync run finished"
            )
        });
        Ok(run)
    }

    async fn plan_window(
        &self,
        object: &ObjectDescriptor,
        mode: SyncMode,
        since_override: Option<DateTime<Utc>>,
        page: Option<(u64, u64)>,
    ) -> Result<RunWindow, SyncError> {
        let mut window = RunWindow {
            since: None,
            start_offset: 0,
            resumed: None,
            single_page_limit: None,
        };
        if let Some((offset, limit)) = page {
            window.start_offset = offset;
            window.single_page_limit = Some(limit);
            return Ok(window);
        }
        if mode == SyncMode::Incremental && since_override.is_some() {
            window.since = since_override;
            return Ok(window);
        }

        let latest = self
            .runs
            .latest_run(&object.api_name, &[mode])
            .await
            .map_err(storage)?;
        if let Some(previous) = latest.filter(|r| r.is_terminal()) {
            if let Some(offset) = previous.checkpoint_offset {
                info!(object = %object.api_name, offset, "resuming from checkpoint");
                window.start_offset = offset;
                window.since = previous.since;
                // A chain with any failed record must not move the watermark past it.
                window.resumed = Some(previous.watermark.filter(|_| previous.error_count == 0));
                return Ok(window);
            }
        }

        if mode == SyncMode::Incremental {
            window.since = self
                .runs
                .last_watermark(&object.api_name)
                .await
                .map_err(storage)?;
        }
        Ok(window)
    }

    async fn load_fields(
        &self,
        object: &ObjectDescriptor,
    ) -> Result<(Vec<FieldDefinition>, Option<MigrationResult>), SyncError> {
        let fields = self.fetcher.fetch_fields(&object.api_name).await?;
        if self.config.reconcile_before_sync {
            let migration = self.reconciler.apply(object, &fields).await?;
            return Ok((fields, Some(migration)));
        }
        Ok((fields, None))
    }

    async fn drive(&self, object: &ObjectDescriptor, run: &mut SyncRun, window: RunWindow) -> RunErrors {
        let mut errors = RunErrors::default();

        let fields = match self.load_fields(object).await {
            Ok((fields, _)) => fields,
            Err(err) => {
                error!(error = %err, "could not prepare object schema");
                errors.force(&err);
                return errors;
            }
        };
        let table = object.table_name();
        let existing = match self.tables.list_columns(&table).await {
            Ok(columns) => columns,
            Err(err) => {
                errors.force(&storage(err));
                return errors;
            }
        };
        let layout = RowLayout::new(table, &fields, &existing);
        let normalizer = RecordNormalizer::new(object.api_name.clone(), fields);
        let filters = window
            .since
            .map(|since| vec![QueryFilter::gte(object.modified_field.clone(), since.timestamp_millis())])
            .unwrap_or_default();

        let limit = clamp_limit(window.single_page_limit.unwrap_or(self.config.page_size));
        let started = Instant::now();
        let mut offset = window.start_offset;
        let mut total = None;
        let mut consecutive_failures = 0usize;

        loop {
            if window.single_page_limit.is_none() && offset != window.start_offset {
                if let Some(budget) = self.config.run_budget {
                    if started.elapsed() >= budget {
                        info!(offset, "execution budget spent; checkpointing");
                        run.checkpoint_offset = Some(offset);
                        break;
                    }
                }
            }

            match self.fetcher.fetch_page(&object.api_name, &filters, offset, limit).await {
                Ok(page) => {
                    consecutive_failures = 0;
                    total = page.total.or(total);
                    let returned = page.records.len() as u64;
                    self.process_page(&normalizer, &layout, page.records, run, &mut errors)
                        .await;
                    if let Err(err) = self.runs.update_run(run).await {
                        warn!(error = %err, "could not persist run progress");
                    }
                    if window.single_page_limit.is_some() || !page.has_more {
                        break;
                    }
                    offset += returned;
                }
                Err(err @ SyncError::Credential(_)) => {
                    error!(offset, error = %err, "crm rejected credentials");
                    errors.force(&err);
                    break;
                }
                Err(err) => {
                    warn!(offset, error = %err, "page failed after retries");
                    let expected = match total {
                        Some(total) => limit.min(total.saturating_sub(offset)),
                        None => limit,
                    };
                    run.error_count += expected;
                    if self.config.abort_on_first_page_failure {
                        errors.force(&err);
                        break;
                    }
                    errors.note_fatal(&err);
                    consecutive_failures += 1;
                    if window.single_page_limit.is_some() {
                        break;
                    }
                    offset += limit;
                    let exhausted = match total {
                        Some(total) => offset >= total,
                        None => consecutive_failures >= self.config.max_consecutive_page_failures,
                    };
                    if exhausted {
                        break;
                    }
                }
            }
        }
        errors
    }

    async fn process_page(
        &self,
        normalizer: &RecordNormalizer,
        layout: &RowLayout,
        raw_records: Vec<RawRecord>,
        run: &mut SyncRun,
        errors: &mut RunErrors,
    ) {
        let mut records = Vec::with_capacity(raw_records.len());
        for raw in &raw_records {
            match normalizer.normalize(raw) {
                Ok(record) => records.push(record),
                Err(err) => {
                    run.error_count += 1;
                    errors.record_failure(RecordFailure::new(raw_id(raw), &SyncError::from(err)));
                }
            }
        }

        for batch in records.chunks(self.config.batch_size.max(1)) {
            match self.writer.upsert_batch(layout, batch).await {
                Ok(outcome) => {
                    run.success_count += outcome.written;
                    run.error_count += outcome.failed.len() as u64;
                    for failure in outcome.failed {
                        let err = SyncError::Write {
                            id: failure.id,
                            message: failure.error,
                        };
                        errors.record_failure(RecordFailure::new(None, &err));
                    }
                }
                Err(err) => {
                    warn!(table = %layout.table, error = %err, "batch write failed");
                    run.error_count += batch.len() as u64;
                    errors.note_fatal(&storage(err));
                }
            }
        }
    }

    /// Incremental runs over `objects` in order, pausing between objects.
    pub async fn run_all(&self, objects: &[String]) -> RunAllSummary {
        let mut summary = RunAllSummary {
            total: objects.len(),
            ..Default::default()
        };
        for (index, api_name) in objects.iter().enumerate() {
            if index > 0 && !self.config.inter_object_delay.is_zero() {
                tokio::time::sleep(self.config.inter_object_delay).await;
            }
            let entry = match self.run_incremental(api_name, None).await {
                Ok(run) => {
                    match run.status {
                        RunStatus::Succeeded => summary.succeeded += 1,
                        RunStatus::Partial => summary.partial += 1,
                        _ => summary.failed += 1,
                    }
                    summary.total_changes += run.success_count;
                    ObjectRunSummary {
                        object_api_name: api_name.clone(),
                        run_id: Some(run.id),
                        status: Some(run.status),
                        success_count: run.success_count,
                        error_count: run.error_count,
                        error: run
                            .error_detail
                            .as_ref()
                            .map(|d| d.summary(STATUS_DETAIL_MAX_CHARS)),
                    }
                }
                Err(err) => {
                    warn!(object = %api_name, error = %err, "object sync refused");
                    summary.failed += 1;
                    ObjectRunSummary {
                        object_api_name: api_name.clone(),
                        run_id: None,
                        status: None,
                        success_count: 0,
                        error_count: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            summary.objects.push(entry);
        }
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            changes = summary.total_changes,
            "sync-all finished"
        );
        summary
    }

    pub async fn run_all_enabled(&self) -> RunAllSummary {
        let objects = self
            .registry
            .enabled()
            .map(|o| o.api_name.clone())
            .collect::<Vec<_>>();
        self.run_all(&objects).await
    }

    pub async fn reconcile(&self, api_name: &str) -> Result<MigrationResult, SyncError> {
        let object = self.object(api_name)?;
        let fields = self.fetcher.fetch_fields(api_name).await?;
        self.reconciler.apply(object, &fields).await
    }

    pub async fn reconcile_all(&self) -> Vec<ReconcileOutcome> {
        let mut outcomes = Vec::new();
        for object in self.registry.enabled() {
            let outcome = match self.reconcile(&object.api_name).await {
                Ok(result) => ReconcileOutcome {
                    object_api_name: object.api_name.clone(),
                    result: Some(result),
                    error: None,
                },
                Err(err) => {
                    warn!(object = %object.api_name, error = %err, "reconcile failed");
                    ReconcileOutcome {
                        object_api_name: object.api_name.clone(),
                        result: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn status(&self, limit: usize) -> Result<Vec<RunStatusView>, SyncError> {
        let cutoff = self.stale_cutoff();
        let runs = self.runs.recent_runs(None, limit).await.map_err(storage)?;
        Ok(runs
            .into_iter()
            .map(|run| RunStatusView {
                stale: run.status == RunStatus::Running && run.started_at <= cutoff,
                error_detail: run
                    .error_detail
                    .as_ref()
                    .map(|d| d.summary(STATUS_DETAIL_MAX_CHARS)),
                run_id: run.id,
                object_api_name: run.object_api_name,
                mode: run.mode,
                status: run.status,
                started_at: run.started_at,
                finished_at: run.finished_at,
                success_count: run.success_count,
                error_count: run.error_count,
                checkpoint_offset: run.checkpoint_offset,
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<Vec<TableStats>, SyncError> {
        let mut stats = Vec::new();
        for object in &self.registry.objects {
            let table = object.table_name();
            let row_count = match self.tables.row_count(&table).await {
                Ok(count) => Some(count),
                Err(StoreError::MissingTable(_)) => None,
                Err(err) => return Err(storage(err)),
            };
            let last = self
                .runs
                .latest_run(&object.api_name, &[SyncMode::Full, SyncMode::Incremental, SyncMode::Page])
                .await
                .map_err(storage)?;
            let watermark = self.runs.last_watermark(&object.api_name).await.map_err(storage)?;
            stats.push(TableStats {
                object_api_name: object.api_name.clone(),
                table,
                row_count,
                last_synced_at: last.as_ref().and_then(|r| r.finished_at),
                last_status: last.map(|r| r.status),
                watermark,
            });
        }
        Ok(stats)
    }

    /// Cron job running [`SyncEngine::run_all_enabled`], when enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                let summary = engine.run_all_enabled().await;
                info!(changes = summary.total_changes, "scheduled sync-all complete");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
