//! End-to-end sync run: discover → per entity (describe → enumerate →
//! fetch → merge → save → advance progress) → publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use url::Url;

use storysync_crawler::{
    CompiledProfile, ConcurrentFetcher, DescriptorExtractor, FetchBatch, PageFetcher,
    UnitListing, UnitSkip, enumerate_explicit, probe_numeric,
};
use storysync_discovery::{CatalogDiscoverer, DiscoveryOptions};
use storysync_publish::{PublishOutcome, Publisher};
use storysync_shared::{
    CatalogEntry, EntityId, EnumerationStrategy, Result, StorySyncError, SyncConfig, Unit,
};
use storysync_storage::Storage;

use crate::progress::ProgressStore;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Options, budget, reporting
// ---------------------------------------------------------------------------

/// Per-invocation switches that are not part of the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip the hash check and publish even an unchanged snapshot.
    pub force_publish: bool,
}

/// Run-level stop conditions. Checked only before an entity starts, so an
/// entity that started always finishes its merge.
#[derive(Debug, Clone)]
pub struct RunBudget {
    max_entities: Option<usize>,
    deadline: Option<Instant>,
    stop: Arc<AtomicBool>,
}

impl RunBudget {
    pub fn new(max_entities: Option<usize>, deadline: Option<Duration>) -> Self {
        Self {
            max_entities,
            deadline: deadline.map(|d| Instant::now() + d),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Flag that, once set, stops new entities from starting.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Why no further entity may start, if any.
    fn exhausted(&self, started: usize) -> Option<&'static str> {
        if self.stop.load(Ordering::SeqCst) {
            return Some("stop requested");
        }
        if self.max_entities.is_some_and(|max| started >= max) {
            return Some("entity budget reached");
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some("deadline reached");
        }
        None
    }
}

/// Per-entity result.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EntityReport {
    pub entity_id: String,
    pub strategy: Option<EnumerationStrategy>,
    pub units_added: usize,
    pub units_failed: usize,
    pub units_empty: usize,
    pub progress: u32,
    /// Set when the entity was skipped as a whole.
    pub skipped: Option<String>,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when an entity finishes, successfully or not.
    fn entity_done(&self, report: &EntityReport, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn entity_done(&self, _report: &EntityReport, _current: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// What happened to the publish step.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PublishStatus {
    #[default]
    Disabled,
    Published,
    Unchanged,
    /// Left for the next run; the local snapshot is intact.
    Failed(String),
}

/// Summary of a full run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub entries_discovered: usize,
    pub entities_started: usize,
    pub entities_updated: usize,
    pub entities_skipped: usize,
    pub units_added: usize,
    pub units_failed: usize,
    pub units_empty: usize,
    pub stopped_early: Option<String>,
    pub publish: PublishStatus,
    pub elapsed_ms: u64,
}

impl RunSummary {
    fn absorb(&mut self, report: &EntityReport) {
        if report.skipped.is_some() {
            self.entities_skipped += 1;
        }
        if report.units_added > 0 {
            self.entities_updated += 1;
        }
        self.units_added += report.units_added;
        self.units_failed += report.units_failed;
        self.units_empty += report.units_empty;
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Everything an entity task needs, shared across tasks.
struct Engine {
    run_id: String,
    profile: Arc<CompiledProfile>,
    extractor: DescriptorExtractor,
    pool: ConcurrentFetcher,
    progress: ProgressStore,
    store: Arc<Store>,
    storage: Arc<Storage>,
    probe_miss_limit: u32,
}

/// Run one incremental sync.
///
/// Configuration and profile problems are reported before any request is
/// made. Entity- and unit-level failures are logged to the skip table and
/// never abort the run. A publish failure is reported in the summary and
/// leaves the saved snapshot in place.
#[instrument(skip_all, fields(workers = config.workers, entity_parallelism = config.entity_parallelism))]
pub async fn run_sync(
    config: &SyncConfig,
    storage: Arc<Storage>,
    publisher: Option<&Publisher>,
    budget: &RunBudget,
    options: &RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<RunSummary> {
    let start = Instant::now();

    // --- Phase 1: Validation (no network) ---
    config.validate()?;
    let profile = Arc::new(CompiledProfile::compile(&config.profile)?);
    let fetcher = PageFetcher::new(config)?;
    let store = Arc::new(Store::load(&config.snapshot_path)?);

    let run_id = storage.insert_sync_run().await?;
    info!(%run_id, "starting sync run");

    let engine = Arc::new(Engine {
        run_id: run_id.clone(),
        profile: profile.clone(),
        extractor: DescriptorExtractor::new(fetcher.clone(), profile.clone()),
        pool: ConcurrentFetcher::new(
            fetcher.clone(),
            profile.clone(),
            config.workers,
            config.rate_limit,
        ),
        progress: ProgressStore::new(storage.clone()),
        store: store.clone(),
        storage: storage.clone(),
        probe_miss_limit: config.probe_miss_limit,
    });

    let mut summary = RunSummary {
        run_id: run_id.clone(),
        ..Default::default()
    };

    // --- Phase 2: Discovery ---
    progress.phase("Discovering catalog");
    let discoverer = CatalogDiscoverer::new(fetcher, profile, DiscoveryOptions::from(config));
    let (entries, stats) = discoverer.discover().await?;
    summary.entries_discovered = entries.len();
    info!(
        entries = entries.len(),
        pages_fetched = stats.pages_fetched,
        pages_failed = stats.pages_failed,
        "discovery finished"
    );

    // --- Phase 3: Entities, at most E at a time ---
    progress.phase("Syncing entities");
    let permits = Arc::new(Semaphore::new(config.entity_parallelism.max(1)));
    let mut tasks: JoinSet<EntityReport> = JoinSet::new();
    let total = entries.len();
    let mut finished = 0usize;
    let mut updated_since_publish = 0usize;

    for entry in entries {
        if let Some(reason) = budget.exhausted(summary.entities_started) {
            info!(reason, started = summary.entities_started, "not starting further entities");
            summary.stopped_early = Some(reason.to_string());
            break;
        }

        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StorySyncError::validation(format!("entity pool closed: {e}")))?;

        // The budget may have run out while waiting for a slot.
        if let Some(reason) = budget.exhausted(summary.entities_started) {
            summary.stopped_early = Some(reason.to_string());
            break;
        }

        summary.entities_started += 1;
        let engine = engine.clone();
        tasks.spawn(async move {
            let report = engine.process_entity(entry).await;
            drop(permit);
            report
        });

        while let Some(joined) = tasks.try_join_next() {
            finished += 1;
            if handle_report(joined, &mut summary, progress, finished, total) {
                updated_since_publish += 1;
                maybe_publish_partial(config, publisher, &store, &mut updated_since_publish, options)
                    .await;
            }
        }
    }

    // In-flight entities always run to completion.
    while let Some(joined) = tasks.join_next().await {
        finished += 1;
        if handle_report(joined, &mut summary, progress, finished, total) {
            updated_since_publish += 1;
            maybe_publish_partial(config, publisher, &store, &mut updated_since_publish, options)
                .await;
        }
    }

    // --- Phase 4: Final save + publish ---
    progress.phase("Saving snapshot");
    let snapshot = store.save().await?;

    if let Some(publisher) = publisher {
        progress.phase("Publishing");
        summary.publish = match publisher.publish(&snapshot, options.force_publish).await {
            Ok(PublishOutcome::Published(_)) => PublishStatus::Published,
            Ok(PublishOutcome::Unchanged) => PublishStatus::Unchanged,
            Err(e) => {
                warn!(error = %e, "publish deferred to next run");
                PublishStatus::Failed(e.to_string())
            }
        };
    }

    summary.elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    let stats_json = serde_json::to_string(&summary)
        .map_err(|e| StorySyncError::validation(format!("failed to serialize run stats: {e}")))?;
    storage.finish_sync_run(&run_id, &stats_json).await?;

    info!(
        entities_started = summary.entities_started,
        entities_updated = summary.entities_updated,
        entities_skipped = summary.entities_skipped,
        units_added = summary.units_added,
        units_failed = summary.units_failed,
        elapsed_ms = summary.elapsed_ms,
        "sync run finished"
    );
    progress.done(&summary);
    Ok(summary)
}

/// Fold a finished entity into the summary. Returns whether it added units.
fn handle_report(
    joined: std::result::Result<EntityReport, tokio::task::JoinError>,
    summary: &mut RunSummary,
    progress: &dyn ProgressReporter,
    finished: usize,
    total: usize,
) -> bool {
    match joined {
        Ok(report) => {
            summary.absorb(&report);
            progress.entity_done(&report, finished, total);
            report.units_added > 0
        }
        Err(e) => {
            warn!(error = %e, "entity task panicked");
            summary.entities_skipped += 1;
            false
        }
    }
}

/// Publish mid-run after every `publish_every` updated entities.
async fn maybe_publish_partial(
    config: &SyncConfig,
    publisher: Option<&Publisher>,
    store: &Store,
    updated_since_publish: &mut usize,
    options: &RunOptions,
) {
    let (Some(every), Some(publisher)) = (config.publish_every, publisher) else {
        return;
    };
    if *updated_since_publish < every.max(1) {
        return;
    }
    *updated_since_publish = 0;

    match store.save().await {
        Ok(snapshot) => {
            if let Err(e) = publisher.publish(&snapshot, options.force_publish).await {
                warn!(error = %e, "intermediate publish failed");
            }
        }
        Err(e) => warn!(error = %e, "intermediate save failed"),
    }
}

// ---------------------------------------------------------------------------
// Per-entity processing
// ---------------------------------------------------------------------------

impl Engine {
    /// Process one entry. Never fails: every problem becomes part of the report.
    #[instrument(skip_all, fields(url = %entry.ref_url))]
    async fn process_entity(&self, entry: CatalogEntry) -> EntityReport {
        let fallback_id = EntityId::from_ref_url(&entry.ref_url)
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|_| entry.ref_url.to_string());

        match self.sync_entity(&entry.ref_url).await {
            Ok(report) => report,
            Err(e) => {
                warn!(entity_id = %fallback_id, error = %e, "entity skipped");
                self.log_skip(&fallback_id, None, &e).await;
                EntityReport {
                    entity_id: fallback_id,
                    skipped: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    async fn sync_entity(&self, ref_url: &Url) -> Result<EntityReport> {
        let page = self.extractor.extract(ref_url).await?;
        let id = page.descriptor.id.clone();
        let strategy = page.listing.strategy();
        let resume = self.progress.resume_from(&id).await?;

        let batch = match &page.listing {
            UnitListing::Explicit(links) => {
                let refs: Vec<_> = enumerate_explicit(links, self.profile.listing_order())
                    .into_iter()
                    .filter(|r| r.ordinal > resume)
                    .collect();
                info!(
                    entity_id = %id,
                    listed = links.len(),
                    pending = refs.len(),
                    resume,
                    "explicit listing"
                );
                self.pool.fetch_units(refs).await
            }
            UnitListing::Synthesized { ceiling_hint } => {
                info!(entity_id = %id, ?ceiling_hint, resume, "probing numeric units");
                let outcome =
                    probe_numeric(&self.pool, ref_url, &id, resume, self.probe_miss_limit).await?;
                outcome.batch
            }
        };

        // Merge, then save, then advance: a crash in between only means
        // refetching units the next merge ignores.
        let outcome = self
            .store
            .merge(&page.descriptor, &batch.units, strategy)
            .await;
        if outcome.changed {
            self.store.save().await?;
        }

        let target = progress_target(strategy, &batch);
        let stored = match target {
            Some(ordinal) if ordinal > resume => {
                self.progress.advance(&id, ordinal, strategy).await?
            }
            _ => resume,
        };

        self.log_unit_skips(&id, strategy, &batch).await;
        self.log_conflicts(&id, ref_url, &outcome.conflicts).await;

        let is_failure = |s: &&UnitSkip| counts_as_failure(strategy, s, &batch);
        Ok(EntityReport {
            entity_id: id.as_str().to_string(),
            strategy: Some(strategy),
            units_added: outcome.added.len(),
            units_failed: batch.failed.iter().filter(is_failure).count(),
            units_empty: batch.empty.iter().filter(is_failure).count(),
            progress: stored,
            skipped: None,
        })
    }

    async fn log_unit_skips(
        &self,
        id: &EntityId,
        strategy: EnumerationStrategy,
        batch: &FetchBatch,
    ) {
        for skip in batch.failed.iter().chain(batch.empty.iter()) {
            if counts_as_failure(strategy, skip, batch) {
                self.log_skip(id.as_str(), Some(skip.ordinal), &skip.error).await;
            }
        }
    }

    /// Units refused by the merge stay visible in the skip log, since
    /// progress may already cover their ordinals.
    async fn log_conflicts(&self, id: &EntityId, ref_url: &Url, conflicts: &[Unit]) {
        for unit in conflicts {
            warn!(
                entity_id = %id,
                ordinal = unit.ordinal,
                name = %unit.name,
                "unit conflicts with a stored unit"
            );
            let error = StorySyncError::structure(
                ref_url.as_str(),
                format!(
                    "unit `{}` (ordinal {}) duplicates the ordinal or name of a stored unit",
                    unit.name, unit.ordinal
                ),
            );
            self.log_skip(id.as_str(), Some(unit.ordinal), &error).await;
        }
    }

    async fn log_skip(&self, entity_id: &str, ordinal: Option<u32>, error: &StorySyncError) {
        if let Err(e) = self
            .storage
            .record_skip(&self.run_id, entity_id, ordinal, error.kind(), &error.to_string())
            .await
        {
            warn!(error = %e, "failed to record skip");
        }
    }
}

/// Probes past the last found unit are expected misses, not failures.
fn counts_as_failure(strategy: EnumerationStrategy, skip: &UnitSkip, batch: &FetchBatch) -> bool {
    match strategy {
        EnumerationStrategy::ExplicitLinks => true,
        EnumerationStrategy::SynthesizedNumeric => {
            let last_found = batch.units.last().map(|u| u.ordinal).unwrap_or(0);
            let miss = skip.is_not_found()
                || matches!(skip.error, StorySyncError::EmptyContent { .. });
            skip.ordinal < last_found || !miss
        }
    }
}

/// Where progress may advance to after this entity's batch.
///
/// Explicit listings: the highest attempted ordinal, provided at least one
/// unit came back (gaps are tolerated). Synthesized probing: the highest
/// fetched ordinal below the first probe that failed in transport, so that
/// probe is retried next run.
fn progress_target(strategy: EnumerationStrategy, batch: &FetchBatch) -> Option<u32> {
    if batch.units.is_empty() {
        return None;
    }
    match strategy {
        EnumerationStrategy::ExplicitLinks => batch.max_attempted(),
        EnumerationStrategy::SynthesizedNumeric => {
            let first_transport_failure = batch
                .failed
                .iter()
                .filter(|s| !s.is_not_found())
                .map(|s| s.ordinal)
                .min();
            batch
                .units
                .iter()
                .map(|u| u.ordinal)
                .filter(|&n| first_transport_failure.is_none_or(|f| n < f))
                .max()
        }
    }
}
