//! Import orchestration: parse, resolve reference data kind by kind, build
//! facts, load them.

use anyhow::Result;
use std::{
    fmt,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    cache::ResolutionCaches,
    constants::{
        BUILD_STAGE_START, BUILD_STAGE_WEIGHT, DEFAULT_ENTITY_CHUNK_SIZE, DEFAULT_FACT_CHUNK_SIZE,
        DEFAULT_PROGRESS_INTERVAL, LOAD_STAGE_START, LOAD_STAGE_WEIGHT, MAX_PROGRESS_INTERVAL,
        MIN_PROGRESS_INTERVAL, PARSE_STAGE_START, PARSE_STAGE_WEIGHT, REFERENCE_STAGE_START,
        REFERENCE_STAGE_WEIGHT,
    },
    entities::{
        Drug, EntityKind, InsurancePlan, Location, Organization, Patient, Pharmacy, Prescriber,
        RESOLUTION_ORDER,
    },
    facts::{ReferenceIds, build_fact, fact_table},
    loader::{ConflictPolicy, load},
    parser::parse_rows,
    progress::{ProgressSink, ProgressTracker},
    raw_row::RawTable,
    reader::read_table,
    records::{RecordKind, TypedRecord},
    resolver::{Resolution, resolve},
    store::{BackingStore, StoreError, StoredRow},
    summary::{ImportError, ImportSummary},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Parsing,
    ExtractingReferenceData(EntityKind),
    BuildingFacts,
    Loading,
    Complete,
    Failed,
}

impl ImportStage {
    /// `(start percent, weight percent)` of this stage within the whole run.
    pub fn span(self) -> (f64, f64) {
        match self {
            ImportStage::Parsing => (PARSE_STAGE_START, PARSE_STAGE_WEIGHT),
            ImportStage::ExtractingReferenceData(kind) => {
                let share = REFERENCE_STAGE_WEIGHT / RESOLUTION_ORDER.len() as f64;
                let position = RESOLUTION_ORDER
                    .iter()
                    .position(|k| *k == kind)
                    .unwrap_or(0);
                (REFERENCE_STAGE_START + share * position as f64, share)
            }
            ImportStage::BuildingFacts => (BUILD_STAGE_START, BUILD_STAGE_WEIGHT),
            ImportStage::Loading => (LOAD_STAGE_START, LOAD_STAGE_WEIGHT),
            ImportStage::Complete => (100.0, 0.0),
            ImportStage::Failed => (0.0, 0.0),
        }
    }
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportStage::Parsing => f.write_str("parsing"),
            ImportStage::ExtractingReferenceData(kind) => write!(f, "resolving {kind} references"),
            ImportStage::BuildingFacts => f.write_str("building facts"),
            ImportStage::Loading => f.write_str("loading"),
            ImportStage::Complete => f.write_str("complete"),
            ImportStage::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub fact_chunk_size: usize,
    pub entity_chunk_size: usize,
    pub progress_interval: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            fact_chunk_size: DEFAULT_FACT_CHUNK_SIZE,
            entity_chunk_size: DEFAULT_ENTITY_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Reads `path` and imports it. Errors only when the file cannot be read;
/// everything after that is reported through the summary.
pub async fn import_file<S, P>(
    store: &S,
    kind: RecordKind,
    path: &Path,
    sheet: Option<&str>,
    options: &ImportOptions,
    progress: P,
    cancel: &AtomicBool,
) -> Result<ImportSummary>
where
    S: BackingStore,
    P: ProgressSink,
{
    let table = read_table(path, sheet)?;
    info!(
        path = %path.display(),
        rows = table.rows.len(),
        columns = table.headers.len(),
        "read input"
    );
    Ok(run_import(store, kind, &table, options, progress, cancel).await)
}

pub async fn run_import<S, P>(
    store: &S,
    kind: RecordKind,
    table: &RawTable,
    options: &ImportOptions,
    progress: P,
    cancel: &AtomicBool,
) -> ImportSummary
where
    S: BackingStore,
    P: ProgressSink,
{
    let started = Instant::now();
    let mut tracker = ProgressTracker::new(progress);
    let mut summary = ImportSummary::new(kind);

    let result = execute(store, kind, table, options, &mut tracker, cancel, &mut summary).await;
    summary.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match result {
        Ok(()) => {
            tracker.update(ImportStage::Complete, 1.0, "Import complete");
            info!(
                kind = %kind,
                imported = summary.records_imported,
                skipped = summary.records_skipped,
                failed = summary.records_failed,
                created = summary.total_created(),
                elapsed_ms = summary.elapsed_ms,
                "import complete"
            );
        }
        Err(err) => {
            error!(kind = %kind, error = %err, "import failed");
            summary.fail(err);
            tracker.update(ImportStage::Failed, 0.0, "Import failed");
        }
    }
    summary
}

fn checkpoint(cancel: &AtomicBool, next: ImportStage) -> Result<(), ImportError> {
    if cancel.load(Ordering::SeqCst) {
        return Err(ImportError::RunFatal {
            message: format!("cancelled before {next}"),
        });
    }
    Ok(())
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

async fn execute<S, P>(
    store: &S,
    kind: RecordKind,
    table: &RawTable,
    options: &ImportOptions,
    tracker: &mut ProgressTracker<P>,
    cancel: &AtomicBool,
    summary: &mut ImportSummary,
) -> Result<(), ImportError>
where
    S: BackingStore,
    P: ProgressSink,
{
    for column in kind.required_columns() {
        if !table.has_column(column) {
            warn!(column, "input has no required column '{column}'; every row will be skipped");
        }
    }

    checkpoint(cancel, ImportStage::Parsing)?;
    tracker.update(ImportStage::Parsing, 0.0, "Parsing rows");
    let parsed = parse_rows(kind, &table.rows, options.progress_interval, |done, total| {
        tracker.update(
            ImportStage::Parsing,
            ratio(done, total),
            &format!("Parsed {done}/{total} rows"),
        )
    });
    summary.total_records = table.rows.len();
    summary.records_parsed = parsed.records.len();
    for skipped in parsed.skipped {
        summary.record_skip(skipped);
    }
    let records = parsed.records;

    store
        .health_check()
        .await
        .map_err(|err| ImportError::RunFatal {
            message: format!("backing store unreachable: {err}"),
        })?;

    let caches = resolve_reference_data(store, &records, options, tracker, cancel, summary).await?;

    checkpoint(cancel, ImportStage::BuildingFacts)?;
    let total = records.len();
    let interval = options
        .progress_interval
        .clamp(MIN_PROGRESS_INTERVAL, MAX_PROGRESS_INTERVAL);
    let mut rows: Vec<StoredRow> = Vec::with_capacity(total);
    for (idx, record) in records.iter().enumerate() {
        let fact = build_fact(record, &caches);
        if *fact.refs() == ReferenceIds::default() {
            debug!(line = fact.line(), "fact has no resolved references");
        }
        rows.push(fact.to_row());
        let done = idx + 1;
        if done % interval == 0 || done == total {
            tracker.update(
                ImportStage::BuildingFacts,
                ratio(done, total),
                &format!("Built {done}/{total} fact rows"),
            );
        }
    }

    checkpoint(cancel, ImportStage::Loading)?;
    tracker.update(ImportStage::Loading, 0.0, &format!("Loading {kind}"));
    let outcome = load(
        store,
        fact_table(kind),
        &rows,
        options.fact_chunk_size,
        ConflictPolicy::for_kind(kind),
        cancel,
        |done, total| {
            tracker.update(
                ImportStage::Loading,
                ratio(done, total),
                &format!("Loaded {done}/{total} {kind}"),
            )
        },
    )
    .await;
    let cancelled = outcome.cancelled;
    summary.record_load(outcome);
    if cancelled {
        return Err(ImportError::RunFatal {
            message: "cancelled during loading".to_string(),
        });
    }
    Ok(())
}

/// Runs every kind in [`RESOLUTION_ORDER`]. A kind whose read fails is
/// abandoned along with every kind depending on it; the others carry on.
async fn resolve_reference_data<S, P>(
    store: &S,
    records: &[TypedRecord],
    options: &ImportOptions,
    tracker: &mut ProgressTracker<P>,
    cancel: &AtomicBool,
    summary: &mut ImportSummary,
) -> Result<ResolutionCaches, ImportError>
where
    S: BackingStore,
    P: ProgressSink,
{
    let mut caches = ResolutionCaches::default();
    let mut abandoned: Vec<EntityKind> = Vec::new();

    for entity_kind in RESOLUTION_ORDER {
        let stage = ImportStage::ExtractingReferenceData(entity_kind);
        checkpoint(cancel, stage)?;

        if let Some(dependency) = entity_kind
            .depends_on()
            .iter()
            .find(|dep| abandoned.contains(dep))
        {
            abandoned.push(entity_kind);
            summary.errors.push(ImportError::StageFatal {
                kind: entity_kind,
                message: format!("{dependency} resolution was abandoned"),
            });
            continue;
        }

        let message = format!("Resolving {entity_kind} references");
        tracker.update(stage, 0.0, &message);
        let resolved = resolve_kind(
            entity_kind,
            store,
            records,
            &caches,
            options.entity_chunk_size,
            |fraction| tracker.update(stage, fraction, &message),
        )
        .await;

        match resolved {
            Ok(mut resolution) => {
                summary.record_resolution(&mut resolution);
                caches.install(resolution.cache);
            }
            Err(err) => {
                error!(kind = %entity_kind, error = %err, "reference read failed");
                abandoned.push(entity_kind);
                summary.errors.push(ImportError::StageFatal {
                    kind: entity_kind,
                    message: err.to_string(),
                });
            }
        }
    }

    Ok(caches)
}

async fn resolve_kind<S: BackingStore>(
    kind: EntityKind,
    store: &S,
    records: &[TypedRecord],
    caches: &ResolutionCaches,
    chunk_size: usize,
    on_progress: impl FnMut(f64),
) -> Result<Resolution, StoreError> {
    match kind {
        EntityKind::Organization => {
            resolve::<Organization, S>(store, records, caches, chunk_size, on_progress).await
        }
        EntityKind::Pharmacy => {
            resolve::<Pharmacy, S>(store, records, caches, chunk_size, on_progress).await
        }
        EntityKind::Prescriber => {
            resolve::<Prescriber, S>(store, records, caches, chunk_size, on_progress).await
        }
        EntityKind::Location => {
            resolve::<Location, S>(store, records, caches, chunk_size, on_progress).await
        }
        EntityKind::Drug => resolve::<Drug, S>(store, records, caches, chunk_size, on_progress).await,
        EntityKind::Patient => {
            resolve::<Patient, S>(store, records, caches, chunk_size, on_progress).await
        }
        EntityKind::InsurancePlan => {
            resolve::<InsurancePlan, S>(store, records, caches, chunk_size, on_progress).await
        }
    }
}
