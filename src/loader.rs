use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::{
    records::RecordKind,
    store::{BackingStore, StoredRow, Table},
    summary::ImportError,
};

/// How re-submitted fact rows are recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Rows colliding on these columns are skipped.
    Key(&'static [&'static str]),
    /// No declared key; the store's own unique constraints decide.
    StoreConstraint,
}

impl ConflictPolicy {
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Prescriptions => ConflictPolicy::Key(&["prescription_id"]),
            RecordKind::Claims => ConflictPolicy::StoreConstraint,
        }
    }

    fn conflict_key(self) -> Option<&'static [&'static str]> {
        match self {
            ConflictPolicy::Key(columns) => Some(columns),
            ConflictPolicy::StoreConstraint => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Rows left unsent because the run was cancelled.
    pub unattempted: usize,
    pub chunks: usize,
    pub cancelled: bool,
    pub errors: Vec<ImportError>,
}

/// Upserts `rows` in chunks of `chunk_size`, reporting `(rows done, total)`
/// after each chunk. Cancellation is honoured between chunks only.
pub async fn load<S: BackingStore>(
    store: &S,
    table: Table,
    rows: &[StoredRow],
    chunk_size: usize,
    policy: ConflictPolicy,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(usize, usize),
) -> LoadOutcome {
    let chunk_size = chunk_size.max(1);
    let total = rows.len();
    let mut outcome = LoadOutcome::default();
    let mut done = 0usize;

    for (idx, chunk) in rows.chunks(chunk_size).enumerate() {
        if cancel.load(Ordering::SeqCst) {
            outcome.cancelled = true;
            outcome.unattempted = total - done;
            warn!(table = table.name(), remaining = outcome.unattempted, "load cancelled");
            break;
        }

        let chunk_no = idx + 1;
        outcome.chunks += 1;
        match store.bulk_upsert(table, chunk, policy.conflict_key()).await {
            Ok(report) => {
                let inserted = report.inserted.min(chunk.len());
                outcome.imported += inserted;
                outcome.skipped += chunk.len() - inserted;
                debug!(table = table.name(), chunk = chunk_no, inserted, "chunk loaded");
            }
            Err(err) if err.is_conflict() => {
                // The store could not say which rows collided, so none are claimed as loaded.
                warn!(
                    table = table.name(),
                    chunk = chunk_no,
                    error = %err,
                    "chunk skipped on conflict"
                );
                outcome.skipped += chunk.len();
                outcome.errors.push(ImportError::ChunkSkipped {
                    chunk: chunk_no,
                    rows: chunk.len(),
                    message: err.to_string(),
                });
            }
            Err(err) => {
                warn!(table = table.name(), chunk = chunk_no, error = %err, "chunk failed");
                outcome.failed += chunk.len();
                outcome.errors.push(ImportError::ChunkLoadFailed {
                    chunk: chunk_no,
                    rows: chunk.len(),
                    message: err.to_string(),
                });
            }
        }

        done += chunk.len();
        on_progress(done, total);
    }

    outcome
}
