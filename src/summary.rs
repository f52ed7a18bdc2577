use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{
    entities::EntityKind,
    loader::LoadOutcome,
    parser::{SkipReason, SkippedRow},
    records::RecordKind,
    resolver::Resolution,
};

/// Everything that went wrong in a run, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ImportError {
    #[error("line {line} skipped: {reason}")]
    RowSkipped { line: usize, reason: SkipReason },
    #[error("creating {attempted} {kind} entities failed: {message}")]
    EntityCreationFailed {
        kind: EntityKind,
        attempted: usize,
        message: String,
    },
    #[error("chunk {chunk} ({rows} rows) skipped: {message}")]
    ChunkSkipped {
        chunk: usize,
        rows: usize,
        message: String,
    },
    #[error("chunk {chunk} ({rows} rows) failed to load: {message}")]
    ChunkLoadFailed {
        chunk: usize,
        rows: usize,
        message: String,
    },
    #[error("{kind} resolution abandoned: {message}")]
    StageFatal { kind: EntityKind, message: String },
    #[error("import aborted: {message}")]
    RunFatal { message: String },
}

impl ImportError {
    pub fn category(&self) -> &'static str {
        match self {
            ImportError::RowSkipped { .. } => "row_skipped",
            ImportError::EntityCreationFailed { .. } => "entity_creation_failed",
            ImportError::ChunkSkipped { .. } => "chunk_skipped",
            ImportError::ChunkLoadFailed { .. } => "chunk_load_failed",
            ImportError::StageFatal { .. } => "stage_fatal",
            ImportError::RunFatal { .. } => "run_fatal",
        }
    }

    pub fn line(&self) -> Option<usize> {
        match self {
            ImportError::RowSkipped { line, .. } => Some(*line),
            _ => None,
        }
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            ImportError::EntityCreationFailed { kind, .. } | ImportError::StageFatal { kind, .. } => {
                Some(*kind)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub candidates: usize,
    pub matched: usize,
    pub created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub record_kind: RecordKind,
    pub status: RunStatus,
    pub total_records: usize,
    pub records_parsed: usize,
    pub records_imported: usize,
    pub records_skipped: usize,
    pub records_failed: usize,
    /// Parsed records never sent to the store because the run stopped first.
    pub records_unattempted: usize,
    pub skip_reasons: BTreeMap<String, usize>,
    pub entities: BTreeMap<EntityKind, EntityCounts>,
    pub errors: Vec<ImportError>,
    pub elapsed_ms: u64,
}

impl ImportSummary {
    pub fn new(record_kind: RecordKind) -> Self {
        Self {
            record_kind,
            status: RunStatus::Complete,
            total_records: 0,
            records_parsed: 0,
            records_imported: 0,
            records_skipped: 0,
            records_failed: 0,
            records_unattempted: 0,
            skip_reasons: BTreeMap::new(),
            entities: BTreeMap::new(),
            errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn record_skip(&mut self, skipped: SkippedRow) {
        self.records_skipped += 1;
        *self.skip_reasons.entry(skipped.reason.label()).or_default() += 1;
        self.errors.push(ImportError::RowSkipped {
            line: skipped.line,
            reason: skipped.reason,
        });
    }

    /// Takes the resolution's counts and errors; its cache stays with the caller.
    pub fn record_resolution(&mut self, resolution: &mut Resolution) {
        self.entities.insert(
            resolution.kind,
            EntityCounts {
                candidates: resolution.candidates,
                matched: resolution.matched,
                created: resolution.created,
            },
        );
        self.errors.append(&mut resolution.errors);
    }

    pub fn record_load(&mut self, outcome: LoadOutcome) {
        self.records_imported += outcome.imported;
        if outcome.skipped > 0 {
            self.records_skipped += outcome.skipped;
            *self
                .skip_reasons
                .entry("already loaded".to_string())
                .or_default() += outcome.skipped;
        }
        self.records_failed += outcome.failed;
        self.records_unattempted += outcome.unattempted;
        self.errors.extend(outcome.errors);
    }

    pub fn fail(&mut self, error: ImportError) {
        self.status = RunStatus::Failed;
        self.errors.push(error);
    }

    pub fn created(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map_or(0, |counts| counts.created)
    }

    pub fn total_created(&self) -> usize {
        self.entities.values().map(|counts| counts.created).sum()
    }

    pub fn errors_in(&self, category: &str) -> impl Iterator<Item = &ImportError> {
        self.errors
            .iter()
            .filter(move |err| err.category() == category)
    }
}
