//! Backing-store interface consumed by the import pipeline.
//!
//! Rows cross the boundary as JSON objects so the same resolver and loader code
//! drives both the SQLite store and the HTTP store.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub type StoredRow = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Organizations,
    Pharmacies,
    Prescribers,
    Locations,
    Drugs,
    Patients,
    InsurancePlans,
    Prescriptions,
    Claims,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Organizations => "organizations",
            Table::Pharmacies => "pharmacies",
            Table::Prescribers => "prescribers",
            Table::Locations => "locations",
            Table::Drugs => "drugs",
            Table::Patients => "patients",
            Table::InsurancePlans => "insurance_plans",
            Table::Prescriptions => "prescriptions",
            Table::Claims => "claims",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the request. Stores report this for the
    /// whole request; nothing from it was written.
    #[error("conflict writing {table}: {message}")]
    Conflict { table: &'static str, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertReport {
    /// Rows actually written; the rest of the request hit the conflict key.
    pub inserted: usize,
}

#[allow(async_fn_in_trait)]
pub trait BackingStore {
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Every persisted row of `table`, including its `id`.
    async fn bulk_read(&self, table: Table) -> Result<Vec<StoredRow>, StoreError>;

    /// Inserts all rows atomically and returns them as stored, with generated ids.
    async fn bulk_insert(
        &self,
        table: Table,
        rows: &[StoredRow],
    ) -> Result<Vec<StoredRow>, StoreError>;

    /// Inserts rows, leaving existing ones untouched. With a conflict key,
    /// rows colliding on it are skipped and counted out of `inserted`. Without
    /// one, the store's own constraints decide; a store that cannot skip
    /// individual rows fails the request with [`StoreError::Conflict`].
    async fn bulk_upsert(
        &self,
        table: Table,
        rows: &[StoredRow],
        conflict_key: Option<&[&str]>,
    ) -> Result<UpsertReport, StoreError>;
}

pub fn row_id(row: &StoredRow) -> Option<i64> {
    match row.get("id")? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Text value of a column; numbers are rendered, blanks and nulls are `None`.
pub fn row_text(row: &StoredRow, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn row_i64(row: &StoredRow, column: &str) -> Option<i64> {
    match row.get(column)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> StoredRow {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn ids_accept_numbers_and_numeric_strings() {
        assert_eq!(row_id(&row(json!({"id": 7}))), Some(7));
        assert_eq!(row_id(&row(json!({"id": "12"}))), Some(12));
        assert_eq!(row_id(&row(json!({"id": null}))), None);
        assert_eq!(row_id(&row(json!({}))), None);
    }

    #[test]
    fn text_renders_numbers_and_drops_blanks() {
        let row = row(json!({"npi": 1234567890, "name": "  ", "city": " Austin "}));
        assert_eq!(row_text(&row, "npi").as_deref(), Some("1234567890"));
        assert_eq!(row_text(&row, "name"), None);
        assert_eq!(row_text(&row, "city").as_deref(), Some("Austin"));
        assert_eq!(row_text(&row, "missing"), None);
    }
}
