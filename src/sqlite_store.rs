use anyhow::{Context, Result};
use rusqlite::{
    Connection, ErrorCode, Row, params_from_iter,
    types::{Value as SqlValue, ValueRef},
};
use serde_json::{Number, Value};
use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};
use tracing::debug;

use crate::{
    common::{ensure_parent_dir, quote_ident},
    store::{BackingStore, StoreError, StoredRow, Table, UpsertReport},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS organizations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS pharmacies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        npi TEXT UNIQUE,
        nabp TEXT UNIQUE,
        address TEXT,
        city TEXT,
        state TEXT,
        zip TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS prescribers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        npi TEXT UNIQUE,
        dea TEXT UNIQUE,
        last_name TEXT,
        first_name TEXT,
        specialty TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS locations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        organization_id INTEGER REFERENCES organizations(id),
        name TEXT NOT NULL,
        address TEXT,
        city TEXT,
        state TEXT,
        zip TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS drugs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ndc TEXT UNIQUE,
        name TEXT,
        strength TEXT,
        dosage_form TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS patients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT UNIQUE,
        last_name TEXT,
        first_name TEXT,
        birth_date TEXT,
        gender TEXT,
        zip TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS insurance_plans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        bin TEXT,
        pcn TEXT,
        group_number TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_insurance_plans_bin_pcn_group
        ON insurance_plans(bin, COALESCE(pcn, ''), COALESCE(group_number, ''))
        WHERE bin IS NOT NULL;
    CREATE TABLE IF NOT EXISTS prescriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        prescription_id TEXT NOT NULL UNIQUE,
        prescribed_date TEXT NOT NULL,
        quantity TEXT,
        days_supply INTEGER,
        refills_authorized INTEGER,
        is_controlled INTEGER NOT NULL DEFAULT 0,
        is_electronic INTEGER NOT NULL DEFAULT 0,
        status TEXT,
        organization_id INTEGER REFERENCES organizations(id),
        location_id INTEGER REFERENCES locations(id),
        pharmacy_id INTEGER REFERENCES pharmacies(id),
        prescriber_id INTEGER REFERENCES prescribers(id),
        drug_id INTEGER REFERENCES drugs(id),
        patient_id INTEGER REFERENCES patients(id),
        insurance_plan_id INTEGER REFERENCES insurance_plans(id),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS claims (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rx_number TEXT NOT NULL,
        date_written TEXT NOT NULL,
        date_filled TEXT NOT NULL,
        refill_number INTEGER NOT NULL,
        quantity_dispensed TEXT,
        days_supply INTEGER,
        ingredient_cost TEXT,
        dispensing_fee TEXT,
        patient_pay TEXT,
        plan_paid TEXT,
        total_paid TEXT,
        claim_status TEXT,
        is_340b INTEGER NOT NULL DEFAULT 0,
        organization_id INTEGER REFERENCES organizations(id),
        location_id INTEGER REFERENCES locations(id),
        pharmacy_id INTEGER REFERENCES pharmacies(id),
        prescriber_id INTEGER REFERENCES prescribers(id),
        drug_id INTEGER REFERENCES drugs(id),
        patient_id INTEGER REFERENCES patients(id),
        insurance_plan_id INTEGER REFERENCES insurance_plans(id),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_fill
        ON claims(rx_number, refill_number, date_filled, COALESCE(pharmacy_id, 0));
    CREATE INDEX IF NOT EXISTS idx_locations_organization ON locations(organization_id);
";

/// Local relational store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening store DB {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed enabling WAL journal")?;
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory store DB")?;
        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed initializing store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("store connection mutex poisoned".to_string()))
    }
}

impl BackingStore for SqliteStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }

    async fn bulk_read(&self, table: Table) -> Result<Vec<StoredRow>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {} ORDER BY id", table.name()))
            .map_err(|err| map_sqlite_error(table, err))?;
        let names = column_names(&stmt);
        let mut rows = stmt.query([]).map_err(|err| map_sqlite_error(table, err))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|err| map_sqlite_error(table, err))? {
            out.push(read_row(row, &names).map_err(|err| map_sqlite_error(table, err))?);
        }
        debug!(table = table.name(), rows = out.len(), "bulk read");
        Ok(out)
    }

    async fn bulk_insert(
        &self,
        table: Table,
        rows: &[StoredRow],
    ) -> Result<Vec<StoredRow>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| map_sqlite_error(table, err))?;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            let (columns, values) = split_row(row)?;
            let sql = format!("{} RETURNING *", insert_sql("INSERT", table, &columns));
            let mut stmt = tx
                .prepare_cached(&sql)
                .map_err(|err| map_sqlite_error(table, err))?;
            let names = column_names(&stmt);
            let stored = stmt
                .query_row(params_from_iter(values), |r| read_row(r, &names))
                .map_err(|err| map_sqlite_error(table, err))?;
            inserted.push(stored);
        }
        tx.commit().map_err(|err| map_sqlite_error(table, err))?;
        Ok(inserted)
    }

    async fn bulk_upsert(
        &self,
        table: Table,
        rows: &[StoredRow],
        conflict_key: Option<&[&str]>,
    ) -> Result<UpsertReport, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|err| map_sqlite_error(table, err))?;
        let mut inserted = 0usize;
        for row in rows {
            let (columns, values) = split_row(row)?;
            let sql = match conflict_key {
                Some(keys) => {
                    for key in keys {
                        check_identifier(key)?;
                    }
                    format!(
                        "{} ON CONFLICT({}) DO NOTHING",
                        insert_sql("INSERT", table, &columns),
                        keys.join(", ")
                    )
                }
                None => insert_sql("INSERT OR IGNORE", table, &columns),
            };
            let mut stmt = tx
                .prepare_cached(&sql)
                .map_err(|err| map_sqlite_error(table, err))?;
            inserted += stmt
                .execute(params_from_iter(values))
                .map_err(|err| map_sqlite_error(table, err))?;
        }
        tx.commit().map_err(|err| map_sqlite_error(table, err))?;
        Ok(UpsertReport { inserted })
    }
}

fn insert_sql(verb: &str, table: Table, columns: &[&str]) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{verb} INTO {} ({column_list}) VALUES ({placeholders})",
        table.name()
    )
}

fn check_identifier(column: &str) -> Result<(), StoreError> {
    let valid = !column.is_empty()
        && column
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Backend(format!("invalid column name {column:?}")))
    }
}

fn split_row(row: &StoredRow) -> Result<(Vec<&str>, Vec<SqlValue>), StoreError> {
    if row.is_empty() {
        return Err(StoreError::Backend("cannot insert an empty row".to_string()));
    }
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (column, value) in row {
        check_identifier(column)?;
        columns.push(column.as_str());
        values.push(to_sql_value(value));
    }
    Ok((columns, values))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => number
                .as_f64()
                .map(SqlValue::Real)
                .unwrap_or(SqlValue::Null),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(str::to_string).collect()
}

fn read_row(row: &Row<'_>, names: &[String]) -> rusqlite::Result<StoredRow> {
    let mut out = StoredRow::new();
    for (idx, name) in names.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(int) => Value::from(int),
            ValueRef::Real(real) => Number::from_f64(real)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn map_sqlite_error(table: Table, err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        let unique = code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY;
        if code.code == ErrorCode::ConstraintViolation && unique {
            return StoreError::Conflict {
                table: table.name(),
                message: message.clone().unwrap_or_else(|| err.to_string()),
            };
        }
        if matches!(
            code.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
        ) {
            return StoreError::Unavailable(err.to_string());
        }
    }
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> StoredRow {
        value.as_object().cloned().unwrap()
    }

    fn claim(rx: &str, refill: i64, pharmacy_id: Option<i64>) -> StoredRow {
        row(json!({
            "rx_number": rx,
            "date_written": "2024-01-02",
            "date_filled": "2024-01-05",
            "refill_number": refill,
            "pharmacy_id": pharmacy_id,
            "is_340b": false,
        }))
    }

    #[tokio::test]
    async fn insert_returns_generated_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let returned = store
            .bulk_insert(
                Table::Pharmacies,
                &[
                    row(json!({"name": "Main St Pharmacy", "npi": "1234567890"})),
                    row(json!({"name": "Elm Pharmacy", "npi": null})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(returned.len(), 2);
        assert_eq!(returned[0]["id"], json!(1));
        assert_eq!(returned[1]["name"], json!("Elm Pharmacy"));
        assert_eq!(store.bulk_read(Table::Pharmacies).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unique_violation_is_a_conflict_and_rolls_back_the_chunk() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .bulk_insert(
                Table::Pharmacies,
                &[
                    row(json!({"name": "A", "npi": "1234567890"})),
                    row(json!({"name": "B", "npi": "1234567890"})),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert!(store.bulk_read(Table::Pharmacies).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keyed_upsert_counts_only_new_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = vec![
            row(json!({"prescription_id": "P1", "prescribed_date": "2024-01-01"})),
            row(json!({"prescription_id": "P2", "prescribed_date": "2024-01-01"})),
        ];
        let first = store
            .bulk_upsert(Table::Prescriptions, &rows, Some(&["prescription_id"]))
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);
        let second = store
            .bulk_upsert(Table::Prescriptions, &rows, Some(&["prescription_id"]))
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
    }

    #[tokio::test]
    async fn claim_fill_constraint_treats_missing_pharmacy_as_one_value() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = vec![
            claim("RX1", 0, None),
            claim("RX1", 0, None),
            claim("RX1", 1, None),
            claim("RX1", 0, Some(4)),
        ];
        let report = store.bulk_upsert(Table::Claims, &rows, None).await.unwrap();
        assert_eq!(report.inserted, 3);
    }

    #[test]
    fn rejects_unsafe_column_names() {
        let bad = row(json!({"name; DROP TABLE drugs": "x"}));
        assert!(split_row(&bad).is_err());
    }
}
