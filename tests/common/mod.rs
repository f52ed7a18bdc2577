#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use rx_claims_loader::{
    sqlite_store::SqliteStore,
    store::{BackingStore, StoreError, StoredRow, Table, UpsertReport},
};

/// Wraps an in-memory SQLite store and injects failures on request.
pub struct FaultyStore {
    pub inner: SqliteStore,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Faults {
    unhealthy: bool,
    failing_reads: HashSet<Table>,
    failing_inserts: HashSet<Table>,
    /// Tables whose next insert loses a race: its first row is written by
    /// "another writer" and the call reports a conflict.
    racing_inserts: HashSet<Table>,
    /// 1-based upsert call numbers that fail outright.
    failing_upserts: HashSet<usize>,
    /// 1-based upsert call numbers rejected as a whole-request conflict.
    conflicting_upserts: HashSet<usize>,
    cancel_after_upserts: Option<(usize, Arc<AtomicBool>)>,
    upsert_calls: usize,
    insert_calls: HashMap<Table, usize>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn unhealthy(self) -> Self {
        self.faults.lock().unwrap().unhealthy = true;
        self
    }

    pub fn failing_read(self, table: Table) -> Self {
        self.faults.lock().unwrap().failing_reads.insert(table);
        self
    }

    pub fn failing_insert(self, table: Table) -> Self {
        self.faults.lock().unwrap().failing_inserts.insert(table);
        self
    }

    pub fn racing_insert(self, table: Table) -> Self {
        self.faults.lock().unwrap().racing_inserts.insert(table);
        self
    }

    pub fn failing_upsert(self, call: usize) -> Self {
        self.faults.lock().unwrap().failing_upserts.insert(call);
        self
    }

    pub fn conflicting_upsert(self, call: usize) -> Self {
        self.faults.lock().unwrap().conflicting_upserts.insert(call);
        self
    }

    pub fn cancel_after_upserts(self, calls: usize, flag: Arc<AtomicBool>) -> Self {
        self.faults.lock().unwrap().cancel_after_upserts = Some((calls, flag));
        self
    }

    /// Lets inserts into `table` succeed again.
    pub fn recover_insert(&self, table: Table) {
        self.faults.lock().unwrap().failing_inserts.remove(&table);
    }

    pub fn insert_calls(&self, table: Table) -> usize {
        let faults = self.faults.lock().unwrap();
        faults.insert_calls.get(&table).copied().unwrap_or(0)
    }

    pub async fn rows(&self, table: Table) -> Vec<StoredRow> {
        self.inner.bulk_read(table).await.unwrap()
    }
}

impl BackingStore for FaultyStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        if self.faults.lock().unwrap().unhealthy {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.health_check().await
    }

    async fn bulk_read(&self, table: Table) -> Result<Vec<StoredRow>, StoreError> {
        if self.faults.lock().unwrap().failing_reads.contains(&table) {
            return Err(StoreError::Unavailable(format!("{table} read timed out")));
        }
        self.inner.bulk_read(table).await
    }

    async fn bulk_insert(
        &self,
        table: Table,
        rows: &[StoredRow],
    ) -> Result<Vec<StoredRow>, StoreError> {
        let (fail, race) = {
            let mut faults = self.faults.lock().unwrap();
            *faults.insert_calls.entry(table).or_default() += 1;
            (
                faults.failing_inserts.contains(&table),
                faults.racing_inserts.remove(&table),
            )
        };
        if fail {
            return Err(StoreError::Backend(format!("{table} insert rejected")));
        }
        if race && !rows.is_empty() {
            self.inner.bulk_insert(table, &rows[..1]).await?;
            return Err(StoreError::Conflict {
                table: table.name(),
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }
        self.inner.bulk_insert(table, rows).await
    }

    async fn bulk_upsert(
        &self,
        table: Table,
        rows: &[StoredRow],
        conflict_key: Option<&[&str]>,
    ) -> Result<UpsertReport, StoreError> {
        let (call, fail, conflict) = {
            let mut faults = self.faults.lock().unwrap();
            faults.upsert_calls += 1;
            let call = faults.upsert_calls;
            if let Some((after, flag)) = &faults.cancel_after_upserts {
                if call >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            (
                call,
                faults.failing_upserts.contains(&call),
                faults.conflicting_upserts.contains(&call),
            )
        };
        if fail {
            return Err(StoreError::Unavailable(format!("upsert call {call} timed out")));
        }
        if conflict {
            return Err(StoreError::Conflict {
                table: table.name(),
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }
        self.inner.bulk_upsert(table, rows, conflict_key).await
    }
}

pub const CLAIM_HEADER: &str = "Rx Number,Date Written,Date Filled,Refill Number,\
Pharmacy Name,Pharmacy NPI,NDC,Drug Name,Patient ID,Patient Last Name,Patient First Name,\
Organization,Location,Location Address,Ingredient Cost,BIN,PCN,Group";

pub const PRESCRIPTION_HEADER: &str = "Prescription ID,Date Prescribed,Patient Last Name,\
Patient First Name,Patient DOB,Prescriber NPI,Prescriber Last Name,NDC,Drug Name,Quantity,\
Controlled Substance,Organization,Location";

/// A claim row with `CLAIM_HEADER` columns; `rx` makes it unique.
pub fn claim_line(rx: usize, pharmacy: &str, npi: &str) -> String {
    format!(
        "RX{rx},1/2/2024,1/5/2024,0,{pharmacy},{npi},0002-3227-30,Amoxicillin,\
P{rx},Doe,Jane,Acme Health,Downtown,1 Main St,12.50,004336,ADV,G1"
    )
}

pub fn prescription_line(id: usize) -> String {
    format!(
        "RX-{id},3/14/2024,Doe,Jane,7/4/1980,1234567893,Smith,0002-3227-30,Amoxicillin,30,No,\
Acme Health,Downtown"
    )
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn csv(&self, name: &str, header: &str, lines: &[String]) -> PathBuf {
        let path = self.dir.path().join(name);
        let mut contents = String::from(header);
        contents.push('\n');
        for line in lines {
            contents.push_str(line);
            contents.push('\n');
        }
        fs::write(&path, contents).unwrap();
        path
    }
}
