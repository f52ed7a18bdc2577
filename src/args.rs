use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use rx_claims_loader::{
    constants::{
        DEFAULT_API_KEY_ENV, DEFAULT_ENTITY_CHUNK_SIZE, DEFAULT_FACT_CHUNK_SIZE,
        DEFAULT_MAX_RETRIES, DEFAULT_PROGRESS_INTERVAL, DEFAULT_REQUEST_TIMEOUT_SECS,
    },
    pipeline::ImportOptions,
    records::RecordKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Local SQLite database.
    Sqlite,
    /// PostgREST-compatible HTTP API.
    Rest,
}

#[derive(Debug, Parser)]
#[command(name = "rx_claims_loader")]
#[command(about = "Load prescription and pharmacy-claim extracts into a normalized store")]
pub struct Args {
    /// Input file (.csv, .tsv, .txt, .psv, .xlsx, .xls, .xlsb, .ods or .parquet).
    #[arg(long)]
    pub input: PathBuf,

    /// Which schema the input follows.
    #[arg(long, value_enum)]
    pub kind: RecordKind,

    /// Worksheet to read from a workbook. Defaults to the first sheet.
    #[arg(long)]
    pub sheet: Option<String>,

    /// Backing store to load into.
    #[arg(long, value_enum, default_value_t = StoreBackend::Sqlite)]
    pub store: StoreBackend,

    /// SQLite database path. Defaults to data/rx_claims.sqlite.
    #[arg(long)]
    pub sqlite_db: Option<PathBuf>,

    /// Delete the SQLite database before importing.
    #[arg(long, default_value_t = false)]
    pub reset_db: bool,

    /// Base URL of the HTTP store, e.g. http://localhost:3000.
    #[arg(long)]
    pub rest_url: Option<String>,

    /// API key sent as `apikey` and bearer token to the HTTP store.
    #[arg(long, env = DEFAULT_API_KEY_ENV, hide_env_values = true)]
    pub rest_api_key: Option<String>,

    /// Fact rows per bulk upsert.
    #[arg(long, default_value_t = DEFAULT_FACT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Reference entities per bulk insert.
    #[arg(long, default_value_t = DEFAULT_ENTITY_CHUNK_SIZE)]
    pub entity_chunk_size: usize,

    /// Rows between progress updates (clamped to 100..=500).
    #[arg(long, default_value_t = DEFAULT_PROGRESS_INTERVAL)]
    pub progress_every: usize,

    /// Max attempts for transient HTTP store failures.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Per-request timeout for the HTTP store.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    /// Write row and stage errors here (.csv or .parquet).
    #[arg(long)]
    pub error_report: Option<PathBuf>,

    /// Write the import summary here as JSON.
    #[arg(long)]
    pub summary_json: Option<PathBuf>,
}

impl Args {
    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            fact_chunk_size: self.chunk_size.max(1),
            entity_chunk_size: self.entity_chunk_size.max(1),
            progress_interval: self.progress_every,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_come_from_constants() {
        let args = Args::try_parse_from([
            "rx_claims_loader",
            "--input",
            "claims.csv",
            "--kind",
            "claims",
        ])
        .unwrap();
        assert_eq!(args.kind, RecordKind::Claims);
        assert_eq!(args.store, StoreBackend::Sqlite);
        let options = args.import_options();
        assert_eq!(options.fact_chunk_size, DEFAULT_FACT_CHUNK_SIZE);
        assert_eq!(options.progress_interval, DEFAULT_PROGRESS_INTERVAL);
    }

    #[test]
    fn zero_chunk_sizes_are_raised_to_one() {
        let args = Args::try_parse_from([
            "rx_claims_loader",
            "--input",
            "rx.xlsx",
            "--kind",
            "prescriptions",
            "--store",
            "rest",
            "--rest-url",
            "http://localhost:3000",
            "--chunk-size",
            "0",
            "--entity-chunk-size",
            "0",
        ])
        .unwrap();
        assert_eq!(args.store, StoreBackend::Rest);
        let options = args.import_options();
        assert_eq!((options.fact_chunk_size, options.entity_chunk_size), (1, 1));
    }
}
