pub const DEFAULT_SQLITE_DB_FILE: &str = "rx_claims.sqlite";
pub const DEFAULT_API_KEY_ENV: &str = "RX_LOADER_API_KEY";
pub const USER_AGENT: &str = "rx-claims-loader/0.1";

/// Fact rows per bulk upsert call.
pub const DEFAULT_FACT_CHUNK_SIZE: usize = 500;
/// Reference entities per bulk insert call.
pub const DEFAULT_ENTITY_CHUNK_SIZE: usize = 500;
/// Rows fetched per page when reading a reference table over HTTP.
pub const REST_READ_PAGE_SIZE: usize = 1000;

pub const DEFAULT_PROGRESS_INTERVAL: usize = 250;
pub const MIN_PROGRESS_INTERVAL: usize = 100;
pub const MAX_PROGRESS_INTERVAL: usize = 500;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const MAX_RETRY_BACKOFF_SECS: u64 = 60;

// Overall progress is split into fixed stage ranges (percent).
pub const PARSE_STAGE_START: f64 = 0.0;
pub const PARSE_STAGE_WEIGHT: f64 = 20.0;
pub const REFERENCE_STAGE_START: f64 = 20.0;
pub const REFERENCE_STAGE_WEIGHT: f64 = 40.0;
pub const BUILD_STAGE_START: f64 = 60.0;
pub const BUILD_STAGE_WEIGHT: f64 = 5.0;
pub const LOAD_STAGE_START: f64 = 65.0;
pub const LOAD_STAGE_WEIGHT: f64 = 35.0;

/// Spreadsheet (1900 date system) serial day 0.
pub const SERIAL_DATE_EPOCH: (i32, u32, u32) = (1899, 12, 30);
pub const SERIAL_DATE_MIN: i64 = 1;
pub const SERIAL_DATE_MAX: i64 = 2_958_465;
/// Two-digit years below this are 20xx, the rest 19xx.
pub const TWO_DIGIT_YEAR_PIVOT: i32 = 70;
