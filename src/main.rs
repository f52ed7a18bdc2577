mod args;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::ProgressBar;
use std::{
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use args::{Args, StoreBackend};
use rx_claims_loader::{
    common::{delete_if_exists, install_ctrlc_handler, project_root},
    constants::DEFAULT_SQLITE_DB_FILE,
    pipeline::import_file,
    progress::TerminalProgress,
    report::{write_error_report, write_summary_json},
    rest_store::RestStore,
    sqlite_store::SqliteStore,
    store::BackingStore,
    summary::{ImportSummary, RunStatus},
};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cancel = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(Arc::clone(&cancel));

    let summary = match args.store {
        StoreBackend::Sqlite => {
            let db_path = args
                .sqlite_db
                .clone()
                .unwrap_or_else(|| project_root().join("data").join(DEFAULT_SQLITE_DB_FILE));
            if args.reset_db {
                for suffix in ["", "-wal", "-shm"] {
                    let mut file = db_path.clone().into_os_string();
                    file.push(suffix);
                    delete_if_exists(&PathBuf::from(file))?;
                }
                println!("Reset SQLite database {}", db_path.display());
            }
            let store = SqliteStore::open(&db_path)?;
            println!("Using SQLite store {}", db_path.display());
            run(&store, &args, &cancel).await?
        }
        StoreBackend::Rest => {
            let Some(url) = args.rest_url.as_deref() else {
                bail!("--rest-url is required with --store rest");
            };
            let store = RestStore::new(
                url,
                args.rest_api_key.clone(),
                args.max_retries,
                Duration::from_secs(args.request_timeout_secs),
            )?;
            println!("Using HTTP store {url}");
            run(&store, &args, &cancel).await?
        }
    };

    print_summary(&summary);

    if let Some(path) = &args.error_report {
        let written = write_error_report(&summary, path)
            .with_context(|| format!("Failed writing error report {}", path.display()))?;
        println!("Wrote {written} errors to {}", path.display());
    }
    if let Some(path) = &args.summary_json {
        write_summary_json(&summary, path)?;
        println!("Wrote summary {}", path.display());
    }

    if summary.status == RunStatus::Failed {
        bail!("Import of {} failed", args.input.display());
    }
    Ok(())
}

async fn run<S: BackingStore>(store: &S, args: &Args, cancel: &AtomicBool) -> Result<ImportSummary> {
    let bar = ProgressBar::new(100);
    let summary = import_file(
        store,
        args.kind,
        &args.input,
        args.sheet.as_deref(),
        &args.import_options(),
        TerminalProgress::new(bar.clone()),
        cancel,
    )
    .await;
    bar.finish_and_clear();
    summary
}

fn print_summary(summary: &ImportSummary) {
    println!(
        "Imported {} of {} {} rows ({} skipped, {} failed, {} not attempted) in {} ms",
        summary.records_imported,
        summary.total_records,
        summary.record_kind,
        summary.records_skipped,
        summary.records_failed,
        summary.records_unattempted,
        summary.elapsed_ms
    );
    for (reason, count) in &summary.skip_reasons {
        println!("  skipped {count}: {reason}");
    }
    for (kind, counts) in &summary.entities {
        println!(
            "  {kind}: {} candidates, {} matched, {} created",
            counts.candidates, counts.matched, counts.created
        );
    }
    if !summary.errors.is_empty() {
        println!("  {} errors recorded", summary.errors.len());
    }
}
