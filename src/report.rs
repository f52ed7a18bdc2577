use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, StringBuilder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use csv::Writer;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::{basic::Compression, file::properties::WriterProperties};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    sync::Arc,
};

use crate::{
    common::{ensure_parent_dir, tmp_path_for},
    summary::{ImportError, ImportSummary},
};

const REPORT_COLUMNS: [&str; 5] = ["category", "line", "entity_kind", "chunk", "message"];

type ReportRow = [Option<String>; 5];

fn report_row(error: &ImportError) -> ReportRow {
    let chunk = match error {
        ImportError::ChunkSkipped { chunk, .. } | ImportError::ChunkLoadFailed { chunk, .. } => {
            Some(chunk.to_string())
        }
        _ => None,
    };
    [
        Some(error.category().to_string()),
        error.line().map(|line| line.to_string()),
        error.entity_kind().map(|kind| kind.to_string()),
        chunk,
        Some(error.to_string()),
    ]
}

/// Writes every error in the summary to `path`, as Parquet when the extension
/// says so and CSV otherwise. Returns the number of rows written.
pub fn write_error_report(summary: &ImportSummary, path: &Path) -> Result<usize> {
    let rows: Vec<ReportRow> = summary.errors.iter().map(report_row).collect();
    let is_parquet = path
        .extension()
        .and_then(|x| x.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));
    if is_parquet {
        write_parquet(path, &rows)?;
    } else {
        write_csv(path, &rows)?;
    }
    Ok(rows.len())
}

fn write_csv(path: &Path, rows: &[ReportRow]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path, "import_errors.csv");
    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating temp error report {}", tmp_path.display()))?;
    writer
        .write_record(REPORT_COLUMNS)
        .context("Failed writing error report header")?;
    for row in rows {
        writer
            .write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))
            .context("Failed writing error report row")?;
    }
    writer
        .flush()
        .context("Failed flushing error report writer")?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed moving temp error report {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

fn write_parquet(path: &Path, rows: &[ReportRow]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path, "import_errors.parquet");

    let fields: Vec<Field> = REPORT_COLUMNS
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, Arc::clone(&schema), Some(props))
        .context("Failed creating Parquet ArrowWriter")?;

    let mut builders: Vec<StringBuilder> =
        (0..REPORT_COLUMNS.len()).map(|_| StringBuilder::new()).collect();
    for row in rows {
        for (builder, value) in builders.iter_mut().zip(row) {
            match value {
                Some(v) => builder.append_value(v),
                None => builder.append_null(),
            }
        }
    }
    let arrays: Vec<ArrayRef> = builders
        .iter_mut()
        .map(|b| Arc::new(b.finish()) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(Arc::clone(&schema), arrays)
        .context("Failed creating RecordBatch for error report")?;
    writer
        .write(&batch)
        .context("Failed writing error report RecordBatch")?;
    writer
        .close()
        .context("Failed closing Parquet writer")?;

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed moving temp parquet {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn write_summary_json(summary: &ImportSummary, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path, "import_summary.json");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, summary)
        .context("Failed writing import summary JSON")?;
    out.flush().context("Failed flushing import summary JSON")?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed moving temp summary {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;
    use crate::parser::{SkipReason, SkippedRow};
    use crate::records::RecordKind;
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn summary() -> ImportSummary {
        let mut summary = ImportSummary::new(RecordKind::Claims);
        summary.record_skip(SkippedRow {
            line: 3,
            reason: SkipReason::MissingRequired {
                column: "Rx Number",
            },
        });
        summary.errors.push(ImportError::StageFatal {
            kind: EntityKind::Organization,
            message: "store unavailable".to_string(),
        });
        summary
    }

    #[test]
    fn csv_report_lists_every_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("errors.csv");
        assert_eq!(write_error_report(&summary(), &path).unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(&rows[0][0], "row_skipped");
        assert_eq!(&rows[0][1], "3");
        assert_eq!(&rows[1][2], "organization");
        assert!(!path.with_file_name("errors.csv.tmp").exists());
    }

    #[test]
    fn parquet_report_has_one_row_per_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.parquet");
        write_error_report(&summary(), &path).unwrap();

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }

    #[test]
    fn summary_json_round_trips_through_serde() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        write_summary_json(&summary(), &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(value["records_skipped"], 1);
        assert_eq!(value["errors"][1]["category"], "stage_fatal");
    }
}
