//! Turns an input file into a [`RawTable`], whatever its format.

use anyhow::{Context, Result, bail};
use calamine::{Data, Reader, open_workbook_auto};
use duckdb::Connection;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use tracing::debug;

use crate::{
    common::{quote_ident, sql_escape_path},
    raw_row::{Cell, RawTable},
};

const DELIMITERS: [u8; 4] = [b',', b'\t', b'|', b';'];

pub fn read_table(path: &Path, sheet: Option<&str>) -> Result<RawTable> {
    if !path.exists() {
        bail!("Input file not found: {}", path.display());
    }
    let extension = path
        .extension()
        .and_then(|x| x.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "csv" | "tsv" | "txt" | "psv" => read_delimited(path),
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => read_workbook(path, sheet),
        "parquet" => read_parquet(path),
        _ => bail!(
            "Unsupported input extension for {}. Use .csv, .tsv, .txt, .psv, .xlsx, .xls, .xlsb, .ods or .parquet",
            path.display()
        ),
    }
}

/// The candidate delimiter that occurs most often in the header line; `,` wins ties.
pub fn detect_delimiter(header_line: &[u8]) -> u8 {
    let mut best = b',';
    let mut best_count = 0usize;
    for delimiter in DELIMITERS {
        let count = header_line.iter().filter(|b| **b == delimiter).count();
        if count > best_count {
            best = delimiter;
            best_count = count;
        }
    }
    best
}

fn read_delimited(path: &Path) -> Result<RawTable> {
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    let mut header_line = Vec::new();
    BufReader::new(file)
        .read_until(b'\n', &mut header_line)
        .with_context(|| format!("Failed reading header line of {}", path.display()))?;
    let delimiter = detect_delimiter(&header_line);
    let shown = (delimiter as char).escape_default().to_string();
    debug!(path = %path.display(), delimiter = %shown, "detected delimiter");

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed opening {}", path.display()))?;

    let headers = reader
        .byte_headers()
        .with_context(|| format!("Failed reading header row of {}", path.display()))?
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect::<Vec<_>>();
    let mut table = RawTable::from_headers(&headers);

    for (idx, record) in reader.byte_records().enumerate() {
        let record = record.with_context(|| {
            format!("Failed reading record {} of {}", idx + 1, path.display())
        })?;
        let line = record
            .position()
            .map(|pos| pos.line() as usize)
            .unwrap_or(idx + 2);
        let cells = record
            .iter()
            .map(|field| Cell::text(String::from_utf8_lossy(field).into_owned()))
            .collect();
        table.push_row(line, cells);
    }
    Ok(table)
}

fn read_workbook(path: &Path, sheet: Option<&str>) -> Result<RawTable> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed opening workbook {}", path.display()))?;
    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .with_context(|| format!("Workbook {} has no sheets", path.display()))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("Failed reading sheet '{sheet_name}' of {}", path.display()))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        bail!("Sheet '{sheet_name}' of {} is empty", path.display());
    };
    let mut table = RawTable::from_headers(header.iter().map(header_text));

    // Report 1-based sheet row numbers, counting rows above the used range.
    let first_row = range.start().map_or(0, |(row, _)| row as usize);
    for (idx, row) in rows.enumerate() {
        table.push_row(first_row + idx + 2, row.iter().map(cell_from_data).collect());
    }
    Ok(table)
}

fn header_text(data: &Data) -> String {
    match data {
        Data::String(s) => s.clone(),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::text(s.clone()),
        Data::Float(value) => Cell::Number(*value),
        Data::Int(value) => Cell::Number(*value as f64),
        Data::Bool(value) => Cell::Bool(*value),
        Data::DateTime(value) => Cell::Number(value.as_f64()),
    }
}

fn read_parquet(path: &Path) -> Result<RawTable> {
    let conn = Connection::open_in_memory().context("Failed opening in-memory DuckDB")?;
    let escaped = sql_escape_path(path);
    conn.execute_batch(&format!(
        "CREATE VIEW input_rows AS SELECT * FROM read_parquet('{escaped}')"
    ))
    .with_context(|| format!("Failed reading parquet {}", path.display()))?;

    let columns = load_column_names(&conn, "input_rows")?;
    if columns.is_empty() {
        bail!("Parquet file {} has no columns", path.display());
    }
    let select = columns
        .iter()
        .map(|c| format!("CAST({} AS VARCHAR)", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut stmt = conn
        .prepare(&format!("SELECT {select} FROM input_rows"))
        .context("Failed preparing parquet row query")?;
    let mut rows = stmt.query([]).context("Failed querying parquet rows")?;
    let mut table = RawTable::from_headers(&columns);
    let mut line = 1usize;
    while let Some(row) = rows.next().context("Failed iterating parquet rows")? {
        line += 1;
        let mut cells = Vec::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let value: Option<String> = row
                .get(idx)
                .with_context(|| format!("Failed reading column {column} of row {line}"))?;
            cells.push(value.map(Cell::text).unwrap_or(Cell::Empty));
        }
        table.push_row(line, cells);
    }
    Ok(table)
}

fn load_column_names(conn: &Connection, view_name: &str) -> Result<Vec<String>> {
    let query = format!("SELECT name FROM pragma_table_info('{view_name}') ORDER BY cid");
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed preparing DuckDB pragma_table_info for {view_name}"))?;
    let mut rows = stmt
        .query([])
        .with_context(|| format!("Failed querying DuckDB pragma_table_info for {view_name}"))?;
    let mut names = Vec::new();
    while let Some(row) = rows
        .next()
        .with_context(|| format!("Failed iterating pragma_table_info rows for {view_name}"))?
    {
        let name: String = row.get(0).context("Failed reading column name")?;
        names.push(name);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_date;
    use chrono::NaiveDate;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn delimiter_detection_prefers_the_most_frequent_candidate() {
        assert_eq!(detect_delimiter(b"Rx Number,Date Filled,NDC\n"), b',');
        assert_eq!(detect_delimiter(b"Rx Number\tDate Filled\tNDC\n"), b'\t');
        assert_eq!(detect_delimiter(b"Rx Number|Date Filled|Pharmacy Name, Inc\n"), b'|');
        assert_eq!(detect_delimiter(b"single column\n"), b',');
    }

    #[test]
    fn csv_rows_keep_source_line_numbers_and_tolerate_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "claims.csv",
            "\u{feff}Rx Number,Date Filled,Notes\nRX1,01/05/2024\n,,\nRX2,01/06/2024,late,extra\n",
        );
        let table = read_table(&path, None).unwrap();
        assert!(table.has_column("Rx Number"));
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].line(), 2);
        assert_eq!(table.rows[1].line(), 4);
        assert_eq!(table.rows[0].get("Notes"), Some(&Cell::Empty));
        assert_eq!(
            table.rows[1].get("Notes"),
            Some(&Cell::Text("late".to_string()))
        );
    }

    #[test]
    fn semicolon_files_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "rx.txt", "Prescription ID;Quantity\nP1;1,5\n");
        let table = read_table(&path, None).unwrap();
        assert_eq!(
            table.rows[0].get("Quantity"),
            Some(&Cell::Text("1,5".to_string()))
        );
    }

    #[test]
    fn unsupported_and_missing_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "claims.json", "[]");
        assert!(read_table(&path, None).is_err());
        assert!(read_table(&dir.path().join("missing.csv"), None).is_err());
    }

    #[test]
    fn parquet_columns_are_read_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.parquet");
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "COPY (SELECT 'RX9' AS \"Rx Number\", 3 AS \"Refill Number\", NULL::VARCHAR AS \"NDC\") \
             TO '{}' (FORMAT PARQUET)",
            sql_escape_path(&path)
        ))
        .unwrap();

        let table = read_table(&path, None).unwrap();
        let row = &table.rows[0];
        assert_eq!(row.line(), 2);
        assert_eq!(row.get("Refill Number"), Some(&Cell::Text("3".to_string())));
        assert_eq!(row.get("NDC"), Some(&Cell::Empty));
    }

    const SHEET_CLAIMS: &str = r#"<sheetData>
<row r="1"><c r="A1" t="inlineStr"><is><t>Rx Number</t></is></c><c r="B1" t="inlineStr"><is><t>Date Filled</t></is></c><c r="C1" t="inlineStr"><is><t>Refill Number</t></is></c></row>
<row r="2"><c r="A2" t="inlineStr"><is><t>RX1</t></is></c><c r="B2" s="1"><v>45296</v></c><c r="C2"><v>2</v></c></row>
<row r="3"><c r="A3" t="inlineStr"><is><t>RX2</t></is></c><c r="B3" t="inlineStr"><is><t>01/06/2024</t></is></c></row>
</sheetData>"#;

    const SHEET_OFFSET: &str = r#"<sheetData>
<row r="3"><c r="A3" t="inlineStr"><is><t>Prescription ID</t></is></c></row>
<row r="4"><c r="A4" t="inlineStr"><is><t>P1</t></is></c></row>
</sheetData>"#;

    /// Writes a minimal .xlsx with one worksheet per `(name, sheetData)` pair.
    fn write_xlsx(
        dir: &tempfile::TempDir,
        name: &str,
        sheets: &[(&str, &str)],
    ) -> std::path::PathBuf {
        use zip::write::SimpleFileOptions;

        let path = dir.path().join(name);
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let mut put = |entry: &str, body: String| {
            zip.start_file(entry, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        };

        let mut overrides = String::new();
        let mut sheet_list = String::new();
        let mut rels = String::new();
        for (idx, (sheet, _)) in sheets.iter().enumerate() {
            let n = idx + 1;
            overrides.push_str(&format!(
                r#"<Override PartName="/xl/worksheets/sheet{n}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
            ));
            sheet_list.push_str(&format!(
                r#"<sheet name="{sheet}" sheetId="{n}" r:id="rId{n}"/>"#
            ));
            rels.push_str(&format!(
                r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
            ));
        }
        let styles_id = sheets.len() + 1;
        rels.push_str(&format!(
            r#"<Relationship Id="rId{styles_id}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#
        ));

        put(
            "[Content_Types].xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>{overrides}</Types>"#
            ),
        );
        put(
            "_rels/.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#
                .to_string(),
        );
        put(
            "xl/workbook.xml",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{sheet_list}</sheets></workbook>"#
            ),
        );
        put(
            "xl/_rels/workbook.xml.rels",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{rels}</Relationships>"#
            ),
        );
        // Style 1 is built-in number format 14 (m/d/yyyy).
        put(
            "xl/styles.xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><cellXfs count="2"><xf numFmtId="0"/><xf numFmtId="14" applyNumberFormat="1"/></cellXfs></styleSheet>"#
                .to_string(),
        );
        for (idx, (_, data)) in sheets.iter().enumerate() {
            put(
                &format!("xl/worksheets/sheet{}.xml", idx + 1),
                format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">{data}</worksheet>"#
                ),
            );
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn workbook_rows_are_read_from_the_first_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let sheets = [("Claims", SHEET_CLAIMS), ("Other", SHEET_OFFSET)];
        let path = write_xlsx(&dir, "claims.xlsx", &sheets);

        let table = read_table(&path, None).unwrap();
        assert!(table.has_column("Rx Number"));
        assert!(table.has_column("Date Filled"));
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].line(), 2);
        assert_eq!(table.rows[1].line(), 3);

        let first = &table.rows[0];
        assert_eq!(first.get("Rx Number"), Some(&Cell::Text("RX1".to_string())));
        assert_eq!(first.get("Date Filled"), Some(&Cell::Number(45296.0)));
        assert_eq!(
            normalize_date(first.get("Date Filled")),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(first.get("Refill Number"), Some(&Cell::Number(2.0)));
        assert_eq!(
            normalize_date(table.rows[1].get("Date Filled")),
            NaiveDate::from_ymd_opt(2024, 1, 6)
        );
        assert_eq!(table.rows[1].get("Refill Number"), Some(&Cell::Empty));
    }

    #[test]
    fn named_sheet_line_numbers_count_rows_above_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let sheets = [("Claims", SHEET_CLAIMS), ("Other", SHEET_OFFSET)];
        let path = write_xlsx(&dir, "rx.xlsx", &sheets);

        let table = read_table(&path, Some("Other")).unwrap();
        assert!(table.has_column("Prescription ID"));
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].line(), 4);
        assert!(read_table(&path, Some("Missing")).is_err());
    }
}
