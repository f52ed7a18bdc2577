use std::sync::Arc;

/// One untyped cell as it came out of the source file.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Cell::Empty
        } else {
            Cell::Text(value)
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(text) => text.trim().is_empty(),
            Cell::Number(value) => value.is_nan(),
            Cell::Bool(_) => false,
        }
    }

    /// Renders the cell for diagnostics (skip reasons, logs).
    pub fn display_value(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(text) => text.trim().to_string(),
            Cell::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                format!("{}", *value as i64)
            }
            Cell::Number(value) => value.to_string(),
            Cell::Bool(value) => value.to_string(),
        }
    }
}

/// A source row keyed by column name.
///
/// Headers are shared between all rows of a table. Lookups are total: a
/// column that is not in the file yields `None`, a column that is present but
/// blank yields `Some(&Cell::Empty)` (or blank text).
#[derive(Debug, Clone)]
pub struct RawRow {
    line: usize,
    headers: Arc<[String]>,
    cells: Vec<Cell>,
}

impl RawRow {
    pub fn new(line: usize, headers: Arc<[String]>, mut cells: Vec<Cell>) -> Self {
        cells.resize(headers.len(), Cell::Empty);
        Self {
            line,
            headers,
            cells,
        }
    }

    /// 1-based line (or spreadsheet row) number in the source file.
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.headers
            .iter()
            .position(|header| header == column)
            .and_then(|idx| self.cells.get(idx))
    }
}

#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: Arc<[String]>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    /// Builds a table from header names, cleaning them up the same way for every
    /// input format.
    pub fn from_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let headers: Vec<String> = headers
            .into_iter()
            .map(|header| clean_header(header.as_ref()))
            .collect();
        Self {
            headers: headers.into(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, line: usize, cells: Vec<Cell>) {
        if cells.iter().all(Cell::is_blank) {
            return;
        }
        self.rows
            .push(RawRow::new(line, Arc::clone(&self.headers), cells));
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|header| header == column)
    }
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RawTable {
        let mut table = RawTable::from_headers(["\u{feff}Rx Number", " Date Filled ", "Notes"]);
        table.push_row(2, vec![Cell::text("RX1"), Cell::Number(45292.0)]);
        table.push_row(3, vec![Cell::Empty, Cell::text("  "), Cell::Empty]);
        table
    }

    #[test]
    fn headers_are_trimmed_and_bom_stripped() {
        let table = table();
        assert!(table.has_column("Rx Number"));
        assert!(table.has_column("Date Filled"));
    }

    #[test]
    fn fully_blank_rows_are_dropped() {
        assert_eq!(table().rows.len(), 1);
    }

    #[test]
    fn lookup_distinguishes_absent_from_blank() {
        let table = table();
        let row = &table.rows[0];
        assert_eq!(row.get("Rx Number"), Some(&Cell::Text("RX1".to_string())));
        assert_eq!(row.get("Notes"), Some(&Cell::Empty));
        assert_eq!(row.get("rx number"), None);
        assert_eq!(row.get("Pharmacy Name"), None);
        assert_eq!(row.line(), 2);
    }

    #[test]
    fn display_value_renders_integral_numbers_without_fraction() {
        assert_eq!(Cell::Number(45292.0).display_value(), "45292");
        assert_eq!(Cell::Number(1.5).display_value(), "1.5");
    }
}
