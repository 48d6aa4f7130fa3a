// Primitives for reading CSV files.

use crate::calage::io_common::{parse_cell, Cell, RawTable};
use crate::calage::*;
use snafu::prelude::*;

/// Reads a survey table with a header row.
pub fn read_csv_table(path: &str) -> CalageResult<RawTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .context(CsvOpenSnafu { path })?;
    let header: Vec<String> = rdr
        .headers()
        .context(CsvLineParseSnafu {})?
        .iter()
        .map(|s| s.trim().to_string())
        .collect();
    let mut rows: Vec<Vec<Cell>> = Vec::new();
    for line_r in rdr.records() {
        let line = line_r.context(CsvLineParseSnafu {})?;
        rows.push(line.iter().map(parse_cell).collect());
    }
    debug!(
        "read_csv_table: {}: {} columns, {} rows",
        path,
        header.len(),
        rows.len()
    );
    Ok(RawTable { header, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn households_file() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/households.csv");
        let raw = read_csv_table(path).unwrap();
        assert_eq!(raw.header[0], "idmen");
        assert_eq!(raw.rows.len(), 7);
        assert_eq!(raw.rows[0][0], Cell::Text("h1".to_string()));
        assert_eq!(raw.rows[0][2], Cell::Number(10.0));
    }

    #[test]
    fn missing_file() {
        let res = read_csv_table("/nonexistent/households.csv");
        assert!(matches!(res, Err(CalageError::CsvOpen { .. })));
    }
}
