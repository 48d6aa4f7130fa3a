// Primitives for reading Excel files.

use calamine::{open_workbook, DataType, Reader, Xlsx};

use crate::calage::io_common::{parse_cell, Cell, RawTable};
use crate::calage::*;
use snafu::prelude::*;

/// Reads a survey table from a worksheet (by default the first one). The
/// first row is the header.
pub fn read_excel_table(path: &str, worksheet_name: Option<&str>) -> CalageResult<RawTable> {
    let mut workbook: Xlsx<_> = open_workbook(path).context(OpeningExcelSnafu { path })?;
    let wrange = match worksheet_name {
        Some(name) => workbook.worksheet_range(name),
        None => workbook.worksheet_range_at(0),
    }
    .context(EmptyExcelSnafu { path })?
    .context(OpeningExcelSnafu { path })?;
    let raw = raw_table_from_rows(wrange.rows())?;
    debug!(
        "read_excel_table: {}: {} columns, {} rows",
        path,
        raw.header.len(),
        raw.rows.len()
    );
    Ok(raw)
}

pub fn raw_table_from_rows<'a>(
    mut rows: impl Iterator<Item = &'a [DataType]>,
) -> CalageResult<RawTable> {
    let header_row = rows.next().context(EmptyExcelSnafu { path: "" })?;
    let header: Vec<String> = header_row
        .iter()
        .map(|c| c.to_string().trim().to_string())
        .collect();
    debug!("raw_table_from_rows: header: {:?}", header);

    let mut res: Vec<Vec<Cell>> = Vec::new();
    for (idx, row) in rows.enumerate() {
        let mut cells: Vec<Cell> = Vec::with_capacity(row.len());
        for elt in row.iter() {
            cells.push(read_cell(elt, idx + 2)?);
        }
        res.push(cells);
    }
    Ok(RawTable { header, rows: res })
}

fn read_cell(cell: &DataType, lineno: usize) -> CalageResult<Cell> {
    match cell {
        DataType::Int(i) => Ok(Cell::Number(*i as f64)),
        DataType::Float(f) => Ok(Cell::Number(*f)),
        // Dates are kept as Excel serial numbers.
        DataType::DateTime(f) => Ok(Cell::Number(*f)),
        DataType::Bool(b) => Ok(Cell::Number(if *b { 1.0 } else { 0.0 })),
        DataType::String(s) => Ok(parse_cell(s)),
        DataType::Empty => Ok(Cell::Empty),
        _ => ExcelWrongCellTypeSnafu {
            lineno,
            content: format!("{:?}", cell),
        }
        .fail(),
    }
}
