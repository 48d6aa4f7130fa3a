// Conversion of the raw survey files into the tables of the calibration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use calmar::datatable::{DataTable, SurveyData, HEAD};

use crate::calage::config_reader::TableSource;
use crate::calage::*;
use snafu::prelude::*;

#[derive(PartialEq, Debug, Clone)]
pub enum Cell {
    Number(f64),
    Text(String),
    Empty,
}

/// The content of a survey file: a header and one row per individual.
#[derive(PartialEq, Debug, Clone)]
pub struct RawTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// A survey table, with the identifier of each household unit.
#[derive(PartialEq, Debug, Clone)]
pub struct SurveyTable {
    pub table: DataTable,
    pub household_ids: Vec<String>,
}

impl SurveyTable {
    /// Puts the household units in the order of `household_ids`. Both tables
    /// must hold the same households.
    pub fn align_to(
        &mut self,
        household_ids: &[String],
        file: &str,
        reference_file: &str,
    ) -> CalageResult<()> {
        let position: HashMap<&str, usize> = household_ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.as_str(), idx))
            .collect();
        let mut new_units: Vec<usize> = Vec::with_capacity(self.household_ids.len());
        for id in self.household_ids.iter() {
            let unit = position.get(id.as_str()).context(UnmatchedHouseholdSnafu {
                id: id.clone(),
                file,
            })?;
            new_units.push(*unit);
        }
        let present: HashSet<&str> = self.household_ids.iter().map(|s| s.as_str()).collect();
        if let Some(id) = household_ids.iter().find(|id| !present.contains(id.as_str())) {
            return UnmatchedHouseholdSnafu {
                id: id.clone(),
                file: reference_file,
            }
            .fail();
        }
        self.table.renumber_units(&new_units).context(TableSnafu {})?;
        self.household_ids = household_ids.to_vec();
        Ok(())
    }
}

pub fn simplify_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Resolves the path of a file relative to the directory of the configuration.
pub fn resolve_path(root: Option<&Path>, file_path: &str) -> String {
    match root {
        Some(r) if Path::new(file_path).is_relative() => {
            r.join(file_path).as_path().display().to_string()
        }
        _ => file_path.to_string(),
    }
}

/// Reads a text cell. Booleans are read as 0 or 1.
pub fn parse_cell(s: &str) -> Cell {
    let s = s.trim();
    if s.is_empty() {
        return Cell::Empty;
    }
    if let Ok(f) = s.parse::<f64>() {
        return Cell::Number(f);
    }
    match s {
        "True" | "true" | "TRUE" => Cell::Number(1.0),
        "False" | "false" | "FALSE" => Cell::Number(0.0),
        _ => Cell::Text(s.to_string()),
    }
}

fn cell_to_id(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Text(s) => Some(s.clone()),
        Cell::Number(f) if f.fract() == 0.0 => Some(format!("{}", *f as i64)),
        Cell::Number(f) => Some(f.to_string()),
        Cell::Empty => None,
    }
}

fn column_index(raw: &RawTable, column: &str) -> CalageResult<usize> {
    raw.header
        .iter()
        .position(|h| h == column)
        .context(MissingColumnSnafu { column })
}

/// Builds the survey table. Declared columns must be numeric. Undeclared
/// columns are numeric variables, unless they contain text, in which case
/// they are ignored.
pub fn assemble_table(
    raw: &RawTable,
    source: &TableSource,
    metas: &BTreeMap<String, ColumnMeta>,
) -> CalageResult<SurveyTable> {
    // Line 1 is the header.
    let lineno = |idx: usize| idx + 2;

    let hh_idx = match &source.household_column {
        Some(c) => Some(column_index(raw, c)?),
        None => None,
    };
    let role_idx = match &source.role_column {
        Some(c) => Some(column_index(raw, c)?),
        None => None,
    };

    let mut ids: Vec<String> = Vec::with_capacity(raw.rows.len());
    let mut roles: Vec<u32> = Vec::with_capacity(raw.rows.len());
    for (idx, row) in raw.rows.iter().enumerate() {
        let id = match hh_idx {
            Some(i) => row
                .get(i)
                .and_then(cell_to_id)
                .context(CellValueSnafu {
                    column: raw.header[i].clone(),
                    lineno: lineno(idx),
                    content: format!("{:?}", row.get(i)),
                })?,
            None => format!("{:08}", idx),
        };
        let role = match role_idx {
            Some(i) => match row.get(i) {
                Some(Cell::Number(f)) if *f >= 0.0 && f.fract() == 0.0 => *f as u32,
                c => {
                    return CellValueSnafu {
                        column: raw.header[i].clone(),
                        lineno: lineno(idx),
                        content: format!("{:?}", c),
                    }
                    .fail();
                }
            },
            None => HEAD,
        };
        ids.push(id);
        roles.push(role);
    }

    let mut table = DataTable::from_households(&ids, &roles).context(TableSnafu {})?;
    let skipped: HashSet<Option<usize>> = [hh_idx, role_idx].iter().cloned().collect();
    for (col_idx, name) in raw.header.iter().enumerate() {
        if skipped.contains(&Some(col_idx)) {
            continue;
        }
        let declared = metas.get(name);
        let mut values: Vec<f64> = Vec::with_capacity(raw.rows.len());
        let mut num_empty = 0;
        let mut text: Option<(usize, String)> = None;
        for (idx, row) in raw.rows.iter().enumerate() {
            match row.get(col_idx) {
                Some(Cell::Number(f)) => values.push(*f),
                Some(Cell::Empty) | None => {
                    num_empty += 1;
                    values.push(0.0);
                }
                Some(Cell::Text(s)) => {
                    text = Some((idx, s.clone()));
                    break;
                }
            }
        }
        match (text, declared) {
            (Some((idx, s)), Some(_)) => {
                return CellValueSnafu {
                    column: name.clone(),
                    lineno: lineno(idx),
                    content: s,
                }
                .fail();
            }
            (Some(_), None) => {
                warn!("Column {} contains text and is not declared, ignoring it", name);
                continue;
            }
            (None, _) => {}
        }
        if num_empty > 0 {
            warn!("Column {}: {} empty cells read as 0", name, num_empty);
        }
        let meta = declared.cloned().unwrap_or_else(ColumnMeta::numeric);
        table
            .add_column(name, meta, values)
            .context(TableSnafu {})?;
    }

    // One identifier per household unit, in the order of the units.
    let mut household_ids: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for id in ids.iter() {
        if seen.insert(id.as_str()) {
            household_ids.push(id.clone());
        }
    }
    debug!(
        "assemble_table: {} rows, {} household units, columns {:?}",
        table.num_rows(),
        household_ids.len(),
        table.col_names()
    );
    Ok(SurveyTable {
        table,
        household_ids,
    })
}
