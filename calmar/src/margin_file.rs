/*!
Margin files: the targets of a calibration, saved as CSV.

```text
var,mod,2020
zone,1,4.5
zone,2,0.5
rent,0,120
totalpop,0,5
```

The `mod` column holds the modality code, or `0` for a non-categorical
variable. The last column is named after the year of the targets. An empty
target means that the modality is shown but not calibrated.
*/
use std::io;

use log::debug;
use snafu::prelude::*;

use crate::config::*;
use crate::store::MarginTable;
use crate::TOTAL_POPULATION;

#[derive(PartialEq, Debug, Clone)]
pub struct MarginFileEntry {
    pub variable: String,
    pub code: i64,
    pub target: Option<f64>,
}

#[derive(PartialEq, Debug, Clone)]
pub struct MarginFile {
    pub year: String,
    pub entries: Vec<MarginFileEntry>,
}

impl MarginFile {
    /// Reads the targets of the given year.
    pub fn read<R: io::Read>(reader: R, year: &str) -> Result<MarginFile, MarginFileError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let header = rdr.headers().context(ReadingCsvSnafu {})?.clone();
        let position = |column: &str| {
            header
                .iter()
                .position(|h| h == column)
                .context(MissingColumnSnafu { column })
        };
        let var_idx = position("var")?;
        let mod_idx = position("mod")?;
        let year_idx = position(year)?;

        let mut entries: Vec<MarginFileEntry> = Vec::new();
        for (idx, record) in rdr.records().enumerate() {
            let record = record.context(ReadingCsvSnafu {})?;
            // The header is on line 1.
            let lineno = idx + 2;
            let field = |i: usize| record.get(i).unwrap_or("");
            let variable = field(var_idx);
            ensure!(
                !variable.is_empty(),
                InvalidRowSnafu {
                    lineno,
                    reason: "empty variable name"
                }
            );
            let code = parse_code(field(mod_idx)).context(InvalidRowSnafu {
                lineno,
                reason: format!("invalid modality {:?}", field(mod_idx)),
            })?;
            let target = match field(year_idx) {
                "" => None,
                s => Some(s.parse::<f64>().ok().context(InvalidRowSnafu {
                    lineno,
                    reason: format!("invalid target {:?}", s),
                })?),
            };
            entries.push(MarginFileEntry {
                variable: variable.to_string(),
                code,
                target,
            });
        }
        debug!("read margin file: {} entries for {}", entries.len(), year);
        Ok(MarginFile {
            year: year.to_string(),
            entries,
        })
    }

    pub fn write<W: io::Write>(&self, writer: W) -> Result<(), MarginFileError> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(["var", "mod", self.year.as_str()])
            .context(WritingCsvSnafu {})?;
        for e in self.entries.iter() {
            let target = e.target.map(|t| t.to_string()).unwrap_or_default();
            wtr.write_record([e.variable.clone(), e.code.to_string(), target])
                .context(WritingCsvSnafu {})?;
        }
        wtr.flush().context(FlushingSnafu {})?;
        Ok(())
    }

    /// The targets of the rows of a margin table, followed by the total
    /// population if it is set.
    pub fn from_table(table: &MarginTable, total_population: Option<f64>, year: &str) -> MarginFile {
        let mut entries: Vec<MarginFileEntry> = table
            .rows()
            .iter()
            .map(|r| MarginFileEntry {
                variable: r.variable.clone(),
                code: r.modality.file_code(),
                target: r.target,
            })
            .collect();
        if let Some(tp) = total_population {
            entries.push(MarginFileEntry {
                variable: TOTAL_POPULATION.to_string(),
                code: 0,
                target: Some(tp),
            });
        }
        MarginFile {
            year: year.to_string(),
            entries,
        }
    }

    pub fn total_population(&self) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.variable == TOTAL_POPULATION)
            .and_then(|e| e.target)
    }

    /// The variables of the file in order of first appearance, without the total population.
    pub fn variables(&self) -> Vec<String> {
        let mut res: Vec<String> = Vec::new();
        for e in self.entries.iter() {
            if e.variable != TOTAL_POPULATION && !res.contains(&e.variable) {
                res.push(e.variable.clone());
            }
        }
        res
    }

    pub fn targets_of(&self, variable: &str) -> Vec<(i64, Option<f64>)> {
        self.entries
            .iter()
            .filter(|e| e.variable == variable)
            .map(|e| (e.code, e.target))
            .collect()
    }
}

/// Modality codes may have been written as integers, as floats or as booleans.
fn parse_code(s: &str) -> Option<i64> {
    if let Ok(c) = s.parse::<i64>() {
        return Some(c);
    }
    match s {
        "True" | "true" => return Some(1),
        "False" | "false" => return Some(0),
        _ => {}
    }
    let f = s.parse::<f64>().ok()?;
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
