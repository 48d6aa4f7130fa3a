/*!
Survey data, as seen by the margin builder.

The survey is a table of individuals grouped into household units. Each
individual has a role in its household (`0` being the head). Margins are
computed at the household level, so every accessor returns one value per
household unit.
*/
use std::collections::{BTreeSet, HashMap};

use log::debug;
use snafu::prelude::*;

use crate::config::*;

/// The role of the head of a household unit.
pub const HEAD: u32 = 0;

/// A source of survey variables: the raw inputs or the outputs computed by
/// the simulation engine.
pub trait SurveyData {
    /// The number of household units.
    fn num_units(&self) -> usize;

    fn col_names(&self) -> Vec<String>;

    /// The description of a column, or None if the variable is unknown.
    fn get_col(&self, variable: &str) -> Option<&ColumnMeta>;

    /// The values of a variable, one per household unit.
    ///
    /// `opt` restricts the individuals to the given roles (only the head if not
    /// provided). With `sum`, the values of these individuals are added up,
    /// otherwise the value of the first matching individual is taken.
    fn get_value(&self, variable: &str, opt: Option<&[u32]>, sum: bool) -> Option<Vec<f64>>;

    /// All the roles that individuals can take in a household unit.
    fn roles(&self) -> Vec<u32>;
}

/// The table in which a variable was found.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum Origin {
    Inputs,
    Outputs,
}

/// The result of looking a variable up in the inputs, then in the outputs.
#[derive(PartialEq, Debug, Clone)]
pub enum Lookup<'a> {
    Found {
        origin: Origin,
        column: &'a ColumnMeta,
    },
    NotFound,
}

pub fn lookup<'a>(
    variable: &str,
    inputs: &'a dyn SurveyData,
    outputs: Option<&'a dyn SurveyData>,
) -> Lookup<'a> {
    if let Some(column) = inputs.get_col(variable) {
        return Lookup::Found {
            origin: Origin::Inputs,
            column,
        };
    }
    match outputs.and_then(|o| o.get_col(variable)) {
        Some(column) => Lookup::Found {
            origin: Origin::Outputs,
            column,
        },
        None => Lookup::NotFound,
    }
}

/// An in-memory survey table, stored by individual.
#[derive(PartialEq, Debug, Clone)]
pub struct DataTable {
    // Household unit of each individual, dense from 0.
    households: Vec<usize>,
    roles: Vec<u32>,
    num_units: usize,
    // Insertion order of the columns.
    names: Vec<String>,
    columns: HashMap<String, (ColumnMeta, Vec<f64>)>,
}

impl DataTable {
    /// A table in which every individual is the head of its own household unit.
    pub fn one_per_household(num_rows: usize) -> DataTable {
        DataTable {
            households: (0..num_rows).collect(),
            roles: vec![HEAD; num_rows],
            num_units: num_rows,
            names: Vec::new(),
            columns: HashMap::new(),
        }
    }

    /// Groups the individuals by household identifier. The household units
    /// are numbered in order of first appearance.
    pub fn from_households(household_ids: &[String], roles: &[u32]) -> Result<DataTable, TableError> {
        ensure!(
            household_ids.len() == roles.len(),
            RoleLengthSnafu {
                expected: household_ids.len(),
                found: roles.len()
            }
        );
        let mut unit_of_id: HashMap<&str, usize> = HashMap::new();
        let mut households: Vec<usize> = Vec::with_capacity(household_ids.len());
        for id in household_ids.iter() {
            let next = unit_of_id.len();
            let unit = *unit_of_id.entry(id.as_str()).or_insert(next);
            households.push(unit);
        }
        debug!(
            "from_households: {} individuals in {} household units",
            households.len(),
            unit_of_id.len()
        );
        Ok(DataTable {
            households,
            roles: roles.to_vec(),
            num_units: unit_of_id.len(),
            names: Vec::new(),
            columns: HashMap::new(),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.households.len()
    }

    /// Adds or replaces a column. There must be one value per individual.
    pub fn add_column(
        &mut self,
        name: &str,
        meta: ColumnMeta,
        values: Vec<f64>,
    ) -> Result<(), TableError> {
        ensure!(
            values.len() == self.num_rows(),
            ColumnLengthSnafu {
                name,
                expected: self.num_rows(),
                found: values.len()
            }
        );
        if !self.columns.contains_key(name) {
            self.names.push(name.to_string());
        }
        self.columns.insert(name.to_string(), (meta, values));
        Ok(())
    }

    /// Renumbers the household units: unit `u` becomes unit `new_units[u]`.
    /// The new numbers must be a permutation of the units.
    pub fn renumber_units(&mut self, new_units: &[usize]) -> Result<(), TableError> {
        let mut seen = vec![false; self.num_units];
        let valid = new_units.len() == self.num_units
            && new_units
                .iter()
                .all(|u| *u < self.num_units && !std::mem::replace(&mut seen[*u], true));
        ensure!(
            valid,
            UnitOrderSnafu {
                num_units: self.num_units,
                found: new_units.to_vec()
            }
        );
        for unit in self.households.iter_mut() {
            *unit = new_units[*unit];
        }
        Ok(())
    }

    /// The raw values of a column, one per individual.
    pub fn column_values(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|(_, v)| v.as_slice())
    }
}

impl SurveyData for DataTable {
    fn num_units(&self) -> usize {
        self.num_units
    }

    fn col_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn get_col(&self, variable: &str) -> Option<&ColumnMeta> {
        self.columns.get(variable).map(|(meta, _)| meta)
    }

    fn get_value(&self, variable: &str, opt: Option<&[u32]>, sum: bool) -> Option<Vec<f64>> {
        let (_, values) = self.columns.get(variable)?;
        let selected: &[u32] = opt.unwrap_or(&[HEAD]);
        let mut res = vec![0.0; self.num_units];
        let mut filled = vec![false; self.num_units];
        for ((unit, role), value) in self.households.iter().zip(self.roles.iter()).zip(values) {
            if !selected.contains(role) {
                continue;
            }
            if sum {
                res[*unit] += value;
            } else if !filled[*unit] {
                res[*unit] = *value;
                filled[*unit] = true;
            }
        }
        Some(res)
    }

    fn roles(&self) -> Vec<u32> {
        let distinct: BTreeSet<u32> = self.roles.iter().cloned().collect();
        distinct.into_iter().collect()
    }
}
