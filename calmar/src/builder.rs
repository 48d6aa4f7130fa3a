pub use crate::config::*;

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use snafu::prelude::*;

use crate::datatable::{lookup, Lookup, Origin, SurveyData};
use crate::store::WeightVector;

/// A variable that has been found in the inputs or the outputs, with its
/// values per household unit.
#[derive(PartialEq, Debug, Clone)]
pub struct ResolvedVariable<'a> {
    pub name: String,
    pub origin: Origin,
    pub column: &'a ColumnMeta,
    pub values: Vec<f64>,
}

impl<'a> ResolvedVariable<'a> {
    /// The modality of each household unit.
    fn modalities(&self) -> Vec<Modality> {
        if self.column.kind.is_categorical() {
            self.values
                .iter()
                .map(|v| Modality::Code(v.round() as i64))
                .collect()
        } else {
            vec![Modality::Total; self.values.len()]
        }
    }

    fn modality_label(&self, modality: Modality) -> String {
        match (&self.column.kind, modality) {
            (_, Modality::Total) => "total".to_string(),
            (ColumnKind::Enum(mapping), Modality::Code(c)) => {
                mapping.get(&c).cloned().unwrap_or_else(|| c.to_string())
            }
            (ColumnKind::Bool, Modality::Code(c)) => (c != 0).to_string(),
            (_, Modality::Code(c)) => c.to_string(),
        }
    }

    fn label(&self) -> String {
        self.column.label.clone().unwrap_or_else(|| self.name.clone())
    }
}

/// Builds the margin rows of a variable.
///
/// ```
/// use calmar::builder::MarginBuilder;
/// use calmar::datatable::DataTable;
/// use calmar::store::WeightVector;
/// use calmar::{ColumnMeta, MarginSource, Modality};
///
/// let mut inputs = DataTable::one_per_household(2);
/// inputs.add_column("rent", ColumnMeta::numeric(), vec![100.0, 300.0])?;
/// let weights = WeightVector::new(vec![1.0, 2.0]);
///
/// let builder = MarginBuilder::new(&inputs, None);
/// let rows = builder.build("rent", None, MarginSource::Free, &weights)?;
/// assert_eq!(rows.len(), 1);
/// assert_eq!(rows[0].modality, Modality::Total);
/// assert_eq!(rows[0].current, 700.0);
///
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct MarginBuilder<'a> {
    inputs: &'a dyn SurveyData,
    outputs: Option<&'a dyn SurveyData>,
}

impl<'a> MarginBuilder<'a> {
    pub fn new(inputs: &'a dyn SurveyData, outputs: Option<&'a dyn SurveyData>) -> MarginBuilder<'a> {
        MarginBuilder { inputs, outputs }
    }

    pub fn lookup(&self, variable: &str) -> Lookup<'a> {
        lookup(variable, self.inputs, self.outputs)
    }

    /// Finds the variable and reads its values.
    ///
    /// The inputs give the value of the household head. The outputs are
    /// summed over all the members of the household.
    pub fn resolve(&self, variable: &str) -> Result<ResolvedVariable<'a>, MarginError> {
        let (origin, column) = match self.lookup(variable) {
            Lookup::Found { origin, column } => (origin, column),
            Lookup::NotFound => {
                return VariableNotFoundSnafu { variable }.fail();
            }
        };
        let values = match (origin, self.outputs) {
            (Origin::Outputs, Some(outputs)) => {
                let roles = outputs.roles();
                outputs.get_value(variable, Some(roles.as_slice()), true)
            }
            _ => self.inputs.get_value(variable, None, false),
        }
        .context(MissingValuesSnafu { variable, origin })?;
        debug!(
            "resolve: variable {} found in {:?} ({:?})",
            variable, origin, column.kind
        );
        Ok(ResolvedVariable {
            name: variable.to_string(),
            origin,
            column,
            values,
        })
    }

    /// Looks the variable up and builds its rows. See `build_rows`.
    pub fn build(
        &self,
        variable: &str,
        target: Option<&Targets>,
        source: MarginSource,
        weights: &WeightVector,
    ) -> Result<Vec<Margin>, MarginError> {
        let resolved = self.resolve(variable)?;
        build_rows(&resolved, target, source, weights)
    }
}

/// Builds one row per modality for categorical variables (and booleans, ages
/// and dates), or a single `total` row for the other variables.
///
/// If targets are provided, their modalities must be exactly the modalities
/// found in the data. Nothing is built otherwise.
pub fn build_rows(
    resolved: &ResolvedVariable,
    target: Option<&Targets>,
    source: MarginSource,
    weights: &WeightVector,
) -> Result<Vec<Margin>, MarginError> {
    ensure!(
        resolved.values.len() == weights.len(),
        WeightLengthSnafu {
            expected: resolved.values.len(),
            found: weights.len()
        }
    );
    let categorical = resolved.column.kind.is_categorical();

    // modality -> (current, initial)
    let mut sums: BTreeMap<Modality, (f64, f64)> = BTreeMap::new();
    let modalities = resolved.modalities();
    for (idx, modality) in modalities.iter().enumerate() {
        let x = if categorical { 1.0 } else { resolved.values[idx] };
        let e = sums.entry(*modality).or_insert((0.0, 0.0));
        e.0 += x * weights.current()[idx];
        e.1 += x * weights.baseline()[idx];
    }
    if !categorical && sums.is_empty() {
        sums.insert(Modality::Total, (0.0, 0.0));
    }

    let targets: BTreeMap<Modality, Option<f64>> = match target {
        Some(t) => {
            let keys: BTreeSet<Modality> = t.iter().map(|(m, _)| *m).collect();
            let found: BTreeSet<Modality> = sums.keys().cloned().collect();
            ensure!(
                t.len() == sums.len() && keys == found,
                TargetMismatchSnafu {
                    variable: resolved.name.clone(),
                    expected: sums.len(),
                    provided: t.len()
                }
            );
            t.iter().cloned().collect()
        }
        None => BTreeMap::new(),
    };

    let label = resolved.label();
    let rows: Vec<Margin> = sums
        .iter()
        .map(|(modality, (current, initial))| Margin {
            variable: resolved.name.clone(),
            label: label.clone(),
            modality: *modality,
            modality_label: resolved.modality_label(*modality),
            target: targets.get(modality).cloned().flatten(),
            adjusted_target: None,
            current: *current,
            initial: *initial,
            source,
        })
        .collect();
    debug!("build_rows: {}: {} rows", resolved.name, rows.len());
    Ok(rows)
}

/// The calibration variables of a resolved variable: the indicator of each
/// modality, or the values themselves for the `total` modality.
pub fn calibration_columns(resolved: &ResolvedVariable) -> BTreeMap<Modality, Vec<f64>> {
    let n = resolved.values.len();
    let mut columns: BTreeMap<Modality, Vec<f64>> = BTreeMap::new();
    if !resolved.column.kind.is_categorical() {
        columns.insert(Modality::Total, resolved.values.clone());
        return columns;
    }
    for (idx, modality) in resolved.modalities().iter().enumerate() {
        let col = columns.entry(*modality).or_insert_with(|| vec![0.0; n]);
        col[idx] = 1.0;
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatable::DataTable;

    fn inputs() -> DataTable {
        let mut t = DataTable::one_per_household(4);
        let mapping: BTreeMap<i64, String> = [(1, "urban"), (2, "rural")]
            .iter()
            .map(|(c, s)| (*c, s.to_string()))
            .collect();
        t.add_column(
            "zone",
            ColumnMeta {
                label: Some("Zone".to_string()),
                kind: ColumnKind::Enum(mapping),
            },
            vec![1.0, 2.0, 1.0, 1.0],
        )
        .unwrap();
        t.add_column(
            "owner",
            ColumnMeta {
                label: None,
                kind: ColumnKind::Bool,
            },
            vec![1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        t.add_column("rent", ColumnMeta::numeric(), vec![10.0, 20.0, 30.0, 40.0])
            .unwrap();
        t
    }

    fn weights() -> WeightVector {
        WeightVector::from_parts(vec![1.0, 1.0, 1.0, 1.0], vec![2.0, 1.0, 1.0, 1.0]).unwrap()
    }

    #[test]
    fn categorical_rows() {
        let t = inputs();
        let b = MarginBuilder::new(&t, None);
        let rows = b.build("zone", None, MarginSource::Free, &weights()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].modality, Modality::Code(1));
        assert_eq!(rows[0].modality_label, "urban");
        assert_eq!(rows[0].label, "Zone");
        assert_eq!(rows[0].current, 4.0);
        assert_eq!(rows[0].initial, 3.0);
        assert_eq!(rows[1].modality_label, "rural");
        assert_eq!(rows[1].current, 1.0);
    }

    #[test]
    fn categorical_sum_matches_total() {
        let t = inputs();
        let b = MarginBuilder::new(&t, None);
        let w = weights();
        let rows = b.build("owner", None, MarginSource::Free, &w).unwrap();
        let total: f64 = rows.iter().map(|r| r.current).sum();
        assert_eq!(total, w.current().iter().sum::<f64>());
        assert_eq!(rows[0].modality_label, "false");
        assert_eq!(rows[1].modality_label, "true");
    }

    #[test]
    fn numeric_total_row() {
        let t = inputs();
        let b = MarginBuilder::new(&t, None);
        let target = vec![(Modality::Total, Some(150.0))];
        let rows = b
            .build("rent", Some(&target), MarginSource::Input, &weights())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].modality_label, "total");
        assert_eq!(rows[0].label, "rent");
        assert_eq!(rows[0].current, 110.0);
        assert_eq!(rows[0].initial, 100.0);
        assert_eq!(rows[0].target, Some(150.0));
    }

    #[test]
    fn target_mismatch() {
        let t = inputs();
        let b = MarginBuilder::new(&t, None);
        let target = vec![(Modality::Code(1), Some(3.0))];
        let res = b.build("zone", Some(&target), MarginSource::Input, &weights());
        assert!(matches!(
            res,
            Err(MarginError::TargetMismatch {
                expected: 2,
                provided: 1,
                ..
            })
        ));
        // Same count, different keys.
        let target = vec![(Modality::Code(1), Some(3.0)), (Modality::Code(3), Some(1.0))];
        let res = b.build("zone", Some(&target), MarginSource::Input, &weights());
        assert!(matches!(res, Err(MarginError::TargetMismatch { .. })));
    }

    #[test]
    fn outputs_are_summed_over_the_household() {
        let ids: Vec<String> = ["a", "a", "b"].iter().map(|s| s.to_string()).collect();
        let mut inputs = DataTable::from_households(&ids, &[0, 1, 0]).unwrap();
        inputs
            .add_column("age", ColumnMeta::numeric(), vec![40.0, 12.0, 30.0])
            .unwrap();
        let mut outputs = DataTable::from_households(&ids, &[0, 1, 0]).unwrap();
        outputs
            .add_column("af", ColumnMeta::numeric(), vec![0.0, 120.0, 50.0])
            .unwrap();

        let b = MarginBuilder::new(&inputs, Some(&outputs));
        let r = b.resolve("af").unwrap();
        assert_eq!(r.origin, Origin::Outputs);
        assert_eq!(r.values, vec![120.0, 50.0]);

        let r = b.resolve("age").unwrap();
        assert_eq!(r.origin, Origin::Inputs);
        assert_eq!(r.values, vec![40.0, 30.0]);

        assert!(matches!(
            b.resolve("unknown"),
            Err(MarginError::VariableNotFound { .. })
        ));
    }

    #[test]
    fn indicator_columns() {
        let t = inputs();
        let b = MarginBuilder::new(&t, None);
        let cols = calibration_columns(&b.resolve("zone").unwrap());
        assert_eq!(cols[&Modality::Code(1)], vec![1.0, 0.0, 1.0, 1.0]);
        assert_eq!(cols[&Modality::Code(2)], vec![0.0, 1.0, 0.0, 0.0]);
        let cols = calibration_columns(&b.resolve("rent").unwrap());
        assert_eq!(cols[&Modality::Total], vec![10.0, 20.0, 30.0, 40.0]);
    }
}
