/*!
The margin store: the state of a calibration session.

The store owns the survey tables, the weight vector and the margin table.
Only `calibrate` and `reset` change the weights. Every other operation works
on targets, and the current values of the rows it builds are computed from
the weights at that time, so the table never shows stale values.
*/
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use snafu::prelude::*;

use crate::builder::{build_rows, calibration_columns, MarginBuilder};
use crate::config::*;
use crate::datatable::{Lookup, SurveyData};
use crate::margin_file::MarginFile;

/// The weights of the household units: the baseline and the current values.
#[derive(PartialEq, Debug, Clone)]
pub struct WeightVector {
    baseline: Vec<f64>,
    current: Vec<f64>,
}

impl WeightVector {
    /// Current weights start at the baseline.
    pub fn new(baseline: Vec<f64>) -> WeightVector {
        WeightVector {
            current: baseline.clone(),
            baseline,
        }
    }

    pub fn from_parts(baseline: Vec<f64>, current: Vec<f64>) -> Result<WeightVector, MarginError> {
        ensure!(
            baseline.len() == current.len(),
            WeightLengthSnafu {
                expected: baseline.len(),
                found: current.len()
            }
        );
        Ok(WeightVector { baseline, current })
    }

    pub fn len(&self) -> usize {
        self.baseline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty()
    }

    pub fn baseline(&self) -> &[f64] {
        &self.baseline
    }

    pub fn current(&self) -> &[f64] {
        &self.current
    }

    pub fn reset(&mut self) {
        self.current = self.baseline.clone();
    }

    /// Replaces the current weights. Nothing is changed if the length is wrong.
    pub fn commit(&mut self, weights: Vec<f64>) -> Result<(), MarginError> {
        ensure!(
            weights.len() == self.baseline.len(),
            WeightLengthSnafu {
                expected: self.baseline.len(),
                found: weights.len()
            }
        );
        self.current = weights;
        Ok(())
    }

    /// Current weight divided by baseline weight, for every household unit
    /// with a non-zero baseline weight.
    pub fn ratios(&self) -> Vec<f64> {
        self.current
            .iter()
            .zip(self.baseline.iter())
            .filter(|(_, b)| **b != 0.0)
            .map(|(c, b)| c / b)
            .collect()
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct RatioSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// The margins shown to the operator, unique by (variable, modality) and
/// grouped by variable in insertion order.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct MarginTable {
    rows: Vec<Margin>,
}

impl MarginTable {
    pub fn new() -> MarginTable {
        MarginTable { rows: Vec::new() }
    }

    pub fn rows(&self) -> &[Margin] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The variables of the table, in order.
    pub fn variables(&self) -> Vec<String> {
        let mut res: Vec<String> = Vec::new();
        for r in self.rows.iter() {
            if res.last() != Some(&r.variable) {
                res.push(r.variable.clone());
            }
        }
        res
    }

    pub fn contains(&self, variable: &str) -> bool {
        self.rows.iter().any(|r| r.variable == variable)
    }

    pub fn get(&self, variable: &str, modality: Modality) -> Option<&Margin> {
        self.rows
            .iter()
            .find(|r| r.variable == variable && r.modality == modality)
    }

    fn get_mut(&mut self, variable: &str, modality: Modality) -> Option<&mut Margin> {
        self.rows
            .iter_mut()
            .find(|r| r.variable == variable && r.modality == modality)
    }

    /// Inserts the rows of a variable. Rows already present for this variable
    /// are replaced, at the same position.
    pub fn insert_variable(&mut self, rows: Vec<Margin>) {
        let variable = match rows.first() {
            Some(r) => r.variable.clone(),
            None => return,
        };
        match self.rows.iter().position(|r| r.variable == variable) {
            Some(pos) => {
                self.remove(&variable);
                let tail = self.rows.split_off(pos);
                self.rows.extend(rows);
                self.rows.extend(tail);
            }
            None => self.rows.extend(rows),
        }
    }

    /// Removes the rows of a variable and returns how many were removed.
    pub fn remove(&mut self, variable: &str) -> usize {
        let before = self.rows.len();
        self.rows.retain(|r| r.variable != variable);
        before - self.rows.len()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// The outcome of loading a margin file.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Variables absent from both inputs and outputs.
    pub skipped: Vec<String>,
    /// Variables whose targets did not match their modalities. Their rows were dropped.
    pub mismatched: Vec<String>,
    pub total_population: Option<f64>,
}

/// Reference targets read from margin files, by variable.
type TargetCatalog = BTreeMap<String, Vec<(i64, Option<f64>)>>;

pub struct MarginStore {
    inputs: Box<dyn SurveyData>,
    outputs: Option<Box<dyn SurveyData>>,
    config: StoreConfig,
    weights: WeightVector,
    table: MarginTable,
    input_targets: TargetCatalog,
    output_targets: TargetCatalog,
}

impl MarginStore {
    /// Creates a session on the given survey tables. The weights are read from
    /// the inputs, using the variables named in the configuration. If the
    /// current weights are absent, they start at the baseline.
    pub fn new(
        inputs: Box<dyn SurveyData>,
        outputs: Option<Box<dyn SurveyData>>,
        config: StoreConfig,
    ) -> Result<MarginStore, MarginError> {
        let baseline = inputs
            .get_value(&config.baseline_weight_variable, None, false)
            .context(MissingWeightsSnafu {
                variable: config.baseline_weight_variable.clone(),
            })?;
        let weights = match inputs.get_value(&config.weight_variable, None, false) {
            Some(current) => WeightVector::from_parts(baseline, current)?,
            None => WeightVector::new(baseline),
        };
        if let Some(o) = outputs.as_ref() {
            ensure!(
                o.num_units() == weights.len(),
                WeightLengthSnafu {
                    expected: o.num_units(),
                    found: weights.len()
                }
            );
        }
        info!(
            "New margin store: {} household units, initial total population {}",
            weights.len(),
            weights.baseline().iter().sum::<f64>()
        );
        Ok(MarginStore {
            inputs,
            outputs,
            config,
            weights,
            table: MarginTable::new(),
            input_targets: BTreeMap::new(),
            output_targets: BTreeMap::new(),
        })
    }

    fn builder(&self) -> MarginBuilder<'_> {
        MarginBuilder::new(self.inputs.as_ref(), self.outputs.as_deref())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.config.params
    }

    /// Changes the method, bounds and solver settings. The total population
    /// target is kept.
    pub fn set_params(&mut self, params: CalibrationParams) {
        let total_population = self.config.params.total_population;
        self.config.params = CalibrationParams {
            total_population,
            ..params
        };
    }

    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    pub fn table(&self) -> &MarginTable {
        &self.table
    }

    /// The rows to display. Calling it has no effect on the store.
    pub fn view(&self) -> &[Margin] {
        self.table.rows()
    }

    pub fn initial_total_population(&self) -> f64 {
        self.weights.baseline().iter().sum()
    }

    pub fn total_population(&self) -> Option<f64> {
        self.config.params.total_population
    }

    pub fn set_total_population(&mut self, total_population: Option<f64>) {
        self.config.params.total_population = total_population;
    }

    pub fn ratio_summary(&self) -> Option<RatioSummary> {
        let ratios = self.weights.ratios();
        if ratios.is_empty() {
            return None;
        }
        let min = ratios.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = ratios.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
        Some(RatioSummary { min, max, mean })
    }

    // ******** Variable lists *********

    pub fn table_vars(&self) -> Vec<String> {
        self.table.variables()
    }

    /// Variables with a reference input target, not yet in the table.
    pub fn input_vars(&self) -> Vec<String> {
        self.available(&self.input_targets)
    }

    /// Variables with a reference output target, not yet in the table.
    pub fn output_vars(&self) -> Vec<String> {
        self.available(&self.output_targets)
    }

    /// All the variables of the inputs and outputs, not yet in the table.
    pub fn free_vars(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.inputs.col_names().into_iter().collect();
        if let Some(o) = self.outputs.as_ref() {
            all.extend(o.col_names());
        }
        let in_table: BTreeSet<String> = self.table_vars().into_iter().collect();
        all.difference(&in_table).cloned().collect()
    }

    /// The variables of the reference targets found in neither the inputs nor the outputs.
    pub fn absent_vars(&self) -> Vec<String> {
        let builder = self.builder();
        let all: BTreeSet<&String> = self
            .input_targets
            .keys()
            .chain(self.output_targets.keys())
            .collect();
        all.into_iter()
            .filter(|v| builder.lookup(v) == Lookup::NotFound)
            .cloned()
            .collect()
    }

    fn available(&self, catalog: &TargetCatalog) -> Vec<String> {
        let builder = self.builder();
        catalog
            .keys()
            .filter(|v| !self.table.contains(v))
            .filter(|v| {
                let found = builder.lookup(v) != Lookup::NotFound;
                if !found {
                    warn!("Variable {} is in neither the inputs nor the outputs, skipping it", v);
                }
                found
            })
            .cloned()
            .collect()
    }

    // ******** Adding and removing margins *********

    /// Adds the margins of a variable, looked up in the inputs then in the outputs.
    ///
    /// If the targets do not match the modalities of the variable, its rows
    /// are removed from the table and from the reference targets of the
    /// source, and the error is returned.
    pub fn add_variable(
        &mut self,
        variable: &str,
        target: Option<&Targets>,
        source: MarginSource,
    ) -> Result<(), MarginError> {
        let res = self.builder().build(variable, target, source, &self.weights);
        match res {
            Ok(rows) => {
                info!(
                    "Adding variable {} ({} rows, source {})",
                    variable,
                    rows.len(),
                    source.as_str()
                );
                self.table.insert_variable(rows);
                Ok(())
            }
            Err(e @ MarginError::TargetMismatch { .. }) => {
                warn!("{}. Skipping the variable.", e);
                self.drop_targets(variable, source);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn drop_targets(&mut self, variable: &str, source: MarginSource) {
        self.table.remove(variable);
        match source {
            MarginSource::Input => {
                self.input_targets.remove(variable);
            }
            MarginSource::Output => {
                self.output_targets.remove(variable);
            }
            MarginSource::Free | MarginSource::Config => {}
        }
    }

    /// Adds a variable with its reference input target.
    pub fn add_input_margin(&mut self, variable: &str) -> Result<(), MarginError> {
        self.add_from_catalog(variable, MarginSource::Input)
    }

    /// Adds a computed variable with its reference output target.
    pub fn add_output_margin(&mut self, variable: &str) -> Result<(), MarginError> {
        self.add_from_catalog(variable, MarginSource::Output)
    }

    fn add_from_catalog(&mut self, variable: &str, source: MarginSource) -> Result<(), MarginError> {
        let catalog = match source {
            MarginSource::Output => &self.output_targets,
            _ => &self.input_targets,
        };
        let entries = catalog
            .get(variable)
            .cloned()
            .context(MissingTargetSnafu {
                variable,
                source_name: source.as_str(),
            })?;
        let resolved = self.builder().resolve(variable)?;
        let targets = targets_for(&entries, resolved.column.kind.is_categorical());
        let res = build_rows(&resolved, Some(&targets), source, &self.weights);
        match res {
            Ok(rows) => {
                info!("Adding variable {} with {} target", variable, source.as_str());
                self.table.insert_variable(rows);
                Ok(())
            }
            Err(e @ MarginError::TargetMismatch { .. }) => {
                warn!("{}. Skipping the variable.", e);
                self.drop_targets(variable, source);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Adds a variable with a target entered by the operator. A scalar target
    /// only applies to non-categorical variables; the modalities of a
    /// categorical variable are added without target.
    pub fn add_free_margin(&mut self, variable: &str, target: Option<f64>) -> Result<(), MarginError> {
        let resolved = self.builder().resolve(variable)?;
        let targets: Option<Targets> = match target {
            Some(t) if !resolved.column.kind.is_categorical() => Some(vec![(Modality::Total, Some(t))]),
            Some(_) => {
                warn!(
                    "Ignoring the scalar target of categorical variable {}",
                    variable
                );
                None
            }
            None => None,
        };
        let rows = build_rows(&resolved, targets.as_ref(), MarginSource::Free, &self.weights)?;
        info!("Adding free variable {}", variable);
        self.table.insert_variable(rows);
        Ok(())
    }

    /// Removes a variable from the table.
    pub fn remove(&mut self, variable: &str) -> Result<(), MarginError> {
        let removed = self.table.remove(variable);
        ensure!(removed > 0, NotInTableSnafu { variable });
        info!("Removed variable {} ({} rows)", variable, removed);
        Ok(())
    }

    /// Removes all the variables. The weights are kept.
    pub fn remove_all(&mut self) {
        self.table.clear();
    }

    /// Empties the table, clears the total population target and restores
    /// the baseline weights.
    pub fn reset(&mut self) {
        info!("Resetting the margins and the weights");
        self.table.clear();
        self.weights.reset();
        self.config.params.total_population = None;
    }

    /// Sets (or clears) the target of one row.
    pub fn set_target(
        &mut self,
        variable: &str,
        modality: Modality,
        target: Option<f64>,
    ) -> Result<(), MarginError> {
        let row = self
            .table
            .get_mut(variable, modality)
            .context(UnknownMarginSnafu { variable, modality })?;
        row.target = target;
        row.adjusted_target = None;
        Ok(())
    }

    // ******** Calibration *********

    /// Calibrates the weights on the rows that have a target (and on the total
    /// population if set), then commits the new weights and refreshes the
    /// table. Not converging is reported in the outcome, not as an error.
    pub fn calibrate(&mut self) -> Result<CalibrationOutcome, MarginError> {
        let constraints = self.constraints()?;
        let outcome = crate::calibrate(self.weights.baseline(), &constraints, &self.config.params)
            .context(CalibrationSnafu {})?;
        self.weights.commit(outcome.weights.clone())?;

        let adjusted: BTreeMap<(String, Modality), f64> = outcome
            .margins
            .iter()
            .map(|m| ((m.variable.clone(), m.modality), m.adjusted_target))
            .collect();
        for row in self.table.rows.iter_mut() {
            row.adjusted_target = adjusted.get(&(row.variable.clone(), row.modality)).cloned();
        }
        self.refresh_current()?;
        Ok(outcome)
    }

    fn constraints(&self) -> Result<Vec<Constraint>, MarginError> {
        let builder = self.builder();
        let mut res: Vec<Constraint> = Vec::new();
        for variable in self.table.variables() {
            let rows: Vec<&Margin> = self
                .table
                .rows()
                .iter()
                .filter(|r| r.variable == variable && r.target.is_some())
                .collect();
            if rows.is_empty() {
                debug!("constraints: no target for variable {}", variable);
                continue;
            }
            let columns = calibration_columns(&builder.resolve(&variable)?);
            for r in rows {
                match (columns.get(&r.modality), r.target) {
                    (Some(values), Some(target)) => res.push(Constraint {
                        variable: variable.clone(),
                        modality: r.modality,
                        values: values.clone(),
                        target,
                    }),
                    _ => warn!(
                        "Calibration: modality {} of variable {} is absent from the data",
                        r.modality, variable
                    ),
                }
            }
        }
        Ok(res)
    }

    /// Recomputes the current values of every row from the current weights.
    fn refresh_current(&mut self) -> Result<(), MarginError> {
        let builder = MarginBuilder::new(self.inputs.as_ref(), self.outputs.as_deref());
        for variable in self.table.variables() {
            let fresh = builder.build(&variable, None, MarginSource::Free, &self.weights)?;
            for f in fresh {
                if let Some(row) = self.table.get_mut(&variable, f.modality) {
                    row.current = f.current;
                }
            }
        }
        Ok(())
    }

    // ******** Margin files *********

    /// Stores the reference targets of a margin file. The total population of
    /// an input file becomes the total population target.
    pub fn load_target_catalog(&mut self, file: &MarginFile, source: MarginSource) {
        let mut catalog: TargetCatalog = BTreeMap::new();
        for variable in file.variables() {
            catalog.insert(variable.clone(), file.targets_of(&variable));
        }
        info!(
            "Loaded {} reference {} margins",
            catalog.len(),
            source.as_str()
        );
        match source {
            MarginSource::Output => self.output_targets = catalog,
            _ => {
                self.input_targets = catalog;
                if let Some(tp) = file.total_population() {
                    self.config.params.total_population = Some(tp);
                }
            }
        }
    }

    /// Replaces the table with the margins of a file and restores the baseline weights.
    ///
    /// Variables unknown to both inputs and outputs are skipped. Variables
    /// whose targets do not match their modalities are dropped, or make the
    /// whole load fail if `strict_targets` is set. The store is only changed
    /// once every variable has been processed.
    pub fn load_margins(&mut self, file: &MarginFile) -> Result<LoadReport, MarginError> {
        let fresh_weights = WeightVector::new(self.weights.baseline().to_vec());
        let builder = self.builder();
        let mut table = MarginTable::new();
        let mut report = LoadReport {
            total_population: file.total_population(),
            ..LoadReport::default()
        };
        for variable in file.variables() {
            let resolved = match builder.resolve(&variable) {
                Ok(r) => r,
                Err(MarginError::VariableNotFound { .. }) => {
                    warn!(
                        "Variable {} is absent from both inputs and outputs, skipping it",
                        variable
                    );
                    report.skipped.push(variable);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let targets = targets_for(
                &file.targets_of(&variable),
                resolved.column.kind.is_categorical(),
            );
            match build_rows(&resolved, Some(&targets), MarginSource::Config, &fresh_weights) {
                Ok(rows) => {
                    table.insert_variable(rows);
                    report.loaded.push(variable);
                }
                Err(e @ MarginError::TargetMismatch { .. }) if !self.config.strict_targets => {
                    warn!("{}. Skipping the variable.", e);
                    report.mismatched.push(variable);
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "Loaded margins: {} variables, {} skipped, {} mismatched",
            report.loaded.len(),
            report.skipped.len(),
            report.mismatched.len()
        );
        self.weights = fresh_weights;
        self.table = table;
        self.config.params.total_population = report.total_population;
        Ok(report)
    }

    /// The targets of the table, for saving. Weights are never saved.
    pub fn to_margin_file(&self, year: &str) -> Result<MarginFile, MarginError> {
        ensure!(!self.table.is_empty(), EmptyTableSnafu {});
        Ok(MarginFile::from_table(
            &self.table,
            self.config.params.total_population,
            year,
        ))
    }
}

/// Maps the `mod` codes of a margin file onto modalities. The code of a
/// non-categorical variable is ignored.
fn targets_for(entries: &[(i64, Option<f64>)], categorical: bool) -> Targets {
    entries
        .iter()
        .map(|(code, t)| {
            let m = if categorical {
                Modality::Code(*code)
            } else {
                Modality::Total
            };
            (m, *t)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatable::DataTable;
    use crate::margin_file::MarginFileEntry;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn inputs() -> DataTable {
        let mut t = DataTable::one_per_household(4);
        t.add_column("wprm_init", ColumnMeta::numeric(), vec![1.0; 4])
            .unwrap();
        t.add_column(
            "zone",
            ColumnMeta {
                label: Some("Zone".to_string()),
                kind: ColumnKind::Enum(BTreeMap::new()),
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

    fn outputs() -> DataTable {
        let mut t = DataTable::one_per_household(4);
        t.add_column(
            "revdisp",
            ColumnMeta::numeric(),
            vec![100.0, 200.0, 300.0, 400.0],
        )
        .unwrap();
        t
    }

    fn store(config: StoreConfig) -> MarginStore {
        MarginStore::new(Box::new(inputs()), Some(Box::new(outputs())), config).unwrap()
    }

    fn entry(variable: &str, code: i64, target: Option<f64>) -> MarginFileEntry {
        MarginFileEntry {
            variable: variable.to_string(),
            code,
            target,
        }
    }

    fn margin_file() -> MarginFile {
        MarginFile {
            year: "2020".to_string(),
            entries: vec![
                entry("zone", 1, Some(4.5)),
                entry("zone", 2, Some(0.5)),
                entry("rent", 0, Some(120.0)),
                entry("unknown", 1, Some(3.0)),
                entry("owner", 1, Some(2.0)),
                entry(crate::TOTAL_POPULATION, 0, Some(5.0)),
            ],
        }
    }

    #[test]
    fn missing_weights() {
        let res = MarginStore::new(
            Box::new(DataTable::one_per_household(2)),
            None,
            StoreConfig::default(),
        );
        assert!(matches!(res, Err(MarginError::MissingWeights { .. })));
    }

    #[test]
    fn free_margins_and_calibration() {
        init();
        let mut s = store(StoreConfig::default());
        s.add_free_margin("zone", None).unwrap();
        s.add_free_margin("rent", None).unwrap();
        assert_eq!(s.table_vars(), vec!["zone", "rent"]);
        assert!(s.view().iter().all(|r| r.target.is_none()));

        s.set_target("zone", Modality::Code(1), Some(4.5)).unwrap();
        s.set_target("zone", Modality::Code(2), Some(0.5)).unwrap();
        let outcome = s.calibrate().unwrap();
        assert!(outcome.converged);

        let zone1 = s.table().get("zone", Modality::Code(1)).unwrap();
        assert!((zone1.current - 4.5).abs() < 1e-6);
        assert!((zone1.adjusted_target.unwrap() - 4.5).abs() < 1e-12);
        assert_eq!(zone1.initial, 3.0);
        // Rows without target follow the new weights.
        let rent = s.table().get("rent", Modality::Total).unwrap();
        assert!((rent.current - 130.0).abs() < 1e-6);
        assert_eq!(rent.adjusted_target, None);

        let summary = s.ratio_summary().unwrap();
        assert!((summary.min - 0.5).abs() < 1e-6);
        assert!((summary.max - 1.5).abs() < 1e-6);
    }

    #[test]
    fn margins_added_after_calibration() {
        init();
        let mut s = store(StoreConfig::default());
        s.add_free_margin("zone", None).unwrap();
        s.set_target("zone", Modality::Code(1), Some(4.5)).unwrap();
        s.set_target("zone", Modality::Code(2), Some(0.5)).unwrap();
        assert!(s.calibrate().unwrap().converged);
        let w = s.weights().current().to_vec();
        let weighted = |values: &[f64]| -> f64 { values.iter().zip(w.iter()).map(|(x, w)| x * w).sum() };

        s.add_free_margin("owner", None).unwrap();
        let owner1 = s.table().get("owner", Modality::Code(1)).unwrap();
        assert!((owner1.current - weighted(&[1.0, 0.0, 0.0, 1.0])).abs() < 1e-9);
        assert!((owner1.current - 3.0).abs() < 1e-6);
        assert_eq!(owner1.initial, 2.0);
        let owner0 = s.table().get("owner", Modality::Code(0)).unwrap();
        assert!((owner0.current - weighted(&[0.0, 1.0, 1.0, 0.0])).abs() < 1e-9);

        s.load_target_catalog(&margin_file(), MarginSource::Input);
        s.add_input_margin("rent").unwrap();
        let rent = s.table().get("rent", Modality::Total).unwrap();
        assert!((rent.current - weighted(&[10.0, 20.0, 30.0, 40.0])).abs() < 1e-9);
        assert!((rent.current - 130.0).abs() < 1e-6);
        assert_eq!(rent.initial, 100.0);
        assert_eq!(rent.target, Some(120.0));

        let outputs = MarginFile {
            year: "2020".to_string(),
            entries: vec![entry("revdisp", 0, Some(1100.0))],
        };
        s.load_target_catalog(&outputs, MarginSource::Output);
        s.add_output_margin("revdisp").unwrap();
        let revdisp = s.table().get("revdisp", Modality::Total).unwrap();
        assert!((revdisp.current - weighted(&[100.0, 200.0, 300.0, 400.0])).abs() < 1e-9);
        assert_ne!(revdisp.current, revdisp.initial);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut s = store(StoreConfig::default());
        s.add_free_margin("zone", None).unwrap();
        s.set_target("zone", Modality::Code(1), Some(4.5)).unwrap();
        s.set_total_population(Some(5.0));
        s.calibrate().unwrap();
        assert_ne!(s.weights().current(), s.weights().baseline());

        s.reset();
        let weights = s.weights().clone();
        assert_eq!(weights.current(), weights.baseline());
        assert!(s.view().is_empty());
        assert_eq!(s.total_population(), None);

        s.reset();
        assert_eq!(s.weights(), &weights);
        assert!(s.view().is_empty());
        assert_eq!(s.total_population(), None);
    }

    #[test]
    fn output_variables() {
        let mut s = store(StoreConfig::default());
        s.add_free_margin("revdisp", Some(1200.0)).unwrap();
        let row = s.table().get("revdisp", Modality::Total).unwrap();
        assert_eq!(row.initial, 1000.0);
        assert_eq!(row.target, Some(1200.0));
        assert_eq!(row.source, MarginSource::Free);
        assert!(!s.free_vars().contains(&"revdisp".to_string()));
        assert!(s.free_vars().contains(&"rent".to_string()));
    }

    #[test]
    fn unknown_variables() {
        let mut s = store(StoreConfig::default());
        assert!(matches!(
            s.add_free_margin("nope", None),
            Err(MarginError::VariableNotFound { .. })
        ));
        assert!(matches!(
            s.remove("zone"),
            Err(MarginError::NotInTable { .. })
        ));
        assert!(matches!(
            s.set_target("zone", Modality::Code(1), Some(1.0)),
            Err(MarginError::UnknownMargin { .. })
        ));
        assert!(matches!(
            s.add_output_margin("revdisp"),
            Err(MarginError::MissingTarget { .. })
        ));
    }

    #[test]
    fn adding_again_keeps_the_position() {
        let mut s = store(StoreConfig::default());
        s.add_free_margin("zone", None).unwrap();
        s.add_free_margin("rent", None).unwrap();
        let target = vec![
            (Modality::Code(1), Some(3.0)),
            (Modality::Code(2), Some(1.0)),
        ];
        s.add_variable("zone", Some(&target), MarginSource::Free)
            .unwrap();
        assert_eq!(s.table_vars(), vec!["zone", "rent"]);
        assert_eq!(s.view().len(), 3);
        assert_eq!(s.view()[0].target, Some(3.0));

        s.remove("zone").unwrap();
        assert_eq!(s.table_vars(), vec!["rent"]);
        s.remove_all();
        assert!(s.view().is_empty());
    }

    #[test]
    fn catalog_margins() {
        init();
        let mut s = store(StoreConfig::default());
        s.load_target_catalog(&margin_file(), MarginSource::Input);
        assert_eq!(s.total_population(), Some(5.0));
        assert_eq!(s.input_vars(), vec!["owner", "rent", "zone"]);
        assert_eq!(s.absent_vars(), vec!["unknown"]);

        assert!(matches!(
            s.add_input_margin("owner"),
            Err(MarginError::TargetMismatch { .. })
        ));
        assert_eq!(s.input_vars(), vec!["rent", "zone"]);

        s.add_input_margin("zone").unwrap();
        assert_eq!(s.input_vars(), vec!["rent"]);
        assert_eq!(s.view()[0].source, MarginSource::Input);
        assert_eq!(s.view()[1].target, Some(0.5));

        let outputs = MarginFile {
            year: "2020".to_string(),
            entries: vec![entry("revdisp", 0, Some(1100.0))],
        };
        s.load_target_catalog(&outputs, MarginSource::Output);
        assert_eq!(s.output_vars(), vec!["revdisp"]);
        s.add_output_margin("revdisp").unwrap();
        assert!(s.output_vars().is_empty());
    }

    #[test]
    fn load_margins_skips_bad_variables() {
        init();
        let mut s = store(StoreConfig::default());
        s.add_free_margin("zone", None).unwrap();
        s.set_target("zone", Modality::Code(1), Some(4.0)).unwrap();
        s.calibrate().unwrap();

        let report = s.load_margins(&margin_file()).unwrap();
        assert_eq!(report.loaded, vec!["zone", "rent"]);
        assert_eq!(report.skipped, vec!["unknown"]);
        assert_eq!(report.mismatched, vec!["owner"]);
        assert_eq!(report.total_population, Some(5.0));

        assert_eq!(s.weights().current(), s.weights().baseline());
        assert_eq!(s.total_population(), Some(5.0));
        assert_eq!(s.table_vars(), vec!["zone", "rent"]);
        assert!(s.view().iter().all(|r| r.source == MarginSource::Config));
        assert!(s.view().iter().all(|r| r.current == r.initial));
    }

    #[test]
    fn strict_load_changes_nothing() {
        let config = StoreConfig {
            strict_targets: true,
            ..StoreConfig::default()
        };
        let mut s = store(config);
        s.add_free_margin("rent", None).unwrap();
        let res = s.load_margins(&margin_file());
        assert!(matches!(res, Err(MarginError::TargetMismatch { .. })));
        assert_eq!(s.table_vars(), vec!["rent"]);
        assert_eq!(s.total_population(), None);
    }

    #[test]
    fn save_and_load() {
        let mut s = store(StoreConfig::default());
        assert!(matches!(
            s.to_margin_file("2020"),
            Err(MarginError::EmptyTable {})
        ));

        s.load_margins(&margin_file()).unwrap();
        let saved = s.to_margin_file("2020").unwrap();
        assert_eq!(
            saved.entries,
            vec![
                entry("zone", 1, Some(4.5)),
                entry("zone", 2, Some(0.5)),
                entry("rent", 0, Some(120.0)),
                entry(crate::TOTAL_POPULATION, 0, Some(5.0)),
            ]
        );

        let mut other = store(StoreConfig::default());
        other.load_margins(&saved).unwrap();
        assert_eq!(other.view(), s.view());
        assert_eq!(other.total_population(), s.total_population());
    }
}
