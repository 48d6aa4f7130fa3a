use crate::calage::*;
use snafu::prelude::*;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TableSource {
    /// csv (default) or excel
    pub provider: Option<String>,
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "excelWorksheetName")]
    pub excel_worksheet_name: Option<String>,
    /// The column holding the household identifier. If absent, every row is a household unit.
    #[serde(rename = "householdColumn")]
    pub household_column: Option<String>,
    /// The column holding the role in the household (0 for the head).
    #[serde(rename = "roleColumn")]
    pub role_column: Option<String>,
}

impl TableSource {
    pub fn from_path(path: &str, provider: Option<String>) -> TableSource {
        TableSource {
            provider,
            file_path: path.to_string(),
            excel_worksheet_name: None,
            household_column: None,
            role_column: None,
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSettings {
    /// enum, bool, ages, date or numeric (default)
    pub kind: Option<String>,
    pub label: Option<String>,
    /// Labels of the codes of an enum column.
    pub labels: Option<BTreeMap<String, String>>,
}

impl ColumnSettings {
    pub fn column_meta(&self, column: &str) -> CalageResult<ColumnMeta> {
        let kind_name = self.kind.clone().unwrap_or_else(|| "numeric".to_string());
        let mut kind = ColumnKind::from_name(&kind_name).context(UnknownColumnKindSnafu {
            column,
            kind: kind_name.clone(),
        })?;
        if let (ColumnKind::Enum(mapping), Some(labels)) = (&mut kind, &self.labels) {
            for (code, label) in labels.iter() {
                let c = code.trim().parse::<i64>().ok().context(InvalidCodeSnafu {
                    column,
                    code: code.clone(),
                })?;
                mapping.insert(c, label.clone());
            }
        }
        Ok(ColumnMeta {
            label: self.label.clone(),
            kind,
        })
    }
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// linear (default), raking ratio or logit
    pub method: Option<String>,
    /// Upper bound of the weight ratio.
    pub up: Option<f64>,
    /// Inverse of the lower bound of the weight ratio.
    pub invlo: Option<f64>,
    #[serde(rename = "useProportions")]
    pub use_proportions: Option<bool>,
    #[serde(rename = "totalPopulation")]
    pub total_population: Option<f64>,
    pub tolerance: Option<f64>,
    #[serde(rename = "maxIterations")]
    pub max_iterations: Option<u32>,
}

impl CalibrationSettings {
    pub fn empty() -> CalibrationSettings {
        CalibrationSettings {
            method: None,
            up: None,
            invlo: None,
            use_proportions: None,
            total_population: None,
            tolerance: None,
            max_iterations: None,
        }
    }

    pub fn params(&self) -> CalageResult<CalibrationParams> {
        let defaults = CalibrationParams::DEFAULT_PARAMS;
        let method = match &self.method {
            Some(name) => CalibrationMethod::from_name(name.as_str())
                .context(UnknownMethodSnafu { name: name.clone() })?,
            None => defaults.method,
        };
        let lower = match self.invlo {
            Some(invlo) if invlo > 0.0 => 1.0 / invlo,
            Some(invlo) => {
                whatever!("invlo must be strictly positive, got {}", invlo)
            }
            None => defaults.lower,
        };
        Ok(CalibrationParams {
            method,
            lower,
            upper: self.up.unwrap_or(defaults.upper),
            total_population: self.total_population,
            use_proportions: self.use_proportions.unwrap_or(defaults.use_proportions),
            tolerance: self.tolerance.unwrap_or(defaults.tolerance),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
        })
    }
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CalageConfig {
    /// The year of the targets in the margin files.
    pub year: String,
    pub inputs: TableSource,
    /// The variables computed by the simulation, for the same individuals.
    pub outputs: Option<TableSource>,
    /// Description of the columns. Undeclared columns are numeric.
    pub columns: Option<BTreeMap<String, ColumnSettings>>,
    #[serde(rename = "weightVariable")]
    pub weight_variable: Option<String>,
    #[serde(rename = "baselineWeightVariable")]
    pub baseline_weight_variable: Option<String>,
    /// Saved margins: the variables of the table and their targets.
    #[serde(rename = "marginsFile")]
    pub margins_file: Option<String>,
    /// Reference targets for input variables.
    #[serde(rename = "inputMarginsFile")]
    pub input_margins_file: Option<String>,
    /// Reference targets for output variables.
    #[serde(rename = "outputMarginsFile")]
    pub output_margins_file: Option<String>,
    pub calibration: Option<CalibrationSettings>,
    #[serde(rename = "strictTargets")]
    pub strict_targets: Option<bool>,
}

impl CalageConfig {
    pub fn store_config(&self) -> CalageResult<StoreConfig> {
        let defaults = StoreConfig::default();
        let params = match &self.calibration {
            Some(c) => c.params()?,
            None => CalibrationSettings::empty().params()?,
        };
        Ok(StoreConfig {
            weight_variable: self
                .weight_variable
                .clone()
                .unwrap_or(defaults.weight_variable),
            baseline_weight_variable: self
                .baseline_weight_variable
                .clone()
                .unwrap_or(defaults.baseline_weight_variable),
            params,
            strict_targets: self.strict_targets.unwrap_or(defaults.strict_targets),
        })
    }

    /// The description of every declared column.
    pub fn column_metas(&self) -> CalageResult<BTreeMap<String, ColumnMeta>> {
        let mut res: BTreeMap<String, ColumnMeta> = BTreeMap::new();
        if let Some(columns) = &self.columns {
            for (name, settings) in columns.iter() {
                res.insert(name.clone(), settings.column_meta(name)?);
            }
        }
        Ok(res)
    }
}

pub fn read_config(path: &str) -> CalageResult<CalageConfig> {
    let config_str = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let config: CalageConfig =
        serde_json::from_str(&config_str).context(ParsingJsonSnafu {})?;
    debug!("read_config: {:?}", config);
    Ok(config)
}

pub fn read_summary(path: &str) -> CalageResult<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
    Ok(js)
}
