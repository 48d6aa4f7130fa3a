// ********* Input data structures ***********

use std::collections::BTreeMap;
use std::fmt::Display;

use snafu::prelude::*;

use crate::datatable::Origin;

/// The kind of a survey column. It decides how the margins of a variable are built.
#[derive(PartialEq, Debug, Clone)]
pub enum ColumnKind {
    /// Categorical codes, with an optional mapping from code to label.
    Enum(BTreeMap<i64, String>),
    Bool,
    Ages,
    Date,
    /// Any other quantity. Such a variable has a single `total` margin.
    Numeric,
}

impl ColumnKind {
    /// True when the margins are built per modality.
    pub fn is_categorical(&self) -> bool {
        !matches!(self, ColumnKind::Numeric)
    }

    pub fn from_name(name: &str) -> Option<ColumnKind> {
        match name {
            "enum" => Some(ColumnKind::Enum(BTreeMap::new())),
            "bool" => Some(ColumnKind::Bool),
            "ages" => Some(ColumnKind::Ages),
            "date" => Some(ColumnKind::Date),
            "numeric" | "float" | "int" => Some(ColumnKind::Numeric),
            _ => None,
        }
    }
}

/// Description of a column, as exposed by the data layer.
#[derive(PartialEq, Debug, Clone)]
pub struct ColumnMeta {
    pub label: Option<String>,
    pub kind: ColumnKind,
}

impl ColumnMeta {
    pub fn numeric() -> ColumnMeta {
        ColumnMeta {
            label: None,
            kind: ColumnKind::Numeric,
        }
    }
}

/// A level of a categorical variable, or the sentinel for scalar variables.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum Modality {
    Total,
    Code(i64),
}

impl Modality {
    /// The value written in the `mod` column of a margin file.
    pub fn file_code(&self) -> i64 {
        match self {
            Modality::Total => 0,
            Modality::Code(c) => *c,
        }
    }
}

impl Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Total => write!(f, "total"),
            Modality::Code(c) => write!(f, "{}", c),
        }
    }
}

/// Where the target of a margin comes from.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum MarginSource {
    /// Reference margins for survey inputs.
    Input,
    /// Reference margins for computed outputs.
    Output,
    /// Entered by the operator.
    Free,
    /// Loaded from a saved margin file.
    Config,
}

impl MarginSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginSource::Input => "input",
            MarginSource::Output => "output",
            MarginSource::Free => "free",
            MarginSource::Config => "config",
        }
    }
}

/// Targets for the modalities of a variable. A missing value means that the
/// modality is shown but not calibrated.
pub type Targets = Vec<(Modality, Option<f64>)>;

/// One row of the margin table.
#[derive(PartialEq, Debug, Clone)]
pub struct Margin {
    pub variable: String,
    /// The label of the variable, or its name when it has none.
    pub label: String,
    pub modality: Modality,
    pub modality_label: String,
    pub target: Option<f64>,
    /// The target actually used by the last calibration (after the proportional rescaling).
    pub adjusted_target: Option<f64>,
    /// Weighted value with the current weights.
    pub current: f64,
    /// Weighted value with the baseline weights.
    pub initial: f64,
    pub source: MarginSource,
}

/// A calibration constraint: the value of every household unit and the
/// target of the weighted sum.
#[derive(PartialEq, Debug, Clone)]
pub struct Constraint {
    pub variable: String,
    pub modality: Modality,
    pub values: Vec<f64>,
    pub target: f64,
}

// ******** Output data structures *********

#[derive(PartialEq, Debug, Clone)]
pub struct AchievedMargin {
    pub variable: String,
    pub modality: Modality,
    pub target: f64,
    pub adjusted_target: f64,
    pub achieved: f64,
}

#[derive(PartialEq, Debug, Clone)]
pub struct CalibrationOutcome {
    pub weights: Vec<f64>,
    pub margins: Vec<AchievedMargin>,
    pub iterations: u32,
    /// False when the maximum number of iterations was reached, or when the
    /// solver could not improve the margins any more. The weights are then
    /// the best ones found.
    pub converged: bool,
}

impl CalibrationOutcome {
    pub fn did_not_converge(&self) -> bool {
        !self.converged
    }
}

// ********* Errors **********

/// Errors raised while building or editing margins.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MarginError {
    #[snafu(display("Variable {variable} is absent from both inputs and outputs"))]
    VariableNotFound { variable: String },
    #[snafu(display(
        "Problem with variable {variable}: {provided} target keys for {expected} modalities"
    ))]
    TargetMismatch {
        variable: String,
        expected: usize,
        provided: usize,
    },
    #[snafu(display("No values for variable {variable} in the {origin:?} table"))]
    MissingValues { variable: String, origin: Origin },
    #[snafu(display("Weight variable {variable} is missing from the inputs"))]
    MissingWeights { variable: String },
    #[snafu(display("Weight vector has {found} entries for {expected} household units"))]
    WeightLength { expected: usize, found: usize },
    #[snafu(display("No {source_name} target is known for variable {variable}"))]
    MissingTarget {
        variable: String,
        source_name: &'static str,
    },
    #[snafu(display("Variable {variable} is not in the margin table"))]
    NotInTable { variable: String },
    #[snafu(display("No margin {variable} / {modality} in the margin table"))]
    UnknownMargin { variable: String, modality: Modality },
    #[snafu(display("The margin table is empty"))]
    EmptyTable {},
    #[snafu(display("Calibration could not start: {source}"))]
    Calibration { source: CalibrationError },
}

/// Errors that prevent the calibration from starting. Non convergence is not one of them.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum CalibrationError {
    #[snafu(display("Invalid bounds [{lower}, {upper}] for method {method}"))]
    InvalidBounds {
        method: CalibrationMethod,
        lower: f64,
        upper: f64,
    },
    #[snafu(display("Margin {variable} has {found} values for {expected} weights"))]
    DimensionMismatch {
        variable: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MarginFileError {
    #[snafu(display("Could not read the margin file: {source}"))]
    ReadingCsv { source: csv::Error },
    #[snafu(display("Could not write the margin file: {source}"))]
    WritingCsv { source: csv::Error },
    #[snafu(display("Could not flush the margin file: {source}"))]
    Flushing { source: std::io::Error },
    #[snafu(display("The margin file has no column {column}"))]
    MissingColumn { column: String },
    #[snafu(display("Line {lineno} of the margin file: {reason}"))]
    InvalidRow { lineno: usize, reason: String },
}

#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    #[snafu(display("Column {name} has {found} values for {expected} rows"))]
    ColumnLength {
        name: String,
        expected: usize,
        found: usize,
    },
    #[snafu(display("{found} roles given for {expected} rows"))]
    RoleLength { expected: usize, found: usize },
    #[snafu(display("Invalid renumbering of {num_units} household units: {found:?}"))]
    UnitOrder { num_units: usize, found: Vec<usize> },
}

// ********* Configuration **********

/// The distance function of the calibration.
///
/// - Linear: the weight ratio is an affine function of the calibration
///   variables. Fast, but only the bounds prevent negative weights.
/// - RakingRatio: the weight ratio is an exponential. This is the classic
///   iterative proportional fitting when all margins are categorical.
/// - Logit: the weight ratio stays strictly between the bounds.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum CalibrationMethod {
    Linear,
    RakingRatio,
    Logit,
}

impl CalibrationMethod {
    pub fn from_name(name: &str) -> Option<CalibrationMethod> {
        match name {
            "linear" => Some(CalibrationMethod::Linear),
            "raking ratio" | "raking_ratio" | "raking-ratio" => Some(CalibrationMethod::RakingRatio),
            "logit" => Some(CalibrationMethod::Logit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationMethod::Linear => "linear",
            CalibrationMethod::RakingRatio => "raking ratio",
            CalibrationMethod::Logit => "logit",
        }
    }
}

impl Display for CalibrationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct CalibrationParams {
    pub method: CalibrationMethod,
    /// Lower bound of the weight ratio.
    pub lower: f64,
    /// Upper bound of the weight ratio. May be infinite except for the logit method.
    pub upper: f64,
    /// If set, the sum of the weights is calibrated to this value.
    pub total_population: Option<f64>,
    /// Rescale the targets of each categorical variable so that they sum to
    /// the total population.
    pub use_proportions: bool,
    /// Relative tolerance on every margin.
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl CalibrationParams {
    pub const DEFAULT_PARAMS: CalibrationParams = CalibrationParams {
        method: CalibrationMethod::Linear,
        lower: 1.0 / 3.0,
        upper: 3.0,
        total_population: None,
        use_proportions: false,
        tolerance: 1e-6,
        max_iterations: 100,
    };

    pub fn with_bounds(method: CalibrationMethod, lower: f64, upper: f64) -> CalibrationParams {
        CalibrationParams {
            method,
            lower,
            upper,
            ..CalibrationParams::DEFAULT_PARAMS
        }
    }
}

/// Configuration of a margin store, passed at construction.
#[derive(PartialEq, Debug, Clone)]
pub struct StoreConfig {
    /// The input variable holding the current weights.
    pub weight_variable: String,
    /// The input variable holding the baseline weights.
    pub baseline_weight_variable: String,
    pub params: CalibrationParams,
    /// When loading a margin file, reject the whole file if the targets of a
    /// variable do not match its modalities, instead of dropping the variable.
    pub strict_targets: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            weight_variable: "wprm".to_string(),
            baseline_weight_variable: "wprm_init".to_string(),
            params: CalibrationParams::DEFAULT_PARAMS,
            strict_targets: false,
        }
    }
}
