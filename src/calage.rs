use log::{debug, info, warn};

use calmar::margin_file::MarginFile;
use calmar::store::{LoadReport, MarginStore};
use calmar::*;
use snafu::{prelude::*, Snafu};

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::json;
use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::args::Args;
use crate::calage::config_reader::*;
use crate::calage::io_common::{assemble_table, resolve_path, simplify_file_name, SurveyTable};

mod config_reader;
mod io_common;
mod io_csv;
mod io_excel;

#[derive(Debug, Snafu)]
pub enum CalageError {
    #[snafu(display("Error opening file {path}"))]
    OpeningExcel {
        source: calamine::XlsxError,
        path: String,
    },
    #[snafu(display("No worksheet or no header in file {path}"))]
    EmptyExcel { path: String },
    #[snafu(display("Line {lineno}: unexpected cell {content}"))]
    ExcelWrongCellType { lineno: usize, content: String },
    #[snafu(display("Error opening file {path}"))]
    CsvOpen { source: csv::Error, path: String },
    #[snafu(display("Error parsing a CSV line"))]
    CsvLineParse { source: csv::Error },
    #[snafu(display("Error writing file {path}"))]
    CsvWrite { source: csv::Error, path: String },
    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing JSON: {source}"))]
    ParsingJson { source: serde_json::Error },
    #[snafu(display("Error accessing file {path}"))]
    FileAccess {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Cannot find the directory of the configuration file"))]
    MissingParentDir {},
    #[snafu(display("Missing column {column}"))]
    MissingColumn { column: String },
    #[snafu(display("Column {column}, line {lineno}: invalid value {content}"))]
    CellValue {
        column: String,
        lineno: usize,
        content: String,
    },
    #[snafu(display("Column {column}: unknown kind {kind}"))]
    UnknownColumnKind { column: String, kind: String },
    #[snafu(display("Column {column}: invalid code {code}"))]
    InvalidCode { column: String, code: String },
    #[snafu(display("Unknown calibration method {name}"))]
    UnknownMethod { name: String },
    #[snafu(display("Household {id} only appears in {file}"))]
    UnmatchedHousehold { id: String, file: String },
    #[snafu(display("Invalid survey table: {source}"))]
    Table { source: TableError },
    #[snafu(display("{source}"))]
    Margins { source: MarginError },
    #[snafu(display("Margin file {path}: {source}"))]
    MarginFileAccess {
        source: MarginFileError,
        path: String,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

type CalageResult<T> = Result<T, CalageError>;

/// The state of the session after the calibration.
struct CalageRun {
    store: MarginStore,
    outcome: CalibrationOutcome,
    report: Option<LoadReport>,
    household_ids: Vec<String>,
}

fn fmt2(x: f64) -> String {
    format!("{:.2}", x)
}

fn fmt4(x: f64) -> String {
    format!("{:.4}", x)
}

fn margins_to_json(margins: &[Margin]) -> Vec<JSValue> {
    margins
        .iter()
        .map(|m| {
            json!({
                "variable": m.variable,
                "label": m.label,
                "modality": m.modality.to_string(),
                "modalityLabel": m.modality_label,
                "target": m.target.map(fmt2),
                "adjustedTarget": m.adjusted_target.map(fmt2),
                "initial": fmt2(m.initial),
                "achieved": fmt2(m.current),
                "source": m.source.as_str(),
            })
        })
        .collect()
}

fn build_summary_js(config: &CalageConfig, run: &CalageRun) -> JSValue {
    let params = run.store.params();
    let report_js = run.report.as_ref().map(|r| {
        json!({
            "loaded": r.loaded,
            "skipped": r.skipped,
            "mismatched": r.mismatched,
        })
    });
    let ratio_js = run.store.ratio_summary().map(|s| {
        json!({
            "min": fmt4(s.min),
            "max": fmt4(s.max),
            "mean": fmt4(s.mean),
        })
    });
    let final_total: f64 = run.store.weights().current().iter().sum();
    json!({
        "config": {
            "inputs": simplify_file_name(&config.inputs.file_path),
            "year": config.year,
            "method": params.method.as_str(),
            "lower": fmt4(params.lower),
            "upper": fmt4(params.upper),
            "useProportions": params.use_proportions,
            "totalPopulation": params.total_population.map(fmt2),
        },
        "results": {
            "converged": run.outcome.converged,
            "initialTotalPopulation": fmt2(run.store.initial_total_population()),
            "finalTotalPopulation": fmt2(final_total),
            "margins": margins_to_json(run.store.view()),
            "loadReport": report_js,
            "weightRatio": ratio_js,
        }
    })
}

/// The configuration when no configuration file is given.
fn config_from_args(args: &Args) -> CalageResult<CalageConfig> {
    let input = match &args.input {
        Some(x) => x.clone(),
        None => {
            whatever!("Either --config or --input must be provided")
        }
    };
    let year = match &args.year {
        Some(x) => x.clone(),
        None => {
            whatever!("--year must be provided when no configuration file is given")
        }
    };
    Ok(CalageConfig {
        year,
        inputs: TableSource::from_path(&input, args.input_type.clone()),
        outputs: None,
        columns: None,
        weight_variable: None,
        baseline_weight_variable: None,
        margins_file: None,
        input_margins_file: None,
        output_margins_file: None,
        calibration: None,
        strict_targets: None,
    })
}

/// Applies the command line options on top of the configuration.
fn apply_overrides(mut config: CalageConfig, args: &Args) -> CalageConfig {
    if let Some(year) = &args.year {
        config.year = year.clone();
    }
    if let Some(margins) = &args.margins {
        config.margins_file = Some(margins.clone());
    }
    if let Some(input) = &args.input {
        config.inputs.file_path = input.clone();
    }
    if args.input_type.is_some() {
        config.inputs.provider = args.input_type.clone();
    }
    if args.excel_worksheet_name.is_some() {
        config.inputs.excel_worksheet_name = args.excel_worksheet_name.clone();
    }
    if let Some(method) = &args.method {
        let mut settings = config
            .calibration
            .clone()
            .unwrap_or_else(CalibrationSettings::empty);
        settings.method = Some(method.clone());
        config.calibration = Some(settings);
    }
    config
}

fn read_survey(
    source: &TableSource,
    root: Option<&Path>,
    metas: &BTreeMap<String, ColumnMeta>,
) -> CalageResult<SurveyTable> {
    let path = resolve_path(root, &source.file_path);
    info!("Attempting to read survey table {:?}", path);
    let raw = match source.provider.as_deref().unwrap_or("csv") {
        "csv" => io_csv::read_csv_table(&path)?,
        "excel" | "xlsx" => {
            io_excel::read_excel_table(&path, source.excel_worksheet_name.as_deref())?
        }
        x => {
            whatever!("Provider not implemented {:?}", x)
        }
    };
    assemble_table(&raw, source, metas)
}

fn read_margin_file(root: Option<&Path>, file_path: &str, year: &str) -> CalageResult<MarginFile> {
    let path = resolve_path(root, file_path);
    info!("Attempting to read margin file {:?} for {}", path, year);
    let file = File::open(&path).context(FileAccessSnafu { path: path.clone() })?;
    MarginFile::read(file, year).context(MarginFileAccessSnafu { path })
}

/// Reads the survey, loads the margins and calibrates the weights.
fn calibrate_survey(
    config: &CalageConfig,
    root: Option<&Path>,
    categorical: &[String],
) -> CalageResult<CalageRun> {
    let mut metas = config.column_metas()?;
    for name in categorical.iter() {
        metas.entry(name.clone()).or_insert(ColumnMeta {
            label: None,
            kind: ColumnKind::Enum(BTreeMap::new()),
        });
    }
    let store_config = config.store_config()?;
    let configured_total_population = store_config.params.total_population;

    let inputs = read_survey(&config.inputs, root, &metas)?;
    let outputs = match &config.outputs {
        Some(source) => {
            let mut outputs = read_survey(source, root, &metas)?;
            outputs.align_to(
                &inputs.household_ids,
                &source.file_path,
                &config.inputs.file_path,
            )?;
            Some(outputs)
        }
        None => None,
    };
    let household_ids = inputs.household_ids.clone();
    let outputs_table: Option<Box<dyn calmar::datatable::SurveyData>> = match outputs {
        Some(o) => Some(Box::new(o.table)),
        None => None,
    };
    let mut store = MarginStore::new(Box::new(inputs.table), outputs_table, store_config)
        .context(MarginsSnafu {})?;

    if let Some(p) = &config.input_margins_file {
        let mf = read_margin_file(root, p, &config.year)?;
        store.load_target_catalog(&mf, MarginSource::Input);
    }
    if let Some(p) = &config.output_margins_file {
        let mf = read_margin_file(root, p, &config.year)?;
        store.load_target_catalog(&mf, MarginSource::Output);
    }

    let report = match &config.margins_file {
        Some(p) => {
            let mf = read_margin_file(root, p, &config.year)?;
            Some(store.load_margins(&mf).context(MarginsSnafu {})?)
        }
        None if config.input_margins_file.is_some() || config.output_margins_file.is_some() => {
            // Without saved margins, every reference margin is used.
            let mut report = LoadReport {
                skipped: store.absent_vars(),
                total_population: store.total_population(),
                ..LoadReport::default()
            };
            for variable in store.input_vars() {
                add_reference_margin(&mut store, &variable, MarginSource::Input, &mut report)?;
            }
            for variable in store.output_vars() {
                add_reference_margin(&mut store, &variable, MarginSource::Output, &mut report)?;
            }
            Some(report)
        }
        None => None,
    };
    if configured_total_population.is_some() {
        store.set_total_population(configured_total_population);
    }
    if store.view().is_empty() {
        warn!("The margin table is empty: only the total population can be calibrated");
    }

    info!(
        "Calibrating {} margins with method {}",
        store.view().len(),
        store.params().method
    );
    let outcome = store.calibrate().context(MarginsSnafu {})?;
    if outcome.did_not_converge() {
        warn!(
            "The calibration did not converge after {} iterations, keeping the best weights",
            outcome.iterations
        );
    } else {
        info!("The calibration converged after {} iterations", outcome.iterations);
    }
    Ok(CalageRun {
        store,
        outcome,
        report,
        household_ids,
    })
}

fn add_reference_margin(
    store: &mut MarginStore,
    variable: &str,
    source: MarginSource,
    report: &mut LoadReport,
) -> CalageResult<()> {
    let res = match source {
        MarginSource::Output => store.add_output_margin(variable),
        _ => store.add_input_margin(variable),
    };
    match res {
        Ok(()) => report.loaded.push(variable.to_string()),
        // Already logged by the store.
        Err(MarginError::TargetMismatch { .. }) => report.mismatched.push(variable.to_string()),
        Err(e) => return Err(e).context(MarginsSnafu {}),
    }
    Ok(())
}

fn write_weights(path: &str, run: &CalageRun, config: &StoreConfig) -> CalageResult<()> {
    let mut wtr = csv::Writer::from_path(path).context(CsvWriteSnafu { path })?;
    wtr.write_record([
        "household",
        config.baseline_weight_variable.as_str(),
        config.weight_variable.as_str(),
    ])
    .context(CsvWriteSnafu { path })?;
    let weights = run.store.weights();
    for ((id, b), w) in run
        .household_ids
        .iter()
        .zip(weights.baseline().iter())
        .zip(weights.current().iter())
    {
        wtr.write_record([id.clone(), b.to_string(), w.to_string()])
            .context(CsvWriteSnafu { path })?;
    }
    wtr.flush().context(FileAccessSnafu { path })?;
    info!("Wrote {} weights to {}", weights.len(), path);
    Ok(())
}

fn save_margins(path: &str, run: &CalageRun, year: &str) -> CalageResult<()> {
    let mf = run.store.to_margin_file(year).context(MarginsSnafu {})?;
    let file = File::create(path).context(FileAccessSnafu { path })?;
    mf.write(file).context(MarginFileAccessSnafu { path })?;
    info!("Saved {} margins to {}", mf.entries.len(), path);
    Ok(())
}

/// Runs a calibration from the command line arguments and returns the summary.
pub fn run_calage(args: &Args) -> CalageResult<JSValue> {
    let (config, root): (CalageConfig, Option<PathBuf>) = match &args.config {
        Some(config_path) => {
            let config = read_config(config_path)?;
            let root = Path::new(config_path)
                .parent()
                .context(MissingParentDirSnafu {})?
                .to_path_buf();
            (config, Some(root))
        }
        None => (config_from_args(args)?, None),
    };
    let config = apply_overrides(config, args);
    info!("config: {:?}", config);

    let categorical = args.categorical.clone().unwrap_or_default();
    let run = calibrate_survey(&config, root.as_deref(), &categorical)?;

    let result_js = build_summary_js(&config, &run);
    let pretty_js_stats = serde_json::to_string_pretty(&result_js).context(ParsingJsonSnafu {})?;
    match args.out.as_deref() {
        Some("stdout") => println!("{}", pretty_js_stats),
        Some(path) => {
            fs::write(path, &pretty_js_stats).context(FileAccessSnafu { path })?;
        }
        None => debug!("summary: {}", pretty_js_stats),
    }

    if let Some(path) = &args.save_margins {
        save_margins(path, &run, &config.year)?;
    }
    if let Some(path) = &args.weights_out {
        write_weights(path, &run, run.store.config())?;
    }

    // The reference summary, if provided for comparison
    if let Some(summary_p) = &args.reference {
        let summary_ref = read_summary(summary_p)?;
        let pretty_js_summary_ref =
            serde_json::to_string_pretty(&summary_ref).context(ParsingJsonSnafu {})?;
        if pretty_js_summary_ref != pretty_js_stats {
            warn!("Found differences with the reference summary");
            print_diff(
                pretty_js_summary_ref.as_str(),
                pretty_js_stats.as_ref(),
                "\n",
            );
            whatever!("Difference detected between calculated summary and reference summary")
        }
    }

    Ok(result_js)
}
