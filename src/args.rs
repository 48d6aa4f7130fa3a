use clap::Parser;

/// Calibrates the weights of a survey on margins.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path, optional) The JSON file describing the survey tables, the margins and the calibration
    /// settings. See the manual of the calmar library for the format.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,

    /// (file path, optional) The survey table (one row per individual). Overrides the inputs of the configuration.
    #[clap(short, long, value_parser)]
    pub input: Option<String>,

    /// (csv or excel, default csv) The format of the survey table given with --input.
    #[clap(long, value_parser)]
    pub input_type: Option<String>,

    /// (default first sheet) When using an Excel file, the name of the worksheet to use.
    #[clap(long, value_parser)]
    pub excel_worksheet_name: Option<String>,

    /// (list of comma-separated names) Variables of the survey table to treat as categorical,
    /// in addition to the ones declared in the configuration.
    #[clap(long, value_parser, value_delimiter = ',')]
    pub categorical: Option<Vec<String>>,

    /// (file path) The margin file to load. Overrides the margins file of the configuration.
    #[clap(short, long, value_parser)]
    pub margins: Option<String>,

    /// The year of the targets: the column to read in the margin files.
    #[clap(short, long, value_parser)]
    pub year: Option<String>,

    /// (linear, raking_ratio or logit) Overrides the calibration method of the configuration.
    #[clap(long, value_parser)]
    pub method: Option<String>,

    /// (file path, 'stdout' or empty) If specified, the summary of the calibration will be written in JSON format
    /// to the given location.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// (file path or empty) If specified, the targets of the margin table are saved to this file.
    #[clap(long, value_parser)]
    pub save_margins: Option<String>,

    /// (file path or empty) If specified, the baseline and calibrated weights of each household unit are
    /// written to this CSV file.
    #[clap(long, value_parser)]
    pub weights_out: Option<String>,

    /// (file path) A reference summary in JSON format. If provided, calage checks that the summary of the
    /// calibration matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
