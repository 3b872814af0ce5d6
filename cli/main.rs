#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process;

use phenogam::fit::basis::KnotStrategy;
use phenogam::fit::construction::ColumnSource;
use phenogam::fit::data::ObservationTable;
use phenogam::fit::estimate::fit_gam;
use phenogam::fit::model::{
    FitConfig, GamModel, GroupConfig, GroupEffect, LambdaSelection, SmoothConfig,
};
use phenogam::pipeline::batch::{BatchConfig, GridSpec, run_batch};
use phenogam::pipeline::output::{write_bands, write_ensembles};
use phenogam::simulate::simulate_fitted;
use phenogam::{
    CovariancePolicy, CredibleBand, FittedModel, PredictionGrid, SimulationConfig,
    estimate_derivatives, summarize_simulation,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum KnotStrategyCli {
    Uniform,
    Quantile,
}

impl From<KnotStrategyCli> for KnotStrategy {
    fn from(value: KnotStrategyCli) -> Self {
        match value {
            KnotStrategyCli::Uniform => KnotStrategy::Uniform,
            KnotStrategyCli::Quantile => KnotStrategy::Quantile,
        }
    }
}

#[derive(Args)]
pub struct ModelArgs {
    /// Response column, e.g. the vegetation index
    #[arg(long, default_value = "ndvi")]
    pub response: String,

    /// Covariates that each get a smooth term (repeatable or comma-separated)
    #[arg(long = "smooth", value_delimiter = ',', value_name = "COLUMN")]
    pub smooths: Vec<String>,

    /// Number of internal knots per smooth
    #[arg(long, default_value = "10")]
    pub knots: usize,

    /// Polynomial degree of the spline bases
    #[arg(long, default_value = "3")]
    pub degree: usize,

    /// Order of the difference penalty matrix
    #[arg(long, default_value = "2")]
    pub penalty_order: usize,

    #[arg(long, value_enum, default_value_t = KnotStrategyCli::Uniform)]
    pub knot_strategy: KnotStrategyCli,

    /// Column entering the model as a group effect; numeric codes are
    /// treated as categories
    #[arg(long, value_name = "COLUMN")]
    pub group: Option<String>,

    /// Treat --group as a Gaussian random intercept instead of fixed dummies
    #[arg(long, requires = "group")]
    pub random_group: bool,

    /// Fixed smoothing parameters, one per penalty; skips GCV selection
    #[arg(long, value_delimiter = ',')]
    pub lambda: Vec<f64>,

    /// Maximum number of BFGS iterations when selecting smoothing parameters by GCV
    #[arg(long, default_value = "100")]
    pub gcv_max_iterations: usize,

    /// Gradient-norm tolerance for the GCV optimizer
    #[arg(long, default_value = "1e-6")]
    pub gcv_tolerance: f64,
}

impl ModelArgs {
    /// Builds the fit configuration; `fallback_smooth` is used when no
    /// `--smooth` was given.
    fn to_fit_config(&self, fallback_smooth: Option<&str>) -> Result<FitConfig, String> {
        let mut covariates = self.smooths.clone();
        if covariates.is_empty() {
            match fallback_smooth {
                Some(var) => covariates.push(var.to_string()),
                None => return Err("at least one --smooth covariate is required".to_string()),
            }
        }
        let smooths = covariates
            .iter()
            .map(|covariate| SmoothConfig {
                num_knots: self.knots,
                degree: self.degree,
                penalty_order: self.penalty_order,
                knot_strategy: self.knot_strategy.into(),
                ..SmoothConfig::new(covariate)
            })
            .collect();
        let group = self.group.as_ref().map(|column| GroupConfig {
            column: column.clone(),
            effect: if self.random_group {
                GroupEffect::Random
            } else {
                GroupEffect::Fixed
            },
        });
        let lambda = if self.lambda.is_empty() {
            LambdaSelection::Gcv {
                max_iterations: self.gcv_max_iterations,
                tolerance: self.gcv_tolerance,
            }
        } else {
            LambdaSelection::Fixed(self.lambda.clone())
        };
        Ok(FitConfig {
            response: self.response.clone(),
            smooths,
            group,
            lambda,
        })
    }
}

/// Simulation flags. Each one that is given overrides the `--config` file.
#[derive(Args)]
pub struct SimulationArgs {
    /// Number of posterior draws
    #[arg(long)]
    pub draws: Option<usize>,

    /// Simulate each smooth term separately instead of the whole predictor
    #[arg(long)]
    pub by_term: bool,

    /// Lower tail probability of the credible band
    #[arg(long)]
    pub lower_tail: Option<f64>,

    /// Upper tail probability of the credible band
    #[arg(long)]
    pub upper_tail: Option<f64>,

    /// Random seed for the coefficient draws
    #[arg(long)]
    pub seed: Option<u64>,

    /// Fail on covariance matrices that are not positive definite
    #[arg(long)]
    pub strict: bool,
}

impl SimulationArgs {
    fn apply(&self, mut config: SimulationConfig) -> SimulationConfig {
        if let Some(draws) = self.draws {
            config.draws = draws;
        }
        if self.by_term {
            config.by_term = true;
        }
        if let Some(lower) = self.lower_tail {
            config.lower_tail = lower;
        }
        if let Some(upper) = self.upper_tail {
            config.upper_tail = upper;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.strict {
            config.covariance_policy = CovariancePolicy::Strict;
        }
        config
    }
}

#[derive(Args)]
pub struct GridArgs {
    /// Prediction grid file (CSV or TSV); numeric columns are covariates,
    /// text columns are copied to the output
    #[arg(long, value_name = "PATH", conflicts_with = "grid_var")]
    pub grid: Option<PathBuf>,

    /// Covariate spanned by a regular grid
    #[arg(long, value_name = "COLUMN")]
    pub grid_var: Option<String>,

    #[arg(long, default_value = "1")]
    pub grid_start: f64,

    #[arg(long, default_value = "365")]
    pub grid_end: f64,

    #[arg(long, default_value = "365")]
    pub grid_len: usize,

    /// Group level predicted when the grid has no grouping column
    /// [default: the reference level of a fixed effect]
    #[arg(long, value_name = "LEVEL")]
    pub group_level: Option<String>,
}

impl GridArgs {
    fn build(
        &self,
        model: &GamModel,
        default_var: Option<&str>,
    ) -> Result<PredictionGrid, Box<dyn std::error::Error>> {
        let grid = match &self.grid {
            Some(path) => {
                println!("Loading prediction grid from: {}", path.display());
                PredictionGrid::from_csv(path)?
            }
            None => {
                let var = self
                    .grid_var
                    .as_deref()
                    .or(default_var)
                    .ok_or("either --grid or --grid-var is required")?;
                PredictionGrid::regular(var, self.grid_start, self.grid_end, self.grid_len)?
            }
        };
        Ok(model.complete_group_column(grid, self.group_level.as_deref())?)
    }
}

#[derive(Args)]
pub struct FitArgs {
    /// Observation table (CSV or TSV)
    pub data: PathBuf,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Where to write the fitted model
    #[arg(long, default_value = "model.toml")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Fitted model written by `phenogam fit`
    #[arg(long)]
    pub model: PathBuf,

    #[command(flatten)]
    pub grid: GridArgs,

    /// Smooth terms to simulate with --by-term (defaults to every smooth)
    #[arg(long, value_delimiter = ',')]
    pub vars: Vec<String>,

    #[command(flatten)]
    pub simulation: SimulationArgs,

    /// Band table output
    #[arg(long, default_value = "bands.csv")]
    pub out: PathBuf,

    /// Also write the raw ensemble in long format
    #[arg(long, value_name = "PATH")]
    pub ensemble_out: Option<PathBuf>,
}

#[derive(Args)]
pub struct DerivativesArgs {
    #[arg(long)]
    pub model: PathBuf,

    /// Covariate to differentiate along
    #[arg(long, default_value = "dayOfYear")]
    pub var: String,

    #[command(flatten)]
    pub grid: GridArgs,

    #[command(flatten)]
    pub simulation: SimulationArgs,

    /// Level band table output
    #[arg(long, default_value = "level_bands.csv")]
    pub out: PathBuf,

    /// Derivative band table output
    #[arg(long, default_value = "derivative_bands.csv")]
    pub derivative_out: PathBuf,
}

#[derive(Args)]
pub struct BatchArgs {
    pub data: PathBuf,

    /// Columns whose value combinations define the groups
    #[arg(long = "split", value_delimiter = ',', value_name = "COLUMN")]
    pub split_by: Vec<String>,

    /// Covariate to differentiate along
    #[arg(long, default_value = "dayOfYear")]
    pub var: String,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub simulation: SimulationArgs,

    /// Grid points per group
    #[arg(long, default_value = "365")]
    pub grid_len: usize,

    /// Fixed grid start; each group's observed range is used when omitted
    #[arg(long, requires = "grid_end")]
    pub grid_start: Option<f64>,

    #[arg(long, requires = "grid_start")]
    pub grid_end: Option<f64>,

    /// Groups with fewer complete rows are reported as failures
    #[arg(long, default_value = "20")]
    pub min_rows: usize,

    /// Keep every group's raw ensembles in the output directory
    #[arg(long)]
    pub keep_ensemble: bool,

    #[arg(long)]
    pub no_progress: bool,

    #[arg(long, default_value = "phenogam_out")]
    pub out_dir: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "phenogam",
    about = "Posterior simulation and derivative bands for smooth phenology models.",
    long_about = "Fits penalized-spline models of a vegetation index against day of year, \
                  draws coefficient vectors from their approximate posterior, and summarizes \
                  the simulated curves and their first derivatives as credible bands."
)]
struct Cli {
    /// Simulation settings file (TOML); flags given on the command line take precedence
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a smooth model and save it
    #[command(about = "Fit a penalized-spline model to an observation table")]
    Fit(FitArgs),

    /// Simulate a saved model over a prediction grid
    #[command(about = "Simulate fitted curves and write credible bands")]
    Simulate(SimulateArgs),

    /// Level and first-derivative bands along one covariate
    #[command(about = "Estimate derivative bands from simulated curves")]
    Derivatives(DerivativesArgs),

    /// Fit, simulate and differentiate every group of a split table
    #[command(about = "Run the per-group pipeline over a whole table")]
    Batch(BatchArgs),

    /// Show version information
    Version,
}

fn main() {
    env_logger::init();
    let Cli { config, command } = Cli::parse();

    let result = match command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Simulate(args)) => {
            base_config(config.as_deref()).and_then(|base| simulate_command(args, base))
        }
        Some(Commands::Derivatives(args)) => {
            base_config(config.as_deref()).and_then(|base| derivatives(args, base))
        }
        Some(Commands::Batch(args)) => {
            base_config(config.as_deref()).and_then(|base| batch(args, base))
        }
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            let printed = Cli::command().print_help();
            println!();
            printed.map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn base_config(path: Option<&Path>) -> Result<SimulationConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading simulation settings from: {}", path.display());
            Ok(SimulationConfig::load(path)?)
        }
        None => Ok(SimulationConfig::default()),
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, std::io::Error> {
    Ok(BufWriter::new(File::create(path)?))
}

fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.model.to_fit_config(None)?;
    println!("Loading observations from: {}", args.data.display());
    let table = ObservationTable::from_path(&args.data)?;

    let mut required = vec![config.response.as_str()];
    required.extend(config.smooths.iter().map(|s| s.covariate.as_str()));
    if let Some(group) = &config.group {
        required.push(group.column.as_str());
    }
    let table = table.complete_rows(&required)?;
    println!(
        "Fitting {} ~ {} on {} rows ({} dropped as incomplete)",
        config.response,
        config
            .smooths
            .iter()
            .map(|s| format!("s({})", s.covariate))
            .collect::<Vec<_>>()
            .join(" + "),
        table.nrows(),
        table.dropped_rows()
    );

    let model = fit_gam(&table, &config)?;
    let diagnostics = &model.reduce()?.diagnostics;
    println!(
        "Fitted {} model: edf {:.2}, scale {:.4e}, GCV {:.4e}, R^2 {:.3}",
        model.kind(),
        diagnostics.edf,
        diagnostics.scale,
        diagnostics.gcv,
        diagnostics.r_squared
    );
    model.save(&args.out)?;
    println!("Model saved to: {}", args.out.display());
    Ok(())
}

fn simulate_command(
    args: SimulateArgs,
    base: SimulationConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.simulation.apply(base);
    if args.ensemble_out.is_some() {
        config.keep_ensemble = true;
    }
    config.validate()?;

    println!("Loading model from: {}", args.model.display());
    let model = FittedModel::load(&args.model)?;
    let grid = args.grid.build(model.reduce()?, None)?;
    let vars = if args.vars.is_empty() {
        model.reduce()?.smooth_covariates()
    } else {
        args.vars.clone()
    };

    println!(
        "Simulating {} draws over {} grid rows (seed {})",
        config.draws,
        grid.nrows(),
        config.seed
    );
    let simulation = simulate_fitted(&model, &grid, &vars, &config)?;
    let bands = summarize_simulation(
        simulation,
        config.lower_tail,
        config.upper_tail,
        config.keep_ensemble,
    )?;
    let bands: Vec<&CredibleBand> = bands.iter().collect();

    write_bands(create(&args.out)?, &bands)?;
    println!("Bands saved to: {}", args.out.display());
    if let Some(path) = &args.ensemble_out {
        write_ensembles(create(path)?, &bands)?;
        println!("Ensemble saved to: {}", path.display());
    }
    Ok(())
}

fn derivatives(
    args: DerivativesArgs,
    base: SimulationConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.simulation.apply(base);
    config.validate()?;

    println!("Loading model from: {}", args.model.display());
    let model = FittedModel::load(&args.model)?;
    let grid = args.grid.build(model.reduce()?, Some(&args.var))?;

    println!(
        "Differentiating along '{}' with {} draws (seed {})",
        args.var, config.draws, config.seed
    );
    let bands = estimate_derivatives(model.reduce()?, &grid, &args.var, &config)?;
    let level: Vec<&CredibleBand> = bands.level.iter().collect();
    let derivative: Vec<&CredibleBand> = bands.derivative.iter().collect();

    write_bands(create(&args.out)?, &level)?;
    write_bands(create(&args.derivative_out)?, &derivative)?;
    println!(
        "Level bands saved to: {}\nDerivative bands saved to: {}",
        args.out.display(),
        args.derivative_out.display()
    );
    Ok(())
}

fn batch(args: BatchArgs, base: SimulationConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut simulation = args.simulation.apply(base);
    if args.keep_ensemble {
        simulation.keep_ensemble = true;
    }
    let grid = match (args.grid_start, args.grid_end) {
        (Some(start), Some(end)) => GridSpec::Regular {
            start,
            end,
            len: args.grid_len,
        },
        _ => GridSpec::ObservedRange { len: args.grid_len },
    };
    let config = BatchConfig {
        split_by: args.split_by.clone(),
        fit: args.model.to_fit_config(Some(&args.var))?,
        var: args.var.clone(),
        grid,
        simulation,
        min_rows: args.min_rows,
        show_progress: !args.no_progress,
    };

    println!("Loading observations from: {}", args.data.display());
    let table = ObservationTable::from_path(&args.data)?;
    println!("Loaded {} rows", table.nrows());

    let report = run_batch(&table, &config)?;
    report.write_to_dir(&args.out_dir)?;
    println!(
        "{} group(s) succeeded, {} failed. Results in: {}",
        report.results.len(),
        report.failures.len(),
        args.out_dir.display()
    );
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const YEAR: u64 = 365 * DAY;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else if seconds < WEEK {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    } else if seconds < YEAR {
        format!("{:.1} weeks ago", seconds as f64 / WEEK as f64)
    } else {
        format!("{:.1} years ago", seconds as f64 / YEAR as f64)
    }
}

fn print_version_info() {
    let build_timestamp: u64 = env!("PHENOGAM_BUILD_TIMESTAMP").parse().unwrap_or(0);
    println!("phenogam {}", env!("CARGO_PKG_VERSION"));

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
