//! Per-group batch runs: one model, one level band and one derivative band per
//! combination of the split columns (for example land cover x year).
//!
//! Groups run in parallel. Each group simulates with its own seed derived from
//! the base seed and the group's position in key order, so results do not
//! depend on thread scheduling. A failing group is recorded and skipped.

use crate::config::SimulationConfig;
use crate::derivative::{DerivativeBands, estimate_derivatives};
use crate::fit::construction::ColumnSource;
use crate::fit::data::{DataError, GroupKey, ObservationTable};
use crate::fit::estimate::{FitError, fit_gam};
use crate::fit::model::{FitConfig, FitDiagnostics};
use crate::grid::PredictionGrid;
use crate::model::FittedModel;
use crate::pipeline::output::OutputError;
use crate::simulate::SimulationError;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::Array1;
use rayon::prelude::*;
use std::io::IsTerminal;
use thiserror::Error;

const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Fit failed: {0}")]
    Fit(#[from] FitError),
    #[error("Simulation failed: {0}")]
    Simulation(#[from] SimulationError),
    #[error("Output failed: {0}")]
    Output(#[from] OutputError),
    #[error("Invalid batch configuration: {0}")]
    InvalidConfig(String),
}

/// Where the prediction grid over the derivative variable lies.
#[derive(Debug, Clone, PartialEq)]
pub enum GridSpec {
    Regular { start: f64, end: f64, len: usize },
    /// `len` points spanning each group's observed range.
    ObservedRange { len: usize },
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub split_by: Vec<String>,
    /// The covariate to differentiate along, e.g. `dayOfYear`.
    pub var: String,
    pub fit: FitConfig,
    pub grid: GridSpec,
    pub simulation: SimulationConfig,
    pub min_rows: usize,
    pub show_progress: bool,
}

#[derive(Debug, Clone)]
pub struct GroupResult {
    pub key: GroupKey,
    pub model: FittedModel,
    pub model_kind: &'static str,
    pub diagnostics: FitDiagnostics,
    pub dropped_rows: usize,
    pub seed: u64,
    pub bands: DerivativeBands,
}

#[derive(Debug)]
pub struct GroupFailure {
    pub key: GroupKey,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<GroupResult>,
    pub failures: Vec<GroupFailure>,
}

/// Seed for the `ordinal`-th group. Never shares a generator between groups.
pub fn derive_seed(base: u64, ordinal: usize) -> u64 {
    base ^ SEED_STRIDE.wrapping_mul(ordinal as u64 + 1)
}

fn create_progress_bar(len: u64, visible: bool) -> ProgressBar {
    let draw_target = if visible && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    match ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} groups ({eta}) {msg}",
    ) {
        Ok(style) => pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  ")),
        Err(e) => log::debug!("Falling back to the default progress style: {e}"),
    }
    pb
}

fn validate(config: &BatchConfig) -> Result<(), PipelineError> {
    config.simulation.validate()?;
    if !config.fit.smooths.iter().any(|s| s.covariate == config.var) {
        return Err(PipelineError::InvalidConfig(format!(
            "derivative variable '{}' has no smooth in the model",
            config.var
        )));
    }
    match config.grid {
        GridSpec::Regular { len, .. } | GridSpec::ObservedRange { len } if len < 2 => {
            Err(PipelineError::InvalidConfig(
                "the prediction grid needs at least two points".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

/// Fits and simulates every group. Per-group failures are collected in the
/// report; only configuration and splitting errors abort the batch.
pub fn run_batch(table: &ObservationTable, config: &BatchConfig) -> Result<BatchReport, PipelineError> {
    validate(config)?;
    let groups = if config.split_by.is_empty() {
        vec![(GroupKey { values: Vec::new() }, table.clone())]
    } else {
        table.split_by(&config.split_by)?
    };
    log::info!(
        "Running {} group(s) split by {:?}, differentiating along '{}'.",
        groups.len(),
        config.split_by,
        config.var
    );

    let pb = create_progress_bar(groups.len() as u64, config.show_progress);
    let outcomes: Vec<(GroupKey, Result<GroupResult, PipelineError>)> = groups
        .into_par_iter()
        .enumerate()
        .map(|(ordinal, (key, rows))| {
            let seed = derive_seed(config.simulation.seed, ordinal);
            let outcome = run_group(&key, &rows, config, seed);
            pb.inc(1);
            (key, outcome)
        })
        .collect();
    pb.finish_with_message("Batch complete.");

    let mut report = BatchReport::default();
    for (key, outcome) in outcomes {
        match outcome {
            Ok(result) => report.results.push(result),
            Err(error) => {
                log::warn!("Skipping group [{key}]: {error}");
                report.failures.push(GroupFailure { key, error });
            }
        }
    }
    log::info!(
        "Batch finished: {} succeeded, {} failed.",
        report.results.len(),
        report.failures.len()
    );
    Ok(report)
}

fn run_group(
    key: &GroupKey,
    rows: &ObservationTable,
    config: &BatchConfig,
    seed: u64,
) -> Result<GroupResult, PipelineError> {
    let mut required = vec![config.fit.response.as_str()];
    required.extend(config.fit.smooths.iter().map(|s| s.covariate.as_str()));
    if let Some(group) = &config.fit.group {
        required.push(group.column.as_str());
    }
    let complete = rows.complete_rows(&required)?;
    complete.require_rows(config.min_rows)?;

    let fitted = fit_gam(&complete, &config.fit)?;
    let model = fitted.reduce()?;
    let grid = build_grid(key, &complete, config, &fitted)?;

    let simulation = SimulationConfig {
        seed,
        ..config.simulation.clone()
    };
    let bands = estimate_derivatives(model, &grid, &config.var, &simulation)?;
    log::debug!("Group [{key}] done: edf {:.2}, seed {seed}.", model.diagnostics.edf);

    Ok(GroupResult {
        key: key.clone(),
        model_kind: fitted.kind(),
        diagnostics: model.diagnostics.clone(),
        dropped_rows: complete.dropped_rows(),
        seed,
        bands,
        model: fitted,
    })
}

/// The derivative variable on a regular grid, other smooth covariates held at
/// their observed mean, and the group key attached as passthrough labels.
fn build_grid(
    key: &GroupKey,
    rows: &ObservationTable,
    config: &BatchConfig,
    fitted: &FittedModel,
) -> Result<PredictionGrid, PipelineError> {
    let (start, end, len) = match config.grid {
        GridSpec::Regular { start, end, len } => (start, end, len),
        GridSpec::ObservedRange { len } => {
            let (lo, hi) = rows.observed_range(&config.var).ok_or_else(|| {
                PipelineError::InvalidConfig(format!("no observed values of '{}'", config.var))
            })?;
            (lo, hi, len)
        }
    };
    let mut grid = PredictionGrid::regular(&config.var, start, end, len)?;

    for smooth in config.fit.smooths.iter().filter(|s| s.covariate != config.var) {
        let held = rows
            .numeric(&smooth.covariate)
            .and_then(|values| values.mean())
            .unwrap_or(0.0);
        grid = grid.with_covariate(&smooth.covariate, Array1::from_elem(len, held))?;
    }

    grid = fitted.reduce()?.complete_group_column(grid, None)?;
    for (column, value) in &key.values {
        grid = grid.with_label(column, vec![value.clone(); len])?;
    }
    Ok(grid)
}
