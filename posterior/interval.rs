//! # Interval Summarizer
//!
//! Reduces an ensemble row by row to its mean and two empirical quantiles.
//! Quantiles interpolate linearly between order statistics (Hyndman and Fan
//! type 7). Non-finite draws are ignored; a row with no finite draws yields
//! NaN for all three statistics instead of failing the summary.
//!
//! The band is reported as `lower = min(q_lower, mean)` and
//! `upper = max(q_upper, mean)`, so `lower <= mean <= upper` holds for every
//! row with finite draws, however skewed.

use crate::config::validate_tails;
use crate::simulate::{Simulation, SimulationEnsemble, SimulationError};
use ndarray::{Array1, Array2, ArrayView1};

#[derive(Debug, Clone, PartialEq)]
pub struct CredibleBand {
    /// `None` for the whole model.
    pub term: Option<String>,
    pub covariate: Option<(String, Array1<f64>)>,
    pub labels: Vec<(String, Vec<String>)>,
    pub mean: Array1<f64>,
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
    /// The `(rows x n)` draws the band was computed from, when retained.
    pub ensemble: Option<Array2<f64>>,
}

impl CredibleBand {
    pub fn nrows(&self) -> usize {
        self.mean.len()
    }
}

/// Summarizes one ensemble. Tails are checked before any row is touched.
pub fn summarize(
    ensemble: SimulationEnsemble,
    lower_tail: f64,
    upper_tail: f64,
    keep_ensemble: bool,
) -> Result<CredibleBand, SimulationError> {
    validate_tails(lower_tail, upper_tail)?;

    let rows = ensemble.nrows();
    let mut mean = Array1::zeros(rows);
    let mut lower = Array1::zeros(rows);
    let mut upper = Array1::zeros(rows);
    for (i, row) in ensemble.draws.rows().into_iter().enumerate() {
        let (m, lo, hi) = internal::summarize_row(row, lower_tail, upper_tail);
        mean[i] = m;
        lower[i] = lo;
        upper[i] = hi;
    }

    Ok(CredibleBand {
        term: ensemble.term,
        covariate: ensemble.covariate,
        labels: ensemble.labels,
        mean,
        lower,
        upper,
        ensemble: keep_ensemble.then_some(ensemble.draws),
    })
}

/// One band for a whole-model simulation, one per smooth term otherwise.
/// The baseline ensemble of a term-wise simulation is not summarized.
pub fn summarize_simulation(
    simulation: Simulation,
    lower_tail: f64,
    upper_tail: f64,
    keep_ensemble: bool,
) -> Result<Vec<CredibleBand>, SimulationError> {
    validate_tails(lower_tail, upper_tail)?;
    match simulation {
        Simulation::Whole(ensemble) => Ok(vec![summarize(
            ensemble,
            lower_tail,
            upper_tail,
            keep_ensemble,
        )?]),
        Simulation::ByTerm { terms, .. } => terms
            .into_iter()
            .map(|ensemble| summarize(ensemble, lower_tail, upper_tail, keep_ensemble))
            .collect(),
    }
}

mod internal {
    use super::*;

    pub(super) fn summarize_row(row: ArrayView1<f64>, lower_tail: f64, upper_tail: f64) -> (f64, f64, f64) {
        let mut finite: Vec<f64> = row.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return (f64::NAN, f64::NAN, f64::NAN);
        }
        finite.sort_by(f64::total_cmp);
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        let q_lower = type7_quantile(&finite, lower_tail);
        let q_upper = type7_quantile(&finite, upper_tail);
        (mean, q_lower.min(mean), q_upper.max(mean))
    }

    /// `sorted` must be non-empty and ascending.
    pub(super) fn type7_quantile(sorted: &[f64], p: f64) -> f64 {
        let h = (sorted.len() - 1) as f64 * p;
        let lo = h.floor() as usize;
        let hi = (lo + 1).min(sorted.len() - 1);
        sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
    }
}
