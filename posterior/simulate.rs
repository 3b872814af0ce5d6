//! # Posterior Simulator
//!
//! Draws coefficient vectors from `N(beta_hat, Vp)` and pushes each draw
//! through the model's prediction basis, either for the whole linear
//! predictor or one term at a time.
//!
//! The covariance is factorized once as `Vp = F F'` and every draw is
//! `beta_hat + F z` with `z ~ N(0, I)`. Normal variates are consumed from a
//! `StdRng` seeded by the caller, row by row of the `(n x r)` matrix `Z`, so
//! an ensemble depends only on the model, the grid, the draw count and the
//! seed.
//!
//! Term ensembles exclude the intercept and grouping coefficients. Because
//! every smooth carries a sum-to-zero constraint, a term curve is centred on
//! its own shape; the baseline ensemble carries the offset, so
//! `baseline + sum(terms)` reproduces the whole-model ensemble.

use crate::config::SimulationConfig;
use crate::faer_ndarray::{FaerCholesky, FaerEigh};
use crate::fit::basis::BasisError;
use crate::fit::construction::DesignError;
use crate::grid::PredictionGrid;
use crate::model::{FittedModel, FittedSmooth};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Eigenvalues below this fraction of the largest are treated as zero.
const RANK_TOLERANCE: f64 = 1e-10;
/// Eigenvalues below `-NEGATIVE_TOLERANCE * max` mean the matrix is not a covariance.
const NEGATIVE_TOLERANCE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Cannot simulate from this model: {0}")]
    InvalidModelKind(String),

    #[error("Coefficient covariance cannot be factorized: {reason}")]
    SingularCovariance { reason: String },

    #[error(
        "Tail probabilities must satisfy 0 <= lower < upper <= 1, but got lower={lower}, upper={upper}."
    )]
    InvalidTailProbabilities { lower: f64, upper: f64 },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Derivatives along '{var}' need at least two grid rows strictly increasing in it.")]
    UnorderedGrid { var: String },

    #[error("At least one simulation draw is required.")]
    InvalidDrawCount,

    #[error("Prediction basis construction failed: {0}")]
    Basis(#[from] BasisError),
}

impl From<DesignError> for SimulationError {
    fn from(err: DesignError) -> Self {
        match err {
            DesignError::Basis(basis) => SimulationError::Basis(basis),
            other => SimulationError::DimensionMismatch(other.to_string()),
        }
    }
}

/// What to do when the covariance is not strictly positive definite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovariancePolicy {
    /// Fall back to an eigendecomposition, giving zero variance along
    /// directions with (numerically) zero eigenvalues.
    #[default]
    PseudoInverse,
    /// Fail with `SingularCovariance` unless the Cholesky factorization succeeds.
    Strict,
}

/// One simulated quantity over the grid: `draws` is `(rows x n)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationEnsemble {
    /// `None` for the whole model, the term label otherwise.
    pub term: Option<String>,
    /// The smooth's covariate and its row-aligned values, for term ensembles.
    pub covariate: Option<(String, Array1<f64>)>,
    pub labels: Vec<(String, Vec<String>)>,
    pub draws: Array2<f64>,
}

impl SimulationEnsemble {
    pub fn nrows(&self) -> usize {
        self.draws.nrows()
    }

    pub fn ndraws(&self) -> usize {
        self.draws.ncols()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Simulation {
    Whole(SimulationEnsemble),
    ByTerm {
        /// Intercept and grouping contribution.
        baseline: SimulationEnsemble,
        terms: Vec<SimulationEnsemble>,
    },
}

pub const BASELINE_TERM: &str = "baseline";

/// Draws from `N(mean, covariance)` through a factor computed once.
#[derive(Debug, Clone)]
pub struct CoefficientSampler {
    mean: Array1<f64>,
    /// `p x r` with `covariance = factor factor'`.
    factor: Array2<f64>,
}

impl CoefficientSampler {
    pub fn new(
        mean: ArrayView1<f64>,
        covariance: ArrayView2<f64>,
        policy: CovariancePolicy,
    ) -> Result<Self, SimulationError> {
        let p = mean.len();
        if covariance.dim() != (p, p) {
            return Err(SimulationError::DimensionMismatch(format!(
                "covariance is {:?} but there are {p} coefficients",
                covariance.dim()
            )));
        }
        if covariance.iter().chain(mean.iter()).any(|v| !v.is_finite()) {
            return Err(SimulationError::SingularCovariance {
                reason: "coefficients or covariance contain non-finite entries".to_string(),
            });
        }
        let symmetric = (&covariance + &covariance.t()) * 0.5;

        let factor = match internal::cholesky_factor(&symmetric) {
            Some(lower) => {
                log::debug!("Factorized {p}x{p} covariance by Cholesky.");
                lower
            }
            None if policy == CovariancePolicy::Strict => {
                return Err(SimulationError::SingularCovariance {
                    reason: "covariance is not positive definite and the strict policy forbids \
                             a rank-deficient factor"
                        .to_string(),
                });
            }
            None => internal::eigen_factor(&symmetric)?,
        };

        Ok(CoefficientSampler {
            mean: mean.to_owned(),
            factor,
        })
    }

    /// Rank of the factor; equals the coefficient count unless directions were dropped.
    pub fn rank(&self) -> usize {
        self.factor.ncols()
    }

    /// `n x p` matrix whose rows are coefficient draws.
    pub fn draw(&self, n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let r = self.factor.ncols();
        let mut z = Array2::<f64>::zeros((n, r));
        for mut row in z.rows_mut() {
            for value in row.iter_mut() {
                *value = rng.sample(StandardNormal);
            }
        }
        let mut draws = z.dot(&self.factor.t());
        draws += &self.mean.view().insert_axis(Axis(0));
        draws
    }
}

/// Simulates the whole-model ensemble, or one ensemble per `vars` entry plus
/// the baseline when `config.by_term` is set.
pub fn simulate<M: FittedSmooth + ?Sized>(
    model: &M,
    grid: &PredictionGrid,
    vars: &[String],
    config: &SimulationConfig,
) -> Result<Simulation, SimulationError> {
    if config.draws == 0 {
        return Err(SimulationError::InvalidDrawCount);
    }
    let coefficients = model.coefficients();
    let p = coefficients.len();
    if model.coefficient_names().len() != p {
        return Err(SimulationError::DimensionMismatch(format!(
            "{} coefficient names for {p} coefficients",
            model.coefficient_names().len()
        )));
    }

    let mut term_columns = Vec::with_capacity(vars.len());
    for var in vars {
        grid.covariate(var)?;
        if config.by_term {
            let members = model.terms().smooth(var).ok_or_else(|| {
                SimulationError::DimensionMismatch(format!("model has no smooth term over '{var}'"))
            })?;
            term_columns.push((var, members));
        }
    }

    let basis = model.prediction_basis(grid)?;
    if basis.dim() != (grid.nrows(), p) {
        return Err(SimulationError::DimensionMismatch(format!(
            "prediction basis is {:?} but the grid has {} rows and the model {p} coefficients",
            basis.dim(),
            grid.nrows()
        )));
    }

    let sampler = CoefficientSampler::new(coefficients, model.covariance(), config.covariance_policy)?;
    let draws = sampler.draw(config.draws, config.seed);
    log::debug!(
        "Drew {} coefficient vectors (rank {} of {p}) with seed {}.",
        config.draws,
        sampler.rank(),
        config.seed
    );

    let consumed: Vec<&str> = model.terms().smooth_covariates().collect();
    let labels = grid.passthrough_columns(&consumed);
    if !config.by_term {
        let ensemble = SimulationEnsemble {
            term: None,
            covariate: None,
            labels,
            draws: basis.dot(&draws.t()),
        };
        log::debug!("Whole-model ensemble is {:?}.", ensemble.draws.dim());
        return Ok(Simulation::Whole(ensemble));
    }

    let partial = |columns: &[usize]| -> Array2<f64> {
        basis
            .select(Axis(1), columns)
            .dot(&draws.select(Axis(1), columns).t())
    };

    let baseline = SimulationEnsemble {
        term: Some(BASELINE_TERM.to_string()),
        covariate: None,
        labels: labels.clone(),
        draws: partial(model.terms().baseline()),
    };
    let mut terms = Vec::with_capacity(term_columns.len());
    for (var, members) in term_columns {
        let values = grid.covariate(var)?.to_owned();
        terms.push(SimulationEnsemble {
            term: Some(format!("s({var})")),
            covariate: Some((var.clone(), values)),
            labels: labels.clone(),
            draws: partial(members),
        });
    }
    log::debug!(
        "Term ensembles: baseline {:?}, {} smooth term(s).",
        baseline.draws.dim(),
        terms.len()
    );
    Ok(Simulation::ByTerm { baseline, terms })
}

/// Reduces a fitted model to its plain smooth component, then simulates.
pub fn simulate_fitted(
    model: &FittedModel,
    grid: &PredictionGrid,
    vars: &[String],
    config: &SimulationConfig,
) -> Result<Simulation, SimulationError> {
    simulate(model.reduce()?, grid, vars, config)
}

mod internal {
    use super::*;

    /// Cholesky factor, or `None` when the matrix is not numerically
    /// positive definite (including pivots that only survive by rounding).
    pub(super) fn cholesky_factor(covariance: &Array2<f64>) -> Option<Array2<f64>> {
        if covariance.nrows() == 0 {
            return Some(Array2::zeros((0, 0)));
        }
        let lower = covariance.cholesky(Side::Lower).ok()?.lower();
        let diag = lower.diag();
        let max_pivot = diag.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let min_pivot = diag.iter().fold(f64::INFINITY, |m, v| m.min(v.abs()));
        (min_pivot.is_finite() && min_pivot > max_pivot * f64::EPSILON.sqrt()).then_some(lower)
    }

    /// `U_+ sqrt(Lambda_+)` over the eigenvalues above the rank tolerance.
    pub(super) fn eigen_factor(covariance: &Array2<f64>) -> Result<Array2<f64>, SimulationError> {
        let (values, vectors) =
            covariance
                .eigh(Side::Lower)
                .map_err(|e| SimulationError::SingularCovariance {
                    reason: e.to_string(),
                })?;
        let max_value = values.iter().fold(0.0_f64, |m, &v| m.max(v));
        let min_value = values.iter().fold(f64::INFINITY, |m, &v| m.min(v));
        if min_value < -NEGATIVE_TOLERANCE * max_value.max(f64::MIN_POSITIVE) {
            return Err(SimulationError::SingularCovariance {
                reason: format!(
                    "covariance is indefinite (eigenvalue {min_value:.3e} against largest {max_value:.3e})"
                ),
            });
        }

        let threshold = RANK_TOLERANCE * max_value;
        let kept: Vec<usize> = (0..values.len())
            .filter(|&i| values[i] > threshold && values[i] > 0.0)
            .collect();
        log::debug!(
            "Cholesky failed; eigen factor keeps {} of {} directions.",
            kept.len(),
            values.len()
        );
        let scales = Array1::from_iter(kept.iter().map(|&i| values[i].sqrt()));
        Ok(&vectors.select(Axis(1), &kept) * &scales.insert_axis(Axis(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::PolynomialModel;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn config(draws: usize, by_term: bool) -> SimulationConfig {
        SimulationConfig {
            draws,
            by_term,
            ..SimulationConfig::default()
        }
    }

    fn x_grid() -> PredictionGrid {
        PredictionGrid::regular("x", -1.0, 1.0, 9).unwrap()
    }

    fn whole(simulation: Simulation) -> SimulationEnsemble {
        match simulation {
            Simulation::Whole(ensemble) => ensemble,
            Simulation::ByTerm { .. } => panic!("Expected a whole-model simulation"),
        }
    }

    #[test]
    fn same_seed_gives_identical_ensembles() {
        let model = PolynomialModel::quadratic();
        let vars = vec!["x".to_string()];
        let a = whole(simulate(&model, &x_grid(), &vars, &config(50, false)).unwrap());
        let b = whole(simulate(&model, &x_grid(), &vars, &config(50, false)).unwrap());
        assert_eq!(a.draws, b.draws, "Identical inputs must give bit-identical draws");
        assert_eq!(a.draws.dim(), (9, 50));

        let other_seed = SimulationConfig {
            seed: 7,
            ..config(50, false)
        };
        let c = whole(simulate(&model, &x_grid(), &vars, &other_seed).unwrap());
        assert_ne!(a.draws, c.draws, "A different seed must change the draws");
    }

    #[test]
    fn term_ensembles_sum_to_whole_model() {
        let model = PolynomialModel::two_covariates();
        let grid = PredictionGrid::regular("x", 0.0, 2.0, 5)
            .unwrap()
            .with_covariate("z", array![3.0, 1.0, 4.0, 1.0, 5.0])
            .unwrap();
        let vars = vec!["x".to_string(), "z".to_string()];
        let whole_model = whole(simulate(&model, &grid, &vars, &config(40, false)).unwrap());
        let Simulation::ByTerm { baseline, terms } =
            simulate(&model, &grid, &vars, &config(40, true)).unwrap()
        else {
            panic!("Expected a term-wise simulation");
        };
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1].term.as_deref(), Some("s(z)"));
        assert_eq!(terms[1].covariate.as_ref().unwrap().1[2], 4.0);

        let summed = &baseline.draws + &terms[0].draws + &terms[1].draws;
        for (a, b) in summed.iter().zip(whole_model.draws.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn term_ensemble_excludes_intercept() {
        let model = PolynomialModel::linear(5.0, 2.0, Array2::from_diag(&array![1.0, 0.25]));
        let grid = PredictionGrid::new()
            .with_covariate("x", array![0.0])
            .unwrap();
        let Simulation::ByTerm { terms, baseline } =
            simulate(&model, &grid, &["x".to_string()], &config(30, true)).unwrap()
        else {
            panic!("Expected a term-wise simulation");
        };
        // At x = 0 the slope term contributes nothing whatever the draw.
        assert!(terms[0].draws.iter().all(|&v| v == 0.0));
        assert!(baseline.draws.iter().any(|&v| v != 5.0));
    }

    #[test]
    fn degenerate_direction_gets_zero_variance_under_pseudo_inverse() {
        let covariance = array![[1.0, 1.0], [1.0, 1.0]];
        let sampler =
            CoefficientSampler::new(array![0.3, -0.2].view(), covariance.view(), CovariancePolicy::PseudoInverse)
                .unwrap();
        assert_eq!(sampler.rank(), 1);
        let draws = sampler.draw(200, 1034);
        for row in draws.rows() {
            assert_abs_diff_eq!(row[0] - row[1], 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn strict_policy_rejects_rank_deficient_covariance() {
        let covariance = array![[1.0, 1.0], [1.0, 1.0]];
        let result =
            CoefficientSampler::new(array![0.0, 0.0].view(), covariance.view(), CovariancePolicy::Strict);
        assert!(matches!(result, Err(SimulationError::SingularCovariance { .. })));
    }

    #[test]
    fn indefinite_covariance_fails_under_both_policies() {
        let covariance = array![[1.0, 2.0], [2.0, 1.0]];
        for policy in [CovariancePolicy::PseudoInverse, CovariancePolicy::Strict] {
            let result = CoefficientSampler::new(array![0.0, 0.0].view(), covariance.view(), policy);
            assert!(
                matches!(result, Err(SimulationError::SingularCovariance { .. })),
                "Policy {policy:?} must reject an indefinite covariance"
            );
        }
    }

    #[test]
    fn non_finite_covariance_is_rejected() {
        let covariance = array![[1.0, f64::NAN], [f64::NAN, 1.0]];
        let result = CoefficientSampler::new(
            array![0.0, 0.0].view(),
            covariance.view(),
            CovariancePolicy::PseudoInverse,
        );
        assert!(matches!(result, Err(SimulationError::SingularCovariance { .. })));
    }

    #[test]
    fn draw_moments_match_covariance() {
        let covariance = array![[0.5, 0.2], [0.2, 0.3]];
        let mean = array![1.0, -1.0];
        let sampler =
            CoefficientSampler::new(mean.view(), covariance.view(), CovariancePolicy::PseudoInverse)
                .unwrap();
        let draws = sampler.draw(20_000, 99);
        let sample_mean = draws.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(sample_mean[0], 1.0, epsilon = 0.03);
        assert_abs_diff_eq!(sample_mean[1], -1.0, epsilon = 0.03);
        let centred = &draws - &sample_mean.insert_axis(Axis(0));
        let sample_cov = centred.t().dot(&centred) / (draws.nrows() as f64 - 1.0);
        for (s, c) in sample_cov.iter().zip(covariance.iter()) {
            assert_abs_diff_eq!(*s, *c, epsilon = 0.03);
        }
    }

    #[test]
    fn invalid_requests_fail_with_distinct_errors() {
        let model = PolynomialModel::quadratic();
        let vars = vec!["x".to_string()];
        assert!(matches!(
            simulate(&model, &x_grid(), &vars, &config(0, false)),
            Err(SimulationError::InvalidDrawCount)
        ));
        assert!(matches!(
            simulate(&model, &x_grid(), &["dayOfYear".to_string()], &config(5, false)),
            Err(SimulationError::DimensionMismatch(_))
        ));
        let grid = x_grid().with_covariate("z", Array1::zeros(9)).unwrap();
        assert!(matches!(
            simulate(&model, &grid, &["z".to_string()], &config(5, true)),
            Err(SimulationError::DimensionMismatch(_))
        ));

        let mismatched = PolynomialModel::quadratic().with_covariance(Array2::eye(2));
        assert!(matches!(
            simulate(&mismatched, &x_grid(), &vars, &config(5, false)),
            Err(SimulationError::DimensionMismatch(_))
        ));
    }
}
