//! Penalized least-squares estimation of Gaussian additive models.
//!
//! For smoothing parameters `lambda = exp(rho)` the coefficients solve
//! `(X'X + S_lambda) beta = X'y`. The Bayesian posterior covariance of the
//! coefficients is `Vp = sigma^2 (X'X + S_lambda)^-1` with
//! `sigma^2 = RSS / (n - edf)`. When `rho` is not fixed it is chosen by
//! minimizing the GCV score `n RSS / (n - edf)^2` with BFGS.

use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::faer_ndarray::{FaerCholesky, FaerEigh, FaerLinalgError};
use crate::fit::construction::{
    self, ColumnSource, DesignError, ModelLayout, build_group_term, build_penalties,
    build_smooth_terms, construct_s_lambda,
};
use crate::fit::model::{
    FitConfig, FitDiagnostics, GamModel, GamModelRecord, GroupEffect, LambdaSelection,
};
use crate::model::{FittedModel, MixedModel, ModelError, VarianceComponent};

use faer::Side;
use ndarray::{Array1, Array2, Axis};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Bounds on log-lambda during smoothing parameter selection.
const RHO_BOUND: f64 = 12.0;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Design construction failed: {0}")]
    Design(#[from] DesignError),

    #[error("A linear system solve failed. The penalized normal matrix may be singular. Error: {0}")]
    LinearSystemSolveFailed(FaerLinalgError),

    #[error("GCV/BFGS smoothing parameter selection failed: {0}")]
    GcvOptimizationFailed(String),

    #[error("Invalid fit configuration: {0}")]
    InvalidConfig(String),

    #[error("Response column '{0}' is missing.")]
    MissingResponse(String),

    #[error("Column '{0}' contains non-finite values; drop incomplete rows before fitting.")]
    NonFiniteData(String),

    #[error(
        "Only {found} observations for {coefficients} coefficients; at least {required} are required."
    )]
    InsufficientData {
        found: usize,
        coefficients: usize,
        required: usize,
    },

    #[error("Fitted model failed validation: {0}")]
    Model(#[from] ModelError),
}

/// Fits `response ~ intercept + group + sum_j s(x_j)` to `data`.
///
/// A random group effect yields a `FittedModel::Gamm` carrying the group's
/// variance component; everything else yields `FittedModel::Gam`.
pub fn fit_gam(data: &dyn ColumnSource, config: &FitConfig) -> Result<FittedModel, FitError> {
    validate_config(config)?;
    let y = data
        .numeric(&config.response)
        .ok_or_else(|| FitError::MissingResponse(config.response.clone()))?
        .to_owned();
    let mut finite_checked = vec![config.response.as_str()];
    finite_checked.extend(config.smooths.iter().map(|s| s.covariate.as_str()));
    for name in finite_checked {
        if let Some(column) = data.numeric(name) {
            if column.iter().any(|v| !v.is_finite()) {
                return Err(FitError::NonFiniteData(name.to_string()));
            }
        }
    }

    log::info!(
        "Fitting {} ~ {} on {} observations.",
        config.response,
        config
            .smooths
            .iter()
            .map(|s| format!("s({})", s.covariate))
            .collect::<Vec<_>>()
            .join(" + "),
        data.nrows()
    );

    // 1. Build the one-time matrices and define the model structure.
    let mut smooths = build_smooth_terms(data, &config.smooths)?;
    let mut group = config
        .group
        .as_ref()
        .map(|g| build_group_term(data, g))
        .transpose()?;
    let layout = ModelLayout::new(&smooths, group.as_ref());
    let x = construction::assemble_design(data, &smooths, group.as_ref())?;
    let s_list = build_penalties(&smooths, group.as_ref())?;
    log_layout_info(&layout);

    let n = x.nrows();
    if n <= layout.total_coeffs {
        return Err(FitError::InsufficientData {
            found: n,
            coefficients: layout.total_coeffs,
            required: layout.total_coeffs + 1,
        });
    }

    let problem = Arc::new(internal::PenalizedProblem::new(x, y, s_list, layout));

    // 2. Choose the smoothing parameters.
    let rho = match &config.lambda {
        LambdaSelection::Fixed(lambdas) => {
            if lambdas.len() != problem.layout.num_penalties {
                return Err(FitError::InvalidConfig(format!(
                    "{} smoothing parameters given but the model has {} penalties",
                    lambdas.len(),
                    problem.layout.num_penalties
                )));
            }
            if lambdas.iter().any(|&l| !(l > 0.0 && l.is_finite())) {
                return Err(FitError::InvalidConfig(
                    "smoothing parameters must be positive and finite".to_string(),
                ));
            }
            Array1::from_iter(lambdas.iter().map(|l| l.ln()))
        }
        LambdaSelection::Gcv {
            max_iterations,
            tolerance,
        } => select_smoothing_parameters(&problem, *max_iterations, *tolerance)?,
    };

    // 3. Final fit at the chosen smoothing parameters.
    let fit = problem.fit(&rho)?;
    let lambdas = rho.mapv(f64::exp);
    log::info!(
        "Final smoothing parameters (lambda): {:?}, edf {:.2}, GCV {:.6}",
        lambdas.to_vec(),
        fit.edf,
        fit.gcv
    );

    for (idx, smooth) in smooths.iter_mut().enumerate() {
        smooth.lambda = lambdas[idx];
        smooth.edf = fit.block_edf[idx];
    }
    let group_lambda = group
        .as_mut()
        .filter(|g| g.config.effect == GroupEffect::Random)
        .map(|g| {
            let lambda = lambdas[smooths.len()];
            g.lambda = Some(lambda);
            lambda
        });

    let n_f = n as f64;
    let scale = fit.rss / (n_f - fit.edf).max(1.0);
    let y_mean = problem.y.mean().unwrap_or(0.0);
    let tss = problem.y.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>();
    let diagnostics = FitDiagnostics {
        n_obs: n,
        edf: fit.edf,
        scale,
        rss: fit.rss,
        gcv: fit.gcv,
        r_squared: if tss > 0.0 { 1.0 - fit.rss / tss } else { 1.0 },
    };

    let coefficient_names = construction::coefficient_names(&smooths, group.as_ref());
    let group_label = group.as_ref().map(|g| g.label());
    let model = GamModel::new(GamModelRecord {
        response: config.response.clone(),
        smooths,
        group,
        diagnostics,
        coefficient_names,
        coefficients: fit.beta,
        covariance: fit.a_inv * scale,
    })?;

    Ok(match (group_lambda, group_label) {
        (Some(lambda), Some(term)) => FittedModel::Gamm(MixedModel {
            gam: Some(model),
            variance_components: vec![
                VarianceComponent {
                    term,
                    variance: scale / lambda,
                },
                VarianceComponent {
                    term: "residual".to_string(),
                    variance: scale,
                },
            ],
        }),
        _ => FittedModel::Gam(model),
    })
}

fn validate_config(config: &FitConfig) -> Result<(), FitError> {
    if config.smooths.is_empty() {
        return Err(FitError::InvalidConfig(
            "at least one smooth term is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for smooth in &config.smooths {
        if !seen.insert(smooth.covariate.as_str()) {
            return Err(FitError::InvalidConfig(format!(
                "covariate '{}' has more than one smooth",
                smooth.covariate
            )));
        }
        if smooth.covariate == config.response {
            return Err(FitError::InvalidConfig(format!(
                "'{}' is both the response and a smooth covariate",
                smooth.covariate
            )));
        }
    }
    Ok(())
}

/// Helper to log the final model structure.
fn log_layout_info(layout: &ModelLayout) {
    log::info!("Model structure has {} total coefficients.", layout.total_coeffs);
    log::info!("  - Intercept: 1 coefficient.");
    if !layout.group_cols.is_empty() {
        log::info!("  - Grouping: {} coefficients.", layout.group_cols.len());
    }
    for block in &layout.penalty_map {
        log::info!(
            "  - {}: {} coefficients (penalty {}).",
            block.term_name,
            block.col_range.len(),
            block.penalty_idx
        );
    }
}

/// Minimizes GCV over `rho`, starting BFGS from the best point of a coarse
/// grid over a common log-lambda. Falls back to that grid point if BFGS fails.
fn select_smoothing_parameters(
    problem: &Arc<internal::PenalizedProblem>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<Array1<f64>, FitError> {
    let k = problem.layout.num_penalties;
    if k == 0 {
        return Ok(Array1::zeros(0));
    }

    let mut best: Option<(f64, Array1<f64>)> = None;
    for step in 0..=10 {
        let candidate = Array1::from_elem(k, -8.0 + 2.0 * step as f64);
        let score = problem.gcv_or_large(&candidate);
        if best.as_ref().is_none_or(|(b, _)| score < *b) {
            best = Some((score, candidate));
        }
    }
    let (start_score, start) =
        best.ok_or_else(|| FitError::GcvOptimizationFailed("empty search grid".to_string()))?;
    if start_score >= internal::LARGE_COST {
        return Err(FitError::GcvOptimizationFailed(
            "GCV is not finite anywhere on the initial grid".to_string(),
        ));
    }
    log::debug!("GCV grid search start: rho {:?}, score {start_score:.6}", start.to_vec());

    let problem_for_closure = Arc::clone(problem);
    let cost_and_grad = move |rho_bfgs: &Array1<f64>| -> (f64, Array1<f64>) {
        let safe_rho = rho_bfgs.mapv(|v| v.clamp(-RHO_BOUND, RHO_BOUND));
        let cost = problem_for_closure.gcv_or_large(&safe_rho);
        let grad = problem_for_closure.gcv_gradient(&safe_rho);
        (cost, grad)
    };

    match Bfgs::new(start.clone(), cost_and_grad)
        .with_tolerance(tolerance)
        .with_max_iterations(max_iterations)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => {
            log::debug!("BFGS finished in {iterations} iterations with GCV {final_value:.6}");
            let clamped = final_point.mapv(|v| v.clamp(-RHO_BOUND, RHO_BOUND));
            if problem.gcv_or_large(&clamped) <= start_score {
                Ok(clamped)
            } else {
                Ok(start)
            }
        }
        Err(e) => {
            log::warn!("BFGS smoothing selection failed ({e:?}); using the best grid point.");
            Ok(start)
        }
    }
}

mod internal {
    use super::*;

    /// Returned in place of a non-finite GCV so the line search can back off.
    pub(super) const LARGE_COST: f64 = 1e10;

    /// Step for the central finite-difference GCV gradient.
    const GRADIENT_STEP: f64 = 1e-4;

    pub(super) struct PenalizedProblem {
        pub x: Array2<f64>,
        pub y: Array1<f64>,
        pub xtx: Array2<f64>,
        pub xty: Array1<f64>,
        pub s_list: Vec<Array2<f64>>,
        pub layout: ModelLayout,
    }

    pub(super) struct PenalizedFit {
        pub beta: Array1<f64>,
        /// `(X'X + S_lambda)^-1`
        pub a_inv: Array2<f64>,
        pub edf: f64,
        /// Effective degrees of freedom per penalty index.
        pub block_edf: Vec<f64>,
        pub rss: f64,
        pub gcv: f64,
    }

    impl PenalizedProblem {
        pub fn new(
            x: Array2<f64>,
            y: Array1<f64>,
            s_list: Vec<Array2<f64>>,
            layout: ModelLayout,
        ) -> Self {
            let xtx = x.t().dot(&x);
            let xty = x.t().dot(&y);
            PenalizedProblem {
                x,
                y,
                xtx,
                xty,
                s_list,
                layout,
            }
        }

        pub fn fit(&self, rho: &Array1<f64>) -> Result<PenalizedFit, FitError> {
            let lambdas = rho.mapv(f64::exp);
            let s_lambda = construct_s_lambda(&lambdas, &self.s_list, &self.layout);
            let a = &self.xtx + &s_lambda;
            let a_inv = invert_symmetric(&a)?;
            let beta = a_inv.dot(&self.xty);

            let residuals = &self.y - &self.x.dot(&beta);
            let rss = residuals.dot(&residuals);

            let influence = a_inv.dot(&self.xtx);
            let diag = influence.diag();
            let edf = diag.sum();
            let block_edf = (0..self.layout.num_penalties)
                .map(|idx| {
                    self.layout
                        .penalty_map
                        .iter()
                        .filter(|b| b.penalty_idx == idx)
                        .map(|b| b.col_range.clone().map(|j| diag[j]).sum::<f64>())
                        .sum()
                })
                .collect();

            let n = self.y.len() as f64;
            let denom = n - edf;
            let gcv = if denom > 0.0 {
                n * rss / (denom * denom)
            } else {
                f64::INFINITY
            };

            Ok(PenalizedFit {
                beta,
                a_inv,
                edf,
                block_edf,
                rss,
                gcv,
            })
        }

        pub fn gcv_or_large(&self, rho: &Array1<f64>) -> f64 {
            match self.fit(rho) {
                Ok(fit) if fit.gcv.is_finite() => fit.gcv,
                Ok(fit) => {
                    log::debug!("Non-finite GCV {} at rho {:?}", fit.gcv, rho.to_vec());
                    LARGE_COST
                }
                Err(e) => {
                    log::debug!("Penalized fit failed at rho {:?}: {e}", rho.to_vec());
                    LARGE_COST
                }
            }
        }

        pub fn gcv_gradient(&self, rho: &Array1<f64>) -> Array1<f64> {
            Array1::from_shape_fn(rho.len(), |k| {
                let mut forward = rho.clone();
                forward[k] += GRADIENT_STEP;
                let mut backward = rho.clone();
                backward[k] -= GRADIENT_STEP;
                (self.gcv_or_large(&forward) - self.gcv_or_large(&backward))
                    / (2.0 * GRADIENT_STEP)
            })
        }
    }

    /// Inverts a symmetric positive (semi-)definite matrix: Cholesky first,
    /// then an eigen pseudo-inverse when the factorization fails.
    pub(super) fn invert_symmetric(a: &Array2<f64>) -> Result<Array2<f64>, FitError> {
        let symmetric = (a + &a.t()) * 0.5;
        match symmetric.cholesky(Side::Lower) {
            Ok(factor) if is_well_conditioned(&factor.lower()) => {
                Ok(factor.solve_mat(&Array2::eye(symmetric.nrows())))
            }
            Ok(_) => {
                log::debug!("Cholesky pivots of the penalized normal matrix collapsed; using pseudo-inverse.");
                pseudo_inverse(&symmetric)
            }
            Err(e) => {
                log::debug!("Cholesky of the penalized normal matrix failed ({e}); using pseudo-inverse.");
                pseudo_inverse(&symmetric)
            }
        }
    }

    /// A factor whose smallest pivot is negligible next to its largest only
    /// looks positive definite through rounding.
    fn is_well_conditioned(lower: &Array2<f64>) -> bool {
        let diag = lower.diag();
        let max_pivot = diag.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let min_pivot = diag.iter().fold(f64::INFINITY, |m, v| m.min(v.abs()));
        min_pivot.is_finite() && min_pivot > max_pivot * f64::EPSILON.sqrt()
    }

    fn pseudo_inverse(a: &Array2<f64>) -> Result<Array2<f64>, FitError> {
        let (values, vectors) = a
            .eigh(Side::Lower)
            .map_err(FitError::LinearSystemSolveFailed)?;
        let max_value = values.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let tolerance = max_value * 1e-12;
        let inverted: Array1<f64> = values.mapv(|v| if v > tolerance { 1.0 / v } else { 0.0 });
        let scaled = &vectors * &inverted.view().insert_axis(Axis(0));
        Ok(scaled.dot(&vectors.t()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::data::ObservationTable;
    use crate::fit::model::{GroupConfig, SmoothConfig};
    use crate::model::FittedSmooth;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand_distr::Normal;

    fn seasonal_curve(doy: f64) -> f64 {
        0.25 + 0.45 * (-(doy - 190.0).powi(2) / (2.0 * 45.0_f64.powi(2))).exp()
    }

    fn noisy_seasonal_table(n: usize, seed: u64) -> ObservationTable {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.02).unwrap();
        let doy = Array1::linspace(1.0, 365.0, n);
        let ndvi = doy.mapv(|d| seasonal_curve(d) + rng.sample(noise));
        ObservationTable::new(n)
            .with_numeric("dayOfYear", doy)
            .and_then(|t| t.with_numeric("ndvi", ndvi))
            .unwrap()
    }

    fn doy_config(lambda: LambdaSelection) -> FitConfig {
        FitConfig {
            response: "ndvi".to_string(),
            smooths: vec![SmoothConfig {
                num_knots: 12,
                ..SmoothConfig::new("dayOfYear")
            }],
            group: None,
            lambda,
        }
    }

    #[test]
    fn gcv_fit_recovers_seasonal_curve() {
        let table = noisy_seasonal_table(200, 7);
        let fitted = fit_gam(&table, &doy_config(LambdaSelection::default())).unwrap();
        let model = fitted.reduce().unwrap();

        let grid = ObservationTable::new(5)
            .with_numeric("dayOfYear", Array1::from_vec(vec![30.0, 120.0, 190.0, 250.0, 340.0]))
            .unwrap();
        let predicted = model.fitted_values(&grid).unwrap();
        for (doy, value) in [30.0, 120.0, 190.0, 250.0, 340.0].iter().zip(predicted.iter()) {
            assert!(
                (value - seasonal_curve(*doy)).abs() < 0.03,
                "Prediction at day {doy} was {value}, expected close to {}",
                seasonal_curve(*doy)
            );
        }
        assert!(model.diagnostics.r_squared > 0.9);
        assert!(model.diagnostics.edf > 3.0 && model.diagnostics.edf < 16.0);
        assert_abs_diff_eq!(model.diagnostics.scale.sqrt(), 0.02, epsilon = 0.006);
    }

    #[test]
    fn covariance_is_symmetric_and_scaled() {
        let table = noisy_seasonal_table(120, 3);
        let fitted = fit_gam(&table, &doy_config(LambdaSelection::Fixed(vec![1.0]))).unwrap();
        let model = fitted.reduce().unwrap();
        let vp = model.covariance();
        for i in 0..vp.nrows() {
            assert!(vp[[i, i]] > 0.0, "Diagonal entry {i} of Vp must be positive");
            for j in 0..i {
                assert_abs_diff_eq!(vp[[i, j]], vp[[j, i]], epsilon = 1e-12);
            }
        }
        assert_eq!(model.smooths[0].lambda, 1.0);
    }

    #[test]
    fn heavier_smoothing_reduces_effective_degrees_of_freedom() {
        let table = noisy_seasonal_table(120, 11);
        let light = fit_gam(&table, &doy_config(LambdaSelection::Fixed(vec![0.01]))).unwrap();
        let heavy = fit_gam(&table, &doy_config(LambdaSelection::Fixed(vec![1e4]))).unwrap();
        let light_edf = light.reduce().unwrap().diagnostics.edf;
        let heavy_edf = heavy.reduce().unwrap().diagnostics.edf;
        assert!(
            heavy_edf < light_edf,
            "Heavy smoothing edf {heavy_edf} should be below light smoothing edf {light_edf}"
        );
    }

    #[test]
    fn random_group_produces_mixed_model_with_variance_component() {
        let base = noisy_seasonal_table(120, 5);
        let sites: Vec<String> = (0..120).map(|i| format!("site{}", i % 3)).collect();
        let offsets = [0.0, 0.05, -0.05];
        let ndvi: Array1<f64> = base
            .numeric("ndvi")
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, v)| v + offsets[i % 3])
            .collect();
        let table = ObservationTable::new(120)
            .with_numeric("dayOfYear", base.numeric("dayOfYear").unwrap().to_owned())
            .and_then(|t| t.with_numeric("ndvi", ndvi))
            .and_then(|t| t.with_labels("site", sites))
            .unwrap();
        let config = FitConfig {
            group: Some(GroupConfig {
                column: "site".to_string(),
                effect: GroupEffect::Random,
            }),
            ..doy_config(LambdaSelection::Fixed(vec![1.0, 0.5]))
        };
        let fitted = fit_gam(&table, &config).unwrap();
        let FittedModel::Gamm(mixed) = &fitted else {
            panic!("A random group effect must produce a mixed model");
        };
        assert_eq!(mixed.variance_components[0].term, "re(site)");
        let model = fitted.reduce().unwrap();
        assert_eq!(model.terms().baseline().len(), 4);
        let scale = model.diagnostics.scale;
        assert_abs_diff_eq!(mixed.variance_components[0].variance, scale / 0.5, epsilon = 1e-12);
    }

    #[test]
    fn fixed_group_fits_from_numeric_codes() {
        let base = noisy_seasonal_table(120, 9);
        let codes: Array1<f64> = (0..120).map(|i| if i % 2 == 0 { 1.0 } else { 2.0 }).collect();
        let ndvi: Array1<f64> = base
            .numeric("ndvi")
            .unwrap()
            .iter()
            .zip(codes.iter())
            .map(|(v, &code)| if code == 2.0 { v + 0.1 } else { *v })
            .collect();
        let table = ObservationTable::new(120)
            .with_numeric("dayOfYear", base.numeric("dayOfYear").unwrap().to_owned())
            .and_then(|t| t.with_numeric("ndvi", ndvi))
            .and_then(|t| t.with_numeric("landcover", codes))
            .unwrap();
        let config = FitConfig {
            group: Some(GroupConfig {
                column: "landcover".to_string(),
                effect: GroupEffect::Fixed,
            }),
            ..doy_config(LambdaSelection::Fixed(vec![1.0]))
        };
        let fitted = fit_gam(&table, &config).unwrap();
        let model = fitted.reduce().unwrap();
        let group = model.group.as_ref().unwrap();
        assert_eq!(group.levels, vec!["1".to_string(), "2".to_string()]);
        let position = model
            .coefficient_names()
            .iter()
            .position(|name| name == "landcover2")
            .unwrap();
        assert_abs_diff_eq!(model.coefficients()[position], 0.1, epsilon = 0.02);
    }

    #[test]
    fn configuration_errors_are_reported() {
        let table = noisy_seasonal_table(40, 1);
        let wrong_count = doy_config(LambdaSelection::Fixed(vec![1.0, 2.0]));
        assert!(matches!(fit_gam(&table, &wrong_count), Err(FitError::InvalidConfig(_))));

        let missing = FitConfig {
            response: "evi".to_string(),
            ..doy_config(LambdaSelection::Fixed(vec![1.0]))
        };
        assert!(matches!(fit_gam(&table, &missing), Err(FitError::MissingResponse(_))));

        let tiny = noisy_seasonal_table(10, 1);
        assert!(matches!(
            fit_gam(&tiny, &doy_config(LambdaSelection::Fixed(vec![1.0]))),
            Err(FitError::InsufficientData { .. })
        ));
    }

    #[test]
    fn pseudo_inverse_handles_rank_deficient_normal_matrix() {
        let a = ndarray::array![[1.0, 1.0], [1.0, 1.0]];
        let inverse = internal::invert_symmetric(&a).unwrap();
        let reproduced = a.dot(&inverse).dot(&a);
        for (x, y) in reproduced.iter().zip(a.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
    }
}
