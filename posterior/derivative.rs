//! # Derivative Estimator
//!
//! Differentiates every simulated curve along one covariate and summarizes
//! the resulting derivative ensemble. Level and derivative bands are computed
//! from the same draws.
//!
//! Differencing: central `(f[i+1] - f[i-1]) / (x[i+1] - x[i-1])` on interior
//! rows, forward on the first row and backward on the last. All three are
//! exact for curves that are linear in the covariate.

use crate::config::SimulationConfig;
use crate::grid::PredictionGrid;
use crate::interval::{CredibleBand, summarize};
use crate::model::FittedSmooth;
use crate::simulate::{Simulation, SimulationError, simulate};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Level bands and their derivative bands, aligned one to one.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeBands {
    pub level: Vec<CredibleBand>,
    pub derivative: Vec<CredibleBand>,
}

/// Bands for the curve(s) and their first derivative along `var`.
///
/// With `config.by_term` the smooth term over `var` is differentiated on its
/// own; otherwise the whole linear predictor is.
pub fn estimate_derivatives<M: FittedSmooth + ?Sized>(
    model: &M,
    grid: &PredictionGrid,
    var: &str,
    config: &SimulationConfig,
) -> Result<DerivativeBands, SimulationError> {
    config.validate()?;
    if grid.nrows() < 2 || !grid.is_strictly_increasing(var) {
        return Err(SimulationError::UnorderedGrid {
            var: var.to_string(),
        });
    }
    let x = grid.covariate(var)?.to_owned();

    let ensembles = match simulate(model, grid, &[var.to_string()], config)? {
        Simulation::Whole(ensemble) => vec![ensemble],
        Simulation::ByTerm { terms, .. } => terms,
    };

    let mut bands = DerivativeBands {
        level: Vec::with_capacity(ensembles.len()),
        derivative: Vec::with_capacity(ensembles.len()),
    };
    for ensemble in ensembles {
        let mut slopes = ensemble.clone();
        slopes.draws = finite_difference(ensemble.draws.view(), x.view());
        slopes.covariate = Some((var.to_string(), x.clone()));
        log::debug!(
            "Differenced {:?} ensemble along '{var}'.",
            ensemble.term.as_deref().unwrap_or("whole-model")
        );

        bands.level.push(summarize(
            ensemble,
            config.lower_tail,
            config.upper_tail,
            config.keep_ensemble,
        )?);
        bands.derivative.push(summarize(
            slopes,
            config.lower_tail,
            config.upper_tail,
            config.keep_ensemble,
        )?);
    }
    Ok(bands)
}

/// Differentiates each column of `curves` (rows aligned with `x`). `x` must
/// have at least two strictly increasing entries.
pub fn finite_difference(curves: ArrayView2<f64>, x: ArrayView1<f64>) -> Array2<f64> {
    let m = curves.nrows();
    let mut slopes = Array2::zeros(curves.raw_dim());
    for i in 0..m {
        let (a, b) = match i {
            0 => (0, 1),
            _ if i == m - 1 => (m - 2, m - 1),
            _ => (i - 1, i + 1),
        };
        let dx = x[b] - x[a];
        slopes
            .row_mut(i)
            .assign(&((&curves.row(b) - &curves.row(a)) / dx));
    }
    slopes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::PolynomialModel;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn keep_all(by_term: bool) -> SimulationConfig {
        SimulationConfig {
            draws: 200,
            by_term,
            keep_ensemble: true,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn edge_rows_use_one_sided_differences() {
        let x = array![0.0, 1.0, 3.0, 4.0];
        let curves = array![[0.0], [1.0], [9.0], [16.0]];
        let slopes = finite_difference(curves.view(), x.view());
        assert_abs_diff_eq!(slopes[[0, 0]], 1.0);
        assert_abs_diff_eq!(slopes[[1, 0]], 3.0);
        assert_abs_diff_eq!(slopes[[2, 0]], 5.0);
        assert_abs_diff_eq!(slopes[[3, 0]], 7.0);
    }

    #[test]
    fn derivative_of_linear_model_is_its_slope_everywhere() {
        let model = PolynomialModel::linear(0.4, 0.002, Array2::from_diag(&array![1e-4, 1e-8]));
        let grid = PredictionGrid::new()
            .with_covariate("x", array![1.0, 2.0, 10.0, 50.0, 51.0, 365.0])
            .unwrap();
        let bands = estimate_derivatives(&model, &grid, "x", &keep_all(false)).unwrap();
        let derivative = &bands.derivative[0];
        let draws = derivative.ensemble.as_ref().unwrap();
        for column in draws.columns() {
            for value in column.iter() {
                assert_abs_diff_eq!(*value, column[0], epsilon = 1e-12);
            }
        }

        let exact = PolynomialModel::linear(0.4, 0.002, Array2::zeros((2, 2)));
        let exact_bands = estimate_derivatives(&exact, &grid, "x", &keep_all(false)).unwrap();
        for i in 0..grid.nrows() {
            assert_abs_diff_eq!(exact_bands.derivative[0].mean[i], 0.002, epsilon = 1e-12);
            assert_abs_diff_eq!(exact_bands.derivative[0].lower[i], 0.002, epsilon = 1e-12);
            assert_abs_diff_eq!(exact_bands.derivative[0].upper[i], 0.002, epsilon = 1e-12);
        }
    }

    #[test]
    fn derivative_uses_the_level_draws() {
        let model = PolynomialModel::quadratic();
        let grid = PredictionGrid::regular("x", -1.0, 1.0, 11).unwrap();
        let bands = estimate_derivatives(&model, &grid, "x", &keep_all(false)).unwrap();
        let level = bands.level[0].ensemble.as_ref().unwrap();
        let x = grid.covariate("x").unwrap();
        let expected = finite_difference(level.view(), x);
        assert_eq!(bands.derivative[0].ensemble.as_ref().unwrap(), &expected);
        for i in 0..grid.nrows() {
            assert!(bands.derivative[0].lower[i] <= bands.derivative[0].mean[i]);
            assert!(bands.derivative[0].mean[i] <= bands.derivative[0].upper[i]);
        }
    }

    #[test]
    fn term_derivative_ignores_intercept_draws() {
        let model = PolynomialModel::linear(3.0, -1.5, Array2::from_diag(&array![4.0, 0.0]));
        let grid = PredictionGrid::regular("x", 0.0, 5.0, 6).unwrap();
        let bands = estimate_derivatives(&model, &grid, "x", &keep_all(true)).unwrap();
        assert_eq!(bands.level[0].term.as_deref(), Some("s(x)"));
        for i in 0..6 {
            assert_abs_diff_eq!(bands.derivative[0].mean[i], -1.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn unordered_or_short_grids_are_rejected() {
        let model = PolynomialModel::quadratic();
        let unordered = PredictionGrid::new()
            .with_covariate("x", array![0.0, 2.0, 1.0])
            .unwrap();
        assert!(matches!(
            estimate_derivatives(&model, &unordered, "x", &SimulationConfig::default()),
            Err(SimulationError::UnorderedGrid { var }) if var == "x"
        ));
        let single = PredictionGrid::new()
            .with_covariate("x", Array1::from_elem(1, 0.5))
            .unwrap();
        assert!(matches!(
            estimate_derivatives(&model, &single, "x", &SimulationConfig::default()),
            Err(SimulationError::UnorderedGrid { .. })
        ));
    }

    #[test]
    fn invalid_tails_fail_before_simulation() {
        let model = PolynomialModel::quadratic();
        let grid = PredictionGrid::regular("x", 0.0, 1.0, 4).unwrap();
        let config = SimulationConfig {
            lower_tail: 0.5,
            upper_tail: 0.3,
            ..SimulationConfig::default()
        };
        assert!(matches!(
            estimate_derivatives(&model, &grid, "x", &config),
            Err(SimulationError::InvalidTailProbabilities { .. })
        ));
    }
}
