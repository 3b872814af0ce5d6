//! Small hand-specified models for simulator tests. Each basis column is a
//! power of one covariate, so expected values can be written down directly.

use crate::grid::PredictionGrid;
use crate::model::{FittedSmooth, TermIndex};
use crate::simulate::SimulationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, array};

pub(crate) struct PolynomialModel {
    names: Vec<String>,
    /// `(covariate, power)`; `None` is the intercept column.
    columns: Vec<Option<(String, i32)>>,
    coefficients: Array1<f64>,
    covariance: Array2<f64>,
    terms: TermIndex,
}

impl PolynomialModel {
    fn new(columns: Vec<Option<(&str, i32)>>, coefficients: Array1<f64>, covariance: Array2<f64>) -> Self {
        let mut counters: Vec<(String, usize)> = Vec::new();
        let names: Vec<String> = columns
            .iter()
            .map(|column| match column {
                None => "(Intercept)".to_string(),
                Some((var, _)) => {
                    let k = match counters.iter_mut().find(|(v, _)| v == var) {
                        Some((_, count)) => {
                            *count += 1;
                            *count
                        }
                        None => {
                            counters.push((var.to_string(), 1));
                            1
                        }
                    };
                    format!("s({var}).{k}")
                }
            })
            .collect();
        let terms = TermIndex::from_coefficient_names(&names, &[]);
        PolynomialModel {
            names,
            columns: columns
                .into_iter()
                .map(|c| c.map(|(var, power)| (var.to_string(), power)))
                .collect(),
            coefficients,
            covariance,
            terms,
        }
    }

    /// `0.5 + 1.2 x - 0.3 x^2` with mildly correlated coefficients.
    pub(crate) fn quadratic() -> Self {
        PolynomialModel::new(
            vec![None, Some(("x", 1)), Some(("x", 2))],
            array![0.5, 1.2, -0.3],
            array![
                [0.04, 0.005, 0.0],
                [0.005, 0.01, 0.001],
                [0.0, 0.001, 0.0025]
            ],
        )
    }

    /// `intercept + slope x`.
    pub(crate) fn linear(intercept: f64, slope: f64, covariance: Array2<f64>) -> Self {
        PolynomialModel::new(
            vec![None, Some(("x", 1))],
            array![intercept, slope],
            covariance,
        )
    }

    /// `1 + 0.8 x - 0.2 z + 0.05 z^2`.
    pub(crate) fn two_covariates() -> Self {
        PolynomialModel::new(
            vec![None, Some(("x", 1)), Some(("z", 1)), Some(("z", 2))],
            array![1.0, 0.8, -0.2, 0.05],
            array![
                [0.09, 0.01, 0.0, 0.0],
                [0.01, 0.04, 0.0, 0.0],
                [0.0, 0.0, 0.02, -0.002],
                [0.0, 0.0, -0.002, 0.001]
            ],
        )
    }

    pub(crate) fn with_covariance(mut self, covariance: Array2<f64>) -> Self {
        self.covariance = covariance;
        self
    }
}

impl FittedSmooth for PolynomialModel {
    fn coefficient_names(&self) -> &[String] {
        &self.names
    }

    fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    fn covariance(&self) -> ArrayView2<'_, f64> {
        self.covariance.view()
    }

    fn terms(&self) -> &TermIndex {
        &self.terms
    }

    fn prediction_basis(&self, grid: &PredictionGrid) -> Result<Array2<f64>, SimulationError> {
        let mut basis = Array2::zeros((grid.nrows(), self.columns.len()));
        for (j, column) in self.columns.iter().enumerate() {
            match column {
                None => basis.column_mut(j).fill(1.0),
                Some((var, power)) => {
                    let values = grid.covariate(var)?;
                    basis.column_mut(j).assign(&values.mapv(|v| v.powi(*power)));
                }
            }
        }
        Ok(basis)
    }
}
