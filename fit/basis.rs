use crate::faer_ndarray::{FaerLinalgError, FaerQr};
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Defines the strategy for placing the internal knots of a spline.
/// This is part of the public API and is saved with every fitted smooth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnotStrategy {
    /// Place knots uniformly across the covariate range.
    Uniform,
    /// Place knots at the quantiles of the training covariate.
    Quantile,
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be less than end ({1}).")]
    InvalidRange(f64, f64),

    #[error("Quantile strategy requires a non-empty training data set for quantile calculation.")]
    QuantileDataMissing,

    #[error("Cannot compute {num_quantiles} quantiles from only {num_points} data points.")]
    InsufficientDataForQuantiles {
        num_quantiles: usize,
        num_points: usize,
    },

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error("Knot vector of length {knots} is too short for a degree {degree} spline.")]
    InvalidKnotVector { knots: usize, degree: usize },

    #[error("QR decomposition failed while applying constraints: {0}")]
    LinalgError(#[from] FaerLinalgError),
}

/// Creates a B-spline basis expansion matrix and its corresponding knot vector.
///
/// # Arguments
///
/// * `data`: the covariate values to expand (e.g. day of year).
/// * `training_data_for_quantiles`: when `Some`, internal knots sit at the
///   quantiles of this column; otherwise they are spaced uniformly.
/// * `data_range`: `(min, max)` of the training covariate. The same range must be
///   reused at prediction time, which is why the knot vector is returned.
/// * `num_internal_knots`: the number of knots strictly between the boundaries.
/// * `degree`: polynomial degree (3 for cubic).
///
/// # Returns
///
/// The basis matrix `[data.len(), num_internal_knots + degree + 1]` and the full
/// clamped knot vector.
pub fn create_bspline_basis(
    data: ArrayView1<f64>,
    training_data_for_quantiles: Option<ArrayView1<f64>>,
    data_range: (f64, f64),
    num_internal_knots: usize,
    degree: usize,
) -> Result<(Array2<f64>, Array1<f64>), BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if !(data_range.0 < data_range.1) {
        return Err(BasisError::InvalidRange(data_range.0, data_range.1));
    }

    let knot_vector = internal::generate_full_knot_vector(
        data_range,
        num_internal_knots,
        degree,
        training_data_for_quantiles,
    )?;
    let basis_matrix = create_bspline_basis_with_knots(data, knot_vector.view(), degree)?;
    Ok((basis_matrix, knot_vector))
}

/// Evaluates a B-spline basis against a previously generated knot vector.
///
/// Values outside the boundary knots are clamped to the boundary, so the
/// fitted curve is extended flat rather than extrapolated polynomially.
pub fn create_bspline_basis_with_knots(
    data: ArrayView1<f64>,
    knot_vector: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if knot_vector.len() < 2 * (degree + 1) {
        return Err(BasisError::InvalidKnotVector {
            knots: knot_vector.len(),
            degree,
        });
    }

    // n = k - d - 1 basis functions for k knots of a degree d spline.
    let num_basis_functions = knot_vector.len() - degree - 1;
    let lower = knot_vector[degree];
    let upper = knot_vector[num_basis_functions];

    let mut basis_matrix = Array2::zeros((data.len(), num_basis_functions));
    for (i, &x) in data.iter().enumerate() {
        let clamped = x.clamp(lower, upper);
        let basis_row = internal::evaluate_splines_at_point(clamped, degree, knot_vector);
        basis_matrix.row_mut(i).assign(&basis_row);
    }
    Ok(basis_matrix)
}

/// Creates a penalty matrix `S = D' D`, penalizing the squared `order`-th
/// differences of adjacent spline coefficients (the P-spline penalty).
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }
    Ok(d.t().dot(&d))
}

/// Applies a sum-to-zero constraint to a basis matrix for model identifiability.
///
/// The constrained basis `B Z` sums to zero over the training rows, which
/// removes the confounding between the intercept and the smooth. This is also
/// what makes every term curve mean-zero over the data it was fitted to.
///
/// # Returns
/// The constrained basis (one fewer column) and the transform `Z`.
pub fn apply_sum_to_zero_constraint(
    basis_matrix: ArrayView2<f64>,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let n_basis = basis_matrix.ncols();

    // c = B' 1; the null space of c' spans the admissible coefficients.
    let constraint_vec = basis_matrix.sum_axis(Axis(0));
    let c = constraint_vec.insert_axis(Axis(1));

    // The first column of Q is parallel to c, the rest span its complement.
    let (q, _) = c.qr()?;
    let z_transform = q.slice(s![.., 1..n_basis]).to_owned();

    let constrained_basis = basis_matrix.dot(&z_transform);
    Ok((constrained_basis, z_transform))
}

mod internal {
    use super::*;

    /// Generates the full knot vector, including repeated boundary knots.
    pub(super) fn generate_full_knot_vector(
        data_range: (f64, f64),
        num_internal_knots: usize,
        degree: usize,
        training_data_for_quantiles: Option<ArrayView1<f64>>,
    ) -> Result<Array1<f64>, BasisError> {
        let (min_val, max_val) = data_range;

        let internal_knots = match training_data_for_quantiles {
            Some(training_data) => {
                if training_data.is_empty() {
                    return Err(BasisError::QuantileDataMissing);
                }
                if training_data.len() < num_internal_knots {
                    return Err(BasisError::InsufficientDataForQuantiles {
                        num_quantiles: num_internal_knots,
                        num_points: training_data.len(),
                    });
                }
                quantiles(training_data, num_internal_knots)
            }
            None if num_internal_knots == 0 => Array1::from_vec(vec![]),
            None => {
                let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);
                Array::from_iter((1..=num_internal_knots).map(|i| min_val + i as f64 * h))
            }
        };

        // Clamped splines repeat each boundary knot `degree + 1` times.
        let mut knots = Vec::with_capacity(internal_knots.len() + 2 * (degree + 1));
        knots.extend(std::iter::repeat_n(min_val, degree + 1));
        knots.extend(internal_knots.iter().copied());
        knots.extend(std::iter::repeat_n(max_val, degree + 1));
        Ok(Array1::from_vec(knots))
    }

    /// Quantiles at `k / (num_quantiles + 1)` using linear interpolation (type 7).
    fn quantiles(data: ArrayView1<f64>, num_quantiles: usize) -> Array1<f64> {
        if num_quantiles == 0 {
            return Array1::from_vec(vec![]);
        }

        let mut sorted_data = data.to_vec();
        sorted_data.sort_unstable_by(f64::total_cmp);

        let n = sorted_data.len();
        Array1::from_iter((1..=num_quantiles).map(|k| {
            let p = k as f64 / (num_quantiles as f64 + 1.0);
            let float_idx = (n as f64 - 1.0) * p;
            let lower_idx = float_idx.floor() as usize;
            let upper_idx = float_idx.ceil() as usize;
            let fraction = float_idx - lower_idx as f64;
            sorted_data[lower_idx] * (1.0 - fraction) + sorted_data[upper_idx] * fraction
        }))
    }

    /// Evaluates all B-spline basis functions at a single point `x` using the
    /// triangular Cox-de Boor scheme. Only the `degree + 1` functions supported
    /// on the knot span containing `x` are non-zero.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_basis = knots.len() - degree - 1;

        // Span `mu` with knots[mu] <= x < knots[mu + 1]; the right boundary
        // belongs to the last non-degenerate span.
        let mu = knots
            .iter()
            .rposition(|&k| k <= x)
            .unwrap_or(degree)
            .clamp(degree, num_basis - 1);

        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        let mut n = vec![0.0; degree + 1];
        n[0] = 1.0;

        for j in 1..=degree {
            left[j] = x - knots[mu + 1 - j];
            right[j] = knots[mu + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom.abs() > 1e-12 { n[r] / denom } else { 0.0 };
                n[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            n[j] = saved;
        }

        let mut basis_values = Array1::zeros(num_basis);
        let start_index = mu - degree;
        for (offset, value) in n.into_iter().enumerate() {
            basis_values[start_index + offset] = value;
        }
        basis_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_knot_generation_uniform() {
        let knots = internal::generate_full_knot_vector((0.0, 10.0), 3, 2, None).unwrap();
        assert_eq!(knots.len(), 9);
        assert_eq!(
            knots,
            array![0.0, 0.0, 0.0, 2.5, 5.0, 7.5, 10.0, 10.0, 10.0]
        );
    }

    #[test]
    fn test_knot_generation_quantile() {
        let training_data = array![0., 1., 2., 5., 8., 9., 10.];
        let knots =
            internal::generate_full_knot_vector((0.0, 10.0), 3, 2, Some(training_data.view()))
                .unwrap();
        // p=0.25 -> idx 1.5 -> 1.5; p=0.5 -> idx 3 -> 5; p=0.75 -> idx 4.5 -> 8.5
        assert_eq!(
            knots,
            array![0.0, 0.0, 0.0, 1.5, 5.0, 8.5, 10.0, 10.0, 10.0]
        );
    }

    #[test]
    fn test_penalty_matrix_creation() {
        let s = create_difference_penalty_matrix(5, 2).unwrap();
        let expected_s = array![
            [1., -2., 1., 0., 0.],
            [-2., 5., -4., 1., 0.],
            [1., -4., 6., -4., 1.],
            [0., 1., -4., 5., -2.],
            [0., 0., 1., -2., 1.]
        ];
        for (actual, expected) in s.iter().zip(expected_s.iter()) {
            assert_abs_diff_eq!(*actual, *expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_bspline_basis_sums_to_one() {
        let data = Array::linspace(0.0, 10.0, 101);
        let (basis, _) = create_bspline_basis(data.view(), None, (0.0, 10.0), 10, 3).unwrap();
        assert_eq!(basis.ncols(), 14);
        for &sum in basis.sum_axis(Axis(1)).iter() {
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_single_point_evaluation_degree_one() {
        // Knots [0,0,1,2,2], x = 0.5: hat functions give B0 = B1 = 0.5, B2 = 0.
        let knots = array![0.0, 0.0, 1.0, 2.0, 2.0];
        let values = internal::evaluate_splines_at_point(0.5, 1, knots.view());
        assert_eq!(values.len(), 3);
        assert_abs_diff_eq!(values[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(values[1], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(values[2], 0.0, epsilon = 1e-12);

        let at_knot = internal::evaluate_splines_at_point(1.0, 1, knots.view());
        assert_abs_diff_eq!(at_knot[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_right_boundary_and_clamping() {
        let knots = array![0.0, 0.0, 0.0, 0.0, 5.0, 10.0, 10.0, 10.0, 10.0];
        let data = array![10.0, 12.0, -3.0];
        let basis = create_bspline_basis_with_knots(data.view(), knots.view(), 3).unwrap();
        // The right boundary (and anything past it) maps onto the last function.
        assert_abs_diff_eq!(basis[[0, 4]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(basis[[1, 4]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(basis[[2, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sum_to_zero_constraint() {
        let data = Array::linspace(1.0, 365.0, 50);
        let (basis, _) = create_bspline_basis(data.view(), None, (1.0, 365.0), 6, 3).unwrap();
        let (constrained, z) = apply_sum_to_zero_constraint(basis.view()).unwrap();
        assert_eq!(z.dim(), (basis.ncols(), basis.ncols() - 1));
        for &column_sum in constrained.sum_axis(Axis(0)).iter() {
            assert_abs_diff_eq!(column_sum, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_error_conditions() {
        match create_bspline_basis(array![].view(), None, (0.0, 10.0), 5, 0).unwrap_err() {
            BasisError::InvalidDegree(deg) => assert_eq!(deg, 0),
            other => panic!("Expected InvalidDegree error, got {other:?}"),
        }

        match create_bspline_basis(array![].view(), None, (10.0, 0.0), 5, 1).unwrap_err() {
            BasisError::InvalidRange(start, end) => {
                assert_eq!(start, 10.0);
                assert_eq!(end, 0.0);
            }
            other => panic!("Expected InvalidRange error, got {other:?}"),
        }

        match create_bspline_basis(
            array![].view(),
            Some(array![1., 2.].view()),
            (0.0, 10.0),
            3,
            1,
        )
        .unwrap_err()
        {
            BasisError::InsufficientDataForQuantiles {
                num_quantiles,
                num_points,
            } => {
                assert_eq!(num_quantiles, 3);
                assert_eq!(num_points, 2);
            }
            other => panic!("Expected InsufficientDataForQuantiles error, got {other:?}"),
        }

        match create_difference_penalty_matrix(5, 5).unwrap_err() {
            BasisError::InvalidPenaltyOrder { order, num_basis } => {
                assert_eq!(order, 5);
                assert_eq!(num_basis, 5);
            }
            other => panic!("Expected InvalidPenaltyOrder error, got {other:?}"),
        }
    }
}
