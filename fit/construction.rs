use crate::fit::basis::{
    self, BasisError, KnotStrategy, create_bspline_basis, create_bspline_basis_with_knots,
    create_difference_penalty_matrix,
};
use crate::fit::data::MISSING_LABEL;
use crate::fit::model::{GroupConfig, GroupEffect, GroupTerm, SmoothConfig, SmoothTerm};
use crate::model::INTERCEPT_NAME;
use ndarray::{Array1, Array2, ArrayView1, s};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ops::Range;
use thiserror::Error;

/// Read access to named columns, shared by training tables and prediction grids
/// so both go through the same design assembly.
pub trait ColumnSource {
    fn nrows(&self) -> usize;
    fn numeric(&self, name: &str) -> Option<ArrayView1<'_, f64>>;
    fn labels(&self, name: &str) -> Option<&[String]>;

    /// A column read as categories: label columns as stored, numeric
    /// columns in their `numeric_label` form.
    fn category_values(&self, name: &str) -> Option<Cow<'_, [String]>> {
        if let Some(labels) = self.labels(name) {
            return Some(Cow::Borrowed(labels));
        }
        let values = self.numeric(name)?;
        Some(Cow::Owned(values.iter().map(|&v| numeric_label(v)).collect()))
    }
}

/// Text form of a numeric value used as a category, so `2019.0` reads `2019`.
pub fn numeric_label(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        MISSING_LABEL.to_string()
    }
}

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Required covariate column '{0}' is missing.")]
    MissingColumn(String),
    #[error("Column '{column}' has {found} rows but {expected} were expected.")]
    LengthMismatch {
        column: String,
        found: usize,
        expected: usize,
    },
    #[error("Level '{level}' of '{column}' was not present when the model was fitted.")]
    UnknownLevel { column: String, level: String },
    #[error("Constraint for {term} expects {expected} basis columns but the basis has {found}.")]
    ConstraintMismatch {
        term: String,
        expected: usize,
        found: usize,
    },
    #[error("Grouping column '{column}' has {levels} level(s); at least 2 are required.")]
    TooFewLevels { column: String, levels: usize },
    #[error("Underlying basis function generation failed: {0}")]
    Basis(#[from] BasisError),
}

/// Holds the column layout of the design matrix `X` and its penalty blocks.
#[derive(Clone, Debug)]
pub struct ModelLayout {
    pub intercept_col: usize,
    pub group_cols: Range<usize>,
    pub penalty_map: Vec<PenalizedBlock>,
    pub total_coeffs: usize,
    pub num_penalties: usize,
}

/// Information about a single penalized block of coefficients.
#[derive(Clone, Debug)]
pub struct PenalizedBlock {
    pub term_name: String,
    pub col_range: Range<usize>,
    pub penalty_idx: usize,
}

impl ModelLayout {
    /// Canonical order: intercept, grouping block, then one block per smooth.
    /// Smooth penalties take indices `0..smooths.len()`; a random group effect,
    /// when present, takes the last index.
    pub fn new(smooths: &[SmoothTerm], group: Option<&GroupTerm>) -> Self {
        let mut penalty_map = Vec::new();
        let intercept_col = 0;
        let mut current_col = 1;

        let group_width = group.map_or(0, |g| g.coded_levels().len());
        let group_cols = current_col..current_col + group_width;
        current_col += group_width;

        for (penalty_idx, smooth) in smooths.iter().enumerate() {
            let width = smooth.num_coefficients();
            penalty_map.push(PenalizedBlock {
                term_name: smooth.label(),
                col_range: current_col..current_col + width,
                penalty_idx,
            });
            current_col += width;
        }

        if let Some(g) = group.filter(|g| g.config.effect == GroupEffect::Random) {
            penalty_map.push(PenalizedBlock {
                term_name: g.label(),
                col_range: group_cols.clone(),
                penalty_idx: smooths.len(),
            });
        }

        let num_penalties = penalty_map.len();
        ModelLayout {
            intercept_col,
            group_cols,
            penalty_map,
            total_coeffs: current_col,
            num_penalties,
        }
    }
}

/// Coefficient names in layout order; these carry the term markers the
/// posterior term index is built from.
pub fn coefficient_names(smooths: &[SmoothTerm], group: Option<&GroupTerm>) -> Vec<String> {
    let mut names = vec![INTERCEPT_NAME.to_string()];
    if let Some(g) = group {
        names.extend(g.coded_levels().iter().map(|level| g.coefficient_name(level)));
    }
    for smooth in smooths {
        names.extend((1..=smooth.num_coefficients()).map(|j| format!("{}.{j}", smooth.label())));
    }
    names
}

fn checked_numeric<'a>(
    source: &'a dyn ColumnSource,
    name: &str,
) -> Result<ArrayView1<'a, f64>, DesignError> {
    let column = source
        .numeric(name)
        .ok_or_else(|| DesignError::MissingColumn(name.to_string()))?;
    if column.len() != source.nrows() {
        return Err(DesignError::LengthMismatch {
            column: name.to_string(),
            found: column.len(),
            expected: source.nrows(),
        });
    }
    Ok(column)
}

/// Builds the knot vectors and sum-to-zero constraints for each smooth from
/// the training covariates.
pub fn build_smooth_terms(
    data: &dyn ColumnSource,
    configs: &[SmoothConfig],
) -> Result<Vec<SmoothTerm>, DesignError> {
    configs
        .iter()
        .map(|config| {
            let x = checked_numeric(data, &config.covariate)?;
            let range = x.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
            let quantile_data = match config.knot_strategy {
                KnotStrategy::Quantile => Some(x),
                KnotStrategy::Uniform => None,
            };
            let (unconstrained, knot_vector) =
                create_bspline_basis(x, quantile_data, range, config.num_knots, config.degree)?;
            let (_, constraint) = basis::apply_sum_to_zero_constraint(unconstrained.view())?;
            log::debug!(
                "Smooth s({}) over [{:.3}, {:.3}]: {} basis functions, {} after constraint.",
                config.covariate,
                range.0,
                range.1,
                unconstrained.ncols(),
                constraint.ncols()
            );
            Ok(SmoothTerm {
                config: config.clone(),
                range,
                knot_vector,
                constraint,
                lambda: 0.0,
                edf: 0.0,
            })
        })
        .collect()
}

/// Collects the sorted distinct levels of the grouping column. Numeric codes
/// are accepted and compared in text form.
pub fn build_group_term(
    data: &dyn ColumnSource,
    config: &GroupConfig,
) -> Result<GroupTerm, DesignError> {
    let labels = data
        .category_values(&config.column)
        .ok_or_else(|| DesignError::MissingColumn(config.column.clone()))?;
    let levels: Vec<String> = labels
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if levels.len() < 2 {
        return Err(DesignError::TooFewLevels {
            column: config.column.clone(),
            levels: levels.len(),
        });
    }
    Ok(GroupTerm {
        config: config.clone(),
        levels,
        lambda: None,
    })
}

/// Assembles the design (prediction) matrix for any column source.
///
/// A random grouping effect whose column is absent, or whose level is unseen,
/// contributes zeros (population-level prediction). A fixed grouping effect
/// requires known levels.
pub fn assemble_design(
    source: &dyn ColumnSource,
    smooths: &[SmoothTerm],
    group: Option<&GroupTerm>,
) -> Result<Array2<f64>, DesignError> {
    let layout = ModelLayout::new(smooths, group);
    let n = source.nrows();
    let mut x = Array2::zeros((n, layout.total_coeffs));
    x.column_mut(layout.intercept_col).fill(1.0);

    if let Some(g) = group {
        fill_group_block(source, g, &layout, &mut x)?;
    }

    for (smooth, block) in smooths.iter().zip(&layout.penalty_map) {
        let covariate = checked_numeric(source, &smooth.config.covariate)?;
        let unconstrained = create_bspline_basis_with_knots(
            covariate,
            smooth.knot_vector.view(),
            smooth.config.degree,
        )?;
        if unconstrained.ncols() != smooth.constraint.nrows() {
            return Err(DesignError::ConstraintMismatch {
                term: smooth.label(),
                expected: smooth.constraint.nrows(),
                found: unconstrained.ncols(),
            });
        }
        x.slice_mut(s![.., block.col_range.clone()])
            .assign(&unconstrained.dot(&smooth.constraint));
    }

    Ok(x)
}

fn fill_group_block(
    source: &dyn ColumnSource,
    group: &GroupTerm,
    layout: &ModelLayout,
    x: &mut Array2<f64>,
) -> Result<(), DesignError> {
    let random = group.config.effect == GroupEffect::Random;
    let Some(labels) = source.category_values(&group.config.column) else {
        if random {
            return Ok(());
        }
        return Err(DesignError::MissingColumn(group.config.column.clone()));
    };
    if labels.len() != source.nrows() {
        return Err(DesignError::LengthMismatch {
            column: group.config.column.clone(),
            found: labels.len(),
            expected: source.nrows(),
        });
    }

    let coded = group.coded_levels();
    for (row, label) in labels.iter().enumerate() {
        match coded.iter().position(|level| level == label) {
            Some(offset) => x[[row, layout.group_cols.start + offset]] = 1.0,
            // The reference level of a fixed effect is the all-zero row.
            None if random || group.levels.first() == Some(label) => {}
            None => {
                return Err(DesignError::UnknownLevel {
                    column: group.config.column.clone(),
                    level: label.clone(),
                });
            }
        }
    }
    Ok(())
}

/// One unscaled penalty matrix per penalty index, sized to its block.
pub fn build_penalties(
    smooths: &[SmoothTerm],
    group: Option<&GroupTerm>,
) -> Result<Vec<Array2<f64>>, DesignError> {
    let mut s_list = Vec::with_capacity(smooths.len() + 1);
    for smooth in smooths {
        let num_basis = smooth.constraint.nrows();
        let s_unconstrained =
            create_difference_penalty_matrix(num_basis, smooth.config.penalty_order)?;
        let z = &smooth.constraint;
        s_list.push(z.t().dot(&s_unconstrained).dot(z));
    }
    if let Some(g) = group.filter(|g| g.config.effect == GroupEffect::Random) {
        s_list.push(Array2::eye(g.coded_levels().len()));
    }
    Ok(s_list)
}

/// Builds the block-diagonal `S_lambda = sum_k lambda_k S_k` over the full
/// coefficient vector.
pub fn construct_s_lambda(
    lambdas: &Array1<f64>,
    s_list: &[Array2<f64>],
    layout: &ModelLayout,
) -> Array2<f64> {
    let mut s_lambda = Array2::zeros((layout.total_coeffs, layout.total_coeffs));
    for block in &layout.penalty_map {
        let lambda_k = lambdas[block.penalty_idx];
        let s_k = &s_list[block.penalty_idx];
        s_lambda
            .slice_mut(s![block.col_range.clone(), block.col_range.clone()])
            .scaled_add(lambda_k, s_k);
    }
    s_lambda
}
