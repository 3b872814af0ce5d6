use crate::SimulationError;
use crate::fit::basis::KnotStrategy;
use crate::fit::construction::{self, ColumnSource, DesignError};
use crate::grid::PredictionGrid;
use crate::model::{FittedSmooth, ModelError, TermIndex};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

// --- Fit configuration ---

/// Configuration for one smooth term `s(covariate)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothConfig {
    pub covariate: String,
    pub num_knots: usize,
    pub degree: usize,
    pub penalty_order: usize,
    pub knot_strategy: KnotStrategy,
}

impl SmoothConfig {
    /// Cubic P-spline with ten internal knots and a second-order penalty.
    pub fn new(covariate: &str) -> Self {
        SmoothConfig {
            covariate: covariate.to_string(),
            num_knots: 10,
            degree: 3,
            penalty_order: 2,
            knot_strategy: KnotStrategy::Uniform,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupEffect {
    /// Treatment-coded dummies, first level as reference.
    Fixed,
    /// Ridge-penalized indicator per level (a Gaussian random intercept).
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub column: String,
    pub effect: GroupEffect,
}

/// How the smoothing parameters are chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum LambdaSelection {
    /// Minimize GCV over log-lambda with BFGS.
    Gcv { max_iterations: usize, tolerance: f64 },
    /// Use these smoothing parameters as given, one per penalty.
    Fixed(Vec<f64>),
}

impl Default for LambdaSelection {
    fn default() -> Self {
        LambdaSelection::Gcv {
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitConfig {
    pub response: String,
    pub smooths: Vec<SmoothConfig>,
    pub group: Option<GroupConfig>,
    pub lambda: LambdaSelection,
}

// --- Fitted model artifact ---

/// A fitted smooth: everything needed to rebuild its basis for new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothTerm {
    pub config: SmoothConfig,
    pub range: (f64, f64),
    pub knot_vector: Array1<f64>,
    /// `Z` such that `B Z` is the constrained basis.
    pub constraint: Array2<f64>,
    pub lambda: f64,
    pub edf: f64,
}

impl SmoothTerm {
    pub fn label(&self) -> String {
        format!("s({})", self.config.covariate)
    }

    pub fn num_coefficients(&self) -> usize {
        self.constraint.ncols()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTerm {
    pub config: GroupConfig,
    /// Sorted distinct levels seen at fit time.
    pub levels: Vec<String>,
    pub lambda: Option<f64>,
}

impl GroupTerm {
    pub fn label(&self) -> String {
        match self.config.effect {
            GroupEffect::Fixed => self.config.column.clone(),
            GroupEffect::Random => format!("re({})", self.config.column),
        }
    }

    /// Levels that own a coefficient; the fixed effect drops its reference level.
    pub fn coded_levels(&self) -> &[String] {
        match self.config.effect {
            GroupEffect::Fixed => self.levels.get(1..).unwrap_or(&[]),
            GroupEffect::Random => &self.levels,
        }
    }

    pub fn coefficient_name(&self, level: &str) -> String {
        match self.config.effect {
            GroupEffect::Fixed => format!("{}{level}", self.config.column),
            GroupEffect::Random => format!("re({}).{level}", self.config.column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub n_obs: usize,
    pub edf: f64,
    pub scale: f64,
    pub rss: f64,
    pub gcv: f64,
    pub r_squared: f64,
}

/// Serialized shape of a `GamModel`; the term index is rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamModelRecord {
    pub response: String,
    pub smooths: Vec<SmoothTerm>,
    pub group: Option<GroupTerm>,
    pub diagnostics: FitDiagnostics,
    pub coefficient_names: Vec<String>,
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
}

/// A fitted Gaussian additive model: `y = intercept + group + sum_j s_j(x_j)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GamModelRecord", into = "GamModelRecord")]
pub struct GamModel {
    pub response: String,
    pub smooths: Vec<SmoothTerm>,
    pub group: Option<GroupTerm>,
    pub diagnostics: FitDiagnostics,
    coefficient_names: Vec<String>,
    coefficients: Array1<f64>,
    covariance: Array2<f64>,
    terms: TermIndex,
}

impl TryFrom<GamModelRecord> for GamModel {
    type Error = ModelError;

    fn try_from(record: GamModelRecord) -> Result<Self, Self::Error> {
        GamModel::new(record)
    }
}

impl From<GamModel> for GamModelRecord {
    fn from(model: GamModel) -> Self {
        GamModelRecord {
            response: model.response,
            smooths: model.smooths,
            group: model.group,
            diagnostics: model.diagnostics,
            coefficient_names: model.coefficient_names,
            coefficients: model.coefficients,
            covariance: model.covariance,
        }
    }
}

impl GamModel {
    /// Validates the record's dimensions and builds the term index.
    pub fn new(record: GamModelRecord) -> Result<Self, ModelError> {
        let p = record.coefficients.len();
        if record.coefficient_names.len() != p {
            return Err(ModelError::InconsistentDimensions(format!(
                "{} coefficient names for {p} coefficients",
                record.coefficient_names.len()
            )));
        }
        if record.covariance.dim() != (p, p) {
            return Err(ModelError::InconsistentDimensions(format!(
                "covariance is {:?} for {p} coefficients",
                record.covariance.dim()
            )));
        }
        let expected = construction::coefficient_names(&record.smooths, record.group.as_ref());
        if expected != record.coefficient_names {
            return Err(ModelError::InconsistentDimensions(
                "coefficient names do not match the model's term layout".to_string(),
            ));
        }

        let group_columns: Vec<String> = record
            .group
            .iter()
            .map(|g| g.config.column.clone())
            .collect();
        let terms = TermIndex::from_coefficient_names(&record.coefficient_names, &group_columns);
        Ok(GamModel {
            response: record.response,
            smooths: record.smooths,
            group: record.group,
            diagnostics: record.diagnostics,
            coefficient_names: record.coefficient_names,
            coefficients: record.coefficients,
            covariance: record.covariance,
            terms,
        })
    }

    pub fn design_matrix(&self, source: &dyn ColumnSource) -> Result<Array2<f64>, DesignError> {
        construction::assemble_design(source, &self.smooths, self.group.as_ref())
    }

    /// Plain fitted values `X beta` for the rows of `source`.
    pub fn fitted_values(&self, source: &dyn ColumnSource) -> Result<Array1<f64>, DesignError> {
        Ok(self.design_matrix(source)?.dot(&self.coefficients))
    }

    /// Gives `grid` the grouping column when it has none: every row gets
    /// `level`, or the reference level of a fixed effect when `level` is
    /// `None`. A random effect without a level stays population-level.
    pub fn complete_group_column(
        &self,
        grid: PredictionGrid,
        level: Option<&str>,
    ) -> Result<PredictionGrid, SimulationError> {
        let Some(group) = &self.group else {
            return Ok(grid);
        };
        if grid.category_values(&group.config.column).is_some() {
            return Ok(grid);
        }
        let level = match level {
            Some(level) => level,
            None if group.config.effect == GroupEffect::Fixed => match group.levels.first() {
                Some(reference) => reference.as_str(),
                None => return Ok(grid),
            },
            None => return Ok(grid),
        };
        if !group.levels.iter().any(|known| known == level) {
            return Err(DesignError::UnknownLevel {
                column: group.config.column.clone(),
                level: level.to_string(),
            }
            .into());
        }
        let len = grid.nrows();
        grid.with_label(&group.config.column, vec![level.to_string(); len])
    }

    /// Covariates that carry a smooth, in model order.
    pub fn smooth_covariates(&self) -> Vec<String> {
        self.smooths
            .iter()
            .map(|s| s.config.covariate.clone())
            .collect()
    }
}

impl FittedSmooth for GamModel {
    fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
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
        Ok(self.design_matrix(grid)?)
    }
}
