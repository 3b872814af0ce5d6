use crate::fit::construction::{ColumnSource, numeric_label};
use crate::fit::data::{DataError, ObservationTable};
use crate::simulate::SimulationError;
use ndarray::{Array1, ArrayView1};
use std::path::Path;

/// Rows to predict over: numeric covariate columns plus label columns. Labels,
/// and numeric columns the model does not read, are copied into every output
/// row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionGrid {
    nrows: usize,
    covariates: Vec<(String, Array1<f64>)>,
    labels: Vec<(String, Vec<String>)>,
}

impl PredictionGrid {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_empty_schema(&self) -> bool {
        self.covariates.is_empty() && self.labels.is_empty()
    }

    fn check_length(&self, name: &str, len: usize) -> Result<(), SimulationError> {
        if !self.is_empty_schema() && len != self.nrows {
            return Err(SimulationError::DimensionMismatch(format!(
                "grid column '{name}' has {len} rows but the grid has {}",
                self.nrows
            )));
        }
        Ok(())
    }

    /// Adds (or replaces) a numeric covariate column.
    pub fn with_covariate(mut self, name: &str, values: Array1<f64>) -> Result<Self, SimulationError> {
        self.check_length(name, values.len())?;
        self.nrows = values.len();
        match self.covariates.iter_mut().find(|(n, _)| n == name) {
            Some((_, column)) => *column = values,
            None => self.covariates.push((name.to_string(), values)),
        }
        Ok(self)
    }

    /// Adds (or replaces) a passthrough label column.
    pub fn with_label(mut self, name: &str, values: Vec<String>) -> Result<Self, SimulationError> {
        self.check_length(name, values.len())?;
        self.nrows = values.len();
        match self.labels.iter_mut().find(|(n, _)| n == name) {
            Some((_, column)) => *column = values,
            None => self.labels.push((name.to_string(), values)),
        }
        Ok(self)
    }

    /// `len` evenly spaced values of `var` from `start` to `end` inclusive.
    pub fn regular(var: &str, start: f64, end: f64, len: usize) -> Result<Self, SimulationError> {
        if len == 0 || !start.is_finite() || !end.is_finite() || (len > 1 && start >= end) {
            return Err(SimulationError::DimensionMismatch(format!(
                "cannot build a regular grid of {len} rows over [{start}, {end}]"
            )));
        }
        let values = if len == 1 {
            Array1::from_elem(1, start)
        } else {
            Array1::linspace(start, end, len)
        };
        Self::new().with_covariate(var, values)
    }

    /// One row per day of year, 1 to 365.
    pub fn daily(var: &str) -> Self {
        PredictionGrid {
            nrows: 365,
            covariates: vec![(var.to_string(), Array1::range(1.0, 366.0, 1.0))],
            labels: Vec::new(),
        }
    }

    /// Reads a grid from a delimited file: numeric columns become covariates
    /// and text columns become labels.
    pub fn from_csv(path: &Path) -> Result<Self, DataError> {
        Ok(Self::from(&ObservationTable::from_path(path)?))
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn covariate(&self, name: &str) -> Result<ArrayView1<'_, f64>, SimulationError> {
        self.numeric(name).ok_or_else(|| {
            SimulationError::DimensionMismatch(format!("grid has no covariate column '{name}'"))
        })
    }

    pub fn label_columns(&self) -> &[(String, Vec<String>)] {
        &self.labels
    }

    /// Columns copied into output rows: every label column, then every
    /// numeric column not named in `consumed`, in text form.
    pub fn passthrough_columns(&self, consumed: &[&str]) -> Vec<(String, Vec<String>)> {
        let carried = self
            .covariates
            .iter()
            .filter(|(name, _)| !consumed.contains(&name.as_str()))
            .map(|(name, values)| (name.clone(), values.iter().map(|&v| numeric_label(v)).collect()));
        self.labels.iter().cloned().chain(carried).collect()
    }

    /// True when `var` exists and strictly increases down the rows.
    pub fn is_strictly_increasing(&self, var: &str) -> bool {
        self.numeric(var).is_some_and(|values| {
            values.iter().all(|v| v.is_finite()) && values.windows(2).into_iter().all(|w| w[0] < w[1])
        })
    }
}

impl From<&ObservationTable> for PredictionGrid {
    fn from(table: &ObservationTable) -> Self {
        PredictionGrid {
            nrows: table.nrows(),
            covariates: table
                .numeric_names()
                .filter_map(|name| Some((name.to_string(), table.numeric(name)?.to_owned())))
                .collect(),
            labels: table
                .label_names()
                .filter_map(|name| Some((name.to_string(), table.labels(name)?.to_vec())))
                .collect(),
        }
    }
}

impl ColumnSource for PredictionGrid {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn numeric(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.covariates
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.view())
    }

    fn labels(&self, name: &str) -> Option<&[String]> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
    }
}
