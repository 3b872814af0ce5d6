//! # Observation Tables
//!
//! Entry point for user-provided NDVI tables. Files are read with polars
//! (tab-separated for `.tsv`/`.txt`, comma-separated otherwise). Numeric
//! columns become `f64` arrays with nulls mapped to NaN; text columns become
//! labels with nulls mapped to `NA`.
//!
//! Missing values are not an error at load time: masked pixels routinely
//! leave holes in a time series. The rows are dropped, and counted, once the
//! columns a fit actually needs are known (`complete_rows`).

use crate::fit::construction::ColumnSource;
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const MISSING_LABEL: &str = "NA";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Column '{column}' has {found} rows but the table has {expected}.")]
    LengthMismatch {
        column: String,
        found: usize,
        expected: usize,
    },
    #[error("Column '{0}' appears more than once.")]
    DuplicateColumn(String),
    #[error(
        "Input contains only {found} complete data rows, but at least {required} are required."
    )]
    InsufficientRows { found: usize, required: usize },
}

/// Identifies one group of a split table, e.g. `landcover=forest, year=2019`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub values: Vec<(String, String)>,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .values
            .iter()
            .map(|(column, value)| format!("{column}={value}"))
            .join(", ");
        f.write_str(&rendered)
    }
}

/// A column-oriented table of observations.
#[derive(Debug, Clone, Default)]
pub struct ObservationTable {
    nrows: usize,
    numeric: Vec<(String, Array1<f64>)>,
    labels: Vec<(String, Vec<String>)>,
    dropped_rows: usize,
}

impl ObservationTable {
    pub fn new(nrows: usize) -> Self {
        ObservationTable {
            nrows,
            ..Default::default()
        }
    }

    pub fn with_numeric(mut self, name: &str, values: Array1<f64>) -> Result<Self, DataError> {
        self.check_new_column(name, values.len())?;
        self.numeric.push((name.to_string(), values));
        Ok(self)
    }

    pub fn with_labels(mut self, name: &str, values: Vec<String>) -> Result<Self, DataError> {
        self.check_new_column(name, values.len())?;
        self.labels.push((name.to_string(), values));
        Ok(self)
    }

    fn check_new_column(&self, name: &str, len: usize) -> Result<(), DataError> {
        if self.has_column(name) {
            return Err(DataError::DuplicateColumn(name.to_string()));
        }
        if len != self.nrows {
            return Err(DataError::LengthMismatch {
                column: name.to_string(),
                found: len,
                expected: self.nrows,
            });
        }
        Ok(())
    }

    /// Reads a delimited file, choosing the separator from the extension.
    pub fn from_path(path: &Path) -> Result<Self, DataError> {
        let separator = match path.extension().and_then(|ext| ext.to_str()) {
            Some("tsv") | Some("txt") => b'\t',
            _ => b',',
        };
        log::info!("Loading observations from '{}'", path.display());
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(separator)),
            )
            .finish()?;

        let mut table = ObservationTable::new(df.height());
        for column in df.get_columns() {
            let name = column.name().to_string();
            let series = column.as_materialized_series();
            table = if matches!(series.dtype(), DataType::String) {
                let values = series
                    .str()?
                    .into_iter()
                    .map(|v| v.unwrap_or(MISSING_LABEL).to_string())
                    .collect();
                table.with_labels(&name, values)?
            } else {
                let casted = series.cast(&DataType::Float64)?;
                let values: Array1<f64> = casted
                    .f64()?
                    .into_iter()
                    .map(|v| v.unwrap_or(f64::NAN))
                    .collect();
                table.with_numeric(&name, values)?
            };
        }
        log::info!(
            "Loaded {} rows: numeric columns {:?}, label columns {:?}",
            table.nrows,
            table.numeric_names().collect::<Vec<_>>(),
            table.label_names().collect::<Vec<_>>()
        );
        Ok(table)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.numeric.iter().any(|(n, _)| n == name) || self.labels.iter().any(|(n, _)| n == name)
    }

    pub fn numeric_names(&self) -> impl Iterator<Item = &str> {
        self.numeric.iter().map(|(n, _)| n.as_str())
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|(n, _)| n.as_str())
    }

    /// Rows removed by `complete_rows` over the lifetime of this table.
    pub fn dropped_rows(&self) -> usize {
        self.dropped_rows
    }

    /// Keeps only the rows whose `required` numeric columns are all finite and
    /// whose `required` label columns are not missing.
    pub fn complete_rows(&self, required: &[&str]) -> Result<Self, DataError> {
        for name in required {
            if !self.has_column(name) {
                return Err(DataError::ColumnNotFound(name.to_string()));
            }
        }
        let keep: Vec<usize> = (0..self.nrows)
            .filter(|&row| {
                required.iter().all(|name| match self.numeric(name) {
                    Some(column) => column[row].is_finite(),
                    None => self
                        .labels(name)
                        .is_some_and(|column| column[row] != MISSING_LABEL),
                })
            })
            .collect();

        let dropped = self.nrows - keep.len();
        if dropped > 0 {
            log::warn!(
                "Dropped {dropped} of {} rows with missing or non-finite values in {required:?}",
                self.nrows
            );
        }
        let mut subset = self.select_rows(&keep);
        subset.dropped_rows = self.dropped_rows + dropped;
        Ok(subset)
    }

    pub fn require_rows(&self, required: usize) -> Result<(), DataError> {
        if self.nrows < required {
            return Err(DataError::InsufficientRows {
                found: self.nrows,
                required,
            });
        }
        Ok(())
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        ObservationTable {
            nrows: rows.len(),
            numeric: self
                .numeric
                .iter()
                .map(|(name, values)| (name.clone(), rows.iter().map(|&r| values[r]).collect()))
                .collect(),
            labels: self
                .labels
                .iter()
                .map(|(name, values)| {
                    (name.clone(), rows.iter().map(|&r| values[r].clone()).collect())
                })
                .collect(),
            dropped_rows: 0,
        }
    }

    /// Splits the table into one sub-table per distinct combination of the
    /// given columns, ordered by key.
    pub fn split_by(&self, columns: &[String]) -> Result<Vec<(GroupKey, ObservationTable)>, DataError> {
        let key_columns = columns
            .iter()
            .map(|column| {
                self.category_values(column)
                    .ok_or_else(|| DataError::ColumnNotFound(column.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let key_of = |row: usize| GroupKey {
            values: columns
                .iter()
                .zip(&key_columns)
                .map(|(column, values)| (column.clone(), values[row].clone()))
                .collect(),
        };

        let groups = (0..self.nrows)
            .map(|row| (key_of(row), row))
            .into_group_map()
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .map(|(key, rows)| (key, self.select_rows(&rows)))
            .collect();
        Ok(groups)
    }

    /// `(min, max)` over the finite values of a numeric column.
    pub fn observed_range(&self, name: &str) -> Option<(f64, f64)> {
        let column = self.numeric(name)?;
        let (lo, hi) = column
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        (lo <= hi).then_some((lo, hi))
    }
}

impl ColumnSource for ObservationTable {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn numeric(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.numeric
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
