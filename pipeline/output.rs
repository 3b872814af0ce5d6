//! CSV writers for band tables, retained ensembles, and batch bookkeeping.
//!
//! Band rows are `<labels...>,row,term,covariate,value,mean,lower,upper`.
//! `term` is `whole` for whole-model bands; `covariate`/`value` are empty
//! when a band carries no covariate.

use crate::interval::CredibleBand;
use crate::pipeline::batch::{BatchReport, GroupFailure, GroupResult};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const WHOLE_MODEL_TERM: &str = "whole";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to write CSV record: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Bands in one table must share label columns; found {found:?} after {expected:?}.")]
    InconsistentLabels {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

fn label_names(band: &CredibleBand) -> Vec<String> {
    band.labels.iter().map(|(name, _)| name.clone()).collect()
}

fn check_labels(expected: &[String], band: &CredibleBand) -> Result<(), OutputError> {
    let found = label_names(band);
    if found != expected {
        return Err(OutputError::InconsistentLabels {
            expected: expected.to_vec(),
            found,
        });
    }
    Ok(())
}

fn row_prefix(band: &CredibleBand, row: usize) -> Vec<String> {
    band.labels
        .iter()
        .map(|(_, values)| values[row].clone())
        .collect()
}

fn term_name(band: &CredibleBand) -> &str {
    band.term.as_deref().unwrap_or(WHOLE_MODEL_TERM)
}

/// Writes bands as one table. Every band must have the same label columns.
pub fn write_bands<W: Write>(writer: W, bands: &[&CredibleBand]) -> Result<(), OutputError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let labels = bands.first().map(|b| label_names(b)).unwrap_or_default();

    let mut header = labels.clone();
    header.extend(
        ["row", "term", "covariate", "value", "mean", "lower", "upper"].map(String::from),
    );
    csv_writer.write_record(&header)?;

    for band in bands {
        check_labels(&labels, band)?;
        for row in 0..band.nrows() {
            let (covariate, value) = match &band.covariate {
                Some((name, values)) => (name.clone(), values[row].to_string()),
                None => (String::new(), String::new()),
            };
            let mut record = row_prefix(band, row);
            record.extend([
                row.to_string(),
                term_name(band).to_string(),
                covariate,
                value,
                band.mean[row].to_string(),
                band.lower[row].to_string(),
                band.upper[row].to_string(),
            ]);
            csv_writer.write_record(&record)?;
        }
    }
    csv_writer.flush()?;
    Ok(())
}

/// Long-format ensemble table `<labels...>,term,row,draw,value`. Bands
/// without a retained ensemble contribute nothing.
pub fn write_ensembles<W: Write>(writer: W, bands: &[&CredibleBand]) -> Result<(), OutputError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let labels = bands.first().map(|b| label_names(b)).unwrap_or_default();

    let mut header = labels.clone();
    header.extend(["term", "row", "draw", "value"].map(String::from));
    csv_writer.write_record(&header)?;

    for band in bands {
        check_labels(&labels, band)?;
        let Some(ensemble) = &band.ensemble else {
            continue;
        };
        for ((row, draw), value) in ensemble.indexed_iter() {
            let mut record = row_prefix(band, row);
            record.extend([
                term_name(band).to_string(),
                row.to_string(),
                draw.to_string(),
                value.to_string(),
            ]);
            csv_writer.write_record(&record)?;
        }
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_failures<W: Write>(writer: W, failures: &[GroupFailure]) -> Result<(), OutputError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(["group", "error"])?;
    for failure in failures {
        csv_writer.write_record([failure.key.to_string(), failure.error.to_string()])?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// One row of fit diagnostics per successful group.
pub fn write_group_summary<W: Write>(writer: W, results: &[GroupResult]) -> Result<(), OutputError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record([
        "group",
        "model_kind",
        "n_obs",
        "dropped_rows",
        "edf",
        "scale",
        "gcv",
        "r_squared",
    ])?;
    for result in results {
        let d = &result.diagnostics;
        csv_writer.write_record([
            result.key.to_string(),
            result.model_kind.to_string(),
            d.n_obs.to_string(),
            result.dropped_rows.to_string(),
            d.edf.to_string(),
            d.scale.to_string(),
            d.gcv.to_string(),
            d.r_squared.to_string(),
        ])?;
    }
    csv_writer.flush()?;
    Ok(())
}

fn create(path: &Path) -> Result<BufWriter<File>, OutputError> {
    Ok(BufWriter::new(File::create(path)?))
}

impl BatchReport {
    /// Writes `level_bands.csv`, `derivative_bands.csv`, `groups.csv` and
    /// `failures.csv` (plus `*_ensemble.csv` when ensembles were kept).
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), OutputError> {
        std::fs::create_dir_all(dir)?;
        let level: Vec<&CredibleBand> = self.results.iter().flat_map(|r| &r.bands.level).collect();
        let derivative: Vec<&CredibleBand> = self
            .results
            .iter()
            .flat_map(|r| &r.bands.derivative)
            .collect();

        write_bands(create(&dir.join("level_bands.csv"))?, &level)?;
        write_bands(create(&dir.join("derivative_bands.csv"))?, &derivative)?;
        write_group_summary(create(&dir.join("groups.csv"))?, &self.results)?;
        write_failures(create(&dir.join("failures.csv"))?, &self.failures)?;

        if level.iter().any(|b| b.ensemble.is_some()) {
            write_ensembles(create(&dir.join("level_ensemble.csv"))?, &level)?;
            write_ensembles(create(&dir.join("derivative_ensemble.csv"))?, &derivative)?;
        }
        log::info!(
            "Wrote {} group result(s) and {} failure(s) to '{}'",
            self.results.len(),
            self.failures.len(),
            dir.display()
        );
        Ok(())
    }
}
