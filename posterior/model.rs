//! The capability surface the simulator consumes, and the closed set of
//! fitted model kinds that can provide it.

use crate::fit::model::GamModel;
use crate::grid::PredictionGrid;
use crate::simulate::SimulationError;
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const INTERCEPT_NAME: &str = "(Intercept)";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model artifact has kind '{0}'; expected 'gam' or 'gamm'.")]
    InvalidModelKind(String),
    #[error("Model artifact has no [model] table.")]
    MissingModelTable,
    #[error("Model artifact is internally inconsistent: {0}")]
    InconsistentDimensions(String),
}

/// What a fitted smooth model must expose to be simulated from.
pub trait FittedSmooth {
    /// Names aligned with `coefficients()` and both axes of `covariance()`.
    fn coefficient_names(&self) -> &[String];
    fn coefficients(&self) -> ArrayView1<'_, f64>;
    fn covariance(&self) -> ArrayView2<'_, f64>;
    /// Coefficient partitions, built once when the model is constructed.
    fn terms(&self) -> &TermIndex;
    /// The `rows x coefficients` matrix mapping coefficients to the linear
    /// predictor at each grid row.
    fn prediction_basis(&self, grid: &PredictionGrid) -> Result<Array2<f64>, SimulationError>;
}

/// Which coefficients belong to which term.
///
/// The baseline partition holds the intercept and grouping coefficients; each
/// smooth covariate owns the `s(<covariate>).<k>` coefficients. A coefficient
/// matching no marker belongs to no partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermIndex {
    baseline: Vec<usize>,
    smooths: Vec<(String, Vec<usize>)>,
}

impl TermIndex {
    pub fn from_coefficient_names(names: &[String], group_columns: &[String]) -> Self {
        let mut index = TermIndex::default();
        for (i, name) in names.iter().enumerate() {
            if let Some(covariate) = smooth_covariate(name) {
                match index.smooths.iter_mut().find(|(v, _)| v == covariate) {
                    Some((_, members)) => members.push(i),
                    None => index.smooths.push((covariate.to_string(), vec![i])),
                }
            } else if name == INTERCEPT_NAME
                || is_random_group(name)
                || group_columns
                    .iter()
                    .any(|g| name.len() > g.len() && name.starts_with(g.as_str()))
            {
                index.baseline.push(i);
            }
        }
        index
    }

    pub fn baseline(&self) -> &[usize] {
        &self.baseline
    }

    pub fn smooth(&self, covariate: &str) -> Option<&[usize]> {
        self.smooths
            .iter()
            .find(|(v, _)| v == covariate)
            .map(|(_, members)| members.as_slice())
    }

    /// Covariates with a smooth partition, in coefficient order.
    pub fn smooth_covariates(&self) -> impl Iterator<Item = &str> {
        self.smooths.iter().map(|(v, _)| v.as_str())
    }
}

/// `s(v).k` -> `v`
fn smooth_covariate(name: &str) -> Option<&str> {
    let (covariate, basis_index) = name.strip_prefix("s(")?.rsplit_once(").")?;
    (!covariate.is_empty() && basis_index.parse::<usize>().is_ok()).then_some(covariate)
}

/// `re(g).level`
fn is_random_group(name: &str) -> bool {
    name.strip_prefix("re(")
        .and_then(|rest| rest.split_once(")."))
        .is_some_and(|(group, level)| !group.is_empty() && !level.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponent {
    pub term: String,
    pub variance: f64,
}

/// Mixed-model wrapper around a smooth model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedModel {
    pub gam: Option<GamModel>,
    pub variance_components: Vec<VarianceComponent>,
}

/// The fitted model kinds the simulator knows how to reduce.
#[derive(Debug, Clone, PartialEq)]
pub enum FittedModel {
    Gam(GamModel),
    Gamm(MixedModel),
}

impl FittedModel {
    pub fn kind(&self) -> &'static str {
        match self {
            FittedModel::Gam(_) => "gam",
            FittedModel::Gamm(_) => "gamm",
        }
    }

    /// The plain smooth model to simulate from.
    pub fn reduce(&self) -> Result<&GamModel, SimulationError> {
        match self {
            FittedModel::Gam(model) => Ok(model),
            FittedModel::Gamm(MixedModel { gam: Some(model), .. }) => Ok(model),
            FittedModel::Gamm(MixedModel { gam: None, .. }) => Err(
                SimulationError::InvalidModelKind(
                    "mixed model carries no smooth component to simulate from".to_string(),
                ),
            ),
        }
    }

    /// Saves the model as TOML: a `kind` tag plus a `[model]` table.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let mut table = toml::Table::new();
        table.insert("kind".to_string(), toml::Value::from(self.kind()));
        let body = match self {
            FittedModel::Gam(model) => toml::Value::try_from(model)?,
            FittedModel::Gamm(mixed) => toml::Value::try_from(mixed)?,
        };
        table.insert("model".to_string(), body);

        let toml_string = toml::to_string_pretty(&table)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        log::info!("Saved {} model to '{}'", self.kind(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let mut table: toml::Table = toml::from_str(&toml_string)?;
        let kind = match table.get("kind") {
            Some(toml::Value::String(kind)) => kind.clone(),
            Some(other) => return Err(ModelError::InvalidModelKind(other.to_string())),
            None => return Err(ModelError::InvalidModelKind(String::new())),
        };
        let body = table.remove("model").ok_or(ModelError::MissingModelTable)?;
        match kind.as_str() {
            "gam" => Ok(FittedModel::Gam(body.try_into()?)),
            "gamm" => Ok(FittedModel::Gamm(body.try_into()?)),
            _ => Err(ModelError::InvalidModelKind(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::data::ObservationTable;
    use crate::fit::estimate::fit_gam;
    use crate::fit::model::{FitConfig, GroupConfig, GroupEffect, LambdaSelection, SmoothConfig};
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use tempfile::tempdir;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn term_index_partitions_by_marker() {
        let index = TermIndex::from_coefficient_names(
            &names(&[
                "(Intercept)",
                "landcovergrassland",
                "s(dayOfYear).1",
                "s(dayOfYear).2",
                "s(year).1",
                "elevation",
            ]),
            &names(&["landcover"]),
        );
        assert_eq!(index.baseline(), &[0, 1]);
        assert_eq!(index.smooth("dayOfYear"), Some(&[2, 3][..]));
        assert_eq!(index.smooth("year"), Some(&[4][..]));
        assert_eq!(index.smooth("elevation"), None);
        assert_eq!(
            index.smooth_covariates().collect::<Vec<_>>(),
            vec!["dayOfYear", "year"]
        );
    }

    #[test]
    fn term_index_places_random_levels_in_baseline_and_ignores_lookalikes() {
        let index = TermIndex::from_coefficient_names(
            &names(&[
                "(Intercept)",
                "re(site).a",
                "re(site).b",
                "s(x).1",
                "s(x)",
                "s(x).first",
                "site",
            ]),
            &[],
        );
        assert_eq!(index.baseline(), &[0, 1, 2]);
        assert_eq!(index.smooth("x"), Some(&[3][..]));
    }

    fn fitted_table() -> ObservationTable {
        let x = Array1::linspace(0.0, 10.0, 60);
        let y = x.mapv(|v: f64| (v / 2.0).cos() + if v > 5.0 { 0.3 } else { 0.0 });
        let group = (0..60)
            .map(|i| if i % 2 == 0 { "a" } else { "b" }.to_string())
            .collect();
        ObservationTable::new(60)
            .with_numeric("x", x)
            .and_then(|t| t.with_numeric("y", y))
            .and_then(|t| t.with_labels("plot", group))
            .unwrap()
    }

    fn fit_with(effect: GroupEffect, lambdas: Vec<f64>) -> FittedModel {
        let config = FitConfig {
            response: "y".to_string(),
            smooths: vec![SmoothConfig {
                num_knots: 6,
                ..SmoothConfig::new("x")
            }],
            group: Some(GroupConfig {
                column: "plot".to_string(),
                effect,
            }),
            lambda: LambdaSelection::Fixed(lambdas),
        };
        fit_gam(&fitted_table(), &config).unwrap()
    }

    #[test]
    fn save_and_load_round_trip_preserves_predictions() {
        let dir = tempdir().unwrap();
        for (model, file) in [
            (fit_with(GroupEffect::Fixed, vec![0.5]), "gam.toml"),
            (fit_with(GroupEffect::Random, vec![0.5, 1.0]), "gamm.toml"),
        ] {
            let path = dir.path().join(file);
            model.save(&path).unwrap();
            let loaded = FittedModel::load(&path).unwrap();
            assert_eq!(loaded.kind(), model.kind());

            let grid = PredictionGrid::regular("x", 0.0, 10.0, 21)
                .unwrap()
                .with_label("plot", vec!["b".to_string(); 21])
                .unwrap();
            let before = model.reduce().unwrap().fitted_values(&grid).unwrap();
            let after = loaded.reduce().unwrap().fitted_values(&grid).unwrap();
            for (a, b) in before.iter().zip(after.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
            assert_eq!(
                loaded.reduce().unwrap().terms(),
                model.reduce().unwrap().terms(),
                "Term index must be rebuilt identically on load"
            );
        }
    }

    #[test]
    fn unknown_kind_and_empty_wrapper_are_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lm.toml");
        fs::write(&path, "kind = \"lm\"\n[model]\nresponse = \"y\"\n").unwrap();
        assert!(matches!(
            FittedModel::load(&path),
            Err(ModelError::InvalidModelKind(kind)) if kind == "lm"
        ));

        let empty = FittedModel::Gamm(MixedModel {
            gam: None,
            variance_components: vec![],
        });
        assert!(matches!(
            empty.reduce(),
            Err(SimulationError::InvalidModelKind(_))
        ));
    }
}
