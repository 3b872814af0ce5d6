#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod derivative;
pub mod faer_ndarray;
pub mod grid;
pub mod interval;
pub mod model;
pub mod simulate;

#[path = "../fit/mod.rs"]
pub mod fit;

#[path = "../pipeline/mod.rs"]
pub mod pipeline;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use config::SimulationConfig;
pub use derivative::{DerivativeBands, estimate_derivatives};
pub use grid::PredictionGrid;
pub use interval::{CredibleBand, summarize, summarize_simulation};
pub use model::{FittedModel, FittedSmooth, TermIndex};
pub use simulate::{CovariancePolicy, Simulation, SimulationEnsemble, SimulationError, simulate};
