use crate::solver::SolverError;
use polars::prelude::PolarsError;
use thiserror::Error;

/// Every failure a scan can surface. All are raised before any partial result exists.
#[derive(Error, Debug)]
pub enum QtlError {
    #[error("Shapes or labels of the inputs do not agree: {0}")]
    ShapeOrLabelMismatch(String),

    #[error(
        "Non-finite values (NaN or Infinity) were found in the {0}. All inputs must be finite after sample alignment."
    )]
    NonFiniteValues(String),

    #[error("Unknown likelihood: {0}")]
    UnknownLikelihood(String),

    #[error("Unsupported combination of inputs: {0}")]
    UnsupportedCombination(String),

    #[error("The inputs share no sample. Check that sample labels match across inputs.")]
    EmptyIntersection,

    #[error("The outcome is not valid for the chosen likelihood: {0}")]
    InvalidOutcome(String),

    #[error("The kinship matrix is not usable: {0}")]
    InvalidKinship(String),

    #[error("Model fitting failed: {0}")]
    Solver(#[from] SolverError),

    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Table(#[from] PolarsError),
}
