//! # Mixed-Model Solver Layer
//!
//! Closed-form and quasi-Newton solvers that the scan orchestrator drives
//! through the [`scanner::FastScanner`] capability:
//!
//! - `linalg`: economic eigendecomposition of kinship, symmetric pseudo-inverse.
//! - `gls`: generalised least squares under a diagonalised covariance.
//! - `optimize`: the BFGS driver shared by every variance-component fit.
//! - `lmm`: single-trait linear mixed model (maximum likelihood).
//! - `glmm`: exponential-family GLMM and its Gaussian surrogate.
//! - `kron2sum`: multi-trait model with `C0 ⊗ K + C1 ⊗ I` covariance.
//! - `scanner`: fast scanners bound to a fitted null.
//! - `lrt`: likelihood-ratio test p-values.

pub mod glmm;
pub mod gls;
pub mod kron2sum;
pub mod linalg;
pub mod lmm;
pub mod lrt;
pub mod optimize;
pub mod scanner;

use thiserror::Error;

pub use glmm::{Family, GlmmConfig, GlmmExpFam, GlmmNormal, Site};
pub use kron2sum::Kron2Sum;
pub use linalg::{EconomicQs, economic_qs};
pub use lmm::Lmm;
pub use lrt::{lrt, lrt_statistic};
pub use optimize::OptimizerConfig;
pub use scanner::{FastScanOutcome, FastScanner, GaussianScanner, KronScanner, ScanOutcome};

/// Failures raised while fitting a null model or scanning an alternative.
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("A linear algebra routine failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error(
        "The {stage} iterations did not converge within {max_iterations} iterations. Last change was {last_change:.6e}."
    )]
    DidNotConverge {
        stage: &'static str,
        max_iterations: usize,
        last_change: f64,
    },

    #[error("The {0} produced a non-finite log marginal likelihood.")]
    NonFiniteLml(&'static str),

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
}
