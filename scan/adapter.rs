use crate::error::QtlError;
use crate::result::VariantResult;
use crate::solver::FastScanner;
use crate::solver::linalg::diagonal_sqrt;
use ndarray::{Array1, ArrayView2};

/// Uniform front over the single- and multi-trait scanners, speaking [`VariantResult`].
pub struct ScannerAdapter {
    scanner: Box<dyn FastScanner>,
}

impl ScannerAdapter {
    pub fn new(scanner: Box<dyn FastScanner>) -> Self {
        Self { scanner }
    }

    pub fn null_lml(&self) -> f64 {
        self.scanner.null_lml()
    }

    pub fn null_beta(&self) -> Array1<f64> {
        self.scanner.null_beta()
    }

    pub fn null_beta_se(&self) -> Array1<f64> {
        diagonal_sqrt(&self.scanner.null_beta_covariance())
    }

    /// One alternative per column of `g`, in column order.
    pub fn fast_scan(&self, g: ArrayView2<f64>) -> Result<Vec<VariantResult>, QtlError> {
        let sweep = self.scanner.fast_scan(g)?;
        Ok((0..sweep.len())
            .map(|j| VariantResult::from(sweep.outcome(j)))
            .collect())
    }

    /// One alternative with every column of `design` added jointly.
    pub fn scan(&self, design: ArrayView2<f64>) -> Result<VariantResult, QtlError> {
        Ok(self.scanner.scan(design)?.into())
    }
}
