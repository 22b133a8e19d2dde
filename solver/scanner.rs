//! Fast scanners bound to a fitted null model.
//!
//! A scanner keeps the null covariance fixed and, for each alternative design,
//! solves the extended GLS problem with the overall scale refitted. This is the
//! only capability the scan orchestrator needs from a fitted model.

use super::SolverError;
use super::gls::{BlockDiagonalGls, DiagonalGls, GlsFit};
use super::linalg::diagonal_sqrt;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rayon::prelude::*;

/// Result of fitting one alternative design.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub lml: f64,
    /// Covariate effect sizes refitted under the alternative.
    pub effsizes0: Array1<f64>,
    pub effsizes0_se: Array1<f64>,
    /// Effect sizes of the design columns.
    pub effsizes1: Array1<f64>,
    pub effsizes1_se: Array1<f64>,
    pub scale: f64,
}

impl ScanOutcome {
    /// Fails when the alternative's likelihood is not finite, e.g. a design
    /// that reproduces the response exactly.
    fn from_fit(fit: &GlsFit, ncovariates: usize) -> Result<Self, SolverError> {
        let lml = fit.lml_profiled();
        if !lml.is_finite() {
            return Err(SolverError::NonFiniteLml("alternative model"));
        }
        let covariance = fit.beta_covariance();
        let se = diagonal_sqrt(&covariance);
        Ok(Self {
            lml,
            effsizes0: fit.beta.slice(s![..ncovariates]).to_owned(),
            effsizes0_se: se.slice(s![..ncovariates]).to_owned(),
            effsizes1: fit.beta.slice(s![ncovariates..]).to_owned(),
            effsizes1_se: se.slice(s![ncovariates..]).to_owned(),
            scale: fit.scale(),
        })
    }
}

/// Column-wise results of a single-column sweep: row `j` belongs to column `j`.
#[derive(Debug, Clone)]
pub struct FastScanOutcome {
    pub lml: Array1<f64>,
    pub effsizes0: Array2<f64>,
    pub effsizes0_se: Array2<f64>,
    pub effsizes1: Array2<f64>,
    pub effsizes1_se: Array2<f64>,
    pub scale: Array1<f64>,
}

impl FastScanOutcome {
    pub fn len(&self) -> usize {
        self.lml.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lml.is_empty()
    }

    /// Stacks per-column outcomes in order.
    pub fn from_outcomes(outcomes: &[ScanOutcome], ncovariates: usize) -> Self {
        let m = outcomes.len();
        let k = outcomes.first().map(|o| o.effsizes1.len()).unwrap_or(1);
        let mut result = Self {
            lml: Array1::zeros(m),
            effsizes0: Array2::zeros((m, ncovariates)),
            effsizes0_se: Array2::zeros((m, ncovariates)),
            effsizes1: Array2::zeros((m, k)),
            effsizes1_se: Array2::zeros((m, k)),
            scale: Array1::zeros(m),
        };
        for (j, outcome) in outcomes.iter().enumerate() {
            result.lml[j] = outcome.lml;
            result.scale[j] = outcome.scale;
            result.effsizes0.row_mut(j).assign(&outcome.effsizes0);
            result.effsizes0_se.row_mut(j).assign(&outcome.effsizes0_se);
            result.effsizes1.row_mut(j).assign(&outcome.effsizes1);
            result.effsizes1_se.row_mut(j).assign(&outcome.effsizes1_se);
        }
        result
    }

    /// The outcome of column `j`.
    pub fn outcome(&self, j: usize) -> ScanOutcome {
        ScanOutcome {
            lml: self.lml[j],
            effsizes0: self.effsizes0.row(j).to_owned(),
            effsizes0_se: self.effsizes0_se.row(j).to_owned(),
            effsizes1: self.effsizes1.row(j).to_owned(),
            effsizes1_se: self.effsizes1_se.row(j).to_owned(),
            scale: self.scale[j],
        }
    }
}

/// Alternative-model fitting against a fixed null covariance.
///
/// The null and every alternative share one footing: the covariance shape is
/// fixed and the overall scale is profiled. A design column that adds nothing
/// therefore leaves the likelihood exactly at [`FastScanner::null_lml`].
pub trait FastScanner: Send + Sync {
    fn null_lml(&self) -> f64;

    fn null_beta(&self) -> Array1<f64>;

    fn null_beta_covariance(&self) -> Array2<f64>;

    /// Fits the null covariates plus every column of `design` jointly.
    fn scan(&self, design: ArrayView2<f64>) -> Result<ScanOutcome, SolverError>;

    /// Fits every column of `g` separately, in parallel, results in column order.
    fn fast_scan(&self, g: ArrayView2<f64>) -> Result<FastScanOutcome, SolverError> {
        let outcomes = (0..g.ncols())
            .into_par_iter()
            .map(|j| self.scan(g.slice(s![.., j..j + 1])))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FastScanOutcome::from_outcomes(&outcomes, self.null_beta().len()))
    }
}

/// Single-trait scanner for `y ~ N(Mβ + Xα, s·Q diag(d) Qᵀ)`.
///
/// `y` and `M` are stored already rotated by `Qᵀ`; designs are rotated on entry.
/// Without a rotation the covariance is `s·diag(d)` in the original basis.
#[derive(Debug, Clone)]
pub struct GaussianScanner {
    rotation: Option<Array2<f64>>,
    gls: DiagonalGls,
    null: GlsFit,
}

impl GaussianScanner {
    pub fn new(
        y: Array1<f64>,
        m: Array2<f64>,
        rotation: Option<Array2<f64>>,
        d: Array1<f64>,
    ) -> Result<Self, SolverError> {
        if let Some(q) = &rotation {
            if q.ncols() != y.len() {
                return Err(SolverError::DimensionMismatch {
                    context: "scanner rotation columns",
                    expected: y.len(),
                    found: q.ncols(),
                });
            }
        }
        let gls = DiagonalGls::new(y.view(), m.view(), d.view())?;
        let null = gls.fit_null()?;
        Ok(Self {
            rotation,
            gls,
            null,
        })
    }

    fn rotate(&self, x: ArrayView2<f64>) -> Array2<f64> {
        match &self.rotation {
            Some(q) => q.t().dot(&x),
            None => x.to_owned(),
        }
    }
}

impl FastScanner for GaussianScanner {
    fn null_lml(&self) -> f64 {
        self.null.lml_profiled()
    }

    fn null_beta(&self) -> Array1<f64> {
        self.null.beta.clone()
    }

    fn null_beta_covariance(&self) -> Array2<f64> {
        self.null.beta_covariance()
    }

    fn scan(&self, design: ArrayView2<f64>) -> Result<ScanOutcome, SolverError> {
        let rotated = self.rotate(design);
        let fit = self.gls.fit_with(rotated.view())?;
        ScanOutcome::from_fit(&fit, self.gls.ncovariates())
    }

    fn fast_scan(&self, g: ArrayView2<f64>) -> Result<FastScanOutcome, SolverError> {
        // One rotation for the whole sweep.
        let rotated = self.rotate(g);
        let c = self.gls.ncovariates();
        let outcomes = rotated
            .axis_iter(Axis(1))
            .into_par_iter()
            .map(|column| -> Result<ScanOutcome, SolverError> {
                let fit = self.gls.fit_with(column.insert_axis(Axis(1)))?;
                ScanOutcome::from_fit(&fit, c)
            })
            .collect::<Result<Vec<_>, SolverError>>()?;
        Ok(FastScanOutcome::from_outcomes(&outcomes, c))
    }
}

/// Multi-trait scanner over the rotated per-sample blocks of a fitted Kron2Sum.
///
/// Designs are given at sample level (`np` rows, row `t·n + i` for trait `t` of
/// sample `i`).
#[derive(Debug, Clone)]
pub struct KronScanner {
    rotation: Option<Array2<f64>>,
    nsamples: usize,
    ntraits: usize,
    gls: BlockDiagonalGls,
    ncovariates: usize,
    null: GlsFit,
}

impl KronScanner {
    pub(crate) fn new(
        rotation: Option<Array2<f64>>,
        ntraits: usize,
        y_blocks: Vec<Array1<f64>>,
        w_blocks: Vec<Array2<f64>>,
        v_blocks: &[Array2<f64>],
    ) -> Result<Self, SolverError> {
        let nsamples = y_blocks.len();
        let ncovariates = w_blocks.first().map(|w| w.ncols()).unwrap_or(0);
        let gls = BlockDiagonalGls::new(y_blocks, w_blocks, v_blocks)?;
        let null = gls.fit_null()?;
        Ok(Self {
            rotation,
            nsamples,
            ntraits,
            gls,
            ncovariates,
            null,
        })
    }

    /// Splits a sample-level design into rotated per-sample `p×k` blocks.
    fn blocks(&self, design: ArrayView2<f64>) -> Result<Vec<Array2<f64>>, SolverError> {
        let (n, p) = (self.nsamples, self.ntraits);
        if design.nrows() != n * p {
            return Err(SolverError::DimensionMismatch {
                context: "multi-trait design rows",
                expected: n * p,
                found: design.nrows(),
            });
        }
        let k = design.ncols();
        let mut blocks = vec![Array2::<f64>::zeros((p, k)); n];
        for t in 0..p {
            let trait_rows = design.slice(s![t * n..(t + 1) * n, ..]);
            let rotated = match &self.rotation {
                Some(q) => q.t().dot(&trait_rows),
                None => trait_rows.to_owned(),
            };
            for (i, block) in blocks.iter_mut().enumerate() {
                block.row_mut(t).assign(&rotated.row(i));
            }
        }
        Ok(blocks)
    }
}

impl FastScanner for KronScanner {
    fn null_lml(&self) -> f64 {
        self.null.lml_profiled()
    }

    fn null_beta(&self) -> Array1<f64> {
        self.null.beta.clone()
    }

    fn null_beta_covariance(&self) -> Array2<f64> {
        self.null.beta_covariance()
    }

    fn scan(&self, design: ArrayView2<f64>) -> Result<ScanOutcome, SolverError> {
        let blocks = self.blocks(design)?;
        let fit = self.gls.fit_with(&blocks)?;
        ScanOutcome::from_fit(&fit, self.ncovariates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::lrt::lrt;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn toy_scanner() -> GaussianScanner {
        let y = array![0.2, 1.4, -0.7, 2.1, 0.3, 1.0];
        let m = Array2::ones((6, 1));
        let d = array![1.0, 0.8, 1.3, 0.9, 1.1, 1.0];
        GaussianScanner::new(y, m, None, d).unwrap()
    }

    #[test]
    fn alternative_never_loses_likelihood() {
        let scanner = toy_scanner();
        let g = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [1.0, 2.0], [0.0, 0.0], [2.0, 1.0]];
        let sweep = scanner.fast_scan(g.view()).unwrap();
        assert!(!sweep.is_empty());
        assert_eq!(sweep.len(), 2);
        for j in 0..2 {
            assert!(sweep.lml[j] >= scanner.null_lml() - 1e-10);
            assert!(sweep.scale[j] > 0.0);
        }
    }

    #[test]
    fn fast_scan_agrees_with_column_scans() {
        let scanner = toy_scanner();
        let g = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [1.0, 2.0], [0.0, 0.0], [2.0, 1.0]];
        let sweep = scanner.fast_scan(g.view()).unwrap();
        for j in 0..2 {
            let single = scanner.scan(g.slice(s![.., j..j + 1])).unwrap();
            let from_sweep = sweep.outcome(j);
            assert_abs_diff_eq!(single.lml, from_sweep.lml, epsilon = 1e-12);
            assert_abs_diff_eq!(single.effsizes1[0], from_sweep.effsizes1[0], epsilon = 1e-12);
            assert_abs_diff_eq!(single.effsizes0_se[0], from_sweep.effsizes0_se[0], epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_column_keeps_the_null_likelihood_off_unit_scale() {
        // Covariance shape far from the ML scale, as for a GLMM surrogate.
        let y = array![0.2, 1.4, -0.7, 2.1, 0.3, 1.0];
        let m = Array2::ones((6, 1));
        let d = array![10.0, 8.0, 13.0, 9.0, 11.0, 10.0];
        let scanner = GaussianScanner::new(y, m, None, d).unwrap();

        let zero = Array2::<f64>::zeros((6, 1));
        let alt = scanner.scan(zero.view()).unwrap();
        assert!(alt.scale < 0.5);
        assert_abs_diff_eq!(alt.lml, scanner.null_lml(), epsilon = 1e-10);
        assert_abs_diff_eq!(lrt(scanner.null_lml(), alt.lml, 1), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(
            alt.effsizes0_se[0],
            diagonal_sqrt(&scanner.null_beta_covariance())[0],
            epsilon = 1e-10
        );
    }

    #[test]
    fn exact_fit_is_a_solver_failure() {
        let fit = GlsFit {
            beta: array![1.0, 2.0],
            gram_pinv: Array2::eye(2),
            quadratic: 0.0,
            logdet: 0.0,
            nobs: 4,
        };
        assert!(matches!(
            ScanOutcome::from_fit(&fit, 1),
            Err(SolverError::NonFiniteLml(_))
        ));
    }

    #[test]
    fn rotation_is_applied_to_designs() {
        // Rotating the whole problem by an orthonormal Q leaves the fit unchanged.
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let q = array![[c, c, 0.0], [c, -c, 0.0], [0.0, 0.0, 1.0]];
        let y = array![1.0, 3.0, 2.0];
        let m = array![[1.0], [1.0], [1.0]];
        let x = array![[0.0], [1.0], [3.0]];
        let d = array![1.0, 1.0, 1.0];

        let plain = GaussianScanner::new(y.clone(), m.clone(), None, d.clone()).unwrap();
        let rotated = GaussianScanner::new(q.t().dot(&y), q.t().dot(&m), Some(q), d).unwrap();
        let a = plain.scan(x.view()).unwrap();
        let b = rotated.scan(x.view()).unwrap();
        assert_abs_diff_eq!(a.lml, b.lml, epsilon = 1e-10);
        assert_abs_diff_eq!(a.effsizes1[0], b.effsizes1[0], epsilon = 1e-10);
    }
}
