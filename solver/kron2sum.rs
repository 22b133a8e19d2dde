//! Multi-trait linear mixed model with Kronecker-sum covariance
//!
//! For an n×p phenotype `Y`, `vec(Y) ~ N((A ⊗ M)·vec(B), C0 ⊗ GGᵀ + C1 ⊗ I)`,
//! where `vec` stacks trait columns. `C0 = l·lᵀ` has rank one and `C1 = L·Lᵀ`
//! is a full Cholesky factorisation with log-diagonal. In the eigenbasis of
//! `GGᵀ` the samples decouple into p-dimensional blocks with covariance
//! `λᵢ·C0 + C1`, so `B` is profiled out by block GLS and only the trait
//! covariances are searched.

use super::SolverError;
use super::gls::{BlockDiagonalGls, GlsFit};
use super::linalg::{economic_qs, pinvh};
use super::optimize::{Objective, OptimizerConfig, minimize};
use super::scanner::KronScanner;
use ndarray::{Array1, Array2, ArrayView2, s};
use ndarray_linalg::{Cholesky, UPLO};
use std::sync::Arc;

/// Ridge added to the trait covariance used for initialisation.
const INITIAL_RIDGE: f64 = 1e-4;

/// Rotated data shared by every likelihood evaluation.
struct KronData {
    /// `QᵀY`, n×p.
    y: Array2<f64>,
    /// `QᵀM`, n×c.
    m: Array2<f64>,
    a: Array2<f64>,
    eigenvalues: Array1<f64>,
    has_kinship: bool,
}

impl KronData {
    fn ntraits(&self) -> usize {
        self.y.ncols()
    }

    fn nparams(&self) -> usize {
        let p = self.ntraits();
        let lower = p * (p + 1) / 2;
        if self.has_kinship { p + lower } else { lower }
    }

    /// Unpacks `θ` into `(C0, C1)`.
    fn covariances(&self, theta: &Array1<f64>) -> (Array2<f64>, Array2<f64>) {
        let p = self.ntraits();
        let mut offset = 0;
        let c0 = if self.has_kinship {
            let l = theta.slice(s![..p]).to_owned();
            offset = p;
            outer(&l)
        } else {
            Array2::zeros((p, p))
        };
        let mut factor = Array2::<f64>::zeros((p, p));
        for r in 0..p {
            for c in 0..=r {
                let value = theta[offset];
                factor[(r, c)] = if r == c { value.exp() } else { value };
                offset += 1;
            }
        }
        let c1 = factor.dot(&factor.t());
        (c0, c1)
    }

    /// Packs `(l, L)` into `θ`.
    fn pack(&self, l: &Array1<f64>, factor: &Array2<f64>) -> Array1<f64> {
        let p = self.ntraits();
        let mut theta = Vec::with_capacity(self.nparams());
        if self.has_kinship {
            theta.extend(l.iter().copied());
        }
        for r in 0..p {
            for c in 0..=r {
                let value = factor[(r, c)];
                theta.push(if r == c { value.max(f64::MIN_POSITIVE).ln() } else { value });
            }
        }
        Array1::from(theta)
    }

    /// Per-sample covariate design `A ⊗ m̃ᵢᵀ`, p × (c·q) with column `s·c + j`.
    fn design_block(&self, i: usize) -> Array2<f64> {
        let (p, q) = self.a.dim();
        let c = self.m.ncols();
        let mut block = Array2::<f64>::zeros((p, c * q));
        for t in 0..p {
            for a_col in 0..q {
                let weight = self.a[(t, a_col)];
                for j in 0..c {
                    block[(t, a_col * c + j)] = weight * self.m[(i, j)];
                }
            }
        }
        block
    }

    fn y_blocks(&self) -> Vec<Array1<f64>> {
        self.y.rows().into_iter().map(|r| r.to_owned()).collect()
    }

    fn w_blocks(&self) -> Vec<Array2<f64>> {
        (0..self.y.nrows()).map(|i| self.design_block(i)).collect()
    }

    fn v_blocks(&self, c0: &Array2<f64>, c1: &Array2<f64>) -> Vec<Array2<f64>> {
        self.eigenvalues
            .iter()
            .map(|&lambda| c0 * lambda + c1)
            .collect()
    }

    fn gls(&self, c0: &Array2<f64>, c1: &Array2<f64>) -> Result<BlockDiagonalGls, SolverError> {
        BlockDiagonalGls::new(self.y_blocks(), self.w_blocks(), &self.v_blocks(c0, c1))
    }
}

impl Objective for KronData {
    fn cost(&self, x: &Array1<f64>) -> Result<f64, SolverError> {
        let (c0, c1) = self.covariances(x);
        let lml = self.gls(&c0, &c1)?.fit_null()?.lml_fixed();
        if !lml.is_finite() {
            return Err(SolverError::NonFiniteLml("multi-trait linear mixed model"));
        }
        Ok(-lml)
    }
}

fn outer(v: &Array1<f64>) -> Array2<f64> {
    let column = v.view().insert_axis(ndarray::Axis(1));
    column.dot(&column.t())
}

/// Rank-one `C0` Kron2Sum model, fitted by maximum likelihood.
pub struct Kron2Sum {
    data: Arc<KronData>,
    rotation: Option<Array2<f64>>,
    c0: Array2<f64>,
    c1: Array2<f64>,
    fit: GlsFit,
}

impl Kron2Sum {
    /// `y` is n×p, `a` is p×q, `m` is n×c and `g` is n×r with `K = GGᵀ`.
    /// An all-zero `g` drops the genetic term (`C0 = 0`).
    pub fn new(
        y: ArrayView2<f64>,
        a: ArrayView2<f64>,
        m: ArrayView2<f64>,
        g: ArrayView2<f64>,
    ) -> Result<Self, SolverError> {
        let (n, p) = y.dim();
        if a.nrows() != p {
            return Err(SolverError::DimensionMismatch {
                context: "trait design rows",
                expected: p,
                found: a.nrows(),
            });
        }
        if m.nrows() != n || g.nrows() != n {
            return Err(SolverError::DimensionMismatch {
                context: "multi-trait sample rows",
                expected: n,
                found: m.nrows().min(g.nrows()),
            });
        }

        let has_kinship = g.iter().any(|&v| v != 0.0);
        let (rotation, eigenvalues) = if has_kinship {
            let qs = economic_qs(g.dot(&g.t()).view(), 1e-9)?;
            (Some(qs.rotation()), qs.eigenvalues())
        } else {
            (None, Array1::zeros(n))
        };
        let (yt, mt) = match &rotation {
            Some(q) => (q.t().dot(&y), q.t().dot(&m)),
            None => (y.to_owned(), m.to_owned()),
        };

        let data = Arc::new(KronData {
            y: yt,
            m: mt,
            a: a.to_owned(),
            eigenvalues,
            has_kinship,
        });

        let trait_covariance = residual_covariance(y, m)?;
        let half = &trait_covariance * 0.5;
        let factor = half.cholesky(UPLO::Lower)?;
        let c1 = factor.dot(&factor.t());
        let c0 = if has_kinship {
            outer(&half.diag().mapv(f64::sqrt))
        } else {
            Array2::zeros((p, p))
        };
        let fit = data.gls(&c0, &c1)?.fit_null()?;

        Ok(Self {
            data,
            rotation,
            c0,
            c1,
            fit,
        })
    }

    pub fn fit(&mut self, config: &OptimizerConfig) -> Result<(), SolverError> {
        let l = self.c0.diag().mapv(|v| v.max(0.0).sqrt());
        let factor = self.c1.cholesky(UPLO::Lower)?;
        let start = self.data.pack(&l, &factor);
        log::debug!("Kron2Sum optimisation over {} parameters.", start.len());

        let minimum = minimize(Arc::clone(&self.data), start, config);
        let (c0, c1) = self.data.covariances(&minimum.point);
        let fit = self.data.gls(&c0, &c1)?.fit_null()?;
        if !fit.lml_fixed().is_finite() {
            return Err(SolverError::NonFiniteLml("multi-trait linear mixed model"));
        }
        self.c0 = c0;
        self.c1 = c1;
        self.fit = fit;

        log::info!(
            "Kron2Sum fitted: lml = {:.6}, C0 diag = {:?}, C1 diag = {:?}.",
            self.lml(),
            self.c0.diag().to_vec(),
            self.c1.diag().to_vec()
        );
        Ok(())
    }

    /// Genetic trait covariance.
    pub fn c0(&self) -> &Array2<f64> {
        &self.c0
    }

    /// Residual trait covariance.
    pub fn c1(&self) -> &Array2<f64> {
        &self.c1
    }

    pub fn lml(&self) -> f64 {
        self.fit.lml_fixed()
    }

    /// `vec(B)`, index `s·c + j` for covariate `j` and trait-design column `s`.
    pub fn beta(&self) -> &Array1<f64> {
        &self.fit.beta
    }

    /// Fixed effects as a c×q matrix.
    pub fn b(&self) -> Array2<f64> {
        let c = self.data.m.ncols();
        let q = self.data.a.ncols();
        Array2::from_shape_fn((c, q), |(j, col)| self.fit.beta[col * c + j])
    }

    pub fn ntraits(&self) -> usize {
        self.data.ntraits()
    }

    pub fn get_fast_scanner(&self) -> Result<KronScanner, SolverError> {
        KronScanner::new(
            self.rotation.clone(),
            self.ntraits(),
            self.data.y_blocks(),
            self.data.w_blocks(),
            &self.data.v_blocks(&self.c0, &self.c1),
        )
    }
}

/// Covariance of the least-squares residuals of `y` on `m`, with a small ridge.
fn residual_covariance(y: ArrayView2<f64>, m: ArrayView2<f64>) -> Result<Array2<f64>, SolverError> {
    let n = y.nrows().max(1) as f64;
    let coefficients = pinvh(&m.t().dot(&m))?.dot(&m.t().dot(&y));
    let residual = &y - &m.dot(&coefficients);
    let mut covariance = residual.t().dot(&residual) / n;
    for t in 0..covariance.nrows() {
        covariance[(t, t)] += INITIAL_RIDGE;
    }
    Ok(covariance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::scanner::FastScanner;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn problem(seed: u64, n: usize, p: usize) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let g = Array2::from_shape_fn((n, 20), |_| rng.gen_range(-1.0..1.0) / 20.0_f64.sqrt());
        let y = Array2::from_shape_fn((n, p), |(_, t)| t as f64 + rng.gen_range(-1.0..1.0));
        let m = Array2::ones((n, 1));
        (y, m, g)
    }

    #[test]
    fn parameters_round_trip_through_packing() {
        let (y, m, g) = problem(2, 12, 2);
        let a = Array2::eye(2);
        let model = Kron2Sum::new(y.view(), a.view(), m.view(), g.view()).unwrap();
        let theta = Array1::from(vec![0.4, -0.2, 0.1, 0.3, -0.5]);
        let (c0, c1) = model.data.covariances(&theta);
        let factor = c1.cholesky(UPLO::Lower).unwrap();
        let l = array_from(&[0.4, -0.2]);
        let repacked = model.data.pack(&l, &factor);
        for (a, b) in repacked.iter().zip(theta.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
        assert_abs_diff_eq!(c0[(0, 1)], -0.08, epsilon = 1e-12);
    }

    fn array_from(values: &[f64]) -> Array1<f64> {
        Array1::from(values.to_vec())
    }

    #[test]
    fn fit_improves_likelihood_and_scanner_reproduces_null() {
        let (y, m, g) = problem(9, 30, 2);
        let a = Array2::eye(2);
        let mut model = Kron2Sum::new(y.view(), a.view(), m.view(), g.view()).unwrap();
        let before = model.lml();
        model.fit(&OptimizerConfig::default()).unwrap();
        assert!(model.lml() >= before - 1e-8);
        assert_eq!(model.b().dim(), (1, 2));
        // Trait means are 0 and 1.
        assert!(model.b()[(0, 1)] > model.b()[(0, 0)]);

        let scanner = model.get_fast_scanner().unwrap();
        assert_abs_diff_eq!(scanner.null_lml(), model.lml(), epsilon = 1e-6);
    }

    #[test]
    fn zero_kinship_fits_residual_covariance_only() {
        let (y, m, _) = problem(4, 25, 2);
        let g = Array2::zeros((25, 1));
        let a = Array2::eye(2);
        let mut model = Kron2Sum::new(y.view(), a.view(), m.view(), g.view()).unwrap();
        model.fit(&OptimizerConfig::default()).unwrap();
        assert!(model.c0().iter().all(|&v| v == 0.0));
        assert!(model.c1()[(0, 0)] > 0.0 && model.c1()[(1, 1)] > 0.0);
    }
}
