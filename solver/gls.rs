//! Generalised least squares under a covariance that has already been rotated to a
//! diagonal form, `y ~ N(Xβ, s·diag(d))`.
//!
//! Every single-trait model in this crate reduces to this problem once the
//! samples are projected onto the eigenbasis of their covariance, so the mean
//! parameters are always profiled out in closed form.

use super::SolverError;
use super::linalg::pinvh;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{Cholesky, Inverse, UPLO};
use std::f64::consts::PI;

/// The outcome of one GLS solve.
#[derive(Debug, Clone)]
pub struct GlsFit {
    pub beta: Array1<f64>,
    /// Pseudo-inverse of `XᵀD⁻¹X`.
    pub gram_pinv: Array2<f64>,
    /// `rᵀD⁻¹r` at the GLS estimate.
    pub quadratic: f64,
    /// `Σ ln dᵢ`.
    pub logdet: f64,
    pub nobs: usize,
}

impl GlsFit {
    /// Maximum-likelihood scale `s` multiplying `diag(d)`.
    pub fn scale(&self) -> f64 {
        self.quadratic / self.nobs as f64
    }

    /// Log marginal likelihood with the covariance held at `diag(d)`.
    pub fn lml_fixed(&self) -> f64 {
        let n = self.nobs as f64;
        -0.5 * (n * (2.0 * PI).ln() + self.logdet + self.quadratic)
    }

    /// Log marginal likelihood with the scale `s` profiled out.
    pub fn lml_profiled(&self) -> f64 {
        let n = self.nobs as f64;
        -0.5 * n * ((2.0 * PI).ln() + 1.0 + self.scale().ln()) - 0.5 * self.logdet
    }

    /// Covariance of `beta` under the profiled scale.
    pub fn beta_covariance(&self) -> Array2<f64> {
        &self.gram_pinv * self.scale()
    }
}

/// Precomputed GLS problem for a fixed response, fixed covariates, and fixed
/// diagonal covariance; extra design columns can be appended per solve.
#[derive(Debug, Clone)]
pub struct DiagonalGls {
    y: Array1<f64>,
    m: Array2<f64>,
    weights: Array1<f64>,
    logdet: f64,
    gram_mm: Array2<f64>,
    rhs_m: Array1<f64>,
}

impl DiagonalGls {
    pub fn new(
        y: ArrayView1<f64>,
        m: ArrayView2<f64>,
        d: ArrayView1<f64>,
    ) -> Result<Self, SolverError> {
        let n = y.len();
        if m.nrows() != n {
            return Err(SolverError::DimensionMismatch {
                context: "GLS covariates rows",
                expected: n,
                found: m.nrows(),
            });
        }
        if d.len() != n {
            return Err(SolverError::DimensionMismatch {
                context: "GLS diagonal covariance length",
                expected: n,
                found: d.len(),
            });
        }
        if d.iter().any(|&v| !(v > 0.0) || !v.is_finite()) {
            return Err(SolverError::NonFiniteLml("generalised least squares covariance"));
        }

        let weights = d.mapv(|v| 1.0 / v);
        let logdet: f64 = d.iter().map(|v| v.ln()).sum();
        let mw = &m * &weights.view().insert_axis(Axis(1));
        let gram_mm = mw.t().dot(&m);
        let rhs_m = mw.t().dot(&y);

        Ok(Self {
            y: y.to_owned(),
            m: m.to_owned(),
            weights,
            logdet,
            gram_mm,
            rhs_m,
        })
    }

    pub fn nobs(&self) -> usize {
        self.y.len()
    }

    pub fn ncovariates(&self) -> usize {
        self.m.ncols()
    }

    /// Solves with the covariates alone.
    pub fn fit_null(&self) -> Result<GlsFit, SolverError> {
        let gram_pinv = pinvh(&self.gram_mm)?;
        let beta = gram_pinv.dot(&self.rhs_m);
        let residual = &self.y - &self.m.dot(&beta);
        Ok(self.finish(beta, gram_pinv, residual))
    }

    /// Solves with the covariates followed by the columns of `x`.
    pub fn fit_with(&self, x: ArrayView2<f64>) -> Result<GlsFit, SolverError> {
        let n = self.nobs();
        if x.nrows() != n {
            return Err(SolverError::DimensionMismatch {
                context: "GLS candidate design rows",
                expected: n,
                found: x.nrows(),
            });
        }
        let c = self.ncovariates();
        let k = x.ncols();

        let xw = &x * &self.weights.view().insert_axis(Axis(1));
        let mut gram = Array2::<f64>::zeros((c + k, c + k));
        gram.slice_mut(s![..c, ..c]).assign(&self.gram_mm);
        let cross = xw.t().dot(&self.m);
        gram.slice_mut(s![c.., ..c]).assign(&cross);
        gram.slice_mut(s![..c, c..]).assign(&cross.t());
        gram.slice_mut(s![c.., c..]).assign(&xw.t().dot(&x));

        let mut rhs = Array1::<f64>::zeros(c + k);
        rhs.slice_mut(s![..c]).assign(&self.rhs_m);
        rhs.slice_mut(s![c..]).assign(&xw.t().dot(&self.y));

        let gram_pinv = pinvh(&gram)?;
        let beta = gram_pinv.dot(&rhs);
        let fitted = self.m.dot(&beta.slice(s![..c])) + x.dot(&beta.slice(s![c..]));
        let residual = &self.y - &fitted;
        Ok(self.finish(beta, gram_pinv, residual))
    }

    fn finish(&self, beta: Array1<f64>, gram_pinv: Array2<f64>, residual: Array1<f64>) -> GlsFit {
        let quadratic: f64 = residual
            .iter()
            .zip(self.weights.iter())
            .map(|(r, w)| r * r * w)
            .sum();
        GlsFit {
            beta,
            gram_pinv,
            quadratic,
            logdet: self.logdet,
            nobs: self.nobs(),
        }
    }
}

/// GLS over independent observation blocks, `yᵢ ~ N(Wᵢβ, s·Vᵢ)`.
///
/// Used by the multi-trait model, where each rotated sample contributes one
/// block of `p` correlated trait values.
#[derive(Debug, Clone)]
pub struct BlockDiagonalGls {
    y: Vec<Array1<f64>>,
    w: Vec<Array2<f64>>,
    precision: Vec<Array2<f64>>,
    logdet: f64,
    gram_ww: Array2<f64>,
    rhs_w: Array1<f64>,
}

impl BlockDiagonalGls {
    pub fn new(
        y: Vec<Array1<f64>>,
        w: Vec<Array2<f64>>,
        v: &[Array2<f64>],
    ) -> Result<Self, SolverError> {
        if w.len() != y.len() || v.len() != y.len() {
            return Err(SolverError::DimensionMismatch {
                context: "GLS block count",
                expected: y.len(),
                found: w.len().min(v.len()),
            });
        }
        let q = w.first().map(|b| b.ncols()).unwrap_or(0);
        let mut logdet: f64 = 0.0;
        let mut precision = Vec::with_capacity(v.len());
        let mut gram_ww = Array2::<f64>::zeros((q, q));
        let mut rhs_w = Array1::<f64>::zeros(q);

        for ((yi, wi), vi) in y.iter().zip(w.iter()).zip(v.iter()) {
            let factor = vi.cholesky(UPLO::Lower)?;
            logdet += factor.diag().iter().map(|l| 2.0 * l.ln()).sum::<f64>();
            let pi = vi.inv()?;
            let pw = pi.dot(wi);
            gram_ww += &wi.t().dot(&pw);
            rhs_w += &pw.t().dot(yi);
            precision.push(pi);
        }
        if !logdet.is_finite() {
            return Err(SolverError::NonFiniteLml("block generalised least squares covariance"));
        }

        Ok(Self {
            y,
            w,
            precision,
            logdet,
            gram_ww,
            rhs_w,
        })
    }

    /// Total number of scalar observations.
    pub fn nobs(&self) -> usize {
        self.y.iter().map(|b| b.len()).sum()
    }

    pub fn nblocks(&self) -> usize {
        self.y.len()
    }

    pub fn fit_null(&self) -> Result<GlsFit, SolverError> {
        let gram_pinv = pinvh(&self.gram_ww)?;
        let beta = gram_pinv.dot(&self.rhs_w);
        let quadratic = self.quadratic(|i| self.w[i].dot(&beta));
        Ok(GlsFit {
            beta,
            gram_pinv,
            quadratic,
            logdet: self.logdet,
            nobs: self.nobs(),
        })
    }

    /// Solves with the block designs extended by `x[i]` (one matrix per block).
    pub fn fit_with(&self, x: &[Array2<f64>]) -> Result<GlsFit, SolverError> {
        if x.len() != self.nblocks() {
            return Err(SolverError::DimensionMismatch {
                context: "GLS candidate design blocks",
                expected: self.nblocks(),
                found: x.len(),
            });
        }
        let q = self.gram_ww.nrows();
        let k = x.first().map(|b| b.ncols()).unwrap_or(0);

        let mut cross = Array2::<f64>::zeros((k, q));
        let mut gram_xx = Array2::<f64>::zeros((k, k));
        let mut rhs_x = Array1::<f64>::zeros(k);
        for (i, xi) in x.iter().enumerate() {
            let px = self.precision[i].dot(xi);
            cross += &px.t().dot(&self.w[i]);
            gram_xx += &xi.t().dot(&px);
            rhs_x += &px.t().dot(&self.y[i]);
        }

        let mut gram = Array2::<f64>::zeros((q + k, q + k));
        gram.slice_mut(s![..q, ..q]).assign(&self.gram_ww);
        gram.slice_mut(s![q.., ..q]).assign(&cross);
        gram.slice_mut(s![..q, q..]).assign(&cross.t());
        gram.slice_mut(s![q.., q..]).assign(&gram_xx);
        let mut rhs = Array1::<f64>::zeros(q + k);
        rhs.slice_mut(s![..q]).assign(&self.rhs_w);
        rhs.slice_mut(s![q..]).assign(&rhs_x);

        let gram_pinv = pinvh(&gram)?;
        let beta = gram_pinv.dot(&rhs);
        let beta_w = beta.slice(s![..q]).to_owned();
        let beta_x = beta.slice(s![q..]).to_owned();
        let quadratic = self.quadratic(|i| self.w[i].dot(&beta_w) + x[i].dot(&beta_x));
        Ok(GlsFit {
            beta,
            gram_pinv,
            quadratic,
            logdet: self.logdet,
            nobs: self.nobs(),
        })
    }

    fn quadratic<F>(&self, fitted: F) -> f64
    where
        F: Fn(usize) -> Array1<f64>,
    {
        (0..self.nblocks())
            .map(|i| {
                let r = &self.y[i] - &fitted(i);
                r.dot(&self.precision[i].dot(&r))
            })
            .sum()
    }
}
