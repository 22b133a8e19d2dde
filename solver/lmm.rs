//! Single-trait linear mixed model
//!
//! `y ~ N(Mβ, v0·K + v1·I)`, fitted by maximum likelihood. The covariance is
//! reparameterised as `s·((1 - δ)K + δI)`; in the eigenbasis of `K` it is
//! diagonal, so `β` and `s` are profiled out in closed form and only `δ` is
//! searched (grid on `logit δ`, then BFGS).

use super::SolverError;
use super::gls::{DiagonalGls, GlsFit};
use super::linalg::EconomicQs;
use super::optimize::{Objective, OptimizerConfig, best_on_grid, logit, minimize, sigmoid};
use super::scanner::GaussianScanner;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, array};
use std::sync::Arc;

/// Profiled likelihood in `δ`, on the rotated problem.
struct ProfiledDelta {
    y: Array1<f64>,
    m: Array2<f64>,
    eigenvalues: Array1<f64>,
}

impl ProfiledDelta {
    fn diagonal(&self, delta: f64) -> Array1<f64> {
        self.eigenvalues.mapv(|s| (1.0 - delta) * s + delta)
    }

    fn fit(&self, delta: f64) -> Result<GlsFit, SolverError> {
        let d = self.diagonal(delta);
        DiagonalGls::new(self.y.view(), self.m.view(), d.view())?.fit_null()
    }
}

impl Objective for ProfiledDelta {
    fn cost(&self, x: &Array1<f64>) -> Result<f64, SolverError> {
        let lml = self.fit(sigmoid(x[0]))?.lml_profiled();
        if !lml.is_finite() {
            return Err(SolverError::NonFiniteLml("linear mixed model"));
        }
        Ok(-lml)
    }
}

#[derive(Debug, Clone)]
pub struct Lmm {
    y: Array1<f64>,
    m: Array2<f64>,
    /// `[Q0 Q1]` and the matching eigenvalues, present iff a kinship was given.
    rotation: Option<(Array2<f64>, Array1<f64>)>,
    delta: f64,
    fit: GlsFit,
}

impl Lmm {
    pub fn new(
        y: ArrayView1<f64>,
        m: ArrayView2<f64>,
        qs: Option<&EconomicQs>,
    ) -> Result<Self, SolverError> {
        let (yt, mt, rotation, delta) = match qs {
            Some(qs) => {
                if qs.nsamples() != y.len() {
                    return Err(SolverError::DimensionMismatch {
                        context: "kinship eigendecomposition samples",
                        expected: y.len(),
                        found: qs.nsamples(),
                    });
                }
                let q = qs.rotation();
                let yt = q.t().dot(&y);
                let mt = q.t().dot(&m);
                (yt, mt, Some((q, qs.eigenvalues())), 0.5)
            }
            None => (y.to_owned(), m.to_owned(), None, 1.0),
        };
        let eigenvalues = rotation
            .as_ref()
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| Array1::zeros(yt.len()));
        let fit = ProfiledDelta {
            y: yt.clone(),
            m: mt.clone(),
            eigenvalues,
        }
        .fit(delta)?;

        Ok(Self {
            y: yt,
            m: mt,
            rotation,
            delta,
            fit,
        })
    }

    /// Maximises the marginal likelihood over `δ`. Without kinship the model is
    /// ordinary least squares and this is a no-op.
    pub fn fit(&mut self, config: &OptimizerConfig) -> Result<(), SolverError> {
        let Some((_, eigenvalues)) = &self.rotation else {
            log::info!("No kinship supplied; the null model reduces to least squares.");
            return Ok(());
        };

        let objective = Arc::new(ProfiledDelta {
            y: self.y.clone(),
            m: self.m.clone(),
            eigenvalues: eigenvalues.clone(),
        });

        let points = config.grid_points.max(2);
        let grid = (0..points).map(|i| {
            let t = i as f64 / (points - 1) as f64;
            array![-10.0 + 20.0 * t]
        });
        let start = best_on_grid(objective.as_ref(), grid)
            .map(|(x, _)| x)
            .unwrap_or_else(|| array![logit(0.5)]);
        log::debug!("LMM grid search picked logit(delta) = {:.4}.", start[0]);

        let minimum = minimize(Arc::clone(&objective), start, config);
        let delta = sigmoid(minimum.point[0]);
        let fit = objective.fit(delta)?;
        if !fit.lml_profiled().is_finite() {
            return Err(SolverError::NonFiniteLml("linear mixed model"));
        }
        self.delta = delta;
        self.fit = fit;

        log::info!(
            "LMM fitted: v0 = {:.6}, v1 = {:.6}, lml = {:.6}.",
            self.v0(),
            self.v1(),
            self.lml()
        );
        Ok(())
    }

    pub fn scale(&self) -> f64 {
        self.fit.scale()
    }

    /// Genetic variance; zero without kinship.
    pub fn v0(&self) -> f64 {
        self.scale() * (1.0 - self.delta)
    }

    /// Environmental (residual) variance.
    pub fn v1(&self) -> f64 {
        self.scale() * self.delta
    }

    pub fn lml(&self) -> f64 {
        self.fit.lml_profiled()
    }

    pub fn beta(&self) -> &Array1<f64> {
        &self.fit.beta
    }

    /// Scanner whose alternatives share the fitted covariance `v0·K + v1·I` up to a scale.
    pub fn get_fast_scanner(&self) -> Result<GaussianScanner, SolverError> {
        let (v0, v1) = (self.v0(), self.v1());
        match &self.rotation {
            Some((q, eigenvalues)) => {
                let d = eigenvalues.mapv(|s| v0 * s + v1);
                GaussianScanner::new(self.y.clone(), self.m.clone(), Some(q.clone()), d)
            }
            None => {
                let d = Array1::from_elem(self.y.len(), v1);
                GaussianScanner::new(self.y.clone(), self.m.clone(), None, d)
            }
        }
    }
}
