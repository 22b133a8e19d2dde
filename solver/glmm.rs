//! Exponential-family GLMM and its Gaussian surrogate.
//!
//! The latent predictor is `f = Mβ + u + e` with `u ~ N(0, v0·K)` and
//! `e ~ N(0, v1·I)`; outcomes follow an exponential family given `f`.
//! [`GlmmExpFam`] runs penalised quasi-likelihood iterations: at the current
//! predictor each sample is replaced by a Gaussian site (working response and
//! working weight), the surrogate [`GlmmNormal`] is refitted, and the predictor
//! is moved to the surrogate's posterior mode. The converged sites define the
//! Gaussian model that is scanned.

use super::SolverError;
use super::gls::{DiagonalGls, GlsFit};
use super::linalg::EconomicQs;
use super::optimize::{Objective, OptimizerConfig, best_on_grid, minimize};
use super::scanner::GaussianScanner;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip, array};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::sync::Arc;

/// Probabilities are kept this far from 0 and 1.
const PROBABILITY_FLOOR: f64 = 1e-10;

/// Working weights below this are floored.
const WEIGHT_FLOOR: f64 = 1e-10;

/// Log-rate ceiling, keeps `exp` finite on Poisson outcomes.
const MAX_LOG_RATE: f64 = 30.0;

/// Settings for the penalised quasi-likelihood iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmmConfig {
    /// Convergence threshold on the largest change of the latent predictor.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for GlmmConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-5,
            max_iterations: 200,
        }
    }
}

/// Outcome family and link of a GLMM.
#[derive(Debug, Clone, PartialEq)]
pub enum Family {
    /// Binary outcomes, logit link.
    Bernoulli,
    /// Binary outcomes, probit link.
    Probit,
    /// Success counts out of per-sample `trials`, logit link.
    Binomial { trials: Array1<f64> },
    /// Counts, log link.
    Poisson,
}

impl Family {
    /// Starting latent predictor derived from the outcomes.
    fn initial_predictor(&self, y: &Array1<f64>) -> Array1<f64> {
        match self {
            Family::Bernoulli => y.mapv(|v| logit_clamped((v + 0.5) / 2.0)),
            Family::Probit => {
                let normal = Normal::standard();
                y.mapv(|v| normal.inverse_cdf(clamp_probability((v + 0.5) / 2.0)))
            }
            Family::Binomial { trials } => {
                Zip::from(y)
                    .and(trials)
                    .map_collect(|&v, &n| logit_clamped((v + 0.5) / (n + 1.0)))
            }
            Family::Poisson => y.mapv(|v| (v + 0.5).ln()),
        }
    }

    /// Working response and weight at the latent predictor `eta`.
    fn working(&self, y: &Array1<f64>, eta: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
        let n = y.len();
        let mut response = Array1::zeros(n);
        let mut weight = Array1::zeros(n);
        let normal = Normal::standard();
        for i in 0..n {
            let (z, w) = match self {
                Family::Bernoulli => binomial_site(y[i], 1.0, eta[i]),
                Family::Binomial { trials } => binomial_site(y[i], trials[i], eta[i]),
                Family::Probit => {
                    let mu = clamp_probability(normal.cdf(eta[i]));
                    let density = normal.pdf(eta[i]).max(PROBABILITY_FLOOR);
                    let w = density * density / (mu * (1.0 - mu));
                    (eta[i] + (y[i] - mu) / density, w)
                }
                Family::Poisson => {
                    let log_rate = eta[i].min(MAX_LOG_RATE);
                    let mu = log_rate.exp().max(PROBABILITY_FLOOR);
                    (log_rate + (y[i] - mu) / mu, mu)
                }
            };
            response[i] = z;
            weight[i] = w.max(WEIGHT_FLOOR);
        }
        (response, weight)
    }
}

fn clamp_probability(p: f64) -> f64 {
    p.clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR)
}

fn logit_clamped(p: f64) -> f64 {
    let p = clamp_probability(p);
    (p / (1.0 - p)).ln()
}

fn binomial_site(y: f64, trials: f64, eta: f64) -> (f64, f64) {
    let mu = clamp_probability(super::optimize::sigmoid(eta));
    let w = trials * mu * (1.0 - mu);
    (eta + (y - trials * mu) / w.max(WEIGHT_FLOOR), w)
}

/// Gaussian site parameters: natural location `eta = τ·ỹ` and precision `tau`.
#[derive(Debug, Clone)]
pub struct Site {
    pub eta: Array1<f64>,
    pub tau: Array1<f64>,
}

impl Site {
    fn from_working(response: &Array1<f64>, weight: &Array1<f64>) -> Self {
        Self {
            eta: response * weight,
            tau: weight.clone(),
        }
    }

    /// Working response `ỹ = eta / tau`.
    pub fn mean(&self) -> Array1<f64> {
        &self.eta / &self.tau
    }
}

/// The surrogate covariance `v0·K + v1·I + diag(1/τ)` evaluated at fixed variances.
struct SurrogateEvaluation {
    /// Eigenvectors of the covariance, absent when it is already diagonal.
    rotation: Option<Array2<f64>>,
    diagonal: Array1<f64>,
    y: Array1<f64>,
    m: Array2<f64>,
    fit: GlsFit,
}

/// Marginal likelihood of `ỹ ~ N(Mβ, v0·K + v1·I + diag(1/τ))`.
struct SurrogateLikelihood {
    y: Array1<f64>,
    m: Array2<f64>,
    site_variance: Array1<f64>,
    kinship: Option<Array2<f64>>,
}

impl SurrogateLikelihood {
    /// `x` is `[ln v0, ln v1]` with kinship, `[ln v1]` without.
    fn variances(&self, x: &Array1<f64>) -> (f64, f64) {
        match self.kinship {
            Some(_) => (x[0].exp(), x[1].exp()),
            None => (0.0, x[0].exp()),
        }
    }

    fn evaluate(&self, v0: f64, v1: f64) -> Result<SurrogateEvaluation, SolverError> {
        match &self.kinship {
            Some(k) => {
                let mut covariance = k * v0;
                for (i, s) in self.site_variance.iter().enumerate() {
                    covariance[(i, i)] += v1 + s;
                }
                let (values, vectors) = covariance.eigh(UPLO::Lower)?;
                let y = vectors.t().dot(&self.y);
                let m = vectors.t().dot(&self.m);
                let fit = DiagonalGls::new(y.view(), m.view(), values.view())?.fit_null()?;
                Ok(SurrogateEvaluation {
                    rotation: Some(vectors),
                    diagonal: values,
                    y,
                    m,
                    fit,
                })
            }
            None => {
                let diagonal = self.site_variance.mapv(|s| s + v1);
                let fit =
                    DiagonalGls::new(self.y.view(), self.m.view(), diagonal.view())?.fit_null()?;
                Ok(SurrogateEvaluation {
                    rotation: None,
                    diagonal,
                    y: self.y.clone(),
                    m: self.m.clone(),
                    fit,
                })
            }
        }
    }

    fn start_grid(&self) -> Vec<Array1<f64>> {
        let levels = [-3.0, -1.0, 1.0];
        match self.kinship {
            Some(_) => levels
                .iter()
                .flat_map(|&a| levels.iter().map(move |&b| array![a, b]))
                .collect(),
            None => levels.iter().map(|&b| array![b]).collect(),
        }
    }
}

impl Objective for SurrogateLikelihood {
    fn cost(&self, x: &Array1<f64>) -> Result<f64, SolverError> {
        let (v0, v1) = self.variances(x);
        let lml = self.evaluate(v0, v1)?.fit.lml_fixed();
        if !lml.is_finite() {
            return Err(SolverError::NonFiniteLml("Gaussian surrogate"));
        }
        Ok(-lml)
    }
}

/// GLMM with Gaussian site likelihoods, fitted over `(ln v0, ln v1)`.
pub struct GlmmNormal {
    likelihood: Arc<SurrogateLikelihood>,
    point: Array1<f64>,
    optimum: SurrogateEvaluation,
}

impl GlmmNormal {
    pub fn new(
        eta: ArrayView1<f64>,
        tau: ArrayView1<f64>,
        m: ArrayView2<f64>,
        qs: Option<&EconomicQs>,
    ) -> Result<Self, SolverError> {
        let n = eta.len();
        if tau.len() != n || m.nrows() != n {
            return Err(SolverError::DimensionMismatch {
                context: "Gaussian surrogate sites",
                expected: n,
                found: tau.len().min(m.nrows()),
            });
        }
        if tau.iter().any(|&t| !(t > 0.0) || !t.is_finite()) {
            return Err(SolverError::NonFiniteLml("Gaussian surrogate site precision"));
        }
        let likelihood = Arc::new(SurrogateLikelihood {
            y: &eta / &tau,
            m: m.to_owned(),
            site_variance: tau.mapv(|t| 1.0 / t),
            kinship: qs.map(EconomicQs::kinship),
        });
        let point = match likelihood.kinship {
            Some(_) => array![0.0, 0.0],
            None => array![0.0],
        };
        let (v0, v1) = likelihood.variances(&point);
        let optimum = likelihood.evaluate(v0, v1)?;
        Ok(Self {
            likelihood,
            point,
            optimum,
        })
    }

    pub fn fit(&mut self, config: &OptimizerConfig) -> Result<(), SolverError> {
        let start = best_on_grid(self.likelihood.as_ref(), self.likelihood.start_grid())
            .map(|(x, _)| x)
            .unwrap_or_else(|| self.point.clone());
        self.fit_from(start, config)
    }

    /// Refits starting from `start` in `(ln v0, ln v1)` coordinates.
    fn fit_from(&mut self, start: Array1<f64>, config: &OptimizerConfig) -> Result<(), SolverError> {
        let minimum = minimize(Arc::clone(&self.likelihood), start, config);
        let (v0, v1) = self.likelihood.variances(&minimum.point);
        let optimum = self.likelihood.evaluate(v0, v1)?;
        if !optimum.fit.lml_fixed().is_finite() {
            return Err(SolverError::NonFiniteLml("Gaussian surrogate"));
        }
        self.point = minimum.point;
        self.optimum = optimum;
        Ok(())
    }

    pub fn v0(&self) -> f64 {
        self.likelihood.variances(&self.point).0
    }

    pub fn v1(&self) -> f64 {
        self.likelihood.variances(&self.point).1
    }

    pub fn lml(&self) -> f64 {
        self.optimum.fit.lml_fixed()
    }

    pub fn beta(&self) -> &Array1<f64> {
        &self.optimum.fit.beta
    }

    /// Posterior mode of the latent predictor given the sites,
    /// `ỹ - diag(1/τ)·V⁻¹(ỹ - Mβ)`.
    pub fn latent_mode(&self) -> Array1<f64> {
        let evaluation = &self.optimum;
        let residual = &evaluation.y - &evaluation.m.dot(&evaluation.fit.beta);
        let weighted = &residual / &evaluation.diagonal;
        let back = match &evaluation.rotation {
            Some(u) => u.dot(&weighted),
            None => weighted,
        };
        &self.likelihood.y - &(&self.likelihood.site_variance * &back)
    }

    pub fn get_fast_scanner(&self) -> Result<GaussianScanner, SolverError> {
        let evaluation = &self.optimum;
        GaussianScanner::new(
            evaluation.y.clone(),
            evaluation.m.clone(),
            evaluation.rotation.clone(),
            evaluation.diagonal.clone(),
        )
    }
}

/// Exponential-family GLMM fitted by penalised quasi-likelihood.
pub struct GlmmExpFam {
    y: Array1<f64>,
    family: Family,
    m: Array2<f64>,
    qs: Option<EconomicQs>,
    eta: Array1<f64>,
    v0: f64,
    v1: f64,
    beta: Array1<f64>,
    lml: f64,
    iterations: usize,
}

impl GlmmExpFam {
    pub fn new(
        y: ArrayView1<f64>,
        family: Family,
        m: ArrayView2<f64>,
        qs: Option<&EconomicQs>,
    ) -> Result<Self, SolverError> {
        let n = y.len();
        if m.nrows() != n {
            return Err(SolverError::DimensionMismatch {
                context: "GLMM covariates rows",
                expected: n,
                found: m.nrows(),
            });
        }
        if let Family::Binomial { trials } = &family {
            if trials.len() != n {
                return Err(SolverError::DimensionMismatch {
                    context: "GLMM binomial trials",
                    expected: n,
                    found: trials.len(),
                });
            }
        }
        let y = y.to_owned();
        let eta = family.initial_predictor(&y);
        Ok(Self {
            y,
            family,
            m: m.to_owned(),
            qs: qs.cloned(),
            eta,
            v0: f64::NAN,
            v1: f64::NAN,
            beta: Array1::zeros(m.ncols()),
            lml: f64::NAN,
            iterations: 0,
        })
    }

    pub fn fit(&mut self, optimizer: &OptimizerConfig, config: &GlmmConfig) -> Result<(), SolverError> {
        let mut previous: Option<Array1<f64>> = None;
        let mut last_change = f64::INFINITY;

        for iteration in 1..=config.max_iterations {
            let (response, weight) = self.family.working(&self.y, &self.eta);
            let site = Site::from_working(&response, &weight);
            let mut surrogate =
                GlmmNormal::new(site.eta.view(), site.tau.view(), self.m.view(), self.qs.as_ref())?;
            match previous.take() {
                Some(start) => surrogate.fit_from(start, optimizer)?,
                None => surrogate.fit(optimizer)?,
            }

            let latent = surrogate.latent_mode();
            last_change = (&latent - &self.eta)
                .iter()
                .fold(0.0_f64, |acc, d| acc.max(d.abs()));
            if !last_change.is_finite() {
                return Err(SolverError::NonFiniteLml("penalised quasi-likelihood predictor"));
            }

            self.eta = latent;
            self.v0 = surrogate.v0();
            self.v1 = surrogate.v1();
            self.beta = surrogate.beta().clone();
            self.lml = surrogate.lml();
            self.iterations = iteration;
            previous = Some(surrogate.point.clone());

            log::debug!(
                "PQL iteration {iteration}: max |Δη| = {last_change:.3e}, v0 = {:.5}, v1 = {:.5}.",
                self.v0,
                self.v1
            );
            if last_change < config.tolerance {
                log::info!(
                    "GLMM converged after {iteration} iterations: v0 = {:.6}, v1 = {:.6}.",
                    self.v0,
                    self.v1
                );
                return Ok(());
            }
        }

        Err(SolverError::DidNotConverge {
            stage: "penalised quasi-likelihood",
            max_iterations: config.max_iterations,
            last_change,
        })
    }

    /// Gaussian sites at the current latent predictor.
    pub fn site(&self) -> Site {
        let (response, weight) = self.family.working(&self.y, &self.eta);
        Site::from_working(&response, &weight)
    }

    /// Genetic variance of the latent predictor; zero without kinship.
    pub fn v0(&self) -> f64 {
        self.v0
    }

    pub fn v1(&self) -> f64 {
        self.v1
    }

    pub fn beta(&self) -> &Array1<f64> {
        &self.beta
    }

    /// Marginal likelihood of the converged Gaussian surrogate.
    pub fn lml(&self) -> f64 {
        self.lml
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::linalg::economic_qs;
    use crate::solver::scanner::FastScanner;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Poisson};

    fn covariates(rng: &mut StdRng, n: usize) -> Array2<f64> {
        let mut m = Array2::ones((n, 2));
        for i in 0..n {
            m[(i, 1)] = rng.gen_range(-1.0..1.0);
        }
        m
    }

    #[test]
    fn working_response_is_exact_for_poisson_at_the_mean() {
        let y = array![3.0_f64.exp()];
        let eta = array![3.0];
        let (z, w) = Family::Poisson.working(&y, &eta);
        assert_abs_diff_eq!(z[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 3.0_f64.exp(), epsilon = 1e-9);
    }

    #[test]
    fn binomial_weights_scale_with_trials() {
        let y = array![2.0, 4.0];
        let eta = array![0.0, 0.0];
        let family = Family::Binomial {
            trials: array![4.0, 8.0],
        };
        let (z, w) = family.working(&y, &eta);
        assert_abs_diff_eq!(w[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn surrogate_without_kinship_matches_weighted_least_squares_variance() {
        let mut rng = StdRng::seed_from_u64(5);
        let n = 30;
        let m = covariates(&mut rng, n);
        let y = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
        let tau = Array1::from_elem(n, 4.0);
        let eta = &y * &tau;

        let mut model = GlmmNormal::new(eta.view(), tau.view(), m.view(), None).unwrap();
        model.fit(&OptimizerConfig::default()).unwrap();
        assert_eq!(model.v0(), 0.0);
        assert!(model.v1() > 0.0);

        // Residual variance exceeds the site variance, so the profiled scale sits near one.
        let scanner = model.get_fast_scanner().unwrap();
        assert!(scanner.null_lml() >= model.lml() - 1e-9);
        assert_abs_diff_eq!(scanner.null_lml(), model.lml(), epsilon = 1e-4);
    }

    #[test]
    fn poisson_glmm_converges_with_kinship() {
        let mut rng = StdRng::seed_from_u64(17);
        let n = 40;
        let m = covariates(&mut rng, n);
        let features = Array2::from_shape_fn((n, 60), |_| rng.gen_range(-1.0..1.0));
        let k = features.dot(&features.t()) / 60.0;
        let qs = economic_qs(k.view(), 1e-9).unwrap();
        let y = Array1::from_shape_fn(n, |i| {
            let rate = (0.5 + 0.3 * m[(i, 1)]).exp();
            Poisson::new(rate).unwrap().sample(&mut rng)
        });

        let mut glmm = GlmmExpFam::new(y.view(), Family::Poisson, m.view(), Some(&qs)).unwrap();
        glmm.fit(&OptimizerConfig::default(), &GlmmConfig::default()).unwrap();
        assert!(glmm.iterations() >= 1);
        assert!(glmm.v1() > 0.0);
        assert!(glmm.lml().is_finite());
        assert_eq!(glmm.beta().len(), 2);
        assert!(glmm.beta().iter().all(|b| b.is_finite()));

        let site = glmm.site();
        assert!(site.tau.iter().all(|&t| t > 0.0));
        assert_eq!(site.mean().len(), n);
    }
}
