use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson, StandardNormal};

/// Simulated inputs of a scan, drawn from one seeded generator.
pub struct Simulation {
    pub rng: StdRng,
    pub nsamples: usize,
}

impl Simulation {
    pub fn new(seed: u64, nsamples: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            nsamples,
        }
    }

    pub fn normal(&mut self, rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| self.rng.sample(StandardNormal))
    }

    /// Offset column followed by `ncovariates - 1` standard normal columns.
    pub fn covariates(&mut self, ncovariates: usize) -> Array2<f64> {
        let n = self.nsamples;
        let mut m = self.normal(n, ncovariates);
        m.column_mut(0).fill(1.0);
        m
    }

    /// Allele dosages in {0, 1, 2}.
    pub fn genotype(&mut self, ncandidates: usize) -> Array2<f64> {
        let n = self.nsamples;
        Array2::from_shape_fn((n, ncandidates), |_| self.rng.gen_range(0..3) as f64)
    }

    /// Kinship `XXᵀ / f` from `nfeatures` standardised random features, and the
    /// features themselves.
    pub fn kinship(&mut self, nfeatures: usize) -> (Array2<f64>, Array2<f64>) {
        let mut x = self.normal(self.nsamples, nfeatures);
        for mut column in x.columns_mut() {
            let mean = column.mean().unwrap_or(0.0);
            let std = column.std(1.0);
            column.mapv_inplace(|v| (v - mean) / std);
        }
        let k = x.dot(&x.t()) / nfeatures as f64;
        (k, x)
    }

    /// `Mβ` plus a polygenic term from `features` plus unit noise.
    pub fn outcome(&mut self, m: &Array2<f64>, beta: &Array1<f64>, features: &Array2<f64>) -> Array1<f64> {
        let weights: Array1<f64> = Array1::from_shape_fn(features.ncols(), |_| {
            0.7 * self.rng.sample::<f64, _>(StandardNormal)
        });
        let polygenic = features.dot(&weights) / (features.ncols() as f64).sqrt();
        let noise: Array1<f64> =
            Array1::from_shape_fn(self.nsamples, |_| self.rng.sample(StandardNormal));
        m.dot(beta) + polygenic + noise
    }

    /// Poisson counts with log rate `eta`.
    pub fn counts(&mut self, eta: &Array1<f64>) -> Array1<f64> {
        eta.mapv(|e| {
            Poisson::new(e.exp())
                .map(|p| p.sample(&mut self.rng))
                .unwrap_or(0.0)
        })
    }

    /// Binary outcomes with success probability `1 / (1 + exp(-eta))`.
    pub fn binary(&mut self, eta: &Array1<f64>) -> Array1<f64> {
        eta.mapv(|e| {
            let p = 1.0 / (1.0 + (-e).exp());
            if self.rng.gen_bool(p) { 1.0 } else { 0.0 }
        })
    }
}

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}
