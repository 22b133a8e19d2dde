//! Null-model construction for the single- and multi-trait paths.

use crate::config::ScanConfig;
use crate::error::QtlError;
use crate::likelihood::Likelihood;
use crate::solver::{EconomicQs, FastScanner, GlmmExpFam, GlmmNormal, Kron2Sum, Lmm};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Fitted variance parameters of the null model.
#[derive(Debug, Clone, PartialEq)]
pub enum NullVariances {
    /// Genetic and residual variances. `v0` is NaN when no kinship was given.
    Single { v0: f64, v1: f64 },
    /// Genetic and residual trait covariances.
    Multi { c0: Array2<f64>, c1: Array2<f64> },
}

/// A fitted null model, reduced to the scanner it exposes.
pub struct NullModel {
    pub scanner: Box<dyn FastScanner>,
    pub variances: NullVariances,
}

pub fn build_single_trait(
    y: ArrayView1<f64>,
    m: ArrayView2<f64>,
    qs: Option<&EconomicQs>,
    likelihood: &Likelihood,
    config: &ScanConfig,
) -> Result<NullModel, QtlError> {
    let Some(family) = likelihood.family() else {
        log::info!("Fitting the single-trait linear mixed model.");
        let mut lmm = Lmm::new(y, m, qs)?;
        lmm.fit(&config.optimizer)?;
        let v0 = if qs.is_some() { lmm.v0() } else { f64::NAN };
        return Ok(NullModel {
            scanner: Box::new(lmm.get_fast_scanner()?),
            variances: NullVariances::Single { v0, v1: lmm.v1() },
        });
    };

    log::info!("Fitting the single-trait {} GLMM.", likelihood.name());
    let mut glmm = GlmmExpFam::new(y, family, m, qs)?;
    glmm.fit(&config.optimizer, &config.glmm)?;
    let v0 = if qs.is_some() { glmm.v0() } else { f64::NAN };
    let v1 = glmm.v1();

    let site = glmm.site();
    let mut normal = GlmmNormal::new(site.eta.view(), site.tau.view(), m, qs)?;
    normal.fit(&config.optimizer)?;
    log::debug!(
        "Gaussian surrogate refitted: v0 = {:.6}, v1 = {:.6}.",
        normal.v0(),
        normal.v1()
    );

    Ok(NullModel {
        scanner: Box::new(normal.get_fast_scanner()?),
        variances: NullVariances::Single { v0, v1 },
    })
}

pub fn build_multi_trait(
    y: ArrayView2<f64>,
    a: ArrayView2<f64>,
    m: ArrayView2<f64>,
    qs: Option<&EconomicQs>,
    likelihood: &Likelihood,
    config: &ScanConfig,
) -> Result<NullModel, QtlError> {
    if !likelihood.is_normal() {
        return Err(QtlError::UnsupportedCombination(
            "non-normal likelihood inference has not been implemented for multiple traits"
                .to_string(),
        ));
    }

    let g = match qs {
        Some(qs) => qs.sqrt_factor(),
        None => Array2::zeros((y.nrows(), 1)),
    };

    log::info!("Fitting the multi-trait Kron2Sum model over {} traits.", y.ncols());
    let mut lmm = Kron2Sum::new(y, a, m, g.view())?;
    lmm.fit(&config.optimizer)?;

    Ok(NullModel {
        scanner: Box::new(lmm.get_fast_scanner()?),
        variances: NullVariances::Multi {
            c0: lmm.c0().clone(),
            c1: lmm.c1().clone(),
        },
    })
}
