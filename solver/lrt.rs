use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Likelihood-ratio statistic `2·(lml_alt - lml_null)`, clamped at zero.
pub fn lrt_statistic(null_lml: f64, alt_lml: f64) -> f64 {
    let stat = 2.0 * (alt_lml - null_lml);
    if stat.is_nan() { stat } else { stat.max(0.0) }
}

/// P-value of the likelihood-ratio test of nested models differing by `dof` parameters.
///
/// No extra parameters means the models coincide and the p-value is 1.
pub fn lrt(null_lml: f64, alt_lml: f64, dof: usize) -> f64 {
    if dof == 0 {
        return 1.0;
    }
    let stat = lrt_statistic(null_lml, alt_lml);
    if !stat.is_finite() {
        return f64::NAN;
    }
    match ChiSquared::new(dof as f64) {
        Ok(chi2) => chi2.sf(stat),
        Err(_) => f64::NAN,
    }
}
