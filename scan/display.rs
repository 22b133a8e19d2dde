//! Text rendering of a [`ScanResult`].

use crate::builder::NullVariances;
use crate::result::{ScanResult, VariantResult};
use crate::solver::lrt;
use itertools::Itertools;
use ndarray::Array2;
use std::fmt;

/// Summary statistics of one column of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (`n - 1` denominator).
    pub std: f64,
    pub min: f64,
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
    pub max: f64,
}

impl Summary {
    /// Non-finite values are skipped. An empty column yields NaN everywhere.
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let sorted: Vec<f64> = values
            .into_iter()
            .filter(|v| v.is_finite())
            .sorted_by(f64::total_cmp)
            .collect();
        let count = sorted.len();
        if count == 0 {
            return Self {
                count,
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                q25: f64::NAN,
                q50: f64::NAN,
                q75: f64::NAN,
                max: f64::NAN,
            };
        }
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Self {
            count,
            mean,
            std,
            min: sorted[0],
            q25: quantile(&sorted, 0.25),
            q50: quantile(&sorted, 0.5),
            q75: quantile(&sorted, 0.75),
            max: sorted[count - 1],
        }
    }
}

/// Linear interpolation between the closest ranks of a sorted, non-empty slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn write_summary_table(f: &mut fmt::Formatter<'_>, rows: &[(String, Summary)]) -> fmt::Result {
    let width = rows
        .iter()
        .map(|(name, _)| name.chars().count())
        .max()
        .unwrap_or(0)
        .max(4);
    writeln!(
        f,
        "{:<width$} {:>6} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "", "count", "mean", "std", "min", "25%", "50%", "75%", "max"
    )?;
    for (name, s) in rows {
        writeln!(
            f,
            "{:<width$} {:>6} {:>12.5e} {:>12.5e} {:>12.5e} {:>12.5e} {:>12.5e} {:>12.5e} {:>12.5e}",
            name, s.count, s.mean, s.std, s.min, s.q25, s.q50, s.q75, s.max
        )?;
    }
    Ok(())
}

fn write_matrix(f: &mut fmt::Formatter<'_>, name: &str, matrix: &Array2<f64>) -> fmt::Result {
    writeln!(f, "{name} =")?;
    for row in matrix.rows() {
        writeln!(f, "  [{}]", row.iter().map(|v| format!("{v:>10.5}")).join(" "))?;
    }
    Ok(())
}

/// The link line of a single-trait GLMM, or `None` for the normal likelihood.
fn link_formula(likelihood: &str) -> Option<(&'static str, &'static str)> {
    match likelihood {
        "bernoulli" => Some(("y ~ Bernoulli(p)", "logit(p)")),
        "probit" => Some(("y ~ Bernoulli(p)", "probit(p)")),
        "binomial" => Some(("y ~ Binomial(ntrials, p)", "logit(p)")),
        "poisson" => Some(("y ~ Poisson(lambda)", "log(lambda)")),
        _ => None,
    }
}

impl ScanResult {
    fn covariate_labels(&self) -> Vec<String> {
        if self.is_multi_trait() {
            self.traits()
                .iter()
                .cartesian_product(self.covariates())
                .map(|(t, c)| format!("{t}/{c}"))
                .collect()
        } else {
            self.covariates().to_vec()
        }
    }

    fn write_model(
        &self,
        f: &mut fmt::Formatter<'_>,
        fixed: &str,
        covariance: &str,
    ) -> fmt::Result {
        if self.is_multi_trait() {
            return writeln!(f, "  vec(Y) ~ Normal({fixed}, {covariance})");
        }
        match link_formula(self.likelihood()) {
            Some((outcome, link)) => {
                writeln!(f, "  {outcome}")?;
                writeln!(f, "  {link} = {fixed} + z")?;
                writeln!(f, "  z ~ Normal(0, {covariance})")
            }
            None => writeln!(f, "  y ~ Normal({fixed}, {covariance})"),
        }
    }

    fn write_null(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let null = self.h0();
        writeln!(f, "Hypothesis 0")?;
        writeln!(f, "------------")?;
        writeln!(f)?;
        match &null.variances {
            NullVariances::Single { v0, v1 } => {
                let covariance = if v0.is_nan() {
                    "v1*I".to_string()
                } else {
                    "v0*K + v1*I".to_string()
                };
                let fixed = "M*alpha";
                self.write_model(f, fixed, &covariance)?;
                writeln!(f)?;
                if !v0.is_nan() {
                    writeln!(f, "v0   = {v0:.6}")?;
                }
                writeln!(f, "v1   = {v1:.6}")?;
            }
            NullVariances::Multi { c0, c1 } => {
                self.write_model(f, "(A kron M)vec(alpha)", "C0 kron K + C1 kron I")?;
                writeln!(f)?;
                write_matrix(f, "C0", c0)?;
                write_matrix(f, "C1", c1)?;
            }
        }
        writeln!(f)?;

        let labels = self.covariate_labels();
        let width = labels.iter().map(|l| l.chars().count()).max().unwrap_or(0).max(9);
        writeln!(f, "{:<width$} {:>14} {:>14}", "covariate", "alpha", "se(alpha)")?;
        for ((label, a), se) in labels
            .iter()
            .zip(null.effsizes.iter())
            .zip(null.effsizes_se.iter())
        {
            writeln!(f, "{label:<width$} {a:>14.6e} {se:>14.6e}")?;
        }
        writeln!(f)?;
        writeln!(f, "lml = {:.6}", null.lml)
    }

    fn write_alternative(
        &self,
        f: &mut fmt::Formatter<'_>,
        title: &str,
        fixed: &str,
        nested: &[&VariantResult],
    ) -> fmt::Result {
        writeln!(f, "{title}")?;
        writeln!(f, "{}", "-".repeat(title.chars().count()))?;
        writeln!(f)?;
        let covariance = match &self.h0().variances {
            NullVariances::Single { v0, .. } if v0.is_nan() => "s*I".to_string(),
            NullVariances::Single { .. } => "s*(v0*K + v1*I)".to_string(),
            NullVariances::Multi { .. } => "s*(C0 kron K + C1 kron I)".to_string(),
        };
        self.write_model(f, fixed, &covariance)?;
        writeln!(f)?;

        let mut rows = vec![(
            "lml".to_string(),
            Summary::of(nested.iter().map(|h| h.lml)),
        )];
        for (i, label) in self.covariate_labels().into_iter().enumerate() {
            rows.push((
                format!("cov. effsizes {label}"),
                Summary::of(nested.iter().filter_map(|h| h.covariate_effsizes.get(i).copied())),
            ));
        }
        rows.push((
            "cand. effsizes".to_string(),
            Summary::of(
                nested
                    .iter()
                    .flat_map(|h| h.candidate_effsizes.iter().copied()),
            ),
        ));
        write_summary_table(f, &rows)
    }
}

impl fmt::Display for ScanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h1_fixed, h2_fixed) = if self.is_multi_trait() {
            (
                "(A kron M)vec(alpha) + (A0 kron G)vec(beta0)",
                "(A kron M)vec(alpha) + (A0 kron G)vec(beta0) + (A1 kron G)vec(beta1)",
            )
        } else {
            ("M*alpha", "M*alpha + G*beta")
        };

        self.write_null(f)?;
        writeln!(f)?;

        let lml0 = self.h0().lml;
        let h2: Vec<&VariantResult> = self.records().iter().map(|r| &r.h2).collect();
        let mut pvalues = Vec::new();
        if self.has_h1() {
            let h1: Vec<&VariantResult> =
                self.records().iter().filter_map(|r| r.h1.as_ref()).collect();
            self.write_alternative(f, "Hypothesis 1", h1_fixed, &h1)?;
            writeln!(f)?;
            pvalues.push((
                "H0 vs H1".to_string(),
                Summary::of(h1.iter().map(|h| lrt(lml0, h.lml, h.candidate_effsizes.len()))),
            ));
            pvalues.push((
                "H0 vs H2".to_string(),
                Summary::of(h2.iter().map(|h| lrt(lml0, h.lml, h.candidate_effsizes.len()))),
            ));
            pvalues.push((
                "H1 vs H2".to_string(),
                Summary::of(h1.iter().zip(&h2).map(|(a, b)| {
                    let dof = b.candidate_effsizes.len() - a.candidate_effsizes.len();
                    lrt(a.lml, b.lml, dof)
                })),
            ));
        } else {
            pvalues.push((
                "H0 vs H2".to_string(),
                Summary::of(h2.iter().map(|h| lrt(lml0, h.lml, h.candidate_effsizes.len()))),
            ));
        }
        self.write_alternative(f, "Hypothesis 2", h2_fixed, &h2)?;
        writeln!(f)?;

        writeln!(f, "P-values")?;
        writeln!(f, "--------")?;
        writeln!(f)?;
        write_summary_table(f, &pvalues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{RecordDraft, ScanResultFactory};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn summary_matches_interpolated_quantiles() {
        let s = Summary::of([4.0, 1.0, 3.0, 2.0, f64::NAN]);
        assert_eq!(s.count, 4);
        assert_abs_diff_eq!(s.mean, 2.5);
        assert_abs_diff_eq!(s.std, (5.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(s.q25, 1.75);
        assert_abs_diff_eq!(s.q50, 2.5);
        assert_abs_diff_eq!(s.q75, 3.25);
        assert_eq!((s.min, s.max), (1.0, 4.0));
        assert!(Summary::of(std::iter::empty()).mean.is_nan());
    }

    #[test]
    fn rendering_names_the_link_and_is_deterministic() {
        let mut factory = ScanResultFactory::single_trait(
            "poisson",
            "trait0".to_string(),
            vec!["offset".to_string()],
            vec!["c0".to_string()],
            -30.0,
            array![0.2],
            array![0.1],
            f64::NAN,
            0.4,
        );
        factory
            .add_test(RecordDraft::new(vec![0]).finish(VariantResult {
                lml: -29.0,
                covariate_effsizes: array![0.2],
                candidate_effsizes: array![0.3],
                covariate_effsizes_se: array![0.1],
                candidate_effsizes_se: array![0.2],
                scale: 1.0,
            }))
            .unwrap();
        let result = factory.create();
        let text = result.to_string();
        assert!(text.contains("log(lambda) = M*alpha + z"));
        assert!(text.contains("z ~ Normal(0, v1*I)"));
        assert!(!text.contains("Hypothesis 1"));
        assert!(text.contains("H0 vs H2"));
        assert_eq!(text, result.to_string());
    }
}
