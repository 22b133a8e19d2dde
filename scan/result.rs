//! Scan results: per-candidate records, the null model, and the derived tables.
//!
//! Records are collected by a [`ScanResultFactory`] and frozen into a
//! read-only [`ScanResult`]. The `stats` and `effsizes` tables are built on
//! first access and memoised.

use crate::builder::NullVariances;
use crate::error::QtlError;
use crate::solver::{ScanOutcome, lrt};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::sync::OnceLock;

// --- Hypothesis Outcomes ---

/// Fit of one alternative hypothesis for one candidate entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantResult {
    pub lml: f64,
    pub covariate_effsizes: Array1<f64>,
    pub candidate_effsizes: Array1<f64>,
    pub covariate_effsizes_se: Array1<f64>,
    pub candidate_effsizes_se: Array1<f64>,
    pub scale: f64,
}

impl From<ScanOutcome> for VariantResult {
    fn from(outcome: ScanOutcome) -> Self {
        Self {
            lml: outcome.lml,
            covariate_effsizes: outcome.effsizes0,
            candidate_effsizes: outcome.effsizes1,
            covariate_effsizes_se: outcome.effsizes0_se,
            candidate_effsizes_se: outcome.effsizes1_se,
            scale: outcome.scale,
        }
    }
}

impl VariantResult {
    fn is_consistent(&self) -> bool {
        self.covariate_effsizes.len() == self.covariate_effsizes_se.len()
            && self.candidate_effsizes.len() == self.candidate_effsizes_se.len()
    }
}

/// The fitted null hypothesis H0.
#[derive(Debug, Clone, PartialEq)]
pub struct NullResult {
    pub lml: f64,
    /// Covariate effect sizes. Multi-trait entries follow `(trait, covariate)`
    /// with the covariate varying fastest.
    pub effsizes: Array1<f64>,
    pub effsizes_se: Array1<f64>,
    pub variances: NullVariances,
    pub traits: Vec<String>,
    pub covariates: Vec<String>,
}

impl NullResult {
    pub fn v0(&self) -> Option<f64> {
        match self.variances {
            NullVariances::Single { v0, .. } => Some(v0),
            NullVariances::Multi { .. } => None,
        }
    }

    pub fn v1(&self) -> Option<f64> {
        match self.variances {
            NullVariances::Single { v1, .. } => Some(v1),
            NullVariances::Multi { .. } => None,
        }
    }

    pub fn c0(&self) -> Option<&Array2<f64>> {
        match &self.variances {
            NullVariances::Multi { c0, .. } => Some(c0),
            NullVariances::Single { .. } => None,
        }
    }

    pub fn c1(&self) -> Option<&Array2<f64>> {
        match &self.variances {
            NullVariances::Multi { c1, .. } => Some(c1),
            NullVariances::Single { .. } => None,
        }
    }
}

// --- Record Lifecycle ---

/// H1 (optional) and H2 of one candidate entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    /// Positions of the candidates in the genotype matrix.
    pub idx: Vec<usize>,
    pub h1: Option<VariantResult>,
    pub h2: VariantResult,
}

/// A record under construction: created, then optionally given H1, then
/// completed by H2.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    idx: Vec<usize>,
    h1: Option<VariantResult>,
}

impl RecordDraft {
    pub fn new(idx: Vec<usize>) -> Self {
        Self { idx, h1: None }
    }

    pub fn with_h1(mut self, h1: VariantResult) -> Self {
        self.h1 = Some(h1);
        self
    }

    pub fn finish(self, h2: VariantResult) -> CandidateRecord {
        CandidateRecord {
            idx: self.idx,
            h1: self.h1,
            h2,
        }
    }
}

/// Label vocabularies shared by the factory and the result.
#[derive(Debug, Clone, PartialEq)]
struct Vocabulary {
    likelihood: String,
    traits: Vec<String>,
    covariates: Vec<String>,
    candidates: Vec<String>,
    /// Env labels of the H1 and H2 interaction designs; `None` on the single-trait path.
    envs: Option<(Vec<String>, Vec<String>)>,
}

impl Vocabulary {
    fn is_multi_trait(&self) -> bool {
        self.envs.is_some()
    }

    fn env0(&self) -> &[String] {
        self.envs.as_ref().map(|(e0, _)| e0.as_slice()).unwrap_or(&[])
    }

    /// Env labels of the H2 design, `A0` then `A1`.
    fn env01(&self) -> Vec<String> {
        match &self.envs {
            Some((e0, e1)) => e0.iter().chain(e1.iter()).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn expects_h1(&self) -> bool {
        !self.env0().is_empty()
    }
}

// --- Record Assembly ---

/// Collects per-candidate records on top of a fitted null.
#[derive(Debug, Clone)]
pub struct ScanResultFactory {
    vocabulary: Vocabulary,
    null: NullResult,
    records: Vec<CandidateRecord>,
}

impl ScanResultFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn single_trait(
        likelihood: &str,
        trait_label: String,
        covariates: Vec<String>,
        candidates: Vec<String>,
        null_lml: f64,
        null_beta: Array1<f64>,
        null_beta_se: Array1<f64>,
        v0: f64,
        v1: f64,
    ) -> Self {
        let traits = vec![trait_label];
        Self {
            null: NullResult {
                lml: null_lml,
                effsizes: null_beta,
                effsizes_se: null_beta_se,
                variances: NullVariances::Single { v0, v1 },
                traits: traits.clone(),
                covariates: covariates.clone(),
            },
            vocabulary: Vocabulary {
                likelihood: likelihood.to_string(),
                traits,
                covariates,
                candidates,
                envs: None,
            },
            records: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn multi_trait(
        likelihood: &str,
        traits: Vec<String>,
        covariates: Vec<String>,
        candidates: Vec<String>,
        env0: Vec<String>,
        env1: Vec<String>,
        null_lml: f64,
        null_beta: Array1<f64>,
        null_beta_se: Array1<f64>,
        c0: Array2<f64>,
        c1: Array2<f64>,
    ) -> Self {
        Self {
            null: NullResult {
                lml: null_lml,
                effsizes: null_beta,
                effsizes_se: null_beta_se,
                variances: NullVariances::Multi { c0, c1 },
                traits: traits.clone(),
                covariates: covariates.clone(),
            },
            vocabulary: Vocabulary {
                likelihood: likelihood.to_string(),
                traits,
                covariates,
                candidates,
                envs: Some((env0, env1)),
            },
            records: Vec::new(),
        }
    }

    /// Appends a completed record after checking it against the vocabularies.
    pub fn add_test(&mut self, record: CandidateRecord) -> Result<(), QtlError> {
        let vocabulary = &self.vocabulary;
        if let Some(&bad) = record.idx.iter().find(|&&i| i >= vocabulary.candidates.len()) {
            return Err(QtlError::ShapeOrLabelMismatch(format!(
                "candidate index {bad} is out of range for {} candidates",
                vocabulary.candidates.len()
            )));
        }
        if record.h1.is_some() != vocabulary.expects_h1() {
            return Err(QtlError::ShapeOrLabelMismatch(
                "an H1 fit must be given exactly when the A0 design has columns".to_string(),
            ));
        }

        let ncov = self.null.effsizes.len();
        let check = |name: &str, h: &VariantResult, nenv: usize| -> Result<(), QtlError> {
            let expected = record.idx.len() * nenv;
            if !h.is_consistent()
                || h.candidate_effsizes.len() != expected
                || h.covariate_effsizes.len() != ncov
            {
                return Err(QtlError::ShapeOrLabelMismatch(format!(
                    "{name} has {} candidate and {} covariate effect sizes with {} and {} standard errors, expected {expected} and {ncov}",
                    h.candidate_effsizes.len(),
                    h.covariate_effsizes.len(),
                    h.candidate_effsizes_se.len(),
                    h.covariate_effsizes_se.len()
                )));
            }
            Ok(())
        };

        if vocabulary.is_multi_trait() {
            if let Some(h1) = &record.h1 {
                check("H1", h1, vocabulary.env0().len())?;
            }
            check("H2", &record.h2, vocabulary.env01().len())?;
        } else {
            check("H2", &record.h2, 1)?;
        }

        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Freezes the collected records.
    pub fn create(self) -> ScanResult {
        ScanResult {
            vocabulary: self.vocabulary,
            null: self.null,
            records: self.records,
            stats: OnceLock::new(),
            effsizes_h1: OnceLock::new(),
            effsizes_h2: OnceLock::new(),
        }
    }
}

// --- Frozen Result and Its Derived Tables ---

/// Read-only outcome of a scan.
#[derive(Debug)]
pub struct ScanResult {
    vocabulary: Vocabulary,
    null: NullResult,
    records: Vec<CandidateRecord>,
    stats: OnceLock<DataFrame>,
    effsizes_h1: OnceLock<Option<DataFrame>>,
    effsizes_h2: OnceLock<DataFrame>,
}

/// Which alternative an effect-size table describes.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Hypothesis {
    H1,
    H2,
}

impl ScanResult {
    pub fn h0(&self) -> &NullResult {
        &self.null
    }

    pub fn records(&self) -> &[CandidateRecord] {
        &self.records
    }

    pub fn likelihood(&self) -> &str {
        &self.vocabulary.likelihood
    }

    pub fn is_multi_trait(&self) -> bool {
        self.vocabulary.is_multi_trait()
    }

    pub fn has_h1(&self) -> bool {
        self.vocabulary.expects_h1()
    }

    pub fn traits(&self) -> &[String] {
        &self.vocabulary.traits
    }

    pub fn covariates(&self) -> &[String] {
        &self.vocabulary.covariates
    }

    pub fn candidates(&self) -> &[String] {
        &self.vocabulary.candidates
    }

    pub fn env0(&self) -> &[String] {
        self.vocabulary.env0()
    }

    pub fn env1(&self) -> &[String] {
        self.vocabulary
            .envs
            .as_ref()
            .map(|(_, e1)| e1.as_slice())
            .unwrap_or(&[])
    }

    /// One row per candidate entry with likelihoods, degrees of freedom,
    /// scales, and LR-test p-values.
    ///
    /// Rows follow [`ScanResult::records`]; row `i` is the entry keyed `test = i`
    /// in the effect-size tables.
    pub fn stats(&self) -> Result<&DataFrame, QtlError> {
        if let Some(df) = self.stats.get() {
            return Ok(df);
        }
        let df = self.build_stats()?;
        Ok(self.stats.get_or_init(|| df))
    }

    /// Long-form effect sizes of H1; `None` when no H1 was fitted.
    pub fn effsizes_h1(&self) -> Result<Option<&DataFrame>, QtlError> {
        if let Some(df) = self.effsizes_h1.get() {
            return Ok(df.as_ref());
        }
        let df = if self.has_h1() {
            Some(self.build_effsizes(Hypothesis::H1)?)
        } else {
            None
        };
        Ok(self.effsizes_h1.get_or_init(|| df).as_ref())
    }

    /// Long-form effect sizes of H2.
    pub fn effsizes_h2(&self) -> Result<&DataFrame, QtlError> {
        if let Some(df) = self.effsizes_h2.get() {
            return Ok(df);
        }
        let df = self.build_effsizes(Hypothesis::H2)?;
        Ok(self.effsizes_h2.get_or_init(|| df))
    }

    fn build_stats(&self) -> Result<DataFrame, QtlError> {
        let lml0 = self.null.lml;
        let n = self.records.len();
        let lml2: Vec<f64> = self.records.iter().map(|r| r.h2.lml).collect();
        let dof20: Vec<u32> = self
            .records
            .iter()
            .map(|r| r.h2.candidate_effsizes.len() as u32)
            .collect();
        let scale2: Vec<f64> = self.records.iter().map(|r| r.h2.scale).collect();
        let pv20: Vec<f64> = self
            .records
            .iter()
            .map(|r| lrt(lml0, r.h2.lml, r.h2.candidate_effsizes.len()))
            .collect();

        let mut columns: Vec<Column> = vec![Series::new("lml0".into(), vec![lml0; n]).into()];

        let h1: Vec<&VariantResult> = self.records.iter().filter_map(|r| r.h1.as_ref()).collect();
        if self.has_h1() && h1.len() == n {
            let lml1: Vec<f64> = h1.iter().map(|h| h.lml).collect();
            let dof10: Vec<u32> = h1.iter().map(|h| h.candidate_effsizes.len() as u32).collect();
            let dof21: Vec<u32> = dof20.iter().zip(&dof10).map(|(d2, d1)| d2 - d1).collect();
            let scale1: Vec<f64> = h1.iter().map(|h| h.scale).collect();
            let pv10: Vec<f64> = h1
                .iter()
                .map(|h| lrt(lml0, h.lml, h.candidate_effsizes.len()))
                .collect();
            let pv21: Vec<f64> = self
                .records
                .iter()
                .zip(&h1)
                .zip(&dof21)
                .map(|((r, h), &dof)| lrt(h.lml, r.h2.lml, dof as usize))
                .collect();

            columns.push(Series::new("lml1".into(), lml1).into());
            columns.push(Series::new("lml2".into(), lml2).into());
            columns.push(Series::new("dof10".into(), dof10).into());
            columns.push(Series::new("dof20".into(), dof20).into());
            columns.push(Series::new("dof21".into(), dof21).into());
            columns.push(Series::new("scale1".into(), scale1).into());
            columns.push(Series::new("scale2".into(), scale2).into());
            columns.push(Series::new("pv10".into(), pv10).into());
            columns.push(Series::new("pv20".into(), pv20).into());
            columns.push(Series::new("pv21".into(), pv21).into());
        } else {
            columns.push(Series::new("lml2".into(), lml2).into());
            columns.push(Series::new("dof20".into(), dof20).into());
            columns.push(Series::new("scale2".into(), scale2).into());
            columns.push(Series::new("pv20".into(), pv20).into());
        }

        Ok(DataFrame::new(columns)?)
    }

    fn build_effsizes(&self, hypothesis: Hypothesis) -> Result<DataFrame, QtlError> {
        let vocabulary = &self.vocabulary;
        let envs = match hypothesis {
            Hypothesis::H1 => vocabulary.env0().to_vec(),
            Hypothesis::H2 => vocabulary.env01(),
        };
        let multi = vocabulary.is_multi_trait();
        let ncov = vocabulary.covariates.len();

        let mut test: Vec<u32> = Vec::new();
        let mut traits: Vec<Option<String>> = Vec::new();
        let mut effect_type: Vec<&str> = Vec::new();
        let mut effect_name: Vec<String> = Vec::new();
        let mut env: Vec<Option<String>> = Vec::new();
        let mut effsize: Vec<f64> = Vec::new();
        let mut effsize_se: Vec<f64> = Vec::new();

        for (t, record) in self.records.iter().enumerate() {
            let h = match hypothesis {
                Hypothesis::H1 => match &record.h1 {
                    Some(h1) => h1,
                    None => continue,
                },
                Hypothesis::H2 => &record.h2,
            };

            for (i, (&value, &se)) in h
                .covariate_effsizes
                .iter()
                .zip(h.covariate_effsizes_se.iter())
                .enumerate()
            {
                let (trait_label, covariate) = if multi {
                    (
                        vocabulary.traits.get(i / ncov.max(1)).cloned(),
                        vocabulary.covariates[i % ncov.max(1)].clone(),
                    )
                } else {
                    (vocabulary.traits.first().cloned(), vocabulary.covariates[i].clone())
                };
                test.push(t as u32);
                traits.push(trait_label);
                effect_type.push("covariate");
                effect_name.push(covariate);
                env.push(None);
                effsize.push(value);
                effsize_se.push(se);
            }

            let nenv = if multi { envs.len().max(1) } else { 1 };
            for (i, (&value, &se)) in h
                .candidate_effsizes
                .iter()
                .zip(h.candidate_effsizes_se.iter())
                .enumerate()
            {
                let candidate = vocabulary.candidates[record.idx[i / nenv]].clone();
                test.push(t as u32);
                if multi {
                    traits.push(None);
                    env.push(envs.get(i % nenv).cloned());
                } else {
                    traits.push(vocabulary.traits.first().cloned());
                    env.push(None);
                }
                effect_type.push("candidate");
                effect_name.push(candidate);
                effsize.push(value);
                effsize_se.push(se);
            }
        }

        let mut columns: Vec<Column> = vec![
            Series::new("test".into(), test).into(),
            Series::new("trait".into(), traits).into(),
            Series::new("effect_type".into(), effect_type).into(),
            Series::new("effect_name".into(), effect_name).into(),
        ];
        if multi {
            columns.push(Series::new("env".into(), env).into());
        }
        columns.push(Series::new("effsize".into(), effsize).into());
        columns.push(Series::new("effsize_se".into(), effsize_se).into());
        Ok(DataFrame::new(columns)?)
    }
}
