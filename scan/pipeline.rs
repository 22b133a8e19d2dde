//! The public `scan` entry point.
//!
//! A scan conforms the inputs, fits the null model once, and then fits and
//! records the alternative hypotheses of every candidate entry in order.

use crate::adapter::ScannerAdapter;
use crate::builder::{NullVariances, build_multi_trait, build_single_trait};
use crate::config::ScanConfig;
use crate::conform::{ConformedData, assert_finite, conform};
use crate::design::InteractionDesign;
use crate::error::QtlError;
use crate::labeled::{LabeledMatrix, positional_labels};
use crate::likelihood::{Likelihood, LikelihoodDescriptor, normalize_likelihood};
use crate::result::{RecordDraft, ScanResult, ScanResultFactory};
use crate::solver::{EconomicQs, economic_qs};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array2, Axis};
use std::io::IsTerminal;
use std::ops::Range;

// --- Reporting Parameters ---

/// Redraw rate of the progress bar. Scans of cheap candidates finish thousands
/// of entries per second, so the bar is throttled rather than drawn per entry.
const PROGRESS_REFRESH_HZ: u8 = 20;
/// Width of the rule framing the verbose input summary.
const SUMMARY_RULE_WIDTH: usize = 40;
/// Column at which the verbose input summary starts printing values.
const SUMMARY_LABEL_WIDTH: usize = 20;

/// One entry of the candidate index: the candidates tested jointly in one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateIndex {
    Single(usize),
    Group(Vec<usize>),
    /// A contiguous group.
    Range(Range<usize>),
}

impl CandidateIndex {
    pub fn positions(&self) -> Vec<usize> {
        match self {
            CandidateIndex::Single(i) => vec![*i],
            CandidateIndex::Group(group) => group.clone(),
            CandidateIndex::Range(range) => range.clone().collect(),
        }
    }
}

impl From<usize> for CandidateIndex {
    fn from(i: usize) -> Self {
        CandidateIndex::Single(i)
    }
}

impl From<Vec<usize>> for CandidateIndex {
    fn from(group: Vec<usize>) -> Self {
        CandidateIndex::Group(group)
    }
}

impl From<Range<usize>> for CandidateIndex {
    fn from(range: Range<usize>) -> Self {
        CandidateIndex::Range(range)
    }
}

/// Inputs of one scan. Only `G` and `Y` are required; the likelihood defaults
/// to `normal`.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    g: LabeledMatrix,
    y: LabeledMatrix,
    likelihood: LikelihoodDescriptor,
    k: Option<LabeledMatrix>,
    m: Option<LabeledMatrix>,
    idx: Option<Vec<CandidateIndex>>,
    a: Option<LabeledMatrix>,
    a0: Option<LabeledMatrix>,
    a1: Option<LabeledMatrix>,
}

impl ScanRequest {
    pub fn new(g: impl Into<LabeledMatrix>, y: impl Into<LabeledMatrix>) -> Self {
        Self {
            g: g.into(),
            y: y.into(),
            likelihood: LikelihoodDescriptor::from("normal"),
            k: None,
            m: None,
            idx: None,
            a: None,
            a0: None,
            a1: None,
        }
    }

    pub fn likelihood(mut self, likelihood: impl Into<LikelihoodDescriptor>) -> Self {
        self.likelihood = likelihood.into();
        self
    }

    pub fn kinship(mut self, k: impl Into<LabeledMatrix>) -> Self {
        self.k = Some(k.into());
        self
    }

    pub fn covariates(mut self, m: impl Into<LabeledMatrix>) -> Self {
        self.m = Some(m.into());
        self
    }

    /// Restricts the scan to the given entries, tested in the given order.
    pub fn candidates<I, C>(mut self, idx: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CandidateIndex>,
    {
        self.idx = Some(idx.into_iter().map(Into::into).collect());
        self
    }

    /// Trait design `A` (p×p) of the fixed and random effects.
    pub fn trait_design(mut self, a: impl Into<LabeledMatrix>) -> Self {
        self.a = Some(a.into());
        self
    }

    /// Env design `A0` (p×p₀) of the H1 interaction.
    pub fn h1_env(mut self, a0: impl Into<LabeledMatrix>) -> Self {
        self.a0 = Some(a0.into());
        self
    }

    /// Env design `A1` (p×p₁) added on top of `A0` under H2.
    pub fn h2_env(mut self, a1: impl Into<LabeledMatrix>) -> Self {
        self.a1 = Some(a1.into());
        self
    }
}

fn create_progress_bar(len: u64, message: &str, verbose: bool) -> ProgressBar {
    let draw_target = if verbose && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(PROGRESS_REFRESH_HZ)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

fn print_input_info(
    likelihood: &Likelihood,
    data: &ConformedData,
    candidates: usize,
    entries: usize,
) {
    let width = SUMMARY_LABEL_WIDTH;
    eprintln!("{}", "=".repeat(SUMMARY_RULE_WIDTH));
    eprintln!("{:<width$}{}", "Likelihood:", likelihood.name());
    eprintln!("{:<width$}{}", "Traits:", data.y.col_labels().join(", "));
    eprintln!("{:<width$}{}", "Covariates:", data.m.col_labels().join(", "));
    eprintln!("{:<width$}{}", "Variants:", candidates);
    eprintln!("{:<width$}{}", "N. of candidates:", entries);
    eprintln!(
        "{:<width$}{}",
        "Kinship:",
        if data.k.is_some() { "present" } else { "absent" }
    );
    eprintln!("{}", "=".repeat(SUMMARY_RULE_WIDTH));
}

/// Divides `K` by the mean of its diagonal when requested, then eigendecomposes it.
fn decompose_kinship(k: &LabeledMatrix, config: &ScanConfig) -> Result<EconomicQs, QtlError> {
    let mut values = k.values().to_owned();
    if config.kinship.normalize {
        let mean = values.diag().mean().unwrap_or(f64::NAN);
        if !(mean > 0.0) || !mean.is_finite() {
            return Err(QtlError::InvalidKinship(format!(
                "the mean of its diagonal is {mean}, expected a positive value"
            )));
        }
        values /= mean;
    }
    Ok(economic_qs(values.view(), config.kinship.eigen_tolerance)?)
}

/// Resolves the candidate index into per-record positions, checking every position.
fn resolve_entries(
    idx: Option<&[CandidateIndex]>,
    ncandidates: usize,
) -> Result<Vec<Vec<usize>>, QtlError> {
    let entries: Vec<Vec<usize>> = match idx {
        Some(idx) => idx.iter().map(CandidateIndex::positions).collect(),
        None => (0..ncandidates).map(|j| vec![j]).collect(),
    };
    if let Some(&bad) = entries.iter().flatten().find(|&&j| j >= ncandidates) {
        return Err(QtlError::ShapeOrLabelMismatch(format!(
            "candidate index {bad} is out of range for {ncandidates} candidates"
        )));
    }
    Ok(entries)
}

/// Env design, or its default when absent, with every column labelled.
fn env_design(
    design: Option<&LabeledMatrix>,
    name: &str,
    prefix: &str,
    fallback: LabeledMatrix,
    ntraits: usize,
) -> Result<LabeledMatrix, QtlError> {
    let design = design.cloned().unwrap_or(fallback).with_dims("trait", "env");
    if design.nrows() != ntraits {
        return Err(QtlError::ShapeOrLabelMismatch(format!(
            "{name} has {} rows, expected one per trait ({ntraits})",
            design.nrows()
        )));
    }
    if design.is_labeled(Axis(1)) {
        return Ok(design);
    }
    let labels = positional_labels(prefix, design.ncols());
    design.with_col_labels(labels)
}

/// Runs a full scan: conformance, the null fit, then every candidate entry.
pub fn scan(request: &ScanRequest, config: &ScanConfig) -> Result<ScanResult, QtlError> {
    // --- Entry Point Validation ---
    if request.y.ncols() == 0 {
        return Err(QtlError::ShapeOrLabelMismatch(
            "the phenotype has no trait column".to_string(),
        ));
    }
    if request.a.is_none() && (request.a0.is_some() || request.a1.is_some()) {
        return Err(QtlError::UnsupportedCombination(
            "cannot define A0 or A1 without A".to_string(),
        ));
    }

    // --- Sample Alignment and Input Checks ---
    let likelihood = normalize_likelihood(&request.likelihood, request.y.nrows())?;
    let data = conform(
        request.y.clone(),
        request.m.clone(),
        Some(request.g.clone()),
        request.k.clone(),
    )?;
    let likelihood = likelihood.aligned(&data.y_origin);
    likelihood.validate_outcome(data.y.view())?;

    assert_finite("phenotype", &data.y)?;
    assert_finite("covariates", &data.m)?;
    let Some(g) = data.g.as_ref() else {
        return Err(QtlError::ShapeOrLabelMismatch(
            "the genotype did not survive sample alignment".to_string(),
        ));
    };
    assert_finite("genotype", g)?;
    if let Some(k) = &data.k {
        assert_finite("kinship", k)?;
    }

    // --- Route to the Single- or Multi-Trait Path ---
    let ntraits = data.y.ncols();
    if ntraits > 1 && request.a.is_none() {
        return Err(QtlError::UnsupportedCombination(format!(
            "{ntraits} traits were given without a trait design A"
        )));
    }
    let multi_trait = ntraits > 1 && request.a.is_some();
    if request.a.is_some() && !multi_trait {
        log::warn!("A single trait was given; A, A0 and A1 are ignored.");
    }

    let entries = resolve_entries(request.idx.as_deref(), g.ncols())?;
    if config.verbose {
        print_input_info(&likelihood, &data, g.ncols(), entries.len());
    }

    let qs = data
        .k
        .as_ref()
        .map(|k| decompose_kinship(k, config))
        .transpose()?;
    if let Some(qs) = &qs {
        log::info!(
            "Kinship eigendecomposition kept rank {} of {} samples.",
            qs.rank(),
            qs.nsamples()
        );
    }

    let result = if multi_trait {
        scan_multi_trait(request, config, &data, g, &likelihood, qs.as_ref(), &entries)?
    } else {
        scan_single_trait(request, config, &data, g, &likelihood, qs.as_ref(), &entries)?
    };

    if config.verbose {
        eprintln!("{result}");
    }
    Ok(result)
}

fn scan_single_trait(
    request: &ScanRequest,
    config: &ScanConfig,
    data: &ConformedData,
    g: &LabeledMatrix,
    likelihood: &Likelihood,
    qs: Option<&EconomicQs>,
    entries: &[Vec<usize>],
) -> Result<ScanResult, QtlError> {
    let y = data.y.values().column(0);
    let null = build_single_trait(y, data.m.view(), qs, likelihood, config)?;
    let (v0, v1) = match null.variances {
        NullVariances::Single { v0, v1 } => (v0, v1),
        NullVariances::Multi { .. } => (f64::NAN, f64::NAN),
    };
    let adapter = ScannerAdapter::new(null.scanner);
    log::info!("Null model fitted: lml = {:.6}.", adapter.null_lml());

    let mut factory = ScanResultFactory::single_trait(
        likelihood.name(),
        data.y.col_labels().into_iter().next().unwrap_or_default(),
        data.m.col_labels(),
        g.col_labels(),
        adapter.null_lml(),
        adapter.null_beta(),
        adapter.null_beta_se(),
        v0,
        v1,
    );

    // --- Alternatives: one sweep for normal scans over every column, else per entry ---
    let pb = create_progress_bar(entries.len() as u64, "Scanning candidates", config.verbose);
    if likelihood.is_normal() && request.idx.is_none() {
        for (j, h2) in adapter.fast_scan(g.view())?.into_iter().enumerate() {
            factory.add_test(RecordDraft::new(vec![j]).finish(h2))?;
            pb.inc(1);
        }
    } else {
        for entry in entries {
            let design = g.view().select(Axis(1), entry);
            let h2 = adapter.scan(design.view())?;
            factory.add_test(RecordDraft::new(entry.clone()).finish(h2))?;
            pb.inc(1);
        }
    }
    pb.finish_and_clear();

    Ok(factory.create())
}

fn scan_multi_trait(
    request: &ScanRequest,
    config: &ScanConfig,
    data: &ConformedData,
    g: &LabeledMatrix,
    likelihood: &Likelihood,
    qs: Option<&EconomicQs>,
    entries: &[Vec<usize>],
) -> Result<ScanResult, QtlError> {
    let ntraits = data.y.ncols();
    let traits = data.y.col_labels();
    let Some(a) = request.a.as_ref() else {
        return Err(QtlError::UnsupportedCombination(
            "the multi-trait path needs a trait design A".to_string(),
        ));
    };
    if a.nrows() != ntraits || a.ncols() != ntraits {
        return Err(QtlError::ShapeOrLabelMismatch(format!(
            "A is {}x{}, expected {ntraits}x{ntraits}",
            a.nrows(),
            a.ncols()
        )));
    }

    // --- Env designs: A0 for H1, [A0 A1] for H2 ---
    let a0 = env_design(
        request.a0.as_ref(),
        "A0",
        "env0_",
        LabeledMatrix::new(Array2::zeros((ntraits, 0))),
        ntraits,
    )?;
    let a1 = env_design(
        request.a1.as_ref(),
        "A1",
        "env1_",
        LabeledMatrix::new(Array2::eye(ntraits)).with_col_labels(traits.iter().cloned())?,
        ntraits,
    )?;
    let a01 = a0.concat_columns(&a1)?;
    let (env0, env1) = (a0.col_labels(), a1.col_labels());

    let null = build_multi_trait(data.y.view(), a.view(), data.m.view(), qs, likelihood, config)?;
    let (c0, c1) = match null.variances {
        NullVariances::Multi { c0, c1 } => (c0, c1),
        NullVariances::Single { .. } => {
            return Err(QtlError::UnsupportedCombination(
                "the multi-trait path produced a single-trait null".to_string(),
            ));
        }
    };
    let adapter = ScannerAdapter::new(null.scanner);
    log::info!("Multi-trait null model fitted: lml = {:.6}.", adapter.null_lml());

    let with_h1 = !env0.is_empty();
    let mut factory = ScanResultFactory::multi_trait(
        likelihood.name(),
        traits,
        data.m.col_labels(),
        g.col_labels(),
        env0,
        env1,
        adapter.null_lml(),
        adapter.null_beta(),
        adapter.null_beta_se(),
        c0,
        c1,
    );

    // --- Alternatives: H1 on A0, H2 on [A0 A1], per entry ---
    let n = data.nsamples();
    let mut design0 = InteractionDesign::new(a0.view(), n);
    let mut design01 = InteractionDesign::new(a01.view(), n);

    let pb = create_progress_bar(entries.len() as u64, "Scanning candidates", config.verbose);
    for entry in entries {
        let candidates = g.view().select(Axis(1), entry);
        let mut draft = RecordDraft::new(entry.clone());
        if with_h1 {
            draft = draft.with_h1(adapter.scan(design0.build(candidates.view())?)?);
        }
        let h2 = adapter.scan(design01.build(candidates.view())?)?;
        factory.add_test(draft.finish(h2))?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(factory.create())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn candidate_entries_expand_in_order() {
        let idx = vec![
            CandidateIndex::from(2),
            CandidateIndex::from(vec![0, 1]),
            CandidateIndex::from(1..4),
        ];
        let entries = resolve_entries(Some(&idx), 4).unwrap();
        assert_eq!(entries, vec![vec![2], vec![0, 1], vec![1, 2, 3]]);
        assert_eq!(resolve_entries(None, 2).unwrap(), vec![vec![0], vec![1]]);
        assert!(matches!(
            resolve_entries(Some(&[CandidateIndex::Single(4)]), 4),
            Err(QtlError::ShapeOrLabelMismatch(_))
        ));
    }

    #[test]
    fn kinship_with_zero_diagonal_is_rejected() {
        let k = LabeledMatrix::new(array![[0.0, 0.0], [0.0, 0.0]]);
        assert!(matches!(
            decompose_kinship(&k, &ScanConfig::default()),
            Err(QtlError::InvalidKinship(_))
        ));
    }

    #[test]
    fn env_designs_default_their_labels() {
        let a0 = env_design(
            Some(&LabeledMatrix::new(array![[1.0, 0.0], [0.0, 1.0]])),
            "A0",
            "env0_",
            LabeledMatrix::new(Array2::zeros((2, 0))),
            2,
        )
        .unwrap();
        assert_eq!(a0.ncols(), 2);
        assert_eq!(a0.col_labels(), vec!["env0_0", "env0_1"]);

        let a1 = env_design(
            None,
            "A1",
            "env1_",
            LabeledMatrix::new(Array2::eye(2)).with_col_labels(["t0", "t1"]).unwrap(),
            2,
        )
        .unwrap();
        let a01 = a0.concat_columns(&a1).unwrap();
        assert_eq!(a01.col_labels(), vec!["env0_0", "env0_1", "t0", "t1"]);
    }

    #[test]
    fn phenotype_without_traits_is_rejected() {
        let request = ScanRequest::new(Array2::<f64>::zeros((3, 1)), Array2::<f64>::zeros((3, 0)));
        assert!(matches!(
            scan(&request, &ScanConfig::default()),
            Err(QtlError::ShapeOrLabelMismatch(_))
        ));
    }

    #[test]
    fn env_without_trait_design_is_unsupported() {
        let request = ScanRequest::new(
            Array2::<f64>::zeros((3, 1)),
            Array2::<f64>::zeros((3, 1)),
        )
        .h1_env(Array2::<f64>::eye(1));
        assert!(matches!(
            scan(&request, &ScanConfig::default()),
            Err(QtlError::UnsupportedCombination(_))
        ));
    }
}
