//! Sample alignment of phenotype, covariates, genotype, and kinship.
//!
//! Every input is forced onto one shared sample order before any model sees it.
//! Labelled inputs are intersected by label (as multisets); unlabelled inputs
//! are paired with the labelled ones position by position. When nothing is
//! labelled the inputs are truncated to their smallest sample count.

use crate::error::QtlError;
use crate::labeled::{LabeledMatrix, multiset_intersection, positional_labels};
use ahash::AHashMap;
use ndarray::{Array1, Array2, Axis};

/// Inputs after alignment. All sample axes read the same labels in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConformedData {
    pub y: LabeledMatrix,
    pub m: LabeledMatrix,
    pub g: Option<LabeledMatrix>,
    pub k: Option<LabeledMatrix>,
    /// Row of the original phenotype for every aligned sample.
    pub y_origin: Vec<usize>,
}

impl ConformedData {
    pub fn nsamples(&self) -> usize {
        self.y.nrows()
    }

    pub fn samples(&self) -> Vec<String> {
        self.y.row_labels()
    }
}

/// One input's sample axis, as seen before alignment.
struct SampleAxis<'a> {
    name: &'static str,
    labels: Option<&'a [String]>,
    len: usize,
}

pub fn conform(
    y: LabeledMatrix,
    m: Option<LabeledMatrix>,
    g: Option<LabeledMatrix>,
    k: Option<LabeledMatrix>,
) -> Result<ConformedData, QtlError> {
    let y = y.with_dims("sample", "trait");
    let m = m.map(|m| m.with_dims("sample", "covariate"));
    let g = g.map(|g| g.with_dims("sample", "candidate"));
    let k = k
        .map(|k| harmonise_kinship_axes(k.with_dims("sample_0", "sample_1")))
        .transpose()?;

    // --- Track Phenotype Rows Through Alignment ---
    let origin = {
        let positions = Array1::from_iter((0..y.nrows()).map(|i| i as f64));
        let origin = LabeledMatrix::from(positions).with_dims("sample", "origin");
        match y.labels(Axis(0)) {
            Some(labels) => origin.with_row_labels(labels.iter().cloned())?,
            None => origin,
        }
    };

    // --- Decide the Shared Sample Order ---
    let mut axes = vec![SampleAxis {
        name: "phenotype",
        labels: y.labels(Axis(0)),
        len: y.nrows(),
    }];
    if let Some(m) = &m {
        axes.push(SampleAxis {
            name: "covariates",
            labels: m.labels(Axis(0)),
            len: m.nrows(),
        });
    }
    if let Some(g) = &g {
        axes.push(SampleAxis {
            name: "genotype",
            labels: g.labels(Axis(0)),
            len: g.nrows(),
        });
    }
    if let Some(k) = &k {
        axes.push(SampleAxis {
            name: "kinship",
            labels: k.labels(Axis(0)),
            len: k.nrows(),
        });
    }

    let (pairing, samples) = shared_samples(&axes)?;
    if samples.is_empty() {
        return Err(QtlError::EmptyIntersection);
    }
    log::debug!("{} samples shared by all inputs.", samples.len());

    // --- Place Every Input on That Order ---
    let y = place(y, &[Axis(0)], &pairing, &samples)?;
    let origin = place(origin, &[Axis(0)], &pairing, &samples)?;
    let m = match m {
        Some(m) => place(m, &[Axis(0)], &pairing, &samples)?,
        None => offset_covariate(&samples)?,
    };
    let g = g
        .map(|g| place(g, &[Axis(0)], &pairing, &samples))
        .transpose()?;
    let k = k
        .map(|k| place(k, &[Axis(0), Axis(1)], &pairing, &samples))
        .transpose()?;

    let y_origin = origin.values().column(0).iter().map(|&v| v as usize).collect();

    Ok(ConformedData {
        y,
        m,
        g,
        k,
        y_origin,
    })
}

/// Decides the final sample order.
///
/// Returns the labels that unlabelled inputs are paired with, and the final order.
fn shared_samples(axes: &[SampleAxis<'_>]) -> Result<(Vec<String>, Vec<String>), QtlError> {
    let labelled: Vec<(&str, &[String])> = axes
        .iter()
        .filter_map(|a| a.labels.map(|labels| (a.name, labels)))
        .collect();

    let Some(&(_, reference)) = labelled.first() else {
        let n = axes.iter().map(|a| a.len).min().unwrap_or(0);
        let samples = positional_labels("sample", n);
        return Ok((samples.clone(), samples));
    };

    for axis in axes.iter().filter(|a| a.labels.is_none()) {
        if axis.len != reference.len() {
            return Err(QtlError::ShapeOrLabelMismatch(format!(
                "the {} has no sample labels and {} samples, but the labelled inputs have {}",
                axis.name,
                axis.len,
                reference.len()
            )));
        }
    }

    if labelled.iter().all(|(_, labels)| *labels == reference) {
        return Ok((reference.to_vec(), reference.to_vec()));
    }

    let mut common = reference.to_vec();
    for (_, labels) in &labelled[1..] {
        common = multiset_intersection(&common, labels);
    }

    // Repeated samples survive only when every labelled input holds them equally often.
    let mut counts: AHashMap<&str, usize> = AHashMap::new();
    for label in &common {
        *counts.entry(label.as_str()).or_insert(0) += 1;
    }
    for (label, &count) in counts.iter().filter(|(_, c)| **c > 1) {
        for (name, labels) in &labelled {
            let held = labels.iter().filter(|l| l.as_str() == *label).count();
            if held != count {
                return Err(QtlError::ShapeOrLabelMismatch(format!(
                    "sample '{label}' is repeated {count} times after intersection but the {name} holds it {held} times"
                )));
            }
        }
    }

    Ok((reference.to_vec(), common))
}

/// Pairs unlabelled axes with `pairing` and reorders every axis to `samples`.
fn place(
    matrix: LabeledMatrix,
    axes: &[Axis],
    pairing: &[String],
    samples: &[String],
) -> Result<LabeledMatrix, QtlError> {
    let mut out = matrix;
    for &axis in axes {
        if !out.is_labeled(axis) {
            let truncated = out.truncate(axis, pairing.len());
            out = if axis == Axis(0) {
                truncated.with_row_labels(pairing.iter().cloned())?
            } else {
                truncated.with_col_labels(pairing.iter().cloned())?
            };
        }
        out = out.reindex(axis, samples)?;
    }
    Ok(out)
}

/// Kinship must be square with one sample order shared by both axes.
fn harmonise_kinship_axes(k: LabeledMatrix) -> Result<LabeledMatrix, QtlError> {
    if k.nrows() != k.ncols() {
        return Err(QtlError::ShapeOrLabelMismatch(format!(
            "the kinship matrix must be square, found {}x{}",
            k.nrows(),
            k.ncols()
        )));
    }
    let rows = k.labels(Axis(0)).map(|l| l.to_vec());
    let cols = k.labels(Axis(1)).map(|l| l.to_vec());
    match (rows, cols) {
        (Some(rows), Some(cols)) if rows != cols => Err(QtlError::ShapeOrLabelMismatch(
            "the row and column sample labels of the kinship matrix differ".to_string(),
        )),
        (Some(rows), None) => k.with_col_labels(rows),
        (None, Some(cols)) => k.with_row_labels(cols),
        _ => Ok(k),
    }
}

fn offset_covariate(samples: &[String]) -> Result<LabeledMatrix, QtlError> {
    LabeledMatrix::from(Array2::<f64>::ones((samples.len(), 1)))
        .with_dims("sample", "covariate")
        .with_row_labels(samples.iter().cloned())?
        .with_col_labels(["offset"])
}

/// Fails with [`QtlError::NonFiniteValues`] when `matrix` holds NaN or infinity.
pub fn assert_finite(name: &str, matrix: &LabeledMatrix) -> Result<(), QtlError> {
    if matrix.values().iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(QtlError::NonFiniteValues(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn missing_covariates_become_an_offset() {
        let y = LabeledMatrix::from(array![1.0, 2.0, 3.0]);
        let data = conform(y, None, None, None).unwrap();
        assert_eq!(data.m.col_labels(), vec!["offset".to_string()]);
        assert_eq!(data.m.values(), &Array2::<f64>::ones((3, 1)));
        assert_eq!(data.y_origin, vec![0, 1, 2]);
    }

    #[test]
    fn unlabelled_inputs_truncate_to_smallest() {
        let y = LabeledMatrix::from(array![1.0, 2.0, 3.0, 4.0]);
        let g = LabeledMatrix::from(array![[0.0], [1.0], [2.0]]);
        let data = conform(y, None, Some(g), None).unwrap();
        assert_eq!(data.nsamples(), 3);
        assert_eq!(data.samples()[2], "sample2");
        assert_eq!(data.y.values().column(0).to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn kinship_follows_the_phenotype_order() {
        let y = LabeledMatrix::from(array![10.0, 20.0])
            .with_row_labels(["b", "a"])
            .unwrap();
        let k = LabeledMatrix::from(array![[1.0, 0.5], [0.5, 2.0]])
            .with_row_labels(["a", "b"])
            .unwrap();
        let data = conform(y, None, None, Some(k)).unwrap();
        let k = data.k.unwrap();
        assert_eq!(k.values(), &array![[2.0, 0.5], [0.5, 1.0]]);
        assert_eq!(k.col_labels(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn kinship_axes_must_agree() {
        let y = LabeledMatrix::from(array![1.0, 2.0]);
        let k = LabeledMatrix::from(array![[1.0, 0.0], [0.0, 1.0]])
            .with_row_labels(["a", "b"])
            .unwrap()
            .with_col_labels(["b", "a"])
            .unwrap();
        assert!(matches!(
            conform(y, None, None, Some(k)),
            Err(QtlError::ShapeOrLabelMismatch(_))
        ));
    }

    #[test]
    fn repeated_labels_need_matching_counts() {
        let y = LabeledMatrix::from(array![1.0, 2.0, 3.0])
            .with_row_labels(["a", "a", "b"])
            .unwrap();
        let g = LabeledMatrix::from(array![[0.0], [1.0], [2.0], [3.0]])
            .with_row_labels(["a", "b", "a", "a"])
            .unwrap();
        assert!(matches!(
            conform(y, None, Some(g), None),
            Err(QtlError::ShapeOrLabelMismatch(_))
        ));
    }

    #[test]
    fn disjoint_labels_fail() {
        let y = LabeledMatrix::from(array![1.0]).with_row_labels(["a"]).unwrap();
        let g = LabeledMatrix::from(array![[1.0]]).with_row_labels(["z"]).unwrap();
        assert!(matches!(
            conform(y, None, Some(g), None),
            Err(QtlError::EmptyIntersection)
        ));
    }

    #[test]
    fn non_finite_values_are_reported_by_name() {
        let g = LabeledMatrix::from(array![[1.0], [f64::NAN]]);
        match assert_finite("genotype", &g) {
            Err(QtlError::NonFiniteValues(name)) => assert_eq!(name, "genotype"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
