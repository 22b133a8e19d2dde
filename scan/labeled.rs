//! Dense matrices whose two axes carry a name and optional labels.

use crate::error::QtlError;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::collections::VecDeque;

/// A dense `f64` matrix with a named row axis and a named column axis.
///
/// Labels are optional per axis. An axis without labels is addressed by the
/// positional identifiers `"{dim}{i}"`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    values: Array2<f64>,
    dims: [String; 2],
    labels: [Option<Vec<String>>; 2],
}

impl LabeledMatrix {
    pub fn new(values: Array2<f64>) -> Self {
        Self {
            values,
            dims: ["dim_0".to_string(), "dim_1".to_string()],
            labels: [None, None],
        }
    }

    /// Renames the two axes. Labels are kept.
    pub fn with_dims(mut self, row: &str, col: &str) -> Self {
        self.dims = [row.to_string(), col.to_string()];
        self
    }

    pub fn with_row_labels<I, S>(self, labels: I) -> Result<Self, QtlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_labels(Axis(0), labels)
    }

    pub fn with_col_labels<I, S>(self, labels: I) -> Result<Self, QtlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_labels(Axis(1), labels)
    }

    fn with_labels<I, S>(mut self, axis: Axis, labels: I) -> Result<Self, QtlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        let len = self.values.len_of(axis);
        if labels.len() != len {
            return Err(QtlError::ShapeOrLabelMismatch(format!(
                "{} labels were given for the '{}' axis of length {}",
                labels.len(),
                self.dims[axis.index()],
                len
            )));
        }
        self.labels[axis.index()] = Some(labels);
        Ok(self)
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn into_values(self) -> Array2<f64> {
        self.values
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn dim_name(&self, axis: Axis) -> &str {
        &self.dims[axis.index()]
    }

    pub fn is_labeled(&self, axis: Axis) -> bool {
        self.labels[axis.index()].is_some()
    }

    /// Explicit labels of `axis`, if any.
    pub fn labels(&self, axis: Axis) -> Option<&[String]> {
        self.labels[axis.index()].as_deref()
    }

    /// Explicit labels, or the positional identifiers of an unlabelled axis.
    pub fn labels_or_default(&self, axis: Axis) -> Vec<String> {
        match self.labels(axis) {
            Some(labels) => labels.to_vec(),
            None => positional_labels(self.dim_name(axis), self.values.len_of(axis)),
        }
    }

    pub fn row_labels(&self) -> Vec<String> {
        self.labels_or_default(Axis(0))
    }

    pub fn col_labels(&self) -> Vec<String> {
        self.labels_or_default(Axis(1))
    }

    /// Reorders `axis` so that its labels read `labels`.
    ///
    /// Repeated labels are matched by occurrence: the k-th request for a label
    /// takes the k-th position holding it.
    pub fn reindex(&self, axis: Axis, labels: &[String]) -> Result<Self, QtlError> {
        let current = self.labels_or_default(axis);
        let mut positions: AHashMap<&str, VecDeque<usize>> = AHashMap::new();
        for (i, label) in current.iter().enumerate() {
            positions.entry(label.as_str()).or_default().push_back(i);
        }

        let mut order = Vec::with_capacity(labels.len());
        for label in labels {
            let next = positions
                .get_mut(label.as_str())
                .and_then(|queue| queue.pop_front())
                .ok_or_else(|| {
                    QtlError::ShapeOrLabelMismatch(format!(
                        "label '{}' is not available on the '{}' axis",
                        label,
                        self.dim_name(axis)
                    ))
                })?;
            order.push(next);
        }

        let mut reindexed = Self {
            values: self.values.select(axis, &order),
            dims: self.dims.clone(),
            labels: self.labels.clone(),
        };
        reindexed.labels[axis.index()] = Some(labels.to_vec());
        Ok(reindexed)
    }

    /// Multiset intersection of this matrix's `axis` labels with `other`'s, in this
    /// matrix's order.
    pub fn intersect(&self, other: &LabeledMatrix, axis: Axis) -> Vec<String> {
        multiset_intersection(&self.labels_or_default(axis), &other.labels_or_default(axis))
    }

    /// Keeps the first `n` positions of `axis`.
    pub fn truncate(&self, axis: Axis, n: usize) -> Self {
        let order: Vec<usize> = (0..n.min(self.values.len_of(axis))).collect();
        let mut truncated = Self {
            values: self.values.select(axis, &order),
            dims: self.dims.clone(),
            labels: self.labels.clone(),
        };
        if let Some(labels) = truncated.labels[axis.index()].as_mut() {
            labels.truncate(order.len());
        }
        truncated
    }

    /// Concatenates the columns of `self` and `other`, which must share their rows.
    pub fn concat_columns(&self, other: &LabeledMatrix) -> Result<Self, QtlError> {
        if self.nrows() != other.nrows() {
            return Err(QtlError::ShapeOrLabelMismatch(format!(
                "cannot concatenate matrices with {} and {} rows",
                self.nrows(),
                other.nrows()
            )));
        }
        let values = ndarray::concatenate(Axis(1), &[self.view(), other.view()])
            .map_err(|e| QtlError::ShapeOrLabelMismatch(e.to_string()))?;
        let mut labels = self.col_labels();
        labels.extend(other.col_labels());
        Ok(Self {
            values,
            dims: self.dims.clone(),
            labels: [self.labels[0].clone(), Some(labels)],
        })
    }
}

/// Identifiers `"{dim}{i}"` for an unlabelled axis.
pub fn positional_labels(dim: &str, len: usize) -> Vec<String> {
    (0..len).map(|i| format!("{dim}{i}")).collect()
}

/// Labels of `a` that also occur in `b`, each kept at most as many times as in
/// `b`, in `a`'s order.
pub fn multiset_intersection(a: &[String], b: &[String]) -> Vec<String> {
    let mut available: AHashMap<&str, usize> = AHashMap::new();
    for label in b {
        *available.entry(label.as_str()).or_insert(0) += 1;
    }
    let mut kept = Vec::new();
    for label in a {
        if let Some(count) = available.get_mut(label.as_str()) {
            if *count > 0 {
                *count -= 1;
                kept.push(label.clone());
            }
        }
    }
    kept
}

impl From<Array2<f64>> for LabeledMatrix {
    fn from(values: Array2<f64>) -> Self {
        Self::new(values)
    }
}

/// A vector becomes a single column.
impl From<Array1<f64>> for LabeledMatrix {
    fn from(values: Array1<f64>) -> Self {
        Self::new(values.insert_axis(Axis(1)))
    }
}

impl From<Array2<i64>> for LabeledMatrix {
    fn from(values: Array2<i64>) -> Self {
        Self::new(values.mapv(|v| v as f64))
    }
}

impl From<Array1<i64>> for LabeledMatrix {
    fn from(values: Array1<i64>) -> Self {
        Self::new(values.mapv(|v| v as f64).insert_axis(Axis(1)))
    }
}

impl From<Vec<f64>> for LabeledMatrix {
    fn from(values: Vec<f64>) -> Self {
        Array1::from(values).into()
    }
}
