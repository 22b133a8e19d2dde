use super::SolverError;
use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate, s};
use ndarray_linalg::{Eigh, UPLO};

/// Relative threshold below which an eigenvalue of a Gram matrix is treated as zero
/// when forming a pseudo-inverse.
const PINV_RELATIVE_TOLERANCE: f64 = 1e-10;

/// Economic eigendecomposition `K = Q0 diag(S0) Q0ᵀ` of a symmetric positive
/// semi-definite matrix, with `Q1` spanning the remaining (null) eigenspace.
///
/// `s0` is sorted in descending order and strictly positive.
#[derive(Debug, Clone)]
pub struct EconomicQs {
    pub q0: Array2<f64>,
    pub q1: Array2<f64>,
    pub s0: Array1<f64>,
}

impl EconomicQs {
    pub fn nsamples(&self) -> usize {
        self.q0.nrows()
    }

    pub fn rank(&self) -> usize {
        self.s0.len()
    }

    /// The full orthonormal basis `[Q0 Q1]`, n×n.
    pub fn rotation(&self) -> Array2<f64> {
        concatenate(Axis(1), &[self.q0.view(), self.q1.view()])
            .unwrap_or_else(|_| Array2::zeros((self.nsamples(), 0)))
    }

    /// Eigenvalues aligned with [`EconomicQs::rotation`]: `S0` followed by zeros.
    pub fn eigenvalues(&self) -> Array1<f64> {
        let mut values = Array1::zeros(self.nsamples());
        values.slice_mut(s![..self.rank()]).assign(&self.s0);
        values
    }

    /// Reconstructs the dense matrix `Q0 diag(S0) Q0ᵀ`.
    pub fn kinship(&self) -> Array2<f64> {
        let scaled = &self.q0 * &self.s0.view().insert_axis(Axis(0));
        scaled.dot(&self.q0.t())
    }

    /// The factor `G = Q0 diag(√S0)` with `K = G Gᵀ`.
    pub fn sqrt_factor(&self) -> Array2<f64> {
        let roots = self.s0.mapv(f64::sqrt);
        &self.q0 * &roots.view().insert_axis(Axis(0))
    }
}

/// Splits the spectrum of `k` into its positive part and its null space.
///
/// Eigenvalues at or below `tolerance * max_eigenvalue` are assigned to `Q1`.
pub fn economic_qs(k: ArrayView2<f64>, tolerance: f64) -> Result<EconomicQs, SolverError> {
    let n = k.nrows();
    if k.ncols() != n {
        return Err(SolverError::DimensionMismatch {
            context: "economic eigendecomposition (square matrix)",
            expected: n,
            found: k.ncols(),
        });
    }

    let (values, vectors) = k.eigh(UPLO::Lower)?;
    let max_value = values.iter().cloned().fold(0.0_f64, f64::max);
    let threshold = tolerance * max_value;

    // eigh returns ascending eigenvalues; walk them from the largest down.
    let mut positive = Vec::new();
    let mut null = Vec::new();
    for j in (0..n).rev() {
        if values[j] > threshold && values[j] > 0.0 {
            positive.push(j);
        } else {
            null.push(j);
        }
    }

    let q0 = vectors.select(Axis(1), &positive);
    let q1 = vectors.select(Axis(1), &null);
    let s0 = Array1::from_iter(positive.iter().map(|&j| values[j]));

    log::debug!(
        "Economic eigendecomposition: {} positive eigenvalues, {} in the null space.",
        s0.len(),
        null.len()
    );

    Ok(EconomicQs { q0, q1, s0 })
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix.
pub fn pinvh(a: &Array2<f64>) -> Result<Array2<f64>, SolverError> {
    let dim = a.nrows();
    if dim == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    let (values, vectors) = a.eigh(UPLO::Lower)?;
    let max_abs = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let threshold = PINV_RELATIVE_TOLERANCE * max_abs.max(f64::MIN_POSITIVE);
    let inverted = values.mapv(|v| if v.abs() > threshold { 1.0 / v } else { 0.0 });
    let scaled = &vectors * &inverted.view().insert_axis(Axis(0));
    Ok(scaled.dot(&vectors.t()))
}

/// Square roots of the diagonal of a covariance matrix, clamped at zero.
pub fn diagonal_sqrt(cov: &Array2<f64>) -> Array1<f64> {
    cov.diag().mapv(|v| v.max(0.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn economic_qs_reconstructs_low_rank_kinship() {
        let g = array![[1.0, 0.0], [1.0, 1.0], [0.0, 2.0], [1.0, -1.0]];
        let k = g.dot(&g.t());
        let qs = economic_qs(k.view(), 1e-9).unwrap();

        assert_eq!(qs.rank(), 2);
        assert_eq!(qs.q1.ncols(), 2);
        assert!(qs.s0[0] >= qs.s0[1]);

        let rebuilt = qs.kinship();
        for (a, b) in rebuilt.iter().zip(k.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }

        let factor = qs.sqrt_factor();
        let from_factor = factor.dot(&factor.t());
        for (a, b) in from_factor.iter().zip(k.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
    }

    #[test]
    fn rotation_is_orthonormal() {
        let k = array![[2.0, 1.0, 0.0], [1.0, 2.0, 1.0], [0.0, 1.0, 2.0]];
        let qs = economic_qs(k.view(), 1e-9).unwrap();
        let q = qs.rotation();
        let identity = q.t().dot(&q);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(identity[(i, j)], expected, epsilon = 1e-10);
            }
        }
        assert_eq!(qs.eigenvalues().len(), 3);
    }

    #[test]
    fn pinvh_inverts_regular_and_drops_null_directions() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = pinvh(&a).unwrap();
        let product = a.dot(&inv);
        assert_abs_diff_eq!(product[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(product[(0, 1)], 0.0, epsilon = 1e-12);

        let singular = array![[1.0, 1.0], [1.0, 1.0]];
        let pinv = pinvh(&singular).unwrap();
        assert_abs_diff_eq!(pinv[(0, 0)], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(pinv[(0, 1)], 0.25, epsilon = 1e-12);
    }
}
