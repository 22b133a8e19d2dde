//! Candidate-by-environment interaction designs.

use crate::error::QtlError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis, Zip, s};

/// Writes the Khatri–Rao product of `g` with `e` into `out`: column `j` of
/// `out` is `g ∘ e[:, j]`.
pub fn khatri_rao_into(
    g: ArrayView1<f64>,
    e: ArrayView2<f64>,
    mut out: ArrayViewMut2<f64>,
) -> Result<(), QtlError> {
    if e.nrows() != g.len() || out.dim() != e.dim() {
        return Err(QtlError::ShapeOrLabelMismatch(format!(
            "Khatri-Rao product of a length-{} column with a {}x{} design cannot fill a {}x{} buffer",
            g.len(),
            e.nrows(),
            e.ncols(),
            out.nrows(),
            out.ncols()
        )));
    }
    Zip::from(out.columns_mut())
        .and(e.columns())
        .for_each(|mut column, env| {
            Zip::from(&mut column)
                .and(&g)
                .and(&env)
                .for_each(|o, &gi, &ei| *o = gi * ei);
        });
    Ok(())
}

/// Lifts a trait-level design (p×k) to sample level (np×k): row `t·n + i` is `e[t, :]`.
pub fn expand_env(e: ArrayView2<f64>, nsamples: usize) -> Array2<f64> {
    let (p, k) = e.dim();
    let mut expanded = Array2::zeros((p * nsamples, k));
    for (t, env_row) in e.axis_iter(Axis(0)).enumerate() {
        for mut row in expanded
            .slice_mut(s![t * nsamples..(t + 1) * nsamples, ..])
            .axis_iter_mut(Axis(0))
        {
            row.assign(&env_row);
        }
    }
    expanded
}

/// Reusable builder of sample-level interaction designs for one env design.
///
/// For candidates `G[:, l]`, `l = 0..r`, the design holds one `k`-column block
/// per candidate (candidate-major), block `l` being the Khatri–Rao product of
/// the candidate tiled over traits with the expanded env design.
#[derive(Debug, Clone)]
pub struct InteractionDesign {
    env: Array2<f64>,
    nsamples: usize,
    tiled: Array1<f64>,
    buffer: Array2<f64>,
}

impl InteractionDesign {
    /// `env` is the trait-level design (p×k).
    pub fn new(env: ArrayView2<f64>, nsamples: usize) -> Self {
        let expanded = expand_env(env, nsamples);
        let rows = expanded.nrows();
        Self {
            env: expanded,
            nsamples,
            tiled: Array1::zeros(rows),
            buffer: Array2::zeros((rows, 0)),
        }
    }

    pub fn nenv(&self) -> usize {
        self.env.ncols()
    }

    /// Fills the design for candidates `g` (n×r) and returns a view of it.
    pub fn build(&mut self, g: ArrayView2<f64>) -> Result<ArrayView2<'_, f64>, QtlError> {
        let n = self.nsamples;
        if g.nrows() != n {
            return Err(QtlError::ShapeOrLabelMismatch(format!(
                "candidate columns have {} samples, expected {}",
                g.nrows(),
                n
            )));
        }
        let k = self.nenv();
        let r = g.ncols();
        if self.buffer.ncols() != r * k {
            self.buffer = Array2::zeros((self.env.nrows(), r * k));
        }
        let ntraits = if n == 0 { 0 } else { self.env.nrows() / n };
        for (l, candidate) in g.axis_iter(Axis(1)).enumerate() {
            for t in 0..ntraits {
                self.tiled
                    .slice_mut(s![t * n..(t + 1) * n])
                    .assign(&candidate);
            }
            khatri_rao_into(
                self.tiled.view(),
                self.env.view(),
                self.buffer.slice_mut(s![.., l * k..(l + 1) * k]),
            )?;
        }
        Ok(self.buffer.view())
    }
}
