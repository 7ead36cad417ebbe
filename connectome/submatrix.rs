//! # Sliding Submatrix Inverses
//!
//! For the feature `p` currently being optimized, the solver needs, for every
//! subject, the inverse of the precision matrix with row and column `p`
//! removed. Inverting from scratch for every feature would cost `O(n^4)` per
//! sweep. Instead the workspace inverts directly once, at feature 0, and then
//! slides the excluded index forward one feature at a time: moving from `p - 1`
//! to `p` replaces exactly one row and one column of the submatrix, and each
//! replacement is a rank-1 change absorbed with the Sherman-Morrison-Woodbury
//! identity.

use crate::matrix::{invert, is_spd, max_abs_difference, principal_submatrix};
use crate::solver::SolverError;
use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, s};

const SUBMATRIX_CHECK_TOLERANCE: f64 = 1.5e-7;
const INVERSE_CHECK_TOLERANCE: f64 = 1e-10;
const SYMMETRY_CHECK_TOLERANCE: f64 = 1e-12;

/// Per-subject submatrices of the precision stack and their inverses.
///
/// A workspace belongs to exactly one solver invocation; it is mutated in
/// place and must never be shared between concurrent fits.
#[derive(Debug, Clone)]
pub struct SubmatrixWorkspace {
    submatrices: Vec<Array2<f64>>,
    inverses: Vec<Array2<f64>>,
    excluded: usize,
    row: Array1<f64>,
    column: Array1<f64>,
    debug: bool,
}

impl SubmatrixWorkspace {
    /// Builds the workspace with feature 0 excluded, inverting every
    /// submatrix directly.
    pub fn initialize(omega: ArrayView3<f64>, debug: bool) -> Result<Self, SolverError> {
        let n_features = omega.shape()[0];
        if n_features < 2 {
            return Err(SolverError::TooFewFeatures(n_features));
        }
        let n_subjects = omega.shape()[2];
        let mut workspace = Self {
            submatrices: Vec::with_capacity(n_subjects),
            inverses: Vec::with_capacity(n_subjects),
            excluded: 0,
            row: Array1::zeros(n_features - 1),
            column: Array1::zeros(n_features - 1),
            debug,
        };
        workspace.reset(omega)?;
        Ok(workspace)
    }

    /// Re-derives every inverse from scratch with feature 0 excluded.
    ///
    /// Called at the start of each sweep so that rounding drift from the
    /// incremental corrections never accumulates across sweeps.
    pub fn reset(&mut self, omega: ArrayView3<f64>) -> Result<(), SolverError> {
        self.submatrices.clear();
        self.inverses.clear();
        for (k, full) in omega.axis_iter(Axis(2)).enumerate() {
            let submatrix = full.slice(s![1.., 1..]).to_owned();
            let mut inverse = invert(submatrix.view())
                .map_err(|source| SolverError::SingularSubmatrix { subject: k, source })?;
            symmetrize(&mut inverse);
            if self.debug {
                check_pair(k, full, 0, submatrix.view(), inverse.view())?;
            }
            self.submatrices.push(submatrix);
            self.inverses.push(inverse);
        }
        self.excluded = 0;
        Ok(())
    }

    /// Moves the excluded feature from `excluded()` to `to`, which must be the
    /// next feature.
    pub fn slide(&mut self, omega: ArrayView3<f64>, to: usize) -> Result<(), SolverError> {
        let n_features = omega.shape()[0];
        if to != self.excluded + 1 || to >= n_features {
            return Err(SolverError::InvalidSlide {
                from: self.excluded,
                to,
            });
        }
        let n = to - 1;

        for (k, full) in omega.axis_iter(Axis(2)).enumerate() {
            // Row and column `n` of `full`, skipping the entry of feature `to`.
            for i in 0..=n {
                self.column[i] = full[[i, n]];
                self.row[i] = full[[n, i]];
            }
            for i in (n + 1)..(n_features - 1) {
                self.column[i] = full[[i + 1, n]];
                self.row[i] = full[[n, i + 1]];
            }

            replace_row_and_column(
                &mut self.submatrices[k],
                &mut self.inverses[k],
                n,
                self.row.view(),
                self.column.view(),
            );

            if self.debug {
                check_pair(
                    k,
                    full,
                    to,
                    self.submatrices[k].view(),
                    self.inverses[k].view(),
                )?;
            }
        }

        self.excluded = to;
        Ok(())
    }

    /// Feature currently removed from every submatrix.
    pub fn excluded(&self) -> usize {
        self.excluded
    }

    pub fn n_subjects(&self) -> usize {
        self.inverses.len()
    }

    pub fn submatrix(&self, subject: usize) -> ArrayView2<'_, f64> {
        self.submatrices[subject].view()
    }

    pub fn inverse(&self, subject: usize) -> ArrayView2<'_, f64> {
        self.inverses[subject].view()
    }
}

/// Overwrites row `n` of `sub` with `row`, then column `n` with `column`,
/// keeping `inv` equal to `sub^-1` through two rank-1 corrections.
fn replace_row_and_column(
    sub: &mut Array2<f64>,
    inv: &mut Array2<f64>,
    n: usize,
    row: ArrayView1<f64>,
    column: ArrayView1<f64>,
) {
    // sub + e_n * delta_row^T
    let delta_row = &row - &sub.row(n);
    let inv_column = inv.column(n).to_owned();
    let scaled_column = &inv_column / (1.0 + delta_row.dot(&inv_column));
    let projected_row = delta_row.dot(&*inv);
    general_mat_mul(
        -1.0,
        &scaled_column.view().insert_axis(Axis(1)),
        &projected_row.view().insert_axis(Axis(0)),
        1.0,
        inv,
    );
    sub.row_mut(n).assign(&row);

    // sub + delta_column * e_n^T
    let delta_column = &column - &sub.column(n);
    let inv_row = inv.row(n).to_owned();
    let scaled_row = &inv_row / (1.0 + inv_row.dot(&delta_column));
    let projected_column = inv.dot(&delta_column);
    general_mat_mul(
        -1.0,
        &projected_column.view().insert_axis(Axis(1)),
        &scaled_row.view().insert_axis(Axis(0)),
        1.0,
        inv,
    );
    sub.column_mut(n).assign(&column);

    symmetrize(inv);
}

fn symmetrize(matrix: &mut Array2<f64>) {
    let transposed = matrix.t().to_owned();
    *matrix += &transposed;
    *matrix *= 0.5;
}

fn check_pair(
    subject: usize,
    full: ArrayView2<f64>,
    excluded: usize,
    submatrix: ArrayView2<f64>,
    inverse: ArrayView2<f64>,
) -> Result<(), SolverError> {
    let expected = principal_submatrix(full, excluded);
    let mismatch = max_abs_difference(expected.view(), submatrix);
    if mismatch > SUBMATRIX_CHECK_TOLERANCE {
        return Err(SolverError::DebugCheckFailed(format!(
            "subject {subject}: submatrix without feature {excluded} deviates from the precision matrix by {mismatch:.3e}"
        )));
    }

    let product = submatrix.dot(&inverse);
    let identity = Array2::<f64>::eye(product.nrows());
    let residual = max_abs_difference(product.view(), identity.view());
    if residual > INVERSE_CHECK_TOLERANCE {
        return Err(SolverError::DebugCheckFailed(format!(
            "subject {subject}: submatrix inverse residual {residual:.3e} at excluded feature {excluded}"
        )));
    }

    if !is_spd(inverse, SYMMETRY_CHECK_TOLERANCE) {
        return Err(SolverError::DebugCheckFailed(format!(
            "subject {subject}: submatrix inverse at excluded feature {excluded} is not symmetric positive definite"
        )));
    }
    Ok(())
}
