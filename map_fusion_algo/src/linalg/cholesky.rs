//! Block-sparse Cholesky factorization
//!
//! Solves `I x = i` for the symmetric positive definite information matrix of
//! the fused map and recovers covariance blocks without ever forming the
//! dense inverse. The factorization is right-looking over block columns:
//!
//! ```text
//! for j in 0..n:
//!     L_jj = chol(W_jj)
//!     L_ij = W_ij L_jj^-T                 (i > j)
//!     W_ik -= L_ij L_kj^T                 (i >= k > j, creates fill-in)
//! ```
//!
//! Fill-in depends entirely on the block ordering, so the matrix should be
//! reordered with [`MinimumDegreeReorderer`](super::amd::MinimumDegreeReorderer)
//! before factoring.
//!
//! ## References
//! - [Direct Methods for Sparse Linear Systems](https://doi.org/10.1137/1.9780898718881)
//! - [Sparse Local Submap Joining Filter](https://doi.org/10.1109/TRO.2008.2003259)

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use super::block::{BlockMatrix, PIVOT_EPSILON};
use super::sparse_block::{SparseBlockColumn, SparseBlockMatrix};
use crate::error::{FusionError, FusionResult};

/// Configuration for the block Cholesky solver
#[derive(Debug, Clone)]
pub struct SparseCholeskyConfig {
    /// Relative pivot threshold below which a diagonal block is singular
    pub pivot_tolerance: f64,
}

impl Default for SparseCholeskyConfig {
    fn default() -> Self {
        Self {
            pivot_tolerance: PIVOT_EPSILON,
        }
    }
}

/// Factors symmetric block-sparse matrices
#[derive(Debug, Clone)]
pub struct SparseCholeskySolver {
    config: SparseCholeskyConfig,
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

fn at_block(index: usize) -> impl Fn(FusionError) -> FusionError {
    move |err| match err {
        FusionError::SingularBlock { reason, .. } => FusionError::SingularBlock { index, reason },
        other => other,
    }
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self {
            config: SparseCholeskyConfig::default(),
        }
    }

    pub fn with_config(config: SparseCholeskyConfig) -> Self {
        Self { config }
    }

    /// Compute the block lower-triangular factor `L` with `A = L Lᵀ`
    ///
    /// Fails with `SingularBlock` naming the block column whose pivot vanished.
    pub fn factor(&self, matrix: &SparseBlockMatrix) -> FusionResult<BlockCholeskyFactor> {
        let n = matrix.len();
        let mut work: Vec<BTreeMap<usize, BlockMatrix>> = (0..n)
            .map(|c| matrix.column(c).map(|(r, b)| (r, b.clone())).collect())
            .collect();
        let mut columns = Vec::with_capacity(n);

        for j in 0..n {
            let mut col = std::mem::take(&mut work[j]);
            let diag = col.remove(&j).ok_or_else(|| FusionError::SingularBlock {
                index: j,
                reason: "missing diagonal block".to_string(),
            })?;
            let ljj = diag
                .cholesky_lower(self.config.pivot_tolerance)
                .map_err(at_block(j))?;
            let ljj_inv_t = ljj.invert().map_err(at_block(j))?.transpose();

            let mut below = Vec::with_capacity(col.len());
            for (i, wij) in col {
                below.push((i, wij.multiply(&ljj_inv_t)?));
            }

            // Schur complement update of the trailing submatrix
            for (a, (i, lij)) in below.iter().enumerate() {
                for (k, lkj) in &below[..=a] {
                    let update = lij.multiply(&lkj.transpose())?;
                    match work[*k].get_mut(i) {
                        Some(existing) => existing.sub_assign(&update)?,
                        None => {
                            work[*k].insert(*i, update.negate());
                        }
                    }
                }
            }

            let mut lcol = BTreeMap::new();
            lcol.insert(j, ljj);
            lcol.extend(below);
            columns.push(lcol);
        }

        Ok(BlockCholeskyFactor {
            dims: matrix.dims().to_vec(),
            columns,
        })
    }

    /// Factor `matrix` and solve `matrix * x = rhs`
    pub fn solve(
        &self,
        matrix: &SparseBlockMatrix,
        rhs: &SparseBlockColumn,
    ) -> FusionResult<(BlockCholeskyFactor, SparseBlockColumn)> {
        let factor = self.factor(matrix)?;
        let x = factor.solve(rhs)?;
        Ok((factor, x))
    }
}

/// Block lower-triangular Cholesky factor
#[derive(Debug, Clone)]
pub struct BlockCholeskyFactor {
    dims: Vec<usize>,
    /// columns[j] = { i -> L_ij | i >= j }
    columns: Vec<BTreeMap<usize, BlockMatrix>>,
}

impl BlockCholeskyFactor {
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of stored factor blocks (diagonal included)
    pub fn factor_blocks(&self) -> usize {
        self.columns.iter().map(|c| c.len()).sum()
    }

    pub fn block(&self, row: usize, col: usize) -> Option<&BlockMatrix> {
        self.columns.get(col)?.get(&row)
    }

    /// Solve `L Lᵀ x = i` for an information vector (width 1)
    pub fn solve(&self, rhs: &SparseBlockColumn) -> FusionResult<SparseBlockColumn> {
        if rhs.width() != 1 {
            return Err(FusionError::dimension(
                "cholesky solve",
                (rhs.len(), 1),
                (rhs.len(), rhs.width()),
            ));
        }
        self.solve_block_column(rhs)
    }

    /// Solve `L Lᵀ X = B` for a block column of any width
    pub fn solve_block_column(&self, rhs: &SparseBlockColumn) -> FusionResult<SparseBlockColumn> {
        if rhs.dims() != self.dims.as_slice() {
            return Err(FusionError::dimension(
                "cholesky solve",
                (self.dims.len(), rhs.width()),
                (rhs.len(), rhs.width()),
            ));
        }
        let width = rhs.width();
        let mut y: Vec<DMatrix<f64>> = self
            .dims
            .iter()
            .enumerate()
            .map(|(i, &d)| match rhs.get(i) {
                Some(b) => b.as_dmatrix().clone(),
                None => DMatrix::zeros(d, width),
            })
            .collect();

        // Forward: L y = b
        for j in 0..self.len() {
            if y[j].iter().all(|v| *v == 0.0) {
                continue;
            }
            let ljj = self.diagonal(j)?;
            y[j] = ljj
                .solve_lower_triangular(&y[j])
                .ok_or_else(|| singular(j))?;
            for (&i, lij) in self.columns[j].range(j + 1..) {
                let update = lij.as_dmatrix() * &y[j];
                y[i] -= update;
            }
        }

        // Backward: Lᵀ x = y
        for j in (0..self.len()).rev() {
            let mut s = y[j].clone();
            for (&i, lij) in self.columns[j].range(j + 1..) {
                s -= lij.as_dmatrix().transpose() * &y[i];
            }
            let ljj = self.diagonal(j)?;
            y[j] = ljj.tr_solve_lower_triangular(&s).ok_or_else(|| singular(j))?;
        }

        let mut out = SparseBlockColumn::new(self.dims.clone(), width);
        for (i, block) in y.into_iter().enumerate() {
            out.set(i, BlockMatrix::from_dmatrix(block))?;
        }
        Ok(out)
    }

    /// Column `j` of the inverse, i.e. the covariance of every entry with entry `j`
    pub fn covariance_column(&self, j: usize) -> FusionResult<SparseBlockColumn> {
        let unit = SparseBlockColumn::unit(self.dims.clone(), j)?;
        self.solve_block_column(&unit)
    }

    /// Marginal covariance block of entry `j`
    pub fn marginal_covariance(&self, j: usize) -> FusionResult<BlockMatrix> {
        let column = self.covariance_column(j)?;
        column.get(j).cloned().ok_or(FusionError::IndexOutOfRange {
            index: j,
            len: self.len(),
        })
    }

    /// Joint covariance of the listed entries, stacked in the given order
    pub fn joint_covariance(&self, indices: &[usize]) -> FusionResult<DMatrix<f64>> {
        let mut offsets = Vec::with_capacity(indices.len());
        let mut total = 0;
        for &index in indices {
            let d = *self.dims.get(index).ok_or(FusionError::IndexOutOfRange {
                index,
                len: self.len(),
            })?;
            offsets.push(total);
            total += d;
        }

        let mut out = DMatrix::zeros(total, total);
        for (b, &jb) in indices.iter().enumerate() {
            let column = self.covariance_column(jb)?;
            for (a, &ja) in indices.iter().enumerate() {
                if let Some(block) = column.get(ja) {
                    out.view_mut((offsets[a], offsets[b]), block.shape())
                        .copy_from(block.as_dmatrix());
                }
            }
        }
        Ok(out)
    }

    /// Dense scalar `L` (tests and diagnostics)
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut offsets = vec![0];
        for d in &self.dims {
            offsets.push(offsets[offsets.len() - 1] + d);
        }
        let n = offsets[self.len()];
        let mut out = DMatrix::zeros(n, n);
        for (c, column) in self.columns.iter().enumerate() {
            for (&r, block) in column {
                out.view_mut((offsets[r], offsets[c]), block.shape())
                    .copy_from(block.as_dmatrix());
            }
        }
        out
    }

    fn diagonal(&self, j: usize) -> FusionResult<&DMatrix<f64>> {
        self.columns[j]
            .get(&j)
            .map(|b| b.as_dmatrix())
            .ok_or_else(|| singular(j))
    }
}

fn singular(index: usize) -> FusionError {
    FusionError::SingularBlock {
        index,
        reason: "zero pivot in triangular solve".to_string(),
    }
}
