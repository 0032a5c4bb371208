//! Symmetric block-sparse matrices and block vectors
//!
//! The information matrix of the fused map is symmetric and very sparse: a pose
//! is only coupled to the poses and features of the submaps that touch it. The
//! matrix is addressed by block indices (one block per state entry, 3 rows for
//! a pose and 2 for a feature) and stores only the populated blocks of the
//! lower triangle. Reading an upper block returns the transpose of its mirror.
//!
//! ```text
//! columns[j] = { i -> A_ij | i >= j }
//! ```
//!
//! An absent block reads as `None` and is treated as zero everywhere; two
//! matrices compare equal when every block present in either one matches
//! (absent and explicit-zero blocks are equivalent).

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector};
use sprs::{CsMat, TriMat};

use super::amd::Permutation;
use super::block::BlockMatrix;
use crate::error::{FusionError, FusionResult};

fn scalar_offsets(dims: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(dims.len() + 1);
    let mut acc = 0;
    offsets.push(0);
    for d in dims {
        acc += d;
        offsets.push(acc);
    }
    offsets
}

/// Block column vector sharing the blocking of a `SparseBlockMatrix`
///
/// Width 1 is an information vector; width d holds d right-hand sides at once.
#[derive(Debug, Clone)]
pub struct SparseBlockColumn {
    dims: Vec<usize>,
    width: usize,
    blocks: BTreeMap<usize, BlockMatrix>,
}

impl SparseBlockColumn {
    pub fn new(dims: Vec<usize>, width: usize) -> Self {
        Self {
            dims,
            width,
            blocks: BTreeMap::new(),
        }
    }

    /// Identity block at `index`, zero elsewhere (width = dim of that block)
    pub fn unit(dims: Vec<usize>, index: usize) -> FusionResult<Self> {
        let d = *dims.get(index).ok_or(FusionError::IndexOutOfRange {
            index,
            len: dims.len(),
        })?;
        let mut column = Self::new(dims, d);
        column.set(index, BlockMatrix::identity(d))?;
        Ok(column)
    }

    /// Split a dense vector into blocks
    pub fn from_dvector(dims: Vec<usize>, values: &DVector<f64>) -> FusionResult<Self> {
        let offsets = scalar_offsets(&dims);
        let total = offsets[dims.len()];
        if values.len() != total {
            return Err(FusionError::dimension(
                "from_dvector",
                (total, 1),
                (values.len(), 1),
            ));
        }
        let mut column = Self::new(dims, 1);
        for i in 0..column.dims.len() {
            let d = column.dims[i];
            let block = DMatrix::from_fn(d, 1, |r, _| values[offsets[i] + r]);
            column.blocks.insert(i, BlockMatrix::from_dmatrix(block));
        }
        Ok(column)
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    fn check(&self, index: usize, block: &BlockMatrix) -> FusionResult<()> {
        let d = *self.dims.get(index).ok_or(FusionError::IndexOutOfRange {
            index,
            len: self.dims.len(),
        })?;
        if block.shape() != (d, self.width) {
            return Err(FusionError::dimension(
                "block column",
                (d, self.width),
                block.shape(),
            ));
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&BlockMatrix> {
        self.blocks.get(&index)
    }

    pub fn set(&mut self, index: usize, block: BlockMatrix) -> FusionResult<()> {
        self.check(index, &block)?;
        self.blocks.insert(index, block);
        Ok(())
    }

    /// Accumulate into a block, creating it if absent
    pub fn add_block(&mut self, index: usize, block: &BlockMatrix) -> FusionResult<()> {
        self.check(index, block)?;
        match self.blocks.get_mut(&index) {
            Some(existing) => existing.add_assign(block)?,
            None => {
                self.blocks.insert(index, block.clone());
            }
        }
        Ok(())
    }

    pub fn add_assign(&mut self, other: &SparseBlockColumn) -> FusionResult<()> {
        if self.dims != other.dims || self.width != other.width {
            return Err(FusionError::dimension(
                "column add",
                (self.dims.len(), self.width),
                (other.dims.len(), other.width),
            ));
        }
        for (&i, block) in &other.blocks {
            self.add_block(i, block)?;
        }
        Ok(())
    }

    /// Append empty blocks of the given dimensions
    pub fn enlarge(&mut self, new_dims: &[usize]) {
        self.dims.extend_from_slice(new_dims);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BlockMatrix)> {
        self.blocks.iter().map(|(&i, b)| (i, b))
    }

    /// Dense scalar expansion (absent blocks become zeros)
    pub fn to_dmatrix(&self) -> DMatrix<f64> {
        let offsets = scalar_offsets(&self.dims);
        let mut out = DMatrix::zeros(offsets[self.dims.len()], self.width);
        for (&i, block) in &self.blocks {
            out.view_mut((offsets[i], 0), block.shape())
                .copy_from(block.as_dmatrix());
        }
        out
    }

    /// First column of the dense expansion
    pub fn to_dvector(&self) -> DVector<f64> {
        let dense = self.to_dmatrix();
        if dense.ncols() == 0 {
            return DVector::zeros(dense.nrows());
        }
        dense.column(0).into_owned()
    }

    /// Reorder blocks so that new block `k` is old block `order[k]`
    pub fn permuted(&self, permutation: &Permutation) -> FusionResult<SparseBlockColumn> {
        if permutation.len() != self.dims.len() {
            return Err(FusionError::InvalidPermutation(format!(
                "permutation over {} indices applied to {} blocks",
                permutation.len(),
                self.dims.len()
            )));
        }
        let dims = permutation.order().iter().map(|&old| self.dims[old]).collect();
        let mut out = SparseBlockColumn::new(dims, self.width);
        for (&old, block) in &self.blocks {
            out.blocks.insert(permutation.new_index(old), block.clone());
        }
        Ok(out)
    }
}

impl PartialEq for SparseBlockColumn {
    fn eq(&self, other: &Self) -> bool {
        if self.dims != other.dims || self.width != other.width {
            return false;
        }
        let keys: BTreeSet<usize> = self.blocks.keys().chain(other.blocks.keys()).copied().collect();
        keys.into_iter().all(|i| match (self.blocks.get(&i), other.blocks.get(&i)) {
            (Some(a), Some(b)) => a == b,
            (Some(a), None) | (None, Some(a)) => a.is_zero(0.0),
            (None, None) => true,
        })
    }
}

/// Statistics about the block structure of a matrix
#[derive(Debug, Clone)]
pub struct SparsityStats {
    pub blocks: usize,
    pub scalar_dim: usize,
    pub nnz: usize,
    pub density: f64,
}

impl std::fmt::Display for SparsityStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} blocks ({}x{} scalar), {} non-zeros ({:.2}% dense)",
            self.blocks,
            self.scalar_dim,
            self.scalar_dim,
            self.nnz,
            self.density * 100.0
        )
    }
}

/// Symmetric block-sparse matrix storing its lower triangle column by column
#[derive(Debug, Clone)]
pub struct SparseBlockMatrix {
    dims: Vec<usize>,
    columns: Vec<BTreeMap<usize, BlockMatrix>>,
}

impl SparseBlockMatrix {
    pub fn new(dims: Vec<usize>) -> Self {
        let columns = vec![BTreeMap::new(); dims.len()];
        Self { dims, columns }
    }

    /// Number of block rows (= block columns)
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn block_dim(&self, index: usize) -> Option<usize> {
        self.dims.get(index).copied()
    }

    pub fn scalar_dim(&self) -> usize {
        self.dims.iter().sum()
    }

    pub fn offsets(&self) -> Vec<usize> {
        scalar_offsets(&self.dims)
    }

    /// Append `new_dims.len()` empty rows/columns; existing blocks are untouched
    pub fn enlarge(&mut self, new_dims: &[usize]) {
        self.dims.extend_from_slice(new_dims);
        self.columns
            .extend(std::iter::repeat_with(BTreeMap::new).take(new_dims.len()));
    }

    fn check(&self, row: usize, col: usize, block: &BlockMatrix) -> FusionResult<()> {
        let len = self.dims.len();
        for index in [row, col] {
            if index >= len {
                return Err(FusionError::IndexOutOfRange { index, len });
            }
        }
        let expected = (self.dims[row], self.dims[col]);
        if block.shape() != expected {
            return Err(FusionError::dimension("sparse block", expected, block.shape()));
        }
        Ok(())
    }

    /// Write block (row, col); the mirror block is implied by symmetry
    pub fn set(&mut self, row: usize, col: usize, block: BlockMatrix) -> FusionResult<()> {
        self.check(row, col, &block)?;
        if row >= col {
            self.columns[col].insert(row, block);
        } else {
            self.columns[row].insert(col, block.transpose());
        }
        Ok(())
    }

    /// Accumulate into block (row, col), creating it if absent
    pub fn add_block(&mut self, row: usize, col: usize, block: &BlockMatrix) -> FusionResult<()> {
        self.check(row, col, block)?;
        let (r, c, stored) = if row >= col {
            (row, col, block.clone())
        } else {
            (col, row, block.transpose())
        };
        match self.columns[c].get_mut(&r) {
            Some(existing) => existing.add_assign(&stored)?,
            None => {
                self.columns[c].insert(r, stored);
            }
        }
        Ok(())
    }

    /// Read block (row, col); `None` means the block is zero
    pub fn get(&self, row: usize, col: usize) -> Option<BlockMatrix> {
        if row >= col {
            self.columns.get(col)?.get(&row).cloned()
        } else {
            self.columns.get(row)?.get(&col).map(|b| b.transpose())
        }
    }

    /// Borrow a stored lower-triangle block (`row >= col`)
    pub fn lower(&self, row: usize, col: usize) -> Option<&BlockMatrix> {
        if row < col {
            return None;
        }
        self.columns.get(col)?.get(&row)
    }

    /// Stored blocks of column `col` (rows >= col, ascending)
    pub fn column(&self, col: usize) -> impl Iterator<Item = (usize, &BlockMatrix)> {
        self.columns[col].iter().map(|(&r, b)| (r, b))
    }

    /// All stored blocks as (row, col, block) with row >= col
    pub fn lower_blocks(&self) -> impl Iterator<Item = (usize, usize, &BlockMatrix)> {
        self.columns
            .iter()
            .enumerate()
            .flat_map(|(c, col)| col.iter().map(move |(&r, b)| (r, c, b)))
    }

    /// Number of stored lower-triangle blocks
    pub fn block_count(&self) -> usize {
        self.columns.iter().map(|c| c.len()).sum()
    }

    /// Blockwise sum with an equally blocked matrix
    pub fn add_assign(&mut self, other: &SparseBlockMatrix) -> FusionResult<()> {
        if self.dims != other.dims {
            return Err(FusionError::dimension(
                "sparse add",
                (self.len(), self.len()),
                (other.len(), other.len()),
            ));
        }
        for (r, c, block) in other.lower_blocks() {
            self.add_block(r, c, block)?;
        }
        Ok(())
    }

    /// Off-diagonal block adjacency (symmetric), used for fill-reducing ordering
    pub fn adjacency(&self) -> Vec<BTreeSet<usize>> {
        let mut adjacency = vec![BTreeSet::new(); self.len()];
        for (r, c, _) in self.lower_blocks() {
            if r != c {
                adjacency[r].insert(c);
                adjacency[c].insert(r);
            }
        }
        adjacency
    }

    /// Submatrix over the sorted block indices in `keep`, compacted to 0..keep.len()
    pub fn trim(&self, keep: &[usize]) -> FusionResult<SparseBlockMatrix> {
        for pair in keep.windows(2) {
            if pair[0] >= pair[1] {
                return Err(FusionError::InvalidPermutation(format!(
                    "trim indices must be strictly increasing, got {} then {}",
                    pair[0], pair[1]
                )));
            }
        }
        if let Some(&last) = keep.last() {
            if last >= self.len() {
                return Err(FusionError::IndexOutOfRange {
                    index: last,
                    len: self.len(),
                });
            }
        }

        let remap: BTreeMap<usize, usize> =
            keep.iter().enumerate().map(|(new, &old)| (old, new)).collect();
        let mut out = SparseBlockMatrix::new(keep.iter().map(|&i| self.dims[i]).collect());
        for &old_col in keep {
            let new_col = remap[&old_col];
            for (r, block) in self.column(old_col) {
                if let Some(&new_row) = remap.get(&r) {
                    out.columns[new_col].insert(new_row, block.clone());
                }
            }
        }
        Ok(out)
    }

    /// Reorder so that new block `k` is old block `order[k]`
    pub fn permuted(&self, permutation: &Permutation) -> FusionResult<SparseBlockMatrix> {
        if permutation.len() != self.len() {
            return Err(FusionError::InvalidPermutation(format!(
                "permutation over {} indices applied to {} blocks",
                permutation.len(),
                self.len()
            )));
        }
        let dims = permutation.order().iter().map(|&old| self.dims[old]).collect();
        let mut out = SparseBlockMatrix::new(dims);
        for (r, c, block) in self.lower_blocks() {
            out.set(permutation.new_index(r), permutation.new_index(c), block.clone())?;
        }
        Ok(out)
    }

    /// Product with a block column of matching blocking
    pub fn multiply_column(&self, x: &SparseBlockColumn) -> FusionResult<SparseBlockColumn> {
        if x.dims() != self.dims.as_slice() {
            return Err(FusionError::dimension(
                "sparse multiply",
                (self.len(), x.width()),
                (x.len(), x.width()),
            ));
        }
        let mut out = SparseBlockColumn::new(self.dims.clone(), x.width());
        for (r, c, block) in self.lower_blocks() {
            if let Some(xc) = x.get(c) {
                out.add_block(r, &block.multiply(xc)?)?;
            }
            if r != c {
                if let Some(xr) = x.get(r) {
                    out.add_block(c, &block.transpose().multiply(xr)?)?;
                }
            }
        }
        Ok(out)
    }

    /// Dense symmetric scalar expansion
    pub fn to_dense(&self) -> DMatrix<f64> {
        let offsets = self.offsets();
        let n = offsets[self.len()];
        let mut out = DMatrix::zeros(n, n);
        for (r, c, block) in self.lower_blocks() {
            out.view_mut((offsets[r], offsets[c]), block.shape())
                .copy_from(block.as_dmatrix());
            if r != c {
                out.view_mut((offsets[c], offsets[r]), (block.cols(), block.rows()))
                    .copy_from(&block.as_dmatrix().transpose());
            }
        }
        out
    }

    /// Scalar CSC expansion of the full symmetric matrix
    pub fn to_csc(&self) -> CsMat<f64> {
        let offsets = self.offsets();
        let n = offsets[self.len()];
        let mut tri = TriMat::new((n, n));
        for (r, c, block) in self.lower_blocks() {
            for i in 0..block.rows() {
                for j in 0..block.cols() {
                    let v = block[(i, j)];
                    if v == 0.0 {
                        continue;
                    }
                    tri.add_triplet(offsets[r] + i, offsets[c] + j, v);
                    if r != c {
                        tri.add_triplet(offsets[c] + j, offsets[r] + i, v);
                    }
                }
            }
        }
        tri.to_csc()
    }

    pub fn sparsity_stats(&self) -> SparsityStats {
        let scalar_dim = self.scalar_dim();
        let nnz = self.to_csc().nnz();
        let total = scalar_dim * scalar_dim;
        SparsityStats {
            blocks: self.block_count(),
            scalar_dim,
            nnz,
            density: if total > 0 {
                nnz as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

impl PartialEq for SparseBlockMatrix {
    fn eq(&self, other: &Self) -> bool {
        if self.dims != other.dims {
            return false;
        }
        self.columns
            .iter()
            .zip(other.columns.iter())
            .all(|(a, b)| {
                let rows: BTreeSet<usize> = a.keys().chain(b.keys()).copied().collect();
                rows.into_iter().all(|r| match (a.get(&r), b.get(&r)) {
                    (Some(x), Some(y)) => x == y,
                    (Some(x), None) | (None, Some(x)) => x.is_zero(0.0),
                    (None, None) => true,
                })
            })
    }
}
