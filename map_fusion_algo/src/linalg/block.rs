//! Dense numeric blocks of the block-sparse information matrix
//!
//! A block is a small dense matrix (2x2 feature/feature, 3x3 pose/pose, 2x3 and
//! 3x2 cross terms, or a d x w right-hand side). All arithmetic is exposed as
//! named methods that report shape violations as `DimensionMismatch` instead of
//! panicking. Absent blocks of a sparse matrix are modelled with `Option`; the
//! `*_optional` helpers spell out how an absent operand behaves.

use std::ops::{Index, IndexMut};

use approx::{AbsDiffEq, RelativeEq};
use nalgebra::DMatrix;

use crate::error::{FusionError, FusionResult};

/// Default relative tolerance for pivots during inversion and factorization
pub const PIVOT_EPSILON: f64 = 1e-12;

/// Dense block of a block-sparse matrix
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMatrix {
    data: DMatrix<f64>,
}

impl BlockMatrix {
    /// Create a zero block of the given shape
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: DMatrix::zeros(rows, cols),
        }
    }

    /// Create an identity block
    pub fn identity(n: usize) -> Self {
        Self {
            data: DMatrix::identity(n, n),
        }
    }

    /// Create a block from row-major values
    pub fn from_row_slice(rows: usize, cols: usize, values: &[f64]) -> FusionResult<Self> {
        if values.len() != rows * cols {
            return Err(FusionError::dimension(
                "from_row_slice",
                (rows, cols),
                (values.len(), 1),
            ));
        }
        Ok(Self {
            data: DMatrix::from_row_slice(rows, cols, values),
        })
    }

    pub fn from_dmatrix(data: DMatrix<f64>) -> Self {
        Self { data }
    }

    pub fn as_dmatrix(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn into_dmatrix(self) -> DMatrix<f64> {
        self.data
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.shape()
    }

    pub fn is_square(&self) -> bool {
        self.rows() == self.cols()
    }

    fn check_same_shape(&self, other: &BlockMatrix, context: &'static str) -> FusionResult<()> {
        if self.shape() != other.shape() {
            return Err(FusionError::dimension(context, self.shape(), other.shape()));
        }
        Ok(())
    }

    /// Element-wise sum
    pub fn add(&self, other: &BlockMatrix) -> FusionResult<BlockMatrix> {
        self.check_same_shape(other, "add")?;
        Ok(Self::from_dmatrix(&self.data + &other.data))
    }

    /// Element-wise difference
    pub fn subtract(&self, other: &BlockMatrix) -> FusionResult<BlockMatrix> {
        self.check_same_shape(other, "subtract")?;
        Ok(Self::from_dmatrix(&self.data - &other.data))
    }

    /// In-place sum, used when accumulating information contributions
    pub fn add_assign(&mut self, other: &BlockMatrix) -> FusionResult<()> {
        self.check_same_shape(other, "add_assign")?;
        self.data += &other.data;
        Ok(())
    }

    pub fn sub_assign(&mut self, other: &BlockMatrix) -> FusionResult<()> {
        self.check_same_shape(other, "sub_assign")?;
        self.data -= &other.data;
        Ok(())
    }

    pub fn negate(&self) -> BlockMatrix {
        Self::from_dmatrix(-&self.data)
    }

    pub fn transpose(&self) -> BlockMatrix {
        Self::from_dmatrix(self.data.transpose())
    }

    pub fn scale(&self, factor: f64) -> BlockMatrix {
        Self::from_dmatrix(&self.data * factor)
    }

    /// Matrix product `self * other`
    pub fn multiply(&self, other: &BlockMatrix) -> FusionResult<BlockMatrix> {
        if self.cols() != other.rows() {
            return Err(FusionError::dimension(
                "multiply",
                (self.cols(), other.cols()),
                other.shape(),
            ));
        }
        Ok(Self::from_dmatrix(&self.data * &other.data))
    }

    /// Inverse by Gauss-Jordan elimination with partial row pivoting
    ///
    /// Fails with `SingularBlock` when the best available pivot of a column is
    /// within machine epsilon (relative to the largest entry) of zero.
    pub fn invert(&self) -> FusionResult<BlockMatrix> {
        if !self.is_square() {
            return Err(FusionError::dimension(
                "invert",
                (self.rows(), self.rows()),
                self.shape(),
            ));
        }
        let n = self.rows();
        let mut a = self.data.clone();
        let mut inv = DMatrix::<f64>::identity(n, n);
        let magnitude = a.amax().max(1.0);

        for col in 0..n {
            let (pivot_row, pivot_abs) = (col..n)
                .map(|r| (r, a[(r, col)].abs()))
                .fold((col, -1.0), |best, cur| if cur.1 > best.1 { cur } else { best });

            if pivot_abs <= f64::EPSILON * magnitude {
                return Err(FusionError::SingularBlock {
                    index: col,
                    reason: format!("pivot {pivot_abs:e} in column {col} during inversion"),
                });
            }

            if pivot_row != col {
                a.swap_rows(col, pivot_row);
                inv.swap_rows(col, pivot_row);
            }

            let pivot = a[(col, col)];
            for j in 0..n {
                a[(col, j)] /= pivot;
                inv[(col, j)] /= pivot;
            }

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = a[(r, col)];
                if factor == 0.0 {
                    continue;
                }
                for j in 0..n {
                    let da = factor * a[(col, j)];
                    let di = factor * inv[(col, j)];
                    a[(r, j)] -= da;
                    inv[(r, j)] -= di;
                }
            }
        }

        Ok(Self::from_dmatrix(inv))
    }

    /// Lower-triangular Cholesky factor `L` with `self = L Lᵀ`
    ///
    /// A diagonal pivot that is not larger than `tolerance` (scaled by the
    /// original diagonal entry) is reported as `SingularBlock` with the local
    /// row index; callers translate it to the global block index.
    pub fn cholesky_lower(&self, tolerance: f64) -> FusionResult<BlockMatrix> {
        if !self.is_square() {
            return Err(FusionError::dimension(
                "cholesky",
                (self.rows(), self.rows()),
                self.shape(),
            ));
        }
        let n = self.rows();
        let mut l = DMatrix::<f64>::zeros(n, n);

        for j in 0..n {
            let mut diag = self.data[(j, j)];
            for k in 0..j {
                diag -= l[(j, k)] * l[(j, k)];
            }
            let threshold = tolerance * self.data[(j, j)].abs().max(1.0);
            if !(diag > threshold) {
                return Err(FusionError::SingularBlock {
                    index: j,
                    reason: format!("non-positive pivot {diag:e}"),
                });
            }
            let ljj = diag.sqrt();
            l[(j, j)] = ljj;

            for i in (j + 1)..n {
                let mut s = self.data[(i, j)];
                for k in 0..j {
                    s -= l[(i, k)] * l[(j, k)];
                }
                l[(i, j)] = s / ljj;
            }
        }

        Ok(Self::from_dmatrix(l))
    }

    pub fn frobenius_norm(&self) -> f64 {
        self.data.norm()
    }

    /// Whether every entry is within `tolerance` of zero
    pub fn is_zero(&self, tolerance: f64) -> bool {
        self.data.iter().all(|v| v.abs() <= tolerance)
    }

    /// Symmetrize a square block in place: (A + Aᵀ) / 2
    pub fn symmetrize(&mut self) {
        let t = self.data.transpose();
        self.data = (&self.data + t) * 0.5;
    }
}

/// Sum where an absent operand acts as zero: `None + B = B`
pub fn add_optional(
    a: Option<&BlockMatrix>,
    b: Option<&BlockMatrix>,
) -> FusionResult<Option<BlockMatrix>> {
    match (a, b) {
        (Some(a), Some(b)) => a.add(b).map(Some),
        (Some(a), None) => Ok(Some(a.clone())),
        (None, Some(b)) => Ok(Some(b.clone())),
        (None, None) => Ok(None),
    }
}

/// Product where an absent operand absorbs: `None * B = None`
pub fn multiply_optional(
    a: Option<&BlockMatrix>,
    b: Option<&BlockMatrix>,
) -> FusionResult<Option<BlockMatrix>> {
    match (a, b) {
        (Some(a), Some(b)) => a.multiply(b).map(Some),
        _ => Ok(None),
    }
}

impl Index<(usize, usize)> for BlockMatrix {
    type Output = f64;

    fn index(&self, index: (usize, usize)) -> &f64 {
        &self.data[index]
    }
}

impl IndexMut<(usize, usize)> for BlockMatrix {
    fn index_mut(&mut self, index: (usize, usize)) -> &mut f64 {
        &mut self.data[index]
    }
}

impl AbsDiffEq for BlockMatrix {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        <f64 as AbsDiffEq>::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        self.shape() == other.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.abs_diff_eq(b, epsilon))
    }
}

impl RelativeEq for BlockMatrix {
    fn default_max_relative() -> f64 {
        <f64 as RelativeEq>::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: f64, max_relative: f64) -> bool {
        self.shape() == other.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.relative_eq(b, epsilon, max_relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_3x3() -> BlockMatrix {
        BlockMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]).unwrap()
    }

    #[test]
    fn test_double_transpose_is_identity() {
        let a = BlockMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = a.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t[(2, 1)], 6.0);
        assert_eq!(t.transpose(), a);
    }

    #[test]
    fn test_double_inverse_is_identity() {
        let a = sample_3x3();
        let back = a.invert().unwrap().invert().unwrap();
        assert_relative_eq!(back, a, epsilon = 1e-10);
    }

    #[test]
    fn test_inverse_needs_row_swap() {
        // Zero leading pivot forces partial pivoting
        let a = BlockMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]).unwrap();
        let inv = a.invert().unwrap();
        let product = a.multiply(&inv).unwrap();
        assert_relative_eq!(product, BlockMatrix::identity(2), epsilon = 1e-12);
    }

    #[test]
    fn test_add_negated_is_zero() {
        let a = sample_3x3();
        let sum = a.add(&a.negate()).unwrap();
        assert!(sum.is_zero(0.0));
        assert_eq!(sum, BlockMatrix::zeros(3, 3));
    }

    #[test]
    fn test_singular_block_is_reported() {
        let a = BlockMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]).unwrap();
        match a.invert() {
            Err(FusionError::SingularBlock { index, .. }) => assert_eq!(index, 1),
            other => panic!("Expected singular block, got {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = BlockMatrix::zeros(2, 2);
        let b = BlockMatrix::zeros(3, 3);
        assert!(matches!(
            a.add(&b),
            Err(FusionError::DimensionMismatch { context: "add", .. })
        ));
        assert!(matches!(
            a.multiply(&b),
            Err(FusionError::DimensionMismatch { .. })
        ));
        assert!(BlockMatrix::zeros(2, 3).invert().is_err());
        assert!(BlockMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_multiply_cross_blocks() {
        // 2x3 times 3x2 gives a feature-sized block
        let h = BlockMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.0, 1.0, -1.0]).unwrap();
        let p = h.multiply(&h.transpose()).unwrap();
        assert_eq!(p.shape(), (2, 2));
        assert_relative_eq!(p[(0, 0)], 5.0);
        assert_relative_eq!(p[(0, 1)], -2.0);
        assert_relative_eq!(p[(1, 1)], 2.0);
    }

    #[test]
    fn test_cholesky_reconstructs_block() {
        let a = sample_3x3();
        let l = a.cholesky_lower(PIVOT_EPSILON).unwrap();
        assert_eq!(l[(0, 1)], 0.0);
        let back = l.multiply(&l.transpose()).unwrap();
        assert_relative_eq!(back, a, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = BlockMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]).unwrap();
        assert!(matches!(
            a.cholesky_lower(PIVOT_EPSILON),
            Err(FusionError::SingularBlock { index: 1, .. })
        ));
    }

    #[test]
    fn test_optional_operands() {
        let a = sample_3x3();
        assert_eq!(add_optional(None, Some(&a)).unwrap(), Some(a.clone()));
        assert_eq!(add_optional(Some(&a), None).unwrap(), Some(a.clone()));
        assert_eq!(add_optional(None, None).unwrap(), None);
        assert_eq!(multiply_optional(None, Some(&a)).unwrap(), None);
        assert_eq!(multiply_optional(Some(&a), None).unwrap(), None);
        let squared = multiply_optional(Some(&a), Some(&a)).unwrap().unwrap();
        assert_relative_eq!(squared[(0, 0)], 16.0 + 1.0 + 0.25);
    }
}
