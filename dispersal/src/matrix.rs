//! Dense matrices over GF(2^8): the Cauchy distribution matrices handed to
//! the codecs, and Gauss-Jordan inversion of the square submatrices selected
//! by a set of share IDs during decoding.

use crate::gf256;
use crate::CodecError;

/// A row-major `rows x cols` matrix over GF(2^8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zero(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Matrix::zero(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    /// The `n x k` Cauchy distribution matrix of the ramp scheme:
    /// `A[i][j] = 1 / (i XOR (n + j))`.
    pub fn cauchy_ramp(n: usize, k: usize) -> Self {
        let mut m = Matrix::zero(n, k);
        for i in 0..n {
            for j in 0..k {
                m.set(i, j, gf256::div(1, (i ^ (n + j)) as u8));
            }
        }
        m
    }

    /// The systematic `(k + par) x k` distribution matrix of the AONT family:
    /// identity on the first `k` rows, then a `par x k` Cauchy matrix
    /// `1 / (i XOR (par + j))`.
    pub fn cauchy_systematic(k: usize, par: usize) -> Self {
        let mut m = Matrix::zero(k + par, k);
        for i in 0..k {
            m.set(i, i, 1);
        }
        for i in 0..par {
            for j in 0..k {
                m.set(k + i, j, gf256::div(1, (i ^ (par + j)) as u8));
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, v: u8) {
        self.data[row * self.cols + col] = v;
    }

    /// The square matrix formed by the given rows of `self`, in order.
    pub fn select_rows(&self, rows: &[usize]) -> Matrix {
        let mut m = Matrix::zero(rows.len(), self.cols);
        for (i, &r) in rows.iter().enumerate() {
            let src = r * self.cols;
            let dst = i * self.cols;
            m.data[dst..dst + self.cols].copy_from_slice(&self.data[src..src + self.cols]);
        }
        m
    }

    /// Invert a square matrix by Gauss-Jordan elimination with partial
    /// pivoting, mirroring every row operation onto a tracked identity
    /// matrix. Consumes the working copy.
    ///
    /// Returns `CodecError::SingularMatrix` when some column has no usable
    /// pivot; the caller must then pick a different row subset.
    pub fn invert(mut self) -> Result<Matrix, CodecError> {
        assert_eq!(self.rows, self.cols, "only square matrices are invertible");
        let n = self.rows;
        let mut inv = Matrix::identity(n);

        for col in 0..n {
            // Find a non-zero pivot at or below the diagonal.
            if self.get(col, col) == 0 {
                let pivot = (col + 1..n).find(|&r| self.get(r, col) != 0);
                match pivot {
                    Some(r) => {
                        self.swap_rows(col, r);
                        inv.swap_rows(col, r);
                    }
                    None => return Err(CodecError::SingularMatrix),
                }
            }

            // Scale the pivot row so the diagonal becomes 1.
            let p = self.get(col, col);
            if p != 1 {
                let factor = gf256::inv(p);
                self.scale_row(col, factor);
                inv.scale_row(col, factor);
            }

            // Eliminate the column from every other row.
            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = self.get(row, col);
                if factor != 0 {
                    self.add_scaled_row(col, row, factor);
                    inv.add_scaled_row(col, row, factor);
                }
            }
        }

        Ok(inv)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (a, b) = (a.min(b), a.max(b));
        let (head, tail) = self.data.split_at_mut(b * self.cols);
        head[a * self.cols..(a + 1) * self.cols].swap_with_slice(&mut tail[..self.cols]);
    }

    fn scale_row(&mut self, row: usize, factor: u8) {
        let start = row * self.cols;
        for v in &mut self.data[start..start + self.cols] {
            *v = gf256::mul(*v, factor);
        }
    }

    /// row[dst] ^= factor * row[src]. A factor of one is a plain XOR.
    fn add_scaled_row(&mut self, src: usize, dst: usize, factor: u8) {
        for col in 0..self.cols {
            let s = self.get(src, col);
            let d = self.get(dst, col);
            self.set(dst, col, d ^ gf256::mul(s, factor));
        }
    }

    /// `self * other`, used by the inversion tests.
    pub fn matmul(&self, other: &Matrix) -> Matrix {
        assert_eq!(self.cols, other.rows);
        let mut out = Matrix::zero(self.rows, other.cols);
        for i in 0..self.rows {
            for j in 0..other.cols {
                let mut acc = 0u8;
                for l in 0..self.cols {
                    acc ^= gf256::mul(self.get(i, l), other.get(l, j));
                }
                out.set(i, j, acc);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn systematic_top_is_identity() {
        // For n=4, k=3 the first 3 rows of the AONT-family matrix are I,
        // so selecting shares {0,1,2} must invert to I as well.
        let dist = Matrix::cauchy_systematic(3, 1);
        let square = dist.select_rows(&[0, 1, 2]);
        assert_eq!(square, Matrix::identity(3));
        assert_eq!(square.invert().unwrap(), Matrix::identity(3));
    }

    #[rstest]
    #[case::ramp_all(Matrix::cauchy_ramp(4, 3), vec![0, 1, 2])]
    #[case::ramp_tail(Matrix::cauchy_ramp(4, 3), vec![1, 2, 3])]
    #[case::ramp_wide(Matrix::cauchy_ramp(7, 4), vec![0, 2, 4, 6])]
    #[case::systematic(Matrix::cauchy_systematic(3, 1), vec![0, 2, 3])]
    #[case::systematic_parity(Matrix::cauchy_systematic(4, 2), vec![1, 3, 4, 5])]
    fn inverse_times_original_is_identity(#[case] dist: Matrix, #[case] rows: Vec<usize>) {
        let square = dist.select_rows(&rows);
        let inv = square.clone().invert().unwrap();
        assert_eq!(inv.matmul(&square), Matrix::identity(rows.len()));
        assert_eq!(square.matmul(&inv), Matrix::identity(rows.len()));
    }

    #[test]
    fn singular_matrix_is_reported() {
        let mut m = Matrix::zero(2, 2);
        m.set(0, 0, 3);
        m.set(0, 1, 5);
        m.set(1, 0, 3);
        m.set(1, 1, 5);
        assert!(matches!(m.invert(), Err(CodecError::SingularMatrix)));
    }

    #[test]
    fn pivot_swap_path() {
        // Zero on the diagonal forces the row-swap branch.
        let mut m = Matrix::zero(2, 2);
        m.set(0, 1, 1);
        m.set(1, 0, 1);
        let inv = m.clone().invert().unwrap();
        assert_eq!(inv.matmul(&m), Matrix::identity(2));
    }
}
