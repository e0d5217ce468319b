//! Dense or sparse recipe × ingredient composition matrices.
//!
//! Small corpora are convenient as `DenseMatrix`; large ones are mostly zeros
//! and live in CSR. Both expose the same minimal capability set through
//! [`RowAccess`], and [`CompositionMatrix`] wraps either one so downstream
//! code never branches on storage.

use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use sprs::CsMat;

/// Row access shared by dense and sparse storage.
pub trait RowAccess {
    /// (rows, cols)
    fn shape(&self) -> (usize, usize);

    /// Non-zero `(column, value)` pairs of row `i`, ascending by column.
    fn row_support(&self, i: usize) -> Vec<(usize, f64)>;

    /// Column indices of the non-zero entries of row `i`.
    fn nonzero_indices(&self, i: usize) -> Vec<usize> {
        self.row_support(i).into_iter().map(|(j, _)| j).collect()
    }

    /// Row `i` as a dense vector.
    fn row_dense(&self, i: usize) -> Vec<f64> {
        let mut row = vec![0.0; self.shape().1];
        for (j, v) in self.row_support(i) {
            row[j] = v;
        }
        row
    }
}

impl RowAccess for DenseMatrix<f64> {
    fn shape(&self) -> (usize, usize) {
        Array::shape(self)
    }

    fn row_support(&self, i: usize) -> Vec<(usize, f64)> {
        let (_, cols) = Array::shape(self);
        (0..cols)
            .filter_map(|j| {
                let v = *self.get((i, j));
                (v != 0.0).then_some((j, v))
            })
            .collect()
    }
}

impl RowAccess for CsMat<f64> {
    fn shape(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }

    fn row_support(&self, i: usize) -> Vec<(usize, f64)> {
        if self.is_csr() {
            self.outer_view(i)
                .map(|row| {
                    row.iter()
                        .filter(|&(_, &v)| v != 0.0)
                        .map(|(j, &v)| (j, v))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            let mut support: Vec<(usize, f64)> = self
                .outer_iterator()
                .enumerate()
                .filter_map(|(j, col)| col.get(i).copied().filter(|v| *v != 0.0).map(|v| (j, v)))
                .collect();
            support.sort_by_key(|(j, _)| *j);
            support
        }
    }
}

/// Recipe composition matrix in either storage.
#[derive(Clone, Debug)]
pub enum CompositionMatrix {
    Dense(DenseMatrix<f64>),
    Sparse(CsMat<f64>),
}

impl CompositionMatrix {
    pub fn nrows(&self) -> usize {
        self.shape().0
    }

    pub fn ncols(&self) -> usize {
        self.shape().1
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, CompositionMatrix::Sparse(_))
    }

    /// Supports of every row, computed once for repeated pairwise use.
    pub fn supports(&self) -> Vec<Vec<(usize, f64)>> {
        (0..self.nrows()).map(|i| self.row_support(i)).collect()
    }
}

impl RowAccess for CompositionMatrix {
    fn shape(&self) -> (usize, usize) {
        match self {
            CompositionMatrix::Dense(m) => RowAccess::shape(m),
            CompositionMatrix::Sparse(m) => RowAccess::shape(m),
        }
    }

    fn row_support(&self, i: usize) -> Vec<(usize, f64)> {
        match self {
            CompositionMatrix::Dense(m) => m.row_support(i),
            CompositionMatrix::Sparse(m) => m.row_support(i),
        }
    }
}

/// Storage selection for the volume matrix builder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Storage {
    Dense,
    #[default]
    Sparse,
}
