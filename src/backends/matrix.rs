//! Conversions between dense matrix containers and [`Matrix`].
//!
//! Dense containers always convert to a dense pattern. Converting back writes every
//! entry, structural zeros included.

use crate::errors::GraphError;
use crate::matrix::Matrix;

/// A dense two-dimensional container of `f64`.
///
/// # Examples
///
/// ```rust
/// use exprgraph_jit::prelude::*;
///
/// let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
/// let m = to_matrix(&rows).unwrap();
/// assert_eq!(m.get(1, 0), 3.0);
/// let back: Vec<Vec<f64>> = from_matrix(&m);
/// assert_eq!(back, rows);
/// ```
pub trait DenseMatrix {
    /// Returns the dimensions of the container as (rows, columns).
    fn dims(&self) -> (usize, usize);

    /// Entry at `(row, col)`.
    fn entry(&self, row: usize, col: usize) -> f64;

    /// Builds a container from column-major data.
    ///
    /// # Arguments
    /// * `rows` - Number of rows
    /// * `cols` - Number of columns
    /// * `data` - `rows * cols` entries, column by column
    fn from_column_major(rows: usize, cols: usize, data: &[f64]) -> Self;
}

/// List of rows. Rows shorter than the first one read as zero.
impl DenseMatrix for Vec<Vec<f64>> {
    fn dims(&self) -> (usize, usize) {
        (self.len(), self.first().map_or(0, Vec::len))
    }

    fn entry(&self, row: usize, col: usize) -> f64 {
        self[row].get(col).copied().unwrap_or(0.0)
    }

    fn from_column_major(rows: usize, cols: usize, data: &[f64]) -> Self {
        (0..rows)
            .map(|r| (0..cols).map(|c| data[c * rows + r]).collect())
            .collect()
    }
}

#[cfg(feature = "ndarray")]
impl DenseMatrix for ndarray::Array2<f64> {
    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn entry(&self, row: usize, col: usize) -> f64 {
        self[(row, col)]
    }

    fn from_column_major(rows: usize, cols: usize, data: &[f64]) -> Self {
        ndarray::Array2::from_shape_fn((rows, cols), |(r, c)| data[c * rows + r])
    }
}

/// nalgebra stores column-major, so conversion is a plain copy.
#[cfg(feature = "nalgebra")]
impl DenseMatrix for nalgebra::DMatrix<f64> {
    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn entry(&self, row: usize, col: usize) -> f64 {
        self[(row, col)]
    }

    fn from_column_major(rows: usize, cols: usize, data: &[f64]) -> Self {
        nalgebra::DMatrix::from_column_slice(rows, cols, data)
    }
}

/// Dense [`Matrix`] holding every entry of the container.
pub fn to_matrix<M: DenseMatrix>(container: &M) -> Result<Matrix, GraphError> {
    let (rows, cols) = container.dims();
    let data: Vec<f64> = (0..cols)
        .flat_map(|c| (0..rows).map(move |r| (r, c)))
        .map(|(r, c)| container.entry(r, c))
        .collect();
    Matrix::from_dense(rows, cols, data)
}

/// Container holding every entry of `matrix`, structural zeros as `0.0`.
pub fn from_matrix<M: DenseMatrix>(matrix: &Matrix) -> M {
    let shape = matrix.shape();
    M::from_column_major(shape.nrow, shape.ncol, &matrix.to_dense())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsity::Sparsity;

    #[test]
    fn test_rows_round_trip_through_sparse() {
        let (diag, _) = Sparsity::from_triplets(2, 3, &[0, 1], &[0, 2]).unwrap();
        let m = Matrix::new(diag, vec![1.5, -2.0]).unwrap();
        let rows: Vec<Vec<f64>> = from_matrix(&m);
        assert_eq!(rows, vec![vec![1.5, 0.0, 0.0], vec![0.0, 0.0, -2.0]]);
        let dense = to_matrix(&rows).unwrap();
        assert!(dense.sparsity().is_dense());
        assert_eq!(dense.get(1, 2), -2.0);
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_ndarray_layout() {
        let a = ndarray::arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let m = to_matrix(&a).unwrap();
        assert_eq!(m.nonzeros(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let back: ndarray::Array2<f64> = from_matrix(&m);
        assert_eq!(back, a);
    }

    #[cfg(feature = "nalgebra")]
    #[test]
    fn test_nalgebra_layout() {
        let a = nalgebra::DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let m = to_matrix(&a).unwrap();
        assert_eq!(m.nonzeros(), a.as_slice());
        let back: nalgebra::DMatrix<f64> = from_matrix(&m);
        assert_eq!(back, a);
    }
}
