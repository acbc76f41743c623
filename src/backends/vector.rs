//! Conversions between vector containers and column [`Matrix`] values.

use crate::errors::GraphError;
use crate::matrix::Matrix;
use crate::sparsity::Shape;

/// A dense one-dimensional container of `f64`.
///
/// # Examples
///
/// ```rust
/// use exprgraph_jit::prelude::*;
///
/// let m = to_column(&vec![1.0, 2.0, 3.0]);
/// assert_eq!(m.shape(), Shape::new(3, 1));
/// let v: Vec<f64> = from_column(&m).unwrap();
/// assert_eq!(v, [1.0, 2.0, 3.0]);
/// ```
pub trait Vector {
    /// Copies the entries out in order.
    fn to_vec(&self) -> Vec<f64>;

    /// Creates a container holding `data`.
    fn from_slice(data: &[f64]) -> Self;

    /// Returns the length of the vector.
    fn len(&self) -> usize;

    /// Checks if the vector is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Vector for Vec<f64> {
    fn to_vec(&self) -> Vec<f64> {
        self.clone()
    }

    fn from_slice(data: &[f64]) -> Self {
        data.to_vec()
    }

    fn len(&self) -> usize {
        self.len()
    }
}

#[cfg(feature = "ndarray")]
impl Vector for ndarray::Array1<f64> {
    fn to_vec(&self) -> Vec<f64> {
        self.iter().copied().collect()
    }

    fn from_slice(data: &[f64]) -> Self {
        ndarray::Array1::from_vec(data.to_vec())
    }

    fn len(&self) -> usize {
        self.len()
    }
}

#[cfg(feature = "nalgebra")]
impl Vector for nalgebra::DVector<f64> {
    fn to_vec(&self) -> Vec<f64> {
        self.as_slice().to_vec()
    }

    fn from_slice(data: &[f64]) -> Self {
        nalgebra::DVector::from_column_slice(data)
    }

    fn len(&self) -> usize {
        self.len()
    }
}

/// Dense column [`Matrix`] holding the vector.
pub fn to_column<V: Vector>(vector: &V) -> Matrix {
    Matrix::column(&vector.to_vec())
}

/// Vector holding every entry of a column matrix, structural zeros as `0.0`.
///
/// # Errors
/// `DimensionError` if the matrix has more than one column.
pub fn from_column<V: Vector>(matrix: &Matrix) -> Result<V, GraphError> {
    let shape = matrix.shape();
    if shape.ncol != 1 {
        return Err(GraphError::dimension("from_column", Shape::new(shape.nrow, 1), shape));
    }
    Ok(V::from_slice(&matrix.to_dense()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsity::Sparsity;

    #[test]
    fn test_sparse_column_is_densified() {
        let (sp, _) = Sparsity::from_triplets(4, 1, &[1, 3], &[0, 0]).unwrap();
        let m = Matrix::new(sp, vec![2.0, 5.0]).unwrap();
        let v: Vec<f64> = from_column(&m).unwrap();
        assert_eq!(v, [0.0, 2.0, 0.0, 5.0]);
        assert!(!Vector::is_empty(&v));
    }

    #[test]
    fn test_row_vector_is_rejected() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0]]).unwrap();
        assert!(matches!(
            from_column::<Vec<f64>>(&m),
            Err(GraphError::DimensionError { .. })
        ));
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_ndarray_vector() {
        let a = ndarray::Array1::from_vec(vec![1.0, -1.0]);
        let m = to_column(&a);
        let back: ndarray::Array1<f64> = from_column(&m).unwrap();
        assert_eq!(back, a);
    }

    #[cfg(feature = "nalgebra")]
    #[test]
    fn test_nalgebra_vector() {
        let a = nalgebra::DVector::from_vec(vec![1.0, -1.0, 0.5]);
        let m = to_column(&a);
        assert_eq!(m.nonzeros(), a.as_slice());
        let back: nalgebra::DVector<f64> = from_column(&m).unwrap();
        assert_eq!(back, a);
    }
}
