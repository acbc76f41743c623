//! Sparsity-tagged matrices and the elementwise kernels shared by the numeric and
//! bit-vector evaluators.
//!
//! A [`Matrix`] stores only its structural nonzeros, in the column-major order of its
//! [`Sparsity`]. The kernels below are generic over [`Element`], so the same routine
//! computes a numeric result for `f64` and a dependency mask for [`BitWord`].

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::errors::GraphError;
use crate::node::{ConcatKind, NormKind, SplitKind};
use crate::ops::{BinaryOp, UnaryOp};
use crate::sparsity::{Shape, Sparsity};

/// Scalar type a [`Matrix`] can hold.
pub trait Element: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn zero() -> Self;
    /// Injects a numeric constant.
    fn from_f64(value: f64) -> Self;
    fn add(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;
    fn unary(op: UnaryOp, x: Self) -> Self;
    fn binary(op: BinaryOp, x: Self, y: Self) -> Self;
    /// Norm of a matrix given its nonzeros.
    fn norm(kind: NormKind, nonzeros: &[Self]) -> Self;
    /// Overwrites the dense `n x m` block `b` with `A^-1 b` (or `A^-T b`).
    ///
    /// Both buffers are column-major; `a` is used as scratch space.
    fn dense_solve(a: &mut [Self], b: &mut [Self], n: usize, m: usize, transpose: bool);
    /// Fails unless `cond` represents the value one.
    fn check_assertion(cond: Self, message: &str) -> Result<(), GraphError>;
}

impl Element for f64 {
    fn zero() -> Self {
        0.0
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn add(self, other: Self) -> Self {
        self + other
    }

    fn mul(self, other: Self) -> Self {
        self * other
    }

    fn unary(op: UnaryOp, x: Self) -> Self {
        op.eval(x)
    }

    fn binary(op: BinaryOp, x: Self, y: Self) -> Self {
        op.eval(x, y)
    }

    fn norm(kind: NormKind, nonzeros: &[Self]) -> Self {
        match kind {
            NormKind::Frobenius | NormKind::Two => nonzeros.iter().map(|v| v * v).sum::<f64>().sqrt(),
            NormKind::One => nonzeros.iter().map(|v| v.abs()).sum(),
            NormKind::Inf => nonzeros.iter().fold(0.0, |acc: f64, v| acc.max(v.abs())),
        }
    }

    fn dense_solve(a: &mut [Self], b: &mut [Self], n: usize, m: usize, transpose: bool) {
        dense_solve_f64(a, b, n, m, transpose);
    }

    fn check_assertion(cond: Self, message: &str) -> Result<(), GraphError> {
        if cond == 1.0 {
            Ok(())
        } else {
            Err(GraphError::AssertionFailure(message.to_string()))
        }
    }
}

/// Gaussian elimination with partial pivoting on column-major dense storage.
///
/// A singular matrix yields non-finite entries in `b`; that is a numeric outcome, not an
/// error.
pub(crate) fn dense_solve_f64(a: &mut [f64], b: &mut [f64], n: usize, m: usize, transpose: bool) {
    if transpose {
        for i in 0..n {
            for j in i + 1..n {
                a.swap(i + j * n, j + i * n);
            }
        }
    }
    for k in 0..n {
        let pivot_row = (k..n)
            .max_by(|&i, &j| a[i + k * n].abs().total_cmp(&a[j + k * n].abs()))
            .unwrap_or(k);
        if pivot_row != k {
            for j in 0..n {
                a.swap(k + j * n, pivot_row + j * n);
            }
            for j in 0..m {
                b.swap(k + j * n, pivot_row + j * n);
            }
        }
        let pivot = a[k + k * n];
        for i in k + 1..n {
            let factor = a[i + k * n] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in k..n {
                a[i + j * n] -= factor * a[k + j * n];
            }
            for j in 0..m {
                b[i + j * n] -= factor * b[k + j * n];
            }
        }
    }
    for j in 0..m {
        for k in (0..n).rev() {
            let mut s = b[k + j * n];
            for l in k + 1..n {
                s -= a[k + l * n] * b[l + j * n];
            }
            b[k + j * n] = s / a[k + k * n];
        }
    }
}

/// A 64-bit dependency mask, one bit per propagated direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BitWord(pub u64);

impl BitWord {
    pub const ZERO: BitWord = BitWord(0);

    pub fn bit(k: usize) -> Self {
        BitWord(1u64 << k)
    }

    pub fn is_set(self, k: usize) -> bool {
        self.0 >> k & 1 == 1
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BitWord {
    type Output = BitWord;

    fn bitor(self, rhs: BitWord) -> BitWord {
        BitWord(self.0 | rhs.0)
    }
}

impl BitOrAssign for BitWord {
    fn bitor_assign(&mut self, rhs: BitWord) {
        self.0 |= rhs.0;
    }
}

impl Element for BitWord {
    fn zero() -> Self {
        BitWord::ZERO
    }

    fn from_f64(_value: f64) -> Self {
        BitWord::ZERO
    }

    fn add(self, other: Self) -> Self {
        self | other
    }

    fn mul(self, other: Self) -> Self {
        self | other
    }

    fn unary(_op: UnaryOp, x: Self) -> Self {
        x
    }

    fn binary(_op: BinaryOp, x: Self, y: Self) -> Self {
        x | y
    }

    fn norm(_kind: NormKind, nonzeros: &[Self]) -> Self {
        nonzeros.iter().fold(BitWord::ZERO, |acc, &v| acc | v)
    }

    fn dense_solve(a: &mut [Self], b: &mut [Self], _n: usize, _m: usize, _transpose: bool) {
        let all = a.iter().chain(b.iter()).fold(BitWord::ZERO, |acc, &v| acc | v);
        b.fill(all);
    }

    fn check_assertion(_cond: Self, _message: &str) -> Result<(), GraphError> {
        Ok(())
    }
}

/// A matrix holding the values of its structural nonzeros.
#[derive(Clone, PartialEq)]
pub struct Matrix<E = f64> {
    sparsity: Sparsity,
    nonzeros: Vec<E>,
}

impl<E: Element> Matrix<E> {
    /// Creates a matrix from a pattern and its nonzeros in pattern order.
    pub fn new(sparsity: Sparsity, nonzeros: Vec<E>) -> Result<Self, GraphError> {
        if nonzeros.len() != sparsity.nnz() {
            return Err(GraphError::InvalidInputLength {
                expected: sparsity.nnz(),
                got: nonzeros.len(),
            });
        }
        Ok(Matrix { sparsity, nonzeros })
    }

    /// All structural nonzeros set to zero.
    pub fn zeros(sparsity: &Sparsity) -> Self {
        Matrix {
            sparsity: sparsity.clone(),
            nonzeros: vec![E::zero(); sparsity.nnz()],
        }
    }

    /// Every structural nonzero set to `value`.
    pub fn filled(sparsity: &Sparsity, value: E) -> Self {
        Matrix {
            sparsity: sparsity.clone(),
            nonzeros: vec![value; sparsity.nnz()],
        }
    }

    pub fn sparsity(&self) -> &Sparsity {
        &self.sparsity
    }

    pub fn shape(&self) -> Shape {
        self.sparsity.shape()
    }

    pub fn nonzeros(&self) -> &[E] {
        &self.nonzeros
    }

    pub fn nonzeros_mut(&mut self) -> &mut [E] {
        &mut self.nonzeros
    }

    pub fn into_nonzeros(self) -> Vec<E> {
        self.nonzeros
    }

    /// Value at `(row, col)`, zero if the entry is not structurally nonzero.
    pub fn get(&self, row: usize, col: usize) -> E {
        self.sparsity
            .get_nz(row, col)
            .map_or(E::zero(), |k| self.nonzeros[k])
    }

    /// Column-major dense copy of all entries.
    pub fn to_dense(&self) -> Vec<E> {
        let mut dense = vec![E::zero(); self.sparsity.numel()];
        for (lin, &v) in self.sparsity.linear_indices().into_iter().zip(&self.nonzeros) {
            dense[lin] = v;
        }
        dense
    }

    /// Re-patterns the matrix: entries outside `sparsity` are dropped, new entries are zero.
    pub fn project(&self, sparsity: &Sparsity) -> Result<Self, GraphError> {
        let map = self.sparsity.nz_map(sparsity)?;
        Ok(Matrix {
            sparsity: sparsity.clone(),
            nonzeros: map
                .into_iter()
                .map(|k| k.map_or(E::zero(), |k| self.nonzeros[k]))
                .collect(),
        })
    }
}

impl Matrix<f64> {
    /// Dense matrix from column-major data.
    pub fn from_dense(nrow: usize, ncol: usize, data: Vec<f64>) -> Result<Self, GraphError> {
        Matrix::new(Sparsity::dense(nrow, ncol), data)
    }

    /// Dense matrix from a list of rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, GraphError> {
        let nrow = rows.len();
        let ncol = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(nrow * ncol);
        for c in 0..ncol {
            for (r, row) in rows.iter().enumerate() {
                let value = row.get(c).ok_or(GraphError::IndexOutOfRange {
                    what: "row entries",
                    index: c,
                    len: rows[r].len(),
                })?;
                data.push(*value);
            }
        }
        Matrix::from_dense(nrow, ncol, data)
    }

    pub fn scalar(value: f64) -> Self {
        Matrix {
            sparsity: Sparsity::scalar(),
            nonzeros: vec![value],
        }
    }

    /// Dense column vector.
    pub fn column(values: &[f64]) -> Self {
        Matrix {
            sparsity: Sparsity::dense(values.len(), 1),
            nonzeros: values.to_vec(),
        }
    }

    pub fn identity(n: usize) -> Self {
        Matrix::filled(&Sparsity::diag(n), 1.0)
    }

    /// Dense list-of-rows copy.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        let dense = self.to_dense();
        let nrow = self.sparsity.nrow();
        (0..nrow)
            .map(|r| (0..self.sparsity.ncol()).map(|c| dense[c * nrow + r]).collect())
            .collect()
    }

    /// True if every structural nonzero is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.nonzeros.iter().all(|&v| v == 0.0)
    }

    /// True if the matrix is dense and every entry equals `value`.
    pub fn is_constant(&self, value: f64) -> bool {
        self.sparsity.is_dense() && self.nonzeros.iter().all(|&v| v == value)
    }
}

impl<E: Element> fmt::Debug for Matrix<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("sparsity", &self.sparsity)
            .field("nonzeros", &self.nonzeros)
            .finish()
    }
}

impl fmt::Display for Matrix<f64> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sparsity.is_scalar() {
            return match self.nonzeros.first() {
                Some(v) => write!(f, "{v}"),
                None => write!(f, "00"),
            };
        }
        write!(f, "[")?;
        for r in 0..self.sparsity.nrow() {
            if r > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[")?;
            for c in 0..self.sparsity.ncol() {
                if c > 0 {
                    write!(f, ", ")?;
                }
                match self.sparsity.get_nz(r, c) {
                    Some(k) => write!(f, "{}", self.nonzeros[k])?,
                    None => write!(f, "00")?,
                }
            }
            write!(f, "]")?;
        }
        write!(f, "]")
    }
}

// Kernels. Each one produces its result directly in the pattern the graph node reports
// for its output.

/// Nonzeros of `x` laid out on `target`, with scalars broadcast over every entry.
fn spread<E: Element>(x: &Matrix<E>, target: &Sparsity) -> Result<Vec<E>, GraphError> {
    if x.sparsity.is_scalar() && !target.is_scalar() {
        let value = x.nonzeros.first().copied().unwrap_or(E::zero());
        return Ok(vec![value; target.nnz()]);
    }
    Ok(x.project(target)?.nonzeros)
}

pub fn unary<E: Element>(op: UnaryOp, x: &Matrix<E>, out: &Sparsity) -> Result<Matrix<E>, GraphError> {
    let mut values = spread(x, out)?;
    for v in values.iter_mut() {
        *v = E::unary(op, *v);
    }
    Matrix::new(out.clone(), values)
}

pub fn binary<E: Element>(
    op: BinaryOp,
    x: &Matrix<E>,
    y: &Matrix<E>,
    out: &Sparsity,
) -> Result<Matrix<E>, GraphError> {
    let lhs = spread(x, out)?;
    let rhs = spread(y, out)?;
    let values = lhs
        .into_iter()
        .zip(rhs)
        .map(|(a, b)| E::binary(op, a, b))
        .collect();
    Matrix::new(out.clone(), values)
}

/// `z0 + x * y`, restricted to the pattern of `z0`.
pub fn mul_add<E: Element>(z0: &Matrix<E>, x: &Matrix<E>, y: &Matrix<E>) -> Matrix<E> {
    let mut z = z0.clone();
    mul_add_into(&mut z, x, y);
    z
}

/// Accumulates `x * y` into `z`, ignoring products that fall outside its pattern.
pub fn mul_add_into<E: Element>(z: &mut Matrix<E>, x: &Matrix<E>, y: &Matrix<E>) {
    let zsp = z.sparsity.clone();
    let (xsp, ysp) = (&x.sparsity, &y.sparsity);
    let mut slot = vec![usize::MAX; zsp.nrow()];
    let mut stamp = vec![usize::MAX; zsp.nrow()];
    for k in 0..zsp.ncol() {
        for idx in zsp.colind()[k]..zsp.colind()[k + 1] {
            slot[zsp.row()[idx]] = idx;
            stamp[zsp.row()[idx]] = k;
        }
        for yk in ysp.colind()[k]..ysp.colind()[k + 1] {
            let j = ysp.row()[yk];
            let yv = y.nonzeros[yk];
            for xk in xsp.colind()[j]..xsp.colind()[j + 1] {
                let i = xsp.row()[xk];
                if stamp[i] == k {
                    let target = &mut z.nonzeros[slot[i]];
                    *target = target.add(x.nonzeros[xk].mul(yv));
                }
            }
        }
    }
}

pub fn transpose<E: Element>(x: &Matrix<E>) -> Matrix<E> {
    let (sparsity, mapping) = x.sparsity.transpose_with_mapping();
    Matrix {
        sparsity,
        nonzeros: mapping.into_iter().map(|k| x.nonzeros[k]).collect(),
    }
}

/// Same nonzeros, new shape. The nonzero order is unchanged by a reshape.
pub fn reshape<E: Element>(x: &Matrix<E>, out: &Sparsity) -> Matrix<E> {
    Matrix {
        sparsity: out.clone(),
        nonzeros: x.nonzeros.clone(),
    }
}

/// For every nonzero of the concatenation, the part and nonzero it is copied from.
pub(crate) fn concat_sources(kind: ConcatKind, parts: &[Sparsity]) -> Vec<(usize, usize)> {
    match kind {
        ConcatKind::Horz | ConcatKind::Diag => parts
            .iter()
            .enumerate()
            .flat_map(|(p, sp)| (0..sp.nnz()).map(move |k| (p, k)))
            .collect(),
        ConcatKind::Vert => {
            let ncol = parts.first().map_or(0, Sparsity::ncol);
            let mut sources = Vec::new();
            for c in 0..ncol {
                for (p, sp) in parts.iter().enumerate() {
                    sources.extend((sp.colind()[c]..sp.colind()[c + 1]).map(|k| (p, k)));
                }
            }
            sources
        }
    }
}

/// For every output of the split, the input nonzeros it takes, in order.
pub(crate) fn split_sources(kind: &SplitKind, x: &Sparsity) -> Vec<Vec<usize>> {
    match kind {
        SplitKind::Horz(offsets) => offsets
            .windows(2)
            .map(|w| (x.colind()[w[0]]..x.colind()[w[1]]).collect())
            .collect(),
        SplitKind::Vert(offsets) => {
            let mut sources = vec![Vec::new(); offsets.len().saturating_sub(1)];
            for c in 0..x.ncol() {
                for k in x.colind()[c]..x.colind()[c + 1] {
                    let r = x.row()[k];
                    let part = offsets.partition_point(|&o| o <= r) - 1;
                    sources[part].push(k);
                }
            }
            sources
        }
        SplitKind::Diag { rows, cols } => {
            let mut sources = vec![Vec::new(); rows.len().saturating_sub(1)];
            for c in 0..x.ncol() {
                let part = cols.partition_point(|&o| o <= c) - 1;
                for k in x.colind()[c]..x.colind()[c + 1] {
                    let r = x.row()[k];
                    if r >= rows[part] && r < rows[part + 1] {
                        sources[part].push(k);
                    }
                }
            }
            sources
        }
    }
}

pub fn concat<E: Element>(kind: ConcatKind, parts: &[&Matrix<E>], out: &Sparsity) -> Matrix<E> {
    let patterns: Vec<Sparsity> = parts.iter().map(|m| m.sparsity.clone()).collect();
    Matrix {
        sparsity: out.clone(),
        nonzeros: concat_sources(kind, &patterns)
            .into_iter()
            .map(|(p, k)| parts[p].nonzeros[k])
            .collect(),
    }
}

pub fn split<E: Element>(kind: &SplitKind, x: &Matrix<E>, outs: &[Sparsity]) -> Vec<Matrix<E>> {
    split_sources(kind, &x.sparsity)
        .into_iter()
        .zip(outs)
        .map(|(sources, sp)| Matrix {
            sparsity: sp.clone(),
            nonzeros: sources.into_iter().map(|k| x.nonzeros[k]).collect(),
        })
        .collect()
}

/// Dense inverse of a square matrix.
pub fn inverse<E: Element>(x: &Matrix<E>) -> Matrix<E> {
    let n = x.sparsity.nrow();
    let mut a = x.to_dense();
    let mut b = Matrix::<E>::filled(&Sparsity::diag(n), E::from_f64(1.0)).to_dense();
    E::dense_solve(&mut a, &mut b, n, n, false);
    Matrix {
        sparsity: Sparsity::dense(n, n),
        nonzeros: b,
    }
}

/// Dense solution of `A x = b` (or `A^T x = b`).
pub fn solve<E: Element>(a: &Matrix<E>, b: &Matrix<E>, transpose: bool) -> Matrix<E> {
    let (n, m) = (b.sparsity.nrow(), b.sparsity.ncol());
    let mut dense_a = a.to_dense();
    let mut x = b.to_dense();
    E::dense_solve(&mut dense_a, &mut x, n, m, transpose);
    Matrix {
        sparsity: Sparsity::dense(n, m),
        nonzeros: x,
    }
}

/// Sum of the elementwise product of two equally shaped matrices.
pub fn inner_prod<E: Element>(x: &Matrix<E>, y: &Matrix<E>) -> Result<Matrix<E>, GraphError> {
    let y_on_x = y.project(&x.sparsity)?;
    let value = x
        .nonzeros
        .iter()
        .zip(&y_on_x.nonzeros)
        .fold(E::zero(), |acc, (&a, &b)| acc.add(a.mul(b)));
    Ok(Matrix {
        sparsity: Sparsity::scalar(),
        nonzeros: vec![value],
    })
}

pub fn norm<E: Element>(kind: NormKind, x: &Matrix<E>) -> Matrix<E> {
    Matrix {
        sparsity: Sparsity::scalar(),
        nonzeros: vec![E::norm(kind, &x.nonzeros)],
    }
}

/// Gathers nonzeros of `x` by index.
pub fn get_nonzeros<E: Element>(x: &Matrix<E>, indices: &[usize], out: &Sparsity) -> Matrix<E> {
    Matrix {
        sparsity: out.clone(),
        nonzeros: indices.iter().map(|&k| x.nonzeros[k]).collect(),
    }
}

/// Scatter-adds the nonzeros of `x` into a copy of `y`.
pub fn add_nonzeros<E: Element>(y: &Matrix<E>, x: &Matrix<E>, indices: &[usize]) -> Matrix<E> {
    let mut result = y.clone();
    for (&k, &v) in indices.iter().zip(&x.nonzeros) {
        result.nonzeros[k] = result.nonzeros[k].add(v);
    }
    result
}

/// Overwrites nonzeros of a copy of `y` with the nonzeros of `x`.
pub fn set_nonzeros<E: Element>(y: &Matrix<E>, x: &Matrix<E>, indices: &[usize]) -> Matrix<E> {
    let mut result = y.clone();
    for (&k, &v) in indices.iter().zip(&x.nonzeros) {
        result.nonzeros[k] = v;
    }
    result
}

/// Passes `x` through if `cond` holds.
pub fn assertion<E: Element>(x: &Matrix<E>, cond: &Matrix<E>, message: &str) -> Result<Matrix<E>, GraphError> {
    let value = cond.nonzeros.first().copied().unwrap_or(E::zero());
    E::check_assertion(value, message)?;
    Ok(x.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn m(rows: &[&[f64]]) -> Matrix {
        Matrix::from_rows(&rows.iter().map(|r| r.to_vec()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_from_rows_is_column_major() {
        let a = m(&[&[1.0, 2.0], &[3.0, 4.0]]);
        assert_eq!(a.nonzeros(), &[1.0, 3.0, 2.0, 4.0]);
        assert_eq!(a.get(0, 1), 2.0);
        assert_eq!(a.to_rows(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_new_checks_length() {
        assert!(matches!(
            Matrix::new(Sparsity::dense(2, 2), vec![1.0]),
            Err(GraphError::InvalidInputLength { expected: 4, got: 1 })
        ));
    }

    #[test]
    fn test_mul_add_sparse_result() {
        let x = m(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let y = m(&[&[5.0, 6.0], &[7.0, 8.0]]);
        let z0 = Matrix::filled(&Sparsity::diag(2), 1.0);
        let z = mul_add(&z0, &x, &y);
        assert_eq!(z.nonzeros(), &[1.0 + 19.0, 1.0 + 50.0]);
    }

    #[test]
    fn test_unary_dense_result() {
        let x = Matrix::filled(&Sparsity::diag(2), 0.5);
        let out = unary(UnaryOp::Cos, &x, &Sparsity::dense(2, 2)).unwrap();
        assert_eq!(out.get(1, 0), 1.0);
        assert_relative_eq!(out.get(0, 0), 0.5f64.cos());
    }

    #[test]
    fn test_binary_broadcast() {
        let x = m(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let s = Matrix::scalar(2.0);
        let out = binary(BinaryOp::Div, &x, &s, x.sparsity()).unwrap();
        assert_eq!(out.nonzeros(), &[0.5, 1.5, 1.0, 2.0]);
        let out = binary(BinaryOp::Sub, &s, &x, x.sparsity()).unwrap();
        assert_eq!(out.nonzeros(), &[1.0, -1.0, 0.0, -2.0]);
    }

    #[test]
    fn test_inverse_and_solve() {
        let a = m(&[&[4.0, 7.0], &[2.0, 6.0]]);
        let inv = inverse(&a);
        let expected = [0.6, -0.2, -0.7, 0.4];
        for (v, e) in inv.nonzeros().iter().zip(expected) {
            assert_relative_eq!(*v, e, epsilon = 1e-12);
        }
        let b = Matrix::column(&[1.0, 2.0]);
        let x = solve(&a, &b, true);
        // A^T x = b
        assert_relative_eq!(4.0 * x.nonzeros()[0] + 2.0 * x.nonzeros()[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(7.0 * x.nonzeros()[0] + 6.0 * x.nonzeros()[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pivoting_needed() {
        let a = m(&[&[0.0, 1.0], &[1.0, 0.0]]);
        let x = solve(&a, &Matrix::column(&[3.0, 5.0]), false);
        assert_eq!(x.nonzeros(), &[5.0, 3.0]);
    }

    #[test]
    fn test_split_and_concat() {
        let x = m(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
        let kind = SplitKind::Vert(vec![0, 1, 2]);
        let outs = x.sparsity().vertsplit(&[0, 1, 2]).unwrap();
        let parts = split(&kind, &x, &outs);
        assert_eq!(parts[1].nonzeros(), &[4.0, 5.0, 6.0]);
        let refs: Vec<&Matrix> = parts.iter().collect();
        let back = concat(ConcatKind::Vert, &refs, x.sparsity());
        assert_eq!(back, x);
    }

    #[test]
    fn test_nonzero_gather_scatter() {
        let x = Matrix::column(&[1.0, 2.0, 3.0]);
        let g = get_nonzeros(&x, &[2, 0], &Sparsity::dense(2, 1));
        assert_eq!(g.nonzeros(), &[3.0, 1.0]);
        let s = add_nonzeros(&x, &g, &[0, 0]);
        assert_eq!(s.nonzeros(), &[5.0, 2.0, 3.0]);
        let s = set_nonzeros(&x, &g, &[1, 0]);
        assert_eq!(s.nonzeros(), &[1.0, 3.0, 3.0]);
    }

    #[test]
    fn test_assertion() {
        let x = Matrix::scalar(3.0);
        assert_eq!(assertion(&x, &Matrix::scalar(1.0), "ok").unwrap(), x);
        assert_eq!(
            assertion(&x, &Matrix::scalar(0.0), "x must be positive"),
            Err(GraphError::AssertionFailure("x must be positive".into()))
        );
    }

    #[test]
    fn test_bitword_semantics() {
        let a = Matrix::new(Sparsity::dense(1, 2), vec![BitWord(0b01), BitWord(0b10)]).unwrap();
        let b = Matrix::new(Sparsity::dense(2, 1), vec![BitWord(0b100), BitWord(0)]).unwrap();
        let z = mul_add(&Matrix::zeros(&Sparsity::scalar()), &a, &b);
        assert_eq!(z.nonzeros(), &[BitWord(0b111)]);
        assert!(BitWord::bit(3).is_set(3));
    }

    #[test]
    fn test_norms() {
        let x = Matrix::column(&[3.0, -4.0]);
        assert_eq!(norm(NormKind::Frobenius, &x).nonzeros(), &[5.0]);
        assert_eq!(norm(NormKind::One, &x).nonzeros(), &[7.0]);
        assert_eq!(norm(NormKind::Inf, &x).nonzeros(), &[4.0]);
        let empty = Matrix::<f64>::zeros(&Sparsity::sparse(3, 3));
        assert_eq!(norm(NormKind::Inf, &empty).nonzeros(), &[0.0]);
    }
}
