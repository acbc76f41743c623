//! Immutable sparsity patterns in compressed column storage.
//!
//! A [`Sparsity`] records which entries of an `nrow x ncol` matrix are structurally
//! nonzero. Patterns are interned: constructing a pattern that is structurally equal
//! to a live one returns the same shared allocation, so equality checks are usually a
//! pointer comparison and patterns can be cloned freely.
//!
//! Row indices are kept sorted within each column. All constructors canonicalise their
//! input, which keeps the nonzero order of every pattern column-major.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use crate::errors::GraphError;

/// Matrix dimensions as `(rows, columns)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape {
    pub nrow: usize,
    pub ncol: usize,
}

impl Shape {
    pub fn new(nrow: usize, ncol: usize) -> Self {
        Shape { nrow, ncol }
    }

    pub fn numel(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_scalar(&self) -> bool {
        self.nrow == 1 && self.ncol == 1
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.nrow, self.ncol)
    }
}

struct Pattern {
    nrow: usize,
    ncol: usize,
    colind: Vec<usize>,
    row: Vec<usize>,
    fingerprint: u64,
}

impl Pattern {
    fn same_structure(&self, nrow: usize, ncol: usize, colind: &[usize], row: &[usize]) -> bool {
        self.nrow == nrow && self.ncol == ncol && self.colind == colind && self.row == row
    }
}

/// Fewest buckets at which dead entries are swept.
const MIN_SWEEP: usize = 64;

/// Weak references to every live pattern, bucketed by fingerprint.
struct InternTable {
    buckets: HashMap<u64, Vec<Weak<Pattern>>>,
    /// Bucket count that triggers the next sweep
    sweep_at: usize,
}

impl InternTable {
    /// Drops buckets whose patterns are all gone once the table has doubled since the
    /// last sweep, which keeps the amortized cost per insertion constant.
    fn maybe_sweep(&mut self) {
        if self.buckets.len() <= self.sweep_at {
            return;
        }
        self.buckets.retain(|_, bucket| {
            bucket.retain(|weak| weak.strong_count() > 0);
            !bucket.is_empty()
        });
        self.sweep_at = MIN_SWEEP.max(2 * self.buckets.len());
    }
}

fn intern_table() -> &'static Mutex<InternTable> {
    static TABLE: OnceLock<Mutex<InternTable>> = OnceLock::new();
    TABLE.get_or_init(|| {
        Mutex::new(InternTable {
            buckets: HashMap::new(),
            sweep_at: MIN_SWEEP,
        })
    })
}

fn fingerprint(nrow: usize, ncol: usize, colind: &[usize], row: &[usize]) -> u64 {
    let mut hasher = DefaultHasher::new();
    nrow.hash(&mut hasher);
    ncol.hash(&mut hasher);
    colind.hash(&mut hasher);
    row.hash(&mut hasher);
    hasher.finish()
}

/// Shared, immutable nonzero structure of a matrix.
#[derive(Clone)]
pub struct Sparsity(Arc<Pattern>);

impl Sparsity {
    /// Interns an already canonical pattern.
    fn from_canonical(nrow: usize, ncol: usize, colind: Vec<usize>, row: Vec<usize>) -> Self {
        let fp = fingerprint(nrow, ncol, &colind, &row);
        let mut table = intern_table()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let bucket = table.buckets.entry(fp).or_default();
        bucket.retain(|weak| weak.strong_count() > 0);
        for weak in bucket.iter() {
            if let Some(existing) = weak.upgrade() {
                if existing.same_structure(nrow, ncol, &colind, &row) {
                    return Sparsity(existing);
                }
            }
        }
        let pattern = Arc::new(Pattern {
            nrow,
            ncol,
            colind,
            row,
            fingerprint: fp,
        });
        bucket.push(Arc::downgrade(&pattern));
        table.maybe_sweep();
        Sparsity(pattern)
    }

    /// Creates a pattern from compressed column storage.
    ///
    /// Row indices within a column may be given in any order; they are sorted.
    ///
    /// # Errors
    /// Returns a `StructuralError` if the column offsets are malformed, a row index is
    /// out of range or an entry is repeated.
    pub fn new(
        nrow: usize,
        ncol: usize,
        colind: Vec<usize>,
        mut row: Vec<usize>,
    ) -> Result<Self, GraphError> {
        if colind.len() != ncol + 1 || colind[0] != 0 {
            return Err(GraphError::structural(format!(
                "column offsets must have length {} and start at 0",
                ncol + 1
            )));
        }
        if colind.windows(2).any(|w| w[0] > w[1]) || colind[ncol] != row.len() {
            return Err(GraphError::structural(
                "column offsets must be monotone and end at the number of nonzeros",
            ));
        }
        for c in 0..ncol {
            let column = &mut row[colind[c]..colind[c + 1]];
            column.sort_unstable();
            if column.windows(2).any(|w| w[0] == w[1]) {
                return Err(GraphError::structural(format!(
                    "duplicate entry in column {c}"
                )));
            }
            if let Some(&r) = column.last() {
                if r >= nrow {
                    return Err(GraphError::IndexOutOfRange {
                        what: "row",
                        index: r,
                        len: nrow,
                    });
                }
            }
        }
        Ok(Self::from_canonical(nrow, ncol, colind, row))
    }

    /// Creates a pattern from (row, column) pairs.
    ///
    /// Returns the pattern together with the nonzero index of every pair. Repeated
    /// pairs map to the same nonzero.
    pub fn from_triplets(
        nrow: usize,
        ncol: usize,
        rows: &[usize],
        cols: &[usize],
    ) -> Result<(Self, Vec<usize>), GraphError> {
        if rows.len() != cols.len() {
            return Err(GraphError::InvalidInputLength {
                expected: rows.len(),
                got: cols.len(),
            });
        }
        for (&r, &c) in rows.iter().zip(cols) {
            if r >= nrow {
                return Err(GraphError::IndexOutOfRange {
                    what: "row",
                    index: r,
                    len: nrow,
                });
            }
            if c >= ncol {
                return Err(GraphError::IndexOutOfRange {
                    what: "column",
                    index: c,
                    len: ncol,
                });
            }
        }
        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.sort_unstable_by_key(|&k| (cols[k], rows[k]));

        let mut colind = vec![0; ncol + 1];
        let mut row = Vec::with_capacity(rows.len());
        let mut mapping = vec![0; rows.len()];
        let mut last: Option<(usize, usize)> = None;
        for k in order {
            let entry = (cols[k], rows[k]);
            if last != Some(entry) {
                row.push(rows[k]);
                colind[cols[k] + 1] += 1;
                last = Some(entry);
            }
            mapping[k] = row.len() - 1;
        }
        for c in 0..ncol {
            colind[c + 1] += colind[c];
        }
        Ok((Self::from_canonical(nrow, ncol, colind, row), mapping))
    }

    /// Fully populated `nrow x ncol` pattern.
    pub fn dense(nrow: usize, ncol: usize) -> Self {
        let colind = (0..=ncol).map(|c| c * nrow).collect();
        let row = (0..ncol).flat_map(|_| 0..nrow).collect();
        Self::from_canonical(nrow, ncol, colind, row)
    }

    /// Structurally empty `nrow x ncol` pattern.
    pub fn sparse(nrow: usize, ncol: usize) -> Self {
        Self::from_canonical(nrow, ncol, vec![0; ncol + 1], Vec::new())
    }

    /// Dense 1x1 pattern.
    pub fn scalar() -> Self {
        Self::dense(1, 1)
    }

    /// Diagonal `n x n` pattern.
    pub fn diag(n: usize) -> Self {
        Self::from_canonical(n, n, (0..=n).collect(), (0..n).collect())
    }

    pub fn nrow(&self) -> usize {
        self.0.nrow
    }

    pub fn ncol(&self) -> usize {
        self.0.ncol
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.0.nrow, self.0.ncol)
    }

    pub fn numel(&self) -> usize {
        self.0.nrow * self.0.ncol
    }

    pub fn nnz(&self) -> usize {
        self.0.row.len()
    }

    /// Column offsets, of length `ncol + 1`.
    pub fn colind(&self) -> &[usize] {
        &self.0.colind
    }

    /// Row index of every nonzero, column by column.
    pub fn row(&self) -> &[usize] {
        &self.0.row
    }

    pub fn is_dense(&self) -> bool {
        self.nnz() == self.numel()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape().is_scalar()
    }

    pub fn is_square(&self) -> bool {
        self.0.nrow == self.0.ncol
    }

    pub fn is_vector(&self) -> bool {
        self.0.nrow == 1 || self.0.ncol == 1
    }

    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// True if both handles share one allocation.
    pub fn ptr_eq(&self, other: &Sparsity) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Nonzero index of entry `(row, col)`, if it is structurally nonzero.
    pub fn get_nz(&self, row: usize, col: usize) -> Option<usize> {
        if col >= self.ncol() {
            return None;
        }
        let start = self.0.colind[col];
        let column = &self.0.row[start..self.0.colind[col + 1]];
        column.binary_search(&row).ok().map(|k| start + k)
    }

    /// Column index of every nonzero.
    pub fn col(&self) -> Vec<usize> {
        let mut col = Vec::with_capacity(self.nnz());
        for c in 0..self.ncol() {
            col.extend(std::iter::repeat(c).take(self.0.colind[c + 1] - self.0.colind[c]));
        }
        col
    }

    /// `(row, column)` of every nonzero, in nonzero order.
    pub fn triplets(&self) -> Vec<(usize, usize)> {
        self.row().iter().copied().zip(self.col()).collect()
    }

    /// Column-major linear index of every nonzero.
    pub fn linear_indices(&self) -> Vec<usize> {
        let nrow = self.nrow();
        self.triplets().into_iter().map(|(r, c)| c * nrow + r).collect()
    }

    /// For every nonzero of `target`, the index of the same entry in `self`.
    ///
    /// Both patterns must have the same shape.
    pub fn nz_map(&self, target: &Sparsity) -> Result<Vec<Option<usize>>, GraphError> {
        if self.shape() != target.shape() {
            return Err(GraphError::dimension("project", self.shape(), target.shape()));
        }
        if self.ptr_eq(target) {
            return Ok((0..self.nnz()).map(Some).collect());
        }
        let mut map = Vec::with_capacity(target.nnz());
        for c in 0..self.ncol() {
            let mut k = self.0.colind[c];
            let end = self.0.colind[c + 1];
            for &r in &target.row()[target.colind()[c]..target.colind()[c + 1]] {
                while k < end && self.0.row[k] < r {
                    k += 1;
                }
                map.push((k < end && self.0.row[k] == r).then_some(k));
            }
        }
        Ok(map)
    }

    /// Transposed pattern and, for each of its nonzeros, the source nonzero in `self`.
    pub fn transpose_with_mapping(&self) -> (Sparsity, Vec<usize>) {
        let (nrow, ncol) = (self.nrow(), self.ncol());
        let mut colind = vec![0; nrow + 1];
        for &r in self.row() {
            colind[r + 1] += 1;
        }
        for r in 0..nrow {
            colind[r + 1] += colind[r];
        }
        let mut next = colind.clone();
        let mut row = vec![0; self.nnz()];
        let mut mapping = vec![0; self.nnz()];
        for c in 0..ncol {
            for k in self.0.colind[c]..self.0.colind[c + 1] {
                let r = self.0.row[k];
                let dst = next[r];
                row[dst] = c;
                mapping[dst] = k;
                next[r] += 1;
            }
        }
        (Self::from_canonical(ncol, nrow, colind, row), mapping)
    }

    pub fn transpose(&self) -> Sparsity {
        self.transpose_with_mapping().0
    }

    /// Reinterprets the pattern with a new shape of the same size.
    ///
    /// The column-major linear order of the nonzeros is preserved.
    pub fn reshape(&self, nrow: usize, ncol: usize) -> Result<Sparsity, GraphError> {
        if nrow * ncol != self.numel() {
            return Err(GraphError::dimension(
                "reshape",
                self.shape(),
                Shape::new(nrow, ncol),
            ));
        }
        if nrow == self.nrow() && ncol == self.ncol() {
            return Ok(self.clone());
        }
        let mut colind = vec![0; ncol + 1];
        let mut row = Vec::with_capacity(self.nnz());
        for lin in self.linear_indices() {
            row.push(lin % nrow);
            colind[lin / nrow + 1] += 1;
        }
        for c in 0..ncol {
            colind[c + 1] += colind[c];
        }
        Ok(Self::from_canonical(nrow, ncol, colind, row))
    }

    fn merge(&self, other: &Sparsity, union: bool, operation: &str) -> Result<Sparsity, GraphError> {
        if self.shape() != other.shape() {
            return Err(GraphError::dimension(operation, self.shape(), other.shape()));
        }
        if self.ptr_eq(other) {
            return Ok(self.clone());
        }
        let mut colind = vec![0; self.ncol() + 1];
        let mut row = Vec::new();
        for c in 0..self.ncol() {
            let a = &self.row()[self.colind()[c]..self.colind()[c + 1]];
            let b = &other.row()[other.colind()[c]..other.colind()[c + 1]];
            let (mut i, mut j) = (0, 0);
            while i < a.len() || j < b.len() {
                let next_a = a.get(i).copied().unwrap_or(usize::MAX);
                let next_b = b.get(j).copied().unwrap_or(usize::MAX);
                if next_a == next_b {
                    row.push(next_a);
                    i += 1;
                    j += 1;
                } else if next_a < next_b {
                    if union {
                        row.push(next_a);
                    }
                    i += 1;
                } else {
                    if union {
                        row.push(next_b);
                    }
                    j += 1;
                }
            }
            colind[c + 1] = row.len();
        }
        Ok(Self::from_canonical(self.nrow(), self.ncol(), colind, row))
    }

    /// Entries nonzero in either pattern.
    pub fn unite(&self, other: &Sparsity) -> Result<Sparsity, GraphError> {
        self.merge(other, true, "unite")
    }

    /// Entries nonzero in both patterns.
    pub fn intersect(&self, other: &Sparsity) -> Result<Sparsity, GraphError> {
        self.merge(other, false, "intersect")
    }

    /// Side-by-side concatenation; all parts must have the same number of rows.
    pub fn horzcat(parts: &[Sparsity]) -> Result<Sparsity, GraphError> {
        let Some(first) = parts.first() else {
            return Ok(Sparsity::sparse(0, 0));
        };
        let nrow = first.nrow();
        let mut colind = vec![0];
        let mut row = Vec::new();
        for part in parts {
            if part.nrow() != nrow {
                return Err(GraphError::dimension("horzcat", first.shape(), part.shape()));
            }
            let offset = row.len();
            colind.extend(part.colind()[1..].iter().map(|&k| k + offset));
            row.extend_from_slice(part.row());
        }
        let ncol = colind.len() - 1;
        Ok(Self::from_canonical(nrow, ncol, colind, row))
    }

    /// Stacked concatenation; all parts must have the same number of columns.
    pub fn vertcat(parts: &[Sparsity]) -> Result<Sparsity, GraphError> {
        let Some(first) = parts.first() else {
            return Ok(Sparsity::sparse(0, 0));
        };
        let ncol = first.ncol();
        for part in parts {
            if part.ncol() != ncol {
                return Err(GraphError::dimension("vertcat", first.shape(), part.shape()));
            }
        }
        let nrow = parts.iter().map(Sparsity::nrow).sum();
        let mut colind = vec![0; ncol + 1];
        let mut row = Vec::with_capacity(parts.iter().map(Sparsity::nnz).sum());
        for c in 0..ncol {
            let mut offset = 0;
            for part in parts {
                row.extend(
                    part.row()[part.colind()[c]..part.colind()[c + 1]]
                        .iter()
                        .map(|&r| r + offset),
                );
                offset += part.nrow();
            }
            colind[c + 1] = row.len();
        }
        Ok(Self::from_canonical(nrow, ncol, colind, row))
    }

    /// Block-diagonal concatenation.
    pub fn blkdiag(parts: &[Sparsity]) -> Sparsity {
        let mut colind = vec![0];
        let mut row = Vec::new();
        let mut row_offset = 0;
        for part in parts {
            let offset = row.len();
            colind.extend(part.colind()[1..].iter().map(|&k| k + offset));
            row.extend(part.row().iter().map(|&r| r + row_offset));
            row_offset += part.nrow();
        }
        let ncol = colind.len() - 1;
        Self::from_canonical(row_offset, ncol, colind, row)
    }

    /// Structure of the matrix product `a * b`.
    ///
    /// Entry `(i, k)` is nonzero exactly when some `j` has both `a(i, j)` and `b(j, k)`
    /// structurally nonzero.
    pub fn mul(a: &Sparsity, b: &Sparsity) -> Result<Sparsity, GraphError> {
        if a.ncol() != b.nrow() {
            return Err(GraphError::dimension("mul", a.shape(), b.shape()));
        }
        let mut colind = vec![0; b.ncol() + 1];
        let mut row = Vec::new();
        let mut marker = vec![usize::MAX; a.nrow()];
        for k in 0..b.ncol() {
            let start = row.len();
            for &j in &b.row()[b.colind()[k]..b.colind()[k + 1]] {
                for &i in &a.row()[a.colind()[j]..a.colind()[j + 1]] {
                    if marker[i] != k {
                        marker[i] = k;
                        row.push(i);
                    }
                }
            }
            row[start..].sort_unstable();
            colind[k + 1] = row.len();
        }
        Ok(Self::from_canonical(a.nrow(), b.ncol(), colind, row))
    }

    /// Union of the pattern with its transpose (square patterns only).
    pub fn symmetrize(&self) -> Result<Sparsity, GraphError> {
        if !self.is_square() {
            return Err(GraphError::structural(format!(
                "symmetric pattern requested for non-square {}",
                self.shape()
            )));
        }
        self.unite(&self.transpose())
    }

    /// Splits the columns at the given offsets.
    pub fn horzsplit(&self, offsets: &[usize]) -> Result<Vec<Sparsity>, GraphError> {
        check_offsets(offsets, self.ncol(), "horzsplit")?;
        Ok(offsets
            .windows(2)
            .map(|w| {
                let base = self.colind()[w[0]];
                let colind = self.colind()[w[0]..=w[1]].iter().map(|&k| k - base).collect();
                let row = self.row()[base..self.colind()[w[1]]].to_vec();
                Self::from_canonical(self.nrow(), w[1] - w[0], colind, row)
            })
            .collect())
    }

    /// Splits the rows at the given offsets.
    pub fn vertsplit(&self, offsets: &[usize]) -> Result<Vec<Sparsity>, GraphError> {
        check_offsets(offsets, self.nrow(), "vertsplit")?;
        Ok(offsets
            .windows(2)
            .map(|w| self.block(w[0]..w[1], 0..self.ncol()))
            .collect())
    }

    /// Extracts the diagonal blocks delimited by the row and column offsets.
    ///
    /// # Errors
    /// `StructuralError` if the offsets are invalid or a nonzero lies outside every
    /// diagonal block.
    pub fn diagsplit(
        &self,
        row_offsets: &[usize],
        col_offsets: &[usize],
    ) -> Result<Vec<Sparsity>, GraphError> {
        check_offsets(row_offsets, self.nrow(), "diagsplit")?;
        check_offsets(col_offsets, self.ncol(), "diagsplit")?;
        if row_offsets.len() != col_offsets.len() {
            return Err(GraphError::structural(format!(
                "diagsplit needs as many row offsets as column offsets, got {} and {}",
                row_offsets.len(),
                col_offsets.len()
            )));
        }
        let blocks: Vec<Sparsity> = row_offsets
            .windows(2)
            .zip(col_offsets.windows(2))
            .map(|(r, c)| self.block(r[0]..r[1], c[0]..c[1]))
            .collect();
        let kept: usize = blocks.iter().map(Sparsity::nnz).sum();
        if kept != self.nnz() {
            return Err(GraphError::structural(format!(
                "diagsplit: {} nonzeros lie outside the diagonal blocks",
                self.nnz() - kept
            )));
        }
        Ok(blocks)
    }

    /// Contiguous sub-block with rows and columns shifted to start at zero.
    fn block(&self, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Sparsity {
        let mut colind = vec![0; cols.len() + 1];
        let mut row = Vec::new();
        for (j, c) in cols.clone().enumerate() {
            row.extend(
                self.row()[self.colind()[c]..self.colind()[c + 1]]
                    .iter()
                    .filter(|r| rows.contains(r))
                    .map(|&r| r - rows.start),
            );
            colind[j + 1] = row.len();
        }
        Self::from_canonical(rows.len(), cols.len(), colind, row)
    }

    /// Selects rows and columns in the given order (repetition allowed).
    ///
    /// Returns the pattern of the selection and, for each of its nonzeros, the source
    /// nonzero in `self`.
    pub fn sub(&self, rows: &[usize], cols: &[usize]) -> Result<(Sparsity, Vec<usize>), GraphError> {
        let mut positions: Vec<Vec<usize>> = vec![Vec::new(); self.nrow()];
        for (i, &r) in rows.iter().enumerate() {
            positions
                .get_mut(r)
                .ok_or(GraphError::IndexOutOfRange {
                    what: "row",
                    index: r,
                    len: self.nrow(),
                })?
                .push(i);
        }
        let mut colind = vec![0; cols.len() + 1];
        let mut row = Vec::new();
        let mut mapping = Vec::new();
        let mut column: Vec<(usize, usize)> = Vec::new();
        for (j, &c) in cols.iter().enumerate() {
            if c >= self.ncol() {
                return Err(GraphError::IndexOutOfRange {
                    what: "column",
                    index: c,
                    len: self.ncol(),
                });
            }
            column.clear();
            for k in self.colind()[c]..self.colind()[c + 1] {
                column.extend(positions[self.row()[k]].iter().map(|&i| (i, k)));
            }
            column.sort_unstable();
            row.extend(column.iter().map(|&(i, _)| i));
            mapping.extend(column.iter().map(|&(_, k)| k));
            colind[j + 1] = row.len();
        }
        Ok((
            Self::from_canonical(rows.len(), cols.len(), colind, row),
            mapping,
        ))
    }

    /// Row/column permutation: entry `(i, j)` of the result is entry
    /// `(rowperm[i], colperm[j])` of `self`.
    pub fn permute(&self, rowperm: &[usize], colperm: &[usize]) -> Result<Sparsity, GraphError> {
        Ok(self.sub(rowperm, colperm)?.0)
    }

    /// Dense boolean rendering, one string per row (`*` nonzero, `.` zero).
    pub fn spy(&self) -> Vec<String> {
        let mut rows = vec![vec!['.'; self.ncol()]; self.nrow()];
        for (r, c) in self.triplets() {
            rows[r][c] = '*';
        }
        rows.into_iter().map(|r| r.into_iter().collect()).collect()
    }
}

fn check_offsets(offsets: &[usize], extent: usize, operation: &str) -> Result<(), GraphError> {
    let valid = offsets.first() == Some(&0)
        && offsets.last() == Some(&extent)
        && offsets.windows(2).all(|w| w[0] <= w[1]);
    if valid {
        Ok(())
    } else {
        Err(GraphError::structural(format!(
            "{operation}: offsets {offsets:?} must be monotone from 0 to {extent}"
        )))
    }
}

impl PartialEq for Sparsity {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.0.fingerprint == other.0.fingerprint
                && other
                    .0
                    .same_structure(self.0.nrow, self.0.ncol, &self.0.colind, &self.0.row))
    }
}

impl Eq for Sparsity {}

impl Hash for Sparsity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.fingerprint.hash(state);
    }
}

impl fmt::Debug for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sparsity({}, nnz={})", self.shape(), self.nnz())
    }
}

impl fmt::Display for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dense() {
            write!(f, "{}", self.shape())
        } else {
            write!(f, "{}, {} nnz", self.shape(), self.nnz())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(nrow: usize, ncol: usize, entries: &[(usize, usize)]) -> Sparsity {
        let rows: Vec<usize> = entries.iter().map(|e| e.0).collect();
        let cols: Vec<usize> = entries.iter().map(|e| e.1).collect();
        Sparsity::from_triplets(nrow, ncol, &rows, &cols).unwrap().0
    }

    fn arb_pattern(max_dim: usize) -> impl Strategy<Value = Sparsity> {
        (1..=max_dim, 1..=max_dim).prop_flat_map(|(nrow, ncol)| {
            proptest::collection::vec(any::<bool>(), nrow * ncol).prop_map(move |mask| {
                let entries: Vec<(usize, usize)> = mask
                    .iter()
                    .enumerate()
                    .filter(|(_, &m)| m)
                    .map(|(lin, _)| (lin % nrow, lin / nrow))
                    .collect();
                pattern(nrow, ncol, &entries)
            })
        })
    }

    #[test]
    fn test_interning_shares_allocation() {
        let a = Sparsity::dense(3, 2);
        let b = Sparsity::new(3, 2, vec![0, 3, 6], vec![2, 1, 0, 0, 1, 2]).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&Sparsity::dense(2, 3)));
    }

    #[test]
    fn test_intern_table_forgets_dropped_patterns() {
        let kept = Sparsity::sparse(7, 3);
        for n in 0..20_000 {
            drop(Sparsity::sparse(1_000_000 + n, 1));
        }
        let table = intern_table().lock().unwrap_or_else(PoisonError::into_inner);
        // Patterns alive in concurrently running tests stay, the dropped ones do not.
        assert!(table.buckets.len() < 5_000, "{} buckets", table.buckets.len());
        drop(table);
        assert!(kept.ptr_eq(&Sparsity::sparse(7, 3)));
    }

    #[test]
    fn test_new_rejects_bad_input() {
        assert!(matches!(
            Sparsity::new(2, 1, vec![0, 2], vec![0, 0]),
            Err(GraphError::StructuralError(_))
        ));
        assert!(matches!(
            Sparsity::new(2, 1, vec![0, 1], vec![5]),
            Err(GraphError::IndexOutOfRange { .. })
        ));
        assert!(Sparsity::new(2, 2, vec![0, 1], vec![0]).is_err());
    }

    #[test]
    fn test_triplets_merge_duplicates() {
        let (sp, mapping) = Sparsity::from_triplets(3, 3, &[2, 0, 2], &[1, 1, 1]).unwrap();
        assert_eq!(sp.nnz(), 2);
        assert_eq!(sp.row(), &[0, 2]);
        assert_eq!(mapping, vec![1, 0, 1]);
        assert_eq!(sp.get_nz(2, 1), Some(1));
        assert_eq!(sp.get_nz(1, 1), None);
    }

    #[test]
    fn test_transpose_mapping() {
        let sp = pattern(2, 3, &[(0, 0), (1, 0), (1, 2)]);
        let (t, mapping) = sp.transpose_with_mapping();
        assert_eq!(t.shape(), Shape::new(3, 2));
        assert_eq!(t.triplets(), vec![(0, 0), (0, 1), (2, 1)]);
        assert_eq!(mapping, vec![0, 1, 2]);
    }

    #[test]
    fn test_reshape_preserves_linear_order() {
        let sp = pattern(2, 3, &[(1, 0), (0, 2)]);
        let r = sp.reshape(3, 2).unwrap();
        assert_eq!(r.linear_indices(), sp.linear_indices());
        assert!(matches!(
            sp.reshape(4, 2),
            Err(GraphError::DimensionError { .. })
        ));
    }

    #[test]
    fn test_concat_shapes() {
        let a = Sparsity::dense(2, 1);
        let b = Sparsity::diag(2);
        let h = Sparsity::horzcat(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(h.shape(), Shape::new(2, 3));
        assert_eq!(h.nnz(), 4);
        let v = Sparsity::vertcat(&[b.clone(), Sparsity::dense(1, 2)]).unwrap();
        assert_eq!(v.spy(), vec!["*.", ".*", "**"]);
        let d = Sparsity::blkdiag(&[a.clone(), b]);
        assert_eq!(d.shape(), Shape::new(4, 3));
        let err = Sparsity::horzcat(&[a, Sparsity::dense(3, 1)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "dimension mismatch in horzcat: 2x1 vs 3x1"
        );
    }

    #[test]
    fn test_mul_dimension_error() {
        let err = Sparsity::mul(&Sparsity::dense(2, 3), &Sparsity::dense(2, 3)).unwrap_err();
        assert_eq!(
            err,
            GraphError::dimension("mul", Shape::new(2, 3), Shape::new(2, 3))
        );
    }

    #[test]
    fn test_diagsplit_rejects_offdiagonal() {
        let sp = pattern(3, 3, &[(0, 0), (1, 1), (2, 1), (2, 2)]);
        assert!(matches!(
            sp.diagsplit(&[0, 2, 3], &[0, 2, 3]),
            Err(GraphError::StructuralError(_))
        ));
        let blocks = sp.diagsplit(&[0, 1, 3], &[0, 1, 3]).unwrap();
        assert_eq!(blocks[1].spy(), vec!["*.", "**"]);
    }

    #[test]
    fn test_bad_offsets() {
        let sp = Sparsity::dense(2, 4);
        assert!(sp.horzsplit(&[0, 3, 2, 4]).is_err());
        assert!(sp.horzsplit(&[1, 4]).is_err());
        assert!(sp.vertsplit(&[0, 3]).is_err());
    }

    #[test]
    fn test_sub_with_permutation() {
        let sp = pattern(3, 3, &[(0, 0), (2, 0), (1, 2)]);
        let (s, mapping) = sp.sub(&[2, 0], &[0, 2]).unwrap();
        assert_eq!(s.spy(), vec!["*.", "*."]);
        assert_eq!(mapping, vec![1, 0]);
    }

    proptest! {
        #[test]
        fn prop_transpose_involution(sp in arb_pattern(6)) {
            prop_assert!(sp.transpose().transpose().ptr_eq(&sp));
        }

        #[test]
        fn prop_mul_is_exact_boolean_product(
            a in arb_pattern(5),
            mask in proptest::collection::vec(any::<bool>(), 25),
            ncol in 1usize..5,
        ) {
            let entries: Vec<(usize, usize)> = (0..a.ncol() * ncol)
                .filter(|&lin| mask[lin % mask.len()])
                .map(|lin| (lin % a.ncol(), lin / a.ncol()))
                .collect();
            let b = pattern(a.ncol(), ncol, &entries);
            let product = Sparsity::mul(&a, &b).unwrap();
            for i in 0..a.nrow() {
                for k in 0..b.ncol() {
                    let reachable = (0..a.ncol())
                        .any(|j| a.get_nz(i, j).is_some() && b.get_nz(j, k).is_some());
                    prop_assert_eq!(product.get_nz(i, k).is_some(), reachable);
                }
            }
        }

        #[test]
        fn prop_split_concat_round_trip(sp in arb_pattern(6), cut in 0usize..7) {
            let col_cut = cut.min(sp.ncol());
            let parts = sp.horzsplit(&[0, col_cut, sp.ncol()]).unwrap();
            prop_assert_eq!(Sparsity::horzcat(&parts).unwrap(), sp.clone());
            let row_cut = cut.min(sp.nrow());
            let parts = sp.vertsplit(&[0, row_cut, sp.nrow()]).unwrap();
            prop_assert_eq!(Sparsity::vertcat(&parts).unwrap(), sp.clone());
        }

        #[test]
        fn prop_diagsplit_round_trip(a in arb_pattern(4), b in arb_pattern(4)) {
            let d = Sparsity::blkdiag(&[a.clone(), b.clone()]);
            let rows = [0, a.nrow(), a.nrow() + b.nrow()];
            let cols = [0, a.ncol(), a.ncol() + b.ncol()];
            let parts = d.diagsplit(&rows, &cols).unwrap();
            prop_assert_eq!(&parts[0], &a);
            prop_assert_eq!(&parts[1], &b);
            prop_assert_eq!(Sparsity::blkdiag(&parts), d);
        }

        #[test]
        fn prop_union_contains_both(a in arb_pattern(4)) {
            let t = a.transpose().reshape(a.nrow(), a.ncol()).unwrap();
            let u = a.unite(&t).unwrap();
            let i = a.intersect(&t).unwrap();
            prop_assert_eq!(u.nnz() + i.nnz(), a.nnz() + t.nnz());
            prop_assert!(a.nz_map(&u).unwrap().iter().filter(|m| m.is_some()).count() == a.nnz());
        }
    }
}
