//! Dulmage-Mendelsohn decomposition of sparsity patterns.
//!
//! Rows are read as equations and columns as variables. The decomposition permutes both
//! so that the permuted pattern is block lower-triangular:
//!
//! - the overdetermined part (more equations than variables) comes first,
//! - the square part follows, split into its strongly connected blocks in an order
//!   where every block only depends on blocks before it,
//! - the underdetermined part (more variables than equations) comes last.
//!
//! Solving the blocks of the square part one after another, each with the variables of
//! the previous blocks known, is what `explicit` builds on.

use crate::sparsity::Sparsity;

/// Row/column permutations and block boundaries of a Dulmage-Mendelsohn decomposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmDecomposition {
    /// `rowperm[i]` is the original row placed at position `i`
    pub rowperm: Vec<usize>,
    /// `colperm[j]` is the original column placed at position `j`
    pub colperm: Vec<usize>,
    /// Offsets of the fine blocks into `rowperm`
    pub rowblock: Vec<usize>,
    /// Offsets of the fine blocks into `colperm`
    pub colblock: Vec<usize>,
    /// Boundaries `[0, overdetermined, +square, nrow]` of the coarse row partition
    pub coarse_rowblock: [usize; 4],
    /// Boundaries `[0, overdetermined, +square, ncol]` of the coarse column partition
    pub coarse_colblock: [usize; 4],
}

impl DmDecomposition {
    pub fn nblocks(&self) -> usize {
        self.rowblock.len().saturating_sub(1)
    }

    /// Original rows of block `b`.
    pub fn block_rows(&self, b: usize) -> &[usize] {
        &self.rowperm[self.rowblock[b]..self.rowblock[b + 1]]
    }

    /// Original columns of block `b`.
    pub fn block_cols(&self, b: usize) -> &[usize] {
        &self.colperm[self.colblock[b]..self.colblock[b + 1]]
    }

    /// Block index of every permuted row.
    fn row_block_of(&self) -> Vec<usize> {
        expand_blocks(&self.rowblock)
    }

    fn col_block_of(&self) -> Vec<usize> {
        expand_blocks(&self.colblock)
    }
}

fn expand_blocks(offsets: &[usize]) -> Vec<usize> {
    let mut owner = Vec::with_capacity(offsets.last().copied().unwrap_or(0));
    for (b, w) in offsets.windows(2).enumerate() {
        owner.extend(std::iter::repeat(b).take(w[1] - w[0]));
    }
    owner
}

/// Maximum bipartite matching between rows and columns.
struct Matching {
    row_to_col: Vec<Option<usize>>,
    col_to_row: Vec<Option<usize>>,
}

/// Column lists per row, i.e. the rows of the transposed pattern.
fn row_adjacency(sp: &Sparsity) -> Vec<Vec<usize>> {
    let mut adj = vec![Vec::new(); sp.nrow()];
    for (r, c) in sp.triplets() {
        adj[r].push(c);
    }
    adj
}

fn col_adjacency(sp: &Sparsity) -> Vec<&[usize]> {
    (0..sp.ncol())
        .map(|c| &sp.row()[sp.colind()[c]..sp.colind()[c + 1]])
        .collect()
}

fn maximum_matching(adj: &[Vec<usize>], ncol: usize) -> Matching {
    let nrow = adj.len();
    let mut m = Matching {
        row_to_col: vec![None; nrow],
        col_to_row: vec![None; ncol],
    };

    // Cheap greedy pass first; augmenting paths fix up the rest.
    for (r, cols) in adj.iter().enumerate() {
        if let Some(&c) = cols.iter().find(|&&c| m.col_to_row[c].is_none()) {
            m.row_to_col[r] = Some(c);
            m.col_to_row[c] = Some(r);
        }
    }

    let mut visited = vec![usize::MAX; ncol];
    for root in 0..nrow {
        if m.row_to_col[root].is_none() {
            augment(root, adj, &mut m, &mut visited);
        }
    }
    m
}

/// Depth-first search for an augmenting path starting at the unmatched row `root`.
fn augment(root: usize, adj: &[Vec<usize>], m: &mut Matching, visited: &mut [usize]) -> bool {
    let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
    let mut path: Vec<usize> = Vec::new();
    while let Some(&mut (r, ref mut k)) = stack.last_mut() {
        let Some(&c) = adj[r].get(*k) else {
            stack.pop();
            path.pop();
            continue;
        };
        *k += 1;
        if visited[c] == root {
            continue;
        }
        visited[c] = root;
        path.push(c);
        match m.col_to_row[c] {
            None => {
                for (&(row, _), &col) in stack.iter().zip(&path) {
                    m.row_to_col[row] = Some(col);
                    m.col_to_row[col] = Some(row);
                }
                return true;
            }
            Some(next) => stack.push((next, 0)),
        }
    }
    false
}

/// Strongly connected components of the graph `succ`, restricted to `nodes`, emitted so
/// that a component comes after every component it has an edge into.
fn tarjan(nodes: &[usize], succ: &[Vec<usize>], n: usize) -> Vec<Vec<usize>> {
    let mut index = vec![usize::MAX; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut components = Vec::new();
    let mut counter = 0;

    for &start in nodes {
        if index[start] != usize::MAX {
            continue;
        }
        index[start] = counter;
        low[start] = counter;
        counter += 1;
        stack.push(start);
        on_stack[start] = true;
        let mut calls: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(&mut (v, ref mut k)) = calls.last_mut() {
            if let Some(&w) = succ[v].get(*k) {
                *k += 1;
                if index[w] == usize::MAX {
                    index[w] = counter;
                    low[w] = counter;
                    counter += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    calls.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
                continue;
            }
            calls.pop();
            if let Some(&(u, _)) = calls.last() {
                low[u] = low[u].min(low[v]);
            }
            if low[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.reverse();
                components.push(component);
            }
        }
    }
    components
}

impl Sparsity {
    /// Size of a maximum matching between rows and columns.
    pub fn structural_rank(&self) -> usize {
        let adj = row_adjacency(self);
        maximum_matching(&adj, self.ncol())
            .row_to_col
            .iter()
            .filter(|c| c.is_some())
            .count()
    }

    /// Computes the block lower-triangular Dulmage-Mendelsohn decomposition.
    ///
    /// # Returns
    /// Permutations and block offsets such that `self.permute(&rowperm, &colperm)` has no
    /// nonzero above the diagonal blocks.
    pub fn dulmage_mendelsohn(&self) -> DmDecomposition {
        let (nrow, ncol) = (self.nrow(), self.ncol());
        let adj = row_adjacency(self);
        let cadj = col_adjacency(self);
        let m = maximum_matching(&adj, ncol);

        // Overdetermined part: alternating paths from unmatched rows.
        let mut row_over = vec![false; nrow];
        let mut col_over = vec![false; ncol];
        let mut queue: Vec<usize> = (0..nrow).filter(|&r| m.row_to_col[r].is_none()).collect();
        for &r in &queue {
            row_over[r] = true;
        }
        while let Some(r) = queue.pop() {
            for &c in &adj[r] {
                if col_over[c] {
                    continue;
                }
                col_over[c] = true;
                if let Some(next) = m.col_to_row[c] {
                    if !row_over[next] {
                        row_over[next] = true;
                        queue.push(next);
                    }
                }
            }
        }

        // Underdetermined part: alternating paths from unmatched columns.
        let mut row_under = vec![false; nrow];
        let mut col_under = vec![false; ncol];
        let mut queue: Vec<usize> = (0..ncol).filter(|&c| m.col_to_row[c].is_none()).collect();
        for &c in &queue {
            col_under[c] = true;
        }
        while let Some(c) = queue.pop() {
            for &r in cadj[c] {
                if row_under[r] {
                    continue;
                }
                row_under[r] = true;
                if let Some(next) = m.row_to_col[r] {
                    if !col_under[next] {
                        col_under[next] = true;
                        queue.push(next);
                    }
                }
            }
        }

        let mut rowperm = Vec::with_capacity(nrow);
        let mut colperm = Vec::with_capacity(ncol);
        let mut rowblock = vec![0];
        let mut colblock = vec![0];

        rowperm.extend((0..nrow).filter(|&r| row_over[r]));
        colperm.extend((0..ncol).filter(|&c| col_over[c]));
        if !rowperm.is_empty() || !colperm.is_empty() {
            rowblock.push(rowperm.len());
            colblock.push(colperm.len());
        }
        let coarse_over = (rowperm.len(), colperm.len());

        // Square part: one node per matched row, r -> r' when row r uses the column
        // matched to r'.
        let square: Vec<usize> = (0..nrow)
            .filter(|&r| !row_over[r] && !row_under[r])
            .collect();
        let mut succ = vec![Vec::new(); nrow];
        for &r in &square {
            for &c in &adj[r] {
                if let Some(owner) = m.col_to_row[c] {
                    if owner != r && !row_over[owner] && !row_under[owner] {
                        succ[r].push(owner);
                    }
                }
            }
        }
        for component in tarjan(&square, &succ, nrow) {
            for &r in &component {
                rowperm.push(r);
                colperm.extend(m.row_to_col[r]);
            }
            rowblock.push(rowperm.len());
            colblock.push(colperm.len());
        }
        let coarse_square = (rowperm.len(), colperm.len());

        let under_start = rowperm.len();
        let under_col_start = colperm.len();
        rowperm.extend((0..nrow).filter(|&r| row_under[r]));
        colperm.extend((0..ncol).filter(|&c| col_under[c]));
        if rowperm.len() > under_start || colperm.len() > under_col_start {
            rowblock.push(rowperm.len());
            colblock.push(colperm.len());
        }

        DmDecomposition {
            rowperm,
            colperm,
            rowblock,
            colblock,
            coarse_rowblock: [0, coarse_over.0, coarse_square.0, nrow],
            coarse_colblock: [0, coarse_over.1, coarse_square.1, ncol],
        }
    }

    /// True if no nonzero of the pattern, permuted as described by `dm`, lies above the
    /// diagonal blocks.
    pub fn is_block_lower_triangular(&self, dm: &DmDecomposition) -> bool {
        let Ok(permuted) = self.permute(&dm.rowperm, &dm.colperm) else {
            return false;
        };
        let row_block = dm.row_block_of();
        let col_block = dm.col_block_of();
        permuted
            .triplets()
            .into_iter()
            .all(|(r, c)| row_block[r] >= col_block[c])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(n: usize, m: usize, entries: &[(usize, usize)]) -> Sparsity {
        let rows: Vec<usize> = entries.iter().map(|e| e.0).collect();
        let cols: Vec<usize> = entries.iter().map(|e| e.1).collect();
        Sparsity::from_triplets(n, m, &rows, &cols).unwrap().0
    }

    fn is_permutation(perm: &[usize], n: usize) -> bool {
        let mut seen = vec![false; n];
        perm.len() == n && perm.iter().all(|&p| p < n && !std::mem::replace(&mut seen[p], true))
    }

    #[test]
    fn test_empty_pattern() {
        let dm = Sparsity::dense(0, 0).dulmage_mendelsohn();
        assert_eq!(dm.nblocks(), 0);
        assert!(dm.rowperm.is_empty());
        assert_eq!(dm.coarse_rowblock, [0, 0, 0, 0]);
    }

    #[test]
    fn test_dense_is_one_block() {
        let sp = Sparsity::dense(4, 4);
        let dm = sp.dulmage_mendelsohn();
        assert_eq!(dm.nblocks(), 1);
        assert_eq!(dm.rowblock, vec![0, 4]);
        assert!(sp.is_block_lower_triangular(&dm));
        assert_eq!(sp.structural_rank(), 4);
    }

    #[test]
    fn test_chain_is_split_into_scalars() {
        // x0 = 1, x1 = f(x0), x2 = g(x1), equations listed backwards
        let sp = pattern(3, 3, &[(0, 1), (0, 2), (1, 0), (1, 1), (2, 0)]);
        let dm = sp.dulmage_mendelsohn();
        assert_eq!(dm.nblocks(), 3);
        assert_eq!(dm.rowperm, vec![2, 1, 0]);
        assert_eq!(dm.colperm, vec![0, 1, 2]);
        assert!(sp.is_block_lower_triangular(&dm));
    }

    #[test]
    fn test_algebraic_loop_forms_block() {
        let sp = pattern(3, 3, &[(0, 0), (1, 0), (1, 1), (1, 2), (2, 1), (2, 2)]);
        let dm = sp.dulmage_mendelsohn();
        assert_eq!(dm.rowblock, vec![0, 1, 3]);
        assert_eq!(dm.block_rows(0), &[0]);
        assert!(sp.is_block_lower_triangular(&dm));
    }

    #[test]
    fn test_rectangular_parts() {
        // Two equations in one variable, plus a free variable in the last equation
        let sp = pattern(3, 3, &[(0, 0), (1, 0), (2, 1), (2, 2)]);
        let dm = sp.dulmage_mendelsohn();
        assert_eq!(sp.structural_rank(), 2);
        assert_eq!(dm.coarse_rowblock, [0, 2, 2, 3]);
        assert_eq!(dm.coarse_colblock, [0, 1, 1, 3]);
        assert!(sp.is_block_lower_triangular(&dm));
    }

    #[test]
    fn test_empty_rows_and_columns() {
        let sp = Sparsity::sparse(2, 3);
        let dm = sp.dulmage_mendelsohn();
        assert!(is_permutation(&dm.rowperm, 2));
        assert!(is_permutation(&dm.colperm, 3));
        assert_eq!(sp.structural_rank(), 0);
    }

    proptest! {
        #[test]
        fn prop_random_square_is_block_lower_triangular(
            n in 0usize..9,
            mask in proptest::collection::vec(0u8..4, 81),
        ) {
            let entries: Vec<(usize, usize)> = (0..n * n)
                .filter(|&k| mask[k] == 0)
                .map(|k| (k % n, k / n))
                .collect();
            let sp = pattern(n, n, &entries);
            let dm = sp.dulmage_mendelsohn();
            prop_assert!(is_permutation(&dm.rowperm, n));
            prop_assert!(is_permutation(&dm.colperm, n));
            prop_assert_eq!(dm.rowblock.len(), dm.colblock.len());
            prop_assert!(sp.is_block_lower_triangular(&dm));
        }

        #[test]
        fn prop_random_rectangular(
            n in 1usize..7,
            m in 1usize..7,
            mask in proptest::collection::vec(0u8..3, 49),
        ) {
            let entries: Vec<(usize, usize)> = (0..n * m)
                .filter(|&k| mask[k] == 0)
                .map(|k| (k % n, k / n))
                .collect();
            let sp = pattern(n, m, &entries);
            let dm = sp.dulmage_mendelsohn();
            prop_assert!(sp.is_block_lower_triangular(&dm));
            prop_assert!(sp.structural_rank() <= n.min(m));
        }
    }
}
