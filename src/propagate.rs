//! Structural sparsity propagation with 64-bit dependency masks.
//!
//! Every structural nonzero carries a [`BitWord`]; each bit stands for one seeded
//! direction. The forward pass is the ordinary evaluator instantiated with the [`Bits`]
//! semiring. The reverse pass mirrors it over the same work cells, OR-ing the masks of
//! each result into the nonzeros of the dependencies it structurally depends on.
//!
//! Jacobian patterns are read off one sweep per 64 directions ("plain"), or by
//! hierarchical refinement: groups of directions are bisected level by level and only
//! the groups that reach some output are refined further, with non-interfering groups
//! sharing a sweep.

use crate::errors::GraphError;
use crate::eval::{AlgEl, Algorithm, Bits};
use crate::graph::Graph;
use crate::matrix::{concat_sources, split_sources, BitWord, Matrix};
use crate::node::{Mx, Op};
use crate::sparsity::Sparsity;

const WORD: usize = 64;

/// How Jacobian sparsity patterns are computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SparsityMode {
    /// Hierarchical above the threshold, plain below
    #[default]
    Auto,
    Plain,
    Hierarchical,
}

/// Runs the reverse bit pass.
///
/// # Arguments
/// * `alg` - Evaluation plan
/// * `seeds` - One mask per nonzero of every output
///
/// # Returns
/// One mask per nonzero of every input.
///
/// # Errors
/// `InvalidInputLength` if the seeds do not match the outputs.
pub fn reverse_bits(alg: &Algorithm, seeds: &[Vec<BitWord>]) -> Result<Vec<Vec<BitWord>>, GraphError> {
    if seeds.len() != alg.outputs().len() {
        return Err(GraphError::InvalidInputLength {
            expected: alg.outputs().len(),
            got: seeds.len(),
        });
    }
    let mut work: Vec<Vec<BitWord>> = alg.cell_nnz().iter().map(|&n| vec![BitWord::ZERO; n]).collect();
    for ((cell, sp), seed) in alg.outputs().iter().zip(seeds) {
        if seed.len() != sp.nnz() {
            return Err(GraphError::InvalidInputLength {
                expected: sp.nnz(),
                got: seed.len(),
            });
        }
        for (w, &s) in work[*cell].iter_mut().zip(seed) {
            *w |= s;
        }
    }

    let mut result: Vec<Vec<BitWord>> = alg
        .input_sparsity()
        .iter()
        .map(|sp| vec![BitWord::ZERO; sp.nnz()])
        .collect();
    for el in alg.elements().iter().rev() {
        let res: Vec<Vec<BitWord>> = el
            .res
            .iter()
            .zip(&el.res_sparsity)
            .map(|(cell, sp)| match cell {
                Some(c) => std::mem::replace(&mut work[*c], vec![BitWord::ZERO; sp.nnz()]),
                None => vec![BitWord::ZERO; sp.nnz()],
            })
            .collect();
        if let Some(slot) = el.input {
            for (r, s) in result[slot].iter_mut().zip(&res[0]) {
                *r |= *s;
            }
            continue;
        }
        for (a, contribution) in el.args.iter().zip(pull_back(el, &res)) {
            for (w, c) in work[*a].iter_mut().zip(contribution) {
                *w |= c;
            }
        }
    }
    Ok(result)
}

/// Dependency masks of every argument of `el` given the masks of its results.
fn pull_back(el: &AlgEl, res: &[Vec<BitWord>]) -> Vec<Vec<BitWord>> {
    let mut args: Vec<Vec<BitWord>> = el.arg_sparsity.iter().map(|sp| vec![BitWord::ZERO; sp.nnz()]).collect();
    let seed = &res[0];
    let or_all = || seed.iter().fold(BitWord::ZERO, |acc, &s| acc | s);
    let out = &el.res_sparsity[0];

    match &el.op {
        Op::Symbol { .. } | Op::Constant(_) => {}
        Op::Unary(_) | Op::Binary(_) | Op::Project => {
            let n = if matches!(el.op, Op::Binary(_)) { 2 } else { 1 };
            for (arg, sp) in args.iter_mut().zip(&el.arg_sparsity).take(n) {
                if sp.is_scalar() && !out.is_scalar() {
                    if let Some(a) = arg.first_mut() {
                        *a |= or_all();
                    }
                    continue;
                }
                if let Ok(map) = sp.nz_map(out) {
                    for (j, i) in map.into_iter().enumerate() {
                        if let Some(i) = i {
                            arg[i] |= seed[j];
                        }
                    }
                }
            }
        }
        Op::MulAdd => {
            let (xsp, ysp) = (&el.arg_sparsity[1], &el.arg_sparsity[2]);
            for (j, s) in seed.iter().enumerate() {
                args[0][j] |= *s;
            }
            let (mut x, mut y) = (vec![BitWord::ZERO; xsp.nnz()], vec![BitWord::ZERO; ysp.nnz()]);
            for k in 0..out.ncol() {
                for nz in out.colind()[k]..out.colind()[k + 1] {
                    let i = out.row()[nz];
                    for ynz in ysp.colind()[k]..ysp.colind()[k + 1] {
                        if let Some(xnz) = xsp.get_nz(i, ysp.row()[ynz]) {
                            x[xnz] |= seed[nz];
                            y[ynz] |= seed[nz];
                        }
                    }
                }
            }
            args[1] = x;
            args[2] = y;
        }
        Op::Transpose => {
            let (_, map) = el.arg_sparsity[0].transpose_with_mapping();
            for (j, i) in map.into_iter().enumerate() {
                args[0][i] |= seed[j];
            }
        }
        Op::Reshape | Op::Assertion { .. } => {
            for (a, s) in args[0].iter_mut().zip(seed) {
                *a |= *s;
            }
        }
        Op::Concat(kind) => {
            for ((part, k), s) in concat_sources(*kind, &el.arg_sparsity).into_iter().zip(seed) {
                args[part][k] |= *s;
            }
        }
        Op::Split(kind) => {
            for (sources, seeds) in split_sources(kind, &el.arg_sparsity[0]).iter().zip(res) {
                for (&k, s) in sources.iter().zip(seeds) {
                    args[0][k] |= *s;
                }
            }
        }
        Op::GetNonzeros(indices) => {
            for (&k, s) in indices.iter().zip(seed) {
                args[0][k] |= *s;
            }
        }
        Op::AddNonzeros(indices) => {
            for (a, s) in args[0].iter_mut().zip(seed) {
                *a |= *s;
            }
            for (a, &k) in args[1].iter_mut().zip(indices) {
                *a |= seed[k];
            }
        }
        Op::SetNonzeros(indices) => {
            let mut kept = seed.clone();
            for (a, &k) in args[1].iter_mut().zip(indices) {
                *a |= seed[k];
                kept[k] = BitWord::ZERO;
            }
            for (a, s) in args[0].iter_mut().zip(kept) {
                *a |= s;
            }
        }
        Op::Inverse | Op::Solve { .. } | Op::InnerProd | Op::Norm(_) => {
            let all = or_all();
            for arg in &mut args {
                arg.iter_mut().for_each(|a| *a |= all);
            }
        }
    }
    args
}

/// Bit inputs with `seed` on input `iind` and zeros everywhere else.
fn bit_inputs(alg: &Algorithm, iind: usize, seed: &[BitWord]) -> Result<Vec<Matrix<BitWord>>, GraphError> {
    alg.input_sparsity()
        .iter()
        .enumerate()
        .map(|(i, sp)| {
            if i == iind {
                Matrix::new(sp.clone(), seed.to_vec())
            } else {
                Ok(Matrix::zeros(sp))
            }
        })
        .collect()
}

/// One propagation sweep from the seeded side to the other side.
struct Sweep<'a> {
    alg: &'a Algorithm,
    iind: usize,
    oind: usize,
    forward: bool,
}

impl Sweep<'_> {
    fn sources(&self) -> usize {
        if self.forward {
            self.alg.input_sparsity()[self.iind].nnz()
        } else {
            self.alg.outputs()[self.oind].1.nnz()
        }
    }

    fn targets(&self) -> usize {
        if self.forward {
            self.alg.outputs()[self.oind].1.nnz()
        } else {
            self.alg.input_sparsity()[self.iind].nnz()
        }
    }

    fn run(&self, seed: &[BitWord]) -> Result<Vec<BitWord>, GraphError> {
        if self.forward {
            let inputs = bit_inputs(self.alg, self.iind, seed)?;
            let mut out = self.alg.run(&mut Bits::new(), &inputs)?;
            Ok(out.swap_remove(self.oind).into_nonzeros())
        } else {
            let seeds = self
                .alg
                .outputs()
                .iter()
                .enumerate()
                .map(|(o, (_, sp))| {
                    if o == self.oind {
                        seed.to_vec()
                    } else {
                        vec![BitWord::ZERO; sp.nnz()]
                    }
                })
                .collect::<Vec<_>>();
            let mut adj = reverse_bits(self.alg, &seeds)?;
            Ok(adj.swap_remove(self.iind))
        }
    }

    /// Assembles `(target, source)` hits into a compact `nnz(out) x nnz(in)` pattern.
    fn pattern(&self, hits: &[(usize, usize)]) -> Result<Sparsity, GraphError> {
        let (n_in, n_out) = (self.alg.input_sparsity()[self.iind].nnz(), self.alg.outputs()[self.oind].1.nnz());
        let (rows, cols): (Vec<usize>, Vec<usize>) = if self.forward {
            hits.iter().copied().unzip()
        } else {
            hits.iter().map(|&(t, s)| (s, t)).unzip()
        };
        Ok(Sparsity::from_triplets(n_out, n_in, &rows, &cols)?.0)
    }
}

fn plain(sweep: &Sweep) -> Result<Sparsity, GraphError> {
    let n = sweep.sources();
    let mut hits = Vec::new();
    for base in (0..n).step_by(WORD) {
        let seed: Vec<BitWord> = (0..n)
            .map(|k| {
                if (base..base + WORD).contains(&k) {
                    BitWord::bit(k - base)
                } else {
                    BitWord::ZERO
                }
            })
            .collect();
        for (t, w) in sweep.run(&seed)?.into_iter().enumerate() {
            for b in (0..WORD).filter(|&b| w.is_set(b)) {
                hits.push((t, base + b));
            }
        }
    }
    sweep.pattern(&hits)
}

/// A contiguous range of sources together with the targets it reaches.
struct Group {
    lo: usize,
    hi: usize,
    touched: Vec<usize>,
}

fn hierarchical(sweep: &Sweep) -> Result<Sparsity, GraphError> {
    let (n_src, n_tgt) = (sweep.sources(), sweep.targets());
    if n_src == 0 || n_tgt == 0 {
        return sweep.pattern(&[]);
    }
    let reached = sweep.run(&vec![BitWord::bit(0); n_src])?;
    let mut groups = vec![Group {
        lo: 0,
        hi: n_src,
        touched: (0..n_tgt).filter(|&t| !reached[t].is_zero()).collect(),
    }];
    groups.retain(|g| !g.touched.is_empty());

    while groups.iter().any(|g| g.hi - g.lo > 1) {
        // Children 2p and 2p + 1 are the halves of parent p; singletons are final.
        let mut parents: Vec<Vec<usize>> = Vec::new();
        let mut children: Vec<Group> = Vec::new();
        let mut done: Vec<Group> = Vec::new();
        for g in groups {
            if g.hi - g.lo == 1 {
                done.push(g);
                continue;
            }
            let mid = g.lo + (g.hi - g.lo).div_ceil(2);
            children.push(Group { lo: g.lo, hi: mid, touched: Vec::new() });
            children.push(Group { lo: mid, hi: g.hi, touched: Vec::new() });
            parents.push(g.touched);
        }
        let parent_of = |c: usize| c / 2;

        // Parents that reach a common target must not share a color.
        let mut by_target: Vec<Vec<usize>> = vec![Vec::new(); n_tgt];
        for (p, touched) in parents.iter().enumerate() {
            for &t in touched {
                by_target[t].push(p);
            }
        }
        let mut color = vec![usize::MAX; children.len()];
        let mut n_colors = 0;
        for c in 0..children.len() {
            let p = parent_of(c);
            let mut used = std::collections::HashSet::new();
            for &t in &parents[p] {
                for &q in &by_target[t] {
                    for sibling in [2 * q, 2 * q + 1] {
                        if color[sibling] != usize::MAX {
                            used.insert(color[sibling]);
                        }
                    }
                }
            }
            let mut k = 0;
            while used.contains(&k) {
                k += 1;
            }
            color[c] = k;
            n_colors = n_colors.max(k + 1);
        }
        let mut of_color: Vec<Vec<usize>> = vec![Vec::new(); n_colors];
        for (c, &k) in color.iter().enumerate() {
            of_color[k].push(c);
        }

        for base in (0..n_colors).step_by(WORD) {
            let mut seed = vec![BitWord::ZERO; n_src];
            for k in base..(base + WORD).min(n_colors) {
                for &c in &of_color[k] {
                    let g = &children[c];
                    seed[g.lo..g.hi].iter_mut().for_each(|s| *s = BitWord::bit(k - base));
                }
            }
            for (t, w) in sweep.run(&seed)?.into_iter().enumerate() {
                for b in (0..WORD).filter(|&b| w.is_set(b)) {
                    let hit = of_color[base + b]
                        .iter()
                        .find(|&&c| parents[parent_of(c)].binary_search(&t).is_ok());
                    if let Some(&c) = hit {
                        children[c].touched.push(t);
                    }
                }
            }
        }

        groups = done;
        groups.extend(children.into_iter().filter(|g| !g.touched.is_empty()));
    }

    let hits: Vec<(usize, usize)> = groups
        .iter()
        .flat_map(|g| g.touched.iter().map(move |&t| (t, g.lo)))
        .collect();
    sweep.pattern(&hits)
}

/// Compact Jacobian pattern (`nnz(out) x nnz(in)`) of output `oind` with respect to
/// input `iind`.
///
/// The direction with fewer sources is propagated; ties go forward.
///
/// # Errors
/// `IndexOutOfRange` for an invalid input or output index.
pub fn jacobian_sparsity(
    alg: &Algorithm,
    iind: usize,
    oind: usize,
    mode: SparsityMode,
    threshold: usize,
) -> Result<Sparsity, GraphError> {
    check_index("input", iind, alg.input_sparsity().len())?;
    check_index("output", oind, alg.outputs().len())?;
    let n_in = alg.input_sparsity()[iind].nnz();
    let n_out = alg.outputs()[oind].1.nnz();
    let hierarchical_wanted = match mode {
        SparsityMode::Plain => false,
        SparsityMode::Hierarchical => true,
        SparsityMode::Auto => n_in.min(n_out) > threshold,
    };
    propagate(alg, iind, oind, n_in <= n_out, hierarchical_wanted)
}

pub(crate) fn propagate(
    alg: &Algorithm,
    iind: usize,
    oind: usize,
    forward: bool,
    hierarchical_wanted: bool,
) -> Result<Sparsity, GraphError> {
    let sweep = Sweep {
        alg,
        iind,
        oind,
        forward,
    };
    if hierarchical_wanted {
        hierarchical(&sweep)
    } else {
        plain(&sweep)
    }
}

fn check_index(what: &'static str, index: usize, len: usize) -> Result<(), GraphError> {
    if index < len {
        Ok(())
    } else {
        Err(GraphError::IndexOutOfRange { what, index, len })
    }
}

/// Maps a compact pattern to `numel(out) x numel(in)` coordinates.
pub fn expand_compact(compact: &Sparsity, input: &Sparsity, output: &Sparsity) -> Result<Sparsity, GraphError> {
    let (ilin, olin) = (input.linear_indices(), output.linear_indices());
    let (rows, cols): (Vec<usize>, Vec<usize>) = compact.triplets().into_iter().map(|(r, c)| (olin[r], ilin[c])).unzip();
    Ok(Sparsity::from_triplets(output.numel(), input.numel(), &rows, &cols)?.0)
}

/// Greedy largest-first coloring of the columns of `sp`: columns sharing a row get
/// different colors.
///
/// Returns `(colors, n_colors)`.
pub fn column_coloring(sp: &Sparsity) -> (Vec<usize>, usize) {
    let ncol = sp.ncol();
    let t = sp.transpose();
    let mut order: Vec<usize> = (0..ncol).collect();
    order.sort_by_key(|&c| std::cmp::Reverse(sp.colind()[c + 1] - sp.colind()[c]));

    let mut colors = vec![usize::MAX; ncol];
    let mut n_colors = 0;
    let mut used_by = vec![usize::MAX; ncol + 1];
    for &c in &order {
        for &r in &sp.row()[sp.colind()[c]..sp.colind()[c + 1]] {
            for &other in &t.row()[t.colind()[r]..t.colind()[r + 1]] {
                if colors[other] != usize::MAX {
                    used_by[colors[other]] = c;
                }
            }
        }
        let color = (0..).find(|&k| used_by[k] != c).unwrap_or(0);
        colors[c] = color;
        n_colors = n_colors.max(color + 1);
    }
    (colors, n_colors)
}

/// Row counterpart of [`column_coloring`].
pub fn row_coloring(sp: &Sparsity) -> (Vec<usize>, usize) {
    column_coloring(&sp.transpose())
}

impl Graph {
    /// Structural Jacobian pattern of `expr` with respect to the symbol `x`, as a
    /// `numel(expr) x numel(x)` pattern.
    ///
    /// # Errors
    /// `StructuralError` if `x` is not a symbol.
    pub fn dependency_sparsity(&self, expr: Mx, x: Mx) -> Result<Sparsity, GraphError> {
        let mut inputs = self.free_symbols(&[expr]);
        let iind = match inputs.iter().position(|&s| s == x) {
            Some(i) => i,
            None => {
                inputs.push(x);
                inputs.len() - 1
            }
        };
        let alg = Algorithm::new(self, &inputs, &[expr])?;
        let compact = jacobian_sparsity(&alg, iind, 0, SparsityMode::Plain, 0)?;
        expand_compact(&compact, self.sparsity(x), self.sparsity(expr))
    }

    /// True if `expr` structurally depends on any of `symbols`.
    ///
    /// # Errors
    /// `StructuralError` if one of `symbols` is not a symbol.
    pub fn depends_on(&self, expr: Mx, symbols: &[Mx]) -> Result<bool, GraphError> {
        let mut inputs = self.free_symbols(&[expr]);
        for &s in symbols {
            if !inputs.contains(&s) {
                inputs.push(s);
            }
        }
        let alg = Algorithm::new(self, &inputs, &[expr])?;
        let values = inputs
            .iter()
            .zip(alg.input_sparsity())
            .map(|(s, sp)| {
                let bit = if symbols.contains(s) { BitWord::bit(0) } else { BitWord::ZERO };
                Matrix::new(sp.clone(), vec![bit; sp.nnz()])
            })
            .collect::<Result<Vec<_>, _>>()?;
        let out = alg.run(&mut Bits::new(), &values)?;
        Ok(out[0].nonzeros().iter().any(|w| !w.is_zero()))
    }
}
