//! Generic evaluation of expression graphs.
//!
//! An [`Algorithm`] is the flat, topologically ordered list of operations needed to get
//! from a set of input symbols to a set of outputs. Every intermediate value lives in a
//! numbered work cell; a cell is handed back to a free list as soon as its last consumer
//! has run, so the number of cells tracks the width of the graph rather than its size.
//!
//! The same walk is instantiated for every [`Semiring`]:
//!
//! - [`Numeric`]: `f64` nonzeros
//! - [`Bits`]: 64-bit dependency masks, used by sparsity propagation
//! - [`Symbolic`]: new graph nodes, used for substitution and inlining

use std::collections::HashMap;
use std::marker::PhantomData;

use crate::errors::GraphError;
use crate::graph::Graph;
use crate::matrix::{self, BitWord, Element, Matrix};
use crate::node::{ConcatKind, Mx, NormKind, Op, SplitKind};
use crate::ops::{BinaryOp, UnaryOp};
use crate::sparsity::Sparsity;

/// Value representation and per-operation combinators of one evaluation mode.
pub trait Semiring {
    type Value: Clone;

    fn constant(&mut self, value: &Matrix<f64>) -> Result<Self::Value, GraphError>;
    fn unary(&mut self, op: UnaryOp, x: &Self::Value, out: &Sparsity) -> Result<Self::Value, GraphError>;
    fn binary(
        &mut self,
        op: BinaryOp,
        x: &Self::Value,
        y: &Self::Value,
        out: &Sparsity,
    ) -> Result<Self::Value, GraphError>;
    fn mul_add(
        &mut self,
        z0: &Self::Value,
        x: &Self::Value,
        y: &Self::Value,
    ) -> Result<Self::Value, GraphError>;
    fn transpose(&mut self, x: &Self::Value) -> Result<Self::Value, GraphError>;
    fn reshape(&mut self, x: &Self::Value, out: &Sparsity) -> Result<Self::Value, GraphError>;
    fn project(&mut self, x: &Self::Value, out: &Sparsity) -> Result<Self::Value, GraphError>;
    fn concat(
        &mut self,
        kind: ConcatKind,
        parts: &[&Self::Value],
        out: &Sparsity,
    ) -> Result<Self::Value, GraphError>;
    fn split(
        &mut self,
        kind: &SplitKind,
        x: &Self::Value,
        outs: &[Sparsity],
    ) -> Result<Vec<Self::Value>, GraphError>;
    fn inverse(&mut self, x: &Self::Value) -> Result<Self::Value, GraphError>;
    fn solve(
        &mut self,
        a: &Self::Value,
        b: &Self::Value,
        transpose: bool,
    ) -> Result<Self::Value, GraphError>;
    fn inner_prod(&mut self, x: &Self::Value, y: &Self::Value) -> Result<Self::Value, GraphError>;
    fn norm(&mut self, kind: NormKind, x: &Self::Value) -> Result<Self::Value, GraphError>;
    fn get_nonzeros(
        &mut self,
        x: &Self::Value,
        indices: &[usize],
        out: &Sparsity,
    ) -> Result<Self::Value, GraphError>;
    fn add_nonzeros(
        &mut self,
        y: &Self::Value,
        x: &Self::Value,
        indices: &[usize],
    ) -> Result<Self::Value, GraphError>;
    fn set_nonzeros(
        &mut self,
        y: &Self::Value,
        x: &Self::Value,
        indices: &[usize],
    ) -> Result<Self::Value, GraphError>;
    fn assertion(
        &mut self,
        x: &Self::Value,
        cond: &Self::Value,
        message: &str,
    ) -> Result<Self::Value, GraphError>;
}

/// Dispatches one operation to the matching semiring combinator.
fn apply<S: Semiring>(
    semiring: &mut S,
    op: &Op,
    args: &[&S::Value],
    out: &[Sparsity],
) -> Result<Vec<S::Value>, GraphError> {
    let single = |v: S::Value| vec![v];
    Ok(match op {
        Op::Symbol { .. } => {
            return Err(GraphError::structural("symbols are read from the inputs"));
        }
        Op::Constant(value) => single(semiring.constant(value)?),
        Op::Unary(u) => single(semiring.unary(*u, args[0], &out[0])?),
        Op::Binary(b) => single(semiring.binary(*b, args[0], args[1], &out[0])?),
        Op::MulAdd => single(semiring.mul_add(args[0], args[1], args[2])?),
        Op::Transpose => single(semiring.transpose(args[0])?),
        Op::Reshape => single(semiring.reshape(args[0], &out[0])?),
        Op::Project => single(semiring.project(args[0], &out[0])?),
        Op::Concat(kind) => single(semiring.concat(*kind, args, &out[0])?),
        Op::Split(kind) => semiring.split(kind, args[0], out)?,
        Op::GetNonzeros(indices) => single(semiring.get_nonzeros(args[0], indices, &out[0])?),
        Op::AddNonzeros(indices) => single(semiring.add_nonzeros(args[0], args[1], indices)?),
        Op::SetNonzeros(indices) => single(semiring.set_nonzeros(args[0], args[1], indices)?),
        Op::Inverse => single(semiring.inverse(args[0])?),
        Op::Solve { transpose } => single(semiring.solve(args[0], args[1], *transpose)?),
        Op::InnerProd => single(semiring.inner_prod(args[0], args[1])?),
        Op::Norm(kind) => single(semiring.norm(*kind, args[0])?),
        Op::Assertion { message } => single(semiring.assertion(args[0], args[1], message)?),
    })
}

/// Sparse values with elements of type `E`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nonzeros<E>(PhantomData<E>);

impl<E> Nonzeros<E> {
    pub fn new() -> Self {
        Nonzeros(PhantomData)
    }
}

/// Floating-point evaluation.
pub type Numeric = Nonzeros<f64>;
/// Forward dependency propagation.
pub type Bits = Nonzeros<BitWord>;

impl<E: Element> Semiring for Nonzeros<E> {
    type Value = Matrix<E>;

    fn constant(&mut self, value: &Matrix<f64>) -> Result<Matrix<E>, GraphError> {
        let nonzeros = value.nonzeros().iter().map(|&v| E::from_f64(v)).collect();
        Matrix::new(value.sparsity().clone(), nonzeros)
    }

    fn unary(&mut self, op: UnaryOp, x: &Matrix<E>, out: &Sparsity) -> Result<Matrix<E>, GraphError> {
        matrix::unary(op, x, out)
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        x: &Matrix<E>,
        y: &Matrix<E>,
        out: &Sparsity,
    ) -> Result<Matrix<E>, GraphError> {
        matrix::binary(op, x, y, out)
    }

    fn mul_add(&mut self, z0: &Matrix<E>, x: &Matrix<E>, y: &Matrix<E>) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::mul_add(z0, x, y))
    }

    fn transpose(&mut self, x: &Matrix<E>) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::transpose(x))
    }

    fn reshape(&mut self, x: &Matrix<E>, out: &Sparsity) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::reshape(x, out))
    }

    fn project(&mut self, x: &Matrix<E>, out: &Sparsity) -> Result<Matrix<E>, GraphError> {
        x.project(out)
    }

    fn concat(&mut self, kind: ConcatKind, parts: &[&Matrix<E>], out: &Sparsity) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::concat(kind, parts, out))
    }

    fn split(&mut self, kind: &SplitKind, x: &Matrix<E>, outs: &[Sparsity]) -> Result<Vec<Matrix<E>>, GraphError> {
        Ok(matrix::split(kind, x, outs))
    }

    fn inverse(&mut self, x: &Matrix<E>) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::inverse(x))
    }

    fn solve(&mut self, a: &Matrix<E>, b: &Matrix<E>, transpose: bool) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::solve(a, b, transpose))
    }

    fn inner_prod(&mut self, x: &Matrix<E>, y: &Matrix<E>) -> Result<Matrix<E>, GraphError> {
        matrix::inner_prod(x, y)
    }

    fn norm(&mut self, kind: NormKind, x: &Matrix<E>) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::norm(kind, x))
    }

    fn get_nonzeros(&mut self, x: &Matrix<E>, indices: &[usize], out: &Sparsity) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::get_nonzeros(x, indices, out))
    }

    fn add_nonzeros(&mut self, y: &Matrix<E>, x: &Matrix<E>, indices: &[usize]) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::add_nonzeros(y, x, indices))
    }

    fn set_nonzeros(&mut self, y: &Matrix<E>, x: &Matrix<E>, indices: &[usize]) -> Result<Matrix<E>, GraphError> {
        Ok(matrix::set_nonzeros(y, x, indices))
    }

    fn assertion(&mut self, x: &Matrix<E>, cond: &Matrix<E>, message: &str) -> Result<Matrix<E>, GraphError> {
        matrix::assertion(x, cond, message)
    }
}

/// Builds new nodes in a graph instead of computing values.
pub struct Symbolic<'g> {
    pub graph: &'g mut Graph,
}

impl<'g> Symbolic<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        Symbolic { graph }
    }
}

impl Semiring for Symbolic<'_> {
    type Value = Mx;

    fn constant(&mut self, value: &Matrix<f64>) -> Result<Mx, GraphError> {
        Ok(self.graph.constant(value.clone()))
    }

    fn unary(&mut self, op: UnaryOp, x: &Mx, _out: &Sparsity) -> Result<Mx, GraphError> {
        self.graph.unary(op, *x)
    }

    fn binary(&mut self, op: BinaryOp, x: &Mx, y: &Mx, _out: &Sparsity) -> Result<Mx, GraphError> {
        self.graph.binary(op, *x, *y)
    }

    fn mul_add(&mut self, z0: &Mx, x: &Mx, y: &Mx) -> Result<Mx, GraphError> {
        self.graph.mul_add(*z0, *x, *y)
    }

    fn transpose(&mut self, x: &Mx) -> Result<Mx, GraphError> {
        self.graph.transpose(*x)
    }

    fn reshape(&mut self, x: &Mx, out: &Sparsity) -> Result<Mx, GraphError> {
        self.graph.reshape(*x, out.nrow(), out.ncol())
    }

    fn project(&mut self, x: &Mx, out: &Sparsity) -> Result<Mx, GraphError> {
        self.graph.project(*x, out)
    }

    fn concat(&mut self, kind: ConcatKind, parts: &[&Mx], _out: &Sparsity) -> Result<Mx, GraphError> {
        let parts: Vec<Mx> = parts.iter().map(|&&p| p).collect();
        self.graph.concat(kind, &parts)
    }

    fn split(&mut self, kind: &SplitKind, x: &Mx, _outs: &[Sparsity]) -> Result<Vec<Mx>, GraphError> {
        // A substituted argument may carry extra entries outside the diagonal blocks.
        let x = match kind {
            SplitKind::Diag { rows, cols } => {
                let blocks: Vec<Sparsity> = rows
                    .windows(2)
                    .zip(cols.windows(2))
                    .map(|(r, c)| Sparsity::dense(r[1] - r[0], c[1] - c[0]))
                    .collect();
                let envelope = Sparsity::blkdiag(&blocks);
                let masked = self.graph.sparsity(*x).intersect(&envelope)?;
                self.graph.project(*x, &masked)?
            }
            _ => *x,
        };
        self.graph.split(kind.clone(), x)
    }

    fn inverse(&mut self, x: &Mx) -> Result<Mx, GraphError> {
        self.graph.inverse(*x)
    }

    fn solve(&mut self, a: &Mx, b: &Mx, transpose: bool) -> Result<Mx, GraphError> {
        self.graph.solve(*a, *b, transpose)
    }

    fn inner_prod(&mut self, x: &Mx, y: &Mx) -> Result<Mx, GraphError> {
        self.graph.inner_prod(*x, *y)
    }

    fn norm(&mut self, kind: NormKind, x: &Mx) -> Result<Mx, GraphError> {
        self.graph.norm(kind, *x)
    }

    fn get_nonzeros(&mut self, x: &Mx, indices: &[usize], out: &Sparsity) -> Result<Mx, GraphError> {
        self.graph.get_nonzeros(*x, indices, out)
    }

    fn add_nonzeros(&mut self, y: &Mx, x: &Mx, indices: &[usize]) -> Result<Mx, GraphError> {
        self.graph.add_nonzeros(*y, *x, indices)
    }

    fn set_nonzeros(&mut self, y: &Mx, x: &Mx, indices: &[usize]) -> Result<Mx, GraphError> {
        self.graph.set_nonzeros(*y, *x, indices)
    }

    fn assertion(&mut self, x: &Mx, cond: &Mx, message: &str) -> Result<Mx, GraphError> {
        self.graph.assertion(*x, *cond, message)
    }
}

/// One step of an [`Algorithm`].
#[derive(Clone, Debug)]
pub struct AlgEl {
    pub op: Op,
    /// Node this step was generated from
    pub node: usize,
    /// Work cells of the dependencies
    pub args: Vec<usize>,
    /// Patterns of the dependencies
    pub arg_sparsity: Vec<Sparsity>,
    /// Work cell of every output, `None` for outputs nobody reads
    pub res: Vec<Option<usize>>,
    /// Patterns of the outputs
    pub res_sparsity: Vec<Sparsity>,
    /// Input slot for symbol steps
    pub input: Option<usize>,
}

/// Topologically ordered evaluation plan with liveness-allocated work cells.
#[derive(Clone, Debug)]
pub struct Algorithm {
    elements: Vec<AlgEl>,
    cell_nnz: Vec<usize>,
    inputs: Vec<Sparsity>,
    outputs: Vec<(usize, Sparsity)>,
}

impl Algorithm {
    /// Plans the evaluation of `outputs` from the symbols `inputs`.
    ///
    /// # Errors
    /// `StructuralError` if an input is not a symbol, appears twice, or if the outputs
    /// depend on a symbol that is not an input.
    pub fn new(graph: &Graph, inputs: &[Mx], outputs: &[Mx]) -> Result<Self, GraphError> {
        let mut input_slot: HashMap<usize, usize> = HashMap::new();
        for (i, x) in inputs.iter().enumerate() {
            if !graph.is_symbol(*x) {
                return Err(GraphError::structural(format!(
                    "input {i} is not a symbolic leaf: {}",
                    graph.display(*x)
                )));
            }
            if input_slot.insert(x.node_id(), i).is_some() {
                return Err(GraphError::structural(format!(
                    "input {i} ({}) appears more than once",
                    graph.display(*x)
                )));
            }
        }

        let live = graph.reachable(outputs);
        let order: Vec<usize> = (0..graph.len()).filter(|&id| live[id]).collect();

        // Remaining reads of every (node, output)
        let mut uses: HashMap<Mx, usize> = HashMap::new();
        for &id in &order {
            for dep in &graph.node(id).deps {
                *uses.entry(*dep).or_default() += 1;
            }
        }
        let pinned: Vec<Mx> = outputs.to_vec();
        for x in outputs {
            *uses.entry(*x).or_default() += 1;
        }

        let mut cell_of: HashMap<Mx, usize> = HashMap::new();
        let mut cell_nnz: Vec<usize> = Vec::new();
        let mut free: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut elements = Vec::with_capacity(order.len());

        for id in order {
            let node = graph.node(id);
            let input = match &node.op {
                Op::Symbol { name } => Some(*input_slot.get(&id).ok_or_else(|| {
                    GraphError::structural(format!("free symbol '{name}' is not an input"))
                })?),
                _ => None,
            };
            let args: Vec<usize> = node
                .deps
                .iter()
                .map(|d| {
                    cell_of.get(d).copied().ok_or_else(|| {
                        GraphError::structural(format!("dependency @{} has no work cell", d.node))
                    })
                })
                .collect::<Result<_, _>>()?;

            // A dying accumulator can be updated in place.
            let in_place = match node.op {
                Op::MulAdd | Op::AddNonzeros(_) | Op::SetNonzeros(_) => {
                    let acc = node.deps[0];
                    let reads = node.deps.iter().filter(|&&d| d == acc).count();
                    (uses.get(&acc) == Some(&reads) && !pinned.contains(&acc)).then_some(args[0])
                }
                _ => None,
            };

            let mut res = Vec::with_capacity(node.n_outputs());
            for (k, sp) in node.sparsity.iter().enumerate() {
                let x = Mx::new(id as u32, k as u32);
                if uses.get(&x).copied().unwrap_or(0) == 0 {
                    res.push(None);
                    continue;
                }
                let cell = match in_place.filter(|_| k == 0) {
                    Some(cell) => cell,
                    None => match free.get_mut(&sp.nnz()).and_then(Vec::pop) {
                        Some(cell) => cell,
                        None => {
                            cell_nnz.push(sp.nnz());
                            cell_nnz.len() - 1
                        }
                    },
                };
                cell_of.insert(x, cell);
                res.push(Some(cell));
            }

            for dep in &node.deps {
                let Some(count) = uses.get_mut(dep) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 && !pinned.contains(dep) {
                    let cell = cell_of[dep];
                    if in_place != Some(cell) {
                        free.entry(cell_nnz[cell]).or_default().push(cell);
                    }
                }
            }

            elements.push(AlgEl {
                op: node.op.clone(),
                node: id,
                args,
                arg_sparsity: node.deps.iter().map(|&d| graph.sparsity(d).clone()).collect(),
                res,
                res_sparsity: node.sparsity.clone(),
                input,
            });
        }

        let outputs = outputs
            .iter()
            .map(|x| (cell_of[x], graph.sparsity(*x).clone()))
            .collect();
        Ok(Algorithm {
            elements,
            cell_nnz,
            inputs: inputs.iter().map(|&x| graph.sparsity(x).clone()).collect(),
            outputs,
        })
    }

    pub fn elements(&self) -> &[AlgEl] {
        &self.elements
    }

    /// Number of work cells.
    pub fn n_work(&self) -> usize {
        self.cell_nnz.len()
    }

    /// Number of nonzeros held by every work cell.
    pub fn cell_nnz(&self) -> &[usize] {
        &self.cell_nnz
    }

    pub fn input_sparsity(&self) -> &[Sparsity] {
        &self.inputs
    }

    /// Work cell and pattern of every output.
    pub fn outputs(&self) -> &[(usize, Sparsity)] {
        &self.outputs
    }

    /// Evaluates the plan with one value per input.
    ///
    /// # Errors
    /// `InvalidInputLength` for a wrong number of inputs, and whatever the semiring
    /// raises, e.g. `AssertionFailure` for numeric evaluation.
    pub fn run<S: Semiring>(&self, semiring: &mut S, inputs: &[S::Value]) -> Result<Vec<S::Value>, GraphError> {
        if inputs.len() != self.inputs.len() {
            return Err(GraphError::InvalidInputLength {
                expected: self.inputs.len(),
                got: inputs.len(),
            });
        }
        let mut work: Vec<Option<S::Value>> = vec![None; self.n_work()];
        for el in &self.elements {
            let values = match el.input {
                Some(slot) => vec![inputs[slot].clone()],
                None => {
                    let args = el
                        .args
                        .iter()
                        .map(|&a| work[a].as_ref().ok_or_else(unset_cell))
                        .collect::<Result<Vec<_>, _>>()?;
                    apply(semiring, &el.op, &args, &el.res_sparsity)?
                }
            };
            for (cell, value) in el.res.iter().zip(values) {
                if let Some(cell) = cell {
                    work[*cell] = Some(value);
                }
            }
        }
        self.outputs
            .iter()
            .map(|(cell, _)| work[*cell].clone().ok_or_else(unset_cell))
            .collect()
    }
}

fn unset_cell() -> GraphError {
    GraphError::structural("work cell read before it was written")
}

impl Graph {
    /// Replaces symbols by expressions.
    ///
    /// # Arguments
    /// * `exprs` - Expressions to rewrite
    /// * `vars` - Symbols to replace
    /// * `replacements` - One expression per symbol, of the same shape
    ///
    /// # Returns
    /// The rewritten expressions, built in this graph.
    ///
    /// # Errors
    /// `StructuralError` if a variable is not a symbol, `DimensionError` on shape
    /// mismatch.
    pub fn substitute(&mut self, exprs: &[Mx], vars: &[Mx], replacements: &[Mx]) -> Result<Vec<Mx>, GraphError> {
        if vars.len() != replacements.len() {
            return Err(GraphError::InvalidInputLength {
                expected: vars.len(),
                got: replacements.len(),
            });
        }
        for (&v, &r) in vars.iter().zip(replacements) {
            if self.shape(v) != self.shape(r) {
                return Err(GraphError::dimension("substitute", self.shape(v), self.shape(r)));
            }
        }
        let mut inputs = vars.to_vec();
        let mut values = replacements.to_vec();
        for s in self.free_symbols(exprs) {
            if !vars.contains(&s) {
                inputs.push(s);
                values.push(s);
            }
        }
        let algorithm = Algorithm::new(self, &inputs, exprs)?;
        algorithm.run(&mut Symbolic::new(self), &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_numeric_evaluation() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 2);
        let y = g.sym("y", 2, 1);
        let z = g.mul(x, y).unwrap();
        let s = g.sin(z).unwrap();
        let alg = Algorithm::new(&g, &[x, y], &[s, z]).unwrap();
        let xv = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let yv = Matrix::column(&[1.0, -1.0]);
        let out = alg.run(&mut Numeric::new(), &[xv, yv]).unwrap();
        assert_eq!(out[1].nonzeros(), &[-1.0, -1.0]);
        assert_relative_eq!(out[0].nonzeros()[0], (-1.0f64).sin());
    }

    #[test]
    fn test_free_symbol_is_rejected() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let y = g.sym("y", 1, 1);
        let e = g.add(x, y).unwrap();
        assert!(matches!(
            Algorithm::new(&g, &[x], &[e]),
            Err(GraphError::StructuralError(_))
        ));
        assert!(Algorithm::new(&g, &[x, x], &[x]).is_err());
        assert!(Algorithm::new(&g, &[e], &[e]).is_err());
    }

    #[test]
    fn test_work_cells_are_reused() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let mut e = x;
        for _ in 0..20 {
            e = g.sin(e).unwrap();
            e = g.cos(e).unwrap();
        }
        let alg = Algorithm::new(&g, &[x], &[e]).unwrap();
        assert!(alg.n_work() <= 3, "{} cells", alg.n_work());
        let out = alg.run(&mut Numeric::new(), &[Matrix::scalar(0.3)]).unwrap();
        let mut expected = 0.3f64;
        for _ in 0..20 {
            expected = expected.sin().cos();
        }
        assert_relative_eq!(out[0].nonzeros()[0], expected);
    }

    #[test]
    fn test_outputs_are_not_overwritten() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let a = g.sin(x).unwrap();
        let b = g.cos(a).unwrap();
        let c = g.exp(b).unwrap();
        let alg = Algorithm::new(&g, &[x], &[a, c]).unwrap();
        let out = alg.run(&mut Numeric::new(), &[Matrix::scalar(1.0)]).unwrap();
        assert_relative_eq!(out[0].nonzeros()[0], 1.0f64.sin());
        assert_relative_eq!(out[1].nonzeros()[0], 1.0f64.sin().cos().exp());
    }

    #[test]
    fn test_in_place_mul_add() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 2);
        let y = g.sym("y", 2, 2);
        let z = g.sym("z", 2, 2);
        let s = g.sin(z).unwrap();
        let acc = g.mul_add(s, x, y).unwrap();
        let alg = Algorithm::new(&g, &[x, y, z], &[acc]).unwrap();
        let el = alg.elements().iter().find(|e| e.op == Op::MulAdd).unwrap();
        assert_eq!(el.res[0], Some(el.args[0]));
        let ones = Matrix::filled(&Sparsity::dense(2, 2), 1.0);
        let zero = Matrix::filled(&Sparsity::dense(2, 2), 0.0);
        let out = alg.run(&mut Numeric::new(), &[ones.clone(), ones, zero]).unwrap();
        assert_eq!(out[0].nonzeros(), &[2.0; 4]);
    }

    #[test]
    fn test_assertion_evaluation() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let c = g.sym("c", 1, 1);
        let a = g.assertion(x, c, "c must hold").unwrap();
        let alg = Algorithm::new(&g, &[x, c], &[a]).unwrap();
        let xv = Matrix::column(&[1.0, 2.0]);
        let out = alg
            .run(&mut Numeric::new(), &[xv.clone(), Matrix::scalar(1.0)])
            .unwrap();
        assert_eq!(out[0], xv);
        let err = alg
            .run(&mut Numeric::new(), &[xv, Matrix::scalar(0.0)])
            .unwrap_err();
        assert_eq!(err, GraphError::AssertionFailure("c must hold".into()));
    }

    #[test]
    fn test_substitute() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let y = g.sym("y", 1, 1);
        let e = g.times(x, y).unwrap();
        let e = g.sin(e).unwrap();
        let two = g.scalar(2.0);
        let replaced = g.substitute(&[e], &[x], &[two]).unwrap();
        assert_eq!(g.free_symbols(&replaced), vec![y]);
        let alg = Algorithm::new(&g, &[y], &replaced).unwrap();
        let out = alg.run(&mut Numeric::new(), &[Matrix::scalar(0.25)]).unwrap();
        assert_relative_eq!(out[0].nonzeros()[0], 0.5f64.sin());
        assert!(matches!(
            g.substitute(&[e], &[x, y], &[two]),
            Err(GraphError::InvalidInputLength { .. })
        ));
        let v = g.sym("v", 2, 1);
        assert!(matches!(
            g.substitute(&[e], &[x], &[v]),
            Err(GraphError::DimensionError { .. })
        ));
    }

    #[test]
    fn test_bits_forward() {
        let mut g = Graph::new();
        let x = g.sym("x", 3, 1);
        let parts = g.vertsplit(x, &[0, 1, 3]).unwrap();
        let s = g.sum_all(parts[1]).unwrap();
        let alg = Algorithm::new(&g, &[x], &[s]).unwrap();
        let seed = Matrix::new(
            Sparsity::dense(3, 1),
            vec![BitWord::bit(0), BitWord::bit(1), BitWord::bit(2)],
        )
        .unwrap();
        let out = alg.run(&mut Bits::new(), &[seed]).unwrap();
        assert_eq!(out[0].nonzeros(), &[BitWord(0b110)]);
    }
}
