//! The expression graph: an append-only arena of nodes with validating factories.
//!
//! Every factory checks the algebraic contract of its operation before anything is
//! linked into the arena, computes the result sparsity, and applies the construction-time
//! simplifications enabled in [`GraphOptions`]. Dependencies always point at earlier
//! nodes, so the node order is a topological order.
//!
//! # Example
//! ```
//! use exprgraph_jit::prelude::*;
//!
//! let mut g = Graph::new();
//! let x = g.sym("x", 2, 2);
//! let y = g.inverse(x).unwrap();
//! assert_eq!(g.shape(y), Shape::new(2, 2));
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::errors::GraphError;
use crate::matrix::{self, Matrix};
use crate::node::{ConcatKind, Mx, Node, NormKind, Op, SplitKind};
use crate::ops::{BinaryOp, UnaryOp};
use crate::sparsity::{Shape, Sparsity};

/// Construction-time behaviour of a [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphOptions {
    /// Apply algebraic simplifications and constant folding in the factories
    pub simplify: bool,
    /// Return an existing node instead of creating an identical one
    pub hash_cons: bool,
    /// Depth of the structural comparison used by simplifications such as `x - x`
    pub max_depth: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        GraphOptions {
            simplify: true,
            hash_cons: true,
            max_depth: 1,
        }
    }
}

/// Arena of expression nodes.
#[derive(Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    options: GraphOptions,
    cse: HashMap<u64, Vec<u32>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: GraphOptions) -> Self {
        Graph {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> GraphOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The node producing `x`.
    pub fn node_of(&self, x: Mx) -> &Node {
        &self.nodes[x.node as usize]
    }

    pub fn sparsity(&self, x: Mx) -> &Sparsity {
        &self.nodes[x.node as usize].sparsity[x.output as usize]
    }

    pub fn shape(&self, x: Mx) -> Shape {
        self.sparsity(x).shape()
    }

    fn push(&mut self, op: Op, deps: Vec<Mx>, sparsity: Vec<Sparsity>) -> u32 {
        let key = (self.options.hash_cons && !op.is_symbol()).then(|| {
            let mut hasher = DefaultHasher::new();
            op.hash(&mut hasher);
            deps.hash(&mut hasher);
            sparsity.hash(&mut hasher);
            hasher.finish()
        });
        if let Some(ids) = key.and_then(|k| self.cse.get(&k)) {
            for &id in ids {
                let node = &self.nodes[id as usize];
                if node.op == op && node.deps == deps && node.sparsity == sparsity {
                    return id;
                }
            }
        }
        let id = self.nodes.len() as u32;
        self.nodes.push(Node {
            op,
            deps,
            sparsity,
        });
        if let Some(k) = key {
            self.cse.entry(k).or_default().push(id);
        }
        id
    }

    fn push_single(&mut self, op: Op, deps: Vec<Mx>, sparsity: Sparsity) -> Mx {
        Mx::new(self.push(op, deps, vec![sparsity]), 0)
    }

    // Leaves

    /// Creates a symbolic leaf. Two symbols with the same name are distinct.
    pub fn symbol(&mut self, name: impl Into<String>, sparsity: Sparsity) -> Mx {
        self.push_single(Op::Symbol { name: name.into() }, Vec::new(), sparsity)
    }

    /// Dense `nrow x ncol` symbol.
    pub fn sym(&mut self, name: impl Into<String>, nrow: usize, ncol: usize) -> Mx {
        self.symbol(name, Sparsity::dense(nrow, ncol))
    }

    pub fn constant(&mut self, value: Matrix<f64>) -> Mx {
        let sparsity = value.sparsity().clone();
        self.push_single(Op::Constant(value), Vec::new(), sparsity)
    }

    pub fn scalar(&mut self, value: f64) -> Mx {
        self.constant(Matrix::scalar(value))
    }

    /// Constant with every entry of `sparsity` set to `value`.
    pub fn filled(&mut self, sparsity: &Sparsity, value: f64) -> Mx {
        self.constant(Matrix::filled(sparsity, value))
    }

    /// Structurally empty `nrow x ncol` matrix.
    pub fn zeros(&mut self, nrow: usize, ncol: usize) -> Mx {
        self.constant(Matrix::zeros(&Sparsity::sparse(nrow, ncol)))
    }

    pub fn ones(&mut self, nrow: usize, ncol: usize) -> Mx {
        self.filled(&Sparsity::dense(nrow, ncol), 1.0)
    }

    pub fn identity(&mut self, n: usize) -> Mx {
        self.constant(Matrix::identity(n))
    }

    /// Value of `x` if it is a constant.
    pub fn constant_value(&self, x: Mx) -> Option<&Matrix<f64>> {
        match &self.node_of(x).op {
            Op::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_symbol(&self, x: Mx) -> bool {
        self.node_of(x).op.is_symbol()
    }

    /// True if `x` is a constant whose entries are all zero.
    pub fn is_zero(&self, x: Mx) -> bool {
        self.constant_value(x).is_some_and(Matrix::is_zero)
    }

    /// True if `x` is a dense constant of ones.
    pub fn is_one(&self, x: Mx) -> bool {
        self.constant_value(x).is_some_and(|m| m.is_constant(1.0))
    }

    fn unary_arg(&self, x: Mx, op: UnaryOp) -> Option<Mx> {
        let node = self.node_of(x);
        (node.op == Op::Unary(op)).then(|| node.deps[0])
    }

    // Elementwise

    /// Applies an elementwise function.
    ///
    /// Functions with `f(0) = 0` keep the argument pattern, all others give a dense result.
    pub fn unary(&mut self, op: UnaryOp, x: Mx) -> Result<Mx, GraphError> {
        let xsp = self.sparsity(x).clone();
        let sp = if op.is_zero_preserving() {
            xsp
        } else {
            Sparsity::dense(xsp.nrow(), xsp.ncol())
        };
        if self.options.simplify {
            if let Some(value) = self.constant_value(x) {
                let folded = matrix::unary(op, value, &sp)?;
                return Ok(self.constant(folded));
            }
            if let Some(simpler) = self.simplify_unary(op, x)? {
                return Ok(simpler);
            }
        }
        Ok(self.push_single(Op::Unary(op), vec![x], sp))
    }

    fn simplify_unary(&mut self, op: UnaryOp, x: Mx) -> Result<Option<Mx>, GraphError> {
        let Op::Unary(inner) = self.node_of(x).op else {
            return Ok(None);
        };
        let a = self.node_of(x).deps[0];
        use UnaryOp::*;
        Ok(match (op, inner) {
            (Neg, Neg) | (Sq, Sqrt) | (Log, Exp) | (Exp, Log) | (Inv, Inv) => Some(a),
            (Abs, Abs) => Some(x),
            (Sqrt, Sq) => Some(self.unary(Abs, a)?),
            (Abs, Neg) | (Sq, Neg) | (Cos, Neg) => Some(self.unary(op, a)?),
            _ => None,
        })
    }

    /// Applies an elementwise function of two arguments.
    ///
    /// The arguments must have the same shape, or one of them must be a scalar that is
    /// broadcast over the other.
    ///
    /// # Errors
    /// `DimensionError` if the shapes are incompatible.
    pub fn binary(&mut self, op: BinaryOp, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        let sp = binary_sparsity(op, self.sparsity(x), self.sparsity(y))?;
        if self.options.simplify {
            if let (Some(a), Some(b)) = (self.constant_value(x), self.constant_value(y)) {
                let folded = matrix::binary(op, a, b, &sp)?;
                return Ok(self.constant(folded));
            }
            if let Some(simpler) = self.simplify_binary(op, x, y, sp.shape())? {
                return Ok(simpler);
            }
        }
        Ok(self.push_single(Op::Binary(op), vec![x, y], sp))
    }

    fn simplify_binary(
        &mut self,
        op: BinaryOp,
        x: Mx,
        y: Mx,
        shape: Shape,
    ) -> Result<Option<Mx>, GraphError> {
        let x_fits = self.shape(x) == shape;
        let y_fits = self.shape(y) == shape;
        Ok(match op {
            BinaryOp::Add if self.is_zero(x) && y_fits => Some(y),
            BinaryOp::Add if self.is_zero(y) && x_fits => Some(x),
            BinaryOp::Add => match (self.unary_arg(x, UnaryOp::Neg), self.unary_arg(y, UnaryOp::Neg)) {
                (_, Some(z)) => Some(self.binary(BinaryOp::Sub, x, z)?),
                (Some(z), None) => Some(self.binary(BinaryOp::Sub, y, z)?),
                (None, None) => None,
            },
            BinaryOp::Sub if self.is_zero(y) && x_fits => Some(x),
            BinaryOp::Sub if self.is_zero(x) && y_fits => Some(self.unary(UnaryOp::Neg, y)?),
            BinaryOp::Sub if self.is_equal(x, y, self.options.max_depth) => {
                Some(self.zeros(shape.nrow, shape.ncol))
            }
            BinaryOp::Sub => match self.unary_arg(y, UnaryOp::Neg) {
                Some(z) => Some(self.binary(BinaryOp::Add, x, z)?),
                None => None,
            },
            BinaryOp::Mul if self.is_zero(x) || self.is_zero(y) => {
                Some(self.zeros(shape.nrow, shape.ncol))
            }
            BinaryOp::Mul if self.is_one(x) && y_fits => Some(y),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Pow if self.is_one(y) && x_fits => Some(x),
            _ => None,
        })
    }

    pub fn add(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Add, x, y)
    }

    pub fn sub(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Sub, x, y)
    }

    /// Elementwise product.
    pub fn times(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Mul, x, y)
    }

    pub fn div(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Div, x, y)
    }

    pub fn pow(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Pow, x, y)
    }

    pub fn atan2(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Atan2, x, y)
    }

    pub fn fmax(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Fmax, x, y)
    }

    /// Elementwise `x == y` as one or zero.
    pub fn equal(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        self.binary(BinaryOp::Eq, x, y)
    }

    pub fn neg(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Neg, x)
    }

    pub fn sqrt(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Sqrt, x)
    }

    pub fn sq(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Sq, x)
    }

    pub fn exp(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Exp, x)
    }

    pub fn log(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Log, x)
    }

    pub fn sin(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Sin, x)
    }

    pub fn cos(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Cos, x)
    }

    pub fn abs(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Abs, x)
    }

    pub fn sign(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.unary(UnaryOp::Sign, x)
    }

    // Linear algebra

    /// Matrix product `x * y`.
    ///
    /// # Errors
    /// `DimensionError` if the inner dimensions differ.
    pub fn mul(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        let sp = Sparsity::mul(self.sparsity(x), self.sparsity(y))?;
        if self.options.simplify && (self.is_zero(x) || self.is_zero(y)) {
            return Ok(self.zeros(sp.nrow(), sp.ncol()));
        }
        let z0 = self.filled(&sp, 0.0);
        self.mul_add(z0, x, y)
    }

    /// Fused `z0 + x * y`. The result keeps the pattern of `z0`.
    ///
    /// # Errors
    /// `DimensionError` if the inner dimensions differ or `z0` does not have the shape
    /// of the product.
    pub fn mul_add(&mut self, z0: Mx, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        let (xs, ys) = (self.shape(x), self.shape(y));
        if xs.ncol != ys.nrow {
            return Err(GraphError::dimension("mul", xs, ys));
        }
        let product = Shape::new(xs.nrow, ys.ncol);
        if self.shape(z0) != product {
            return Err(GraphError::dimension("mul_add", self.shape(z0), product));
        }
        if self.options.simplify {
            if self.is_zero(x) || self.is_zero(y) {
                return Ok(z0);
            }
            if let (Some(a), Some(b), Some(c)) = (
                self.constant_value(z0),
                self.constant_value(x),
                self.constant_value(y),
            ) {
                let folded = matrix::mul_add(a, b, c);
                return Ok(self.constant(folded));
            }
        }
        let sp = self.sparsity(z0).clone();
        Ok(self.push_single(Op::MulAdd, vec![z0, x, y], sp))
    }

    /// Dense inverse of a square matrix.
    ///
    /// # Errors
    /// `StructuralError` if `x` is not square.
    pub fn inverse(&mut self, x: Mx) -> Result<Mx, GraphError> {
        let shape = self.shape(x);
        if shape.nrow != shape.ncol {
            return Err(GraphError::structural(format!(
                "inverse requires a square matrix, got {shape}"
            )));
        }
        if self.options.simplify {
            if let Some(value) = self.constant_value(x) {
                let folded = matrix::inverse(value);
                return Ok(self.constant(folded));
            }
            if self.node_of(x).op == Op::Inverse {
                return Ok(self.node_of(x).deps[0]);
            }
        }
        Ok(self.push_single(Op::Inverse, vec![x], Sparsity::dense(shape.nrow, shape.ncol)))
    }

    /// Solution of `a x = b`, or `a^T x = b` if `transpose` is set.
    ///
    /// # Errors
    /// `StructuralError` if `a` is not square, `DimensionError` if the row counts differ.
    pub fn solve(&mut self, a: Mx, b: Mx, transpose: bool) -> Result<Mx, GraphError> {
        let (ashape, bshape) = (self.shape(a), self.shape(b));
        if ashape.nrow != ashape.ncol {
            return Err(GraphError::structural(format!(
                "solve requires a square matrix, got {ashape}"
            )));
        }
        if ashape.nrow != bshape.nrow {
            return Err(GraphError::dimension("solve", ashape, bshape));
        }
        if self.options.simplify {
            if let (Some(av), Some(bv)) = (self.constant_value(a), self.constant_value(b)) {
                let folded = matrix::solve(av, bv, transpose);
                return Ok(self.constant(folded));
            }
        }
        Ok(self.push_single(
            Op::Solve { transpose },
            vec![a, b],
            Sparsity::dense(bshape.nrow, bshape.ncol),
        ))
    }

    /// Sum of the elementwise product of two equally shaped matrices.
    pub fn inner_prod(&mut self, x: Mx, y: Mx) -> Result<Mx, GraphError> {
        if self.shape(x) != self.shape(y) {
            return Err(GraphError::dimension("inner_prod", self.shape(x), self.shape(y)));
        }
        if self.options.simplify {
            if let (Some(a), Some(b)) = (self.constant_value(x), self.constant_value(y)) {
                let folded = matrix::inner_prod(a, b)?;
                return Ok(self.constant(folded));
            }
        }
        Ok(self.push_single(Op::InnerProd, vec![x, y], Sparsity::scalar()))
    }

    /// Matrix norm.
    ///
    /// # Errors
    /// `StructuralError` if the 2-norm of a non-vector is requested.
    pub fn norm(&mut self, kind: NormKind, x: Mx) -> Result<Mx, GraphError> {
        if kind == NormKind::Two && !self.sparsity(x).is_vector() {
            return Err(GraphError::structural(format!(
                "2-norm is only defined for vectors, got {}",
                self.shape(x)
            )));
        }
        if self.options.simplify {
            if let Some(value) = self.constant_value(x) {
                let folded = matrix::norm(kind, value);
                return Ok(self.constant(folded));
            }
        }
        Ok(self.push_single(Op::Norm(kind), vec![x], Sparsity::scalar()))
    }

    pub fn norm_fro(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.norm(NormKind::Frobenius, x)
    }

    pub fn norm_1(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.norm(NormKind::One, x)
    }

    pub fn norm_2(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.norm(NormKind::Two, x)
    }

    pub fn norm_inf(&mut self, x: Mx) -> Result<Mx, GraphError> {
        self.norm(NormKind::Inf, x)
    }

    /// Sum of all entries.
    pub fn sum_all(&mut self, x: Mx) -> Result<Mx, GraphError> {
        let shape = self.shape(x);
        let ones = self.ones(shape.nrow, shape.ncol);
        self.inner_prod(x, ones)
    }

    // Structural

    pub fn transpose(&mut self, x: Mx) -> Result<Mx, GraphError> {
        if self.options.simplify {
            if self.sparsity(x).is_scalar() {
                return Ok(x);
            }
            if self.node_of(x).op == Op::Transpose {
                return Ok(self.node_of(x).deps[0]);
            }
            if let Some(value) = self.constant_value(x) {
                let folded = matrix::transpose(value);
                return Ok(self.constant(folded));
            }
        }
        let sp = self.sparsity(x).transpose();
        Ok(self.push_single(Op::Transpose, vec![x], sp))
    }

    /// Reinterprets `x` with a new shape, keeping the column-major order of its entries.
    ///
    /// # Errors
    /// `DimensionError` if the number of entries changes.
    pub fn reshape(&mut self, x: Mx, nrow: usize, ncol: usize) -> Result<Mx, GraphError> {
        let sp = self.sparsity(x).reshape(nrow, ncol)?;
        if self.options.simplify {
            if sp.shape() == self.shape(x) {
                return Ok(x);
            }
            if self.node_of(x).op == Op::Reshape {
                let inner = self.node_of(x).deps[0];
                return self.reshape(inner, nrow, ncol);
            }
            if let Some(value) = self.constant_value(x) {
                let folded = matrix::reshape(value, &sp);
                return Ok(self.constant(folded));
            }
        }
        Ok(self.push_single(Op::Reshape, vec![x], sp))
    }

    /// Column vector of all entries.
    pub fn vec(&mut self, x: Mx) -> Result<Mx, GraphError> {
        let numel = self.sparsity(x).numel();
        self.reshape(x, numel, 1)
    }

    /// Re-patterns `x`: entries outside `sparsity` are dropped, missing ones become zero.
    pub fn project(&mut self, x: Mx, sparsity: &Sparsity) -> Result<Mx, GraphError> {
        if self.shape(x) != sparsity.shape() {
            return Err(GraphError::dimension("project", self.shape(x), sparsity.shape()));
        }
        if self.options.simplify {
            if self.sparsity(x) == sparsity {
                return Ok(x);
            }
            if let Some(value) = self.constant_value(x) {
                let folded = value.project(sparsity)?;
                return Ok(self.constant(folded));
            }
        }
        Ok(self.push_single(Op::Project, vec![x], sparsity.clone()))
    }

    /// Concatenates matrices. An empty list gives a 0x0 matrix.
    pub fn concat(&mut self, kind: ConcatKind, parts: &[Mx]) -> Result<Mx, GraphError> {
        if parts.is_empty() {
            return Ok(self.zeros(0, 0));
        }
        let patterns: Vec<Sparsity> = parts.iter().map(|&p| self.sparsity(p).clone()).collect();
        let sp = match kind {
            ConcatKind::Horz => Sparsity::horzcat(&patterns)?,
            ConcatKind::Vert => Sparsity::vertcat(&patterns)?,
            ConcatKind::Diag => Sparsity::blkdiag(&patterns),
        };
        if self.options.simplify {
            if parts.len() == 1 {
                return Ok(parts[0]);
            }
            if let Some(source) = self.split_source(kind, parts) {
                return Ok(source);
            }
            let values: Option<Vec<&Matrix<f64>>> =
                parts.iter().map(|&p| self.constant_value(p)).collect();
            if let Some(values) = values {
                let folded = matrix::concat(kind, &values, &sp);
                return Ok(self.constant(folded));
            }
        }
        Ok(self.push_single(Op::Concat(kind), parts.to_vec(), sp))
    }

    /// The input of a split whose outputs are exactly `parts`, in order.
    fn split_source(&self, kind: ConcatKind, parts: &[Mx]) -> Option<Mx> {
        let node = self.node_of(parts[0]);
        let Op::Split(split) = &node.op else {
            return None;
        };
        let complete = split.inverse() == kind
            && parts.len() == node.n_outputs()
            && parts
                .iter()
                .enumerate()
                .all(|(k, p)| p.node == parts[0].node && p.output as usize == k);
        complete.then(|| node.deps[0])
    }

    pub fn horzcat(&mut self, parts: &[Mx]) -> Result<Mx, GraphError> {
        self.concat(ConcatKind::Horz, parts)
    }

    pub fn vertcat(&mut self, parts: &[Mx]) -> Result<Mx, GraphError> {
        self.concat(ConcatKind::Vert, parts)
    }

    pub fn diagcat(&mut self, parts: &[Mx]) -> Result<Mx, GraphError> {
        self.concat(ConcatKind::Diag, parts)
    }

    /// Splits `x` into several outputs.
    ///
    /// # Errors
    /// `StructuralError` if the offsets are not monotone from zero to the split
    /// dimension, or if a diagonal split would drop nonzeros.
    pub fn split(&mut self, kind: SplitKind, x: Mx) -> Result<Vec<Mx>, GraphError> {
        let outputs = kind.apply(self.sparsity(x))?;
        if outputs.is_empty() {
            return Ok(Vec::new());
        }
        if self.options.simplify {
            if outputs.len() == 1 {
                return Ok(vec![x]);
            }
            if let Some(value) = self.constant_value(x) {
                let parts = matrix::split(&kind, value, &outputs);
                return Ok(parts.into_iter().map(|p| self.constant(p)).collect());
            }
        }
        let n = outputs.len() as u32;
        let id = self.push(Op::Split(kind), vec![x], outputs);
        Ok((0..n).map(|k| Mx::new(id, k)).collect())
    }

    pub fn horzsplit(&mut self, x: Mx, offsets: &[usize]) -> Result<Vec<Mx>, GraphError> {
        self.split(SplitKind::Horz(offsets.to_vec()), x)
    }

    pub fn vertsplit(&mut self, x: Mx, offsets: &[usize]) -> Result<Vec<Mx>, GraphError> {
        self.split(SplitKind::Vert(offsets.to_vec()), x)
    }

    pub fn diagsplit(
        &mut self,
        x: Mx,
        row_offsets: &[usize],
        col_offsets: &[usize],
    ) -> Result<Vec<Mx>, GraphError> {
        self.split(
            SplitKind::Diag {
                rows: row_offsets.to_vec(),
                cols: col_offsets.to_vec(),
            },
            x,
        )
    }

    /// Gathers nonzeros of `x` into a matrix with pattern `sparsity`.
    ///
    /// # Errors
    /// `InvalidInputLength` if the number of indices differs from `sparsity.nnz()`,
    /// `IndexOutOfRange` if an index does not address a nonzero of `x`.
    pub fn get_nonzeros(
        &mut self,
        x: Mx,
        indices: &[usize],
        sparsity: &Sparsity,
    ) -> Result<Mx, GraphError> {
        if indices.len() != sparsity.nnz() {
            return Err(GraphError::InvalidInputLength {
                expected: sparsity.nnz(),
                got: indices.len(),
            });
        }
        let nnz = self.sparsity(x).nnz();
        check_indices(indices, nnz)?;
        if self.options.simplify {
            let identity = indices.iter().enumerate().all(|(i, &k)| i == k);
            if identity && nnz == indices.len() && self.sparsity(x) == sparsity {
                return Ok(x);
            }
            if let Some(value) = self.constant_value(x) {
                let folded = matrix::get_nonzeros(value, indices, sparsity);
                return Ok(self.constant(folded));
            }
        }
        Ok(self.push_single(Op::GetNonzeros(indices.to_vec()), vec![x], sparsity.clone()))
    }

    /// Adds nonzero `i` of `x` to nonzero `indices[i]` of `y`.
    pub fn add_nonzeros(&mut self, y: Mx, x: Mx, indices: &[usize]) -> Result<Mx, GraphError> {
        let xnnz = self.sparsity(x).nnz();
        if indices.len() != xnnz {
            return Err(GraphError::InvalidInputLength {
                expected: xnnz,
                got: indices.len(),
            });
        }
        check_indices(indices, self.sparsity(y).nnz())?;
        if self.options.simplify {
            if self.is_zero(x) {
                return Ok(y);
            }
            if let (Some(a), Some(b)) = (self.constant_value(y), self.constant_value(x)) {
                let folded = matrix::add_nonzeros(a, b, indices);
                return Ok(self.constant(folded));
            }
        }
        let sp = self.sparsity(y).clone();
        Ok(self.push_single(Op::AddNonzeros(indices.to_vec()), vec![y, x], sp))
    }

    /// Overwrites nonzero `indices[i]` of `y` with nonzero `i` of `x`.
    ///
    /// # Errors
    /// `InvalidInputLength` if the number of indices differs from `x`'s nonzero count,
    /// `IndexOutOfRange` for an index past the nonzeros of `y` and `StructuralError` if
    /// a nonzero is assigned twice.
    pub fn set_nonzeros(&mut self, y: Mx, x: Mx, indices: &[usize]) -> Result<Mx, GraphError> {
        let xnnz = self.sparsity(x).nnz();
        if indices.len() != xnnz {
            return Err(GraphError::InvalidInputLength {
                expected: xnnz,
                got: indices.len(),
            });
        }
        let ynnz = self.sparsity(y).nnz();
        check_indices(indices, ynnz)?;
        let mut assigned = vec![false; ynnz];
        for &k in indices {
            if std::mem::replace(&mut assigned[k], true) {
                return Err(GraphError::structural(format!("nonzero {k} is assigned twice")));
            }
        }
        if self.options.simplify {
            if indices.is_empty() {
                return Ok(y);
            }
            if let (Some(a), Some(b)) = (self.constant_value(y), self.constant_value(x)) {
                let folded = matrix::set_nonzeros(a, b, indices);
                return Ok(self.constant(folded));
            }
        }
        let sp = self.sparsity(y).clone();
        Ok(self.push_single(Op::SetNonzeros(indices.to_vec()), vec![y, x], sp))
    }

    /// Selects rows and columns of `x`.
    pub fn get(&mut self, x: Mx, rows: &[usize], cols: &[usize]) -> Result<Mx, GraphError> {
        let (sp, mapping) = self.sparsity(x).sub(rows, cols)?;
        self.get_nonzeros(x, &mapping, &sp)
    }

    // Checks

    /// Passes `x` through; numeric evaluation fails with `message` unless `cond` is one.
    ///
    /// # Errors
    /// `StructuralError` if `cond` is not a scalar.
    pub fn assertion(&mut self, x: Mx, cond: Mx, message: impl Into<String>) -> Result<Mx, GraphError> {
        if !self.sparsity(cond).is_scalar() {
            return Err(GraphError::structural(format!(
                "assertion condition must be scalar, got {}",
                self.shape(cond)
            )));
        }
        if self.options.simplify && self.is_one(cond) {
            return Ok(x);
        }
        let sp = self.sparsity(x).clone();
        Ok(self.push_single(
            Op::Assertion {
                message: message.into(),
            },
            vec![x, cond],
            sp,
        ))
    }

    // Queries

    /// Structural equality of two expressions, comparing at most `depth` levels of
    /// dependencies. Symbols are only equal to themselves.
    pub fn is_equal(&self, a: Mx, b: Mx, depth: usize) -> bool {
        if a == b {
            return true;
        }
        if depth == 0 || a.output != b.output {
            return false;
        }
        let (na, nb) = (self.node_of(a), self.node_of(b));
        if na.op.is_symbol() || na.op != nb.op || na.sparsity != nb.sparsity {
            return false;
        }
        na.deps.len() == nb.deps.len()
            && na
                .deps
                .iter()
                .zip(&nb.deps)
                .all(|(&x, &y)| self.is_equal(x, y, depth - 1))
    }

    /// Marks every node `exprs` depend on, including the roots.
    pub fn reachable(&self, exprs: &[Mx]) -> Vec<bool> {
        let mut mark = vec![false; self.nodes.len()];
        for x in exprs {
            mark[x.node as usize] = true;
        }
        for id in (0..self.nodes.len()).rev() {
            if mark[id] {
                for dep in &self.nodes[id].deps {
                    mark[dep.node as usize] = true;
                }
            }
        }
        mark
    }

    /// Symbols the expressions depend on, in creation order.
    pub fn free_symbols(&self, exprs: &[Mx]) -> Vec<Mx> {
        self.reachable(exprs)
            .into_iter()
            .enumerate()
            .filter(|&(id, live)| live && self.nodes[id].op.is_symbol())
            .map(|(id, _)| Mx::new(id as u32, 0))
            .collect()
    }

    /// Copies the part of the graph the roots depend on into a new graph.
    ///
    /// # Returns
    /// The new graph and the handles of the roots inside it.
    pub fn extract(&self, roots: &[Mx]) -> (Graph, Vec<Mx>) {
        let mark = self.reachable(roots);
        let mut graph = Graph::with_options(self.options);
        let mut remap = vec![u32::MAX; self.nodes.len()];
        for (id, node) in self.nodes.iter().enumerate() {
            if !mark[id] {
                continue;
            }
            let deps = node
                .deps
                .iter()
                .map(|d| Mx::new(remap[d.node as usize], d.output))
                .collect();
            remap[id] = graph.push(node.op.clone(), deps, node.sparsity.clone());
        }
        let handles = roots
            .iter()
            .map(|r| Mx::new(remap[r.node as usize], r.output))
            .collect();
        (graph, handles)
    }

    /// Infix rendering of an expression.
    pub fn display(&self, x: Mx) -> MxDisplay<'_> {
        MxDisplay { graph: self, x }
    }

    fn write_expr(&self, f: &mut fmt::Formatter<'_>, x: Mx) -> fmt::Result {
        let node = self.node_of(x);
        let d = &node.deps;
        match &node.op {
            Op::Symbol { name } => write!(f, "{name}"),
            Op::Constant(value) => write!(f, "{value}"),
            Op::Unary(UnaryOp::Neg) => {
                write!(f, "(-")?;
                self.write_expr(f, d[0])?;
                write!(f, ")")
            }
            Op::Binary(op) if op.infix().is_some() => {
                write!(f, "(")?;
                self.write_expr(f, d[0])?;
                write!(f, "{}", op.infix().unwrap_or_default())?;
                self.write_expr(f, d[1])?;
                write!(f, ")")
            }
            Op::MulAdd if self.is_zero(d[0]) => self.write_call(f, "mtimes", &d[1..]),
            Op::MulAdd => {
                write!(f, "(")?;
                self.write_expr(f, d[0])?;
                write!(f, "+")?;
                self.write_call(f, "mtimes", &d[1..])?;
                write!(f, ")")
            }
            Op::Transpose => {
                self.write_expr(f, d[0])?;
                write!(f, "'")
            }
            Op::Split(_) => {
                self.write_call(f, node.op.name(), d)?;
                write!(f, "{{{}}}", x.output)
            }
            Op::GetNonzeros(indices) => {
                self.write_expr(f, d[0])?;
                write!(f, "{indices:?}")
            }
            Op::AddNonzeros(indices) => {
                write!(f, "(")?;
                self.write_expr(f, d[0])?;
                write!(f, "{indices:?}+=")?;
                self.write_expr(f, d[1])?;
                write!(f, ")")
            }
            Op::SetNonzeros(indices) => {
                write!(f, "(")?;
                self.write_expr(f, d[0])?;
                write!(f, "{indices:?}=")?;
                self.write_expr(f, d[1])?;
                write!(f, ")")
            }
            Op::Unary(op) => self.write_call(f, &op.to_string(), d),
            op => self.write_call(f, op.name(), d),
        }
    }

    fn write_call(&self, f: &mut fmt::Formatter<'_>, name: &str, args: &[Mx]) -> fmt::Result {
        write!(f, "{name}(")?;
        for (i, &a) in args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            self.write_expr(f, a)?;
        }
        write!(f, ")")
    }
}

fn binary_sparsity(op: BinaryOp, x: &Sparsity, y: &Sparsity) -> Result<Sparsity, GraphError> {
    if x.shape() == y.shape() {
        return match (op.is_lhs_zero_preserving(), op.is_rhs_zero_preserving()) {
            (true, true) => x.intersect(y),
            (true, false) => Ok(x.clone()),
            (false, true) => Ok(y.clone()),
            (false, false) if op.is_zero_at_origin() => x.unite(y),
            (false, false) => Ok(Sparsity::dense(x.nrow(), x.ncol())),
        };
    }
    if x.is_scalar() {
        return Ok(if op.is_rhs_zero_preserving() {
            y.clone()
        } else {
            Sparsity::dense(y.nrow(), y.ncol())
        });
    }
    if y.is_scalar() {
        return Ok(if op.is_lhs_zero_preserving() {
            x.clone()
        } else {
            Sparsity::dense(x.nrow(), x.ncol())
        });
    }
    Err(GraphError::dimension(op.name(), x.shape(), y.shape()))
}

fn check_indices(indices: &[usize], len: usize) -> Result<(), GraphError> {
    match indices.iter().find(|&&k| k >= len) {
        Some(&index) => Err(GraphError::IndexOutOfRange {
            what: "nonzeros",
            index,
            len,
        }),
        None => Ok(()),
    }
}

/// Infix rendering of one expression, see [`Graph::display`].
pub struct MxDisplay<'g> {
    graph: &'g Graph,
    x: Mx,
}

impl fmt::Display for MxDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.graph.write_expr(f, self.x)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Graph ({} nodes)", self.nodes.len())?;
        for (id, node) in self.nodes.iter().enumerate() {
            writeln!(f, "  @{id} = {node}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_are_distinct() {
        let mut g = Graph::new();
        let a = g.sym("x", 1, 1);
        let b = g.sym("x", 1, 1);
        assert_ne!(a, b);
        assert!(!g.is_equal(a, b, 10));
    }

    #[test]
    fn test_hash_consing() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let a = g.sin(x).unwrap();
        let b = g.sin(x).unwrap();
        assert_eq!(a, b);
        // Signed zeros compare equal and therefore share a node.
        let zero = g.scalar(0.0);
        let negative_zero = g.scalar(-0.0);
        assert_eq!(zero, negative_zero);

        let mut g = Graph::with_options(GraphOptions {
            hash_cons: false,
            ..GraphOptions::default()
        });
        let x = g.sym("x", 2, 1);
        let a = g.sin(x).unwrap();
        let b = g.sin(x).unwrap();
        assert_ne!(a, b);
        assert!(g.is_equal(a, b, 1));
    }

    #[test]
    fn test_set_nonzeros_contract() {
        let mut g = Graph::new();
        let y = g.sym("y", 3, 1);
        let x = g.sym("x", 2, 1);
        assert!(matches!(
            g.set_nonzeros(y, x, &[1, 1]),
            Err(GraphError::StructuralError(_))
        ));
        assert!(matches!(
            g.set_nonzeros(y, x, &[0, 3]),
            Err(GraphError::IndexOutOfRange { index: 3, .. })
        ));
        assert!(matches!(
            g.set_nonzeros(y, x, &[0]),
            Err(GraphError::InvalidInputLength { expected: 2, got: 1 })
        ));
        let r = g.set_nonzeros(y, x, &[2, 0]).unwrap();
        assert_eq!(g.sparsity(r), g.sparsity(y));
        assert_eq!(g.display(r).to_string(), "(y[2, 0]=x)");

        let a = g.constant(Matrix::column(&[1.0, 2.0, 3.0]));
        let b = g.constant(Matrix::column(&[-4.0]));
        let folded = g.set_nonzeros(a, b, &[1]).unwrap();
        assert_eq!(g.constant_value(folded).map(|m| m.nonzeros().to_vec()), Some(vec![1.0, -4.0, 3.0]));
        let n = g.norm_inf(folded).unwrap();
        assert_eq!(g.constant_value(n).map(|m| m.get(0, 0)), Some(4.0));
    }

    #[test]
    fn test_unary_cancellations() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let n = g.neg(x).unwrap();
        assert_eq!(g.neg(n).unwrap(), x);
        let r = g.sqrt(x).unwrap();
        assert_eq!(g.sq(r).unwrap(), x);
        let s = g.sq(x).unwrap();
        let back = g.sqrt(s).unwrap();
        assert_eq!(g.node_of(back).op, Op::Unary(UnaryOp::Abs));
        let e = g.exp(x).unwrap();
        assert_eq!(g.log(e).unwrap(), x);
    }

    #[test]
    fn test_simplification_disabled() {
        let mut g = Graph::with_options(GraphOptions {
            simplify: false,
            ..GraphOptions::default()
        });
        let x = g.sym("x", 1, 1);
        let n = g.neg(x).unwrap();
        let nn = g.neg(n).unwrap();
        assert_ne!(nn, x);
        let zero = g.scalar(0.0);
        assert_ne!(g.add(x, zero).unwrap(), x);
    }

    #[test]
    fn test_binary_identities() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 2);
        let zero = g.zeros(2, 2);
        let one = g.scalar(1.0);
        assert_eq!(g.add(x, zero).unwrap(), x);
        assert_eq!(g.sub(x, zero).unwrap(), x);
        assert_eq!(g.times(x, one).unwrap(), x);
        assert_eq!(g.div(x, one).unwrap(), x);
        let d = g.sub(x, x).unwrap();
        assert!(g.is_zero(d));
        assert_eq!(g.sparsity(d).nnz(), 0);
        let n = g.sub(zero, x).unwrap();
        assert_eq!(g.node_of(n).op, Op::Unary(UnaryOp::Neg));
    }

    #[test]
    fn test_constant_folding() {
        let mut g = Graph::new();
        let a = g.scalar(2.0);
        let b = g.scalar(3.0);
        let c = g.times(a, b).unwrap();
        assert_eq!(g.constant_value(c), Some(&Matrix::scalar(6.0)));
    }

    #[test]
    fn test_sparsity_rules() {
        let mut g = Graph::new();
        let x = g.symbol("x", Sparsity::diag(3));
        let y = g.sym("y", 3, 3);
        let s = g.sym("s", 1, 1);
        let sin = g.sin(x).unwrap();
        let cos = g.cos(x).unwrap();
        let prod = g.times(x, y).unwrap();
        let sum = g.add(x, y).unwrap();
        let scaled = g.times(s, x).unwrap();
        let shifted = g.add(s, x).unwrap();
        let divided = g.div(x, s).unwrap();
        assert_eq!(g.sparsity(sin).nnz(), 3);
        assert!(g.sparsity(cos).is_dense());
        assert_eq!(g.sparsity(prod).nnz(), 3);
        assert!(g.sparsity(sum).is_dense());
        assert_eq!(g.sparsity(scaled).nnz(), 3);
        assert!(g.sparsity(shifted).is_dense());
        assert_eq!(g.sparsity(divided).nnz(), 3);
    }

    #[test]
    fn test_contract_errors() {
        let mut g = Graph::new();
        let a = g.sym("a", 2, 3);
        let b = g.sym("b", 2, 3);
        assert!(matches!(g.inverse(a), Err(GraphError::StructuralError(_))));
        assert!(matches!(g.mul(a, b), Err(GraphError::DimensionError { .. })));
        let c = g.sym("c", 2, 1);
        assert!(matches!(g.assertion(a, c, "m"), Err(GraphError::StructuralError(_))));
        assert!(matches!(g.norm_2(a), Err(GraphError::StructuralError(_))));
        assert!(matches!(g.reshape(a, 4, 2), Err(GraphError::DimensionError { .. })));
        let sq = g.sym("sq", 2, 2);
        assert!(matches!(g.solve(sq, a, false), Ok(_)));
        let three = g.sym("t", 3, 1);
        assert!(matches!(g.solve(sq, three, false), Err(GraphError::DimensionError { .. })));
        let dense = g.sym("d", 3, 3);
        assert!(matches!(
            g.diagsplit(dense, &[0, 1, 3], &[0, 1, 3]),
            Err(GraphError::StructuralError(_))
        ));
    }

    #[test]
    fn test_split_concat_cancel() {
        let mut g = Graph::new();
        let x = g.sym("x", 4, 2);
        let parts = g.vertsplit(x, &[0, 1, 4]).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(g.shape(parts[1]), Shape::new(3, 2));
        assert_eq!(g.vertcat(&parts).unwrap(), x);
        let swapped = g.vertcat(&[parts[1], parts[0]]).unwrap();
        assert_ne!(swapped, x);
        assert_eq!(g.horzcat(&[x]).unwrap(), x);
        let empty = g.horzcat(&[]).unwrap();
        assert_eq!(g.shape(empty), Shape::new(0, 0));
    }

    #[test]
    fn test_transpose_and_reshape_chains() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 3);
        let t = g.transpose(x).unwrap();
        assert_eq!(g.transpose(t).unwrap(), x);
        let r = g.reshape(x, 3, 2).unwrap();
        let rr = g.reshape(r, 6, 1).unwrap();
        assert_eq!(g.node_of(rr).deps[0], x);
        assert_eq!(g.reshape(x, 2, 3).unwrap(), x);
    }

    #[test]
    fn test_assertion_with_true_condition() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let one = g.scalar(1.0);
        assert_eq!(g.assertion(x, one, "never").unwrap(), x);
    }

    #[test]
    fn test_get_nonzeros_checks() {
        let mut g = Graph::new();
        let x = g.sym("x", 3, 1);
        assert!(matches!(
            g.get_nonzeros(x, &[0, 5], &Sparsity::dense(2, 1)),
            Err(GraphError::IndexOutOfRange { index: 5, .. })
        ));
        assert!(matches!(
            g.get_nonzeros(x, &[0], &Sparsity::dense(2, 1)),
            Err(GraphError::InvalidInputLength { .. })
        ));
        let y = g.get(x, &[2, 0], &[0]).unwrap();
        assert_eq!(g.node_of(y).op, Op::GetNonzeros(vec![2, 0]));
    }

    #[test]
    fn test_free_symbols_and_extract() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let _unused = g.sym("u", 1, 1);
        let y = g.sym("y", 1, 1);
        let e = g.times(x, y).unwrap();
        let e = g.sin(e).unwrap();
        assert_eq!(g.free_symbols(&[e]), vec![x, y]);
        let (h, roots) = g.extract(&[e]);
        assert_eq!(h.len(), 4);
        assert_eq!(h.free_symbols(&roots).len(), 2);
    }

    #[test]
    fn test_display() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let y = g.sym("y", 1, 1);
        let s = g.add(x, y).unwrap();
        let e = g.sin(s).unwrap();
        let n = g.neg(e).unwrap();
        assert_eq!(g.display(n).to_string(), "(-sin((x+y)))");
        let a = g.abs(x).unwrap();
        assert_eq!(g.display(a).to_string(), "abs(x)");
    }
}
