//! Graph nodes and the operation-kind catalogue.
//!
//! A [`Node`] is one operation in an expression graph: an [`Op`] tag with its
//! parameters, the handles of its dependencies, and one sparsity pattern per output.
//! Nodes are immutable once pushed into a [`crate::graph::Graph`].

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::matrix::Matrix;
use crate::ops::{BinaryOp, UnaryOp};
use crate::sparsity::{Shape, Sparsity};

/// Handle to one output of a node in a graph.
///
/// Handles are plain indices: they are only meaningful together with the graph that
/// created them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mx {
    pub(crate) node: u32,
    pub(crate) output: u32,
}

impl Mx {
    pub(crate) fn new(node: u32, output: u32) -> Self {
        Mx { node, output }
    }

    /// Index of the node inside its graph.
    pub fn node_id(&self) -> usize {
        self.node as usize
    }

    /// Output index on multi-output nodes, zero otherwise.
    pub fn output_index(&self) -> usize {
        self.output as usize
    }
}

/// Direction of a concatenation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConcatKind {
    Horz,
    Vert,
    Diag,
}

/// Offsets of a split. Each output covers the range between two consecutive offsets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SplitKind {
    Horz(Vec<usize>),
    Vert(Vec<usize>),
    Diag { rows: Vec<usize>, cols: Vec<usize> },
}

impl SplitKind {
    /// The concatenation that undoes this split.
    pub fn inverse(&self) -> ConcatKind {
        match self {
            SplitKind::Horz(_) => ConcatKind::Horz,
            SplitKind::Vert(_) => ConcatKind::Vert,
            SplitKind::Diag { .. } => ConcatKind::Diag,
        }
    }

    pub fn n_outputs(&self) -> usize {
        match self {
            SplitKind::Horz(offsets) | SplitKind::Vert(offsets) => offsets.len().saturating_sub(1),
            SplitKind::Diag { rows, .. } => rows.len().saturating_sub(1),
        }
    }

    /// Splits `sp` the way this kind prescribes.
    pub fn apply(&self, sp: &Sparsity) -> Result<Vec<Sparsity>, crate::errors::GraphError> {
        match self {
            SplitKind::Horz(offsets) => sp.horzsplit(offsets),
            SplitKind::Vert(offsets) => sp.vertsplit(offsets),
            SplitKind::Diag { rows, cols } => sp.diagsplit(rows, cols),
        }
    }
}

/// Matrix norms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NormKind {
    Frobenius,
    /// Sum of absolute values of all entries
    One,
    /// Euclidean norm of a vector
    Two,
    /// Largest absolute value of all entries
    Inf,
}

/// Operation performed by a node.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Free variable; the name is only used for display
    Symbol { name: String },
    Constant(Matrix<f64>),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// `z0 + x * y` with dependencies `[z0, x, y]`
    MulAdd,
    Transpose,
    Reshape,
    /// Re-patterns the dependency onto the node's sparsity
    Project,
    Concat(ConcatKind),
    Split(SplitKind),
    /// Gathers dependency nonzeros by index
    GetNonzeros(Vec<usize>),
    /// Scatter-adds the nonzeros of the second dependency into the first
    AddNonzeros(Vec<usize>),
    /// Overwrites nonzeros of the first dependency with those of the second
    SetNonzeros(Vec<usize>),
    Inverse,
    /// `A^-1 b` (or `A^-T b`) with dependencies `[A, b]`
    Solve { transpose: bool },
    InnerProd,
    Norm(NormKind),
    /// Passes its first dependency through if the scalar second dependency equals one
    Assertion { message: String },
}

impl Op {
    pub fn is_symbol(&self) -> bool {
        matches!(self, Op::Symbol { .. })
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Op::Constant(_))
    }

    /// Short operation name used in diagnostics and generated code comments.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Symbol { .. } => "symbol",
            Op::Constant(_) => "constant",
            Op::Unary(op) => op.name(),
            Op::Binary(op) => op.name(),
            Op::MulAdd => "mul_add",
            Op::Transpose => "transpose",
            Op::Reshape => "reshape",
            Op::Project => "project",
            Op::Concat(ConcatKind::Horz) => "horzcat",
            Op::Concat(ConcatKind::Vert) => "vertcat",
            Op::Concat(ConcatKind::Diag) => "diagcat",
            Op::Split(SplitKind::Horz(_)) => "horzsplit",
            Op::Split(SplitKind::Vert(_)) => "vertsplit",
            Op::Split(SplitKind::Diag { .. }) => "diagsplit",
            Op::GetNonzeros(_) => "get_nonzeros",
            Op::AddNonzeros(_) => "add_nonzeros",
            Op::SetNonzeros(_) => "set_nonzeros",
            Op::Inverse => "inv",
            Op::Solve { .. } => "solve",
            Op::InnerProd => "dot",
            Op::Norm(NormKind::Frobenius) => "norm_fro",
            Op::Norm(NormKind::One) => "norm_1",
            Op::Norm(NormKind::Two) => "norm_2",
            Op::Norm(NormKind::Inf) => "norm_inf",
            Op::Assertion { .. } => "assertion",
        }
    }
}

impl Hash for Op {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Op::Symbol { name } => name.hash(state),
            Op::Constant(value) => {
                value.sparsity().hash(state);
                for v in value.nonzeros() {
                    // -0.0 == 0.0, so both must land in the same bucket
                    let v = if *v == 0.0 { 0.0f64 } else { *v };
                    v.to_bits().hash(state);
                }
            }
            Op::Unary(op) => op.hash(state),
            Op::Binary(op) => op.hash(state),
            Op::Concat(kind) => kind.hash(state),
            Op::Split(kind) => kind.hash(state),
            Op::GetNonzeros(indices) | Op::AddNonzeros(indices) | Op::SetNonzeros(indices) => indices.hash(state),
            Op::Solve { transpose } => transpose.hash(state),
            Op::Norm(kind) => kind.hash(state),
            Op::Assertion { message } => message.hash(state),
            Op::MulAdd | Op::Transpose | Op::Reshape | Op::Project | Op::Inverse | Op::InnerProd => {}
        }
    }
}

/// One operation in an expression graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub op: Op,
    pub deps: Vec<Mx>,
    /// Pattern of every output
    pub sparsity: Vec<Sparsity>,
}

impl Node {
    pub fn n_outputs(&self) -> usize {
        self.sparsity.len()
    }

    pub fn shape(&self, output: usize) -> Shape {
        self.sparsity[output].shape()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Op::Symbol { name } => write!(f, "{name}")?,
            op => {
                write!(f, "{}(", op.name())?;
                for (i, dep) in self.deps.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "@{}", dep.node)?;
                    if dep.output > 0 {
                        write!(f, ".{}", dep.output)?;
                    }
                }
                write!(f, ")")?;
            }
        }
        let shapes: Vec<String> = self.sparsity.iter().map(|sp| sp.to_string()).collect();
        write!(f, " : {}", shapes.join(" | "))
    }
}
