//! Forward and reverse mode derivative propagation.
//!
//! Both sweeps walk the part of the graph that the requested outputs depend on and build
//! the derivative expressions as new nodes of the same graph. A missing seed stands for a
//! structural zero; nothing is generated for branches that carry no seed.
//!
//! Forward mode pushes one tangent per direction from the inputs to the outputs in node
//! order. Reverse mode pulls adjoints back in the opposite order: a consumed seed is
//! removed from the adjoint map, and every contribution to a dependency is added to its
//! running sum, so a dependency appearing twice in the same node receives both terms.

use std::collections::HashMap;

use crate::errors::GraphError;
use crate::graph::Graph;
use crate::node::{ConcatKind, Mx, Node, NormKind, Op};
use crate::ops::{BinaryOp, UnaryOp};
use crate::sparsity::{Shape, Sparsity};

/// Directional derivatives of `outputs` with respect to the symbols `inputs`.
///
/// # Arguments
/// * `graph` - Graph holding the expressions; derivative nodes are added to it
/// * `outputs` - Expressions to differentiate
/// * `inputs` - Symbols the seeds refer to
/// * `seeds` - One entry per direction, each with one optional seed per input
///
/// # Returns
/// For every direction, one sensitivity per output with the output's pattern. Outputs
/// that no seed reaches get a structurally zero sensitivity.
///
/// # Errors
/// `StructuralError` if an input is not a symbol, `DimensionError` if a seed does not
/// match the shape of its input.
pub fn forward(
    graph: &mut Graph,
    outputs: &[Mx],
    inputs: &[Mx],
    seeds: &[Vec<Option<Mx>>],
) -> Result<Vec<Vec<Mx>>, GraphError> {
    check_symbols(graph, inputs)?;
    for direction in seeds {
        check_seeds(graph, inputs, direction, "forward")?;
    }
    let n = graph.len();
    let live = graph.reachable(outputs);
    let mut result = Vec::with_capacity(seeds.len());

    for direction in seeds {
        let mut tangent: HashMap<Mx, Mx> = inputs
            .iter()
            .zip(direction)
            .filter_map(|(&x, s)| s.map(|s| (x, s)))
            .collect();
        for id in (0..n).filter(|&id| live[id]) {
            let node = graph.node(id);
            if node.op.is_symbol() || node.op.is_constant() {
                continue;
            }
            let dep_seeds: Vec<Option<Mx>> = node.deps.iter().map(|d| tangent.get(d).copied()).collect();
            if dep_seeds.iter().all(Option::is_none) {
                continue;
            }
            let node = node.clone();
            for (k, t) in forward_rule(graph, id, &node, &dep_seeds)?.into_iter().enumerate() {
                if let Some(t) = t {
                    tangent.insert(Mx::new(id as u32, k as u32), t);
                }
            }
        }
        result.push(
            outputs
                .iter()
                .map(|&o| finish(graph, tangent.get(&o).copied(), o))
                .collect::<Result<_, _>>()?,
        );
    }
    Ok(result)
}

/// Adjoint sensitivities of the symbols `inputs` given seeds on `outputs`.
///
/// # Arguments
/// * `graph` - Graph holding the expressions; derivative nodes are added to it
/// * `outputs` - Expressions the seeds are attached to
/// * `inputs` - Symbols whose adjoints are requested
/// * `seeds` - One entry per direction, each with one optional seed per output
///
/// # Returns
/// For every direction, one adjoint per input with the input's pattern.
///
/// # Errors
/// `StructuralError` if an input is not a symbol, `DimensionError` if a seed does not
/// match the shape of its output.
pub fn reverse(
    graph: &mut Graph,
    outputs: &[Mx],
    inputs: &[Mx],
    seeds: &[Vec<Option<Mx>>],
) -> Result<Vec<Vec<Mx>>, GraphError> {
    check_symbols(graph, inputs)?;
    for direction in seeds {
        check_seeds(graph, outputs, direction, "reverse")?;
    }
    let n = graph.len();
    let live = graph.reachable(outputs);
    let mut result = Vec::with_capacity(seeds.len());

    for direction in seeds {
        let mut adjoint: HashMap<Mx, Mx> = HashMap::new();
        for (&o, s) in outputs.iter().zip(direction) {
            if let Some(s) = s {
                accumulate(graph, &mut adjoint, o, *s)?;
            }
        }
        for id in (0..n).rev().filter(|&id| live[id]) {
            let node = graph.node(id);
            if node.op.is_symbol() || node.op.is_constant() {
                continue;
            }
            let out_seeds: Vec<Option<Mx>> = (0..node.n_outputs())
                .map(|k| adjoint.remove(&Mx::new(id as u32, k as u32)))
                .collect();
            if out_seeds.iter().all(Option::is_none) {
                continue;
            }
            let node = node.clone();
            for (dep, contribution) in reverse_rule(graph, id, &node, &out_seeds)? {
                if is_variable(graph, dep) {
                    accumulate(graph, &mut adjoint, dep, contribution)?;
                }
            }
        }
        result.push(
            inputs
                .iter()
                .map(|&x| finish(graph, adjoint.get(&x).copied(), x))
                .collect::<Result<_, _>>()?,
        );
    }
    Ok(result)
}

/// Jacobian of `expr` with respect to the symbol `x`, as a `numel(expr) x numel(x)`
/// matrix. Every pair of structural nonzeros gets an entry.
///
/// # Errors
/// `StructuralError` if `x` is not a symbol.
pub fn jacobian(graph: &mut Graph, expr: Mx, x: Mx) -> Result<Mx, GraphError> {
    let xsp = graph.sparsity(x).clone();
    let fsp = graph.sparsity(expr).clone();
    if xsp.nnz() == 0 || fsp.nnz() == 0 {
        check_symbols(graph, &[x])?;
        return Ok(graph.zeros(fsp.numel(), xsp.numel()));
    }
    let seeds = xsp
        .triplets()
        .into_iter()
        .map(|(r, c)| {
            let (unit, _) = Sparsity::from_triplets(xsp.nrow(), xsp.ncol(), &[r], &[c])?;
            Ok(vec![Some(graph.filled(&unit, 1.0))])
        })
        .collect::<Result<Vec<_>, GraphError>>()?;
    let sensitivities = forward(graph, &[expr], &[x], &seeds)?;

    let column = Sparsity::dense(fsp.nnz(), 1);
    let all: Vec<usize> = (0..fsp.nnz()).collect();
    let mut columns = Vec::with_capacity(sensitivities.len());
    for t in sensitivities {
        let t = graph.project(t[0], &fsp)?;
        columns.push(graph.get_nonzeros(t, &all, &column)?);
    }
    let stacked = graph.horzcat(&columns)?;

    let (flin, xlin) = (fsp.linear_indices(), xsp.linear_indices());
    let (mut rows, mut cols) = (Vec::new(), Vec::new());
    for &c in &xlin {
        for &r in &flin {
            rows.push(r);
            cols.push(c);
        }
    }
    let (sp, mapping) = Sparsity::from_triplets(fsp.numel(), xsp.numel(), &rows, &cols)?;
    let mut indices = vec![0; sp.nnz()];
    for (k, &m) in mapping.iter().enumerate() {
        indices[m] = k;
    }
    graph.get_nonzeros(stacked, &indices, &sp)
}

fn check_symbols(graph: &Graph, inputs: &[Mx]) -> Result<(), GraphError> {
    match inputs.iter().find(|&&x| !graph.is_symbol(x)) {
        Some(&x) => Err(GraphError::structural(format!(
            "derivatives are taken with respect to symbols, got {}",
            graph.display(x)
        ))),
        None => Ok(()),
    }
}

fn check_seeds(graph: &Graph, slots: &[Mx], seeds: &[Option<Mx>], operation: &str) -> Result<(), GraphError> {
    if seeds.len() != slots.len() {
        return Err(GraphError::InvalidInputLength {
            expected: slots.len(),
            got: seeds.len(),
        });
    }
    for (&x, s) in slots.iter().zip(seeds) {
        if let Some(s) = s {
            if graph.shape(*s) != graph.shape(x) {
                return Err(GraphError::dimension(operation, graph.shape(x), graph.shape(*s)));
            }
        }
    }
    Ok(())
}

/// Projects a derivative onto the pattern of `like`, or builds a structural zero.
fn finish(graph: &mut Graph, t: Option<Mx>, like: Mx) -> Result<Mx, GraphError> {
    let sp = graph.sparsity(like).clone();
    match t {
        Some(t) => graph.project(t, &sp),
        None => Ok(graph.zeros(sp.nrow(), sp.ncol())),
    }
}

fn accumulate(graph: &mut Graph, adjoint: &mut HashMap<Mx, Mx>, dep: Mx, contribution: Mx) -> Result<(), GraphError> {
    let sum = match adjoint.get(&dep) {
        Some(&sum) => graph.add(sum, contribution)?,
        None => contribution,
    };
    adjoint.insert(dep, sum);
    Ok(())
}

fn or_zero(graph: &mut Graph, t: Option<Mx>, like: Mx) -> Mx {
    match t {
        Some(t) => t,
        None => {
            let shape = graph.shape(like);
            graph.zeros(shape.nrow, shape.ncol)
        }
    }
}

fn sum_terms(graph: &mut Graph, a: Option<Mx>, b: Option<Mx>) -> Result<Option<Mx>, GraphError> {
    Ok(match (a, b) {
        (Some(a), Some(b)) => Some(graph.add(a, b)?),
        (a, b) => a.or(b),
    })
}

/// Repeats a scalar over `shape`.
fn broadcast_to(graph: &mut Graph, t: Mx, shape: Shape) -> Result<Mx, GraphError> {
    let own = graph.shape(t);
    if own == shape {
        Ok(t)
    } else if own.is_scalar() {
        let ones = graph.ones(shape.nrow, shape.ncol);
        graph.times(t, ones)
    } else {
        Err(GraphError::dimension("broadcast", own, shape))
    }
}

/// Sums a contribution down to a scalar dependency.
fn reduce_to(graph: &mut Graph, c: Mx, shape: Shape) -> Result<Mx, GraphError> {
    let own = graph.shape(c);
    if own == shape {
        Ok(c)
    } else if shape.is_scalar() {
        graph.sum_all(c)
    } else {
        Err(GraphError::dimension("reduce", own, shape))
    }
}

/// Elementwise partial derivative of `f = op(x)`; `None` if it vanishes.
fn unary_partial(graph: &mut Graph, op: UnaryOp, x: Mx, f: Mx) -> Result<Option<Mx>, GraphError> {
    use UnaryOp::*;
    Ok(Some(match op {
        Neg => graph.scalar(-1.0),
        Sqrt => {
            let half = graph.scalar(0.5);
            graph.div(half, f)?
        }
        Sq => {
            let two = graph.scalar(2.0);
            graph.times(two, x)?
        }
        Exp => f,
        Log => graph.unary(Inv, x)?,
        Sin => graph.cos(x)?,
        Cos => {
            let s = graph.sin(x)?;
            graph.neg(s)?
        }
        Tan => {
            let one = graph.scalar(1.0);
            let f2 = graph.sq(f)?;
            graph.add(one, f2)?
        }
        Asin | Acos => {
            let one = graph.scalar(1.0);
            let x2 = graph.sq(x)?;
            let r = graph.sub(one, x2)?;
            let r = graph.sqrt(r)?;
            let r = graph.unary(Inv, r)?;
            if op == Acos {
                graph.neg(r)?
            } else {
                r
            }
        }
        Atan => {
            let one = graph.scalar(1.0);
            let x2 = graph.sq(x)?;
            let r = graph.add(one, x2)?;
            graph.unary(Inv, r)?
        }
        Sinh => graph.unary(Cosh, x)?,
        Cosh => graph.unary(Sinh, x)?,
        Tanh => {
            let one = graph.scalar(1.0);
            let f2 = graph.sq(f)?;
            graph.sub(one, f2)?
        }
        Abs => graph.sign(x)?,
        Sign | Floor | Ceil => return Ok(None),
        Inv => {
            let f2 = graph.sq(f)?;
            graph.neg(f2)?
        }
    }))
}

/// Chain rule through `f = op(x)`; identical in both modes since the Jacobian is diagonal.
fn unary_chain(graph: &mut Graph, op: UnaryOp, x: Mx, f: Mx, seed: Mx) -> Result<Option<Mx>, GraphError> {
    match op {
        UnaryOp::Neg => Ok(Some(graph.neg(seed)?)),
        UnaryOp::Log => Ok(Some(graph.div(seed, x)?)),
        _ => match unary_partial(graph, op, x, f)? {
            Some(p) => Ok(Some(graph.times(p, seed)?)),
            None => Ok(None),
        },
    }
}

enum Partial {
    Identity,
    Negated,
    /// Piecewise constant
    Zero,
    Expr(Mx),
}

impl Partial {
    fn apply(&self, graph: &mut Graph, seed: Mx) -> Result<Mx, GraphError> {
        match self {
            Partial::Identity => Ok(seed),
            Partial::Negated => graph.neg(seed),
            Partial::Zero => {
                let shape = graph.shape(seed);
                Ok(graph.zeros(shape.nrow, shape.ncol))
            }
            Partial::Expr(p) => graph.times(*p, seed),
        }
    }
}

/// Partial derivative of `f = op(x, y)` with respect to argument `side`.
fn binary_partial(graph: &mut Graph, op: BinaryOp, side: usize, x: Mx, y: Mx, f: Mx) -> Result<Partial, GraphError> {
    Ok(match (op, side) {
        (BinaryOp::Add, _) | (BinaryOp::Sub, 0) => Partial::Identity,
        (BinaryOp::Sub, _) => Partial::Negated,
        (BinaryOp::Mul, 0) => Partial::Expr(y),
        (BinaryOp::Mul, _) => Partial::Expr(x),
        (BinaryOp::Div, 0) => Partial::Expr(graph.unary(UnaryOp::Inv, y)?),
        (BinaryOp::Div, _) => {
            let q = graph.div(f, y)?;
            Partial::Expr(graph.neg(q)?)
        }
        (BinaryOp::Pow, 0) => {
            let one = graph.scalar(1.0);
            let e = graph.sub(y, one)?;
            let p = graph.pow(x, e)?;
            Partial::Expr(graph.times(y, p)?)
        }
        (BinaryOp::Pow, _) => {
            let l = graph.log(x)?;
            Partial::Expr(graph.times(f, l)?)
        }
        (BinaryOp::Atan2, _) => {
            let x2 = graph.sq(x)?;
            let y2 = graph.sq(y)?;
            let r = graph.add(x2, y2)?;
            let numerator = if side == 0 { y } else { graph.neg(x)? };
            Partial::Expr(graph.div(numerator, r)?)
        }
        // Ties go to the first argument.
        (BinaryOp::Fmax, 0) => Partial::Expr(graph.equal(f, x)?),
        (BinaryOp::Fmax, _) => {
            let first = graph.equal(f, x)?;
            let one = graph.scalar(1.0);
            Partial::Expr(graph.sub(one, first)?)
        }
        (BinaryOp::Eq, _) => Partial::Zero,
    })
}

fn forward_rule(graph: &mut Graph, id: usize, node: &Node, t: &[Option<Mx>]) -> Result<Vec<Option<Mx>>, GraphError> {
    let f = Mx::new(id as u32, 0);
    let d = &node.deps;
    let fsp = node.sparsity[0].clone();
    let tangent = match &node.op {
        Op::Symbol { .. } | Op::Constant(_) => None,
        Op::Unary(op) => match t[0] {
            Some(tx) => unary_chain(graph, *op, d[0], f, tx)?,
            None => None,
        },
        Op::Binary(op) => {
            let mut total = None;
            for side in 0..2 {
                if let Some(ts) = t[side] {
                    let term = binary_partial(graph, *op, side, d[0], d[1], f)?.apply(graph, ts)?;
                    let term = broadcast_to(graph, term, fsp.shape())?;
                    total = sum_terms(graph, total, Some(term))?;
                }
            }
            total
        }
        Op::MulAdd => {
            let mut acc = match t[0] {
                Some(tz) => graph.project(tz, &fsp)?,
                None => graph.filled(&fsp, 0.0),
            };
            if let Some(tx) = t[1] {
                acc = graph.mul_add(acc, tx, d[2])?;
            }
            if let Some(ty) = t[2] {
                acc = graph.mul_add(acc, d[1], ty)?;
            }
            Some(acc)
        }
        Op::Transpose => {
            let tx = or_zero(graph, t[0], d[0]);
            Some(graph.transpose(tx)?)
        }
        Op::Reshape => {
            let tx = or_zero(graph, t[0], d[0]);
            Some(graph.reshape(tx, fsp.nrow(), fsp.ncol())?)
        }
        Op::Project => {
            let tx = or_zero(graph, t[0], d[0]);
            Some(graph.project(tx, &fsp)?)
        }
        Op::Concat(kind) => {
            let parts: Vec<Mx> = d.iter().zip(t).map(|(&dep, &s)| or_zero(graph, s, dep)).collect();
            Some(graph.concat(*kind, &parts)?)
        }
        Op::Split(kind) => {
            let xsp = graph.sparsity(d[0]).clone();
            let tx = or_zero(graph, t[0], d[0]);
            let tx = graph.project(tx, &xsp)?;
            return Ok(graph.split(kind.clone(), tx)?.into_iter().map(Some).collect());
        }
        Op::GetNonzeros(indices) => {
            let xsp = graph.sparsity(d[0]).clone();
            let tx = or_zero(graph, t[0], d[0]);
            let tx = graph.project(tx, &xsp)?;
            Some(graph.get_nonzeros(tx, indices, &fsp)?)
        }
        Op::AddNonzeros(indices) => {
            let mut acc = match t[0] {
                Some(ty) => graph.project(ty, &fsp)?,
                None => graph.filled(&fsp, 0.0),
            };
            if let Some(tx) = t[1] {
                let xsp = graph.sparsity(d[1]).clone();
                let tx = graph.project(tx, &xsp)?;
                acc = graph.add_nonzeros(acc, tx, indices)?;
            }
            Some(acc)
        }
        Op::SetNonzeros(indices) => {
            let ty = match t[0] {
                Some(ty) => graph.project(ty, &fsp)?,
                None => graph.filled(&fsp, 0.0),
            };
            let xsp = graph.sparsity(d[1]).clone();
            let tx = or_zero(graph, t[1], d[1]);
            let tx = graph.project(tx, &xsp)?;
            Some(graph.set_nonzeros(ty, tx, indices)?)
        }
        Op::Inverse => {
            let tx = or_zero(graph, t[0], d[0]);
            let a = graph.mul(f, tx)?;
            let a = graph.mul(a, f)?;
            Some(graph.neg(a)?)
        }
        Op::Solve { transpose } => {
            let rhs = match t[0] {
                Some(ta) => {
                    let ta = if *transpose { graph.transpose(ta)? } else { ta };
                    let m = graph.mul(ta, f)?;
                    match t[1] {
                        Some(tb) => graph.sub(tb, m)?,
                        None => graph.neg(m)?,
                    }
                }
                None => or_zero(graph, t[1], d[1]),
            };
            Some(graph.solve(d[0], rhs, *transpose)?)
        }
        Op::InnerProd => {
            let a = match t[0] {
                Some(tx) => Some(graph.inner_prod(tx, d[1])?),
                None => None,
            };
            let b = match t[1] {
                Some(ty) => Some(graph.inner_prod(d[0], ty)?),
                None => None,
            };
            sum_terms(graph, a, b)?
        }
        Op::Norm(kind) => {
            let tx = or_zero(graph, t[0], d[0]);
            Some(match kind {
                NormKind::Frobenius | NormKind::Two => {
                    let ip = graph.inner_prod(d[0], tx)?;
                    graph.div(ip, f)?
                }
                NormKind::One => {
                    let s = graph.sign(d[0])?;
                    graph.inner_prod(s, tx)?
                }
                NormKind::Inf => {
                    let w = norm_inf_weights(graph, d[0], f)?;
                    graph.inner_prod(w, tx)?
                }
            })
        }
        Op::Assertion { .. } => t[0],
    };
    Ok(vec![tangent])
}

fn reverse_rule(
    graph: &mut Graph,
    id: usize,
    node: &Node,
    seeds: &[Option<Mx>],
) -> Result<Vec<(Mx, Mx)>, GraphError> {
    let f = Mx::new(id as u32, 0);
    let d = &node.deps;

    if let Op::Split(kind) = &node.op {
        let parts = seeds
            .iter()
            .enumerate()
            .map(|(k, &s)| {
                let s = or_zero(graph, s, Mx::new(id as u32, k as u32));
                graph.project(s, &node.sparsity[k])
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(vec![(d[0], graph.concat(kind.inverse(), &parts)?)]);
    }
    let Some(s) = seeds[0] else {
        return Ok(Vec::new());
    };
    let fsp = node.sparsity[0].clone();
    // Entries outside the result pattern are structural zeros and carry no adjoint.
    let s = graph.project(s, &fsp)?;

    let mut out = Vec::new();
    match &node.op {
        Op::Symbol { .. } | Op::Constant(_) | Op::Split(_) => {}
        Op::Unary(op) => {
            if let Some(c) = unary_chain(graph, *op, d[0], f, s)? {
                out.push((d[0], c));
            }
        }
        Op::Binary(op) => {
            for side in 0..2 {
                if is_variable(graph, d[side]) {
                    let c = binary_partial(graph, *op, side, d[0], d[1], f)?.apply(graph, s)?;
                    let shape = graph.shape(d[side]);
                    out.push((d[side], reduce_to(graph, c, shape)?));
                }
            }
        }
        Op::MulAdd => {
            let (z0, x, y) = (d[0], d[1], d[2]);
            out.push((z0, s));
            if is_variable(graph, x) {
                let xsp = graph.sparsity(x).clone();
                let acc = graph.filled(&xsp, 0.0);
                let yt = graph.transpose(y)?;
                out.push((x, graph.mul_add(acc, s, yt)?));
            }
            if is_variable(graph, y) {
                let ysp = graph.sparsity(y).clone();
                let acc = graph.filled(&ysp, 0.0);
                let xt = graph.transpose(x)?;
                out.push((y, graph.mul_add(acc, xt, s)?));
            }
        }
        Op::Transpose => out.push((d[0], graph.transpose(s)?)),
        Op::Reshape => {
            let shape = graph.shape(d[0]);
            out.push((d[0], graph.reshape(s, shape.nrow, shape.ncol)?));
        }
        Op::Project => {
            let xsp = graph.sparsity(d[0]).clone();
            out.push((d[0], graph.project(s, &xsp)?));
        }
        Op::Concat(kind) => {
            let shapes: Vec<Shape> = d.iter().map(|&dep| graph.shape(dep)).collect();
            let parts = match kind {
                ConcatKind::Horz => graph.horzsplit(s, &offsets(shapes.iter().map(|s| s.ncol)))?,
                ConcatKind::Vert => graph.vertsplit(s, &offsets(shapes.iter().map(|s| s.nrow)))?,
                ConcatKind::Diag => {
                    let rows = offsets(shapes.iter().map(|s| s.nrow));
                    let cols = offsets(shapes.iter().map(|s| s.ncol));
                    graph.diagsplit(s, &rows, &cols)?
                }
            };
            out.extend(d.iter().copied().zip(parts));
        }
        Op::GetNonzeros(indices) => {
            let xsp = graph.sparsity(d[0]).clone();
            let acc = graph.filled(&xsp, 0.0);
            out.push((d[0], graph.add_nonzeros(acc, s, indices)?));
        }
        Op::AddNonzeros(indices) => {
            out.push((d[0], s));
            if is_variable(graph, d[1]) {
                let xsp = graph.sparsity(d[1]).clone();
                out.push((d[1], graph.get_nonzeros(s, indices, &xsp)?));
            }
        }
        Op::SetNonzeros(indices) => {
            // Overwritten entries of the first argument never reach the result.
            let cleared = graph.filled(&Sparsity::dense(indices.len(), 1), 0.0);
            out.push((d[0], graph.set_nonzeros(s, cleared, indices)?));
            if is_variable(graph, d[1]) {
                let xsp = graph.sparsity(d[1]).clone();
                out.push((d[1], graph.get_nonzeros(s, indices, &xsp)?));
            }
        }
        Op::Inverse => {
            let yt = graph.transpose(f)?;
            let a = graph.mul(yt, s)?;
            let a = graph.mul(a, yt)?;
            out.push((d[0], graph.neg(a)?));
        }
        Op::Solve { transpose } => {
            let (a, b) = (d[0], d[1]);
            let bc = graph.solve(a, s, !transpose)?;
            out.push((b, bc));
            if is_variable(graph, a) {
                let product = if *transpose {
                    let bct = graph.transpose(bc)?;
                    graph.mul(f, bct)?
                } else {
                    let ft = graph.transpose(f)?;
                    graph.mul(bc, ft)?
                };
                out.push((a, graph.neg(product)?));
            }
        }
        Op::InnerProd => {
            for (this, other) in [(d[0], d[1]), (d[1], d[0])] {
                if is_variable(graph, this) {
                    out.push((this, graph.times(s, other)?));
                }
            }
        }
        Op::Norm(kind) => {
            let c = match kind {
                NormKind::Frobenius | NormKind::Two => {
                    let q = graph.div(s, f)?;
                    graph.times(q, d[0])?
                }
                NormKind::One => {
                    let sg = graph.sign(d[0])?;
                    graph.times(s, sg)?
                }
                NormKind::Inf => {
                    let w = norm_inf_weights(graph, d[0], f)?;
                    graph.times(s, w)?
                }
            };
            out.push((d[0], c));
        }
        Op::Assertion { .. } => out.push((d[0], s)),
    }
    Ok(out)
}

/// Subgradient of `f = max |x|`: `sign(x)` on the nonzeros attaining the maximum,
/// averaged over ties, zero elsewhere.
fn norm_inf_weights(graph: &mut Graph, x: Mx, f: Mx) -> Result<Mx, GraphError> {
    let xsp = graph.sparsity(x).clone();
    let a = graph.abs(x)?;
    let hits = graph.equal(a, f)?;
    let hits = graph.project(hits, &xsp)?;
    let count = graph.sum_all(hits)?;
    let sg = graph.sign(x)?;
    let w = graph.times(sg, hits)?;
    graph.div(w, count)
}

fn is_variable(graph: &Graph, x: Mx) -> bool {
    !graph.node_of(x).op.is_constant()
}

fn offsets(sizes: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut offsets = vec![0];
    for size in sizes {
        offsets.push(offsets[offsets.len() - 1] + size);
    }
    offsets
}
