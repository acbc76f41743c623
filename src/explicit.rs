//! Block-wise explicit solving of algebraic systems.
//!
//! A system `eqs(unknowns) = 0` of scalar residuals is ordered with the
//! Dulmage-Mendelsohn decomposition of its incidence pattern. Blocks are then visited in
//! solve order: the unknowns found so far are substituted into the block, and a block
//! whose Jacobian does not depend on its own unknowns is linear and solved in closed
//! form, with an explicit inverse for blocks of up to three unknowns and a linear solve
//! above that.

use crate::decompose::DmDecomposition;
use crate::derivative;
use crate::errors::GraphError;
use crate::eval::{Algorithm, Bits};
use crate::graph::Graph;
use crate::matrix::{BitWord, Matrix};
use crate::node::Mx;
use crate::sparsity::Sparsity;

/// Blocks up to this size are solved with an explicit inverse.
const MAX_INVERSE_SIZE: usize = 3;

/// Equations and unknowns of one block, as indices into the original lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub equations: Vec<usize>,
    pub unknowns: Vec<usize>,
}

impl Block {
    pub fn is_square(&self) -> bool {
        self.equations.len() == self.unknowns.len()
    }
}

/// A system in block lower-triangular order.
#[derive(Debug, Clone)]
pub struct SortedEquations {
    /// Which equations touch which unknowns
    pub incidence: Sparsity,
    pub decomposition: DmDecomposition,
    pub blocks: Vec<Block>,
}

/// A block that stays implicit after elimination.
#[derive(Debug, Clone)]
pub struct ImplicitBlock {
    /// Position of the block in solve order
    pub index: usize,
    pub block: Block,
    /// Residuals with the explicit unknowns of earlier blocks substituted
    pub residuals: Vec<Mx>,
}

/// Result of [`eliminate_algebraic`].
#[derive(Debug, Clone, Default)]
pub struct Elimination {
    /// `(unknown index, expression)` in solve order
    pub explicit: Vec<(usize, Mx)>,
    pub implicit: Vec<ImplicitBlock>,
}

impl Elimination {
    /// Explicit expression found for unknown `k`, if any.
    pub fn solution(&self, k: usize) -> Option<Mx> {
        self.explicit.iter().find(|(u, _)| *u == k).map(|&(_, e)| e)
    }

    pub fn is_fully_explicit(&self) -> bool {
        self.implicit.is_empty()
    }
}

fn check_system(graph: &Graph, eqs: &[Mx], unknowns: &[Mx]) -> Result<(), GraphError> {
    for &e in eqs {
        if !graph.shape(e).is_scalar() {
            return Err(GraphError::structural(format!(
                "equations must be scalar residuals, got {}",
                graph.shape(e)
            )));
        }
    }
    for &u in unknowns {
        if !graph.is_symbol(u) || !graph.shape(u).is_scalar() {
            return Err(GraphError::structural(format!(
                "unknowns must be scalar symbols, got {}",
                graph.display(u)
            )));
        }
    }
    Ok(())
}

/// Pattern with entry `(i, j)` when equation `i` structurally depends on unknown `j`.
fn incidence(graph: &Graph, eqs: &[Mx], unknowns: &[Mx]) -> Result<Sparsity, GraphError> {
    let mut inputs = graph.free_symbols(eqs);
    for &u in unknowns {
        if !inputs.contains(&u) {
            inputs.push(u);
        }
    }
    let alg = Algorithm::new(graph, &inputs, eqs)?;
    let (mut rows, mut cols) = (Vec::new(), Vec::new());
    for base in (0..unknowns.len()).step_by(64) {
        let values = inputs
            .iter()
            .zip(alg.input_sparsity())
            .map(|(s, sp)| {
                let bit = match unknowns.iter().position(|u| u == s) {
                    Some(j) if (base..base + 64).contains(&j) => BitWord::bit(j - base),
                    _ => BitWord::ZERO,
                };
                Matrix::new(sp.clone(), vec![bit; sp.nnz()])
            })
            .collect::<Result<Vec<_>, _>>()?;
        for (i, out) in alg.run(&mut Bits::new(), &values)?.iter().enumerate() {
            let word = out.nonzeros().iter().fold(BitWord::ZERO, |acc, &w| acc | w);
            for b in (0..64).filter(|&b| word.is_set(b)) {
                rows.push(i);
                cols.push(base + b);
            }
        }
    }
    Ok(Sparsity::from_triplets(eqs.len(), unknowns.len(), &rows, &cols)?.0)
}

/// Orders a system of scalar residuals into blocks that can be solved one after another.
///
/// # Arguments
/// * `graph` - Graph holding the residuals
/// * `eqs` - Scalar residual expressions
/// * `unknowns` - Scalar symbols to solve for
///
/// # Returns
/// The incidence pattern, its decomposition and the blocks in solve order.
///
/// # Errors
/// `StructuralError` if a residual is not scalar or an unknown is not a scalar symbol.
pub fn sort_equations(graph: &Graph, eqs: &[Mx], unknowns: &[Mx]) -> Result<SortedEquations, GraphError> {
    check_system(graph, eqs, unknowns)?;
    let incidence = incidence(graph, eqs, unknowns)?;
    let decomposition = incidence.dulmage_mendelsohn();
    let blocks = (0..decomposition.nblocks())
        .map(|b| Block {
            equations: decomposition.block_rows(b).to_vec(),
            unknowns: decomposition.block_cols(b).to_vec(),
        })
        .collect();
    Ok(SortedEquations {
        incidence,
        decomposition,
        blocks,
    })
}

/// Solves every linear square block explicitly and keeps the others implicit.
///
/// # Arguments
/// * `graph` - Graph holding the residuals; solutions are built in it
/// * `eqs` - Scalar residual expressions
/// * `unknowns` - Scalar symbols to solve for
///
/// # Returns
/// The explicit solutions in solve order and the blocks left implicit. Solutions of
/// later blocks may refer to unknowns of implicit blocks, never to explicit ones.
///
/// # Errors
/// `StructuralError` if a residual is not scalar or an unknown is not a scalar symbol.
pub fn eliminate_algebraic(graph: &mut Graph, eqs: &[Mx], unknowns: &[Mx]) -> Result<Elimination, GraphError> {
    let sorted = sort_equations(graph, eqs, unknowns)?;
    let mut elimination = Elimination::default();
    let mut known: Vec<Mx> = Vec::new();
    let mut values: Vec<Mx> = Vec::new();

    for (index, block) in sorted.blocks.into_iter().enumerate() {
        let residuals: Vec<Mx> = block.equations.iter().map(|&i| eqs[i]).collect();
        let residuals = graph.substitute(&residuals, &known, &values)?;
        let block_unknowns: Vec<Mx> = block.unknowns.iter().map(|&j| unknowns[j]).collect();

        match solve_linear_block(graph, &residuals, &block_unknowns)? {
            Some(solution) if block.is_square() => {
                for (&j, value) in block.unknowns.iter().zip(solution) {
                    elimination.explicit.push((j, value));
                    known.push(unknowns[j]);
                    values.push(value);
                }
            }
            _ => elimination.implicit.push(ImplicitBlock {
                index,
                block,
                residuals,
            }),
        }
    }
    Ok(elimination)
}

/// Solves `r(u) = 0` if `r` is affine in `u` and the block is square.
fn solve_linear_block(graph: &mut Graph, residuals: &[Mx], unknowns: &[Mx]) -> Result<Option<Vec<Mx>>, GraphError> {
    let n = unknowns.len();
    if n == 0 || residuals.len() != n {
        return Ok(None);
    }
    let r = graph.vertcat(residuals)?;
    let columns = unknowns
        .iter()
        .map(|&u| derivative::jacobian(graph, r, u))
        .collect::<Result<Vec<_>, _>>()?;
    let a = graph.horzcat(&columns)?;
    if graph.depends_on(a, unknowns)? {
        return Ok(None);
    }
    let zeros: Vec<Mx> = (0..n).map(|_| graph.scalar(0.0)).collect();
    let r0 = graph.substitute(&[r], unknowns, &zeros)?[0];
    let u = if n <= MAX_INVERSE_SIZE {
        let inv = graph.inverse(a)?;
        graph.mul(inv, r0)?
    } else {
        graph.solve(a, r0, false)?
    };
    let u = graph.neg(u)?;
    let offsets: Vec<usize> = (0..=n).collect();
    Ok(Some(graph.vertsplit(u, &offsets)?))
}

/// Solves every block of the system explicitly.
///
/// # Returns
/// One expression per unknown, in the order of `unknowns`.
///
/// # Errors
/// `UnsolvableBlockError` naming the first block that is nonlinear in its own unknowns
/// or not square.
pub fn make_explicit(graph: &mut Graph, eqs: &[Mx], unknowns: &[Mx]) -> Result<Vec<Mx>, GraphError> {
    let elimination = eliminate_algebraic(graph, eqs, unknowns)?;
    if let Some(first) = elimination.implicit.first() {
        let variables = first
            .block
            .unknowns
            .iter()
            .map(|&j| graph.display(unknowns[j]).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(GraphError::UnsolvableBlockError {
            block: first.index,
            variables,
        });
    }
    (0..unknowns.len())
        .map(|k| {
            elimination.solution(k).ok_or_else(|| {
                GraphError::structural(format!("unknown {} is not determined by the system", graph.display(unknowns[k])))
            })
        })
        .collect()
}
