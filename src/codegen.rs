//! Flat code generation.
//!
//! [`GeneratedCode::generate`] lowers an [`Algorithm`] to a straight-line list of scalar
//! [`Instruction`]s reading and writing a single `w` array. Every work cell of the
//! algorithm owns a fixed region of `w`, so the liveness-based cell reuse of the
//! evaluator carries over unchanged. The generator never rewrites expressions: whatever
//! simplification happened, happened while the graph was built.
//!
//! The same program is rendered as C by [`GeneratedCode::to_c`], executed directly by
//! [`GeneratedCode::execute`], and compiled to native code by [`crate::builder`].

use std::fmt;

use colored::Colorize;
use itertools::Itertools;

use crate::errors::GraphError;
use crate::eval::{AlgEl, Algorithm};
use crate::matrix::{concat_sources, dense_solve_f64, split_sources, Matrix};
use crate::node::{NormKind, Op};
use crate::ops::{BinaryOp, UnaryOp};
use crate::sparsity::Sparsity;

/// `w` slot that always holds zero.
pub const ZERO_SLOT: usize = 0;
/// `w` slot for intermediate scalars.
pub const TEMP_SLOT: usize = 1;
const RESERVED: usize = 2;

/// One scalar statement of a generated program. Operands are `w` offsets.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// `w[dst] = value`
    Const { dst: usize, value: f64 },
    /// `w[dst] = arg[arg][nz]`, zero if the input is absent
    Input { dst: usize, arg: usize, nz: usize },
    /// `res[res][nz] = w[src]`, skipped if the output is absent
    Output { res: usize, nz: usize, src: usize },
    /// `w[dst] = w[src]`
    Copy { dst: usize, src: usize },
    Unary { op: UnaryOp, dst: usize, x: usize },
    Binary { op: BinaryOp, dst: usize, x: usize, y: usize },
    /// `w[dst] += w[x] * w[y]`
    MulAcc { dst: usize, x: usize, y: usize },
    /// Overwrites the dense `n x m` block at `w[b]` with `A^-1 b` (or `A^-T b`), the
    /// dense `n x n` matrix `A` at `w[a]` is destroyed
    DenseSolve {
        a: usize,
        b: usize,
        n: usize,
        m: usize,
        transpose: bool,
    },
    /// Stops with status `id + 1` unless `w[cond] == 1`
    Assert { cond: usize, id: usize },
}

/// A lowered program together with its calling convention.
#[derive(Clone, Debug)]
pub struct GeneratedCode {
    instructions: Vec<Instruction>,
    n_w: usize,
    inputs: Vec<Sparsity>,
    outputs: Vec<Sparsity>,
    messages: Vec<String>,
}

/// Where a value comes from when it may be a structural zero.
fn slot(base: usize, nz: Option<usize>) -> usize {
    nz.map_or(ZERO_SLOT, |k| base + k)
}

/// For every nonzero of `out`, the nonzero of `x` it reads, broadcasting scalars.
fn spread_sources(x: &Sparsity, out: &Sparsity) -> Result<Vec<Option<usize>>, GraphError> {
    if x.is_scalar() && !out.is_scalar() {
        let source = (x.nnz() > 0).then_some(0);
        return Ok(vec![source; out.nnz()]);
    }
    x.nz_map(out)
}

struct Lowering {
    code: Vec<Instruction>,
    /// `w` offset of every work cell
    base: Vec<usize>,
    /// First `w` entry past the work cells, start of the scratch region
    scratch: usize,
    scratch_len: usize,
    messages: Vec<String>,
}

impl Lowering {
    fn emit(&mut self, instruction: Instruction) {
        self.code.push(instruction);
    }

    fn use_scratch(&mut self, len: usize) -> usize {
        self.scratch_len = self.scratch_len.max(len);
        self.scratch
    }

    /// Copies `nnz` entries at `src` into scratch, starting at `offset`.
    fn to_scratch(&mut self, src: usize, nnz: usize, offset: usize) -> usize {
        let dst = self.use_scratch(offset + nnz) + offset;
        for k in 0..nnz {
            self.emit(Instruction::Copy { dst: dst + k, src: src + k });
        }
        dst
    }

    /// Writes the dense column-major form of a matrix at `w[dst..]`.
    fn densify(&mut self, src: usize, sp: &Sparsity, dst: usize) {
        for k in 0..sp.numel() {
            self.emit(Instruction::Const { dst: dst + k, value: 0.0 });
        }
        for (k, lin) in sp.linear_indices().into_iter().enumerate() {
            self.emit(Instruction::Copy { dst: dst + lin, src: src + k });
        }
    }

    fn lower(&mut self, el: &AlgEl) -> Result<(), GraphError> {
        let res: Vec<Option<usize>> = el.res.iter().map(|r| r.map(|c| self.base[c])).collect();
        let mut args: Vec<usize> = el.args.iter().map(|&c| self.base[c]).collect();
        let asp = &el.arg_sparsity;
        let rsp = &el.res_sparsity;

        if let Some(slot) = el.input {
            if let Some(dst) = res[0] {
                for nz in 0..rsp[0].nnz() {
                    self.emit(Instruction::Input { dst: dst + nz, arg: slot, nz });
                }
            }
            return Ok(());
        }
        let Some(out) = res.iter().copied().flatten().next() else {
            return Ok(());
        };
        let out_sp = &rsp[0];

        match &el.op {
            Op::Symbol { name } => {
                return Err(GraphError::structural(format!("symbol '{name}' has no input slot")));
            }
            Op::Constant(value) => {
                for (k, &v) in value.nonzeros().iter().enumerate() {
                    self.emit(Instruction::Const { dst: out + k, value: v });
                }
            }
            Op::Unary(op) => {
                for (k, src) in spread_sources(&asp[0], out_sp)?.into_iter().enumerate() {
                    let x = slot(args[0], src);
                    self.emit(Instruction::Unary { op: *op, dst: out + k, x });
                }
            }
            Op::Binary(op) => {
                let lhs = spread_sources(&asp[0], out_sp)?;
                let rhs = spread_sources(&asp[1], out_sp)?;
                for (k, (a, b)) in lhs.into_iter().zip(rhs).enumerate() {
                    let (x, y) = (slot(args[0], a), slot(args[1], b));
                    self.emit(Instruction::Binary { op: *op, dst: out + k, x, y });
                }
            }
            Op::MulAdd => {
                // An in-place accumulator may share its cell with a factor.
                for i in 1..3 {
                    if args[i] == out {
                        args[i] = self.to_scratch(args[i], asp[i].nnz(), (i - 1) * asp[1].nnz());
                    }
                }
                if args[0] != out {
                    for k in 0..out_sp.nnz() {
                        self.emit(Instruction::Copy { dst: out + k, src: args[0] + k });
                    }
                }
                self.lower_products(out, out_sp, (args[1], &asp[1]), (args[2], &asp[2]));
            }
            Op::Transpose => {
                let (_, mapping) = asp[0].transpose_with_mapping();
                for (k, src) in mapping.into_iter().enumerate() {
                    self.emit(Instruction::Copy { dst: out + k, src: args[0] + src });
                }
            }
            Op::Reshape => {
                for k in 0..out_sp.nnz() {
                    self.emit(Instruction::Copy { dst: out + k, src: args[0] + k });
                }
            }
            Op::Project => {
                for (k, src) in asp[0].nz_map(out_sp)?.into_iter().enumerate() {
                    self.emit(Instruction::Copy { dst: out + k, src: slot(args[0], src) });
                }
            }
            Op::Concat(kind) => {
                for (k, (part, nz)) in concat_sources(*kind, asp).into_iter().enumerate() {
                    self.emit(Instruction::Copy { dst: out + k, src: args[part] + nz });
                }
            }
            Op::Split(kind) => {
                for (dst, sources) in res.iter().zip(split_sources(kind, &asp[0])) {
                    let Some(dst) = dst else { continue };
                    for (k, src) in sources.into_iter().enumerate() {
                        self.emit(Instruction::Copy { dst: dst + k, src: args[0] + src });
                    }
                }
            }
            Op::GetNonzeros(indices) => {
                for (k, &src) in indices.iter().enumerate() {
                    self.emit(Instruction::Copy { dst: out + k, src: args[0] + src });
                }
            }
            Op::AddNonzeros(indices) | Op::SetNonzeros(indices) => {
                if args[1] == out {
                    args[1] = self.to_scratch(args[1], asp[1].nnz(), 0);
                }
                if args[0] != out {
                    for k in 0..out_sp.nnz() {
                        self.emit(Instruction::Copy { dst: out + k, src: args[0] + k });
                    }
                }
                let add = matches!(el.op, Op::AddNonzeros(_));
                for (k, &target) in indices.iter().enumerate() {
                    let (dst, src) = (out + target, args[1] + k);
                    if add {
                        self.emit(Instruction::Binary { op: BinaryOp::Add, dst, x: dst, y: src });
                    } else {
                        self.emit(Instruction::Copy { dst, src });
                    }
                }
            }
            Op::Inverse => {
                let n = out_sp.nrow();
                let a = self.use_scratch(n * n);
                self.densify(args[0], &asp[0], a);
                for j in 0..n {
                    for i in 0..n {
                        let value = if i == j { 1.0 } else { 0.0 };
                        self.emit(Instruction::Const { dst: out + i + j * n, value });
                    }
                }
                self.emit(Instruction::DenseSolve { a, b: out, n, m: n, transpose: false });
            }
            Op::Solve { transpose } => {
                let (n, m) = (out_sp.nrow(), out_sp.ncol());
                let a = self.use_scratch(n * n);
                self.densify(args[0], &asp[0], a);
                self.densify(args[1], &asp[1], out);
                self.emit(Instruction::DenseSolve { a, b: out, n, m, transpose: *transpose });
            }
            Op::InnerProd => {
                self.emit(Instruction::Const { dst: out, value: 0.0 });
                for (k, src) in asp[1].nz_map(&asp[0])?.into_iter().enumerate() {
                    if let Some(src) = src {
                        self.emit(Instruction::MulAcc { dst: out, x: args[0] + k, y: args[1] + src });
                    }
                }
            }
            Op::Norm(kind) => {
                self.emit(Instruction::Const { dst: out, value: 0.0 });
                for k in 0..asp[0].nnz() {
                    let x = args[0] + k;
                    match kind {
                        NormKind::Frobenius | NormKind::Two => self.emit(Instruction::MulAcc { dst: out, x, y: x }),
                        NormKind::One | NormKind::Inf => {
                            let op = if *kind == NormKind::One { BinaryOp::Add } else { BinaryOp::Fmax };
                            self.emit(Instruction::Unary { op: UnaryOp::Abs, dst: TEMP_SLOT, x });
                            self.emit(Instruction::Binary {
                                op,
                                dst: out,
                                x: out,
                                y: TEMP_SLOT,
                            });
                        }
                    }
                }
                if matches!(kind, NormKind::Frobenius | NormKind::Two) {
                    self.emit(Instruction::Unary { op: UnaryOp::Sqrt, dst: out, x: out });
                }
            }
            Op::Assertion { message } => {
                let cond = slot(args[1], (asp[1].nnz() > 0).then_some(0));
                self.emit(Instruction::Assert { cond, id: self.messages.len() });
                self.messages.push(message.clone());
                for k in 0..out_sp.nnz() {
                    self.emit(Instruction::Copy { dst: out + k, src: args[0] + k });
                }
            }
        }
        Ok(())
    }

    /// `z += x * y` restricted to the pattern of `z`.
    fn lower_products(&mut self, z: usize, zsp: &Sparsity, (x, xsp): (usize, &Sparsity), (y, ysp): (usize, &Sparsity)) {
        let mut slot = vec![usize::MAX; zsp.nrow()];
        let mut stamp = vec![usize::MAX; zsp.nrow()];
        for k in 0..zsp.ncol() {
            for idx in zsp.colind()[k]..zsp.colind()[k + 1] {
                slot[zsp.row()[idx]] = idx;
                stamp[zsp.row()[idx]] = k;
            }
            for yk in ysp.colind()[k]..ysp.colind()[k + 1] {
                let j = ysp.row()[yk];
                for xk in xsp.colind()[j]..xsp.colind()[j + 1] {
                    let i = xsp.row()[xk];
                    if stamp[i] == k {
                        self.emit(Instruction::MulAcc { dst: z + slot[i], x: x + xk, y: y + yk });
                    }
                }
            }
        }
    }
}

impl GeneratedCode {
    /// Lowers an evaluation plan to scalar instructions.
    ///
    /// # Arguments
    /// * `alg` - Plan whose work cells become regions of the `w` array
    ///
    /// # Returns
    /// The program, reading `arg[i]` in the nonzero order of input `i` and writing
    /// `res[o]` in the nonzero order of output `o`.
    ///
    /// # Errors
    /// `StructuralError` if the plan is inconsistent.
    pub fn generate(alg: &Algorithm) -> Result<Self, GraphError> {
        let mut base = Vec::with_capacity(alg.n_work());
        let mut next = RESERVED;
        for &nnz in alg.cell_nnz() {
            base.push(next);
            next += nnz;
        }
        let mut lowering = Lowering {
            code: vec![Instruction::Const { dst: ZERO_SLOT, value: 0.0 }],
            base,
            scratch: next,
            scratch_len: 0,
            messages: Vec::new(),
        };
        for el in alg.elements() {
            lowering.lower(el)?;
        }
        for (o, (cell, sp)) in alg.outputs().iter().enumerate() {
            let src = lowering.base[*cell];
            for nz in 0..sp.nnz() {
                lowering.code.push(Instruction::Output { res: o, nz, src: src + nz });
            }
        }
        Ok(GeneratedCode {
            instructions: lowering.code,
            n_w: lowering.scratch + lowering.scratch_len,
            inputs: alg.input_sparsity().to_vec(),
            outputs: alg.outputs().iter().map(|(_, sp)| sp.clone()).collect(),
            messages: lowering.messages,
        })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Length of the `w` array the program needs.
    pub fn n_w(&self) -> usize {
        self.n_w
    }

    pub fn input_sparsity(&self) -> &[Sparsity] {
        &self.inputs
    }

    pub fn output_sparsity(&self) -> &[Sparsity] {
        &self.outputs
    }

    /// Assertion messages, indexed by the `id` of [`Instruction::Assert`].
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Maps a program status to a result.
    pub(crate) fn status(&self, status: i64) -> Result<(), GraphError> {
        if status == 0 {
            return Ok(());
        }
        let message = usize::try_from(status - 1)
            .ok()
            .and_then(|id| self.messages.get(id))
            .cloned()
            .unwrap_or_else(|| format!("unknown assertion {status}"));
        Err(GraphError::AssertionFailure(message))
    }

    /// Runs the program on raw nonzero buffers.
    ///
    /// # Arguments
    /// * `arg` - Nonzeros of every input, `None` for an all-zero input
    /// * `res` - Buffers for the nonzeros of every output, `None` to skip an output
    /// * `w` - Work array of at least [`GeneratedCode::n_w`] entries
    ///
    /// # Errors
    /// `InvalidInputLength` if a buffer is too short or the counts do not match, and
    /// `AssertionFailure` for the first failing assertion.
    pub fn execute(&self, arg: &[Option<&[f64]>], res: &mut [Option<&mut [f64]>], w: &mut [f64]) -> Result<(), GraphError> {
        check_len(self.inputs.len(), arg.len())?;
        check_len(self.outputs.len(), res.len())?;
        if w.len() < self.n_w {
            return Err(GraphError::InvalidInputLength {
                expected: self.n_w,
                got: w.len(),
            });
        }
        for (sp, a) in self.inputs.iter().zip(arg) {
            if let Some(a) = a {
                check_len(sp.nnz(), a.len())?;
            }
        }
        for (sp, r) in self.outputs.iter().zip(res.iter()) {
            if let Some(r) = r {
                check_len(sp.nnz(), r.len())?;
            }
        }

        for instruction in &self.instructions {
            match *instruction {
                Instruction::Const { dst, value } => w[dst] = value,
                Instruction::Input { dst, arg: i, nz } => w[dst] = arg[i].map_or(0.0, |a| a[nz]),
                Instruction::Output { res: o, nz, src } => {
                    if let Some(r) = res[o].as_deref_mut() {
                        r[nz] = w[src];
                    }
                }
                Instruction::Copy { dst, src } => w[dst] = w[src],
                Instruction::Unary { op, dst, x } => w[dst] = op.eval(w[x]),
                Instruction::Binary { op, dst, x, y } => w[dst] = op.eval(w[x], w[y]),
                Instruction::MulAcc { dst, x, y } => w[dst] += w[x] * w[y],
                Instruction::DenseSolve { a, b, n, m, transpose } => {
                    let (lo, hi) = w.split_at_mut(a.max(b));
                    let (a, b) = if a < b {
                        (&mut lo[a..a + n * n], &mut hi[..n * m])
                    } else {
                        (&mut hi[..n * n], &mut lo[b..b + n * m])
                    };
                    dense_solve_f64(a, b, n, m, transpose);
                }
                Instruction::Assert { cond, id } => {
                    if w[cond] != 1.0 {
                        return self.status(id as i64 + 1);
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs the program on matrices.
    ///
    /// Inputs are projected onto the expected patterns; a wrong shape is a
    /// `DimensionError`.
    pub fn interpret(&self, inputs: &[Matrix]) -> Result<Vec<Matrix>, GraphError> {
        check_len(self.inputs.len(), inputs.len())?;
        let inputs = inputs
            .iter()
            .zip(&self.inputs)
            .map(|(m, sp)| m.project(sp))
            .collect::<Result<Vec<_>, _>>()?;
        let mut outputs: Vec<Vec<f64>> = self.outputs.iter().map(|sp| vec![0.0; sp.nnz()]).collect();
        let mut w = vec![0.0; self.n_w];
        {
            let arg: Vec<Option<&[f64]>> = inputs.iter().map(|m| Some(m.nonzeros())).collect();
            let mut res: Vec<Option<&mut [f64]>> = outputs.iter_mut().map(|r| Some(r.as_mut_slice())).collect();
            self.execute(&arg, &mut res, &mut w)?;
        }
        outputs
            .into_iter()
            .zip(&self.outputs)
            .map(|(nz, sp)| Matrix::new(sp.clone(), nz))
            .collect()
    }

    /// Renders the program as a C routine
    /// `int name(const double** arg, double** res, double* w)`.
    ///
    /// The routine returns zero on success and the index of the failed assertion plus
    /// one otherwise.
    pub fn to_c(&self, name: &str) -> String {
        let mut s = String::new();
        s.push_str("/* This file was generated by exprgraph-jit */\n");
        s.push_str("#include <math.h>\n\n");
        s.push_str("static double sign(double x) { return x>0 ? 1. : (x<0 ? -1. : 0.); }\n\n");
        if self.instructions.iter().any(|i| matches!(i, Instruction::DenseSolve { .. })) {
            s.push_str(C_DENSE_SOLVE);
        }
        for (id, message) in self.messages.iter().enumerate() {
            s.push_str(&format!("/* assertion {}: {} */\n", id + 1, message.replace("*/", "* /")));
        }
        s.push_str(&format!(
            "int {name}(const double** arg, double** res, double* w) {{\n"
        ));
        for instruction in &self.instructions {
            let line = match instruction {
                Instruction::Const { dst, value } => format!("w[{dst}] = {};", c_literal(*value)),
                Instruction::Input { dst, arg, nz } => format!("w[{dst}] = arg[{arg}] ? arg[{arg}][{nz}] : 0.;"),
                Instruction::Output { res, nz, src } => format!("if (res[{res}]) res[{res}][{nz}] = w[{src}];"),
                Instruction::Copy { dst, src } => format!("w[{dst}] = w[{src}];"),
                Instruction::Unary { op, dst, x } => format!("w[{dst}] = {};", op.c_expr(&format!("w[{x}]"))),
                Instruction::Binary { op, dst, x, y } => {
                    format!("w[{dst}] = {};", op.c_expr(&format!("w[{x}]"), &format!("w[{y}]")))
                }
                Instruction::MulAcc { dst, x, y } => format!("w[{dst}] += w[{x}]*w[{y}];"),
                Instruction::DenseSolve { a, b, n, m, transpose } => {
                    format!("dense_solve(w+{a}, w+{b}, {n}, {m}, {});", u8::from(*transpose))
                }
                Instruction::Assert { cond, id } => format!("if (w[{cond}]!=1.) return {};", id + 1),
            };
            s.push_str("  ");
            s.push_str(&line);
            s.push('\n');
        }
        s.push_str("  return 0;\n}\n");
        s
    }
}

fn check_len(expected: usize, got: usize) -> Result<(), GraphError> {
    if expected == got {
        Ok(())
    } else {
        Err(GraphError::InvalidInputLength { expected, got })
    }
}

fn c_literal(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "INFINITY" } else { "-INFINITY" }.to_string()
    } else {
        format!("{value:?}")
    }
}

const C_DENSE_SOLVE: &str = "\
static void dense_solve(double* a, double* b, int n, int m, int tr) {
  int i, j, k, l, p;
  double t;
  if (tr) for (i=0; i<n; ++i) for (j=i+1; j<n; ++j) { t=a[i+j*n]; a[i+j*n]=a[j+i*n]; a[j+i*n]=t; }
  for (k=0; k<n; ++k) {
    p = k;
    for (i=k+1; i<n; ++i) if (fabs(a[i+k*n])>fabs(a[p+k*n])) p = i;
    if (p!=k) {
      for (j=0; j<n; ++j) { t=a[k+j*n]; a[k+j*n]=a[p+j*n]; a[p+j*n]=t; }
      for (j=0; j<m; ++j) { t=b[k+j*n]; b[k+j*n]=b[p+j*n]; b[p+j*n]=t; }
    }
    for (i=k+1; i<n; ++i) {
      t = a[i+k*n]/a[k+k*n];
      if (t==0.) continue;
      for (j=k; j<n; ++j) a[i+j*n] -= t*a[k+j*n];
      for (j=0; j<m; ++j) b[i+j*n] -= t*b[k+j*n];
    }
  }
  for (j=0; j<m; ++j) for (k=n-1; k>=0; --k) {
    t = b[k+j*n];
    for (l=k+1; l<n; ++l) t -= a[k+l*n]*b[l+j*n];
    b[k+j*n] = t/a[k+k*n];
  }
}

";

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Const { dst, value } => write!(f, "w{dst} = {value}"),
            Instruction::Input { dst, arg, nz } => write!(f, "w{dst} = input[{arg}][{nz}]"),
            Instruction::Output { res, nz, src } => write!(f, "output[{res}][{nz}] = w{src}"),
            Instruction::Copy { dst, src } => write!(f, "w{dst} = w{src}"),
            Instruction::Unary { op, dst, x } => write!(f, "w{dst} = {op}(w{x})"),
            Instruction::Binary { op, dst, x, y } => match op.infix() {
                Some(sym) => write!(f, "w{dst} = w{x}{sym}w{y}"),
                None => write!(f, "w{dst} = {op}(w{x}, w{y})"),
            },
            Instruction::MulAcc { dst, x, y } => write!(f, "w{dst} += w{x}*w{y}"),
            Instruction::DenseSolve { a, b, n, m, transpose } => {
                let tr = if *transpose { "'" } else { "" };
                write!(f, "w{b}[{n}x{m}] = solve(w{a}[{n}x{n}]{tr}, w{b})")
            }
            Instruction::Assert { cond, id } => write!(f, "assert w{cond} == 1 (#{id})"),
        }
    }
}

impl fmt::Display for GeneratedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({} instructions, {} work entries)",
            "GeneratedCode".bold(),
            self.instructions.len(),
            self.n_w
        )?;
        writeln!(
            f,
            "  {} {}",
            "inputs:".cyan(),
            self.inputs.iter().map(|sp| sp.shape().to_string()).join(", ")
        )?;
        writeln!(
            f,
            "  {} {}",
            "outputs:".cyan(),
            self.outputs.iter().map(|sp| sp.shape().to_string()).join(", ")
        )?;
        for instruction in &self.instructions {
            let text = instruction.to_string();
            match instruction {
                Instruction::Input { .. } | Instruction::Output { .. } => writeln!(f, "  {}", text.green())?,
                Instruction::Assert { .. } => writeln!(f, "  {}", text.yellow())?,
                _ => writeln!(f, "  {text}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Numeric;
    use crate::graph::Graph;
    use crate::node::Mx;
    use approx::assert_relative_eq;

    fn compare(g: &Graph, inputs: &[Mx], outputs: &[Mx], values: &[Matrix]) -> GeneratedCode {
        let alg = Algorithm::new(g, inputs, outputs).unwrap();
        let code = GeneratedCode::generate(&alg).unwrap();
        let expected = alg.run(&mut Numeric::new(), values).unwrap();
        let got = code.interpret(values).unwrap();
        for (e, g) in expected.iter().zip(&got) {
            assert_eq!(e.sparsity(), g.sparsity());
            for (a, b) in e.nonzeros().iter().zip(g.nonzeros()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-12);
            }
        }
        code
    }

    #[test]
    fn test_elementwise_program() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let y = g.sym("y", 1, 1);
        let s = g.sin(x).unwrap();
        let e = g.times(s, y).unwrap();
        let p = g.pow(e, y).unwrap();
        let c = g.cos(y).unwrap();
        let out = g.add(p, c).unwrap();
        let code = compare(
            &g,
            &[x, y],
            &[out, e],
            &[Matrix::column(&[0.3, 0.9]), Matrix::scalar(1.7)],
        );
        assert!(code.instructions().iter().any(|i| matches!(i, Instruction::Binary { op: BinaryOp::Pow, .. })));
    }

    #[test]
    fn test_linear_algebra_program() {
        let mut g = Graph::new();
        let a = g.sym("a", 3, 3);
        let b = g.sym("b", 3, 2);
        let x = g.solve(a, b, false).unwrap();
        let xt = g.solve(a, b, true).unwrap();
        let inv = g.inverse(a).unwrap();
        let m = g.mul(inv, b).unwrap();
        let bt = g.transpose(b).unwrap();
        let ip = g.inner_prod(x, m).unwrap();
        let n1 = g.norm_1(xt).unwrap();
        let nf = g.norm_fro(bt).unwrap();
        let ni = g.norm_inf(xt).unwrap();
        let a_value = Matrix::from_rows(&[vec![4.0, 1.0, 0.0], vec![1.0, 3.0, 1.0], vec![0.5, 0.0, 2.0]]).unwrap();
        let b_value = Matrix::from_rows(&[vec![1.0, 2.0], vec![0.0, -1.0], vec![3.0, 0.5]]).unwrap();
        let code = compare(&g, &[a, b], &[x, m, ip, n1, nf, ni, xt], &[a_value, b_value]);
        assert!(code.to_c("f").contains("static void dense_solve"));
    }

    #[test]
    fn test_structural_program() {
        let mut g = Graph::new();
        let x = g.sym("x", 4, 2);
        let parts = g.vertsplit(x, &[0, 1, 4]).unwrap();
        let cols = g.horzsplit(x, &[0, 1, 2]).unwrap();
        let d = g.diagcat(&[parts[0], cols[1]]).unwrap();
        let r = g.reshape(parts[1], 2, 3).unwrap();
        let picked = g.get_nonzeros(x, &[7, 0, 3], &Sparsity::dense(3, 1)).unwrap();
        let scattered = g.add_nonzeros(cols[0], picked, &[1, 1, 3]).unwrap();
        let assigned = g.set_nonzeros(x, picked, &[2, 5, 6]).unwrap();
        let (pattern, _) = Sparsity::from_triplets(4, 2, &[0, 3, 1], &[0, 0, 1]).unwrap();
        let projected = g.project(x, &pattern).unwrap();
        let values: Vec<f64> = (0..8).map(|k| k as f64 + 0.5).collect();
        compare(
            &g,
            &[x],
            &[d, r, scattered, assigned, projected],
            &[Matrix::from_dense(4, 2, values).unwrap()],
        );
    }

    #[test]
    fn test_in_place_accumulation_with_aliased_factor() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 2);
        let e = g.exp(x).unwrap();
        let z = g.mul_add(e, e, e).unwrap();
        let a_value = Matrix::from_rows(&[vec![0.1, 0.2], vec![-0.3, 0.4]]).unwrap();
        compare(&g, &[x], &[z], &[a_value]);
    }

    #[test]
    fn test_failed_assertion_status() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let one = g.scalar(1.0);
        let cond = g.sub(x, one).unwrap();
        let checked = g.assertion(x, cond, "x must be two").unwrap();
        let alg = Algorithm::new(&g, &[x], &[checked]).unwrap();
        let code = GeneratedCode::generate(&alg).unwrap();
        assert_eq!(code.interpret(&[Matrix::scalar(2.0)]).unwrap()[0].get(0, 0), 2.0);
        assert_eq!(
            code.interpret(&[Matrix::scalar(3.0)]).unwrap_err(),
            GraphError::AssertionFailure("x must be two".to_string())
        );
        assert!(code.to_c("checked").contains("return 1;"));
    }

    #[test]
    fn test_absent_buffers() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let y = g.sym("y", 2, 1);
        let s = g.add(x, y).unwrap();
        let alg = Algorithm::new(&g, &[x, y], &[s, x]).unwrap();
        let code = GeneratedCode::generate(&alg).unwrap();
        let mut out = [0.0; 2];
        let mut w = vec![0.0; code.n_w()];
        code.execute(&[Some(&[1.0, 2.0][..]), None], &mut [Some(&mut out[..]), None], &mut w)
            .unwrap();
        assert_eq!(out, [1.0, 2.0]);
        assert!(matches!(
            code.execute(&[None], &mut [None, None], &mut w),
            Err(GraphError::InvalidInputLength { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_c_rendering() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let s = g.sqrt(x).unwrap();
        let alg = Algorithm::new(&g, &[x], &[s]).unwrap();
        let c = GeneratedCode::generate(&alg).unwrap().to_c("root");
        assert!(c.contains("int root(const double** arg, double** res, double* w)"));
        assert!(c.contains("sqrt(w["));
        assert!(c.contains("if (res[0]) res[0][0]"));
    }
}
