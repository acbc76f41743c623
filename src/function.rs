//! Functions: named mappings from matrix inputs to matrix outputs.
//!
//! A [`Function`] owns a compacted copy of the graph region its outputs need, together
//! with an evaluation plan. Derivative functions are built on request and cached through
//! weak handles: a cached derivative stays available while someone holds it and is
//! rebuilt after the last holder drops it, so a Function never keeps its own
//! derivatives alive. Jacobian patterns are cached by value.
//!
//! # Example
//! ```
//! use exprgraph_jit::prelude::*;
//!
//! let mut g = Graph::new();
//! let x = g.sym("x", 2, 1);
//! let s = g.sin(x).unwrap();
//! let f = Function::new("f", &g, &[x], &[s]).unwrap();
//!
//! let jac = f.jacobian(0, 0, false, false).unwrap();
//! let out = jac.evaluate(&[Matrix::column(&[0.0, 1.0])]).unwrap();
//! assert_eq!(out[0].get(0, 0), 1.0);
//! assert_eq!(out[0].get(0, 1), 0.0);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use colored::Colorize;
use itertools::Itertools;
use rayon::prelude::*;

use crate::builder::{self, CompiledFunction};
use crate::codegen::GeneratedCode;
use crate::derivative;
use crate::errors::{BuilderError, GraphError};
use crate::eval::{Algorithm, Numeric, Symbolic};
use crate::graph::Graph;
use crate::matrix::Matrix;
use crate::node::Mx;
use crate::propagate::{self, column_coloring, expand_compact, row_coloring, SparsityMode};
use crate::sparsity::Sparsity;

/// Input sets evaluated by one rayon task in [`Function::eval_parallel`].
const BATCH_CHUNK: usize = 64;

/// Options of a [`Function`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionOptions {
    pub sparsity_mode: SparsityMode,
    /// In `Auto` mode, Jacobian patterns with more than this many nonzeros on both
    /// sides are computed hierarchically
    pub hierarchical_threshold: usize,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        FunctionOptions {
            sparsity_mode: SparsityMode::Auto,
            hierarchical_threshold: 3 * 64,
        }
    }
}

type Cache<K> = Mutex<HashMap<K, Weak<FunctionInner>>>;

/// Derived functions other than plain derivatives and Jacobians.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Derived {
    Gradient,
    Tangent,
    Hessian,
}

struct FunctionInner {
    name: String,
    graph: Graph,
    inputs: Vec<Mx>,
    outputs: Vec<Mx>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    algorithm: Algorithm,
    options: FunctionOptions,
    forward: Cache<usize>,
    reverse: Cache<usize>,
    jacobians: Cache<(usize, usize, bool, bool)>,
    derived: Cache<(Derived, usize, usize)>,
    full_jacobian: Mutex<Weak<FunctionInner>>,
    /// Keyed by `(input, output, compact, symmetric)`
    jac_sparsity: Mutex<HashMap<(usize, usize, bool, bool), Sparsity>>,
}

/// A named mapping from matrix inputs to matrix outputs, shared by reference.
#[derive(Clone)]
pub struct Function(Arc<FunctionInner>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the cached function for `key`, building and caching it if it is gone.
fn cached<K: Eq + Hash>(
    cache: &Cache<K>,
    key: K,
    build: impl FnOnce() -> Result<Function, GraphError>,
) -> Result<Function, GraphError> {
    if let Some(inner) = lock(cache).get(&key).and_then(Weak::upgrade) {
        return Ok(Function(inner));
    }
    let function = build()?;
    lock(cache).insert(key, Arc::downgrade(&function.0));
    Ok(function)
}

fn check_index(what: &'static str, index: usize, len: usize) -> Result<(), GraphError> {
    if index < len {
        Ok(())
    } else {
        Err(GraphError::IndexOutOfRange { what, index, len })
    }
}

/// Re-indexes a compact Jacobian (`nnz(out) x nnz(in)`) to `numel(out) x numel(in)`.
fn expand_jacobian(graph: &mut Graph, j: Mx, input: &Sparsity, output: &Sparsity) -> Result<Mx, GraphError> {
    let compact = graph.sparsity(j).clone();
    let (ilin, olin) = (input.linear_indices(), output.linear_indices());
    let (rows, cols): (Vec<usize>, Vec<usize>) = compact
        .triplets()
        .into_iter()
        .map(|(r, c)| (olin[r], ilin[c]))
        .unzip();
    let (full, mapping) = Sparsity::from_triplets(output.numel(), input.numel(), &rows, &cols)?;
    let mut indices = vec![0; full.nnz()];
    for (k, &m) in mapping.iter().enumerate() {
        indices[m] = k;
    }
    graph.get_nonzeros(j, &indices, &full)
}

/// Nonzeros of `x` as a column vector.
fn nonzeros_column(graph: &mut Graph, x: Mx) -> Result<Mx, GraphError> {
    let nnz = graph.sparsity(x).nnz();
    let all: Vec<usize> = (0..nnz).collect();
    graph.get_nonzeros(x, &all, &Sparsity::dense(nnz, 1))
}

impl Function {
    /// Creates a function from a graph.
    ///
    /// Inputs are named after their symbols, outputs `o0`, `o1`, ...
    ///
    /// # Arguments
    /// * `name` - Name used in diagnostics and derived function names
    /// * `graph` - Graph holding the expressions
    /// * `inputs` - Distinct symbols
    /// * `outputs` - Expressions of the inputs
    ///
    /// # Errors
    /// `StructuralError` if an input is not a symbol or appears twice, or if an output
    /// depends on a symbol that is not an input.
    pub fn new(name: impl Into<String>, graph: &Graph, inputs: &[Mx], outputs: &[Mx]) -> Result<Self, GraphError> {
        let input_names = inputs.iter().map(|&x| graph.display(x).to_string()).collect();
        let output_names = (0..outputs.len()).map(|k| format!("o{k}")).collect();
        Self::build(
            name.into(),
            graph,
            inputs,
            outputs,
            input_names,
            output_names,
            FunctionOptions::default(),
        )
    }

    /// Creates a function with named input and output slots.
    ///
    /// # Errors
    /// Same as [`Function::new`].
    pub fn with_scheme(
        name: impl Into<String>,
        graph: &Graph,
        inputs: &[(&str, Mx)],
        outputs: &[(&str, Mx)],
    ) -> Result<Self, GraphError> {
        let (input_names, inputs): (Vec<String>, Vec<Mx>) = inputs.iter().map(|&(n, x)| (n.to_string(), x)).unzip();
        let (output_names, outputs): (Vec<String>, Vec<Mx>) = outputs.iter().map(|&(n, x)| (n.to_string(), x)).unzip();
        Self::build(
            name.into(),
            graph,
            &inputs,
            &outputs,
            input_names,
            output_names,
            FunctionOptions::default(),
        )
    }

    /// The same function with other options. Caches are not shared.
    pub fn with_options(&self, options: FunctionOptions) -> Result<Self, GraphError> {
        let inner = &self.0;
        Self::build(
            inner.name.clone(),
            &inner.graph,
            &inner.inputs,
            &inner.outputs,
            inner.input_names.clone(),
            inner.output_names.clone(),
            options,
        )
    }

    fn build(
        name: String,
        graph: &Graph,
        inputs: &[Mx],
        outputs: &[Mx],
        input_names: Vec<String>,
        output_names: Vec<String>,
        options: FunctionOptions,
    ) -> Result<Self, GraphError> {
        let roots: Vec<Mx> = inputs.iter().chain(outputs).copied().collect();
        let (graph, handles) = graph.extract(&roots);
        let (inputs, outputs) = handles.split_at(inputs.len());
        let algorithm = Algorithm::new(&graph, inputs, outputs)?;
        Ok(Function(Arc::new(FunctionInner {
            name,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            graph,
            input_names,
            output_names,
            algorithm,
            options,
            forward: Mutex::default(),
            reverse: Mutex::default(),
            jacobians: Mutex::default(),
            derived: Mutex::default(),
            full_jacobian: Mutex::new(Weak::new()),
            jac_sparsity: Mutex::default(),
        })))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn n_in(&self) -> usize {
        self.0.inputs.len()
    }

    pub fn n_out(&self) -> usize {
        self.0.outputs.len()
    }

    pub fn input_names(&self) -> &[String] {
        &self.0.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.0.output_names
    }

    /// Position of the input slot called `name`.
    pub fn index_in(&self, name: &str) -> Option<usize> {
        self.0.input_names.iter().position(|n| n == name)
    }

    /// Position of the output slot called `name`.
    pub fn index_out(&self, name: &str) -> Option<usize> {
        self.0.output_names.iter().position(|n| n == name)
    }

    pub fn sparsity_in(&self, i: usize) -> Result<&Sparsity, GraphError> {
        check_index("input", i, self.n_in())?;
        Ok(&self.0.algorithm.input_sparsity()[i])
    }

    pub fn sparsity_out(&self, o: usize) -> Result<&Sparsity, GraphError> {
        check_index("output", o, self.n_out())?;
        Ok(&self.0.algorithm.outputs()[o].1)
    }

    /// The graph the function evaluates, holding only what the outputs need.
    pub fn graph(&self) -> &Graph {
        &self.0.graph
    }

    /// Input symbols inside [`Function::graph`].
    pub fn inputs(&self) -> &[Mx] {
        &self.0.inputs
    }

    /// Output expressions inside [`Function::graph`].
    pub fn outputs(&self) -> &[Mx] {
        &self.0.outputs
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.0.algorithm
    }

    pub fn options(&self) -> FunctionOptions {
        self.0.options
    }

    /// True if both handles refer to the same function.
    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Evaluates the function numerically.
    ///
    /// Inputs with the right shape but a different pattern are projected: entries
    /// outside the input pattern are ignored.
    ///
    /// # Errors
    /// `InvalidInputLength` for a wrong number of inputs, `DimensionError` for a wrong
    /// shape, `AssertionFailure` if an assertion fails.
    pub fn evaluate(&self, inputs: &[Matrix]) -> Result<Vec<Matrix>, GraphError> {
        let alg = &self.0.algorithm;
        if inputs.len() != self.n_in() {
            return Err(GraphError::InvalidInputLength {
                expected: self.n_in(),
                got: inputs.len(),
            });
        }
        let values = inputs
            .iter()
            .zip(alg.input_sparsity())
            .map(|(m, sp)| {
                if m.shape() != sp.shape() {
                    Err(GraphError::dimension("evaluate", sp.shape(), m.shape()))
                } else if m.sparsity() == sp {
                    Ok(m.clone())
                } else {
                    m.project(sp)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        alg.run(&mut Numeric::new(), &values)
    }

    /// Evaluates many input sets in parallel.
    ///
    /// # Returns
    /// The outputs of every input set, in order.
    ///
    /// # Errors
    /// The first error of any evaluation.
    pub fn eval_parallel(&self, batch: &[Vec<Matrix>]) -> Result<Vec<Vec<Matrix>>, GraphError> {
        let chunks = batch
            .par_chunks(BATCH_CHUNK)
            .map(|chunk| chunk.iter().map(|inputs| self.evaluate(inputs)).collect::<Result<Vec<_>, _>>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks.into_iter().flatten().collect())
    }

    /// Inlines the function into another graph.
    ///
    /// # Arguments
    /// * `graph` - Graph to build the outputs in
    /// * `args` - One expression per input, of the input's shape
    ///
    /// # Errors
    /// `InvalidInputLength` for a wrong number of arguments, `DimensionError` for a
    /// wrong shape.
    pub fn call_symbolic(&self, graph: &mut Graph, args: &[Mx]) -> Result<Vec<Mx>, GraphError> {
        let alg = &self.0.algorithm;
        if args.len() != self.n_in() {
            return Err(GraphError::InvalidInputLength {
                expected: self.n_in(),
                got: args.len(),
            });
        }
        let mut values = Vec::with_capacity(args.len());
        for (&a, sp) in args.iter().zip(alg.input_sparsity()) {
            let shape = graph.shape(a);
            if shape != sp.shape() {
                return Err(GraphError::dimension("call", sp.shape(), shape));
            }
            values.push(if graph.sparsity(a) == sp { a } else { graph.project(a, sp)? });
        }
        alg.run(&mut Symbolic::new(graph), &values)
    }

    /// Function computing `n` forward directional derivatives.
    ///
    /// Inputs are `[inputs..., n x one seed per input]`, outputs are
    /// `[outputs..., n x one sensitivity per output]`.
    pub fn derivative_forward(&self, n: usize) -> Result<Function, GraphError> {
        cached(&self.0.forward, n, || self.build_forward(n))
    }

    fn build_forward(&self, n: usize) -> Result<Function, GraphError> {
        let inner = &self.0;
        let mut graph = inner.graph.clone();
        let mut inputs = inner.inputs.clone();
        let mut input_names = inner.input_names.clone();
        let mut seeds = Vec::with_capacity(n);
        for d in 0..n {
            let mut direction = Vec::with_capacity(inner.inputs.len());
            for (&x, name) in inner.inputs.iter().zip(&inner.input_names) {
                let seed_name = format!("fwd{d}_{name}");
                let sp = graph.sparsity(x).clone();
                let seed = graph.symbol(seed_name.clone(), sp);
                direction.push(Some(seed));
                inputs.push(seed);
                input_names.push(seed_name);
            }
            seeds.push(direction);
        }
        let sensitivities = derivative::forward(&mut graph, &inner.outputs, &inner.inputs, &seeds)?;

        let mut outputs = inner.outputs.clone();
        let mut output_names = inner.output_names.clone();
        for (d, direction) in sensitivities.into_iter().enumerate() {
            for (t, name) in direction.into_iter().zip(&inner.output_names) {
                outputs.push(t);
                output_names.push(format!("fwd{d}_{name}"));
            }
        }
        Self::build(
            format!("fwd{n}_{}", inner.name),
            &graph,
            &inputs,
            &outputs,
            input_names,
            output_names,
            inner.options,
        )
    }

    /// Function computing `n` adjoint derivatives.
    ///
    /// Inputs are `[inputs..., n x one seed per output]`, outputs are
    /// `[outputs..., n x one adjoint per input]`.
    pub fn derivative_reverse(&self, n: usize) -> Result<Function, GraphError> {
        cached(&self.0.reverse, n, || self.build_reverse(n))
    }

    fn build_reverse(&self, n: usize) -> Result<Function, GraphError> {
        let inner = &self.0;
        let mut graph = inner.graph.clone();
        let mut inputs = inner.inputs.clone();
        let mut input_names = inner.input_names.clone();
        let mut seeds = Vec::with_capacity(n);
        for d in 0..n {
            let mut direction = Vec::with_capacity(inner.outputs.len());
            for (&f, name) in inner.outputs.iter().zip(&inner.output_names) {
                let seed_name = format!("adj{d}_{name}");
                let sp = graph.sparsity(f).clone();
                let seed = graph.symbol(seed_name.clone(), sp);
                direction.push(Some(seed));
                inputs.push(seed);
                input_names.push(seed_name);
            }
            seeds.push(direction);
        }
        let adjoints = derivative::reverse(&mut graph, &inner.outputs, &inner.inputs, &seeds)?;

        let mut outputs = inner.outputs.clone();
        let mut output_names = inner.output_names.clone();
        for (d, direction) in adjoints.into_iter().enumerate() {
            for (a, name) in direction.into_iter().zip(&inner.input_names) {
                outputs.push(a);
                output_names.push(format!("adj{d}_{name}"));
            }
        }
        Self::build(
            format!("adj{n}_{}", inner.name),
            &graph,
            &inputs,
            &outputs,
            input_names,
            output_names,
            inner.options,
        )
    }

    /// Compact Jacobian pattern, cached.
    fn compact_sparsity(&self, iind: usize, oind: usize) -> Result<Sparsity, GraphError> {
        let key = (iind, oind, true, false);
        if let Some(sp) = lock(&self.0.jac_sparsity).get(&key) {
            return Ok(sp.clone());
        }
        let options = self.0.options;
        let sp = propagate::jacobian_sparsity(
            &self.0.algorithm,
            iind,
            oind,
            options.sparsity_mode,
            options.hierarchical_threshold,
        )?;
        lock(&self.0.jac_sparsity).insert(key, sp.clone());
        Ok(sp)
    }

    /// Structural Jacobian pattern of output `oind` with respect to input `iind`, as a
    /// `numel(out) x numel(in)` pattern. No numeric work is done.
    ///
    /// # Arguments
    /// * `iind` - Input index
    /// * `oind` - Output index
    /// * `symmetric` - Unite the pattern with its transpose
    ///
    /// # Errors
    /// `IndexOutOfRange` for invalid indices, `StructuralError` if a symmetric pattern
    /// is requested for a non-square Jacobian.
    pub fn jacobian_sparsity(&self, iind: usize, oind: usize, symmetric: bool) -> Result<Sparsity, GraphError> {
        check_index("input", iind, self.n_in())?;
        check_index("output", oind, self.n_out())?;
        let key = (iind, oind, false, symmetric);
        if let Some(sp) = lock(&self.0.jac_sparsity).get(&key) {
            return Ok(sp.clone());
        }
        let compact = self.compact_sparsity(iind, oind)?;
        let alg = &self.0.algorithm;
        let mut sp = expand_compact(&compact, &alg.input_sparsity()[iind], &alg.outputs()[oind].1)?;
        if symmetric {
            sp = sp.symmetrize()?;
        }
        lock(&self.0.jac_sparsity).insert(key, sp.clone());
        Ok(sp)
    }

    /// Builds the compact Jacobian of output `oind` with respect to input `iind` in a
    /// copy of the function graph.
    ///
    /// Columns that share no row are seeded together (forward), or rows that share no
    /// column (reverse), whichever needs fewer sweeps.
    fn jacobian_block(&self, graph: &mut Graph, iind: usize, oind: usize) -> Result<Mx, GraphError> {
        let sp = self.compact_sparsity(iind, oind)?;
        if sp.nnz() == 0 {
            return Ok(graph.zeros(sp.nrow(), sp.ncol()));
        }
        let (x, f) = (self.0.inputs[iind], self.0.outputs[oind]);
        let (isp, osp) = (graph.sparsity(x).clone(), graph.sparsity(f).clone());
        let (col_colors, n_col_colors) = column_coloring(&sp);
        let (row_colors, n_row_colors) = row_coloring(&sp);

        let (parts, indices) = if n_col_colors <= n_row_colors {
            let triplets = isp.triplets();
            let seeds = (0..n_col_colors)
                .map(|k| {
                    let (rows, cols): (Vec<usize>, Vec<usize>) = (0..isp.nnz())
                        .filter(|&j| col_colors[j] == k)
                        .map(|j| triplets[j])
                        .unzip();
                    let (pattern, _) = Sparsity::from_triplets(isp.nrow(), isp.ncol(), &rows, &cols)?;
                    Ok(vec![Some(graph.filled(&pattern, 1.0))])
                })
                .collect::<Result<Vec<_>, GraphError>>()?;
            let parts: Vec<Mx> = derivative::forward(graph, &[f], &[x], &seeds)?
                .into_iter()
                .map(|t| t[0])
                .collect();
            let indices: Vec<usize> = sp
                .triplets()
                .into_iter()
                .map(|(i, j)| col_colors[j] * osp.nnz() + i)
                .collect();
            (parts, indices)
        } else {
            let triplets = osp.triplets();
            let seeds = (0..n_row_colors)
                .map(|k| {
                    let (rows, cols): (Vec<usize>, Vec<usize>) = (0..osp.nnz())
                        .filter(|&i| row_colors[i] == k)
                        .map(|i| triplets[i])
                        .unzip();
                    let (pattern, _) = Sparsity::from_triplets(osp.nrow(), osp.ncol(), &rows, &cols)?;
                    Ok(vec![Some(graph.filled(&pattern, 1.0))])
                })
                .collect::<Result<Vec<_>, GraphError>>()?;
            let parts: Vec<Mx> = derivative::reverse(graph, &[f], &[x], &seeds)?
                .into_iter()
                .map(|a| a[0])
                .collect();
            let indices: Vec<usize> = sp
                .triplets()
                .into_iter()
                .map(|(i, j)| row_colors[i] * isp.nnz() + j)
                .collect();
            (parts, indices)
        };

        let columns = parts
            .into_iter()
            .map(|p| nonzeros_column(graph, p))
            .collect::<Result<Vec<_>, _>>()?;
        let stacked = graph.vertcat(&columns)?;
        graph.get_nonzeros(stacked, &indices, &sp)
    }

    /// Function computing the Jacobian of output `oind` with respect to input `iind`.
    ///
    /// # Arguments
    /// * `iind` - Input index
    /// * `oind` - Output index
    /// * `compact` - Index the Jacobian by nonzeros (`nnz(out) x nnz(in)`) instead of
    ///   by entries (`numel(out) x numel(in)`)
    /// * `symmetric` - Give the Jacobian the pattern united with its transpose
    ///
    /// # Returns
    /// A function with the same inputs and outputs `[J, outputs...]`.
    ///
    /// # Errors
    /// `IndexOutOfRange` for invalid indices, `StructuralError` for a symmetric request
    /// on a non-square Jacobian.
    pub fn jacobian(&self, iind: usize, oind: usize, compact: bool, symmetric: bool) -> Result<Function, GraphError> {
        check_index("input", iind, self.n_in())?;
        check_index("output", oind, self.n_out())?;
        cached(&self.0.jacobians, (iind, oind, compact, symmetric), || {
            let inner = &self.0;
            let name = format!(
                "jac_{}_{}_{}",
                inner.name, inner.input_names[iind], inner.output_names[oind]
            );
            self.build_jacobian(iind, oind, compact, symmetric, name)
        })
    }

    fn build_jacobian(
        &self,
        iind: usize,
        oind: usize,
        compact: bool,
        symmetric: bool,
        name: String,
    ) -> Result<Function, GraphError> {
        let inner = &self.0;
        let mut graph = inner.graph.clone();
        let mut j = self.jacobian_block(&mut graph, iind, oind)?;
        if !compact {
            let isp = graph.sparsity(inner.inputs[iind]).clone();
            let osp = graph.sparsity(inner.outputs[oind]).clone();
            j = expand_jacobian(&mut graph, j, &isp, &osp)?;
        }
        if symmetric {
            let sp = graph.sparsity(j).symmetrize()?;
            j = graph.project(j, &sp)?;
        }
        let outputs: Vec<Mx> = std::iter::once(j).chain(inner.outputs.iter().copied()).collect();
        let output_names = std::iter::once("jac".to_string())
            .chain(inner.output_names.iter().cloned())
            .collect();
        Self::build(
            name,
            &graph,
            &inner.inputs,
            &outputs,
            inner.input_names.clone(),
            output_names,
            inner.options,
        )
    }

    fn require_scalar(&self, sp: &Sparsity, what: &str) -> Result<(), GraphError> {
        if sp.shape().is_scalar() {
            Ok(())
        } else {
            Err(GraphError::structural(format!(
                "{what} of {} must be scalar, got {}",
                self.0.name,
                sp.shape()
            )))
        }
    }

    /// Gradient expression of scalar output `oind` with respect to input `iind`.
    fn gradient_expr(&self, graph: &mut Graph, iind: usize, oind: usize) -> Result<Mx, GraphError> {
        let (x, f) = (self.0.inputs[iind], self.0.outputs[oind]);
        self.require_scalar(graph.sparsity(f), "gradient output")?;
        let one = graph.scalar(1.0);
        let adjoints = derivative::reverse(graph, &[f], &[x], &[vec![Some(one)]])?;
        Ok(adjoints[0][0])
    }

    /// Function computing the gradient of scalar output `oind` with respect to input
    /// `iind`, by one reverse sweep.
    ///
    /// # Returns
    /// A function with outputs `[grad, outputs...]`; `grad` has the input's pattern.
    ///
    /// # Errors
    /// `StructuralError` if the output is not scalar.
    pub fn gradient(&self, iind: usize, oind: usize) -> Result<Function, GraphError> {
        check_index("input", iind, self.n_in())?;
        check_index("output", oind, self.n_out())?;
        cached(&self.0.derived, (Derived::Gradient, iind, oind), || {
            let inner = &self.0;
            let mut graph = inner.graph.clone();
            let grad = self.gradient_expr(&mut graph, iind, oind)?;
            let outputs: Vec<Mx> = std::iter::once(grad).chain(inner.outputs.iter().copied()).collect();
            let output_names = std::iter::once("grad".to_string())
                .chain(inner.output_names.iter().cloned())
                .collect();
            Self::build(
                format!("grad_{}_{}_{}", inner.name, inner.input_names[iind], inner.output_names[oind]),
                &graph,
                &inner.inputs,
                &outputs,
                inner.input_names.clone(),
                output_names,
                inner.options,
            )
        })
    }

    /// Function computing the derivative of output `oind` with respect to scalar input
    /// `iind`, by one forward sweep.
    ///
    /// # Returns
    /// A function with outputs `[tangent, outputs...]`; `tangent` has the output's
    /// pattern.
    ///
    /// # Errors
    /// `StructuralError` if the input is not scalar.
    pub fn tangent(&self, iind: usize, oind: usize) -> Result<Function, GraphError> {
        check_index("input", iind, self.n_in())?;
        check_index("output", oind, self.n_out())?;
        cached(&self.0.derived, (Derived::Tangent, iind, oind), || {
            let inner = &self.0;
            let mut graph = inner.graph.clone();
            let (x, f) = (inner.inputs[iind], inner.outputs[oind]);
            self.require_scalar(graph.sparsity(x), "tangent input")?;
            let one = graph.scalar(1.0);
            let tangent = derivative::forward(&mut graph, &[f], &[x], &[vec![Some(one)]])?[0][0];
            let outputs: Vec<Mx> = std::iter::once(tangent).chain(inner.outputs.iter().copied()).collect();
            let output_names = std::iter::once("tangent".to_string())
                .chain(inner.output_names.iter().cloned())
                .collect();
            Self::build(
                format!("tangent_{}_{}_{}", inner.name, inner.input_names[iind], inner.output_names[oind]),
                &graph,
                &inner.inputs,
                &outputs,
                inner.input_names.clone(),
                output_names,
                inner.options,
            )
        })
    }

    /// Function computing the Hessian of scalar output `oind` with respect to input
    /// `iind`: the Jacobian of the gradient, with a symmetric pattern.
    ///
    /// # Returns
    /// A function with outputs `[H, grad, outputs...]`, `H` being
    /// `numel(in) x numel(in)`.
    ///
    /// # Errors
    /// `StructuralError` if the output is not scalar.
    pub fn hessian(&self, iind: usize, oind: usize) -> Result<Function, GraphError> {
        check_index("input", iind, self.n_in())?;
        check_index("output", oind, self.n_out())?;
        cached(&self.0.derived, (Derived::Hessian, iind, oind), || {
            let inner = &self.0;
            let mut graph = inner.graph.clone();
            let grad = self.gradient_expr(&mut graph, iind, oind)?;
            let outputs: Vec<Mx> = std::iter::once(grad).chain(inner.outputs.iter().copied()).collect();
            let output_names = std::iter::once("grad".to_string())
                .chain(inner.output_names.iter().cloned())
                .collect();
            let with_gradient = Self::build(
                format!("grad_{}", inner.name),
                &graph,
                &inner.inputs,
                &outputs,
                inner.input_names.clone(),
                output_names,
                inner.options,
            )?;
            with_gradient.build_jacobian(
                iind,
                0,
                false,
                true,
                format!("hess_{}_{}_{}", inner.name, inner.input_names[iind], inner.output_names[oind]),
            )
        })
    }

    /// Function computing the compact Jacobian of all outputs (nonzeros stacked) with
    /// respect to all inputs (nonzeros stacked).
    ///
    /// # Returns
    /// A function with the same inputs and the single output `jac`.
    pub fn full_jacobian(&self) -> Result<Function, GraphError> {
        if let Some(inner) = lock(&self.0.full_jacobian).upgrade() {
            return Ok(Function(inner));
        }
        let inner = &self.0;
        let mut graph = inner.graph.clone();
        let n_in: usize = inner.algorithm.input_sparsity().iter().map(Sparsity::nnz).sum();
        let n_out: usize = inner.algorithm.outputs().iter().map(|(_, sp)| sp.nnz()).sum();
        let j = if self.n_in() == 0 || self.n_out() == 0 {
            graph.zeros(n_out, n_in)
        } else {
            let mut rows = Vec::with_capacity(self.n_out());
            for oind in 0..self.n_out() {
                let blocks = (0..self.n_in())
                    .map(|iind| self.jacobian_block(&mut graph, iind, oind))
                    .collect::<Result<Vec<_>, _>>()?;
                rows.push(graph.horzcat(&blocks)?);
            }
            graph.vertcat(&rows)?
        };
        let function = Self::build(
            format!("jac_{}", inner.name),
            &graph,
            &inner.inputs,
            &[j],
            inner.input_names.clone(),
            vec!["jac".to_string()],
            inner.options,
        )?;
        *lock(&self.0.full_jacobian) = Arc::downgrade(&function.0);
        Ok(function)
    }

    /// Lowers the function to a flat program.
    pub fn generate_code(&self) -> Result<GeneratedCode, GraphError> {
        GeneratedCode::generate(&self.0.algorithm)
    }

    /// Compiles the function to native code.
    ///
    /// # Errors
    /// Returns a BuilderError if code generation or JIT compilation fails.
    pub fn compile(&self) -> Result<CompiledFunction, BuilderError> {
        builder::compile(&self.generate_code()?)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alg = &self.0.algorithm;
        let inputs = self
            .0
            .input_names
            .iter()
            .zip(alg.input_sparsity())
            .map(|(n, sp)| format!("{}[{}]", n, sp.shape()))
            .join(",");
        let outputs = self
            .0
            .output_names
            .iter()
            .zip(alg.outputs())
            .map(|(n, (_, sp))| format!("{}[{}]", n, sp.shape()))
            .join(",");
        write!(f, "{}:({})->({})", self.0.name.bold(), inputs.cyan(), outputs.green())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.0.name)
            .field("inputs", &self.0.input_names)
            .field("outputs", &self.0.output_names)
            .field("nodes", &self.0.graph.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `f(x) = [x0 * sin(x1); exp(x0)]`
    fn sample() -> Function {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let parts = g.vertsplit(x, &[0, 1, 2]).unwrap();
        let s = g.sin(parts[1]).unwrap();
        let f0 = g.times(parts[0], s).unwrap();
        let f1 = g.exp(parts[0]).unwrap();
        let f = g.vertcat(&[f0, f1]).unwrap();
        Function::with_scheme("f", &g, &[("x", x)], &[("y", f)]).unwrap()
    }

    #[test]
    fn test_evaluate_and_contracts() {
        let f = sample();
        let out = f.evaluate(&[Matrix::column(&[0.5, 1.2])]).unwrap();
        assert_relative_eq!(out[0].get(0, 0), 0.5 * 1.2f64.sin(), epsilon = 1e-14);
        assert_relative_eq!(out[0].get(1, 0), 0.5f64.exp(), epsilon = 1e-14);
        assert!(matches!(
            f.evaluate(&[]),
            Err(GraphError::InvalidInputLength { expected: 1, got: 0 })
        ));
        assert!(matches!(
            f.evaluate(&[Matrix::column(&[0.5, 1.2, 3.0])]),
            Err(GraphError::DimensionError { .. })
        ));
        assert_eq!(f.index_in("x"), Some(0));
        assert_eq!(f.index_out("y"), Some(0));
        assert!(f.to_string().contains("x[2x1]"));
    }

    #[test]
    fn test_sparse_inputs_are_projected() {
        let mut g = Graph::new();
        let (pattern, _) = Sparsity::from_triplets(2, 2, &[0, 1], &[0, 1]).unwrap();
        let d = g.symbol("d", pattern);
        let two = g.scalar(2.0);
        let y = g.times(d, two).unwrap();
        let f = Function::new("f", &g, &[d], &[y]).unwrap();
        let full = Matrix::from_rows(&[vec![1.0, 5.0], vec![7.0, 3.0]]).unwrap();
        let out = f.evaluate(&[full]).unwrap();
        assert_eq!(out[0].nonzeros(), &[2.0, 6.0]);
        assert_eq!(out[0].get(0, 1), 0.0);
    }

    #[test]
    fn test_free_symbol_is_rejected() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let y = g.sym("y", 1, 1);
        let s = g.add(x, y).unwrap();
        assert!(matches!(
            Function::new("f", &g, &[x], &[s]),
            Err(GraphError::StructuralError(_))
        ));
    }

    #[test]
    fn test_forward_derivative_function() {
        let f = sample();
        let fwd = f.derivative_forward(1).unwrap();
        assert_eq!(fwd.input_names(), &["x".to_string(), "fwd0_x".to_string()]);
        let out = fwd
            .evaluate(&[Matrix::column(&[0.5, 1.2]), Matrix::column(&[1.0, 2.0])])
            .unwrap();
        assert_relative_eq!(out[1].get(0, 0), 1.2f64.sin() + 1.2f64.cos(), epsilon = 1e-12);
        assert_relative_eq!(out[1].get(1, 0), 0.5f64.exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_reverse_derivative_function() {
        let f = sample();
        let adj = f.derivative_reverse(1).unwrap();
        let out = adj
            .evaluate(&[Matrix::column(&[0.5, 1.2]), Matrix::column(&[1.0, 2.0])])
            .unwrap();
        assert_relative_eq!(out[1].get(0, 0), 1.2f64.sin() + 2.0 * 0.5f64.exp(), epsilon = 1e-12);
        assert_relative_eq!(out[1].get(1, 0), 0.5 * 1.2f64.cos(), epsilon = 1e-12);
    }

    #[test]
    fn test_derivatives_are_cached_weakly() {
        let f = sample();
        let a = f.derivative_forward(2).unwrap();
        let b = f.derivative_forward(2).unwrap();
        assert!(a.ptr_eq(&b));
        let j1 = f.jacobian(0, 0, true, false).unwrap();
        let j2 = f.jacobian(0, 0, true, false).unwrap();
        assert!(j1.ptr_eq(&j2));
        assert!(!j1.ptr_eq(&f.jacobian(0, 0, false, false).unwrap()));

        let weak = Arc::downgrade(&a.0);
        drop(a);
        drop(b);
        assert!(weak.upgrade().is_none());
        let c = f.derivative_forward(2).unwrap();
        assert_eq!(c.n_in(), 3);
    }

    #[test]
    fn test_jacobian_values() {
        let mut g = Graph::new();
        let x = g.sym("x", 3, 1);
        let p = g.vertsplit(x, &[0, 1, 2, 3]).unwrap();
        let f0 = g.times(p[0], p[1]).unwrap();
        let f1 = g.sin(p[2]).unwrap();
        let f2 = g.add(p[0], p[2]).unwrap();
        let f = g.vertcat(&[f0, f1, f2]).unwrap();
        let fun = Function::new("f", &g, &[x], &[f]).unwrap();
        let point = Matrix::column(&[2.0, 3.0, 0.5]);
        let expected = [[3.0, 2.0, 0.0], [0.0, 0.0, 0.5f64.cos()], [1.0, 0.0, 1.0]];
        for compact in [true, false] {
            let jac = fun.jacobian(0, 0, compact, false).unwrap();
            let out = jac.evaluate(&[point.clone()]).unwrap();
            assert_eq!(out[0].sparsity().nnz(), 6);
            for (r, row) in expected.iter().enumerate() {
                for (c, &v) in row.iter().enumerate() {
                    assert_relative_eq!(out[0].get(r, c), v, epsilon = 1e-12);
                }
            }
            assert_eq!(out[1].nonzeros(), fun.evaluate(&[point.clone()]).unwrap()[0].nonzeros());
        }
    }

    #[test]
    fn test_sparse_accumulator_gradient_and_jacobian() {
        let mut g = Graph::new();
        let z0 = g.symbol("z0", Sparsity::diag(2));
        let x = g.sym("X", 2, 2);
        let y = g.sym("Y", 2, 2);
        let m = g.mul_add(z0, x, y).unwrap();
        let total = g.sum_all(m).unwrap();
        let fun = Function::new("f", &g, &[z0, x, y], &[m, total]).unwrap();
        let values = [
            Matrix::identity(2),
            Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap(),
            Matrix::from_rows(&[vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap(),
        ];
        let grad = fun.gradient(1, 1).unwrap().evaluate(&values).unwrap();
        assert_eq!(grad[0].to_rows(), vec![vec![5.0, 7.0], vec![6.0, 8.0]]);
        assert_eq!(grad[2].get(0, 0), 71.0);

        let jac = fun.jacobian(1, 0, false, false).unwrap().evaluate(&values).unwrap();
        let expected = [[5.0, 0.0, 7.0, 0.0], [0.0; 4], [0.0; 4], [0.0, 6.0, 0.0, 8.0]];
        for (r, row) in expected.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                assert_eq!(jac[0].get(r, c), v, "({r}, {c})");
            }
        }
    }

    #[test]
    fn test_diagonal_jacobian_needs_one_sweep() {
        let mut g = Graph::new();
        let x = g.sym("x", 50, 1);
        let s = g.sin(x).unwrap();
        let fun = Function::new("f", &g, &[x], &[s]).unwrap();
        let sp = fun.jacobian_sparsity(0, 0, false).unwrap();
        assert_eq!(sp.nnz(), 50);
        assert_eq!(column_coloring(&sp).1, 1);
        let values: Vec<f64> = (0..50).map(|k| k as f64 * 0.1).collect();
        let jac = fun.jacobian(0, 0, false, false).unwrap();
        let out = jac.evaluate(&[Matrix::column(&values)]).unwrap();
        for (k, v) in values.iter().enumerate() {
            assert_relative_eq!(out[0].get(k, k), v.cos(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_wide_jacobian_uses_reverse_sweeps() {
        let mut g = Graph::new();
        let x = g.sym("x", 6, 1);
        let sq = g.sq(x).unwrap();
        let total = g.sum_all(sq).unwrap();
        let fun = Function::new("f", &g, &[x], &[total]).unwrap();
        let jac = fun.jacobian(0, 0, false, false).unwrap();
        let values = [1.0, -2.0, 0.5, 3.0, 0.0, 4.0];
        let out = jac.evaluate(&[Matrix::column(&values)]).unwrap();
        for (k, v) in values.iter().enumerate() {
            assert_relative_eq!(out[0].get(0, k), 2.0 * v, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_gradient_tangent_hessian() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let p = g.vertsplit(x, &[0, 1, 2]).unwrap();
        let x0_sq = g.sq(p[0]).unwrap();
        let term = g.times(x0_sq, p[1]).unwrap();
        let s = g.sin(p[1]).unwrap();
        let f = g.add(term, s).unwrap();
        let fun = Function::new("f", &g, &[x], &[f]).unwrap();
        let point = Matrix::column(&[1.5, 0.7]);

        let grad = fun.gradient(0, 0).unwrap().evaluate(&[point.clone()]).unwrap();
        assert_relative_eq!(grad[0].get(0, 0), 2.0 * 1.5 * 0.7, epsilon = 1e-12);
        assert_relative_eq!(grad[0].get(1, 0), 1.5 * 1.5 + 0.7f64.cos(), epsilon = 1e-12);

        let hess = fun.hessian(0, 0).unwrap();
        assert_eq!(hess.output_names()[0], "jac");
        let out = hess.evaluate(&[point]).unwrap();
        let h = out[0].to_rows();
        assert_relative_eq!(h[0][0], 1.4, epsilon = 1e-12);
        assert_relative_eq!(h[0][1], 3.0, epsilon = 1e-12);
        assert_relative_eq!(h[1][0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(h[1][1], -(0.7f64.sin()), epsilon = 1e-12);
        assert_relative_eq!(out[1].get(0, 0), 2.1, epsilon = 1e-12);

        assert!(matches!(fun.tangent(0, 0), Err(GraphError::StructuralError(_))));
        let mut g = Graph::new();
        let t = g.sym("t", 1, 1);
        let st = g.sin(t).unwrap();
        let tt = g.sq(t).unwrap();
        let curve = g.vertcat(&[st, tt]).unwrap();
        let fun = Function::new("curve", &g, &[t], &[curve]).unwrap();
        let out = fun.tangent(0, 0).unwrap().evaluate(&[Matrix::scalar(0.3)]).unwrap();
        assert_relative_eq!(out[0].get(0, 0), 0.3f64.cos(), epsilon = 1e-12);
        assert_relative_eq!(out[0].get(1, 0), 0.6, epsilon = 1e-12);
        assert!(matches!(fun.gradient(0, 0), Err(GraphError::StructuralError(_))));
    }

    #[test]
    fn test_full_jacobian() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let y = g.sym("y", 1, 1);
        let f1 = g.times(x, y).unwrap();
        let f2 = g.sq(y).unwrap();
        let fun = Function::new("f", &g, &[x, y], &[f1, f2]).unwrap();
        let full = fun.full_jacobian().unwrap();
        assert!(full.ptr_eq(&fun.full_jacobian().unwrap()));
        let out = full
            .evaluate(&[Matrix::column(&[2.0, 3.0]), Matrix::scalar(5.0)])
            .unwrap();
        let expected = [[5.0, 0.0, 2.0], [0.0, 5.0, 3.0], [0.0, 0.0, 10.0]];
        for (r, row) in expected.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                assert_relative_eq!(out[0].get(r, c), v, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_symmetric_sparsity() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let p = g.vertsplit(x, &[0, 1, 2]).unwrap();
        let f0 = g.times(p[0], p[1]).unwrap();
        let f = g.vertcat(&[f0, p[1]]).unwrap();
        let fun = Function::new("f", &g, &[x], &[f]).unwrap();
        assert_eq!(fun.jacobian_sparsity(0, 0, false).unwrap().nnz(), 3);
        assert_eq!(fun.jacobian_sparsity(0, 0, true).unwrap().nnz(), 4);
        assert!(matches!(
            fun.jacobian_sparsity(1, 0, false),
            Err(GraphError::IndexOutOfRange { what: "input", .. })
        ));
    }

    #[test]
    fn test_parallel_and_symbolic_calls() {
        let f = sample();
        let batch: Vec<Vec<Matrix>> = (0..200)
            .map(|k| vec![Matrix::column(&[k as f64 * 0.01, 1.0 - k as f64 * 0.003])])
            .collect();
        let parallel = f.eval_parallel(&batch).unwrap();
        assert_eq!(parallel.len(), 200);
        for (inputs, out) in batch.iter().zip(&parallel) {
            assert_eq!(out[0].nonzeros(), f.evaluate(inputs).unwrap()[0].nonzeros());
        }

        let mut g = Graph::new();
        let z = g.sym("z", 2, 1);
        let two = g.scalar(2.0);
        let arg = g.times(z, two).unwrap();
        let inlined = f.call_symbolic(&mut g, &[arg]).unwrap();
        let h = Function::new("h", &g, &[z], &inlined).unwrap();
        let direct = f.evaluate(&[Matrix::column(&[0.5, 1.2])]).unwrap();
        let via = h.evaluate(&[Matrix::column(&[0.25, 0.6])]).unwrap();
        assert_relative_eq!(direct[0].get(0, 0), via[0].get(0, 0), epsilon = 1e-14);
        assert!(matches!(
            f.call_symbolic(&mut g, &[two]),
            Err(GraphError::DimensionError { .. })
        ));
    }

    #[test]
    fn test_compiled_matches_evaluate() {
        let f = sample();
        let jac = f.jacobian(0, 0, false, false).unwrap();
        let compiled = jac.compile().unwrap();
        let point = [Matrix::column(&[0.5, 1.2])];
        let expected = jac.evaluate(&point).unwrap();
        let got = compiled.call(&point).unwrap();
        for (e, n) in expected.iter().zip(&got) {
            for (a, b) in e.nonzeros().iter().zip(n.nonzeros()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_function_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Function>();
        assert_send_sync::<CompiledFunction>();
    }
}
