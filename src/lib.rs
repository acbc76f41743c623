//! Sparse matrix expression graphs with derivatives, sparsity analysis and JIT compilation.
//!
//! Expressions are built in a [`Graph`], an arena of nodes whose values are matrices
//! with a structural sparsity pattern. On top of the graph the crate provides:
//!
//! - Numeric, symbolic and bit-pattern evaluation through one generic evaluator
//! - Forward and reverse derivatives, Jacobians, gradients and Hessians
//! - Jacobian sparsity detection by bit propagation, plain or hierarchical
//! - Dulmage-Mendelsohn decomposition and explicit solving of equation blocks
//! - C source generation and native compilation with [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! - Parsing of [evalexpr](https://github.com/ISibboI/evalexpr) expression strings
//!
//! # Example
//!
//! ```rust
//! use exprgraph_jit::prelude::*;
//!
//! let mut g = Graph::new();
//! let (f, symbols) = parse_with_symbols(&mut g, "2*x + y^2").unwrap();
//! let inputs: Vec<Mx> = symbols.iter().map(|(_, s)| *s).collect();
//! let fun = Function::new("f", &g, &inputs, &[f]).unwrap();
//!
//! // Evaluate at point (x=1, y=2)
//! let args = [Matrix::scalar(1.0), Matrix::scalar(2.0)];
//! assert_eq!(fun.evaluate(&args).unwrap()[0].get(0, 0), 6.0);
//!
//! // Gradient with respect to y
//! let grad = fun.gradient(1, 0).unwrap();
//! assert_eq!(grad.evaluate(&args).unwrap()[0].get(0, 0), 4.0);
//! ```

pub use function::{Function, FunctionOptions};
pub use graph::{Graph, GraphOptions};

pub mod prelude {
    pub use crate::backends::matrix::{from_matrix, to_matrix, DenseMatrix};
    pub use crate::backends::vector::{from_column, to_column, Vector};
    pub use crate::builder::{compile, CompiledFunction};
    pub use crate::codegen::GeneratedCode;
    pub use crate::convert::{parse_expression, parse_with_symbols};
    pub use crate::errors::{BuilderError, ConvertError, GraphError};
    pub use crate::function::{Function, FunctionOptions};
    pub use crate::graph::{Graph, GraphOptions};
    pub use crate::matrix::Matrix;
    pub use crate::node::Mx;
    pub use crate::propagate::SparsityMode;
    pub use crate::sparsity::{Shape, Sparsity};
}

/// Dense container interop
pub mod backends {
    pub mod matrix;
    pub mod vector;
}
/// Native compilation of generated code with Cranelift
pub mod builder;
/// Lowering of evaluation plans to flat scalar programs
pub mod codegen;
/// Conversion from evalexpr expression strings to graph nodes
pub mod convert;
/// Dulmage-Mendelsohn decomposition
pub mod decompose;
/// Forward and reverse derivative sweeps
pub mod derivative;
/// Error types for the various failure modes
pub mod errors;
/// Generic evaluation over semirings
pub mod eval;
/// Block sorting and explicit solving of equation systems
pub mod explicit;
/// Functions and their derivatives
pub mod function;
/// The node arena
pub mod graph;
/// Sparsity-tagged matrices and element kernels
pub mod matrix;
/// Node and operation kinds
pub mod node;
/// Elementwise operation table
pub mod ops;
/// Jacobian sparsity propagation
pub mod propagate;
/// Sparsity patterns
pub mod sparsity;
/// Native calling convention
pub mod types;
/// Symbols linked into JIT-compiled code
pub(crate) mod operators {
    pub(crate) mod linalg;
    pub(crate) mod math;
}
