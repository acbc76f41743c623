//! Error types for the exprgraph-jit crate.
//!
//! Three enums cover the failure modes of the crate:
//!
//! - `GraphError`: contract violations while building graphs, and failures during
//!   evaluation, derivative construction and structural decomposition
//! - `ConvertError`: failures while turning an expression string into graph nodes
//! - `BuilderError`: failures while JIT compiling generated code with Cranelift
//!
//! Construction errors are raised eagerly, before a node is linked into a graph.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

use crate::sparsity::Shape;

/// Errors raised by graph construction, evaluation and analysis.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Shape or arity mismatch between the operands of an operation
    #[error("dimension mismatch in {operation}: {lhs} vs {rhs}")]
    DimensionError {
        operation: String,
        lhs: Shape,
        rhs: Shape,
    },
    /// A structural contract of an operation is violated (e.g. inverse of a non-square matrix)
    #[error("structural error: {0}")]
    StructuralError(String),
    /// An assertion node evaluated with a condition different from 1
    #[error("assertion failed: {0}")]
    AssertionFailure(String),
    /// A block of a decomposed system cannot be solved explicitly
    #[error("cannot find an explicit expression for block {block} (variables: {variables})")]
    UnsolvableBlockError { block: usize, variables: String },
    /// The number of supplied values does not match the number of slots
    #[error("invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
    /// An index does not address an existing element
    #[error("index {index} out of range for {what} of length {len}")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },
}

impl GraphError {
    pub(crate) fn dimension(operation: &str, lhs: Shape, rhs: Shape) -> Self {
        GraphError::DimensionError {
            operation: operation.to_string(),
            lhs,
            rhs,
        }
    }

    pub(crate) fn structural(message: impl Into<String>) -> Self {
        GraphError::StructuralError(message.into())
    }
}

/// Errors that can occur while converting an evalexpr expression into graph nodes.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The expression string could not be parsed by evalexpr
    #[error("Failed to build Evalexpr AST")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when encountering an operator that is not supported
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when an identifier has no symbol attached
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    /// The graph rejected one of the generated nodes
    #[error("Failed to build graph node")]
    Graph(#[from] GraphError),
}

/// Errors that can occur during JIT compilation of generated code.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when configuring Cranelift settings
    #[error("settings error: {0}")]
    SettingsError(String),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or an imported symbol
    #[error("declaration error: {0}")]
    DeclarationError(String),
    /// The generated program addresses more work memory than a 32 bit offset can reach
    #[error("work array of {0} entries is too large for the JIT backend")]
    WorkTooLarge(usize),
    /// The program could not be generated from the graph
    #[error("Failed to generate code")]
    Graph(#[from] GraphError),
}
