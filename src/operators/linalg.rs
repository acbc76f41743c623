//! Dense linear solve exported to JIT-compiled code.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Value};
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;
use crate::matrix::dense_solve_f64;

const SYMBOL: &str = "exprgraph_dense_solve";

/// Overwrites the dense `n x m` block `b` with `A^-1 b` (or `A^-T b` if `tr != 0`).
///
/// # Safety
/// `a` must point to `n * n` and `b` to `n * m` valid, non-overlapping `f64` values.
pub unsafe extern "C" fn exprgraph_dense_solve(a: *mut f64, b: *mut f64, n: i64, m: i64, tr: i64) {
    let (n, m) = (n as usize, m as usize);
    // SAFETY: guaranteed by the caller; the generated code passes disjoint `w` regions.
    let (a, b) = unsafe {
        (
            std::slice::from_raw_parts_mut(a, n * n),
            std::slice::from_raw_parts_mut(b, n * m),
        )
    };
    dense_solve_f64(a, b, n, m, tr != 0);
}

pub(crate) fn register_symbol(builder: &mut JITBuilder) {
    builder.symbol(SYMBOL, exprgraph_dense_solve as *const u8);
}

/// Declares the solver in the module.
pub(crate) fn link_dense_solve(module: &mut dyn Module) -> Result<FuncId, BuilderError> {
    let ptr = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(ptr));
    sig.params.extend([AbiParam::new(types::I64); 3]);
    module
        .declare_function(SYMBOL, Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))
}

/// Emits `exprgraph_dense_solve(a, b, n, m, tr)`.
pub(crate) fn call_dense_solve(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    a: Value,
    b: Value,
    (n, m, transpose): (usize, usize, bool),
) {
    let func = module.declare_func_in_func(func_id, builder.func);
    let n = builder.ins().iconst(types::I64, n as i64);
    let m = builder.ins().iconst(types::I64, m as i64);
    let tr = builder.ins().iconst(types::I64, i64::from(transpose));
    builder.ins().call(func, &[a, b, n, m, tr]);
}
