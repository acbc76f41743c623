//! Libm functions imported by JIT-compiled code.
//!
//! Elementwise operations without a native Cranelift instruction are compiled to calls of
//! the `extern "C"` wrappers below. Each wrapper is registered with the JIT under its
//! symbol name and declared in the module with `Linkage::Import`.

use std::collections::HashMap;

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, FuncRef, InstBuilder, Value};
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;
use crate::ops::{BinaryOp, UnaryOp};

type UnaryFn = extern "C" fn(f64) -> f64;
type BinaryFn = extern "C" fn(f64, f64) -> f64;

macro_rules! unary_wrappers {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            extern "C" fn $name(x: f64) -> f64 {
                x.$method()
            }
        )*
    };
}

unary_wrappers! {
    exprgraph_exp => exp,
    exprgraph_log => ln,
    exprgraph_sin => sin,
    exprgraph_cos => cos,
    exprgraph_tan => tan,
    exprgraph_asin => asin,
    exprgraph_acos => acos,
    exprgraph_atan => atan,
    exprgraph_sinh => sinh,
    exprgraph_cosh => cosh,
    exprgraph_tanh => tanh,
}

extern "C" fn exprgraph_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn exprgraph_atan2(x: f64, y: f64) -> f64 {
    x.atan2(y)
}

/// Symbol and implementation of a unary operation that needs a call.
pub(crate) fn unary_symbol(op: UnaryOp) -> Option<(&'static str, UnaryFn)> {
    let entry: (&'static str, UnaryFn) = match op {
        UnaryOp::Exp => ("exprgraph_exp", exprgraph_exp),
        UnaryOp::Log => ("exprgraph_log", exprgraph_log),
        UnaryOp::Sin => ("exprgraph_sin", exprgraph_sin),
        UnaryOp::Cos => ("exprgraph_cos", exprgraph_cos),
        UnaryOp::Tan => ("exprgraph_tan", exprgraph_tan),
        UnaryOp::Asin => ("exprgraph_asin", exprgraph_asin),
        UnaryOp::Acos => ("exprgraph_acos", exprgraph_acos),
        UnaryOp::Atan => ("exprgraph_atan", exprgraph_atan),
        UnaryOp::Sinh => ("exprgraph_sinh", exprgraph_sinh),
        UnaryOp::Cosh => ("exprgraph_cosh", exprgraph_cosh),
        UnaryOp::Tanh => ("exprgraph_tanh", exprgraph_tanh),
        _ => return None,
    };
    Some(entry)
}

/// Symbol and implementation of a binary operation that needs a call.
pub(crate) fn binary_symbol(op: BinaryOp) -> Option<(&'static str, BinaryFn)> {
    match op {
        BinaryOp::Pow => Some(("exprgraph_pow", exprgraph_pow as BinaryFn)),
        BinaryOp::Atan2 => Some(("exprgraph_atan2", exprgraph_atan2 as BinaryFn)),
        _ => None,
    }
}

/// Makes every wrapper resolvable by the JIT linker.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    for op in UnaryOp::ALL {
        if let Some((name, f)) = unary_symbol(op) {
            builder.symbol(name, f as *const u8);
        }
    }
    for op in BinaryOp::ALL {
        if let Some((name, f)) = binary_symbol(op) {
            builder.symbol(name, f as *const u8);
        }
    }
}

/// Imported functions of one compiled routine, declared on first use.
#[derive(Default)]
pub(crate) struct Imports {
    refs: HashMap<&'static str, FuncRef>,
}

impl Imports {
    /// Declares `name(f64 x arity) -> f64` in the module and in the function being built.
    fn get(
        &mut self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        name: &'static str,
        arity: usize,
    ) -> Result<FuncRef, BuilderError> {
        if let Some(&func_ref) = self.refs.get(name) {
            return Ok(func_ref);
        }
        let mut sig = module.make_signature();
        sig.params.extend(std::iter::repeat(AbiParam::new(F64)).take(arity));
        sig.returns.push(AbiParam::new(F64));
        let func_id: FuncId = module
            .declare_function(name, Linkage::Import, &sig)
            .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;
        let func_ref = module.declare_func_in_func(func_id, builder.func);
        self.refs.insert(name, func_ref);
        Ok(func_ref)
    }

    /// Emits a call to an imported scalar function.
    pub(crate) fn call(
        &mut self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        name: &'static str,
        args: &[Value],
    ) -> Result<Value, BuilderError> {
        let func_ref = self.get(builder, module, name, args.len())?;
        let call = builder.ins().call(func_ref, args);
        Ok(builder.inst_results(call)[0])
    }
}
