//! Native compilation of generated code with Cranelift.
//!
//! [`compile`] translates a [`GeneratedCode`] program into a single native routine
//! with the signature `fn(arg: *const *const f64, res: *const *mut f64, w: *mut f64) -> i64`,
//! the same calling convention as the C rendering. Every instruction becomes a handful of
//! loads, one arithmetic instruction or libm call, and a store into `w`.

use std::fmt;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;

use crate::codegen::{GeneratedCode, Instruction};
use crate::errors::{BuilderError, GraphError};
use crate::matrix::Matrix;
use crate::operators::{linalg, math};
use crate::ops::{BinaryOp, UnaryOp};
use crate::types::RawProgram;

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

/// A generated program compiled to native code.
///
/// Cloning is cheap; clones share the machine code.
#[derive(Clone)]
pub struct CompiledFunction {
    code: Arc<GeneratedCode>,
    func: Arc<ThreadSafeFunction>,
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// # Errors
/// Returns a BuilderError if the host machine architecture is not supported or a
/// flag cannot be set.
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );
    let pic = if is_x86 { "true" } else { "false" };
    set_flag(&mut flag_builder, "use_colocated_libcalls", pic)?;
    // cranelift-jit asserts is_pic=false on every host.
    set_flag(&mut flag_builder, "is_pic", "false")?;
    set_flag(&mut flag_builder, "opt_level", "speed")?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

fn set_flag(builder: &mut settings::Builder, name: &str, value: &str) -> Result<(), BuilderError> {
    builder
        .set(name, value)
        .map_err(|e| BuilderError::SettingsError(format!("{name}={value}: {e}")))
}

/// Creates a JIT module with the imported math symbols and a context whose signature
/// is `(arg, res, w) -> i64`.
pub(crate) fn create_module_and_context(isa: Arc<dyn TargetIsa>) -> (JITModule, Context) {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    math::register_symbols(&mut builder);
    linalg::register_symbol(&mut builder);

    let module = JITModule::new(builder);
    let mut ctx = module.make_context();

    let ptr = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(ptr));
    sig.returns.push(AbiParam::new(types::I64));
    ctx.func.signature = sig;

    (module, ctx)
}

/// Byte offset of entry `index` of an `f64` or pointer array.
fn offset(index: usize) -> Result<i32, BuilderError> {
    index
        .checked_mul(8)
        .and_then(|bytes| i32::try_from(bytes).ok())
        .ok_or(BuilderError::WorkTooLarge(index))
}

struct Emitter<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    module: &'a mut JITModule,
    imports: math::Imports,
    dense_solve: Option<cranelift_module::FuncId>,
    ptr: types::Type,
    arg: Value,
    res: Value,
    w: Value,
}

impl Emitter<'_, '_> {
    fn load(&mut self, index: usize) -> Result<Value, BuilderError> {
        let flags = MemFlags::trusted();
        Ok(self.builder.ins().load(types::F64, flags, self.w, offset(index)?))
    }

    fn store(&mut self, index: usize, value: Value) -> Result<(), BuilderError> {
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, self.w, offset(index)?);
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, x: Value) -> Result<Value, BuilderError> {
        let ins = self.builder.ins();
        let value = match op {
            UnaryOp::Neg => ins.fneg(x),
            UnaryOp::Sqrt => ins.sqrt(x),
            UnaryOp::Sq => ins.fmul(x, x),
            UnaryOp::Abs => ins.fabs(x),
            UnaryOp::Floor => ins.floor(x),
            UnaryOp::Ceil => ins.ceil(x),
            UnaryOp::Inv => {
                let one = ins.f64const(1.0);
                self.builder.ins().fdiv(one, x)
            }
            UnaryOp::Sign => {
                let zero = ins.f64const(0.0);
                let one = self.builder.ins().f64const(1.0);
                let minus_one = self.builder.ins().f64const(-1.0);
                let positive = self.builder.ins().fcmp(FloatCC::GreaterThan, x, zero);
                let negative = self.builder.ins().fcmp(FloatCC::LessThan, x, zero);
                let lower = self.builder.ins().select(negative, minus_one, zero);
                self.builder.ins().select(positive, one, lower)
            }
            op => {
                let (name, _) = math::unary_symbol(op)
                    .ok_or_else(|| BuilderError::FunctionError(format!("no native form for {op}")))?;
                return self.imports.call(self.builder, self.module, name, &[x]);
            }
        };
        Ok(value)
    }

    fn binary(&mut self, op: BinaryOp, x: Value, y: Value) -> Result<Value, BuilderError> {
        let ins = self.builder.ins();
        let value = match op {
            BinaryOp::Add => ins.fadd(x, y),
            BinaryOp::Sub => ins.fsub(x, y),
            BinaryOp::Mul => ins.fmul(x, y),
            BinaryOp::Div => ins.fdiv(x, y),
            BinaryOp::Fmax => ins.fmax(x, y),
            BinaryOp::Eq => {
                let equal = ins.fcmp(FloatCC::Equal, x, y);
                let one = self.builder.ins().f64const(1.0);
                let zero = self.builder.ins().f64const(0.0);
                self.builder.ins().select(equal, one, zero)
            }
            op => {
                let (name, _) = math::binary_symbol(op)
                    .ok_or_else(|| BuilderError::FunctionError(format!("no native form for {op}")))?;
                return self.imports.call(self.builder, self.module, name, &[x, y]);
            }
        };
        Ok(value)
    }

    fn instruction(&mut self, instruction: &Instruction) -> Result<(), BuilderError> {
        match *instruction {
            Instruction::Const { dst, value } => {
                let v = self.builder.ins().f64const(value);
                self.store(dst, v)?;
            }
            Instruction::Input { dst, arg, nz } => {
                let p = self
                    .builder
                    .ins()
                    .load(self.ptr, MemFlags::trusted(), self.arg, offset(arg)?);
                let v = self.builder.ins().load(types::F64, MemFlags::trusted(), p, offset(nz)?);
                self.store(dst, v)?;
            }
            Instruction::Output { res, nz, src } => {
                let v = self.load(src)?;
                let p = self
                    .builder
                    .ins()
                    .load(self.ptr, MemFlags::trusted(), self.res, offset(res)?);
                self.builder.ins().store(MemFlags::trusted(), v, p, offset(nz)?);
            }
            Instruction::Copy { dst, src } => {
                let v = self.load(src)?;
                self.store(dst, v)?;
            }
            Instruction::Unary { op, dst, x } => {
                let x = self.load(x)?;
                let v = self.unary(op, x)?;
                self.store(dst, v)?;
            }
            Instruction::Binary { op, dst, x, y } => {
                let x = self.load(x)?;
                let y = self.load(y)?;
                let v = self.binary(op, x, y)?;
                self.store(dst, v)?;
            }
            Instruction::MulAcc { dst, x, y } => {
                let acc = self.load(dst)?;
                let x = self.load(x)?;
                let y = self.load(y)?;
                let product = self.builder.ins().fmul(x, y);
                let v = self.builder.ins().fadd(acc, product);
                self.store(dst, v)?;
            }
            Instruction::DenseSolve { a, b, n, m, transpose } => {
                let func_id = match self.dense_solve {
                    Some(id) => id,
                    None => {
                        let id = linalg::link_dense_solve(self.module)?;
                        self.dense_solve = Some(id);
                        id
                    }
                };
                let a = self.builder.ins().iadd_imm(self.w, i64::from(offset(a)?));
                let b = self.builder.ins().iadd_imm(self.w, i64::from(offset(b)?));
                linalg::call_dense_solve(self.builder, self.module, func_id, a, b, (n, m, transpose));
            }
            Instruction::Assert { cond, id } => {
                let c = self.load(cond)?;
                let one = self.builder.ins().f64const(1.0);
                let failed = self.builder.ins().fcmp(FloatCC::NotEqual, c, one);
                let fail_block = self.builder.create_block();
                let next_block = self.builder.create_block();
                self.builder.ins().brif(failed, fail_block, &[], next_block, &[]);

                self.builder.switch_to_block(fail_block);
                let status = self.builder.ins().iconst(types::I64, id as i64 + 1);
                self.builder.ins().return_(&[status]);

                self.builder.switch_to_block(next_block);
            }
        }
        Ok(())
    }
}

/// Builds the routine body from the program.
fn build_function_body(
    ctx: &mut Context,
    code: &GeneratedCode,
    module: &mut JITModule,
) -> Result<(), BuilderError> {
    let ptr = module.target_config().pointer_type();
    let mut builder_ctx = FunctionBuilderContext::new();
    let mut func_builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);

    let entry_block = func_builder.create_block();
    func_builder.append_block_params_for_function_params(entry_block);
    func_builder.switch_to_block(entry_block);
    let params = func_builder.block_params(entry_block).to_vec();

    {
        let mut emitter = Emitter {
            builder: &mut func_builder,
            module,
            imports: math::Imports::default(),
            dense_solve: None,
            ptr,
            arg: params[0],
            res: params[1],
            w: params[2],
        };
        for instruction in code.instructions() {
            emitter.instruction(instruction)?;
        }
    }
    let ok = func_builder.ins().iconst(types::I64, 0);
    func_builder.ins().return_(&[ok]);

    func_builder.seal_all_blocks();
    func_builder.finalize();
    Ok(())
}

/// Declares, defines and finalizes the routine.
fn compile_and_finalize(module: &mut JITModule, ctx: &mut Context) -> Result<*const u8, BuilderError> {
    let func_id = module
        .declare_function("exprgraph_routine", Linkage::Local, &ctx.func.signature)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    module
        .define_function(func_id, ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;

    module.clear_context(ctx);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    Ok(module.get_finalized_function(func_id))
}

/// Compiles a generated program to native code.
///
/// # Arguments
/// * `code` - Program produced by [`GeneratedCode::generate`]
///
/// # Returns
/// A thread-safe handle running the program natively.
///
/// # Errors
/// Returns a BuilderError if the host is not supported, the work array is too large
/// to address, or Cranelift rejects the routine.
pub fn compile(code: &GeneratedCode) -> Result<CompiledFunction, BuilderError> {
    offset(code.n_w())?;
    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa);
    build_function_body(&mut ctx, code, &mut module)?;
    let raw_fn = compile_and_finalize(&mut module, &mut ctx)?;
    // The module owns the executable memory and never releases it on drop, so the
    // pointer stays valid for the lifetime of the process.
    drop(module);

    Ok(CompiledFunction {
        code: Arc::new(code.clone()),
        func: Arc::new(ThreadSafeFunction(raw_fn)),
    })
}

impl CompiledFunction {
    /// Program this function was compiled from.
    pub fn code(&self) -> &GeneratedCode {
        &self.code
    }

    fn raw(&self) -> RawProgram {
        // SAFETY: the routine was compiled with exactly this signature.
        unsafe { std::mem::transmute::<*const u8, RawProgram>(self.func.0) }
    }

    /// Runs the native routine on raw nonzero buffers.
    ///
    /// Same contract as [`GeneratedCode::execute`]: absent inputs read as zero and
    /// absent outputs are not written.
    ///
    /// # Errors
    /// `InvalidInputLength` for mismatched buffers, `AssertionFailure` with the
    /// recorded message if an assertion fails.
    pub fn call_raw(&self, arg: &[Option<&[f64]>], res: &mut [Option<&mut [f64]>], w: &mut [f64]) -> Result<(), GraphError> {
        let code = &self.code;
        let expect = |expected: usize, got: usize| {
            if expected == got {
                Ok(())
            } else {
                Err(GraphError::InvalidInputLength { expected, got })
            }
        };
        expect(code.input_sparsity().len(), arg.len())?;
        expect(code.output_sparsity().len(), res.len())?;
        if w.len() < code.n_w() {
            return Err(GraphError::InvalidInputLength {
                expected: code.n_w(),
                got: w.len(),
            });
        }

        let zeros: Vec<Vec<f64>> = code
            .input_sparsity()
            .iter()
            .zip(arg)
            .map(|(sp, a)| if a.is_some() { Vec::new() } else { vec![0.0; sp.nnz()] })
            .collect();
        let mut sinks: Vec<Vec<f64>> = code
            .output_sparsity()
            .iter()
            .zip(res.iter())
            .map(|(sp, r)| if r.is_some() { Vec::new() } else { vec![0.0; sp.nnz()] })
            .collect();

        let mut arg_ptrs = Vec::with_capacity(arg.len());
        for ((sp, a), zero) in code.input_sparsity().iter().zip(arg).zip(&zeros) {
            let a = match a {
                Some(a) => *a,
                None => zero.as_slice(),
            };
            expect(sp.nnz(), a.len())?;
            arg_ptrs.push(a.as_ptr());
        }
        let mut res_ptrs = Vec::with_capacity(res.len());
        for ((sp, r), sink) in code.output_sparsity().iter().zip(res.iter_mut()).zip(sinks.iter_mut()) {
            let r = match r {
                Some(r) => &mut **r,
                None => sink.as_mut_slice(),
            };
            expect(sp.nnz(), r.len())?;
            res_ptrs.push(r.as_mut_ptr());
        }

        let status = (self.raw())(arg_ptrs.as_ptr(), res_ptrs.as_ptr(), w.as_mut_ptr());
        code.status(status)
    }

    /// Runs the native routine on matrices.
    ///
    /// Inputs are projected onto the expected patterns.
    ///
    /// # Errors
    /// `InvalidInputLength` for a wrong number of inputs, `DimensionError` for a wrong
    /// shape, `AssertionFailure` if an assertion fails.
    pub fn call(&self, inputs: &[Matrix]) -> Result<Vec<Matrix>, GraphError> {
        let sparsity = self.code.input_sparsity();
        if inputs.len() != sparsity.len() {
            return Err(GraphError::InvalidInputLength {
                expected: sparsity.len(),
                got: inputs.len(),
            });
        }
        let inputs = inputs
            .iter()
            .zip(sparsity)
            .map(|(m, sp)| m.project(sp))
            .collect::<Result<Vec<_>, _>>()?;
        let mut outputs: Vec<Vec<f64>> = self
            .code
            .output_sparsity()
            .iter()
            .map(|sp| vec![0.0; sp.nnz()])
            .collect();
        let mut w = vec![0.0; self.code.n_w()];
        {
            let arg: Vec<Option<&[f64]>> = inputs.iter().map(|m| Some(m.nonzeros())).collect();
            let mut res: Vec<Option<&mut [f64]>> = outputs.iter_mut().map(|r| Some(r.as_mut_slice())).collect();
            self.call_raw(&arg, &mut res, &mut w)?;
        }
        outputs
            .into_iter()
            .zip(self.code.output_sparsity())
            .map(|(nz, sp)| Matrix::new(sp.clone(), nz))
            .collect()
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("instructions", &self.code.instructions().len())
            .field("n_w", &self.code.n_w())
            .finish()
    }
}

/// Returns the Cranelift IR of a program, for inspection.
///
/// # Errors
/// Returns a BuilderError if the IR cannot be built.
pub fn get_clif_ir(code: &GeneratedCode) -> Result<String, BuilderError> {
    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa);
    build_function_body(&mut ctx, code, &mut module)?;
    Ok(ctx.func.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Algorithm;
    use crate::graph::Graph;
    use crate::sparsity::Sparsity;
    use approx::assert_relative_eq;

    fn program(g: &Graph, inputs: &[crate::node::Mx], outputs: &[crate::node::Mx]) -> GeneratedCode {
        GeneratedCode::generate(&Algorithm::new(g, inputs, outputs).unwrap()).unwrap()
    }

    #[test]
    fn test_native_matches_interpreter() {
        let mut g = Graph::new();
        let x = g.sym("x", 3, 1);
        let y = g.sym("y", 1, 1);
        let mut terms = Vec::new();
        for op in UnaryOp::ALL {
            let u = g.unary(op, x).unwrap();
            terms.push(g.sum_all(u).unwrap());
        }
        for op in BinaryOp::ALL {
            let b = g.binary(op, x, y).unwrap();
            terms.push(g.sum_all(b).unwrap());
        }
        let a = g.sym("a", 3, 3);
        let s = g.solve(a, x, true).unwrap();
        let n = g.norm_2(s).unwrap();
        terms.push(n);
        let n = g.norm_inf(s).unwrap();
        terms.push(n);
        let out = g.vertcat(&terms).unwrap();

        let code = program(&g, &[x, y, a], &[out]);
        let compiled = compile(&code).unwrap();
        let values = [
            Matrix::column(&[0.2, -0.4, 0.7]),
            Matrix::scalar(1.3),
            Matrix::from_rows(&[vec![3.0, 0.5, 0.0], vec![0.1, 2.0, 0.3], vec![0.0, 0.4, 1.5]]).unwrap(),
        ];
        let expected = code.interpret(&values).unwrap();
        let got = compiled.call(&values).unwrap();
        for (e, n) in expected[0].nonzeros().iter().zip(got[0].nonzeros()) {
            if e.is_nan() {
                assert!(n.is_nan());
            } else {
                assert_relative_eq!(*e, *n, epsilon = 1e-12, max_relative = 1e-12);
            }
        }
    }

    #[test]
    fn test_native_assertion() {
        let mut g = Graph::new();
        let x = g.sym("x", 2, 1);
        let c = g.sym("c", 1, 1);
        let checked = g.assertion(x, c, "c must be one").unwrap();
        let compiled = compile(&program(&g, &[x, c], &[checked])).unwrap();
        let out = compiled.call(&[Matrix::column(&[1.0, 2.0]), Matrix::scalar(1.0)]).unwrap();
        assert_eq!(out[0].nonzeros(), &[1.0, 2.0]);
        assert_eq!(
            compiled.call(&[Matrix::column(&[1.0, 2.0]), Matrix::scalar(0.0)]).unwrap_err(),
            GraphError::AssertionFailure("c must be one".to_string())
        );
    }

    #[test]
    fn test_absent_buffers_and_sparse_inputs() {
        let mut g = Graph::new();
        let (pattern, _) = Sparsity::from_triplets(2, 2, &[0, 1], &[0, 1]).unwrap();
        let d = g.symbol("d", pattern);
        let y = g.sym("y", 2, 2);
        let m = g.mul(d, y).unwrap();
        let compiled = compile(&program(&g, &[d, y], &[m, d])).unwrap();
        let mut out = vec![0.0; 4];
        let mut w = vec![0.0; compiled.code().n_w()];
        compiled
            .call_raw(
                &[Some(&[2.0, 3.0][..]), None],
                &mut [Some(&mut out[..]), None],
                &mut w,
            )
            .unwrap();
        assert_eq!(out, vec![0.0; 4]);
        assert!(matches!(
            compiled.call_raw(&[Some(&[2.0][..]), None], &mut [None, None], &mut w),
            Err(GraphError::InvalidInputLength { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_clif_ir() {
        let mut g = Graph::new();
        let x = g.sym("x", 1, 1);
        let e = g.exp(x).unwrap();
        let ir = get_clif_ir(&program(&g, &[x], &[e])).unwrap();
        assert!(ir.contains("call"));
    }
}
