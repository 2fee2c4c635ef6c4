//! Whole-program JIT compiler wrapper around Cranelift.

use cranelift_codegen::ir::{AbiParam, UserFuncName, types};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError, default_libcall_names};
use qvm_bytecode::{Opcode, Program};

use crate::context::JitContext;
use crate::runtime_helpers::{HelperFuncIds, HelperRefs, RuntimeHelpers};
use crate::translator;

/// Errors produced by the JIT compiler.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// The host ISA is not supported by Cranelift.
    #[error("unsupported host target: {0}")]
    UnsupportedTarget(String),

    /// Failed to create the JIT builder.
    #[error("jit builder initialization failed: {0}")]
    Builder(String),

    /// Bytecode instruction the translator does not lower.
    #[error("unsupported instruction at pc {pc}: {opcode}")]
    UnsupportedInstruction {
        /// Instruction index
        pc: usize,
        /// Offending opcode
        opcode: Opcode,
    },
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}

/// Per-instance facts baked into the generated code.
#[derive(Debug, Clone, Copy)]
pub struct TranslateOptions {
    /// Segment size minus one
    pub data_mask: u32,
    /// Lowest legal program stack value
    pub stack_bottom: i32,
    /// Call the profile helper on every procedure entry
    pub profile: bool,
}

/// Cranelift-backed compiler for one program.
///
/// Each program gets its own `JITModule`, so its code memory can be released
/// together with the module instance.
pub struct JitCompiler {
    module: JITModule,
    function_builder_ctx: FunctionBuilderContext,
    context: cranelift_codegen::Context,
    helper_func_ids: HelperFuncIds,
}

impl JitCompiler {
    /// Create a compiler with runtime helper support.
    pub fn new(helpers: &RuntimeHelpers) -> Result<Self, JitError> {
        cranelift_native::builder().map_err(|e| JitError::UnsupportedTarget(e.to_string()))?;
        let mut builder = JITBuilder::new(default_libcall_names())
            .map_err(|e| JitError::Builder(e.to_string()))?;
        helpers.register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let helper_func_ids = HelperFuncIds::declare(helpers, &mut module)?;
        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            helper_func_ids,
        })
    }

    /// Compile a program into native code.
    pub fn compile(
        mut self,
        name: &str,
        program: &Program,
        options: &TranslateOptions,
    ) -> Result<CompiledProgram, JitError> {
        match self.define(name, program, options) {
            Ok(func_id) => {
                let entry = self.module.get_finalized_function(func_id);
                Ok(CompiledProgram {
                    module: Some(self.module),
                    entry,
                    instruction_count: program.len(),
                })
            }
            Err(err) => {
                // SAFETY: nothing from this module has been handed out.
                unsafe { self.module.free_memory() };
                Err(err)
            }
        }
    }

    fn define(
        &mut self,
        name: &str,
        program: &Program,
        options: &TranslateOptions,
    ) -> Result<FuncId, JitError> {
        let pointer_type = self.module.target_config().pointer_type();
        let mut signature = self.module.make_signature();
        signature.params.push(AbiParam::new(pointer_type)); // ctx pointer
        signature.returns.push(AbiParam::new(types::I32));

        let symbol = format!("qvm_{}", name.replace(|c: char| !c.is_ascii_alphanumeric(), "_"));
        let func_id = self
            .module
            .declare_function(&symbol, Linkage::Local, &signature)?;

        self.context.func = cranelift_codegen::ir::Function::with_name_signature(
            UserFuncName::user(0, func_id.as_u32()),
            signature,
        );

        let helper_refs =
            HelperRefs::declare(&self.helper_func_ids, &mut self.module, &mut self.context.func);

        {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            translator::translate_program(
                &mut builder,
                program,
                options,
                &helper_refs,
                pointer_type,
            )?;
            builder.finalize();
        }

        self.module.define_function(func_id, &mut self.context)?;
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions()?;
        Ok(func_id)
    }
}

/// Native code for one program.
pub struct CompiledProgram {
    module: Option<JITModule>,
    entry: *const u8,
    instruction_count: usize,
}

impl CompiledProgram {
    /// Entry pointer of the compiled function.
    pub fn code_ptr(&self) -> *const u8 {
        self.entry
    }

    /// Number of bytecode instructions compiled.
    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    /// Run the program from instruction 0.
    ///
    /// Returns the top of the operand stack on a normal exit. On a fault the
    /// return value is meaningless and `ctx.fault` is nonzero.
    ///
    /// # Safety
    ///
    /// `ctx` must point to a live context whose `data_base` addresses
    /// `data_mask + 1` writable bytes matching the options the program was
    /// compiled with, whose `opstack` addresses
    /// [`qvm_bytecode::OPSTACK_SIZE`] entries, and whose `host` is what the
    /// registered helpers expect.
    pub unsafe fn invoke(&self, ctx: *mut JitContext) -> i32 {
        let func: extern "C" fn(*mut JitContext) -> i32 = unsafe {
            // SAFETY: the entry was compiled with signature `(*mut JitContext) -> i32`.
            std::mem::transmute(self.entry)
        };
        func(ctx)
    }
}

impl Drop for CompiledProgram {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: the only pointer into this module is `entry`, which
            // dies with `self`.
            unsafe { module.free_memory() };
        }
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("entry", &self.entry)
            .field("instruction_count", &self.instruction_count)
            .finish()
    }
}
