//! Executable memory for compiled blocks
//!
//! Wraps a Cranelift `JITModule`. The configured size is a budget on the
//! bytes of host code emitted; once it is used up the owner flushes its
//! blocks and calls `reset`, which frees the module's memory in one go.

use cranelift_codegen::ir::{AbiParam, Type, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Module};

use super::thunks::Runtime;
use crate::error::{PsxError, Result};
use crate::psx::cpu::registers::Registers;

/// Entry point of a compiled block
pub type BlockFn = unsafe extern "C" fn(*mut Registers, *mut Runtime);

fn codegen_error(stage: &str, e: impl std::fmt::Display) -> PsxError {
    PsxError::CodeGen(format!("{}: {}", stage, e))
}

fn new_module() -> Result<JITModule> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", "speed")
        .map_err(|e| codegen_error("opt_level", e))?;
    let flags = settings::Flags::new(flag_builder);

    let isa_builder = cranelift_native::builder().map_err(|e| codegen_error("host ISA", e))?;
    let isa = isa_builder
        .finish(flags)
        .map_err(|e| codegen_error("host ISA", e))?;
    Ok(JITModule::new(JITBuilder::with_isa(
        isa,
        default_libcall_names(),
    )))
}

pub struct CodeBuffer {
    module: Option<JITModule>,
    context: Context,
    builder_context: FunctionBuilderContext,
    capacity: usize,
    used: usize,
    functions: usize,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        let module = new_module()?;
        let context = module.make_context();
        Ok(CodeBuffer {
            module: Some(module),
            context,
            builder_context: FunctionBuilderContext::new(),
            capacity,
            used: 0,
            functions: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of host code emitted since the last reset
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn function_count(&self) -> usize {
        self.functions
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.capacity
    }

    /// Compile one block. `emit` receives the builder positioned in the
    /// entry block along with the pointer type and the `regs` and `runtime`
    /// parameters, and must terminate every block it creates.
    pub fn compile<F>(&mut self, emit: F) -> Result<BlockFn>
    where
        F: FnOnce(&mut FunctionBuilder<'_>, Type, Value, Value),
    {
        let module = self
            .module
            .as_mut()
            .ok_or_else(|| PsxError::CodeGen("code buffer has no module".to_string()))?;
        let pointer_type = module.target_config().pointer_type();

        self.context.clear();
        self.context.func.signature.params.clear();
        self.context.func.signature.returns.clear();
        self.context.func.signature.call_conv = module.isa().default_call_conv();
        self.context
            .func
            .signature
            .params
            .push(AbiParam::new(pointer_type));
        self.context
            .func
            .signature
            .params
            .push(AbiParam::new(pointer_type));

        {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.builder_context);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            let regs = builder.block_params(entry)[0];
            let runtime = builder.block_params(entry)[1];
            emit(&mut builder, pointer_type, regs, runtime);
            builder.seal_all_blocks();
            builder.finalize();
        }

        let func_id = module
            .declare_anonymous_function(&self.context.func.signature)
            .map_err(|e| codegen_error("declare_function", e))?;
        let defined = module.define_function(func_id, &mut self.context);
        if let Err(e) = defined {
            module.clear_context(&mut self.context);
            return Err(codegen_error("define_function", e));
        }
        let size = self
            .context
            .compiled_code()
            .map(|code| code.code_buffer().len())
            .unwrap_or(0);
        module.clear_context(&mut self.context);
        module
            .finalize_definitions()
            .map_err(|e| codegen_error("finalize_definitions", e))?;

        let entry = module.get_finalized_function(func_id);
        self.used += size;
        self.functions += 1;

        // SAFETY: the function was declared with exactly this signature:
        // two pointer parameters and no return value
        Ok(unsafe { std::mem::transmute::<*const u8, BlockFn>(entry) })
    }

    /// Free every compiled function. All `BlockFn`s handed out before are
    /// dangling afterwards, the owner drops them first.
    pub fn reset(&mut self) -> Result<()> {
        let module = new_module()?;
        self.context = module.make_context();
        if let Some(old) = self.module.replace(module) {
            // SAFETY: callers flush every block referring to this module's
            // code before resetting, and no block is running
            unsafe { old.free_memory() };
        }
        self.used = 0;
        self.functions = 0;
        Ok(())
    }
}
