//! Bytecode to Cranelift IR translation.
//!
//! The program stack pointer and the operand stack index live in two stack
//! slots; operand stack entries live in host memory pointed to by the
//! context. Every instruction gets its own block, so branch operands map
//! directly onto blocks. Indirect transfers pass `(target, from_pc)` to one of
//! three dispatch blocks, each a [`Switch`] over the targets the interpreter
//! would accept, falling back to the fault block.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{Block, FuncRef, InstBuilder, MemFlags, StackSlot, Type, Value, types};
use cranelift_codegen::ir::{StackSlotData, StackSlotKind};
use cranelift_frontend::{FunctionBuilder, Switch};
use qvm_bytecode::layout::{RETURN_SENTINEL, half_mask, word_mask};
use qvm_bytecode::{Fault, OPSTACK_SIZE, Opcode, Program};

use crate::JitError;
use crate::compiler::TranslateOptions;
use crate::context::{
    CTX_DATA_BASE_OFFSET, CTX_FAULT_OFFSET, CTX_FAULT_PC_OFFSET, CTX_OPSTACK_OFFSET,
    CTX_OPSTACK_TOP_OFFSET, CTX_PROGRAM_STACK_OFFSET,
};
use crate::runtime_helpers::{HelperKind, HelperRefs};

fn unsupported(pc: usize, opcode: Opcode) -> JitError {
    JitError::UnsupportedInstruction { pc, opcode }
}

/// Memory flags for sandbox and operand stack accesses. Addresses are always
/// masked into the segment, so no access can trap.
fn mem_flags() -> MemFlags {
    let mut flags = MemFlags::new();
    flags.set_notrap();
    flags
}

/// Values and blocks shared by all instruction blocks.
#[derive(Clone, Copy)]
struct Frame {
    ctx: Value,
    data_base: Value,
    opstack: Value,
    ps: StackSlot,
    top: StackSlot,
    pointer_type: Type,
    data_mask: u32,
    fault: Block,
    bail: Block,
    exit: Block,
    fell_off: Block,
    call_dispatch: Block,
    return_dispatch: Block,
    jump_dispatch: Block,
}

impl Frame {
    fn load_ps(&self, builder: &mut FunctionBuilder<'_>) -> Value {
        builder.ins().stack_load(types::I32, self.ps, 0)
    }

    fn store_ps(&self, builder: &mut FunctionBuilder<'_>, value: Value) {
        builder.ins().stack_store(value, self.ps, 0);
    }

    fn widen(&self, builder: &mut FunctionBuilder<'_>, value: Value) -> Value {
        if self.pointer_type == types::I32 {
            value
        } else {
            builder.ins().uextend(self.pointer_type, value)
        }
    }

    fn opstack_slot(&self, builder: &mut FunctionBuilder<'_>, index: Value) -> Value {
        let wide = self.widen(builder, index);
        let offset = builder.ins().ishl_imm(wide, 2);
        builder.ins().iadd(self.opstack, offset)
    }

    fn push(&self, builder: &mut FunctionBuilder<'_>, value: Value) {
        let top = builder.ins().stack_load(types::I32, self.top, 0);
        let next = builder.ins().iadd_imm(top, 1);
        let next = builder.ins().band_imm(next, (OPSTACK_SIZE - 1) as i64);
        builder.ins().stack_store(next, self.top, 0);
        let addr = self.opstack_slot(builder, next);
        builder.ins().store(mem_flags(), value, addr, 0);
    }

    fn pop(&self, builder: &mut FunctionBuilder<'_>) -> Value {
        let top = builder.ins().stack_load(types::I32, self.top, 0);
        let addr = self.opstack_slot(builder, top);
        let value = builder.ins().load(types::I32, mem_flags(), addr, 0);
        let prev = builder.ins().iadd_imm(top, -1);
        let prev = builder.ins().band_imm(prev, (OPSTACK_SIZE - 1) as i64);
        builder.ins().stack_store(prev, self.top, 0);
        value
    }

    /// Host address of `addr & mask` inside the segment.
    fn data_addr(&self, builder: &mut FunctionBuilder<'_>, addr: Value, mask: u32) -> Value {
        let masked = builder.ins().band_imm(addr, mask as i64);
        let wide = self.widen(builder, masked);
        builder.ins().iadd(self.data_base, wide)
    }

    fn load_word(&self, builder: &mut FunctionBuilder<'_>, addr: Value) -> Value {
        let host = self.data_addr(builder, addr, word_mask(self.data_mask));
        builder.ins().load(types::I32, mem_flags(), host, 0)
    }

    fn store_word(&self, builder: &mut FunctionBuilder<'_>, addr: Value, value: Value) {
        let host = self.data_addr(builder, addr, word_mask(self.data_mask));
        builder.ins().store(mem_flags(), value, host, 0);
    }

    /// Branch to the fault block when `cond` holds; continue in a fresh block.
    fn fault_if(&self, builder: &mut FunctionBuilder<'_>, cond: Value, fault: Fault, pc: usize) {
        let code = builder.ins().iconst(types::I32, fault.code() as i64);
        let at = builder.ins().iconst(types::I32, pc as i64);
        let cont = builder.create_block();
        builder.ins().brif(
            cond,
            self.fault,
            &[BlockArg::Value(code), BlockArg::Value(at)],
            cont,
            &[],
        );
        builder.switch_to_block(cont);
    }

    /// Leave through the bail block when a helper flagged a fault.
    fn bail_on_fault(&self, builder: &mut FunctionBuilder<'_>) {
        let fault = builder
            .ins()
            .load(types::I32, mem_flags(), self.ctx, CTX_FAULT_OFFSET);
        let cont = builder.create_block();
        builder.ins().brif(fault, self.bail, &[], cont, &[]);
        builder.switch_to_block(cont);
    }

    fn dispatch(&self, builder: &mut FunctionBuilder<'_>, block: Block, target: Value, pc: usize) {
        let from = builder.ins().iconst(types::I32, pc as i64);
        builder
            .ins()
            .jump(block, &[BlockArg::Value(target), BlockArg::Value(from)]);
    }
}

/// Block taking two `i32` params: `(target or fault code, instruction index)`.
fn target_block(builder: &mut FunctionBuilder<'_>) -> Block {
    let block = builder.create_block();
    builder.append_block_param(block, types::I32);
    builder.append_block_param(block, types::I32);
    block
}

/// Normal exit, parameterized by the index of the final `LEAVE`.
fn exit_block(builder: &mut FunctionBuilder<'_>) -> Block {
    let block = builder.create_block();
    builder.append_block_param(block, types::I32);
    block
}

fn call_helper(builder: &mut FunctionBuilder<'_>, func: FuncRef, args: &[Value]) -> Value {
    let call = builder.ins().call(func, args);
    builder.inst_results(call)[0]
}

fn as_float(builder: &mut FunctionBuilder<'_>, value: Value) -> Value {
    builder.ins().bitcast(types::F32, MemFlags::new(), value)
}

fn as_bits(builder: &mut FunctionBuilder<'_>, value: Value) -> Value {
    builder.ins().bitcast(types::I32, MemFlags::new(), value)
}

fn int_condition(opcode: Opcode) -> Option<IntCC> {
    Some(match opcode {
        Opcode::Eq => IntCC::Equal,
        Opcode::Ne => IntCC::NotEqual,
        Opcode::Lti => IntCC::SignedLessThan,
        Opcode::Lei => IntCC::SignedLessThanOrEqual,
        Opcode::Gti => IntCC::SignedGreaterThan,
        Opcode::Gei => IntCC::SignedGreaterThanOrEqual,
        Opcode::Ltu => IntCC::UnsignedLessThan,
        Opcode::Leu => IntCC::UnsignedLessThanOrEqual,
        Opcode::Gtu => IntCC::UnsignedGreaterThan,
        Opcode::Geu => IntCC::UnsignedGreaterThanOrEqual,
        _ => return None,
    })
}

fn float_condition(opcode: Opcode) -> Option<FloatCC> {
    Some(match opcode {
        Opcode::Eqf => FloatCC::Equal,
        Opcode::Nef => FloatCC::NotEqual,
        Opcode::Ltf => FloatCC::LessThan,
        Opcode::Lef => FloatCC::LessThanOrEqual,
        Opcode::Gtf => FloatCC::GreaterThan,
        Opcode::Gef => FloatCC::GreaterThanOrEqual,
        _ => return None,
    })
}

/// Fast eligibility check: every opcode must be one the translator lowers.
pub fn can_translate(program: &Program) -> bool {
    program
        .instructions()
        .iter()
        .all(|i| !matches!(i.opcode, Opcode::Undef | Opcode::Break))
}

/// Translate a whole program into Cranelift IR.
pub(crate) fn translate_program(
    builder: &mut FunctionBuilder<'_>,
    program: &Program,
    options: &TranslateOptions,
    helpers: &HelperRefs,
    pointer_type: Type,
) -> Result<(), JitError> {
    let instructions = program.instructions();
    let count = instructions.len();

    let ps = builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4, 2));
    let top =
        builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, 4, 2));

    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(builder.create_block());
    }

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);

    let fault = target_block(builder);
    let call_dispatch = target_block(builder);
    let return_dispatch = target_block(builder);
    let jump_dispatch = target_block(builder);

    builder.switch_to_block(entry);
    let ctx = builder.block_params(entry)[0];
    let data_base = builder
        .ins()
        .load(pointer_type, mem_flags(), ctx, CTX_DATA_BASE_OFFSET);
    let opstack = builder
        .ins()
        .load(pointer_type, mem_flags(), ctx, CTX_OPSTACK_OFFSET);
    let initial_ps = builder
        .ins()
        .load(types::I32, mem_flags(), ctx, CTX_PROGRAM_STACK_OFFSET);
    builder.ins().stack_store(initial_ps, ps, 0);
    let initial_top = builder
        .ins()
        .load(types::I32, mem_flags(), ctx, CTX_OPSTACK_TOP_OFFSET);
    builder.ins().stack_store(initial_top, top, 0);
    builder.ins().jump(blocks[0], &[]);

    let frame = Frame {
        ctx,
        data_base,
        opstack,
        ps,
        top,
        pointer_type,
        data_mask: options.data_mask,
        fault,
        bail: builder.create_block(),
        exit: exit_block(builder),
        fell_off: builder.create_block(),
        call_dispatch,
        return_dispatch,
        jump_dispatch,
    };
    let next_block = |pc: usize| {
        if pc + 1 < count {
            blocks[pc + 1]
        } else {
            frame.fell_off
        }
    };

    for (pc, instruction) in instructions.iter().enumerate() {
        builder.switch_to_block(blocks[pc]);
        let operand = instruction.operand;

        match instruction.opcode {
            Opcode::Undef | Opcode::Break => return Err(unsupported(pc, instruction.opcode)),
            Opcode::Ignore => {}
            Opcode::Enter => {
                let sp = frame.load_ps(builder);
                let sp = builder.ins().iadd_imm(sp, -(operand as i64));
                frame.store_ps(builder, sp);
                let overflow =
                    builder
                        .ins()
                        .icmp_imm(IntCC::SignedLessThan, sp, options.stack_bottom as i64);
                frame.fault_if(builder, overflow, Fault::StackOverflow, pc);
                if options.profile {
                    let func = helpers.require(HelperKind::Profile, pc, instruction.opcode)?;
                    let at = builder.ins().iconst(types::I32, pc as i64);
                    call_helper(builder, func, &[ctx, at]);
                }
            }
            Opcode::Leave => {
                let sp = frame.load_ps(builder);
                let sp = builder.ins().iadd_imm(sp, operand as i64);
                frame.store_ps(builder, sp);
                let ret = frame.load_word(builder, sp);
                let done = builder
                    .ins()
                    .icmp_imm(IntCC::Equal, ret, RETURN_SENTINEL as i64);
                let from = builder.ins().iconst(types::I32, pc as i64);
                builder.ins().brif(
                    done,
                    frame.exit,
                    &[BlockArg::Value(from)],
                    frame.return_dispatch,
                    &[BlockArg::Value(ret), BlockArg::Value(from)],
                );
                continue;
            }
            Opcode::Call => {
                let target = frame.pop(builder);
                let sp = frame.load_ps(builder);
                let ret = builder.ins().iconst(types::I32, (pc + 1) as i64);
                frame.store_word(builder, sp, ret);
                let is_syscall = builder.ins().icmp_imm(IntCC::SignedLessThan, target, 0);
                let syscall = builder.create_block();
                let from = builder.ins().iconst(types::I32, pc as i64);
                builder.ins().brif(
                    is_syscall,
                    syscall,
                    &[],
                    frame.call_dispatch,
                    &[BlockArg::Value(target), BlockArg::Value(from)],
                );

                builder.switch_to_block(syscall);
                let func = helpers.require(HelperKind::Syscall, pc, instruction.opcode)?;
                let number = builder.ins().bnot(target);
                let arg_slot = builder.ins().iadd_imm(sp, 4);
                frame.store_word(builder, arg_slot, number);
                let result = call_helper(builder, func, &[ctx, sp]);
                frame.bail_on_fault(builder);
                frame.push(builder, result);
            }
            Opcode::Push => {
                let zero = builder.ins().iconst(types::I32, 0);
                frame.push(builder, zero);
            }
            Opcode::Pop => {
                frame.pop(builder);
            }
            Opcode::Const => {
                let value = builder.ins().iconst(types::I32, operand as i64);
                frame.push(builder, value);
            }
            Opcode::Local => {
                let sp = frame.load_ps(builder);
                let addr = builder.ins().iadd_imm(sp, operand as i64);
                frame.push(builder, addr);
            }
            Opcode::Jump => {
                let target = frame.pop(builder);
                frame.dispatch(builder, frame.jump_dispatch, target, pc);
                continue;
            }
            Opcode::Eq
            | Opcode::Ne
            | Opcode::Lti
            | Opcode::Lei
            | Opcode::Gti
            | Opcode::Gei
            | Opcode::Ltu
            | Opcode::Leu
            | Opcode::Gtu
            | Opcode::Geu
            | Opcode::Eqf
            | Opcode::Nef
            | Opcode::Ltf
            | Opcode::Lef
            | Opcode::Gtf
            | Opcode::Gef => {
                let rhs = frame.pop(builder);
                let lhs = frame.pop(builder);
                let taken = if let Some(cc) = int_condition(instruction.opcode) {
                    builder.ins().icmp(cc, lhs, rhs)
                } else {
                    let Some(cc) = float_condition(instruction.opcode) else {
                        return Err(unsupported(pc, instruction.opcode));
                    };
                    let lhs = as_float(builder, lhs);
                    let rhs = as_float(builder, rhs);
                    builder.ins().fcmp(cc, lhs, rhs)
                };
                builder
                    .ins()
                    .brif(taken, blocks[operand as usize], &[], next_block(pc), &[]);
                continue;
            }
            Opcode::Load1 | Opcode::Load2 | Opcode::Load4 => {
                let addr = frame.pop(builder);
                let value = match instruction.opcode {
                    Opcode::Load1 => {
                        let host = frame.data_addr(builder, addr, options.data_mask);
                        builder.ins().uload8(types::I32, mem_flags(), host, 0)
                    }
                    Opcode::Load2 => {
                        let host = frame.data_addr(builder, addr, half_mask(options.data_mask));
                        builder.ins().uload16(types::I32, mem_flags(), host, 0)
                    }
                    _ => frame.load_word(builder, addr),
                };
                frame.push(builder, value);
            }
            Opcode::Store1 | Opcode::Store2 | Opcode::Store4 => {
                let value = frame.pop(builder);
                let addr = frame.pop(builder);
                match instruction.opcode {
                    Opcode::Store1 => {
                        let host = frame.data_addr(builder, addr, options.data_mask);
                        builder.ins().istore8(mem_flags(), value, host, 0);
                    }
                    Opcode::Store2 => {
                        let host = frame.data_addr(builder, addr, half_mask(options.data_mask));
                        builder.ins().istore16(mem_flags(), value, host, 0);
                    }
                    _ => frame.store_word(builder, addr, value),
                }
            }
            Opcode::Arg => {
                let value = frame.pop(builder);
                let sp = frame.load_ps(builder);
                let addr = builder.ins().iadd_imm(sp, operand as i64);
                frame.store_word(builder, addr, value);
            }
            Opcode::BlockCopy => {
                let func = helpers.require(HelperKind::BlockCopy, pc, instruction.opcode)?;
                let src = frame.pop(builder);
                let dest = frame.pop(builder);
                let len = builder.ins().iconst(types::I32, operand as i64);
                let code = call_helper(builder, func, &[ctx, dest, src, len]);
                let at = builder.ins().iconst(types::I32, pc as i64);
                let cont = builder.create_block();
                builder.ins().brif(
                    code,
                    frame.fault,
                    &[BlockArg::Value(code), BlockArg::Value(at)],
                    cont,
                    &[],
                );
                builder.switch_to_block(cont);
            }
            Opcode::Sex8 | Opcode::Sex16 | Opcode::Negi | Opcode::Bcom => {
                let value = frame.pop(builder);
                let out = match instruction.opcode {
                    Opcode::Sex8 => {
                        let narrow = builder.ins().ireduce(types::I8, value);
                        builder.ins().sextend(types::I32, narrow)
                    }
                    Opcode::Sex16 => {
                        let narrow = builder.ins().ireduce(types::I16, value);
                        builder.ins().sextend(types::I32, narrow)
                    }
                    Opcode::Negi => builder.ins().ineg(value),
                    _ => builder.ins().bnot(value),
                };
                frame.push(builder, out);
            }
            Opcode::Divi | Opcode::Modi | Opcode::Divu | Opcode::Modu => {
                let rhs = frame.pop(builder);
                let lhs = frame.pop(builder);
                let is_zero = builder.ins().icmp_imm(IntCC::Equal, rhs, 0);
                frame.fault_if(builder, is_zero, Fault::DivideByZero, pc);
                let out = match instruction.opcode {
                    Opcode::Divu => builder.ins().udiv(lhs, rhs),
                    Opcode::Modu => builder.ins().urem(lhs, rhs),
                    signed => {
                        // i32::MIN / -1 traps in hardware; -1 is handled by select.
                        let is_neg_one = builder.ins().icmp_imm(IntCC::Equal, rhs, -1);
                        let one = builder.ins().iconst(types::I32, 1);
                        let safe_rhs = builder.ins().select(is_neg_one, one, rhs);
                        if signed == Opcode::Divi {
                            let quotient = builder.ins().sdiv(lhs, safe_rhs);
                            let negated = builder.ins().ineg(lhs);
                            builder.ins().select(is_neg_one, negated, quotient)
                        } else {
                            let remainder = builder.ins().srem(lhs, safe_rhs);
                            let zero = builder.ins().iconst(types::I32, 0);
                            builder.ins().select(is_neg_one, zero, remainder)
                        }
                    }
                };
                frame.push(builder, out);
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Muli
            | Opcode::Mulu
            | Opcode::Band
            | Opcode::Bor
            | Opcode::Bxor
            | Opcode::Lsh
            | Opcode::Rshi
            | Opcode::Rshu => {
                let rhs = frame.pop(builder);
                let lhs = frame.pop(builder);
                let out = match instruction.opcode {
                    Opcode::Add => builder.ins().iadd(lhs, rhs),
                    Opcode::Sub => builder.ins().isub(lhs, rhs),
                    Opcode::Muli | Opcode::Mulu => builder.ins().imul(lhs, rhs),
                    Opcode::Band => builder.ins().band(lhs, rhs),
                    Opcode::Bor => builder.ins().bor(lhs, rhs),
                    Opcode::Bxor => builder.ins().bxor(lhs, rhs),
                    Opcode::Lsh => builder.ins().ishl(lhs, rhs),
                    Opcode::Rshi => builder.ins().sshr(lhs, rhs),
                    _ => builder.ins().ushr(lhs, rhs),
                };
                frame.push(builder, out);
            }
            Opcode::Negf => {
                let value = frame.pop(builder);
                let value = as_float(builder, value);
                let out = builder.ins().fneg(value);
                let out = as_bits(builder, out);
                frame.push(builder, out);
            }
            Opcode::Addf | Opcode::Subf | Opcode::Divf | Opcode::Mulf => {
                let rhs = frame.pop(builder);
                let lhs = frame.pop(builder);
                let rhs = as_float(builder, rhs);
                let lhs = as_float(builder, lhs);
                let out = match instruction.opcode {
                    Opcode::Addf => builder.ins().fadd(lhs, rhs),
                    Opcode::Subf => builder.ins().fsub(lhs, rhs),
                    Opcode::Divf => builder.ins().fdiv(lhs, rhs),
                    _ => builder.ins().fmul(lhs, rhs),
                };
                let out = as_bits(builder, out);
                frame.push(builder, out);
            }
            Opcode::Cvif => {
                let value = frame.pop(builder);
                let out = builder.ins().fcvt_from_sint(types::F32, value);
                let out = as_bits(builder, out);
                frame.push(builder, out);
            }
            Opcode::Cvfi => {
                let value = frame.pop(builder);
                let value = as_float(builder, value);
                let out = builder.ins().fcvt_to_sint_sat(types::I32, value);
                frame.push(builder, out);
            }
        }

        builder.ins().jump(next_block(pc), &[]);
    }

    // Indirect transfer dispatch.
    for (block, targets, fault_kind) in [
        (
            call_dispatch,
            program.procedure_entries().collect::<Vec<_>>(),
            Fault::BadCallTarget,
        ),
        (
            return_dispatch,
            program.return_sites().collect(),
            Fault::BadReturnAddress,
        ),
        (
            jump_dispatch,
            program.jump_targets().collect(),
            Fault::BadJumpTarget,
        ),
    ] {
        builder.switch_to_block(block);
        let target = builder.block_params(block)[0];
        let from = builder.block_params(block)[1];
        let rejected = builder.create_block();
        let mut switch = Switch::new();
        for index in targets {
            switch.set_entry(index as u128, blocks[index]);
        }
        switch.emit(builder, target, rejected);

        builder.switch_to_block(rejected);
        let code = builder.ins().iconst(types::I32, fault_kind.code() as i64);
        builder
            .ins()
            .jump(fault, &[BlockArg::Value(code), BlockArg::Value(from)]);
    }

    builder.switch_to_block(frame.fell_off);
    let code = builder.ins().iconst(types::I32, Fault::FellOffEnd.code() as i64);
    let at = builder.ins().iconst(types::I32, count as i64);
    builder
        .ins()
        .jump(fault, &[BlockArg::Value(code), BlockArg::Value(at)]);

    builder.switch_to_block(fault);
    let code = builder.block_params(fault)[0];
    let at = builder.block_params(fault)[1];
    builder
        .ins()
        .store(mem_flags(), code, ctx, CTX_FAULT_OFFSET);
    builder
        .ins()
        .store(mem_flags(), at, ctx, CTX_FAULT_PC_OFFSET);
    let zero = builder.ins().iconst(types::I32, 0);
    builder.ins().return_(&[zero]);

    builder.switch_to_block(frame.bail);
    let zero = builder.ins().iconst(types::I32, 0);
    builder.ins().return_(&[zero]);

    builder.switch_to_block(frame.exit);
    let from = builder.block_params(frame.exit)[0];
    builder
        .ins()
        .store(mem_flags(), from, ctx, CTX_FAULT_PC_OFFSET);
    let sp = frame.load_ps(builder);
    builder
        .ins()
        .store(mem_flags(), sp, ctx, CTX_PROGRAM_STACK_OFFSET);
    let top_index = builder.ins().stack_load(types::I32, top, 0);
    builder
        .ins()
        .store(mem_flags(), top_index, ctx, CTX_OPSTACK_TOP_OFFSET);
    let addr = frame.opstack_slot(builder, top_index);
    let result = builder.ins().load(types::I32, mem_flags(), addr, 0);
    builder.ins().return_(&[result]);

    builder.seal_all_blocks();
    Ok(())
}
